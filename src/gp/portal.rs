//! Portal negotiation
//!
//! prelogin -> (direct credentials | SAML via the SSO engine) -> cookie
//! exchange -> portal config. The negotiator tracks its own state so a
//! caller can see where an attempt stopped.

use crate::credentials::Credentials;
use crate::error::{DenyReason, ErrorKind, GpError};
use crate::gp::http::{GpHttp, GpResponse, normalize_server, remove_url_scheme};
use crate::session::{SessionCookie, TokenKind, portal_identity};
use crate::sso::SsoEngine;
use crate::sso::listener::AssertionPayload;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use reqwest::StatusCode;
use serde::Deserialize;
use serde::de::IgnoredAny;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const PRELOGIN_PATH: &str = "/global-protect/prelogin.esp";
const GETCONFIG_PATH: &str = "/global-protect/getconfig.esp";
const ACS_PATH: &str = "/SAML20/SP/ACS";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortalState {
    Init,
    Prelogin,
    AuthDirect,
    AuthSamlPending,
    CookieObtained,
    ConfigFetched,
    Done,
    Failed(ErrorKind),
}

/// What the portal asked for at prelogin
#[derive(Debug)]
pub enum PortalChallenge {
    Direct(DirectChallenge),
    SamlRedirect(SamlChallenge),
}

impl PortalChallenge {
    pub fn is_direct(&self) -> bool {
        matches!(self, PortalChallenge::Direct(_))
    }
}

#[derive(Debug, Clone)]
pub struct DirectChallenge {
    pub username_label: String,
    pub password_label: String,
    pub region: Option<String>,
}

/// How the identity provider wants to be reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdpRequest {
    /// Browser navigates straight to the IdP
    Redirect(url::Url),
    /// Browser loads an auto-submitting form posting to the IdP
    PostForm(String),
}

/// SAML challenge from prelogin. Not `Clone`: it is handed to exactly one
/// SSO completion.
#[derive(Debug)]
pub struct SamlChallenge {
    idp_request: IdpRequest,
    request_token: String,
    relay_state: Option<String>,
    expires_at: Option<Instant>,
    region: Option<String>,
}

impl SamlChallenge {
    pub fn new(idp_request: IdpRequest, request_token: impl Into<String>) -> Self {
        Self {
            idp_request,
            request_token: request_token.into(),
            relay_state: None,
            expires_at: None,
            region: None,
        }
    }

    pub fn with_relay_state(mut self, relay_state: impl Into<String>) -> Self {
        self.relay_state = Some(relay_state.into());
        self
    }

    pub fn with_validity(mut self, validity: Duration) -> Self {
        self.expires_at = Some(Instant::now() + validity);
        self
    }

    pub fn idp_request(&self) -> &IdpRequest {
        &self.idp_request
    }

    /// Raw request artifact as sent by the portal
    pub fn request_token(&self) -> &str {
        &self.request_token
    }

    pub fn relay_state(&self) -> Option<&str> {
        self.relay_state.as_deref()
    }

    pub fn region(&self) -> Option<&str> {
        self.region.as_deref()
    }

    /// Time left before the portal stops honouring the request
    pub fn remaining_validity(&self) -> Option<Duration> {
        self.expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayDescriptor {
    pub name: String,
    pub host: String,
    pub priority: u32,
}

/// Portal configuration relevant to connecting
#[derive(Debug, Clone)]
pub struct PortalConfig {
    pub gateways: Vec<GatewayDescriptor>,
    pub user_auth_cookie: Option<String>,
    pub prelogon_user_auth_cookie: Option<String>,
    /// Portal collects host information, so gateways will want a HIP report
    pub hip_collection: bool,
}

impl PortalConfig {
    /// Lowest priority value wins; ties keep list order
    pub fn select_gateway(&self) -> Option<&GatewayDescriptor> {
        self.gateways
            .iter()
            .enumerate()
            .min_by_key(|(index, gateway)| (gateway.priority, *index))
            .map(|(_, gateway)| gateway)
    }
}

// XML deserialization structures for prelogin
#[derive(Debug, Deserialize)]
#[serde(rename = "prelogin-response")]
struct PreloginXml {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    msg: Option<String>,
    #[serde(rename = "username-label", default)]
    username_label: Option<String>,
    #[serde(rename = "password-label", default)]
    password_label: Option<String>,
    #[serde(rename = "saml-auth-method", default)]
    saml_auth_method: Option<String>,
    #[serde(rename = "saml-request", default)]
    saml_request: Option<String>,
    #[serde(rename = "saml-relay-state", default)]
    saml_relay_state: Option<String>,
    #[serde(rename = "saml-request-timeout", default)]
    saml_request_timeout: Option<String>,
    #[serde(default)]
    region: Option<String>,
}

// XML deserialization structures for portal getconfig
#[derive(Debug, Deserialize)]
#[serde(rename = "policy")]
struct PolicyXml {
    #[serde(default)]
    gateways: Option<GatewaysXml>,
    #[serde(rename = "portal-userauthcookie", default)]
    portal_userauthcookie: Option<String>,
    #[serde(rename = "portal-prelogonuserauthcookie", default)]
    portal_prelogonuserauthcookie: Option<String>,
    #[serde(rename = "hip-collection", default)]
    hip_collection: Option<IgnoredAny>,
}

#[derive(Debug, Deserialize)]
struct GatewaysXml {
    #[serde(default)]
    external: Option<GatewayListXml>,
}

#[derive(Debug, Deserialize)]
struct GatewayListXml {
    #[serde(default)]
    list: Option<GatewayEntriesXml>,
}

#[derive(Debug, Deserialize)]
struct GatewayEntriesXml {
    #[serde(rename = "entry", default)]
    entries: Vec<GatewayEntryXml>,
}

#[derive(Debug, Deserialize)]
struct GatewayEntryXml {
    #[serde(rename = "@name")]
    name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    priority: Option<String>,
    #[serde(rename = "priority-rule", default)]
    priority_rule: Option<PriorityRulesXml>,
}

#[derive(Debug, Deserialize)]
struct PriorityRulesXml {
    #[serde(rename = "entry", default)]
    entries: Vec<PriorityRuleXml>,
}

#[derive(Debug, Deserialize)]
struct PriorityRuleXml {
    #[serde(rename = "@name", default)]
    name: String,
    #[serde(default)]
    priority: Option<String>,
}

pub struct PortalNegotiator {
    http: Arc<GpHttp>,
    base_url: String,
    identity: String,
    state: PortalState,
}

impl PortalNegotiator {
    pub fn new(http: Arc<GpHttp>, portal: &str) -> Result<Self, GpError> {
        let base_url = normalize_server(portal)?;
        Ok(Self {
            http,
            identity: portal_identity(&base_url),
            base_url,
            state: PortalState::Init,
        })
    }

    pub fn state(&self) -> PortalState {
        self.state
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Key under which this portal's session is stored
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Ask the portal which authentication it wants
    pub async fn prelogin(&mut self) -> Result<PortalChallenge, GpError> {
        self.state = PortalState::Prelogin;
        info!("Sending prelogin request to {}", self.base_url);

        let mut form = vec![
            ("tmp", "tmp".to_string()),
            ("default-browser", "1".to_string()),
            ("cas-support", "yes".to_string()),
            ("ipv6-support", "yes".to_string()),
        ];
        form.extend(self.http.params().to_params());

        let url = format!("{}{}", self.base_url, PRELOGIN_PATH);
        let result = match self.http.post_form(&url, &form).await {
            Ok(response) => classify_prelogin(&response),
            Err(e) => Err(e),
        };

        let next = match &result {
            Ok(PortalChallenge::Direct(_)) => PortalState::AuthDirect,
            Ok(PortalChallenge::SamlRedirect(_)) => PortalState::AuthSamlPending,
            Err(_) => self.state,
        };
        self.track(result, next)
    }

    /// Exchange username and password for a portal cookie
    pub async fn complete_direct(&mut self, credentials: &Credentials) -> Result<SessionCookie, GpError> {
        info!("Authenticating to portal as {}", credentials.username);

        let mut form = vec![
            ("user", credentials.username.clone()),
            ("passwd", credentials.password.clone()),
            ("portal", remove_url_scheme(&self.base_url).to_string()),
            ("prot", "https:".to_string()),
            ("jnlpReady", "jnlpReady".to_string()),
            ("ok", "Login".to_string()),
            ("direct", "yes".to_string()),
            ("server", remove_url_scheme(&self.base_url).to_string()),
        ];
        form.extend(self.http.params().to_params());

        let url = format!("{}{}", self.base_url, GETCONFIG_PATH);
        let result = match self.http.post_form(&url, &form).await {
            Ok(response) => {
                classify_direct(&response).map(|token| {
                    SessionCookie::new(
                        &self.identity,
                        &credentials.username,
                        &token,
                        TokenKind::PortalUserAuthCookie,
                    )
                })
            }
            Err(e) => Err(e),
        };
        self.track(result, PortalState::CookieObtained)
    }

    /// Run the SSO flow for `challenge` and exchange the resulting assertion
    pub async fn complete_saml(
        &mut self,
        challenge: SamlChallenge,
        sso: &SsoEngine,
        cancel: &CancellationToken,
    ) -> Result<SessionCookie, GpError> {
        self.state = PortalState::AuthSamlPending;
        let payload = match sso.complete(challenge, cancel).await {
            Ok(payload) => payload,
            Err(e) => return self.track(Err(e), self.state),
        };
        self.exchange_assertion(payload).await
    }

    /// POST the assertion to the portal's consumer endpoint
    pub async fn exchange_assertion(&mut self, payload: AssertionPayload) -> Result<SessionCookie, GpError> {
        info!("Exchanging SAML assertion with {}", self.base_url);

        let relay_state = payload.relay_state().unwrap_or_default().to_string();
        let form = vec![
            ("SAMLResponse", payload.encoded()),
            ("RelayState", relay_state),
        ];
        drop(payload);

        let url = format!("{}{}", self.base_url, ACS_PATH);
        let result = match self.http.post_form(&url, &form).await {
            Ok(response) => classify_acs(&response).map(|acs| {
                SessionCookie::new(&self.identity, &acs.username, &acs.token, acs.kind)
            }),
            Err(e) => Err(e),
        };
        self.track(result, PortalState::CookieObtained)
    }

    /// Fetch the portal configuration with a session cookie
    pub async fn fetch_config(&mut self, cookie: &SessionCookie) -> Result<PortalConfig, GpError> {
        info!("Retrieving portal config for {}", cookie.username);

        let mut form = vec![
            ("user", cookie.username.clone()),
            (cookie.kind.param_name(), cookie.token.clone()),
            ("portal", remove_url_scheme(&self.base_url).to_string()),
            ("prot", "https:".to_string()),
            ("jnlpReady", "jnlpReady".to_string()),
            ("ok", "Login".to_string()),
            ("direct", "yes".to_string()),
            ("server", remove_url_scheme(&self.base_url).to_string()),
        ];
        form.extend(self.http.params().to_params());

        let url = format!("{}{}", self.base_url, GETCONFIG_PATH);
        let result = match self.http.post_form(&url, &form).await {
            Ok(response) => classify_config(&response),
            Err(e) => Err(e),
        };
        self.track(result, PortalState::ConfigFetched)
    }

    /// Mark negotiation finished once the caller has what it needs
    pub fn finish(&mut self) {
        if self.state == PortalState::ConfigFetched {
            self.state = PortalState::Done;
        }
    }

    fn track<T>(&mut self, result: Result<T, GpError>, next: PortalState) -> Result<T, GpError> {
        self.state = match &result {
            Ok(_) => next,
            Err(e) => PortalState::Failed(e.kind()),
        };
        result
    }
}

fn classify_prelogin(response: &GpResponse) -> Result<PortalChallenge, GpError> {
    if response.is_auth_failure() {
        return Err(GpError::AuthRejected(format!(
            "prelogin refused ({})",
            response.status
        )));
    }
    if !response.is_success() || !response.looks_like_xml() {
        return Err(GpError::protocol(
            format!("unexpected prelogin response ({})", response.status),
            &response.body,
        ));
    }
    parse_prelogin(&response.body)
}

pub(crate) fn parse_prelogin(body: &str) -> Result<PortalChallenge, GpError> {
    let prelogin: PreloginXml = quick_xml::de::from_str(body)
        .map_err(|e| GpError::protocol(format!("invalid prelogin document: {}", e), body))?;

    let status = non_empty(prelogin.status)
        .ok_or_else(|| GpError::protocol("prelogin document has no status", body))?;
    if !status.eq_ignore_ascii_case("success") {
        let msg = non_empty(prelogin.msg).unwrap_or(status);
        return Err(GpError::AuthRejected(format!("prelogin failed: {}", msg)));
    }

    let region = non_empty(prelogin.region);
    let Some(method) = non_empty(prelogin.saml_auth_method) else {
        debug!("Portal requested direct authentication");
        return Ok(PortalChallenge::Direct(DirectChallenge {
            username_label: non_empty(prelogin.username_label)
                .unwrap_or_else(|| "Username".to_string()),
            password_label: non_empty(prelogin.password_label)
                .unwrap_or_else(|| "Password".to_string()),
            region,
        }));
    };

    let request_token = non_empty(prelogin.saml_request)
        .ok_or_else(|| GpError::protocol("SAML prelogin without saml-request", body))?;
    let decoded = decode_base64_text(&request_token)
        .ok_or_else(|| GpError::protocol("saml-request is not base64 text", body))?;

    let idp_request = match method.to_ascii_uppercase().as_str() {
        "REDIRECT" => {
            let url = url::Url::parse(decoded.trim())
                .map_err(|e| GpError::protocol(format!("invalid IdP URL: {}", e), body))?;
            IdpRequest::Redirect(url)
        }
        "POST" => IdpRequest::PostForm(decoded),
        other => return Err(GpError::UnsupportedAuthMode(other.to_string())),
    };

    let expires_at = non_empty(prelogin.saml_request_timeout)
        .and_then(|t| t.parse::<u64>().ok())
        .filter(|secs| *secs > 0)
        .map(|secs| Instant::now() + Duration::from_secs(secs));

    debug!("Portal requested SAML {} authentication", method);
    Ok(PortalChallenge::SamlRedirect(SamlChallenge {
        idp_request,
        request_token,
        relay_state: non_empty(prelogin.saml_relay_state),
        expires_at,
        region,
    }))
}

fn classify_direct(response: &GpResponse) -> Result<String, GpError> {
    // 512 is how the portal reports bad credentials
    if response.is_auth_failure() || response.status.as_u16() == 512 {
        return Err(GpError::AuthRejected("invalid username or password".to_string()));
    }
    if !response.is_success() {
        return Err(GpError::protocol(
            format!("unexpected portal login response ({})", response.status),
            &response.body,
        ));
    }
    if let Some(msg) = extract_resp_error(&response.body) {
        return Err(GpError::AuthRejected(msg));
    }

    extract_tag(&response.body, "portal-userauthcookie")
        .filter(|c| !is_absent(c))
        .ok_or_else(|| GpError::protocol("portal login returned no userauthcookie", &response.body))
}

pub(crate) struct AcsResult {
    pub username: String,
    pub token: String,
    pub kind: TokenKind,
}

impl fmt::Debug for AcsResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AcsResult")
            .field("username", &self.username)
            .field("token", &"<redacted>")
            .field("kind", &self.kind)
            .finish()
    }
}

fn classify_acs(response: &GpResponse) -> Result<AcsResult, GpError> {
    if response.is_auth_failure() || response.status == StatusCode::FORBIDDEN {
        return Err(GpError::AssertionRejected(format!(
            "portal refused the assertion ({})",
            response.status
        )));
    }
    if !response.is_success() {
        return Err(GpError::protocol(
            format!("unexpected assertion exchange response ({})", response.status),
            &response.body,
        ));
    }
    parse_acs_response(&response.body)
}

/// The consumer endpoint answers with an HTML page whose comment carries
/// the result as pseudo-XML tags
pub(crate) fn parse_acs_response(body: &str) -> Result<AcsResult, GpError> {
    let status = extract_tag(body, "saml-auth-status")
        .ok_or_else(|| GpError::protocol("assertion exchange reply has no saml-auth-status", body))?;

    if status.trim() != "1" {
        let message = extract_tag(body, "saml-auth-message")
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| format!("saml-auth-status {}", status.trim()));
        return Err(GpError::AssertionRejected(message));
    }

    let username = extract_tag(body, "saml-username")
        .filter(|u| !is_absent(u))
        .ok_or_else(|| GpError::protocol("assertion exchange reply has no saml-username", body))?;

    let (token, kind) = if let Some(cookie) =
        extract_tag(body, "portal-userauthcookie").filter(|c| !is_absent(c))
    {
        (cookie, TokenKind::PortalUserAuthCookie)
    } else if let Some(cookie) = extract_tag(body, "prelogin-cookie").filter(|c| !is_absent(c)) {
        (cookie, TokenKind::PreloginCookie)
    } else {
        return Err(GpError::protocol(
            "assertion exchange reply has no session cookie",
            body,
        ));
    };

    Ok(AcsResult {
        username,
        token,
        kind,
    })
}

fn classify_config(response: &GpResponse) -> Result<PortalConfig, GpError> {
    if response.is_auth_failure() {
        return Err(GpError::AuthExpired("portal rejected the session cookie".to_string()));
    }
    if response.is_hip_required() {
        return Err(GpError::PolicyDenied {
            reason: DenyReason::PostureRequired,
            message: "portal requires a HIP report".to_string(),
        });
    }
    if response.status == StatusCode::FORBIDDEN {
        return Err(GpError::PolicyDenied {
            reason: DenyReason::Other,
            message: response
                .pan_status
                .clone()
                .unwrap_or_else(|| "portal withheld configuration".to_string()),
        });
    }
    if !response.is_success() || !response.looks_like_xml() {
        return Err(GpError::protocol(
            format!("unexpected portal config response ({})", response.status),
            &response.body,
        ));
    }
    parse_portal_config(&response.body)
}

pub(crate) fn parse_portal_config(body: &str) -> Result<PortalConfig, GpError> {
    let policy: PolicyXml = quick_xml::de::from_str(body)
        .map_err(|e| GpError::protocol(format!("invalid portal config: {}", e), body))?;

    let gateways: Vec<GatewayDescriptor> = policy
        .gateways
        .and_then(|g| g.external)
        .and_then(|e| e.list)
        .map(|l| l.entries)
        .unwrap_or_default()
        .into_iter()
        .map(|entry| {
            let priority = entry
                .priority_rule
                .as_ref()
                .and_then(|rules| {
                    rules
                        .entries
                        .iter()
                        .find(|r| r.name.eq_ignore_ascii_case("any"))
                        .and_then(|r| r.priority.as_deref())
                })
                .or(entry.priority.as_deref())
                .and_then(|p| p.trim().parse::<u32>().ok())
                .unwrap_or(u32::MAX);
            GatewayDescriptor {
                name: non_empty(entry.description).unwrap_or_else(|| entry.name.clone()),
                host: entry.name,
                priority,
            }
        })
        .collect();

    if gateways.is_empty() {
        warn!("Portal config lists no gateways");
        return Err(GpError::PolicyDenied {
            reason: DenyReason::Other,
            message: "no gateway is available for this user".to_string(),
        });
    }

    Ok(PortalConfig {
        gateways,
        user_auth_cookie: non_empty(policy.portal_userauthcookie).filter(|c| !is_absent(c)),
        prelogon_user_auth_cookie: non_empty(policy.portal_prelogonuserauthcookie)
            .filter(|c| !is_absent(c)),
        hip_collection: policy.hip_collection.is_some(),
    })
}

/// Text between `<tag>` and `</tag>`, trimmed
pub(crate) fn extract_tag(body: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)?;
    Some(body[start..start + end].trim().to_string())
}

/// `var respStatus = "Error"; var respMsg = "...";` pages
fn extract_resp_error(body: &str) -> Option<String> {
    if !body.contains("respStatus = \"Error\"") {
        return None;
    }
    let msg = body
        .find("respMsg = \"")
        .and_then(|start| {
            let rest = &body[start + 11..];
            rest.find('"').map(|end| rest[..end].to_string())
        })
        .unwrap_or_else(|| "Unknown error".to_string());
    Some(msg)
}

fn decode_base64_text(encoded: &str) -> Option<String> {
    let compact: String = encoded.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = BASE64.decode(compact).ok()?;
    String::from_utf8(bytes).ok()
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// Placeholder values the servers use for "no value"
pub(crate) fn is_absent(value: &str) -> bool {
    matches!(value.trim(), "" | "(null)" | "-1" | "empty")
}
