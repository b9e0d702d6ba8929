//! Gateway negotiation
//!
//! Implements the gateway half of the flow:
//! 1. login - exchange the portal cookie for a tunnel bootstrap token
//! 2. HIP check/report - posture submission when policy requires it
//! 3. getconfig - tunnel configuration
//!
//! When posture is required, step 3 is refused locally until step 2 has
//! been acknowledged by the gateway.

use crate::credentials::CredentialSource;
use crate::error::{DenyReason, GpError};
use crate::gp::hip::{HipContext, HipReport, HipReporter};
use crate::gp::http::{GpHttp, GpResponse, normalize_server, remove_url_scheme};
use crate::gp::portal::{PortalConfig, extract_tag, is_absent};
use crate::session::SessionCookie;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::net::{IpAddr, Ipv6Addr};
use std::sync::Arc;
use tracing::{debug, info, warn};
use urlencoding::{decode, encode};

const LOGIN_PATH: &str = "/ssl-vpn/login.esp";
const HIP_CHECK_PATH: &str = "/ssl-vpn/hipreportcheck.esp";
const HIP_REPORT_PATH: &str = "/ssl-vpn/hipreport.esp";
const GETCONFIG_PATH: &str = "/ssl-vpn/getconfig.esp";

/// MTU used when the gateway sends none or 0
const DEFAULT_MTU: u16 = 1400;

/// Result of a successful gateway login
#[derive(Clone)]
pub struct GatewayAuthResult {
    pub gateway: String,
    pub auth_cookie: String,
    pub portal: String,
    pub username: String,
    pub domain: String,
    pub preferred_ip: Option<String>,
    /// `authcookie=...&portal=...` token handed to the tunnel engine
    pub bootstrap_token: String,
}

impl fmt::Debug for GatewayAuthResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayAuthResult")
            .field("gateway", &self.gateway)
            .field("portal", &self.portal)
            .field("username", &self.username)
            .field("domain", &self.domain)
            .field("preferred_ip", &self.preferred_ip)
            .finish_non_exhaustive()
    }
}

/// Tunnel configuration from getconfig
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub mtu: u16,
    pub internal_ip: IpAddr,
    pub internal_ip6: Option<Ipv6Addr>,
    pub dns_servers: Vec<IpAddr>,
    pub timeout_seconds: u64,
}

// XML deserialization structures for login
#[derive(Debug, Deserialize)]
struct JnlpXml {
    #[serde(rename = "application-desc")]
    application_desc: ApplicationDesc,
}

#[derive(Debug, Deserialize)]
struct ApplicationDesc {
    #[serde(default)]
    argument: Vec<String>,
}

// XML deserialization structures for getconfig
#[derive(Debug, Deserialize)]
#[serde(rename = "policy")]
struct PolicyXml {
    #[serde(rename = "ip-address", default)]
    ip_address: Option<String>,
    #[serde(rename = "ipv6-address", default)]
    ipv6_address: Option<String>,
    #[serde(default)]
    mtu: Option<String>,
    #[serde(default)]
    dns: Option<Dns>,
    #[serde(default)]
    timeout: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Dns {
    #[serde(default)]
    member: Vec<String>,
}

/// Challenge page from login (gateway wants another factor)
#[derive(Debug)]
struct ChallengeResponse {
    input_str: String,
    message: String,
}

pub struct GatewayNegotiator {
    http: Arc<GpHttp>,
    base_url: String,
    host: String,
    reporter: Arc<dyn HipReporter>,
    hip_acknowledged: bool,
}

impl GatewayNegotiator {
    pub fn new(http: Arc<GpHttp>, gateway: &str, reporter: Arc<dyn HipReporter>) -> Result<Self, GpError> {
        let base_url = normalize_server(gateway)?;
        Ok(Self {
            host: remove_url_scheme(&base_url).to_string(),
            base_url,
            http,
            reporter,
            hip_acknowledged: false,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Gateway accepted a HIP report during this attempt
    pub fn hip_acknowledged(&self) -> bool {
        self.hip_acknowledged
    }

    /// Log in with the portal session. A challenge page is answered once
    /// with a passcode from `factor`; a second challenge is a rejection.
    pub async fn login(
        &mut self,
        cookie: &SessionCookie,
        portal: Option<&PortalConfig>,
        factor: &dyn CredentialSource,
    ) -> Result<GatewayAuthResult, GpError> {
        info!("Logging in to gateway {} as {}", self.host, cookie.username);

        let mut form = vec![
            ("user", cookie.username.clone()),
            ("passwd", String::new()),
            ("prot", "https:".to_string()),
            ("jnlpReady", "jnlpReady".to_string()),
            ("ok", "Login".to_string()),
            ("direct", "yes".to_string()),
            ("ipv6-support", "yes".to_string()),
            ("server", self.host.clone()),
        ];

        match portal.and_then(|p| p.user_auth_cookie.as_ref()) {
            Some(user_auth) => {
                form.push(("portal-userauthcookie", user_auth.clone()));
                let prelogon = portal
                    .and_then(|p| p.prelogon_user_auth_cookie.clone())
                    .unwrap_or_default();
                form.push(("portal-prelogonuserauthcookie", prelogon));
            }
            None => form.push((cookie.kind.param_name(), cookie.token.clone())),
        }
        form.extend(self.http.params().to_params());

        let mut response = self.post_login(&form).await?;

        if !response.is_auth_failure()
            && let Some(challenge) = parse_challenge(&response.body)
        {
            info!("MFA challenge received: {}", challenge.message);
            let passcode = factor.passcode(&self.host, &challenge.message)?;

            let mut answer: Vec<(&str, String)> = form
                .iter()
                .filter(|(k, _)| *k != "passwd")
                .cloned()
                .collect();
            answer.push(("passwd", passcode));
            answer.push(("inputStr", challenge.input_str));

            info!("Sending MFA response (waiting for approval...)");
            response = self.post_login(&answer).await?;

            if let Some(again) = parse_challenge(&response.body) {
                return Err(GpError::AuthRejected(format!("MFA failed: {}", again.message)));
            }
            // Empty 200: factor accepted, the JNLP comes from a repeated login
            if response.is_success() && response.body.trim().is_empty() {
                info!("MFA accepted, completing login...");
                response = self.post_login(&form).await?;
            }
        }

        classify_login(
            &response,
            &self.http.params().computer,
            &self.host,
            &cookie.username,
        )
    }

    async fn post_login(&self, form: &[(&str, String)]) -> Result<GpResponse, GpError> {
        let url = format!("{}{}", self.base_url, LOGIN_PATH);
        self.http.post_form(&url, form).await.map_err(|e| match e {
            GpError::Transport(msg) => GpError::GatewayUnreachable(format!("{}: {}", self.host, msg)),
            other => other,
        })
    }

    /// Generate and upload a HIP report when `required`. Returns the
    /// acknowledged report, or `None` when posture is not required.
    pub async fn ensure_compliance(
        &mut self,
        required: bool,
        auth: &GatewayAuthResult,
    ) -> Result<Option<HipReport>, GpError> {
        if !required {
            debug!("HIP report not required for {}", self.host);
            return Ok(None);
        }

        let params = self.http.params();
        let ctx = HipContext {
            user: auth.username.clone(),
            domain: auth.domain.clone(),
            host: params.computer.clone(),
            client_ip: auth.preferred_ip.clone().unwrap_or_default(),
            client_os: params.client_os.clone(),
            os_version: params.os_version.clone(),
            client_version: params.client_version.clone(),
            token: auth.bootstrap_token.clone(),
        };
        let md5 = ctx.fingerprint();

        let needed = self.check_hip(&ctx, &md5).await?;
        debug!("Gateway reports hip-report-needed={} for md5 {}", needed, md5);

        let reporter = Arc::clone(&self.reporter);
        let version = md5.clone();
        let report = tokio::task::spawn_blocking(move || reporter.generate(&ctx, &version))
            .await
            .map_err(|e| GpError::HipSubmissionFailed(format!("report generation aborted: {}", e)))??;
        info!(
            "hip report generated by {} for {}@{} (md5 {})",
            self.reporter.name(),
            report.user,
            report.host,
            report.policy_version
        );

        self.submit_hip(auth, &report).await?;
        self.hip_acknowledged = true;
        Ok(Some(report))
    }

    async fn check_hip(&self, ctx: &HipContext, md5: &str) -> Result<bool, GpError> {
        let mut form = vec![
            ("client-role", "global-protect-full".to_string()),
            ("tmp", "tmp".to_string()),
            ("client-ip", ctx.client_ip.clone()),
            ("md5", md5.to_string()),
        ];
        form.extend(token_params(&ctx.token));

        let url = format!("{}{}", self.base_url, HIP_CHECK_PATH);
        let response = self.http.post_form(&url, &form).await?;
        if response.is_auth_failure() {
            return Err(GpError::AuthExpired("gateway rejected the session during HIP check".to_string()));
        }
        if !response.is_success() || !is_success_envelope(&response.body) {
            return Err(GpError::HipSubmissionFailed(format!(
                "HIP check failed ({})",
                response.status
            )));
        }

        Ok(extract_tag(&response.body, "hip-report-needed")
            .is_none_or(|v| !v.eq_ignore_ascii_case("no")))
    }

    async fn submit_hip(&self, auth: &GatewayAuthResult, report: &HipReport) -> Result<(), GpError> {
        let mut form = vec![
            ("client-role", "global-protect-full".to_string()),
            ("client-ip", auth.preferred_ip.clone().unwrap_or_default()),
            ("md5", report.policy_version.clone()),
            ("report", report.document.clone()),
        ];
        form.extend(token_params(&auth.bootstrap_token));

        let url = format!("{}{}", self.base_url, HIP_REPORT_PATH);
        let response = self.http.post_form(&url, &form).await?;
        if response.is_auth_failure() {
            return Err(GpError::AuthExpired("gateway rejected the session during HIP upload".to_string()));
        }
        if response.is_success() && is_success_envelope(&response.body) {
            info!("hip report uploaded to {}", self.host);
            return Ok(());
        }

        let reason = extract_tag(&response.body, "error")
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| format!("status {}", response.status));
        warn!("hip report rejected by {}: {}", self.host, reason);
        Err(GpError::HipSubmissionFailed(reason))
    }

    /// Request tunnel configuration. With `hip_required`, refuses to ask
    /// until a report has been acknowledged.
    pub async fn fetch_tunnel_config(
        &mut self,
        auth: &GatewayAuthResult,
        hip_required: bool,
    ) -> Result<TunnelConfig, GpError> {
        if hip_required && !self.hip_acknowledged {
            return Err(GpError::PolicyDenied {
                reason: DenyReason::PostureRequired,
                message: "HIP report has not been acknowledged".to_string(),
            });
        }
        info!("Getting tunnel configuration from {}", self.host);

        let params = self.http.params();
        let mut form = vec![
            ("protocol-version", "p1".to_string()),
            ("client-type", "1".to_string()),
            ("enc-algo", "aes-256-gcm,aes-128-gcm,aes-128-cbc".to_string()),
            ("hmac-algo", "sha1".to_string()),
            ("app-version", params.client_version.clone()),
            ("clientos", params.client_os.clone()),
            ("os-version", params.os_version.clone()),
        ];
        let has_preferred = auth.preferred_ip.is_some();
        form.extend(token_params(&auth.bootstrap_token));
        if !has_preferred {
            form.push(("preferred-ip", "0.0.0.0".to_string()));
        }

        let url = format!("{}{}", self.base_url, GETCONFIG_PATH);
        let response = self.http.post_form(&url, &form).await.map_err(|e| match e {
            GpError::Transport(msg) => GpError::GatewayUnreachable(format!("{}: {}", self.host, msg)),
            other => other,
        })?;
        classify_tunnel_config(&response)
    }
}

fn classify_login(
    response: &GpResponse,
    computer: &str,
    gateway: &str,
    username: &str,
) -> Result<GatewayAuthResult, GpError> {
    if response.is_auth_failure() {
        return Err(GpError::AuthExpired("gateway rejected the portal cookie".to_string()));
    }
    if let Some(challenge) = parse_challenge(&response.body) {
        return Err(GpError::AuthRejected(format!(
            "gateway requested an additional factor: {}",
            challenge.message
        )));
    }
    if let Some(msg) = extract_resp_error(&response.body) {
        return Err(GpError::AuthExpired(msg));
    }
    if response.status.is_server_error() {
        return Err(GpError::GatewayUnreachable(format!(
            "{} answered {}",
            gateway, response.status
        )));
    }
    if !response.is_success() || !response.looks_like_xml() {
        return Err(GpError::protocol(
            format!("unexpected gateway login response ({})", response.status),
            &response.body,
        ));
    }
    parse_jnlp_response(&response.body, computer, gateway, username)
}

/// Parse HTML challenge response
/// Format: var respStatus = "Challenge"; var respMsg = "..."; thisForm.inputStr.value = "...";
fn parse_challenge(body: &str) -> Option<ChallengeResponse> {
    if !body.contains("respStatus = \"Challenge\"") {
        return None;
    }

    let input_str = body.find("inputStr.value = \"").and_then(|start| {
        let rest = &body[start + 18..];
        rest.find('"').map(|end| rest[..end].to_string())
    })?;

    let message = body
        .find("respMsg = \"")
        .and_then(|start| {
            let rest = &body[start + 11..];
            rest.find('"').map(|end| rest[..end].to_string())
        })
        .unwrap_or_else(|| "Enter passcode".to_string());

    Some(ChallengeResponse { input_str, message })
}

fn extract_resp_error(body: &str) -> Option<String> {
    if !body.contains("respStatus = \"Error\"") {
        return None;
    }
    Some(
        body.find("respMsg = \"")
            .and_then(|start| {
                let rest = &body[start + 11..];
                rest.find('"').map(|end| rest[..end].to_string())
            })
            .unwrap_or_else(|| "Unknown error".to_string()),
    )
}

/// Parse JNLP login response
/// Handles both labeled format: (auth-cookie), value, (portal), value, ...
/// And positional format: empty, cookie, persistent-cookie, portal, user, profile, vsys, domain, ...
fn parse_jnlp_response(
    body: &str,
    computer: &str,
    gateway: &str,
    username: &str,
) -> Result<GatewayAuthResult, GpError> {
    let jnlp: JnlpXml = quick_xml::de::from_str(body)
        .map_err(|e| GpError::protocol(format!("invalid gateway login response: {}", e), body))?;
    let args: Vec<&str> = jnlp
        .application_desc
        .argument
        .iter()
        .map(|a| a.trim())
        .collect();

    if args.is_empty() {
        return Err(GpError::protocol("gateway login response has no arguments", body));
    }

    let fields = if args.contains(&"(auth-cookie)") {
        labelled_fields(&args)
    } else {
        debug!("Parsing positional JNLP format with {} arguments", args.len());
        positional_fields(&args)
    };

    let auth_cookie = fields
        .auth_cookie
        .ok_or_else(|| GpError::protocol("gateway login response has no auth cookie", body))?;
    let portal = fields.portal.unwrap_or_else(|| gateway.to_string());
    let user = fields.user.unwrap_or_else(|| username.to_string());
    let domain = fields.domain.unwrap_or_default();

    let mut token_fields = vec![
        ("authcookie", auth_cookie.as_str()),
        ("portal", portal.as_str()),
        ("user", user.as_str()),
        ("domain", domain.as_str()),
    ];
    if let Some(ip) = fields.preferred_ip.as_deref() {
        token_fields.push(("preferred-ip", ip));
    }
    token_fields.push(("computer", computer));
    if let Some(v) = fields.persistent_cookie.as_deref() {
        token_fields.push(("persistent-cookie", v));
    }
    if let Some(v) = fields.portal_user_auth_cookie.as_deref() {
        token_fields.push(("portal-userauthcookie", v));
    }
    if let Some(v) = fields.portal_prelogon_user_auth_cookie.as_deref() {
        token_fields.push(("portal-prelogonuserauthcookie", v));
    }
    let bootstrap_token = build_gateway_token(&token_fields);

    Ok(GatewayAuthResult {
        gateway: gateway.to_string(),
        auth_cookie,
        portal,
        username: user,
        domain,
        preferred_ip: fields.preferred_ip,
        bootstrap_token,
    })
}

#[derive(Default)]
struct JnlpFields {
    auth_cookie: Option<String>,
    persistent_cookie: Option<String>,
    portal: Option<String>,
    user: Option<String>,
    domain: Option<String>,
    preferred_ip: Option<String>,
    portal_user_auth_cookie: Option<String>,
    portal_prelogon_user_auth_cookie: Option<String>,
}

fn labelled_fields(args: &[&str]) -> JnlpFields {
    let mut fields = JnlpFields::default();
    for pair in args.chunks(2) {
        let [key, value] = pair else { continue };
        let value = present(value);
        match *key {
            "(auth-cookie)" => fields.auth_cookie = value,
            "(persistent-cookie)" => fields.persistent_cookie = value,
            "(portal)" => fields.portal = value,
            "(user)" => fields.user = value,
            "(domain)" => fields.domain = value,
            "(preferred-ip)" => fields.preferred_ip = value,
            "(portal-userauthcookie)" => fields.portal_user_auth_cookie = value,
            "(portal-prelogonuserauthcookie)" => fields.portal_prelogon_user_auth_cookie = value,
            _ => {}
        }
    }
    fields
}

// [1] auth-cookie, [2] persistent-cookie, [3] portal, [4] user, [7] domain,
// [15] preferred-ip, [16] portal-userauthcookie, [17] portal-prelogonuserauthcookie
fn positional_fields(args: &[&str]) -> JnlpFields {
    let at = |index: usize| args.get(index).and_then(|v| present(v));
    JnlpFields {
        auth_cookie: at(1),
        persistent_cookie: at(2),
        portal: at(3),
        user: at(4),
        domain: args.get(7).map(|d| d.to_string()),
        preferred_ip: at(15),
        portal_user_auth_cookie: at(16),
        portal_prelogon_user_auth_cookie: at(17),
    }
}

fn present(value: &str) -> Option<String> {
    (!is_absent(value)).then(|| value.to_string())
}

/// `key=value&...`, values URL-encoded exactly once
fn build_gateway_token(fields: &[(&str, &str)]) -> String {
    fields
        .iter()
        .map(|(key, value)| format!("{}={}", key, encode(&normalize_token_value(value))))
        .collect::<Vec<_>>()
        .join("&")
}

/// Decode values the gateway already percent-encoded
fn normalize_token_value(value: &str) -> Cow<'_, str> {
    if value.contains('%') {
        return decode(value).unwrap_or(Cow::Borrowed(value));
    }
    Cow::Borrowed(value)
}

/// Bootstrap token fields as form parameters
fn token_params(token: &str) -> Vec<(&'static str, String)> {
    url::form_urlencoded::parse(token.as_bytes())
        .filter_map(|(key, value)| {
            let key = match key.as_ref() {
                "authcookie" => "authcookie",
                "portal" => "portal",
                "user" => "user",
                "domain" => "domain",
                "preferred-ip" => "preferred-ip",
                "computer" => "computer",
                _ => return None,
            };
            Some((key, value.into_owned()))
        })
        .collect()
}

fn is_success_envelope(body: &str) -> bool {
    body.contains("<response status=\"success\"") || body.contains("<response status='success'")
}

fn classify_tunnel_config(response: &GpResponse) -> Result<TunnelConfig, GpError> {
    if response.is_auth_failure() {
        return Err(GpError::AuthExpired("gateway rejected the session".to_string()));
    }
    if response.is_hip_required() {
        return Err(GpError::PolicyDenied {
            reason: DenyReason::PostureRequired,
            message: "gateway requires a HIP report".to_string(),
        });
    }
    if response.status == StatusCode::FORBIDDEN {
        return Err(GpError::PolicyDenied {
            reason: DenyReason::Other,
            message: response
                .pan_status
                .clone()
                .unwrap_or_else(|| "gateway withheld tunnel configuration".to_string()),
        });
    }
    if response.status.is_server_error() {
        return Err(GpError::GatewayUnreachable(format!(
            "getconfig answered {}",
            response.status
        )));
    }
    if !response.is_success() || !response.looks_like_xml() {
        return Err(GpError::protocol(
            format!("unexpected getconfig response ({})", response.status),
            &response.body,
        ));
    }
    parse_tunnel_config(&response.body)
}

fn parse_tunnel_config(body: &str) -> Result<TunnelConfig, GpError> {
    let policy: PolicyXml = quick_xml::de::from_str(body)
        .map_err(|e| GpError::protocol(format!("invalid getconfig response: {}", e), body))?;

    let internal_ip: IpAddr = policy
        .ip_address
        .as_deref()
        .ok_or_else(|| GpError::protocol("getconfig response has no ip-address", body))?
        .trim()
        .parse()
        .map_err(|_| GpError::protocol("getconfig ip-address is not an IP address", body))?;

    let internal_ip6 = policy
        .ipv6_address
        .as_deref()
        .and_then(|s| s.trim().parse().ok());

    Ok(TunnelConfig {
        mtu: parse_mtu(&policy),
        internal_ip,
        internal_ip6,
        dns_servers: parse_dns_servers(&policy),
        timeout_seconds: policy
            .timeout
            .as_deref()
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(3600),
    })
}

/// Server may return MTU 0 meaning "use default"
fn parse_mtu(policy: &PolicyXml) -> u16 {
    policy
        .mtu
        .as_deref()
        .and_then(|s| s.trim().parse::<u16>().ok())
        .filter(|&m| m > 0)
        .unwrap_or(DEFAULT_MTU)
}

fn parse_dns_servers(policy: &PolicyXml) -> Vec<IpAddr> {
    policy
        .dns
        .as_ref()
        .map(|dns| dns.member.iter().filter_map(|s| s.trim().parse().ok()).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn response(status: u16, pan: Option<&str>, body: &str) -> GpResponse {
        GpResponse {
            status: StatusCode::from_u16(status).unwrap(),
            pan_status: pan.map(|s| s.to_string()),
            body: body.to_string(),
        }
    }

    const POSITIONAL: &str = r#"<?xml version="1.0" encoding="UTF-8" ?>
<jnlp>
<application-desc>
<argument>(null)</argument>
<argument>ec85fe94925569dbaf7f38bfe736da90</argument>
<argument>651e643201afcb354d58b58d9412f3a168db1fa4</argument>
<argument>GP-Gateway-N</argument>
<argument>alice</argument>
<argument>DUO_profile</argument>
<argument>vsys1</argument>
<argument>%28empty_domain%29</argument>
<argument></argument>
<argument></argument>
<argument></argument>
<argument></argument>
<argument>tunnel</argument>
<argument>-1</argument>
<argument>4100</argument>
<argument>198.51.100.12</argument>
<argument>portal-user-cookie-value</argument>
<argument>empty</argument>
</application-desc>
</jnlp>"#;

    #[test]
    fn test_parse_positional_jnlp_response() {
        let auth = parse_jnlp_response(POSITIONAL, "laptop-1", "gw.example.com", "fallback").unwrap();
        assert_eq!(auth.auth_cookie, "ec85fe94925569dbaf7f38bfe736da90");
        assert_eq!(auth.portal, "GP-Gateway-N");
        assert_eq!(auth.username, "alice");
        assert_eq!(auth.domain, "%28empty_domain%29");
        assert_eq!(auth.preferred_ip.as_deref(), Some("198.51.100.12"));

        let token = &auth.bootstrap_token;
        assert!(token.starts_with("authcookie=ec85fe94925569dbaf7f38bfe736da90&portal=GP-Gateway-N"));
        assert!(token.contains("domain=%28empty_domain%29"));
        assert!(!token.contains("%2528"));
        assert!(token.contains("computer=laptop-1"));
        assert!(token.contains("persistent-cookie=651e643201afcb354d58b58d9412f3a168db1fa4"));
        assert!(token.contains("portal-userauthcookie=portal-user-cookie-value"));
        assert!(!token.contains("portal-prelogonuserauthcookie"));
    }

    #[test]
    fn test_parse_labelled_jnlp_response() {
        let xml = r#"
            <jnlp>
                <application-desc>
                    <argument>(auth-cookie)</argument>
                    <argument>test-cookie-value</argument>
                    <argument>(portal)</argument>
                    <argument>test-portal</argument>
                    <argument>(domain)</argument>
                    <argument>test-domain</argument>
                </application-desc>
            </jnlp>
        "#;

        let auth = parse_jnlp_response(xml, "host", "gw.example.com", "bob").unwrap();
        assert_eq!(auth.auth_cookie, "test-cookie-value");
        assert_eq!(auth.portal, "test-portal");
        assert_eq!(auth.username, "bob");
        assert_eq!(auth.preferred_ip, None);
        assert_eq!(
            auth.bootstrap_token,
            "authcookie=test-cookie-value&portal=test-portal&user=bob&domain=test-domain&computer=host"
        );
    }

    #[test]
    fn test_jnlp_without_cookie_is_protocol_error() {
        let xml = "<jnlp><application-desc><argument></argument><argument>(null)</argument></application-desc></jnlp>";
        let err = parse_jnlp_response(xml, "h", "g", "u").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_debug_hides_cookie() {
        let auth = parse_jnlp_response(POSITIONAL, "h", "g", "u").unwrap();
        let rendered = format!("{:?}", auth);
        assert!(!rendered.contains("ec85fe94"));
    }

    #[test]
    fn test_challenge_is_auth_rejected() {
        let html = r#"<html><body>
  var respStatus = "Challenge";
  var respMsg = "Enter passcode:";
  thisForm.inputStr.value = "691e86260039364e";
</body></html>"#;

        let challenge = parse_challenge(html).unwrap();
        assert_eq!(challenge.input_str, "691e86260039364e");
        assert_eq!(challenge.message, "Enter passcode:");

        // Reaching classification means the challenge went unanswered
        let err = classify_login(&response(200, None, html), "h", "g", "u").unwrap_err();
        assert!(matches!(err, GpError::AuthRejected(m) if m.contains("Enter passcode:")));
    }

    #[test]
    fn test_login_classification() {
        let err = classify_login(&response(200, Some("auth-failed"), ""), "h", "g", "u").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthExpired);

        let err = classify_login(&response(503, None, ""), "h", "g", "u").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::GatewayUnreachable);

        let err = classify_login(&response(200, None, "<html>oops"), "h", "g", "u").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_normalize_token_value() {
        assert_eq!(normalize_token_value("%28empty_domain%29"), "(empty_domain)");
        assert_eq!(normalize_token_value("plain"), "plain");
        assert_eq!(
            build_gateway_token(&[("domain", "%28empty_domain%29"), ("user", "a b")]),
            "domain=%28empty_domain%29&user=a%20b"
        );
    }

    #[test]
    fn test_token_params_round_trip() {
        let params = token_params("authcookie=abc&portal=GW&user=a%40b&domain=&computer=h&persistent-cookie=p");
        assert!(params.contains(&("user", "a@b".to_string())));
        assert!(params.contains(&("domain", String::new())));
        assert!(!params.iter().any(|(k, _)| *k == "persistent-cookie"));
    }

    #[test]
    fn test_parse_getconfig_response() {
        let xml = r#"
            <policy>
                <ip-address>10.0.1.100</ip-address>
                <ipv6-address>fd00::100</ipv6-address>
                <mtu>0</mtu>
                <dns>
                    <member>8.8.8.8</member>
                    <member>8.8.4.4</member>
                </dns>
                <timeout>7200</timeout>
            </policy>
        "#;

        let config = parse_tunnel_config(xml).unwrap();
        assert_eq!(config.internal_ip, "10.0.1.100".parse::<IpAddr>().unwrap());
        assert_eq!(config.internal_ip6, Some("fd00::100".parse().unwrap()));
        assert_eq!(config.mtu, DEFAULT_MTU);
        assert_eq!(config.dns_servers.len(), 2);
        assert_eq!(config.timeout_seconds, 7200);
    }

    #[test]
    fn test_getconfig_classification() {
        let err = classify_tunnel_config(&response(403, Some("HIP_REQUIRED"), "")).unwrap_err();
        assert!(err.is_posture_denial());

        let err = classify_tunnel_config(&response(401, None, "")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AuthExpired);

        let err = classify_tunnel_config(&response(200, None, "<policy></policy>")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_success_envelope() {
        assert!(is_success_envelope("<response status=\"success\"><hip-report-needed>no</hip-report-needed></response>"));
        assert!(!is_success_envelope("<response status=\"error\"><error>bad report</error></response>"));
    }
}
