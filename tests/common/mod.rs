//! Mock portal/gateway server and fixtures shared by the integration tests

#![allow(dead_code)]

use axum::Router;
use axum::extract::State;
use axum::http::{HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use gp_connect::credentials::{Credentials, StaticCredentials};
use gp_connect::error::GpError;
use gp_connect::gp::hip::BuiltinHipReporter;
use gp_connect::gp::http::{ClientParams, GpHttp, RetryPolicy};
use gp_connect::orchestrator::Orchestrator;
use gp_connect::session::SessionStore;
use gp_connect::sso::{CALLBACK_PARAM, RedirectSurface, SsoEngine};
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const PRELOGIN: &str = "/global-protect/prelogin.esp";
pub const PORTAL_CONFIG: &str = "/global-protect/getconfig.esp";
pub const ACS: &str = "/SAML20/SP/ACS";
pub const GATEWAY_LOGIN: &str = "/ssl-vpn/login.esp";
pub const HIP_CHECK: &str = "/ssl-vpn/hipreportcheck.esp";
pub const HIP_REPORT: &str = "/ssl-vpn/hipreport.esp";
pub const GATEWAY_CONFIG: &str = "/ssl-vpn/getconfig.esp";

pub const PRELOGIN_DIRECT: &str = include_str!("../files/prelogin_direct.xml");
pub const PRELOGIN_SAML: &str = include_str!("../files/prelogin_saml.xml");
pub const ACS_SUCCESS: &str = include_str!("../files/acs_success.html");
pub const DIRECT_LOGIN: &str = include_str!("../files/direct_login.xml");
pub const PORTAL_CONFIG_XML: &str = include_str!("../files/portal_config.xml");
pub const PORTAL_CONFIG_HIP_XML: &str = include_str!("../files/portal_config_hip.xml");
pub const GATEWAY_LOGIN_XML: &str = include_str!("../files/gateway_login.xml");
pub const GATEWAY_CONFIG_XML: &str = include_str!("../files/gateway_config.xml");
pub const HIP_CHECK_XML: &str = include_str!("../files/hip_check.xml");
pub const HIP_REPORT_OK: &str = include_str!("../files/hip_report_ok.xml");
pub const HIP_REPORT_REJECTED: &str = include_str!("../files/hip_report_rejected.xml");

/// Gateway login page asking for a second factor
pub const MFA_CHALLENGE: &str = r#"<html><script>
var respStatus = "Challenge";
var respMsg = "Enter passcode";
thisForm.inputStr.value = "5ef64e83000119ed";
</script></html>"#;

/// Relay state carried by `prelogin_saml.xml` (XML-unescaped)
pub const SAML_RELAY_STATE: &str = "relay/state+42&x=y";

#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub pan_status: Option<&'static str>,
    pub body: String,
}

impl Reply {
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            pan_status: None,
            body: body.into(),
        }
    }

    pub fn auth_failed() -> Self {
        Self {
            status: 200,
            pan_status: Some("auth-failed"),
            body: "<html>auth failed</html>".to_string(),
        }
    }

    pub fn hip_required() -> Self {
        Self {
            status: 200,
            pan_status: Some("HIP_REQUIRED"),
            body: String::new(),
        }
    }

    pub fn status(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            pan_status: None,
            body: body.into(),
        }
    }
}

impl IntoResponse for Reply {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = (status, self.body).into_response();
        if let Some(pan) = self.pan_status {
            response
                .headers_mut()
                .insert("x-private-pan-globalprotect", HeaderValue::from_static(pan));
        }
        response
    }
}

#[derive(Default)]
struct MockState {
    queued: Mutex<HashMap<String, VecDeque<Reply>>>,
    defaults: Mutex<HashMap<String, Reply>>,
    log: Mutex<Vec<(String, HashMap<String, String>)>>,
}

/// One server playing both portal and gateway
pub struct MockGp {
    addr: SocketAddr,
    state: Arc<MockState>,
}

impl MockGp {
    pub async fn start() -> Self {
        let state = Arc::new(MockState::default());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let app = Router::new().fallback(handle).with_state(Arc::clone(&state));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Portal identity under which sessions for this server are stored
    pub fn identity(&self) -> String {
        self.addr.to_string()
    }

    /// Reply used whenever nothing is queued for `path`
    pub fn set(&self, path: &str, reply: Reply) -> &Self {
        self.state.defaults.lock().unwrap().insert(path.to_string(), reply);
        self
    }

    /// One-shot reply served before the default
    pub fn push(&self, path: &str, reply: Reply) -> &Self {
        self.state
            .queued
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push_back(reply);
        self
    }

    /// Portal config naming this server as the preferred gateway
    pub fn portal_config(&self, template: &str) -> String {
        template.replace("{GATEWAY}", &self.url())
    }

    /// Happy-path replies for every endpoint
    pub fn serve_defaults(&self, prelogin: &str) -> &Self {
        self.set(PRELOGIN, Reply::ok(prelogin))
            .set(PORTAL_CONFIG, Reply::ok(self.portal_config(PORTAL_CONFIG_XML)))
            .set(ACS, Reply::ok(ACS_SUCCESS))
            .set(GATEWAY_LOGIN, Reply::ok(GATEWAY_LOGIN_XML))
            .set(HIP_CHECK, Reply::ok(HIP_CHECK_XML))
            .set(HIP_REPORT, Reply::ok(HIP_REPORT_OK))
            .set(GATEWAY_CONFIG, Reply::ok(GATEWAY_CONFIG_XML))
    }

    pub fn calls(&self, path: &str) -> usize {
        self.state.log.lock().unwrap().iter().filter(|(p, _)| p == path).count()
    }

    /// Paths in the order they were requested
    pub fn paths(&self) -> Vec<String> {
        self.state.log.lock().unwrap().iter().map(|(p, _)| p.clone()).collect()
    }

    pub fn requests(&self, path: &str) -> Vec<HashMap<String, String>> {
        self.state
            .log
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, form)| form.clone())
            .collect()
    }
}

async fn handle(State(state): State<Arc<MockState>>, uri: Uri, body: String) -> Response {
    let path = uri.path().to_string();
    let form: HashMap<String, String> = url::form_urlencoded::parse(body.as_bytes())
        .into_owned()
        .collect();
    state.log.lock().unwrap().push((path.clone(), form));

    let queued = state
        .queued
        .lock()
        .unwrap()
        .get_mut(&path)
        .and_then(|q| q.pop_front());
    let reply = queued.or_else(|| state.defaults.lock().unwrap().get(&path).cloned());

    match reply {
        Some(reply) => reply.into_response(),
        None => (StatusCode::NOT_FOUND, "not found").into_response(),
    }
}

/// Stands in for the user: checks the listener is already accepting, then
/// posts an assertion to the callback carried in the target
pub struct AssertingSurface {
    pub targets: Arc<Mutex<Vec<String>>>,
}

impl AssertingSurface {
    pub fn new() -> (Self, Arc<Mutex<Vec<String>>>) {
        let targets = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                targets: Arc::clone(&targets),
            },
            targets,
        )
    }
}

impl RedirectSurface for AssertingSurface {
    fn surface(&self, target: &str) -> Result<(), GpError> {
        self.targets.lock().unwrap().push(target.to_string());

        let target_url = url::Url::parse(target).unwrap();
        let query: HashMap<String, String> = target_url.query_pairs().into_owned().collect();
        let callback = query.get(CALLBACK_PARAM).cloned().unwrap();
        let relay = query.get("RelayState").cloned().unwrap_or_default();

        let addr = url::Url::parse(&callback).unwrap().socket_addrs(|| None).unwrap()[0];
        std::net::TcpStream::connect(addr).expect("callback listener not accepting");

        tokio::spawn(async move {
            let _ = reqwest::Client::new()
                .post(callback)
                .form(&[
                    ("SAMLResponse", BASE64.encode("<samlp:Response ID=\"r1\"/>")),
                    ("RelayState", relay),
                ])
                .send()
                .await;
        });
        Ok(())
    }
}

/// Records targets and never completes (user walked away)
pub struct IdleSurface {
    pub targets: Arc<Mutex<Vec<String>>>,
}

impl RedirectSurface for IdleSurface {
    fn surface(&self, target: &str) -> Result<(), GpError> {
        self.targets.lock().unwrap().push(target.to_string());
        Ok(())
    }
}

pub fn http() -> Arc<GpHttp> {
    let params = ClientParams::new("PAN GlobalProtect", "Linux", "6.0.1-19").with_computer("test-host");
    Arc::new(GpHttp::new(params, RetryPolicy::none(), Duration::from_secs(5), None).unwrap())
}

pub fn orchestrator(store_dir: &Path, surface: Box<dyn RedirectSurface>, sso_timeout: Duration) -> Orchestrator {
    orchestrator_with(store_dir, surface, sso_timeout, Credentials::new("alice", "correct horse"))
}

pub fn orchestrator_with(
    store_dir: &Path,
    surface: Box<dyn RedirectSurface>,
    sso_timeout: Duration,
    credentials: Credentials,
) -> Orchestrator {
    let loopback: SocketAddr = "127.0.0.1:0".parse().unwrap();
    Orchestrator::new(
        http(),
        SessionStore::new(store_dir),
        SsoEngine::new(surface, loopback, sso_timeout),
        Box::new(StaticCredentials(credentials)),
        Arc::new(BuiltinHipReporter),
    )
}
