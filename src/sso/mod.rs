//! Browser-delegated SSO completion
//!
//! The engine binds the callback listener, builds the identity provider
//! target around the listener's address, surfaces it (local browser or
//! printed for a remote operator) and waits for the assertion.

pub mod listener;

use crate::config::{SsoMode, SsoSettings};
use crate::error::GpError;
use crate::gp::portal::{IdpRequest, SamlChallenge};
use listener::{AssertionPayload, CallbackAdapter, CallbackListener, default_adapters};
use std::net::{Ipv4Addr, SocketAddr};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Query parameter telling the provider where to deliver the result
pub const CALLBACK_PARAM: &str = "AssertionConsumerServiceURL";
pub const RELAY_STATE_PARAM: &str = "RelayState";

/// Where the SSO target is shown to the user
pub trait RedirectSurface: Send + Sync {
    fn surface(&self, target: &str) -> Result<(), GpError>;
}

/// Opens the target in a local browser
pub struct BrowserSurface {
    command: Option<String>,
}

impl BrowserSurface {
    /// `command` replaces the platform opener when set
    pub fn new(command: Option<String>) -> Self {
        Self { command }
    }
}

impl RedirectSurface for BrowserSurface {
    fn surface(&self, target: &str) -> Result<(), GpError> {
        let mut command = match &self.command {
            Some(browser) => {
                let mut c = Command::new(browser);
                c.arg(target);
                c
            }
            None => platform_opener(target),
        };

        let spawned = command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn();

        match spawned {
            Ok(_) => debug!("Browser launched for SSO"),
            Err(e) => {
                // Fall back to the remote behaviour rather than failing the flow
                warn!("Failed to launch browser ({}), open the URL manually", e);
                RemoteSurface.surface(target)?;
            }
        }
        Ok(())
    }
}

#[cfg(target_os = "macos")]
fn platform_opener(target: &str) -> Command {
    let mut c = Command::new("open");
    c.arg(target);
    c
}

#[cfg(target_os = "windows")]
fn platform_opener(target: &str) -> Command {
    let mut c = Command::new("cmd");
    c.args(["/C", "start", "", target]);
    c
}

#[cfg(not(any(target_os = "macos", target_os = "windows")))]
fn platform_opener(target: &str) -> Command {
    let mut c = Command::new("xdg-open");
    c.arg(target);
    c
}

/// Prints the target for an operator on another machine. Never starts a
/// local browser.
pub struct RemoteSurface;

impl RedirectSurface for RemoteSurface {
    fn surface(&self, target: &str) -> Result<(), GpError> {
        eprintln!();
        eprintln!("Open the following URL in a browser to sign in:");
        eprintln!();
        eprintln!("    {}", target);
        eprintln!();
        Ok(())
    }
}

pub struct SsoEngine {
    surface: Box<dyn RedirectSurface>,
    bind_addr: SocketAddr,
    timeout: Duration,
    adapters: Vec<Arc<dyn CallbackAdapter>>,
}

impl SsoEngine {
    pub fn new(surface: Box<dyn RedirectSurface>, bind_addr: SocketAddr, timeout: Duration) -> Self {
        Self {
            surface,
            bind_addr,
            timeout,
            adapters: default_adapters(),
        }
    }

    pub fn from_settings(settings: &SsoSettings) -> Self {
        let surface: Box<dyn RedirectSurface> = match settings.mode {
            SsoMode::Browser => Box::new(BrowserSurface::new(settings.browser.clone())),
            SsoMode::Remote => Box::new(RemoteSurface),
        };
        let bind_addr = SocketAddr::from((Ipv4Addr::LOCALHOST, settings.callback_port));
        Self::new(surface, bind_addr, settings.timeout())
    }

    /// Replace the callback adapters (provider-specific bindings)
    pub fn with_adapters(mut self, adapters: Vec<Arc<dyn CallbackAdapter>>) -> Self {
        self.adapters = adapters;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Drive one SSO flow to its assertion. Consumes the challenge.
    pub async fn complete(
        &self,
        challenge: SamlChallenge,
        cancel: &CancellationToken,
    ) -> Result<AssertionPayload, GpError> {
        if cancel.is_cancelled() {
            return Err(GpError::Cancelled);
        }

        let launch_page = match challenge.idp_request() {
            IdpRequest::PostForm(html) => Some(html.clone()),
            IdpRequest::Redirect(_) => None,
        };

        let mut listener =
            CallbackListener::bind(self.bind_addr, self.adapters.clone(), launch_page).await?;

        let target = build_redirect_target(
            challenge.idp_request(),
            challenge.relay_state(),
            &listener.callback_url(),
            &listener.launch_url(),
        );

        if let Err(e) = self.surface.surface(&target) {
            listener.close().await;
            return Err(e);
        }
        info!("sso target surfaced, waiting for callback on {}", listener.local_addr());

        let wait = match challenge.remaining_validity() {
            Some(remaining) => remaining.min(self.timeout),
            None => self.timeout,
        };
        drop(challenge);

        listener.await_result(wait, cancel).await
    }
}

/// Target URL for the user: the IdP URL itself for redirect binding, the
/// local launch page for POST binding. Relay state is carried unchanged.
pub fn build_redirect_target(
    idp: &IdpRequest,
    relay_state: Option<&str>,
    callback_url: &str,
    launch_url: &str,
) -> String {
    let mut target = match idp {
        IdpRequest::Redirect(url) => url.clone(),
        IdpRequest::PostForm(_) => match url::Url::parse(launch_url) {
            Ok(url) => url,
            Err(_) => return launch_url.to_string(),
        },
    };

    let existing: Vec<(String, String)> = target
        .query_pairs()
        .filter(|(key, _)| key != CALLBACK_PARAM && (relay_state.is_none() || key != RELAY_STATE_PARAM))
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    {
        let mut query = target.query_pairs_mut();
        query.clear();
        for (key, value) in &existing {
            query.append_pair(key, value);
        }
        if let Some(relay) = relay_state {
            query.append_pair(RELAY_STATE_PARAM, relay);
        }
        query.append_pair(CALLBACK_PARAM, callback_url);
    }

    target.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
    use std::sync::Mutex;

    fn query_value(target: &str, key: &str) -> Option<String> {
        url::Url::parse(target)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    /// Records the target and completes the flow by posting to it
    struct PostingSurface {
        seen: Arc<Mutex<Vec<String>>>,
        relay: Option<String>,
    }

    impl RedirectSurface for PostingSurface {
        fn surface(&self, target: &str) -> Result<(), GpError> {
            self.seen.lock().unwrap().push(target.to_string());
            let callback = query_value(target, CALLBACK_PARAM).unwrap();

            // The listener must already accept connections at this point
            let addr = url::Url::parse(&callback)
                .unwrap()
                .socket_addrs(|| None)
                .unwrap()[0];
            std::net::TcpStream::connect(addr).expect("listener not accepting");

            let relay = self.relay.clone().unwrap_or_default();
            tokio::spawn(async move {
                let _ = reqwest::Client::new()
                    .post(callback)
                    .form(&[
                        ("SAMLResponse", BASE64.encode("<samlp:Response/>")),
                        ("RelayState", relay),
                    ])
                    .send()
                    .await;
            });
            Ok(())
        }
    }

    struct SilentSurface;

    impl RedirectSurface for SilentSurface {
        fn surface(&self, _target: &str) -> Result<(), GpError> {
            Ok(())
        }
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    #[test]
    fn test_redirect_target_embeds_relay_state_and_callback() {
        let idp = IdpRequest::Redirect(
            url::Url::parse("https://idp.example.com/sso?SAMLRequest=abc%2Bdef").unwrap(),
        );
        let relay = "state/with+special&chars=1";
        let target = build_redirect_target(
            &idp,
            Some(relay),
            "http://127.0.0.1:4001/callback",
            "http://127.0.0.1:4001/",
        );

        assert!(target.starts_with("https://idp.example.com/sso?"));
        assert_eq!(query_value(&target, "SAMLRequest").as_deref(), Some("abc+def"));
        assert_eq!(query_value(&target, RELAY_STATE_PARAM).as_deref(), Some(relay));
        assert_eq!(
            query_value(&target, CALLBACK_PARAM).as_deref(),
            Some("http://127.0.0.1:4001/callback")
        );
    }

    #[test]
    fn test_redirect_target_keeps_idp_relay_state_when_none_given() {
        let idp = IdpRequest::Redirect(
            url::Url::parse("https://idp.example.com/sso?RelayState=from-idp").unwrap(),
        );
        let target = build_redirect_target(&idp, None, "http://127.0.0.1:1/callback", "http://127.0.0.1:1/");
        assert_eq!(query_value(&target, RELAY_STATE_PARAM).as_deref(), Some("from-idp"));
    }

    #[test]
    fn test_post_binding_targets_launch_page() {
        let idp = IdpRequest::PostForm("<form/>".to_string());
        let target = build_redirect_target(
            &idp,
            Some("rs"),
            "http://127.0.0.1:4002/callback",
            "http://127.0.0.1:4002/",
        );
        assert!(target.starts_with("http://127.0.0.1:4002/?"));
        assert_eq!(query_value(&target, RELAY_STATE_PARAM).as_deref(), Some("rs"));
    }

    #[tokio::test]
    async fn test_complete_returns_assertion() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let engine = SsoEngine::new(
            Box::new(PostingSurface {
                seen: Arc::clone(&seen),
                relay: Some("relay-9".to_string()),
            }),
            loopback(),
            Duration::from_secs(5),
        );
        let challenge = SamlChallenge::new(
            IdpRequest::Redirect(url::Url::parse("https://idp.example.com/sso").unwrap()),
            "token",
        )
        .with_relay_state("relay-9");

        let payload = engine
            .complete(challenge, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(payload.relay_state(), Some("relay-9"));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_expired_challenge_shortens_wait() {
        let engine = SsoEngine::new(Box::new(SilentSurface), loopback(), Duration::from_secs(60));
        let challenge = SamlChallenge::new(
            IdpRequest::Redirect(url::Url::parse("https://idp.example.com/sso").unwrap()),
            "token",
        )
        .with_validity(Duration::from_millis(50));

        let started = std::time::Instant::now();
        let err = engine
            .complete(challenge, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, GpError::SsoTimeout(_)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let engine = SsoEngine::new(Box::new(SilentSurface), loopback(), Duration::from_secs(5));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let challenge = SamlChallenge::new(IdpRequest::PostForm("<form/>".to_string()), "t");
        let err = engine.complete(challenge, &cancel).await.unwrap_err();
        assert!(matches!(err, GpError::Cancelled));
    }

    #[test]
    fn test_from_settings_binds_loopback() {
        let settings = SsoSettings {
            mode: SsoMode::Remote,
            callback_port: 29100,
            timeout_secs: 42,
            browser: None,
        };
        let engine = SsoEngine::from_settings(&settings);
        assert_eq!(engine.bind_addr, "127.0.0.1:29100".parse::<SocketAddr>().unwrap());
        assert_eq!(engine.timeout(), Duration::from_secs(42));
    }
}
