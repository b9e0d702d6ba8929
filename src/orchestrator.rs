//! Connection orchestration
//!
//! Drives one connection attempt from an unauthenticated client to a tunnel
//! handoff:
//!
//! ```text
//! Start -> Prelogin -> (DirectAuth | SsoFlow) -> CookieExchanged
//!       -> GatewayLogin -> ComplianceCheck -> ConfigReady -> HandoffToTunnel
//! ```
//!
//! Retry rules live here and nowhere else. An attempt gets one retry in
//! total: either a re-authentication on `AuthExpired` or a repeat of a failed
//! HIP submission, whichever comes first. A second retryable failure is
//! fatal. A single compliance pass when the gateway withholds configuration
//! for missing posture completes the pass rather than retrying it.
//! Everything else fails the attempt with the stage it failed in.

use crate::credentials::CredentialSource;
use crate::error::{ConnectError, DenyReason, ErrorKind, GpError, Stage, StageExt};
use crate::gp::gateway::{GatewayAuthResult, GatewayNegotiator, TunnelConfig};
use crate::gp::hip::{HipReport, HipReporter};
use crate::gp::http::GpHttp;
use crate::gp::portal::{GatewayDescriptor, PortalChallenge, PortalNegotiator};
use crate::identity::IdentityReference;
use crate::session::{SessionCookie, SessionStore};
use crate::sso::SsoEngine;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    Start,
    Prelogin,
    DirectAuth,
    SsoFlow,
    CookieExchanged,
    GatewayLogin,
    ComplianceCheck,
    ConfigReady,
    HandoffToTunnel,
    Failed(ErrorKind),
}

/// What the caller wants from one `connect`
#[derive(Debug, Clone)]
pub struct ConnectRequest {
    pub portal: String,
    pub identity: Option<IdentityReference>,
    pub hip_required: bool,
    /// Discard any stored session before starting
    pub clean_session: bool,
}

/// Everything the tunnel engine needs to bring the tunnel up
#[derive(Clone, Serialize)]
pub struct TunnelHandoff {
    pub gateway_host: String,
    pub bootstrap_token: String,
    pub options: TunnelOptions,
}

impl fmt::Debug for TunnelHandoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelHandoff")
            .field("gateway_host", &self.gateway_host)
            .field("bootstrap_token", &"<redacted>")
            .field("options", &self.options)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TunnelOptions {
    pub user_agent: String,
    pub client_os: String,
    pub os_version: String,
    /// Client certificate as given: a path or an unmodified PKCS#11 URI
    pub certificate: Option<String>,
    pub hip_wrapper: Option<PathBuf>,
    pub hip_report_submitted: bool,
    pub tunnel: TunnelConfig,
}

/// State of one attempt. Owns at most one session cookie reference and one
/// gateway selection; dropped when the attempt ends.
#[derive(Debug, Default)]
pub struct ConnectionAttempt {
    trail: Vec<ConnectState>,
    cookie: Option<SessionCookie>,
    gateway: Option<GatewayDescriptor>,
    hip_report: Option<HipReport>,
    cookie_exchanges: u32,
    reauthenticated: bool,
    retry_used: bool,
}

impl ConnectionAttempt {
    fn enter(&mut self, state: ConnectState) {
        debug!("Connection state: {:?}", state);
        self.trail.push(state);
    }

    pub fn state(&self) -> ConnectState {
        self.trail.last().copied().unwrap_or(ConnectState::Start)
    }

    /// Every state entered, in order (re-authentication repeats states)
    pub fn trail(&self) -> &[ConnectState] {
        &self.trail
    }

    pub fn reached(&self, state: ConnectState) -> bool {
        self.trail.contains(&state)
    }

    pub fn gateway(&self) -> Option<&GatewayDescriptor> {
        self.gateway.as_ref()
    }

    pub fn hip_report(&self) -> Option<&HipReport> {
        self.hip_report.as_ref()
    }

    /// Interactive logins performed (direct or SSO)
    pub fn cookie_exchanges(&self) -> u32 {
        self.cookie_exchanges
    }

    pub fn reauthenticated(&self) -> bool {
        self.reauthenticated
    }

    /// Whether the single retry this attempt is allowed has been spent
    pub fn retry_used(&self) -> bool {
        self.retry_used
    }
}

/// Result of [`Orchestrator::run`]
#[derive(Debug)]
pub struct AttemptOutcome {
    pub attempt: ConnectionAttempt,
    pub result: Result<TunnelHandoff, ConnectError>,
}

pub struct Orchestrator {
    http: Arc<GpHttp>,
    store: SessionStore,
    sso: SsoEngine,
    credentials: Box<dyn CredentialSource>,
    reporter: Arc<dyn HipReporter>,
    hip_wrapper: Option<PathBuf>,
}

impl Orchestrator {
    pub fn new(
        http: Arc<GpHttp>,
        store: SessionStore,
        sso: SsoEngine,
        credentials: Box<dyn CredentialSource>,
        reporter: Arc<dyn HipReporter>,
    ) -> Self {
        Self {
            http,
            store,
            sso,
            credentials,
            reporter,
            hip_wrapper: None,
        }
    }

    /// Wrapper path forwarded to the tunnel engine for periodic reports
    pub fn with_hip_wrapper(mut self, wrapper: Option<PathBuf>) -> Self {
        self.hip_wrapper = wrapper;
        self
    }

    pub async fn connect(
        &self,
        request: &ConnectRequest,
        cancel: &CancellationToken,
    ) -> Result<TunnelHandoff, ConnectError> {
        self.run(request, cancel).await.result
    }

    /// Run one attempt and keep its state trail
    pub async fn run(&self, request: &ConnectRequest, cancel: &CancellationToken) -> AttemptOutcome {
        let mut attempt = ConnectionAttempt::default();
        attempt.enter(ConnectState::Start);

        let result = self.drive(request, cancel, &mut attempt).await;
        match &result {
            Ok(handoff) => info!("Ready to hand off to tunnel via {}", handoff.gateway_host),
            Err(e) => {
                warn!("Attempt failed at {} ({:?})", e.stage, e.kind());
                if let Some(body) = e.source.raw_body() {
                    debug!("Raw response at {}: {}", e.stage, body);
                }
                attempt.enter(ConnectState::Failed(e.kind()));
            }
        }

        AttemptOutcome { attempt, result }
    }

    async fn drive(
        &self,
        request: &ConnectRequest,
        cancel: &CancellationToken,
        attempt: &mut ConnectionAttempt,
    ) -> Result<TunnelHandoff, ConnectError> {
        let mut portal = PortalNegotiator::new(Arc::clone(&self.http), &request.portal).at(Stage::Prelogin)?;

        let mut use_stored = true;
        if request.clean_session {
            info!("Clean session requested, discarding stored cookie for {}", portal.identity());
            if let Err(e) = self.store.invalidate(portal.identity()).await {
                warn!("Failed to clear stored session: {}", e);
            }
            use_stored = false;
        }

        loop {
            match self.pass(request, cancel, attempt, &mut portal, use_stored).await {
                Err(e) if e.kind() == ErrorKind::AuthExpired && !attempt.retry_used => {
                    attempt.retry_used = true;
                    attempt.reauthenticated = true;
                    if let Some(cookie) = attempt.cookie.take() {
                        match self.store.invalidate_token(&cookie.portal, &cookie.token).await {
                            Ok(true) => debug!("Invalidated expired session for {}", cookie.portal),
                            Ok(false) => debug!("Stored session already replaced"),
                            Err(err) => warn!("Failed to invalidate stored session: {}", err),
                        }
                    }
                    info!("re-authenticating after expired session ({})", e);
                    use_stored = false;
                    portal = PortalNegotiator::new(Arc::clone(&self.http), &request.portal).at(Stage::Prelogin)?;
                }
                other => return other,
            }
        }
    }

    /// One pass from session lookup to handoff
    async fn pass(
        &self,
        request: &ConnectRequest,
        cancel: &CancellationToken,
        attempt: &mut ConnectionAttempt,
        portal: &mut PortalNegotiator,
        use_stored: bool,
    ) -> Result<TunnelHandoff, ConnectError> {
        let stored = if use_stored {
            match self.store.load(portal.identity()).await {
                Ok(cookie) => cookie,
                Err(e) => {
                    warn!("Failed to read stored session: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let cookie = match stored {
            Some(cookie) => {
                info!("Reusing stored session for {}@{}", cookie.username, cookie.portal);
                cookie
            }
            None => self.authenticate(cancel, attempt, portal).await?,
        };
        attempt.cookie = Some(cookie.clone());
        attempt.enter(ConnectState::CookieExchanged);

        let portal_config = cancellable(cancel, portal.fetch_config(&cookie))
            .await
            .at(Stage::PortalConfig)?;
        portal.finish();

        let gateway = portal_config
            .select_gateway()
            .cloned()
            .ok_or_else(|| GpError::PolicyDenied {
                reason: DenyReason::Other,
                message: "no gateway is available for this user".to_string(),
            })
            .at(Stage::PortalConfig)?;
        info!("Selected gateway {} ({}, priority {})", gateway.host, gateway.name, gateway.priority);
        if let Err(e) = self.store.record_gateway(portal.identity(), &gateway.host).await {
            debug!("Failed to record gateway: {}", e);
        }
        attempt.gateway = Some(gateway.clone());

        attempt.enter(ConnectState::GatewayLogin);
        let mut negotiator =
            GatewayNegotiator::new(Arc::clone(&self.http), &gateway.host, Arc::clone(&self.reporter))
                .at(Stage::GatewayLogin)?;
        let auth = cancellable(
            cancel,
            negotiator.login(&cookie, Some(&portal_config), self.credentials.as_ref()),
        )
        .await
        .at(Stage::GatewayLogin)?;

        attempt.enter(ConnectState::ComplianceCheck);
        let hip_required = request.hip_required || portal_config.hip_collection;
        if hip_required {
            self.comply(cancel, attempt, &mut negotiator, &auth).await?;
        }

        let tunnel = match cancellable(cancel, negotiator.fetch_tunnel_config(&auth, hip_required)).await {
            Ok(tunnel) => tunnel,
            Err(e) if e.is_posture_denial() && !negotiator.hip_acknowledged() => {
                info!("Gateway withheld configuration pending a HIP report");
                self.comply(cancel, attempt, &mut negotiator, &auth).await?;
                cancellable(cancel, negotiator.fetch_tunnel_config(&auth, true))
                    .await
                    .at(Stage::ConfigFetch)?
            }
            Err(e) => return Err(ConnectError::new(Stage::ConfigFetch, e)),
        };
        attempt.enter(ConnectState::ConfigReady);

        let params = self.http.params();
        let handoff = TunnelHandoff {
            gateway_host: negotiator.host().to_string(),
            bootstrap_token: auth.bootstrap_token.clone(),
            options: TunnelOptions {
                user_agent: params.user_agent.clone(),
                client_os: params.client_os.clone(),
                os_version: params.os_version.clone(),
                certificate: request.identity.as_ref().map(|id| id.forward_value().into_owned()),
                hip_wrapper: self.hip_wrapper.clone(),
                hip_report_submitted: negotiator.hip_acknowledged(),
                tunnel,
            },
        };
        attempt.enter(ConnectState::HandoffToTunnel);
        Ok(handoff)
    }

    /// Prelogin and interactive login; stores the new cookie
    async fn authenticate(
        &self,
        cancel: &CancellationToken,
        attempt: &mut ConnectionAttempt,
        portal: &mut PortalNegotiator,
    ) -> Result<SessionCookie, ConnectError> {
        attempt.enter(ConnectState::Prelogin);
        let challenge = cancellable(cancel, portal.prelogin()).await.at(Stage::Prelogin)?;

        let cookie = match challenge {
            PortalChallenge::Direct(direct) => {
                attempt.enter(ConnectState::DirectAuth);
                let credentials = self
                    .credentials
                    .credentials(portal.identity(), &direct)
                    .at(Stage::CookieExchange)?;
                cancellable(cancel, portal.complete_direct(&credentials))
                    .await
                    .at(Stage::CookieExchange)?
            }
            PortalChallenge::SamlRedirect(saml) => {
                attempt.enter(ConnectState::SsoFlow);
                let payload = self.sso.complete(saml, cancel).await.at(Stage::Sso)?;
                cancellable(cancel, portal.exchange_assertion(payload))
                    .await
                    .at(Stage::CookieExchange)?
            }
        };
        attempt.cookie_exchanges += 1;

        if let Err(e) = self.store.save(&cookie).await {
            warn!("Failed to store session: {}", e);
        }
        Ok(cookie)
    }

    /// HIP generation and upload, repeated once on submission failure if the
    /// attempt's retry is still unspent
    async fn comply(
        &self,
        cancel: &CancellationToken,
        attempt: &mut ConnectionAttempt,
        negotiator: &mut GatewayNegotiator,
        auth: &GatewayAuthResult,
    ) -> Result<(), ConnectError> {
        let report = match cancellable(cancel, negotiator.ensure_compliance(true, auth)).await {
            Ok(report) => report,
            Err(e) if e.kind() == ErrorKind::HipSubmissionFailed && !attempt.retry_used => {
                attempt.retry_used = true;
                warn!("HIP submission failed ({}), retrying once", e);
                cancellable(cancel, negotiator.ensure_compliance(true, auth))
                    .await
                    .at(Stage::ComplianceCheck)?
            }
            Err(e) => return Err(ConnectError::new(Stage::ComplianceCheck, e)),
        };
        attempt.hip_report = report;
        Ok(())
    }
}

/// Abandon `fut` as soon as `cancel` fires
async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T, GpError>>,
) -> Result<T, GpError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(GpError::Cancelled),
        result = fut => result,
    }
}
