//! Loopback endpoint for the terminal step of a browser SSO flow
//!
//! The listener is bound before anything is shown to the user, serves at
//! most one terminal submission on `/callback`, and releases its socket on
//! every exit path. Identity providers finish either with a form POST
//! (`SAMLResponse` in the body) or with a redirect carrying the same fields
//! in the query string; a [`CallbackAdapter`] per binding turns either into
//! an [`AssertionPayload`].

use crate::error::GpError;
use axum::{
    Router,
    extract::{Form, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use flate2::read::DeflateDecoder;
use std::collections::HashMap;
use std::fmt;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub const CALLBACK_PATH: &str = "/callback";

/// Encoded SAMLResponse size limit
const MAX_ENCODED_SIZE: usize = 512 * 1024;

/// Inflated redirect-binding payload limit
const MAX_INFLATED_SIZE: u64 = 256 * 1024;

/// Grace period for in-flight responses when the listener stops
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

const DONE_PAGE: &str = "<html><body><p>Authentication complete. You can close this window.</p></body></html>";
const FAILED_PAGE: &str = "<html><body><p>Authentication response was incomplete. Return to the terminal for details.</p></body></html>";
const DUPLICATE_PAGE: &str = "<html><body><p>This sign-in has already completed.</p></body></html>";

/// How the identity provider delivered the result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackBinding {
    /// Form POST with the fields in the body
    Post,
    /// GET with the fields in the query string
    Redirect,
}

/// Assertion handed back by the identity provider. Consumed once by the
/// cookie exchange; neither `Clone` nor serialisable.
pub struct AssertionPayload {
    bytes: Vec<u8>,
    relay_state: Option<String>,
    binding: CallbackBinding,
}

impl AssertionPayload {
    pub fn new(bytes: Vec<u8>, relay_state: Option<String>, binding: CallbackBinding) -> Self {
        Self {
            bytes,
            relay_state,
            binding,
        }
    }

    pub fn relay_state(&self) -> Option<&str> {
        self.relay_state.as_deref()
    }

    pub fn binding(&self) -> CallbackBinding {
        self.binding
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Base64 of the assertion document, as the exchange endpoint expects it
    pub fn encoded(&self) -> String {
        BASE64.encode(&self.bytes)
    }

    pub fn into_parts(self) -> (Vec<u8>, Option<String>) {
        (self.bytes, self.relay_state)
    }
}

impl fmt::Debug for AssertionPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssertionPayload")
            .field("len", &self.bytes.len())
            .field("relay_state", &self.relay_state)
            .field("binding", &self.binding)
            .finish()
    }
}

/// Provider-specific decoding of one callback submission
pub trait CallbackAdapter: Send + Sync {
    fn binding(&self) -> CallbackBinding;

    fn extract(&self, fields: &HashMap<String, String>) -> Result<AssertionPayload, GpError>;
}

/// SAML HTTP-POST binding: base64 `SAMLResponse`, optional `RelayState`
pub struct PostBindingAdapter;

impl CallbackAdapter for PostBindingAdapter {
    fn binding(&self) -> CallbackBinding {
        CallbackBinding::Post
    }

    fn extract(&self, fields: &HashMap<String, String>) -> Result<AssertionPayload, GpError> {
        let bytes = decode_saml_response(fields)?;
        Ok(AssertionPayload::new(
            bytes,
            relay_state(fields),
            CallbackBinding::Post,
        ))
    }
}

/// SAML HTTP-Redirect binding: base64 `SAMLResponse` in the query string,
/// DEFLATE-compressed by most providers
pub struct RedirectBindingAdapter;

impl CallbackAdapter for RedirectBindingAdapter {
    fn binding(&self) -> CallbackBinding {
        CallbackBinding::Redirect
    }

    fn extract(&self, fields: &HashMap<String, String>) -> Result<AssertionPayload, GpError> {
        let decoded = decode_saml_response(fields)?;
        let bytes = inflate(&decoded).unwrap_or(decoded);
        Ok(AssertionPayload::new(
            bytes,
            relay_state(fields),
            CallbackBinding::Redirect,
        ))
    }
}

pub fn default_adapters() -> Vec<Arc<dyn CallbackAdapter>> {
    vec![Arc::new(PostBindingAdapter), Arc::new(RedirectBindingAdapter)]
}

fn decode_saml_response(fields: &HashMap<String, String>) -> Result<Vec<u8>, GpError> {
    let encoded = fields
        .get("SAMLResponse")
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| GpError::MalformedCallback("missing SAMLResponse".to_string()))?;

    if encoded.len() > MAX_ENCODED_SIZE {
        return Err(GpError::MalformedCallback(format!(
            "SAMLResponse exceeds {} bytes",
            MAX_ENCODED_SIZE
        )));
    }

    let compact: String = encoded.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = BASE64
        .decode(compact)
        .map_err(|e| GpError::MalformedCallback(format!("SAMLResponse is not base64: {}", e)))?;

    if bytes.is_empty() {
        return Err(GpError::MalformedCallback("empty SAMLResponse".to_string()));
    }
    Ok(bytes)
}

fn relay_state(fields: &HashMap<String, String>) -> Option<String> {
    fields.get("RelayState").filter(|s| !s.is_empty()).cloned()
}

/// Raw DEFLATE decode; `None` if the data is not a deflate stream of XML
fn inflate(data: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::new();
    DeflateDecoder::new(data)
        .take(MAX_INFLATED_SIZE)
        .read_to_end(&mut out)
        .ok()?;
    let looks_like_xml = out
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'<');
    looks_like_xml.then_some(out)
}

type ResultSender = oneshot::Sender<Result<AssertionPayload, GpError>>;

#[derive(Clone)]
struct ListenerState {
    slot: Arc<Mutex<Option<ResultSender>>>,
    adapters: Arc<Vec<Arc<dyn CallbackAdapter>>>,
    launch_page: Option<Arc<String>>,
}

impl ListenerState {
    fn adapter_for(&self, binding: CallbackBinding) -> Option<&Arc<dyn CallbackAdapter>> {
        self.adapters.iter().find(|a| a.binding() == binding)
    }
}

/// Single-use SSO callback endpoint
pub struct CallbackListener {
    addr: SocketAddr,
    result_rx: Option<oneshot::Receiver<Result<AssertionPayload, GpError>>>,
    shutdown: CancellationToken,
    server: Option<JoinHandle<()>>,
}

impl CallbackListener {
    /// Bind and start serving. When this returns the socket is already
    /// accepting connections.
    pub async fn bind(
        addr: SocketAddr,
        adapters: Vec<Arc<dyn CallbackAdapter>>,
        launch_page: Option<String>,
    ) -> Result<Self, GpError> {
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            GpError::Transport(format!("Failed to bind SSO callback listener on {}: {}", addr, e))
        })?;
        let addr = listener
            .local_addr()
            .map_err(|e| GpError::Transport(format!("SSO callback listener address: {}", e)))?;

        let (result_tx, result_rx) = oneshot::channel();
        let state = ListenerState {
            slot: Arc::new(Mutex::new(Some(result_tx))),
            adapters: Arc::new(adapters),
            launch_page: launch_page.map(Arc::new),
        };

        let app = Router::new()
            .route("/", get(handle_launch))
            .route(CALLBACK_PATH, get(handle_redirect).post(handle_post))
            .with_state(state);

        let shutdown = CancellationToken::new();
        let signal = shutdown.clone();
        let server = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(signal.cancelled_owned());
            if let Err(e) = serve.await {
                warn!("SSO callback listener stopped with error: {}", e);
            }
        });

        info!("SSO callback listener ready on {}", addr);
        Ok(Self {
            addr,
            result_rx: Some(result_rx),
            shutdown,
            server: Some(server),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn callback_url(&self) -> String {
        format!("http://{}{}", self.addr, CALLBACK_PATH)
    }

    /// Page serving the provider's auto-submit form, when one was given
    pub fn launch_url(&self) -> String {
        format!("http://{}/", self.addr)
    }

    /// Wait for the terminal submission. The listener is stopped and its
    /// socket released before this returns, whatever the outcome.
    pub async fn await_result(
        mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<AssertionPayload, GpError> {
        let outcome = match self.result_rx.take() {
            Some(rx) => {
                tokio::select! {
                    received = rx => received.unwrap_or_else(|_| {
                        Err(GpError::MalformedCallback("listener stopped before a result arrived".to_string()))
                    }),
                    _ = tokio::time::sleep(timeout) => Err(GpError::SsoTimeout(timeout)),
                    _ = cancel.cancelled() => Err(GpError::Cancelled),
                }
            }
            None => Err(GpError::MalformedCallback(
                "listener result already taken".to_string(),
            )),
        };

        self.close().await;
        outcome
    }

    /// Stop serving and wait until the socket is released
    pub async fn close(&mut self) {
        self.shutdown.cancel();
        if let Some(mut server) = self.server.take() {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await.is_err() {
                debug!("SSO callback listener did not drain in time, aborting");
                server.abort();
                let _ = server.await;
            }
            debug!("SSO callback listener on {} closed", self.addr);
        }
    }
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(server) = self.server.take() {
            server.abort();
        }
    }
}

async fn handle_launch(State(state): State<ListenerState>) -> Response {
    match &state.launch_page {
        Some(page) => Html(page.as_str().to_owned()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn handle_redirect(
    State(state): State<ListenerState>,
    Query(fields): Query<HashMap<String, String>>,
) -> Response {
    deliver(&state, CallbackBinding::Redirect, &fields)
}

async fn handle_post(
    State(state): State<ListenerState>,
    Form(fields): Form<HashMap<String, String>>,
) -> Response {
    deliver(&state, CallbackBinding::Post, &fields)
}

fn deliver(
    state: &ListenerState,
    binding: CallbackBinding,
    fields: &HashMap<String, String>,
) -> Response {
    let sender = state
        .slot
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take();

    let Some(sender) = sender else {
        warn!("Callback submission discarded: SSO flow already completed");
        return (StatusCode::CONFLICT, Html(DUPLICATE_PAGE)).into_response();
    };

    let result = match state.adapter_for(binding) {
        Some(adapter) => adapter.extract(fields),
        None => Err(GpError::MalformedCallback(format!(
            "no adapter for {:?} binding",
            binding
        ))),
    };

    let response = match &result {
        Ok(payload) => {
            info!(
                "SSO callback received ({:?} binding, {} bytes)",
                binding,
                payload.len()
            );
            (StatusCode::OK, Html(DONE_PAGE)).into_response()
        }
        Err(e) => {
            warn!("SSO callback rejected: {}", e);
            (StatusCode::BAD_REQUEST, Html(FAILED_PAGE)).into_response()
        }
    };

    if sender.send(result).is_err() {
        debug!("SSO result arrived after the waiter gave up");
    }
    response
}
