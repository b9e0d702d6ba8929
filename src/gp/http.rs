//! HTTP transport shared by the portal and gateway negotiators
//!
//! Every request is a form POST carrying the client identification
//! parameters the GlobalProtect servers expect. Network failures are retried
//! with a bounded exponential backoff; everything else is returned to the
//! caller for classification.

use crate::error::GpError;
use crate::identity::IdentityReference;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Header the servers use to report authentication and policy status
pub const PAN_STATUS_HEADER: &str = "x-private-pan-globalprotect";

const MAX_BACKOFF: Duration = Duration::from_secs(8);

/// Client identification sent with every request
#[derive(Debug, Clone)]
pub struct ClientParams {
    pub user_agent: String,
    pub client_os: String,
    pub os_version: String,
    pub client_version: String,
    pub computer: String,
}

impl ClientParams {
    pub fn new(user_agent: &str, client_os: &str, client_version: &str) -> Self {
        Self {
            user_agent: user_agent.to_string(),
            client_os: client_os.to_string(),
            os_version: os_version_string(),
            client_version: client_version.to_string(),
            computer: computer_name(),
        }
    }

    pub fn with_os_version(mut self, os_version: Option<&str>) -> Self {
        if let Some(v) = os_version {
            self.os_version = v.to_string();
        }
        self
    }

    pub fn with_computer(mut self, computer: &str) -> Self {
        self.computer = computer.to_string();
        self
    }

    pub fn to_params(&self) -> Vec<(&'static str, String)> {
        vec![
            ("clientos", self.client_os.clone()),
            ("os-version", self.os_version.clone()),
            ("clientVer", "4100".to_string()),
            ("app-version", self.client_version.clone()),
            ("computer", self.computer.clone()),
        ]
    }
}

/// Bounded exponential backoff for network failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            attempts: 1,
            base_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (0-based): base * 2^retry, capped
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32 << retry.min(16);
        self.base_delay.saturating_mul(factor).min(MAX_BACKOFF)
    }
}

/// Raw server reply, classified by the negotiators
#[derive(Debug, Clone)]
pub struct GpResponse {
    pub status: StatusCode,
    pub pan_status: Option<String>,
    pub body: String,
}

impl GpResponse {
    /// Server says the presented credential or cookie is not valid
    pub fn is_auth_failure(&self) -> bool {
        self.status == StatusCode::UNAUTHORIZED
            || self
                .pan_status
                .as_deref()
                .is_some_and(|s| s.to_ascii_lowercase().starts_with("auth-failed"))
    }

    /// Server withholds the response until a HIP report is on file
    pub fn is_hip_required(&self) -> bool {
        self.pan_status
            .as_deref()
            .is_some_and(|s| s.eq_ignore_ascii_case("HIP_REQUIRED"))
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn looks_like_xml(&self) -> bool {
        self.body.trim_start().starts_with('<')
    }
}

pub struct GpHttp {
    client: Client,
    params: ClientParams,
    retry: RetryPolicy,
}

impl GpHttp {
    /// Build the transport. A file-backed client identity is read here, at
    /// first use; a hardware token reference is left to the tunnel engine.
    pub fn new(
        params: ClientParams,
        retry: RetryPolicy,
        request_timeout: Duration,
        identity: Option<&IdentityReference>,
    ) -> Result<Self, GpError> {
        let mut builder = Client::builder()
            .user_agent(params.user_agent.clone())
            .cookie_store(true)
            .timeout(request_timeout)
            .connect_timeout(request_timeout.min(Duration::from_secs(10)));

        match identity {
            Some(IdentityReference::FilePath(path)) => {
                let pem = std::fs::read(path).map_err(|e| {
                    GpError::IdentityUnavailable(format!("{}: {}", path.display(), e))
                })?;
                let identity = reqwest::Identity::from_pem(&pem).map_err(|e| {
                    GpError::IdentityUnavailable(format!("{}: {}", path.display(), e))
                })?;
                debug!("Using client certificate from {}", path.display());
                builder = builder.identity(identity);
            }
            Some(token @ IdentityReference::HardwareTokenUri(_)) => {
                info!("Hardware token {} is forwarded to the tunnel engine", token);
            }
            None => {}
        }

        let client = builder
            .build()
            .map_err(|e| GpError::Transport(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            params,
            retry,
        })
    }

    pub fn params(&self) -> &ClientParams {
        &self.params
    }

    /// POST a form, retrying only when the request failed on the network
    pub async fn post_form(&self, url: &str, form: &[(&str, String)]) -> Result<GpResponse, GpError> {
        let attempts = self.retry.attempts.max(1);
        let mut retry = 0;

        loop {
            match self.client.post(url).form(form).send().await {
                Ok(response) => {
                    let status = response.status();
                    let pan_status = response
                        .headers()
                        .get(PAN_STATUS_HEADER)
                        .and_then(|v| v.to_str().ok())
                        .map(|s| s.to_string());
                    let body = response
                        .text()
                        .await
                        .map_err(|e| GpError::Transport(format!("Failed to read response: {}", e)))?;
                    debug!("POST {} -> {} ({} bytes)", url, status, body.len());
                    return Ok(GpResponse {
                        status,
                        pan_status,
                        body,
                    });
                }
                Err(e) if (e.is_connect() || e.is_timeout()) && retry + 1 < attempts => {
                    let delay = self.retry.delay_for(retry);
                    warn!(
                        "Request to {} failed ({}), retrying in {:?} ({}/{})",
                        url,
                        e,
                        delay,
                        retry + 1,
                        attempts - 1
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
                Err(e) => {
                    warn!("Network error: {}", e);
                    return Err(GpError::Transport(e.to_string()));
                }
            }
        }
    }
}

/// Base URL for a server given as `host`, `host:port` or a full URL
pub fn normalize_server(server: &str) -> Result<String, GpError> {
    let server = server.trim().trim_end_matches('/');
    if server.is_empty() {
        return Err(GpError::Transport("empty server address".to_string()));
    }

    let with_scheme = if server.starts_with("https://") || server.starts_with("http://") {
        server.to_string()
    } else {
        format!("https://{}", server)
    };

    let url = url::Url::parse(&with_scheme)
        .map_err(|e| GpError::Transport(format!("invalid server address {}: {}", server, e)))?;
    let host = url
        .host_str()
        .ok_or_else(|| GpError::Transport(format!("no host in server address {}", server)))?;

    Ok(match url.port() {
        Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
        None => format!("{}://{}", url.scheme(), host),
    })
}

/// Host part of a base URL, as sent in `server`/`portal` parameters
pub fn remove_url_scheme(url: &str) -> &str {
    url.strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url)
}

/// Pretty OS name from /etc/os-release, falling back to the target OS
pub fn os_version_string() -> String {
    std::fs::read_to_string("/etc/os-release")
        .ok()
        .and_then(|content| {
            content.lines().find_map(|line| {
                line.strip_prefix("PRETTY_NAME=")
                    .map(|v| v.trim_matches('"').to_string())
            })
        })
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| std::env::consts::OS.to_string())
}

pub fn computer_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}
