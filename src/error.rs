//! Error taxonomy for portal, gateway and SSO operations
//!
//! Components return [`GpError`], always the most specific kind they can
//! name. The orchestrator attaches the [`Stage`] and returns
//! [`ConnectError`], so every failure a user sees says where it happened.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Protocol stage a failure is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Prelogin,
    Sso,
    CookieExchange,
    PortalConfig,
    GatewayLogin,
    ComplianceCheck,
    ConfigFetch,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Prelogin => "prelogin",
            Stage::Sso => "SSO",
            Stage::CookieExchange => "cookie exchange",
            Stage::PortalConfig => "portal config",
            Stage::GatewayLogin => "gateway login",
            Stage::ComplianceCheck => "compliance check",
            Stage::ConfigFetch => "config fetch",
        };
        f.write_str(name)
    }
}

/// Why a server withheld configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    /// Posture report missing or rejected
    PostureRequired,
    Other,
}

/// Field-less view of [`GpError`] used for retry decisions and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Protocol,
    UnsupportedAuthMode,
    AuthRejected,
    AssertionRejected,
    SsoTimeout,
    Cancelled,
    AuthExpired,
    PolicyDenied,
    HipSubmissionFailed,
    GatewayUnreachable,
    MalformedCallback,
    IdentityUnavailable,
}

#[derive(Error, Debug)]
pub enum GpError {
    #[error("network error: {0}")]
    Transport(String),

    /// Body kept for DEBUG output; not part of the message
    #[error("unexpected response: {reason}")]
    Protocol { reason: String, body: String },

    #[error("unsupported authentication mode: {0}")]
    UnsupportedAuthMode(String),

    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("assertion rejected by portal: {0}")]
    AssertionRejected(String),

    #[error("no SSO result within {}s", .0.as_secs())]
    SsoTimeout(Duration),

    #[error("cancelled")]
    Cancelled,

    #[error("session expired: {0}")]
    AuthExpired(String),

    #[error("denied by policy: {message}")]
    PolicyDenied { reason: DenyReason, message: String },

    #[error("HIP report submission failed: {0}")]
    HipSubmissionFailed(String),

    #[error("gateway unreachable: {0}")]
    GatewayUnreachable(String),

    #[error("malformed SSO callback: {0}")]
    MalformedCallback(String),

    #[error("client identity unavailable: {0}")]
    IdentityUnavailable(String),
}

impl GpError {
    pub fn protocol(reason: impl Into<String>, body: impl Into<String>) -> Self {
        GpError::Protocol {
            reason: reason.into(),
            body: body.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            GpError::Transport(_) => ErrorKind::Transport,
            GpError::Protocol { .. } => ErrorKind::Protocol,
            GpError::UnsupportedAuthMode(_) => ErrorKind::UnsupportedAuthMode,
            GpError::AuthRejected(_) => ErrorKind::AuthRejected,
            GpError::AssertionRejected(_) => ErrorKind::AssertionRejected,
            GpError::SsoTimeout(_) => ErrorKind::SsoTimeout,
            GpError::Cancelled => ErrorKind::Cancelled,
            GpError::AuthExpired(_) => ErrorKind::AuthExpired,
            GpError::PolicyDenied { .. } => ErrorKind::PolicyDenied,
            GpError::HipSubmissionFailed(_) => ErrorKind::HipSubmissionFailed,
            GpError::GatewayUnreachable(_) => ErrorKind::GatewayUnreachable,
            GpError::MalformedCallback(_) => ErrorKind::MalformedCallback,
            GpError::IdentityUnavailable(_) => ErrorKind::IdentityUnavailable,
        }
    }

    /// True for a policy denial caused by missing posture data
    pub fn is_posture_denial(&self) -> bool {
        matches!(
            self,
            GpError::PolicyDenied {
                reason: DenyReason::PostureRequired,
                ..
            }
        )
    }

    pub fn raw_body(&self) -> Option<&str> {
        match self {
            GpError::Protocol { body, .. } => Some(body),
            _ => None,
        }
    }
}

/// A failed connection attempt, attributed to the stage it failed in
#[derive(Error, Debug)]
#[error("{stage} failed: {source}")]
pub struct ConnectError {
    pub stage: Stage,
    #[source]
    pub source: GpError,
}

impl ConnectError {
    pub fn new(stage: Stage, source: GpError) -> Self {
        Self { stage, source }
    }

    pub fn kind(&self) -> ErrorKind {
        self.source.kind()
    }
}

/// Attach a stage to a component result
pub trait StageExt<T> {
    fn at(self, stage: Stage) -> Result<T, ConnectError>;
}

impl<T> StageExt<T> for Result<T, GpError> {
    fn at(self, stage: Stage) -> Result<T, ConnectError> {
        self.map_err(|source| ConnectError::new(stage, source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_error_names_stage() {
        let err = ConnectError::new(
            Stage::CookieExchange,
            GpError::AssertionRejected("audience mismatch".to_string()),
        );
        assert_eq!(
            err.to_string(),
            "cookie exchange failed: assertion rejected by portal: audience mismatch"
        );
        assert_eq!(err.kind(), ErrorKind::AssertionRejected);
    }

    #[test]
    fn test_protocol_error_hides_body() {
        let err = GpError::protocol("not XML", "<html>secret page</html>");
        assert_eq!(err.to_string(), "unexpected response: not XML");
        assert_eq!(err.raw_body(), Some("<html>secret page</html>"));
    }

    #[test]
    fn test_sso_timeout_display() {
        let err = GpError::SsoTimeout(Duration::from_secs(90));
        assert_eq!(err.to_string(), "no SSO result within 90s");
        assert_eq!(err.kind(), ErrorKind::SsoTimeout);
    }

    #[test]
    fn test_posture_denial_detection() {
        let posture = GpError::PolicyDenied {
            reason: DenyReason::PostureRequired,
            message: "HIP_REQUIRED".to_string(),
        };
        let other = GpError::PolicyDenied {
            reason: DenyReason::Other,
            message: "client role".to_string(),
        };
        assert!(posture.is_posture_denial());
        assert!(!other.is_posture_denial());
        assert!(!GpError::AuthExpired("x".into()).is_posture_denial());
    }

    #[test]
    fn test_stage_ext() {
        let res: Result<(), GpError> = Err(GpError::Cancelled);
        let err = res.at(Stage::Sso).unwrap_err();
        assert_eq!(err.stage, Stage::Sso);
        assert_eq!(err.to_string(), "SSO failed: cancelled");
    }
}
