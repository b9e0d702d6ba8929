//! gp-connect - GlobalProtect authentication and session establishment
//!
//! Takes a client from nothing to a tunnel-ready state: portal prelogin,
//! direct or SAML authentication, gateway login, HIP compliance and tunnel
//! configuration. The tunnel itself is left to an external engine.

pub mod config;
pub mod credentials;
pub mod diagnostics;
pub mod error;
pub mod gp;
pub mod identity;
pub mod orchestrator;
pub mod session;
pub mod sso;

pub use config::Config;
pub use error::{ConnectError, ErrorKind, GpError, Stage};
pub use identity::IdentityReference;
pub use orchestrator::{ConnectRequest, ConnectState, Orchestrator, TunnelHandoff};
pub use session::SessionStore;
