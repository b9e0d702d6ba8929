//! GlobalProtect protocol: portal and gateway negotiation, HIP reporting

pub mod gateway;
pub mod hip;
pub mod http;
pub mod portal;

pub use gateway::{GatewayAuthResult, GatewayNegotiator, TunnelConfig};
pub use http::{ClientParams, GpHttp, RetryPolicy};
pub use portal::{PortalChallenge, PortalConfig, PortalNegotiator};
