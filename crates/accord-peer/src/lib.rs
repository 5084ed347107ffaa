//! Accord endpoint over WebSocket.
//!
//! Bundles a [`WsTransport`], the peer configuration file and the built-in
//! [`telemetry`] capabilities used by the `accord-peer` binary and the demo.

pub mod config;
pub mod telemetry;
pub mod transport;
pub mod wire;

pub use config::{PeerConfig, Role};
pub use transport::WsTransport;
