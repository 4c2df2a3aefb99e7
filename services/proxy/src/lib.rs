//! Relay Mesh dynamic proxy
//!
//! Resolves a service name from the request path on every call, picks a
//! healthy instance through the local discovery cache, and forwards the
//! request under a per-destination circuit breaker and deadline. Bodies
//! stream in both directions; headers are dispatched as soon as the
//! upstream answers.

use anyhow::Result;

pub mod breaker;
pub mod config;
pub mod forward;
pub mod server;

pub use breaker::{BreakerRegistry, BreakerState, CircuitBreaker};
pub use config::ProxyConfig;
pub use server::ProxyServer;

/// Start the proxy server and run until shutdown
pub async fn start_server(config: ProxyConfig) -> Result<()> {
    let server = ProxyServer::new(config)?;
    server.start().await
}
