//! Relay Mesh service registry
//!
//! Authoritative catalog of service instances and their health:
//! - instance store with a strictly monotonic version counter
//! - heartbeat/TTL reaper and active health probes
//! - ordered change feed with pull and push delivery
//! - JSON HTTP API plus a WebSocket push channel

use anyhow::Result;

pub mod config;
pub mod feed;
pub mod handlers;
pub mod reaper;
pub mod server;
pub mod store;
pub mod websocket;

pub use config::RegistryConfig;
pub use server::RegistryServer;
pub use store::{InstanceStore, MemoryInstanceStore};

/// Start the registry server and run until shutdown
pub async fn start_server(config: RegistryConfig) -> Result<()> {
    let server = RegistryServer::new(config);
    server.start().await
}
