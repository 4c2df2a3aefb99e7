//! Registry server: router assembly and lifecycle

use anyhow::Result;
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::config::RegistryConfig;
use crate::feed::ChangeFeed;
use crate::handlers::{self, AppState};
use crate::reaper::HealthReaper;
use crate::store::{InstanceStore, MemoryInstanceStore};
use crate::websocket;

/// Build the shared state: store wired into a fresh change feed
#[must_use]
pub fn build_state(config: &RegistryConfig) -> AppState {
    let feed = Arc::new(ChangeFeed::new(config.feed.retention, config.feed.push_capacity));
    let store: Arc<dyn InstanceStore> =
        Arc::new(MemoryInstanceStore::new(Arc::clone(&feed)));
    AppState {
        store,
        feed,
        started_at: Instant::now(),
    }
}

/// Build the registry router over `state`
pub fn build_router(state: AppState, config: &RegistryConfig) -> Router {
    Router::new()
        .route("/api/registry/register", post(handlers::register))
        .route("/api/registry/deregister/:instance_id", post(handlers::deregister))
        .route("/api/registry/heartbeat", post(handlers::heartbeat))
        .route("/api/registry/discover/:service_name", get(handlers::discover))
        .route("/api/registry/instance/:service_name", get(handlers::pick_instance))
        .route("/api/registry/services", get(handlers::list_services))
        .route("/api/registry/instances", get(handlers::list_instances))
        .route("/api/registry/changes", get(handlers::changes))
        .route("/ws/registry", get(websocket::ws_handler))
        .route("/health", get(handlers::health))
        .with_state(state)
        .layer(TimeoutLayer::new(Duration::from_secs(config.server.timeout_seconds)))
        .layer(TraceLayer::new_for_http())
}

/// Registry server
pub struct RegistryServer {
    config: RegistryConfig,
}

impl RegistryServer {
    #[must_use]
    pub fn new(config: RegistryConfig) -> Self {
        Self { config }
    }

    /// Bind, serve, and run the reaper until a termination signal
    pub async fn start(self) -> Result<()> {
        let addr: SocketAddr = self
            .config
            .server_address()
            .parse()
            .map_err(|e| anyhow::anyhow!("invalid server address '{}': {e}", self.config.server_address()))?;

        let state = build_state(&self.config);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut tasks = JoinSet::new();
        let reaper = HealthReaper::new(Arc::clone(&state.store), self.config.health.clone())?;
        reaper.spawn(&mut tasks, shutdown_rx);

        let feed = Arc::clone(&state.feed);
        let app = build_router(state, &self.config);

        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to bind registry listener to {}: {}", addr, e);
                return Err(e.into());
            }
        };
        info!("Registry listening on {}", addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        // Stop background work, then give push subscribers a grace period
        // to drain before their channels close.
        let _ = shutdown_tx.send(true);
        info!(
            subscribers = feed.subscriber_count(),
            "Draining push subscribers"
        );
        tokio::time::sleep(Duration::from_secs(self.config.feed.drain_seconds)).await;
        feed.close();
        while tasks.join_next().await.is_some() {}
        info!("Registry stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
}
