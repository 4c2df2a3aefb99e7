//! In-process registry harness for integration tests

use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::debug;

use service_registry::config::RegistryConfig;
use service_registry::handlers::AppState;
use service_registry::reaper::HealthReaper;
use service_registry::server::{build_router, build_state};

/// A registry serving on an ephemeral local port
pub struct RegistryHarness {
    pub addr: SocketAddr,
    /// Direct access to the store and feed for assertions
    pub state: AppState,
    shutdown: watch::Sender<bool>,
    server: JoinHandle<()>,
    background: JoinSet<()>,
}

impl RegistryHarness {
    /// Spawn with defaults and no reaper
    pub async fn spawn() -> Self {
        Self::spawn_with(RegistryConfig::default(), false).await
    }

    /// Spawn on a specific local port, e.g. to simulate a registry that
    /// becomes reachable after the caller started
    pub async fn spawn_on(port: u16) -> Self {
        Self::spawn_inner(RegistryConfig::default(), false, format!("127.0.0.1:{port}")).await
    }

    /// Spawn with explicit config; `with_reaper` also starts the sweep
    /// and probe loops
    pub async fn spawn_with(config: RegistryConfig, with_reaper: bool) -> Self {
        Self::spawn_inner(config, with_reaper, "127.0.0.1:0".to_string()).await
    }

    async fn spawn_inner(config: RegistryConfig, with_reaper: bool, bind: String) -> Self {
        let state = build_state(&config);
        let (shutdown, shutdown_rx) = watch::channel(false);

        let mut background = JoinSet::new();
        if with_reaper {
            let reaper = HealthReaper::new(std::sync::Arc::clone(&state.store), config.health.clone())
                .expect("reaper");
            reaper.spawn(&mut background, shutdown_rx.clone());
        }

        let app = build_router(state.clone(), &config);
        let listener = TcpListener::bind(&bind).await.expect("bind harness port");
        let addr = listener.local_addr().expect("local addr");

        let mut serve_shutdown = shutdown_rx;
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = serve_shutdown.changed().await;
                })
                .await
                .expect("registry harness serve");
        });

        debug!(%addr, "Registry harness listening");
        Self {
            addr,
            state,
            shutdown,
            server,
            background,
        }
    }

    /// HTTP base URL of the harness
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// WebSocket URL of the push channel
    #[must_use]
    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws/registry", self.addr)
    }

    /// Stop the harness and wait for its tasks
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        let _ = self.server.await;
        while self.background.join_next().await.is_some() {}
    }
}
