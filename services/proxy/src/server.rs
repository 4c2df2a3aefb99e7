//! Proxy server: state assembly, pools, and lifecycle

use anyhow::Result;
use axum::Router;
use axum::routing::get;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use discovery_cache::{CacheConfig, DiscoveryCache, InflightTracker, LoadBalancer};
use services_common::RegistryClient;
use services_common::trace::LogTraceSink;

use crate::breaker::BreakerRegistry;
use crate::config::ProxyConfig;
use crate::forward::{self, ProxyState};

/// Build the two upstream pools from the pool configuration
fn build_pools(config: &ProxyConfig) -> Result<(reqwest::Client, reqwest::Client)> {
    let general = reqwest::Client::builder()
        .pool_max_idle_per_host(config.pools.max_per_host)
        .pool_idle_timeout(Duration::from_secs(config.pools.idle_seconds))
        .tcp_keepalive(Duration::from_secs(config.pools.keepalive_seconds))
        .build()?;
    let large = reqwest::Client::builder()
        .http1_only()
        .pool_max_idle_per_host(config.pools.large_max_per_host)
        .pool_idle_timeout(Duration::from_secs(config.pools.large_idle_seconds))
        .tcp_keepalive(Duration::from_secs(config.pools.large_keepalive_seconds))
        .build()?;
    Ok((general, large))
}

/// Build the proxy state: discovery cache wired to the registry, breaker
/// registry, and both upstream pools
pub fn build_state(config: ProxyConfig) -> Result<ProxyState> {
    let registry_client = RegistryClient::new(&config.registry_url)?;
    let inflight = Arc::new(InflightTracker::new());
    let balancer = LoadBalancer::with_inflight(config.balancer, inflight);
    let cache_config = CacheConfig {
        sync_interval: Duration::from_secs(config.sync.interval_seconds),
        push_enabled: config.sync.push_enabled,
        ..CacheConfig::default()
    };
    let cache = Arc::new(DiscoveryCache::new(registry_client, balancer, cache_config));
    let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));
    let (client, large_client) = build_pools(&config)?;

    Ok(ProxyState {
        cache,
        breakers,
        config: Arc::new(config),
        client,
        large_client,
        trace_sink: Arc::new(LogTraceSink),
    })
}

/// Build the proxy router: one health route, everything else forwarded
pub fn build_router(state: ProxyState) -> Router {
    Router::new()
        .route("/health", get(forward::health))
        .fallback(forward::proxy_handler)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Dynamic proxy server
pub struct ProxyServer {
    config: ProxyConfig,
    state: ProxyState,
}

impl ProxyServer {
    pub fn new(config: ProxyConfig) -> Result<Self> {
        let state = build_state(config.clone())?;
        Ok(Self { config, state })
    }

    /// Bind, start cache maintenance, and serve until a termination
    /// signal; in-flight requests get the configured drain deadline.
    pub async fn start(self) -> Result<()> {
        let addr: SocketAddr = self.config.server_address().parse().map_err(|e| {
            anyhow::anyhow!("invalid server address '{}': {e}", self.config.server_address())
        })?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();
        self.state.cache.start(&mut tasks, shutdown_rx.clone());

        let app = build_router(self.state);
        let listener = match TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to bind proxy listener to {}: {}", addr, e);
                return Err(e.into());
            }
        };
        info!("Proxy listening on {}", addr);

        let mut serve_shutdown = shutdown_rx;
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = serve_shutdown.changed().await;
                })
                .await
        });

        shutdown_signal().await;
        info!("Termination signal received, draining");
        let _ = shutdown_tx.send(true);

        let drain = Duration::from_secs(self.config.server.drain_seconds);
        match tokio::time::timeout(drain, server).await {
            Ok(result) => {
                result??;
                info!("All in-flight requests drained");
            }
            Err(_) => {
                warn!(drain_secs = drain.as_secs(), "Drain deadline exceeded, force-closing");
            }
        }

        while tasks.join_next().await.is_some() {}
        info!("Proxy stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
}
