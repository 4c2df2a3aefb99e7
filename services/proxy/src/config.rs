//! Configuration for the dynamic proxy

use anyhow::Result;
use serde::{Deserialize, Serialize};

use discovery_cache::BalancerPolicy;
use services_common::constants;

/// Proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Registry base URL
    pub registry_url: String,
    /// Accepted path prefixes, matched case-insensitively
    pub prefixes: Vec<String>,
    /// Load balancing policy
    pub balancer: BalancerPolicy,
    /// Discovery cache maintenance
    pub sync: SyncConfig,
    /// Upstream dispatch policy
    pub upstream: UpstreamConfig,
    /// Circuit breaker policy, scoped per destination
    pub breaker: BreakerConfig,
    /// Connection pool tuning
    pub pools: PoolConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Drain deadline for in-flight requests at shutdown
    pub drain_seconds: u64,
}

/// Discovery cache maintenance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Incremental pull interval in seconds
    pub interval_seconds: u64,
    /// Subscribe to the registry push channel
    pub push_enabled: bool,
}

/// Upstream dispatch policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Per-call deadline in seconds
    pub timeout_seconds: u64,
    /// Deadline for large transfers in seconds
    pub large_timeout_seconds: u64,
    /// Content-Length above which a request is a large transfer
    pub large_threshold_bytes: u64,
}

/// Circuit breaker policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures before the breaker opens
    pub failure_threshold: u32,
    /// Initial open duration in seconds
    pub open_seconds: u64,
    /// Open-duration backoff cap in seconds
    pub max_open_seconds: u64,
}

/// Connection pool tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// General pool: max idle connections per host
    pub max_per_host: usize,
    /// General pool: idle timeout in seconds
    pub idle_seconds: u64,
    /// General pool: TCP keep-alive in seconds
    pub keepalive_seconds: u64,
    /// Large-transfer pool: max idle connections per host
    pub large_max_per_host: usize,
    /// Large-transfer pool: idle timeout in seconds
    pub large_idle_seconds: u64,
    /// Large-transfer pool: TCP keep-alive in seconds
    pub large_keepalive_seconds: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8000,
                drain_seconds: constants::PROXY_DRAIN_SECS,
            },
            registry_url: constants::DEFAULT_REGISTRY_URL.to_string(),
            prefixes: vec![
                "svc".to_string(),
                "api".to_string(),
                "gateway".to_string(),
            ],
            balancer: BalancerPolicy::RoundRobin,
            sync: SyncConfig {
                interval_seconds: constants::CACHE_SYNC_INTERVAL_SECS,
                push_enabled: true,
            },
            upstream: UpstreamConfig {
                timeout_seconds: constants::PROXY_TIMEOUT_SECS,
                large_timeout_seconds: constants::PROXY_LARGE_TIMEOUT_SECS,
                large_threshold_bytes: constants::LARGE_TRANSFER_BYTES,
            },
            breaker: BreakerConfig {
                failure_threshold: constants::BREAKER_FAILURE_THRESHOLD,
                open_seconds: constants::BREAKER_OPEN_SECS,
                max_open_seconds: constants::BREAKER_MAX_OPEN_SECS,
            },
            pools: PoolConfig {
                max_per_host: constants::POOL_MAX_PER_HOST,
                idle_seconds: constants::POOL_IDLE_SECS,
                keepalive_seconds: constants::POOL_KEEPALIVE_SECS,
                large_max_per_host: constants::LARGE_POOL_MAX_PER_HOST,
                large_idle_seconds: constants::LARGE_POOL_IDLE_SECS,
                large_keepalive_seconds: constants::LARGE_POOL_KEEPALIVE_SECS,
            },
        }
    }
}

impl ProxyConfig {
    /// Load configuration from file with `PROXY_*` env overrides
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("PROXY"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Get server address
    #[must_use]
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Whether `segment` is one of the configured prefixes
    #[must_use]
    pub fn matches_prefix(&self, segment: &str) -> bool {
        self.prefixes
            .iter()
            .any(|p| p.eq_ignore_ascii_case(segment))
    }
}
