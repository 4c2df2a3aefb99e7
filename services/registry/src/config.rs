//! Configuration for the registry service

use anyhow::Result;
use serde::{Deserialize, Serialize};
use services_common::constants;

/// Registry service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// HTTP server configuration
    pub server: ServerConfig,
    /// Heartbeat/eviction/probe timescales
    pub health: HealthConfig,
    /// Change feed tuning
    pub feed: FeedConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// Request timeout in seconds
    pub timeout_seconds: u64,
}

/// Heartbeat and probe timescales
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Heartbeat age before Healthy becomes Unhealthy
    pub miss_seconds: u64,
    /// Heartbeat age before an instance is evicted
    pub evict_seconds: u64,
    /// Interval between reaper sweeps
    pub sweep_seconds: u64,
    /// Interval between active probe rounds
    pub probe_seconds: u64,
    /// Per-probe deadline
    pub probe_timeout_seconds: u64,
    /// Enable active probing of health endpoints
    pub probe_enabled: bool,
}

/// Change feed tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// Retained log entries before pull callers get a full snapshot
    pub retention: usize,
    /// Per-subscriber push channel capacity
    pub push_capacity: usize,
    /// Grace period for draining push subscribers at shutdown
    pub drain_seconds: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 5000,
                timeout_seconds: 30,
            },
            health: HealthConfig {
                miss_seconds: constants::HEARTBEAT_MISS_SECS,
                evict_seconds: constants::HEARTBEAT_EVICT_SECS,
                sweep_seconds: constants::REAPER_SWEEP_INTERVAL_SECS,
                probe_seconds: constants::HEALTH_PROBE_INTERVAL_SECS,
                probe_timeout_seconds: constants::HEALTH_PROBE_TIMEOUT_SECS,
                probe_enabled: true,
            },
            feed: FeedConfig {
                retention: constants::CHANGE_LOG_RETENTION,
                push_capacity: constants::PUSH_CHANNEL_CAPACITY,
                drain_seconds: constants::SUBSCRIBER_DRAIN_SECS,
            },
        }
    }
}

impl RegistryConfig {
    /// Load configuration from file with `REGISTRY_*` env overrides
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("REGISTRY"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    /// Get server address
    #[must_use]
    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
