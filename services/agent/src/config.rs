//! Configuration for the mesh agent

use anyhow::Result;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use services_common::constants;

/// What to do when foreground registration retries are exhausted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailurePolicy {
    /// Propagate a fatal error to the host process
    FailFast,
    /// Run unregistered; no heartbeats are sent
    ContinueWithoutRegistration,
    /// Keep retrying in the background; heartbeats begin on success
    ContinueAndRetry,
}

/// Agent configuration
///
/// `service_name`, `host`, and `port` may be left unset here and supplied
/// by a `ServiceInfoProvider` or platform introspection instead; identity
/// is resolved once before the agent is constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Registry base URL
    pub registry_url: String,
    /// Logical service name
    pub service_name: Option<String>,
    /// Advertised host; wildcard values are replaced during resolution
    pub host: Option<String>,
    /// Advertised port
    pub port: Option<u16>,
    /// Version tag to publish
    pub version: String,
    /// Selection weight; 0 registers without receiving traffic
    pub weight: u32,
    /// Free-form instance metadata
    pub metadata: FxHashMap<String, String>,
    /// Absolute probe URL; the registry falls back to `/health`
    pub health_check_url: Option<String>,
    /// Base heartbeat interval in seconds (Normal load)
    pub heartbeat_interval_seconds: u64,
    /// Register automatically on startup
    pub auto_register: bool,
    /// Foreground registration attempts; 0 means unbounded
    pub register_retry_count: u32,
    /// Delay between registration attempts in seconds
    pub register_retry_interval_seconds: u64,
    /// Policy applied when foreground retries are exhausted
    pub failure_policy: FailurePolicy,
    /// Expose the built-in health endpoint
    pub enable_default_health_check: bool,
    /// Path of the built-in health endpoint
    pub health_check_path: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            registry_url: constants::DEFAULT_REGISTRY_URL.to_string(),
            service_name: None,
            host: None,
            port: None,
            version: "1.0.0".to_string(),
            weight: constants::DEFAULT_WEIGHT,
            metadata: FxHashMap::default(),
            health_check_url: None,
            heartbeat_interval_seconds: constants::HEARTBEAT_BASE_SECS,
            auto_register: true,
            register_retry_count: constants::REGISTER_RETRY_COUNT,
            register_retry_interval_seconds: constants::REGISTER_RETRY_INTERVAL_SECS,
            failure_policy: FailurePolicy::ContinueAndRetry,
            enable_default_health_check: false,
            health_check_path: "/health".to_string(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from file with `AGENT_*` env overrides
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix("AGENT"))
            .build()?;
        Ok(settings.try_deserialize()?)
    }
}
