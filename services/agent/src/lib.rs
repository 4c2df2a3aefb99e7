//! Relay Mesh agent
//!
//! Runs inside each backend process: resolves the service identity,
//! auto-registers against the registry with bounded retries and a
//! configured failure policy, then keeps the registration alive with an
//! adaptive heartbeat. Optionally exposes a default health endpoint.

pub mod agent;
pub mod config;
pub mod health;
pub mod heartbeat;
pub mod identity;

pub use agent::ServiceAgent;
pub use config::{AgentConfig, FailurePolicy};
pub use health::HealthEndpoint;
pub use heartbeat::{HeartbeatIntervals, LoadLevel, LoadMetrics, LoadThresholds};
pub use identity::{ServiceIdentity, ServiceInfoProvider};
