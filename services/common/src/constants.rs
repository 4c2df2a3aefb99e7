//! Protocol constants shared across the control plane
//!
//! Single source of truth for every timeout, interval, and threshold the
//! registry, agent, cache, and proxy agree on.

// Heartbeat / eviction timescales (registry side)
/// Heartbeat age after which an instance stops being Healthy
pub const HEARTBEAT_MISS_SECS: u64 = 60;
/// Heartbeat age after which an instance is evicted entirely
pub const HEARTBEAT_EVICT_SECS: u64 = 120;
/// Interval between active health probe rounds
pub const HEALTH_PROBE_INTERVAL_SECS: u64 = 30;
/// Deadline for a single active health probe
pub const HEALTH_PROBE_TIMEOUT_SECS: u64 = 5;
/// Interval between reaper sweeps
pub const REAPER_SWEEP_INTERVAL_SECS: u64 = 10;

// Agent cadences
/// Base heartbeat interval (Normal load)
pub const HEARTBEAT_BASE_SECS: u64 = 30;
/// Heartbeat interval under High load
pub const HEARTBEAT_HIGH_SECS: u64 = 10;
/// Heartbeat interval under Medium load
pub const HEARTBEAT_MEDIUM_SECS: u64 = 20;
/// Heartbeat interval when idle
pub const HEARTBEAT_LOW_SECS: u64 = 60;
/// Collapsed interval after consecutive heartbeat failures
pub const HEARTBEAT_DEGRADED_SECS: u64 = 5;
/// Consecutive failures before the cadence collapses
pub const HEARTBEAT_FAILURE_COLLAPSE: u32 = 3;
/// Sliding window over which request metrics are classified
pub const LOAD_WINDOW_SECS: u64 = 60;
/// How often the adaptive controller reclassifies load
pub const LOAD_RECLASSIFY_SECS: u64 = 10;
/// Deadline for the final heartbeat during shutdown
pub const SHUTDOWN_HEARTBEAT_TIMEOUT_SECS: u64 = 2;

// Discovery cache
/// Incremental pull interval
pub const CACHE_SYNC_INTERVAL_SECS: u64 = 5;
/// Batch applier tick
pub const CACHE_APPLY_INTERVAL_MS: u64 = 100;
/// Queue depth that forces an immediate batch apply
pub const CACHE_APPLY_BATCH_SIZE: usize = 100;

// Change feed
/// Retained change-log entries before pull callers get a full snapshot
pub const CHANGE_LOG_RETENTION: usize = 4096;
/// Per-subscriber push channel capacity; slow subscribers are dropped
pub const PUSH_CHANNEL_CAPACITY: usize = 256;
/// Grace period for draining push subscribers at shutdown
pub const SUBSCRIBER_DRAIN_SECS: u64 = 5;

// Proxy policy
/// Consecutive failures that trip a circuit breaker
pub const BREAKER_FAILURE_THRESHOLD: u32 = 5;
/// Initial open duration
pub const BREAKER_OPEN_SECS: u64 = 30;
/// Open-duration backoff cap
pub const BREAKER_MAX_OPEN_SECS: u64 = 300;
/// Per-call upstream deadline
pub const PROXY_TIMEOUT_SECS: u64 = 10;
/// Deadline for large transfers
pub const PROXY_LARGE_TIMEOUT_SECS: u64 = 30 * 60;
/// Content-Length above which a request counts as a large transfer
pub const LARGE_TRANSFER_BYTES: u64 = 10 * 1024 * 1024;
/// Drain deadline for in-flight proxy requests at shutdown
pub const PROXY_DRAIN_SECS: u64 = 30;

// Connection pools
pub const POOL_MAX_PER_HOST: usize = 100;
pub const POOL_IDLE_SECS: u64 = 120;
pub const POOL_KEEPALIVE_SECS: u64 = 60;
pub const LARGE_POOL_MAX_PER_HOST: usize = 20;
pub const LARGE_POOL_IDLE_SECS: u64 = 30;
pub const LARGE_POOL_KEEPALIVE_SECS: u64 = 30;

// Agent registration
pub const REGISTER_RETRY_COUNT: u32 = 3;
pub const REGISTER_RETRY_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_REGISTRY_URL: &str = "http://localhost:5000";
pub const DEFAULT_WEIGHT: u32 = 100;
