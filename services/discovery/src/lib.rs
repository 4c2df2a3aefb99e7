//! Client-side discovery: local registry mirror and load balancing
//!
//! The cache keeps an eventually-consistent replica of the registry via
//! incremental pulls and a best-effort WebSocket push channel; lookups
//! never touch the network. The balancer is a pure selection function
//! over whatever candidate snapshot the cache serves.

pub mod balancer;
pub mod cache;

pub use balancer::{BalancerPolicy, InflightGuard, InflightTracker, LoadBalancer};
pub use cache::{CacheConfig, DiscoveryCache};
