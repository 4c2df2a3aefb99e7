//! Built-in health endpoint for host applications
//!
//! When `enable_default_health_check` is set, the host mounts this router
//! and the registry's active prober gets `{status, service, timestamp,
//! checks}` back. Checks are named closures registered by the host; the
//! endpoint degrades when any of them fails.

use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// A named readiness check
pub type CheckFn = Arc<dyn Fn() -> bool + Send + Sync>;

/// Default health endpoint state
pub struct HealthEndpoint {
    service_name: String,
    path: String,
    checks: RwLock<Vec<(String, CheckFn)>>,
}

impl HealthEndpoint {
    #[must_use]
    pub fn new(service_name: String, path: String) -> Self {
        Self {
            service_name,
            path,
            checks: RwLock::new(Vec::new()),
        }
    }

    /// Path the endpoint is mounted at
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Register a named check evaluated on every probe
    pub fn add_check(&self, name: &str, check: CheckFn) {
        self.checks.write().push((name.to_string(), check));
    }

    /// Router the host merges into its application
    #[must_use]
    pub fn router(self: &Arc<Self>) -> Router {
        Router::new()
            .route(&self.path, get(serve))
            .with_state(Arc::clone(self))
    }

    fn evaluate(&self) -> (bool, FxHashMap<String, bool>) {
        let checks = self.checks.read();
        let mut results = FxHashMap::default();
        let mut all_passing = true;
        for (name, check) in checks.iter() {
            let passed = check();
            all_passing &= passed;
            results.insert(name.clone(), passed);
        }
        (all_passing, results)
    }
}

async fn serve(State(endpoint): State<Arc<HealthEndpoint>>) -> Json<serde_json::Value> {
    let (healthy, checks) = endpoint.evaluate();
    Json(serde_json::json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "service": endpoint.service_name,
        "timestamp": Utc::now(),
        "checks": checks,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_degrades_when_a_check_fails() {
        let endpoint = HealthEndpoint::new("Orders".to_string(), "/health".to_string());
        endpoint.add_check("db", Arc::new(|| true));
        let (healthy, checks) = endpoint.evaluate();
        assert!(healthy);
        assert_eq!(checks.get("db"), Some(&true));

        endpoint.add_check("queue", Arc::new(|| false));
        let (healthy, checks) = endpoint.evaluate();
        assert!(!healthy);
        assert_eq!(checks.len(), 2);
    }
}
