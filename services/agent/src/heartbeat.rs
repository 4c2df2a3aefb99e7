//! Adaptive heartbeat controller
//!
//! The host application feeds request samples into a 60-second sliding
//! window; every 10 seconds the controller reclassifies the load level
//! and reschedules the one-shot heartbeat timer when the level changes.
//! Three consecutive heartbeat failures collapse the cadence to 5 seconds
//! until the next success. A heartbeat answered with not-found means the
//! registry no longer knows the instance; the controller re-registers
//! instead of retrying.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::Instant as TokioInstant;
use tracing::{debug, info, warn};

use services_common::constants;
use services_common::models::RegisterRequest;
use services_common::{MeshError, RegistryClient};

/// Observed load level over the sliding window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadLevel {
    High,
    Medium,
    Low,
    Normal,
}

/// Classification thresholds
#[derive(Debug, Clone)]
pub struct LoadThresholds {
    pub high_requests: usize,
    pub high_avg_latency: Duration,
    pub high_error_rate: f64,
    pub medium_requests: usize,
    pub medium_avg_latency: Duration,
    pub medium_error_rate: f64,
    /// Minimum uptime before an empty window counts as idle
    pub idle_after: Duration,
}

impl Default for LoadThresholds {
    fn default() -> Self {
        Self {
            high_requests: 100,
            high_avg_latency: Duration::from_millis(1000),
            high_error_rate: 0.5,
            medium_requests: 50,
            medium_avg_latency: Duration::from_millis(500),
            medium_error_rate: 0.2,
            idle_after: Duration::from_secs(300),
        }
    }
}

/// Heartbeat cadence per load level
#[derive(Debug, Clone)]
pub struct HeartbeatIntervals {
    pub high: Duration,
    pub medium: Duration,
    pub low: Duration,
    pub normal: Duration,
    pub degraded: Duration,
}

impl Default for HeartbeatIntervals {
    fn default() -> Self {
        Self {
            high: Duration::from_secs(constants::HEARTBEAT_HIGH_SECS),
            medium: Duration::from_secs(constants::HEARTBEAT_MEDIUM_SECS),
            low: Duration::from_secs(constants::HEARTBEAT_LOW_SECS),
            normal: Duration::from_secs(constants::HEARTBEAT_BASE_SECS),
            degraded: Duration::from_secs(constants::HEARTBEAT_DEGRADED_SECS),
        }
    }
}

impl HeartbeatIntervals {
    #[must_use]
    pub const fn for_level(&self, level: LoadLevel) -> Duration {
        match level {
            LoadLevel::High => self.high,
            LoadLevel::Medium => self.medium,
            LoadLevel::Low => self.low,
            LoadLevel::Normal => self.normal,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    duration: Duration,
    success: bool,
}

/// Sliding window of request metrics fed by host instrumentation
#[derive(Debug)]
pub struct LoadMetrics {
    samples: Mutex<VecDeque<Sample>>,
    window: Duration,
    started_at: Instant,
}

impl Default for LoadMetrics {
    fn default() -> Self {
        Self::new(Duration::from_secs(constants::LOAD_WINDOW_SECS))
    }
}

impl LoadMetrics {
    #[must_use]
    pub fn new(window: Duration) -> Self {
        Self {
            samples: Mutex::new(VecDeque::new()),
            window,
            started_at: Instant::now(),
        }
    }

    /// Record one completed request
    pub fn record_request(&self, duration: Duration, success: bool) {
        let mut samples = self.samples.lock();
        samples.push_back(Sample {
            at: Instant::now(),
            duration,
            success,
        });
        Self::prune(&mut samples, self.window);
    }

    /// Classify the current window
    #[must_use]
    pub fn classify(&self, thresholds: &LoadThresholds) -> LoadLevel {
        let mut samples = self.samples.lock();
        Self::prune(&mut samples, self.window);

        let count = samples.len();
        if count == 0 {
            if self.started_at.elapsed() > thresholds.idle_after {
                return LoadLevel::Low;
            }
            return LoadLevel::Normal;
        }

        let total: Duration = samples.iter().map(|s| s.duration).sum();
        let avg_latency = total / count as u32;
        let failures = samples.iter().filter(|s| !s.success).count();
        let error_rate = failures as f64 / count as f64;

        if count > thresholds.high_requests
            || avg_latency > thresholds.high_avg_latency
            || error_rate > thresholds.high_error_rate
        {
            return LoadLevel::High;
        }
        if count > thresholds.medium_requests
            || avg_latency > thresholds.medium_avg_latency
            || error_rate > thresholds.medium_error_rate
        {
            return LoadLevel::Medium;
        }
        LoadLevel::Normal
    }

    fn prune(samples: &mut VecDeque<Sample>, window: Duration) {
        let Some(cutoff) = Instant::now().checked_sub(window) else {
            return;
        };
        while samples.front().is_some_and(|s| s.at < cutoff) {
            samples.pop_front();
        }
    }
}

/// The running heartbeat task for one registration
pub struct HeartbeatController {
    pub client: RegistryClient,
    pub metrics: std::sync::Arc<LoadMetrics>,
    pub intervals: HeartbeatIntervals,
    pub thresholds: LoadThresholds,
    /// Register request replayed when the registry forgets the instance
    pub register_request: RegisterRequest,
}

impl HeartbeatController {
    /// Run until shutdown; on shutdown a final heartbeat is attempted
    /// with a short deadline and the instance is deregistered.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let instance_id = match self.register_request.instance_id {
            Some(id) => id,
            None => {
                warn!("Heartbeat controller started without an instance id");
                return;
            }
        };
        let service_name = self.register_request.service_name.clone();

        let mut level = LoadLevel::Normal;
        let mut consecutive_failures: u32 = 0;
        let mut next_beat = TokioInstant::now() + self.intervals.for_level(level);
        let mut reclassify =
            tokio::time::interval(Duration::from_secs(constants::LOAD_RECLASSIFY_SECS));

        info!(%instance_id, service = %service_name,
            interval_secs = self.intervals.for_level(level).as_secs(),
            "Heartbeat loop started");

        loop {
            tokio::select! {
                () = tokio::time::sleep_until(next_beat) => {
                    match self.client.heartbeat(instance_id, &service_name).await {
                        Ok(_) => {
                            if consecutive_failures >= constants::HEARTBEAT_FAILURE_COLLAPSE {
                                info!(%instance_id, "Heartbeat recovered, restoring cadence");
                            }
                            consecutive_failures = 0;
                        }
                        Err(MeshError::NotFound(_)) => {
                            // The registry evicted us; re-register rather
                            // than hammering a dead id
                            warn!(%instance_id, service = %service_name,
                                "Heartbeat rejected as unknown, re-registering");
                            match self.client.register(&self.register_request).await {
                                Ok(_) => consecutive_failures = 0,
                                Err(e) => {
                                    warn!(error = %e, "Re-registration failed");
                                    consecutive_failures += 1;
                                }
                            }
                        }
                        Err(e) => {
                            consecutive_failures += 1;
                            warn!(%instance_id, error = %e, consecutive_failures,
                                "Heartbeat failed");
                        }
                    }
                    let cadence = if consecutive_failures >= constants::HEARTBEAT_FAILURE_COLLAPSE {
                        self.intervals.degraded
                    } else {
                        self.intervals.for_level(level)
                    };
                    next_beat = TokioInstant::now() + cadence;
                }
                _ = reclassify.tick() => {
                    let observed = self.metrics.classify(&self.thresholds);
                    if observed != level {
                        debug!(?observed, previous = ?level, "Load level changed");
                        level = observed;
                        if consecutive_failures < constants::HEARTBEAT_FAILURE_COLLAPSE {
                            // Level changes reschedule the one-shot timer
                            next_beat = TokioInstant::now() + self.intervals.for_level(level);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    self.graceful_exit(instance_id, &service_name).await;
                    return;
                }
            }
        }
    }

    async fn graceful_exit(&self, instance_id: uuid::Uuid, service_name: &str) {
        let deadline = Duration::from_secs(constants::SHUTDOWN_HEARTBEAT_TIMEOUT_SECS);
        if tokio::time::timeout(deadline, self.client.heartbeat(instance_id, service_name))
            .await
            .is_err()
        {
            debug!(%instance_id, "Final heartbeat timed out");
        }
        match self.client.deregister(instance_id).await {
            Ok(_) => info!(%instance_id, "Deregistered on shutdown"),
            Err(e) => warn!(%instance_id, error = %e, "Deregister on shutdown failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn thresholds() -> LoadThresholds {
        LoadThresholds::default()
    }

    #[test]
    fn empty_window_is_normal_until_idle_uptime() {
        let metrics = LoadMetrics::default();
        assert_eq!(metrics.classify(&thresholds()), LoadLevel::Normal);
    }

    #[test]
    fn empty_window_is_low_after_long_uptime() {
        let mut t = thresholds();
        t.idle_after = Duration::ZERO;
        let metrics = LoadMetrics::default();
        // Uptime strictly exceeds the zero threshold immediately
        assert_eq!(metrics.classify(&t), LoadLevel::Low);
    }

    #[test]
    fn request_volume_drives_high() {
        let metrics = LoadMetrics::default();
        for _ in 0..150 {
            metrics.record_request(Duration::from_millis(50), true);
        }
        assert_eq!(metrics.classify(&thresholds()), LoadLevel::High);
    }

    #[test]
    fn latency_alone_drives_medium() {
        let metrics = LoadMetrics::default();
        for _ in 0..10 {
            metrics.record_request(Duration::from_millis(700), true);
        }
        assert_eq!(metrics.classify(&thresholds()), LoadLevel::Medium);
    }

    #[test]
    fn error_rate_alone_drives_high() {
        let metrics = LoadMetrics::default();
        for i in 0..10 {
            metrics.record_request(Duration::from_millis(10), i % 3 == 0);
        }
        assert_eq!(metrics.classify(&thresholds()), LoadLevel::High);
    }

    #[test]
    fn moderate_traffic_is_normal() {
        let metrics = LoadMetrics::default();
        for _ in 0..20 {
            metrics.record_request(Duration::from_millis(40), true);
        }
        assert_eq!(metrics.classify(&thresholds()), LoadLevel::Normal);
    }

    #[test]
    fn intervals_map_levels_to_cadence() {
        let intervals = HeartbeatIntervals::default();
        assert_eq!(intervals.for_level(LoadLevel::High), Duration::from_secs(10));
        assert_eq!(intervals.for_level(LoadLevel::Medium), Duration::from_secs(20));
        assert_eq!(intervals.for_level(LoadLevel::Low), Duration::from_secs(60));
        assert_eq!(intervals.for_level(LoadLevel::Normal), Duration::from_secs(30));
    }
}
