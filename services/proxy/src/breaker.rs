//! Per-destination circuit breakers
//!
//! Closed counts consecutive failures; at the threshold exactly one
//! Closed→Open transition happens (CAS-guarded), and the destination is
//! blocked for the open duration. On expiry the breaker admits a single
//! HalfOpen probe: success closes it, failure re-opens with the duration
//! doubled up to a cap. Rejected calls are never counted as failures.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::BreakerConfig;

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BreakerState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl BreakerState {
    const fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

struct Timing {
    opened_at: Instant,
    open_for: Duration,
}

/// Three-state breaker guarding one destination
pub struct CircuitBreaker {
    destination: String,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    /// Written only by the thread that won the transition into Open,
    /// while holding the lock it acquired before the CAS
    timing: Mutex<Timing>,
    config: BreakerConfig,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(destination: String, config: BreakerConfig) -> Self {
        Self {
            destination,
            state: AtomicU8::new(BreakerState::Closed as u8),
            consecutive_failures: AtomicU32::new(0),
            timing: Mutex::new(Timing {
                opened_at: Instant::now(),
                open_for: Duration::from_secs(config.open_seconds),
            }),
            config,
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> BreakerState {
        BreakerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Whether a call may proceed. When the open duration has expired
    /// this admits exactly one caller as the HalfOpen probe.
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        match self.state() {
            BreakerState::Closed => true,
            BreakerState::HalfOpen => false,
            BreakerState::Open => {
                let expired = {
                    let timing = self.timing.lock();
                    timing.opened_at.elapsed() >= timing.open_for
                };
                if !expired {
                    return false;
                }
                // Single probe admission: only the CAS winner passes
                let won = self
                    .state
                    .compare_exchange(
                        BreakerState::Open as u8,
                        BreakerState::HalfOpen as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok();
                if won {
                    debug!(destination = %self.destination, "Breaker half-open, admitting probe");
                }
                won
            }
        }
    }

    /// Record a successful call
    pub fn record_success(&self) {
        if self
            .state
            .compare_exchange(
                BreakerState::HalfOpen as u8,
                BreakerState::Closed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            info!(destination = %self.destination, "Breaker closed after successful probe");
            let mut timing = self.timing.lock();
            timing.open_for = Duration::from_secs(self.config.open_seconds);
        }
        self.consecutive_failures.store(0, Ordering::Release);
    }

    /// Record a failed call (non-2xx or transport error)
    pub fn record_failure(&self) {
        // A failed probe re-opens with the duration backed off
        {
            let mut timing = self.timing.lock();
            if self
                .state
                .compare_exchange(
                    BreakerState::HalfOpen as u8,
                    BreakerState::Open as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                timing.opened_at = Instant::now();
                timing.open_for = (timing.open_for * 2)
                    .min(Duration::from_secs(self.config.max_open_seconds));
                warn!(destination = %self.destination,
                    open_for_secs = timing.open_for.as_secs(),
                    "Probe failed, breaker re-opened");
                return;
            }
        }

        let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures < self.config.failure_threshold {
            return;
        }
        // Exactly one Closed->Open transition per failure burst: the lock
        // is taken before the CAS so readers observing Open always see
        // the fresh timing
        let mut timing = self.timing.lock();
        if self
            .state
            .compare_exchange(
                BreakerState::Closed as u8,
                BreakerState::Open as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            timing.opened_at = Instant::now();
            timing.open_for = Duration::from_secs(self.config.open_seconds);
            warn!(destination = %self.destination, failures,
                open_for_secs = timing.open_for.as_secs(),
                "Breaker opened");
        }
    }

    #[cfg(test)]
    fn force_expire(&self) {
        let mut timing = self.timing.lock();
        timing.opened_at = Instant::now() - timing.open_for;
    }
}

/// Breakers keyed by upstream authority (`host:port`)
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: BreakerConfig,
}

impl BreakerRegistry {
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    /// The breaker guarding `destination`, created on first use
    #[must_use]
    pub fn breaker_for(&self, destination: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(destination.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(
                    destination.to_string(),
                    self.config.clone(),
                ))
            })
            .clone()
    }

    /// Number of destinations currently tracked
    #[must_use]
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 5,
            open_seconds: 30,
            max_open_seconds: 300,
        }
    }

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new("10.0.0.1:5001".to_string(), config())
    }

    #[test]
    fn stays_closed_below_the_threshold() {
        let b = breaker();
        for _ in 0..4 {
            assert!(b.try_acquire());
            b.record_failure();
        }
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn opens_exactly_once_after_five_consecutive_failures() {
        let b = breaker();
        for _ in 0..5 {
            b.record_failure();
        }
        assert_eq!(b.state(), BreakerState::Open);
        assert!(!b.try_acquire());
        // Further failures while open must not reset the clock state
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);
    }

    #[test]
    fn a_success_resets_the_consecutive_count() {
        let b = breaker();
        for _ in 0..4 {
            b.record_failure();
        }
        b.record_success();
        for _ in 0..4 {
            b.record_failure();
        }
        assert_eq!(b.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_admits_a_single_probe() {
        let b = breaker();
        for _ in 0..5 {
            b.record_failure();
        }
        b.force_expire();
        assert!(b.try_acquire(), "first caller becomes the probe");
        assert_eq!(b.state(), BreakerState::HalfOpen);
        assert!(!b.try_acquire(), "second caller is rejected");
    }

    #[test]
    fn successful_probe_closes_the_breaker() {
        let b = breaker();
        for _ in 0..5 {
            b.record_failure();
        }
        b.force_expire();
        assert!(b.try_acquire());
        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(b.try_acquire());
    }

    #[test]
    fn failed_probe_backs_off_up_to_the_cap() {
        let b = breaker();
        for _ in 0..5 {
            b.record_failure();
        }
        for _ in 0..6 {
            b.force_expire();
            assert!(b.try_acquire());
            b.record_failure();
            assert_eq!(b.state(), BreakerState::Open);
        }
        let timing = b.timing.lock();
        assert_eq!(timing.open_for, Duration::from_secs(300));
    }

    #[test]
    fn registry_scopes_breakers_per_destination() {
        let registry = BreakerRegistry::new(config());
        let a = registry.breaker_for("10.0.0.1:5001");
        let b = registry.breaker_for("10.0.0.2:5001");
        for _ in 0..5 {
            a.record_failure();
        }
        assert_eq!(a.state(), BreakerState::Open);
        // The sibling destination keeps serving
        assert_eq!(b.state(), BreakerState::Closed);
        assert!(registry.breaker_for("10.0.0.1:5001").state() == BreakerState::Open);
        assert_eq!(registry.len(), 2);
    }
}
