//! Load balancing policies over a candidate snapshot
//!
//! Selection is a pure function of (candidates, policy, counters): no
//! blocking, no fabrication. Instances with weight 0 are registered but
//! never selected; an empty candidate set yields `None`.

use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use uuid::Uuid;

use services_common::models::InstanceRecord;

/// Selection policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BalancerPolicy {
    RoundRobin,
    WeightedRoundRobin,
    Random,
    LeastInFlight,
}

/// Outstanding-request counters, shared with the proxy
#[derive(Debug, Default)]
pub struct InflightTracker {
    counts: DashMap<Uuid, Arc<AtomicUsize>>,
}

impl InflightTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the counter for `instance_id`; the guard decrements on drop
    #[must_use]
    pub fn acquire(&self, instance_id: Uuid) -> InflightGuard {
        let counter = self
            .counts
            .entry(instance_id)
            .or_insert_with(|| Arc::new(AtomicUsize::new(0)))
            .clone();
        counter.fetch_add(1, Ordering::Relaxed);
        InflightGuard { counter }
    }

    /// Current outstanding count for `instance_id`
    #[must_use]
    pub fn count(&self, instance_id: Uuid) -> usize {
        self.counts
            .get(&instance_id)
            .map_or(0, |c| c.load(Ordering::Relaxed))
    }

    /// Drop the counter of an evicted instance
    pub fn forget(&self, instance_id: Uuid) {
        self.counts.remove(&instance_id);
    }
}

/// RAII in-flight marker
#[derive(Debug)]
pub struct InflightGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Policy-driven instance selector
pub struct LoadBalancer {
    policy: BalancerPolicy,
    /// Per-service rotation cursors
    cursors: DashMap<String, AtomicU64>,
    inflight: Arc<InflightTracker>,
}

impl LoadBalancer {
    #[must_use]
    pub fn new(policy: BalancerPolicy) -> Self {
        Self::with_inflight(policy, Arc::new(InflightTracker::new()))
    }

    #[must_use]
    pub fn with_inflight(policy: BalancerPolicy, inflight: Arc<InflightTracker>) -> Self {
        Self {
            policy,
            cursors: DashMap::new(),
            inflight,
        }
    }

    #[must_use]
    pub const fn policy(&self) -> BalancerPolicy {
        self.policy
    }

    /// The shared outstanding-request tracker
    #[must_use]
    pub fn inflight(&self) -> &Arc<InflightTracker> {
        &self.inflight
    }

    /// Select one instance from `candidates` for `service`
    #[must_use]
    pub fn select<'a>(
        &self,
        service: &str,
        candidates: &'a [InstanceRecord],
    ) -> Option<&'a InstanceRecord> {
        let eligible: Vec<&InstanceRecord> =
            candidates.iter().filter(|r| r.weight > 0).collect();
        if eligible.is_empty() {
            return None;
        }
        match self.policy {
            BalancerPolicy::RoundRobin => {
                let index = self.advance(service) as usize % eligible.len();
                Some(eligible[index])
            }
            BalancerPolicy::WeightedRoundRobin => {
                let total: u64 = eligible.iter().map(|r| u64::from(r.weight)).sum();
                let slot = self.advance(service) % total;
                Some(pick_by_slot(&eligible, slot))
            }
            BalancerPolicy::Random => {
                let total: u64 = eligible.iter().map(|r| u64::from(r.weight)).sum();
                let slot = rand::thread_rng().gen_range(0..total);
                Some(pick_by_slot(&eligible, slot))
            }
            BalancerPolicy::LeastInFlight => {
                let least = eligible
                    .iter()
                    .map(|r| self.inflight.count(r.instance_id))
                    .min()?;
                let tied: Vec<&InstanceRecord> = eligible
                    .into_iter()
                    .filter(|r| self.inflight.count(r.instance_id) == least)
                    .collect();
                let index = self.advance(service) as usize % tied.len();
                Some(tied[index])
            }
        }
    }

    fn advance(&self, service: &str) -> u64 {
        self.cursors
            .entry(service.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::Relaxed)
    }
}

/// Walk the cumulative weight distribution to the given virtual slot
fn pick_by_slot<'a>(eligible: &[&'a InstanceRecord], slot: u64) -> &'a InstanceRecord {
    let mut remaining = slot;
    for record in eligible {
        let weight = u64::from(record.weight);
        if remaining < weight {
            return record;
        }
        remaining -= weight;
    }
    // Unreachable when slot < total weight; fall back to the last entry
    eligible[eligible.len() - 1]
}
