//! Change feed: the registry's ordered stream of mutations
//!
//! A single bounded log keyed by version, with two delivery channels:
//! coalescing pull (`collect_since`) and best-effort push fan-out over
//! bounded per-subscriber channels. A subscriber that cannot keep up is
//! dropped and reconciles through the pull endpoint.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use services_common::models::{ChangeKind, InstanceRecord, ServiceChangeEvent};

/// Result of a pull against the feed
#[derive(Debug)]
pub enum PullResult {
    /// Coalesced latest state per id mutated since the cursor
    Delta {
        upserts: Vec<InstanceRecord>,
        removals: Vec<Uuid>,
    },
    /// The cursor predates retention; the caller must take a full
    /// snapshot and reset
    Reset,
}

struct PushSubscriber {
    id: u64,
    sender: mpsc::Sender<ServiceChangeEvent>,
}

struct FeedInner {
    log: VecDeque<ServiceChangeEvent>,
    /// Highest version that may have been discarded from the front of the
    /// log; cursors at or below any discarded version get a `Reset`
    floor: u64,
    subscribers: Vec<PushSubscriber>,
    next_subscriber_id: u64,
}

/// Bounded, version-ordered change log with push fan-out
pub struct ChangeFeed {
    inner: Mutex<FeedInner>,
    retention: usize,
    push_capacity: usize,
}

impl ChangeFeed {
    #[must_use]
    pub fn new(retention: usize, push_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(FeedInner {
                log: VecDeque::new(),
                floor: 0,
                subscribers: Vec::new(),
                next_subscriber_id: 0,
            }),
            retention,
            push_capacity,
        }
    }

    /// Append one event and fan it out to push subscribers.
    ///
    /// Events must arrive in strictly increasing version order; the store
    /// publishes while still holding its write lock to guarantee that.
    pub fn publish(&self, event: ServiceChangeEvent) {
        let mut inner = self.inner.lock();
        debug_assert!(
            inner.log.back().is_none_or(|last| last.version < event.version),
            "change feed events must be version-ordered"
        );
        inner.log.push_back(event.clone());
        while inner.log.len() > self.retention {
            if let Some(dropped) = inner.log.pop_front() {
                inner.floor = dropped.version;
            }
        }

        // Non-blocking fan-out; a full or closed channel costs the
        // subscriber its membership.
        inner.subscribers.retain(|sub| match sub.sender.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(subscriber = sub.id, "Push subscriber too slow, dropping");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Coalesced changes with version greater than `since`.
    ///
    /// Intermediate versions are coalesced: the result carries only the
    /// latest record (or a removal marker) per mutated id.
    pub fn collect_since(&self, since: u64) -> PullResult {
        let inner = self.inner.lock();
        if since < inner.floor {
            return PullResult::Reset;
        }

        // Last-writer-wins per id, in version order
        let mut latest: FxHashMap<Uuid, &ServiceChangeEvent> = FxHashMap::default();
        for event in inner.log.iter().filter(|e| e.version > since) {
            latest.insert(event.instance_id, event);
        }

        let mut upserts = Vec::new();
        let mut removals = Vec::new();
        for event in latest.into_values() {
            match event.kind {
                ChangeKind::Upsert => {
                    if let Some(record) = &event.record {
                        upserts.push(record.clone());
                    }
                }
                ChangeKind::Remove => removals.push(event.instance_id),
            }
        }
        PullResult::Delta { upserts, removals }
    }

    /// Register a push subscriber; the receiver sees events in version
    /// order until it falls behind or the feed closes
    pub fn subscribe(&self) -> (u64, mpsc::Receiver<ServiceChangeEvent>) {
        let (tx, rx) = mpsc::channel(self.push_capacity);
        let mut inner = self.inner.lock();
        inner.next_subscriber_id += 1;
        let id = inner.next_subscriber_id;
        inner.subscribers.push(PushSubscriber { id, sender: tx });
        debug!(subscriber = id, "Push subscriber registered");
        (id, rx)
    }

    /// Remove a subscriber
    pub fn unsubscribe(&self, id: u64) {
        self.inner.lock().subscribers.retain(|s| s.id != id);
    }

    /// Number of live push subscribers
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    /// Drop all subscribers, closing their channels
    pub fn close(&self) {
        self.inner.lock().subscribers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use services_common::models::InstanceStatus;

    fn record(service: &str) -> InstanceRecord {
        let now = Utc::now();
        InstanceRecord {
            instance_id: Uuid::new_v4(),
            service_name: service.to_string(),
            host: "127.0.0.1".to_string(),
            port: 8080,
            version_tag: "1.0.0".to_string(),
            metadata: FxHashMap::default(),
            health_check_url: None,
            weight: 100,
            registered_at: now,
            last_heartbeat: now,
            status: InstanceStatus::Healthy,
        }
    }

    #[test]
    fn pull_coalesces_to_latest_per_id() {
        let feed = ChangeFeed::new(64, 8);
        let mut a = record("Orders");
        feed.publish(ServiceChangeEvent::upsert(1, a.clone()));
        a.weight = 50;
        feed.publish(ServiceChangeEvent::upsert(2, a.clone()));
        let b = record("Orders");
        feed.publish(ServiceChangeEvent::upsert(3, b.clone()));
        feed.publish(ServiceChangeEvent::remove(4, b.instance_id, b.service_name.clone()));

        match feed.collect_since(0) {
            PullResult::Delta { upserts, removals } => {
                assert_eq!(upserts.len(), 1);
                assert_eq!(upserts[0].instance_id, a.instance_id);
                assert_eq!(upserts[0].weight, 50);
                assert_eq!(removals, vec![b.instance_id]);
            }
            PullResult::Reset => panic!("cursor 0 is within retention"),
        }
    }

    #[test]
    fn stale_cursor_forces_a_reset() {
        let feed = ChangeFeed::new(2, 8);
        for version in 1..=5 {
            feed.publish(ServiceChangeEvent::upsert(version, record("Orders")));
        }
        // Versions 1..=3 fell off the front; a cursor of 2 cannot be served
        assert!(matches!(feed.collect_since(2), PullResult::Reset));
        assert!(matches!(feed.collect_since(3), PullResult::Delta { .. }));
    }

    #[test]
    fn up_to_date_cursor_sees_an_empty_delta() {
        let feed = ChangeFeed::new(64, 8);
        feed.publish(ServiceChangeEvent::upsert(1, record("Orders")));
        match feed.collect_since(1) {
            PullResult::Delta { upserts, removals } => {
                assert!(upserts.is_empty());
                assert!(removals.is_empty());
            }
            PullResult::Reset => panic!("cursor 1 is current"),
        }
    }

    #[tokio::test]
    async fn slow_subscribers_are_dropped_not_blocked() {
        let feed = ChangeFeed::new(64, 2);
        let (_id, mut rx) = feed.subscribe();
        assert_eq!(feed.subscriber_count(), 1);

        // Capacity 2: the third publish overflows and evicts the subscriber
        for version in 1..=3 {
            feed.publish(ServiceChangeEvent::upsert(version, record("Orders")));
        }
        assert_eq!(feed.subscriber_count(), 0);

        // The two buffered events are still delivered in version order
        assert_eq!(rx.recv().await.map(|e| e.version), Some(1));
        assert_eq!(rx.recv().await.map(|e| e.version), Some(2));
        assert_eq!(rx.recv().await, None);
    }
}
