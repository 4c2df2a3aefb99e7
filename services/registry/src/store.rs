//! Instance store: the authoritative map of registered instances
//!
//! One trait, two intended backends. The in-memory store ships here; a
//! durable backend satisfies the same contract with TTL + pub/sub
//! semantics standing in for the version counter and change feed.
//!
//! Every mutation that changes observable state increments the global
//! version exactly once and emits one event into the change feed before
//! returning.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use services_common::MeshError;
use services_common::models::{InstanceRecord, InstanceStatus, ServiceChangeEvent};

use crate::feed::ChangeFeed;

/// Contract every instance backend satisfies
#[async_trait]
pub trait InstanceStore: Send + Sync {
    /// Insert or update a record; rejects a service rebinding for an
    /// existing id. Returns the version produced by the mutation.
    async fn upsert(&self, record: InstanceRecord) -> Result<u64, MeshError>;

    /// Remove a record. Returns whether it existed and the resulting
    /// version (unchanged when absent).
    async fn remove(&self, instance_id: Uuid) -> (bool, u64);

    /// Refresh `last_heartbeat` and raise status to Healthy
    async fn touch(&self, instance_id: Uuid) -> bool;

    /// Set the status; idempotent when the status is unchanged
    async fn set_status(&self, instance_id: Uuid, status: InstanceStatus) -> bool;

    async fn get(&self, instance_id: Uuid) -> Option<InstanceRecord>;

    /// Snapshot of a service's instances; callers must not assume liveness
    async fn list_by_service(&self, service_name: &str) -> Vec<InstanceRecord>;

    async fn list_all(&self) -> Vec<InstanceRecord>;

    async fn list_all_names(&self) -> Vec<String>;

    /// Records whose heartbeat age exceeds `threshold`
    async fn list_expired(&self, threshold: Duration) -> Vec<InstanceRecord>;

    /// Current value of the global version counter
    async fn version(&self) -> u64;
}

struct World {
    instances: FxHashMap<Uuid, InstanceRecord>,
    by_service: FxHashMap<String, FxHashSet<Uuid>>,
    version: u64,
}

/// In-memory instance store
///
/// Mutations are exclusive under the write lock; reads take snapshots.
/// Publishing to the feed happens under the same lock, which is what
/// keeps feed events in version order.
pub struct MemoryInstanceStore {
    world: RwLock<World>,
    feed: Arc<ChangeFeed>,
}

impl MemoryInstanceStore {
    #[must_use]
    pub fn new(feed: Arc<ChangeFeed>) -> Self {
        Self {
            world: RwLock::new(World {
                instances: FxHashMap::default(),
                by_service: FxHashMap::default(),
                version: 0,
            }),
            feed,
        }
    }

    /// The change feed this store publishes into
    #[must_use]
    pub fn feed(&self) -> &Arc<ChangeFeed> {
        &self.feed
    }
}

#[async_trait]
impl InstanceStore for MemoryInstanceStore {
    async fn upsert(&self, mut record: InstanceRecord) -> Result<u64, MeshError> {
        let mut world = self.world.write();

        if let Some(existing) = world.instances.get(&record.instance_id) {
            if existing.service_name != record.service_name {
                return Err(MeshError::ServiceBindingChanged {
                    existing: existing.service_name.clone(),
                    requested: record.service_name.clone(),
                });
            }
            // Re-registration keeps the original registration instant
            record.registered_at = existing.registered_at;
            if record.last_heartbeat < record.registered_at {
                record.last_heartbeat = record.registered_at;
            }
        }

        world.version += 1;
        let version = world.version;
        world
            .by_service
            .entry(record.service_name.clone())
            .or_default()
            .insert(record.instance_id);
        world.instances.insert(record.instance_id, record.clone());
        debug!(instance_id = %record.instance_id, service = %record.service_name, version,
            "Instance upserted");
        self.feed.publish(ServiceChangeEvent::upsert(version, record));
        Ok(version)
    }

    async fn remove(&self, instance_id: Uuid) -> (bool, u64) {
        let mut world = self.world.write();
        let Some(record) = world.instances.remove(&instance_id) else {
            return (false, world.version);
        };
        if let Some(ids) = world.by_service.get_mut(&record.service_name) {
            ids.remove(&instance_id);
            if ids.is_empty() {
                world.by_service.remove(&record.service_name);
            }
        }
        world.version += 1;
        let version = world.version;
        info!(%instance_id, service = %record.service_name, version, "Instance removed");
        self.feed
            .publish(ServiceChangeEvent::remove(version, instance_id, record.service_name));
        (true, version)
    }

    async fn touch(&self, instance_id: Uuid) -> bool {
        let mut world = self.world.write();
        let updated = match world.instances.get_mut(&instance_id) {
            Some(record) => {
                record.last_heartbeat = Utc::now();
                record.status = InstanceStatus::Healthy;
                record.clone()
            }
            None => return false,
        };
        world.version += 1;
        let version = world.version;
        self.feed.publish(ServiceChangeEvent::upsert(version, updated));
        true
    }

    async fn set_status(&self, instance_id: Uuid, status: InstanceStatus) -> bool {
        let mut world = self.world.write();
        let updated = match world.instances.get_mut(&instance_id) {
            Some(record) if record.status == status => return true,
            Some(record) => {
                record.status = status;
                record.clone()
            }
            None => return false,
        };
        world.version += 1;
        let version = world.version;
        debug!(%instance_id, ?status, version, "Instance status changed");
        self.feed.publish(ServiceChangeEvent::upsert(version, updated));
        true
    }

    async fn get(&self, instance_id: Uuid) -> Option<InstanceRecord> {
        self.world.read().instances.get(&instance_id).cloned()
    }

    async fn list_by_service(&self, service_name: &str) -> Vec<InstanceRecord> {
        let world = self.world.read();
        world
            .by_service
            .get(service_name)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| world.instances.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn list_all(&self) -> Vec<InstanceRecord> {
        self.world.read().instances.values().cloned().collect()
    }

    async fn list_all_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.world.read().by_service.keys().cloned().collect();
        names.sort();
        names
    }

    async fn list_expired(&self, threshold: Duration) -> Vec<InstanceRecord> {
        let now = Utc::now();
        self.world
            .read()
            .instances
            .values()
            .filter(|r| r.heartbeat_age(now) > threshold)
            .cloned()
            .collect()
    }

    async fn version(&self) -> u64 {
        self.world.read().version
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use services_common::constants;

    fn store() -> MemoryInstanceStore {
        let feed = Arc::new(ChangeFeed::new(
            constants::CHANGE_LOG_RETENTION,
            constants::PUSH_CHANNEL_CAPACITY,
        ));
        MemoryInstanceStore::new(feed)
    }

    fn record(service: &str) -> InstanceRecord {
        let now = Utc::now();
        InstanceRecord {
            instance_id: Uuid::new_v4(),
            service_name: service.to_string(),
            host: "127.0.0.1".to_string(),
            port: 9000,
            version_tag: "1.0.0".to_string(),
            metadata: FxHashMap::default(),
            health_check_url: None,
            weight: 100,
            registered_at: now,
            last_heartbeat: now,
            status: InstanceStatus::Healthy,
        }
    }

    #[tokio::test]
    async fn every_mutation_bumps_the_version_exactly_once() {
        let store = store();
        let r = record("Orders");
        assert_eq!(store.upsert(r.clone()).await.expect("upsert"), 1);
        assert!(store.touch(r.instance_id).await);
        assert_eq!(store.version().await, 2);
        assert!(store.set_status(r.instance_id, InstanceStatus::Unhealthy).await);
        assert_eq!(store.version().await, 3);
        assert_eq!(store.remove(r.instance_id).await, (true, 4));
    }

    #[tokio::test]
    async fn identical_upserts_are_idempotent_on_observable_state() {
        let store = store();
        let r = record("Orders");
        store.upsert(r.clone()).await.expect("first");
        let before = store.get(r.instance_id).await.expect("present");
        store.upsert(r.clone()).await.expect("second");
        let after = store.get(r.instance_id).await.expect("present");
        // Version advanced, snapshots equal
        assert_eq!(store.version().await, 2);
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn rebinding_a_service_is_rejected() {
        let store = store();
        let mut r = record("Orders");
        store.upsert(r.clone()).await.expect("upsert");
        r.service_name = "Billing".to_string();
        let err = store.upsert(r).await.expect_err("rebind must fail");
        assert!(matches!(err, MeshError::ServiceBindingChanged { .. }));
        // The failed attempt must not consume a version
        assert_eq!(store.version().await, 1);
    }

    #[tokio::test]
    async fn removing_an_absent_id_changes_nothing() {
        let store = store();
        let r = record("Orders");
        store.upsert(r.clone()).await.expect("upsert");
        assert_eq!(store.remove(r.instance_id).await, (true, 2));
        // Idempotent re-issue: no state change, no version bump
        assert_eq!(store.remove(r.instance_id).await, (false, 2));
        assert!(store.list_by_service("Orders").await.is_empty());
        assert!(store.list_all_names().await.is_empty());
    }

    #[tokio::test]
    async fn heartbeat_never_precedes_registration() {
        let store = store();
        let mut r = record("Orders");
        store.upsert(r.clone()).await.expect("upsert");
        let registered_at = store.get(r.instance_id).await.expect("present").registered_at;

        // A re-registration carrying a stale heartbeat is clamped
        r.last_heartbeat = registered_at - Duration::seconds(30);
        store.upsert(r.clone()).await.expect("re-register");
        let stored = store.get(r.instance_id).await.expect("present");
        assert_eq!(stored.registered_at, registered_at);
        assert!(stored.last_heartbeat >= stored.registered_at);
    }

    #[tokio::test]
    async fn expired_listing_honors_the_threshold() {
        let store = store();
        let mut stale = record("Orders");
        stale.last_heartbeat = Utc::now() - Duration::seconds(90);
        stale.registered_at = stale.last_heartbeat;
        let fresh = record("Orders");
        store.upsert(stale.clone()).await.expect("stale");
        store.upsert(fresh.clone()).await.expect("fresh");

        let expired = store.list_expired(Duration::seconds(60)).await;
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].instance_id, stale.instance_id);
    }

    #[tokio::test]
    async fn set_status_is_idempotent_without_version_noise() {
        let store = store();
        let r = record("Orders");
        store.upsert(r.clone()).await.expect("upsert");
        assert!(store.set_status(r.instance_id, InstanceStatus::Unhealthy).await);
        let v = store.version().await;
        assert!(store.set_status(r.instance_id, InstanceStatus::Unhealthy).await);
        assert_eq!(store.version().await, v);
    }
}
