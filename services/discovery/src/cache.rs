//! Discovery cache: a caller-local mirror of the registry
//!
//! Maintenance runs on three supervised tasks: an incremental pull loop
//! (the source of truth), a best-effort WebSocket push listener feeding
//! an in-memory queue, and a batch applier that drains the queue every
//! 100ms or once it reaches the batch threshold. Lookups are served from
//! local state and never block on the network.

use futures_util::StreamExt;
use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

use services_common::RegistryClient;
use services_common::constants;
use services_common::models::{
    ChangeKind, ChangesResponse, InstanceRecord, InstanceStatus, ServiceChangeEvent,
};

use crate::balancer::LoadBalancer;

/// Callback invoked when a service's healthy set changes; receives the
/// service name and the current instance snapshot
pub type SubscriberCallback = Arc<dyn Fn(&str, &[InstanceRecord]) + Send + Sync>;

/// Cache maintenance tuning
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Incremental pull interval
    pub sync_interval: Duration,
    /// Batch applier tick
    pub apply_interval: Duration,
    /// Queue depth that forces an immediate apply
    pub apply_batch_size: usize,
    /// Backoff between push reconnect attempts
    pub reconnect_backoff: Duration,
    /// Enable the push channel; pull alone still converges
    pub push_enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(constants::CACHE_SYNC_INTERVAL_SECS),
            apply_interval: Duration::from_millis(constants::CACHE_APPLY_INTERVAL_MS),
            apply_batch_size: constants::CACHE_APPLY_BATCH_SIZE,
            reconnect_backoff: Duration::from_secs(5),
            push_enabled: true,
        }
    }
}

struct CacheState {
    instances: FxHashMap<Uuid, InstanceRecord>,
    by_service: FxHashMap<String, FxHashSet<Uuid>>,
    /// Last change-feed version applied per id; push events below their
    /// id's watermark are already reflected and get skipped
    applied: FxHashMap<Uuid, u64>,
    /// Healthy id set per service as of the last notification round
    healthy: FxHashMap<String, FxHashSet<Uuid>>,
}

/// In-caller registry mirror
pub struct DiscoveryCache {
    state: RwLock<CacheState>,
    version: AtomicU64,
    subscribers: RwLock<FxHashMap<String, Vec<SubscriberCallback>>>,
    balancer: LoadBalancer,
    client: RegistryClient,
    config: CacheConfig,
}

impl DiscoveryCache {
    #[must_use]
    pub fn new(client: RegistryClient, balancer: LoadBalancer, config: CacheConfig) -> Self {
        Self {
            state: RwLock::new(CacheState {
                instances: FxHashMap::default(),
                by_service: FxHashMap::default(),
                applied: FxHashMap::default(),
                healthy: FxHashMap::default(),
            }),
            version: AtomicU64::new(0),
            subscribers: RwLock::new(FxHashMap::default()),
            balancer,
            client,
            config,
        }
    }

    /// Local version cursor
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// The balancer used by `pick`
    #[must_use]
    pub fn balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    /// Local snapshot lookup; never blocks on the network
    #[must_use]
    pub fn discover(
        &self,
        service_name: &str,
        version: Option<&str>,
        healthy_only: bool,
    ) -> Vec<InstanceRecord> {
        let state = self.state.read();
        state
            .by_service
            .get(service_name)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| state.instances.get(id))
                    .filter(|r| version.is_none_or(|v| r.version_tag == v))
                    .filter(|r| !healthy_only || r.status == InstanceStatus::Healthy)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// One healthy instance chosen by the configured balancer
    #[must_use]
    pub fn pick(&self, service_name: &str, version: Option<&str>) -> Option<InstanceRecord> {
        let candidates = self.discover(service_name, version, true);
        self.balancer.select(service_name, &candidates).cloned()
    }

    /// All service names known locally
    #[must_use]
    pub fn service_names(&self) -> Vec<String> {
        self.state.read().by_service.keys().cloned().collect()
    }

    /// Resolve a service name ignoring case; an exact match wins
    #[must_use]
    pub fn resolve_name(&self, requested: &str) -> Option<String> {
        let state = self.state.read();
        if state.by_service.contains_key(requested) {
            return Some(requested.to_string());
        }
        state
            .by_service
            .keys()
            .find(|name| name.eq_ignore_ascii_case(requested))
            .cloned()
    }

    /// Invoke `callback` whenever the healthy set of `service_name`
    /// changes (diff by id set or status)
    pub fn subscribe(&self, service_name: &str, callback: SubscriberCallback) {
        self.subscribers
            .write()
            .entry(service_name.to_string())
            .or_default()
            .push(callback);
    }

    /// Spawn the pull, push, and applier tasks into `tasks`
    pub fn start(
        self: &Arc<Self>,
        tasks: &mut JoinSet<()>,
        shutdown: watch::Receiver<bool>,
    ) {
        let (push_tx, push_rx) = mpsc::channel::<ServiceChangeEvent>(1024);

        let puller = Arc::clone(self);
        let mut pull_shutdown = shutdown.clone();
        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(puller.config.sync_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => puller.pull_once().await,
                    _ = pull_shutdown.changed() => break,
                }
            }
        });

        if self.config.push_enabled {
            let listener = Arc::clone(self);
            let push_shutdown = shutdown.clone();
            tasks.spawn(async move {
                listener.push_loop(push_tx, push_shutdown).await;
            });
        }

        let applier = Arc::clone(self);
        tasks.spawn(async move {
            applier.apply_loop(push_rx, shutdown).await;
        });

        info!(
            sync_interval_ms = self.config.sync_interval.as_millis() as u64,
            push_enabled = self.config.push_enabled,
            "Discovery cache started"
        );
    }

    /// One incremental pull against the changes endpoint
    pub async fn pull_once(&self) {
        let cursor = self.version();
        match self.client.changes(cursor).await {
            Ok(response) => self.apply_changes(response),
            Err(e) => warn!(cursor, error = %e, "Incremental pull failed"),
        }
    }

    /// Apply a pull response and advance the cursor
    pub fn apply_changes(&self, response: ChangesResponse) {
        let mut affected: FxHashSet<String> = FxHashSet::default();
        {
            let mut state = self.state.write();
            if response.full_snapshot {
                debug!(version = response.version, "Applying full snapshot reset");
                affected.extend(state.by_service.keys().cloned());
                state.instances.clear();
                state.by_service.clear();
                state.applied.clear();
            }
            for record in response.added_or_updated {
                affected.insert(record.service_name.clone());
                Self::insert_record(&mut state, record, response.version);
            }
            for instance_id in response.removed {
                if let Some(service) = Self::remove_record(&mut state, instance_id) {
                    affected.insert(service);
                }
                // Watermark so a late push replay cannot resurrect the id
                state.applied.insert(instance_id, response.version);
            }
        }
        self.advance_cursor(response.version);
        self.notify(&affected);
    }

    /// Apply a batch of push events, newest version per id wins
    fn apply_push_batch(&self, batch: &mut Vec<ServiceChangeEvent>) {
        if batch.is_empty() {
            return;
        }
        // Only the highest-version event per id survives the batch
        let mut latest: FxHashMap<Uuid, ServiceChangeEvent> = FxHashMap::default();
        for event in batch.drain(..) {
            match latest.get(&event.instance_id) {
                Some(seen) if seen.version >= event.version => {}
                _ => {
                    latest.insert(event.instance_id, event);
                }
            }
        }

        let mut affected: FxHashSet<String> = FxHashSet::default();
        {
            let mut state = self.state.write();
            for (instance_id, event) in latest {
                let watermark = state.applied.get(&instance_id).copied().unwrap_or(0);
                if event.version <= watermark {
                    continue;
                }
                affected.insert(event.service_name.clone());
                match event.kind {
                    ChangeKind::Upsert => {
                        if let Some(record) = event.record {
                            Self::insert_record(&mut state, record, event.version);
                        }
                    }
                    ChangeKind::Remove => {
                        Self::remove_record(&mut state, instance_id);
                        state.applied.insert(instance_id, event.version);
                    }
                }
            }
        }
        self.notify(&affected);
    }

    async fn apply_loop(
        &self,
        mut push_rx: mpsc::Receiver<ServiceChangeEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut ticker = tokio::time::interval(self.config.apply_interval);
        let mut batch: Vec<ServiceChangeEvent> = Vec::new();
        loop {
            tokio::select! {
                _ = ticker.tick() => self.apply_push_batch(&mut batch),
                event = push_rx.recv() => {
                    match event {
                        Some(event) => {
                            batch.push(event);
                            if batch.len() >= self.config.apply_batch_size {
                                self.apply_push_batch(&mut batch);
                            }
                        }
                        None => {
                            self.apply_push_batch(&mut batch);
                            break;
                        }
                    }
                }
                _ = shutdown.changed() => {
                    self.apply_push_batch(&mut batch);
                    break;
                }
            }
        }
    }

    /// Push listener: connect, forward frames into the queue, reconnect
    /// with backoff. Pull remains the source of truth throughout.
    async fn push_loop(
        &self,
        push_tx: mpsc::Sender<ServiceChangeEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let url = self.client.ws_url();
        loop {
            if *shutdown.borrow() {
                return;
            }
            match connect_async(url.as_str()).await {
                Ok((mut stream, _)) => {
                    info!(%url, "Push channel connected");
                    loop {
                        tokio::select! {
                            frame = stream.next() => {
                                match frame {
                                    Some(Ok(Message::Text(text))) => {
                                        match serde_json::from_str::<ServiceChangeEvent>(&text) {
                                            Ok(event) => {
                                                if push_tx.send(event).await.is_err() {
                                                    return;
                                                }
                                            }
                                            Err(e) => warn!(error = %e, "Undecodable push frame"),
                                        }
                                    }
                                    Some(Ok(Message::Close(_))) | None => {
                                        debug!("Push channel closed by registry");
                                        break;
                                    }
                                    Some(Ok(_)) => {}
                                    Some(Err(e)) => {
                                        warn!(error = %e, "Push channel error");
                                        break;
                                    }
                                }
                            }
                            _ = shutdown.changed() => return,
                        }
                    }
                }
                Err(e) => {
                    debug!(%url, error = %e, "Push connect failed, will retry");
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.reconnect_backoff) => {}
                _ = shutdown.changed() => return,
            }
        }
    }

    fn insert_record(state: &mut CacheState, record: InstanceRecord, version: u64) {
        // A record that moved services would be a new id; still, keep the
        // index consistent if the service name ever differs
        if let Some(previous) = state.instances.get(&record.instance_id) {
            if previous.service_name != record.service_name {
                if let Some(ids) = state.by_service.get_mut(&previous.service_name) {
                    ids.remove(&record.instance_id);
                }
            }
        }
        state
            .by_service
            .entry(record.service_name.clone())
            .or_default()
            .insert(record.instance_id);
        state.applied.insert(record.instance_id, version);
        state.instances.insert(record.instance_id, record);
    }

    fn remove_record(state: &mut CacheState, instance_id: Uuid) -> Option<String> {
        let record = state.instances.remove(&instance_id)?;
        if let Some(ids) = state.by_service.get_mut(&record.service_name) {
            ids.remove(&instance_id);
            if ids.is_empty() {
                state.by_service.remove(&record.service_name);
            }
        }
        Some(record.service_name)
    }

    fn advance_cursor(&self, version: u64) {
        // Cursor only moves forward
        let mut current = self.version.load(Ordering::Acquire);
        while version > current {
            match self.version.compare_exchange(
                current,
                version,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    /// Fire subscriber callbacks for services whose healthy set changed
    fn notify(&self, affected: &FxHashSet<String>) {
        if affected.is_empty() {
            return;
        }
        let mut changed: Vec<(String, Vec<InstanceRecord>)> = Vec::new();
        {
            let mut state = self.state.write();
            for service in affected {
                let current: FxHashSet<Uuid> = state
                    .by_service
                    .get(service)
                    .map(|ids| {
                        ids.iter()
                            .filter(|id| {
                                state
                                    .instances
                                    .get(id)
                                    .is_some_and(|r| r.status == InstanceStatus::Healthy)
                            })
                            .copied()
                            .collect()
                    })
                    .unwrap_or_default();
                let previous = state.healthy.get(service);
                if previous != Some(&current) {
                    let snapshot: Vec<InstanceRecord> = state
                        .by_service
                        .get(service)
                        .map(|ids| {
                            ids.iter()
                                .filter_map(|id| state.instances.get(id).cloned())
                                .collect()
                        })
                        .unwrap_or_default();
                    state.healthy.insert(service.clone(), current);
                    changed.push((service.clone(), snapshot));
                }
            }
        }

        let subscribers = self.subscribers.read();
        for (service, snapshot) in changed {
            if let Some(callbacks) = subscribers.get(&service) {
                debug!(service = %service, instances = snapshot.len(), "Healthy set changed");
                for callback in callbacks {
                    callback(&service, &snapshot);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balancer::{BalancerPolicy, LoadBalancer};
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use services_common::models::ServiceChangeEvent;

    fn cache() -> DiscoveryCache {
        DiscoveryCache::new(
            RegistryClient::new("http://127.0.0.1:1").expect("client"),
            LoadBalancer::new(BalancerPolicy::RoundRobin),
            CacheConfig::default(),
        )
    }

    fn record(service: &str, port: u16) -> InstanceRecord {
        let now = Utc::now();
        InstanceRecord {
            instance_id: Uuid::new_v4(),
            service_name: service.to_string(),
            host: "10.0.0.1".to_string(),
            port,
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
    fn pull_response_advances_cursor_and_state() {
        let cache = cache();
        let a = record("Orders", 5001);
        let b = record("Orders", 5002);
        cache.apply_changes(ChangesResponse {
            version: 13,
            added_or_updated: vec![a.clone(), b.clone()],
            removed: vec![],
            full_snapshot: false,
        });
        assert_eq!(cache.version(), 13);
        assert_eq!(cache.discover("Orders", None, true).len(), 2);

        cache.apply_changes(ChangesResponse {
            version: 14,
            added_or_updated: vec![],
            removed: vec![a.instance_id],
            full_snapshot: false,
        });
        let left = cache.discover("Orders", None, false);
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].instance_id, b.instance_id);
    }

    #[test]
    fn snapshot_reset_drops_stale_entries() {
        let cache = cache();
        let stale = record("Orders", 5001);
        cache.apply_changes(ChangesResponse {
            version: 5,
            added_or_updated: vec![stale],
            removed: vec![],
            full_snapshot: false,
        });

        let fresh = record("Orders", 5002);
        cache.apply_changes(ChangesResponse {
            version: 42,
            added_or_updated: vec![fresh.clone()],
            removed: vec![],
            full_snapshot: true,
        });

        let snapshot = cache.discover("Orders", None, false);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].instance_id, fresh.instance_id);
        assert_eq!(cache.version(), 42);
    }

    #[test]
    fn push_batch_keeps_only_the_highest_version_per_id() {
        let cache = cache();
        let mut r = record("Orders", 5001);
        let newer = {
            let mut n = r.clone();
            n.weight = 10;
            n
        };
        r.weight = 90;

        let mut batch = vec![
            ServiceChangeEvent::upsert(8, newer.clone()),
            ServiceChangeEvent::upsert(7, r),
        ];
        cache.apply_push_batch(&mut batch);

        let stored = cache.discover("Orders", None, false);
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].weight, 10);
        assert!(batch.is_empty());
    }

    #[test]
    fn stale_push_events_are_skipped_after_pull() {
        let cache = cache();
        let current = record("Orders", 5001);
        cache.apply_changes(ChangesResponse {
            version: 20,
            added_or_updated: vec![current.clone()],
            removed: vec![],
            full_snapshot: false,
        });

        // A late push replay of an older remove must not clobber the pull
        let mut batch = vec![ServiceChangeEvent::remove(
            12,
            current.instance_id,
            current.service_name.clone(),
        )];
        cache.apply_push_batch(&mut batch);
        assert_eq!(cache.discover("Orders", None, false).len(), 1);
    }

    #[test]
    fn subscribers_fire_on_healthy_set_changes_only() {
        let cache = cache();
        let fired = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&fired);
        cache.subscribe(
            "Orders",
            Arc::new(move |_service, _instances| {
                seen.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let a = record("Orders", 5001);
        cache.apply_changes(ChangesResponse {
            version: 1,
            added_or_updated: vec![a.clone()],
            removed: vec![],
            full_snapshot: false,
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Same healthy set again: no callback
        cache.apply_changes(ChangesResponse {
            version: 2,
            added_or_updated: vec![a.clone()],
            removed: vec![],
            full_snapshot: false,
        });
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Status change flips the healthy set
        let mut demoted = a;
        demoted.status = InstanceStatus::Unhealthy;
        cache.apply_changes(ChangesResponse {
            version: 3,
            added_or_updated: vec![demoted],
            removed: vec![],
            full_snapshot: false,
        });
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn pick_honors_the_balancer_contract() {
        let cache = cache();
        assert!(cache.pick("Orders", None).is_none());

        let mut parked = record("Orders", 5001);
        parked.weight = 0;
        let active = record("Orders", 5002);
        cache.apply_changes(ChangesResponse {
            version: 1,
            added_or_updated: vec![parked, active.clone()],
            removed: vec![],
            full_snapshot: false,
        });

        for _ in 0..20 {
            let chosen = cache.pick("Orders", None).expect("one eligible");
            assert_eq!(chosen.instance_id, active.instance_id);
        }
    }
}
