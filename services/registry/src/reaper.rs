//! Health reaper: heartbeat timeouts, eviction, and active probes
//!
//! Two timescales drive the loop: instances whose heartbeat age exceeds
//! the miss threshold stop being Healthy, and instances past the eviction
//! threshold are removed entirely. Independently, an active prober issues
//! GETs against each instance's health endpoint; a 2xx refreshes the
//! heartbeat, anything else demotes Healthy to Unhealthy without evicting.

use chrono::Duration as ChronoDuration;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use services_common::models::InstanceStatus;

use crate::config::HealthConfig;
use crate::store::InstanceStore;

/// Concurrent in-flight probes per round
const PROBE_CONCURRENCY: usize = 16;

/// Background reaper over a shared instance store
pub struct HealthReaper {
    store: Arc<dyn InstanceStore>,
    config: HealthConfig,
    http: reqwest::Client,
}

impl HealthReaper {
    pub fn new(store: Arc<dyn InstanceStore>, config: HealthConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.probe_timeout_seconds))
            .build()?;
        Ok(Self { store, config, http })
    }

    /// Spawn the sweep and probe loops into `tasks`; both stop when the
    /// shutdown signal fires
    pub fn spawn(self, tasks: &mut JoinSet<()>, shutdown: watch::Receiver<bool>) {
        let reaper = Arc::new(self);

        let sweep = Arc::clone(&reaper);
        let mut sweep_shutdown = shutdown.clone();
        tasks.spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(sweep.config.sweep_seconds));
            loop {
                tokio::select! {
                    _ = ticker.tick() => sweep.sweep().await,
                    _ = sweep_shutdown.changed() => {
                        debug!("Reaper sweep loop stopping");
                        break;
                    }
                }
            }
        });

        if reaper.config.probe_enabled {
            let probe = Arc::clone(&reaper);
            let mut probe_shutdown = shutdown;
            tasks.spawn(async move {
                let mut ticker =
                    tokio::time::interval(Duration::from_secs(probe.config.probe_seconds));
                loop {
                    tokio::select! {
                        _ = ticker.tick() => probe.probe_round().await,
                        _ = probe_shutdown.changed() => {
                            debug!("Reaper probe loop stopping");
                            break;
                        }
                    }
                }
            });
        }

        info!(
            miss_seconds = reaper.config.miss_seconds,
            evict_seconds = reaper.config.evict_seconds,
            probe_seconds = reaper.config.probe_seconds,
            probe_enabled = reaper.config.probe_enabled,
            "Health reaper started"
        );
    }

    /// One sweep: demote missed heartbeats, evict the long-dead
    async fn sweep(&self) {
        let miss = ChronoDuration::seconds(self.config.miss_seconds as i64);
        let evict = ChronoDuration::seconds(self.config.evict_seconds as i64);

        for record in self.store.list_expired(evict).await {
            warn!(instance_id = %record.instance_id, service = %record.service_name,
                "Evicting instance after missed heartbeats");
            self.store.remove(record.instance_id).await;
        }

        for record in self.store.list_expired(miss).await {
            if record.status == InstanceStatus::Healthy {
                warn!(instance_id = %record.instance_id, service = %record.service_name,
                    "Heartbeat missed, marking Unhealthy");
                self.store
                    .set_status(record.instance_id, InstanceStatus::Unhealthy)
                    .await;
            }
        }
    }

    /// One probe round over every registered instance
    async fn probe_round(&self) {
        let instances = self.store.list_all().await;
        if instances.is_empty() {
            return;
        }
        debug!(count = instances.len(), "Probing health endpoints");

        futures_util::stream::iter(instances)
            .for_each_concurrent(PROBE_CONCURRENCY, |record| async move {
                let url = record.probe_url();
                match self.http.get(&url).send().await {
                    Ok(response) if response.status().is_success() => {
                        // A passing probe counts as a heartbeat
                        self.store.touch(record.instance_id).await;
                    }
                    outcome => {
                        if record.status == InstanceStatus::Healthy {
                            match outcome {
                                Ok(response) => warn!(
                                    instance_id = %record.instance_id, %url,
                                    status = %response.status(),
                                    "Health probe failed"
                                ),
                                Err(e) => warn!(
                                    instance_id = %record.instance_id, %url, error = %e,
                                    "Health probe unreachable"
                                ),
                            }
                            self.store
                                .set_status(record.instance_id, InstanceStatus::Unhealthy)
                                .await;
                        }
                    }
                }
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::ChangeFeed;
    use crate::store::MemoryInstanceStore;
    use chrono::Utc;
    use rustc_hash::FxHashMap;
    use services_common::models::InstanceRecord;
    use uuid::Uuid;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_store() -> Arc<MemoryInstanceStore> {
        Arc::new(MemoryInstanceStore::new(Arc::new(ChangeFeed::new(1024, 64))))
    }

    fn config() -> HealthConfig {
        HealthConfig {
            miss_seconds: 60,
            evict_seconds: 120,
            sweep_seconds: 1,
            probe_seconds: 1,
            probe_timeout_seconds: 5,
            probe_enabled: true,
        }
    }

    fn record_with_age(service: &str, age_secs: i64) -> InstanceRecord {
        let beat = Utc::now() - ChronoDuration::seconds(age_secs);
        InstanceRecord {
            instance_id: Uuid::new_v4(),
            service_name: service.to_string(),
            host: "127.0.0.1".to_string(),
            port: 9000,
            version_tag: "1.0.0".to_string(),
            metadata: FxHashMap::default(),
            health_check_url: None,
            weight: 100,
            registered_at: beat,
            last_heartbeat: beat,
            status: InstanceStatus::Healthy,
        }
    }

    #[tokio::test]
    async fn sweep_demotes_then_evicts() {
        let store = test_store();
        let missed = record_with_age("Orders", 90);
        let dead = record_with_age("Orders", 150);
        let fresh = record_with_age("Orders", 5);
        for r in [&missed, &dead, &fresh] {
            store.upsert(r.clone()).await.expect("upsert");
        }

        let reaper =
            HealthReaper::new(Arc::clone(&store) as Arc<dyn InstanceStore>, config())
                .expect("reaper");
        reaper.sweep().await;

        let missed_now = store.get(missed.instance_id).await.expect("still present");
        assert_eq!(missed_now.status, InstanceStatus::Unhealthy);
        assert!(store.get(dead.instance_id).await.is_none());
        let fresh_now = store.get(fresh.instance_id).await.expect("present");
        assert_eq!(fresh_now.status, InstanceStatus::Healthy);
    }

    #[tokio::test]
    async fn passing_probe_refreshes_the_heartbeat() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let store = test_store();
        let mut stale = record_with_age("Orders", 45);
        stale.status = InstanceStatus::Unhealthy;
        let uri = server.uri();
        let authority = uri.trim_start_matches("http://");
        let (host, port) = authority.split_once(':').expect("host:port");
        stale.host = host.to_string();
        stale.port = port.parse().expect("port");
        store.upsert(stale.clone()).await.expect("upsert");

        let reaper =
            HealthReaper::new(Arc::clone(&store) as Arc<dyn InstanceStore>, config())
                .expect("reaper");
        reaper.probe_round().await;

        let probed = store.get(stale.instance_id).await.expect("present");
        assert_eq!(probed.status, InstanceStatus::Healthy);
        assert!(probed.heartbeat_age(Utc::now()).num_seconds() < 5);
    }

    #[tokio::test]
    async fn failing_probe_demotes_without_evicting() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let store = test_store();
        let mut healthy = record_with_age("Orders", 5);
        let uri = server.uri();
        let authority = uri.trim_start_matches("http://");
        let (host, port) = authority.split_once(':').expect("host:port");
        healthy.host = host.to_string();
        healthy.port = port.parse().expect("port");
        store.upsert(healthy.clone()).await.expect("upsert");

        let reaper =
            HealthReaper::new(Arc::clone(&store) as Arc<dyn InstanceStore>, config())
                .expect("reaper");
        reaper.probe_round().await;

        let probed = store.get(healthy.instance_id).await.expect("not evicted");
        assert_eq!(probed.status, InstanceStatus::Unhealthy);
    }
}
