//! Discovery cache convergence tests against a live registry

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;

use discovery_cache::{BalancerPolicy, CacheConfig, DiscoveryCache, LoadBalancer};
use pretty_assertions::assert_eq;
use services_common::RegistryClient;
use test_utils::{RegistryHarness, register_request};

fn cache_for(harness: &RegistryHarness, push_enabled: bool) -> Arc<DiscoveryCache> {
    let client = RegistryClient::new(&harness.base_url()).expect("client");
    Arc::new(DiscoveryCache::new(
        client,
        LoadBalancer::new(BalancerPolicy::RoundRobin),
        CacheConfig {
            sync_interval: Duration::from_millis(200),
            apply_interval: Duration::from_millis(50),
            apply_batch_size: 100,
            reconnect_backoff: Duration::from_millis(200),
            push_enabled,
        },
    ))
}

#[tokio::test]
async fn incremental_pull_converges_to_registry_state() {
    let harness = RegistryHarness::spawn().await;
    let client = RegistryClient::new(&harness.base_url()).expect("client");
    let cache = cache_for(&harness, false);

    let a = client
        .register(&register_request("Orders", "10.0.0.1", 5001))
        .await
        .expect("register A")
        .instance_id
        .expect("id");
    let mut b_request = register_request("Orders", "10.0.0.2", 5001);
    b_request.instance_id = Some(uuid::Uuid::new_v4());
    client.register(&b_request).await.expect("register B");

    cache.pull_once().await;
    assert_eq!(cache.discover("Orders", None, true).len(), 2);
    let cursor = cache.version();
    assert!(cursor > 0);

    // Register C, remove A, reweight B, then pull the delta
    let c = client
        .register(&register_request("Orders", "10.0.0.3", 5001))
        .await
        .expect("register C")
        .instance_id
        .expect("id");
    client.deregister(a).await.expect("deregister A");
    b_request.weight = Some(50);
    client.register(&b_request).await.expect("update B");

    cache.pull_once().await;
    assert_eq!(cache.version(), cursor + 3);

    let snapshot = cache.discover("Orders", None, false);
    let mut ids: Vec<uuid::Uuid> = snapshot.iter().map(|r| r.instance_id).collect();
    ids.sort();
    let mut expected = vec![c, b_request.instance_id.expect("id")];
    expected.sort();
    assert_eq!(ids, expected, "cache shows exactly B' and C");
    let b_cached = snapshot
        .iter()
        .find(|r| Some(r.instance_id) == b_request.instance_id)
        .expect("B cached");
    assert_eq!(b_cached.weight, 50);

    harness.stop().await;
}

#[tokio::test]
async fn cache_converges_without_the_push_channel() {
    let harness = RegistryHarness::spawn().await;
    let client = RegistryClient::new(&harness.base_url()).expect("client");
    let cache = cache_for(&harness, false);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();
    cache.start(&mut tasks, shutdown_rx);

    client
        .register(&register_request("Orders", "10.0.0.1", 5001))
        .await
        .expect("register");

    // Under push outage the pull loop alone must converge within two
    // sync intervals
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(cache.discover("Orders", None, true).len(), 1);

    let _ = shutdown_tx.send(true);
    while tasks.join_next().await.is_some() {}
    harness.stop().await;
}

#[tokio::test]
async fn push_events_reach_the_cache_between_pulls() {
    let harness = RegistryHarness::spawn().await;
    let client = RegistryClient::new(&harness.base_url()).expect("client");

    // Pull cadence far too slow to explain convergence; push must do it
    let registry_client = RegistryClient::new(&harness.base_url()).expect("client");
    let cache = Arc::new(DiscoveryCache::new(
        registry_client,
        LoadBalancer::new(BalancerPolicy::RoundRobin),
        CacheConfig {
            sync_interval: Duration::from_secs(3600),
            apply_interval: Duration::from_millis(50),
            apply_batch_size: 100,
            reconnect_backoff: Duration::from_millis(100),
            push_enabled: true,
        },
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = JoinSet::new();
    cache.start(&mut tasks, shutdown_rx);

    // Give the push channel a moment to connect, then mutate
    tokio::time::sleep(Duration::from_millis(300)).await;
    client
        .register(&register_request("Orders", "10.0.0.1", 5001))
        .await
        .expect("register");

    let mut converged = false;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if cache.discover("Orders", None, true).len() == 1 {
            converged = true;
            break;
        }
    }
    assert!(converged, "push event should populate the cache without a pull");

    let _ = shutdown_tx.send(true);
    while tasks.join_next().await.is_some() {}
    harness.stop().await;
}

#[tokio::test]
async fn subscriber_sees_healthy_set_transitions() {
    let harness = RegistryHarness::spawn().await;
    let client = RegistryClient::new(&harness.base_url()).expect("client");
    let cache = cache_for(&harness, false);

    let notifications = Arc::new(parking_lot_counter::Counter::default());
    let seen = Arc::clone(&notifications);
    cache.subscribe(
        "Orders",
        Arc::new(move |_service, instances| {
            seen.record(instances.len());
        }),
    );

    let id = client
        .register(&register_request("Orders", "10.0.0.1", 5001))
        .await
        .expect("register")
        .instance_id
        .expect("id");
    cache.pull_once().await;
    client.deregister(id).await.expect("deregister");
    cache.pull_once().await;

    let counts = notifications.snapshot();
    assert_eq!(counts, vec![1, 0], "appearance then disappearance");

    harness.stop().await;
}

/// Tiny synchronized recorder for subscriber callbacks
mod parking_lot_counter {
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct Counter {
        seen: Mutex<Vec<usize>>,
    }

    impl Counter {
        pub fn record(&self, len: usize) {
            self.seen.lock().expect("counter lock").push(len);
        }

        pub fn snapshot(&self) -> Vec<usize> {
            self.seen.lock().expect("counter lock").clone()
        }
    }
}
