#[path = "common/mod.rs"]
mod common;

use common::{eventually, test_config, TestNetwork};
use kad_sdht::{DhtConfig, HashAlgorithm, Record};
use tokio::time::Duration;

#[tokio::test]
async fn replication_pushes_local_values_to_neighbours() {
    let config = DhtConfig {
        replication_interval: Duration::ZERO,
        ..test_config()
    };
    let mut net = TestNetwork::new();
    let a = net.spawn("a", config.clone());
    let b = net.spawn("b", config.clone());
    let c = net.spawn("c", config);
    net.connect_all().await;

    let record = Record::new(HashAlgorithm::Blake3, b"replicate me".to_vec());
    b.storage()
        .set(&record.key, &record.data, None)
        .expect("local set");
    assert_eq!(a.storage().get(&record.key).expect("get"), None);

    b.replicate_database().await;

    assert_eq!(a.storage().get(&record.key).expect("get"), Some(record.data.clone()));
    assert_eq!(c.storage().get(&record.key).expect("get"), Some(record.data));
}

#[tokio::test]
async fn recently_replicated_values_stay_put() {
    let config = DhtConfig {
        replication_interval: Duration::from_secs(3600),
        ..test_config()
    };
    let mut net = TestNetwork::new();
    let a = net.spawn("a", config.clone());
    let b = net.spawn("b", config);
    net.connect_all().await;

    let record = Record::new(HashAlgorithm::Blake3, b"fresh".to_vec());
    b.storage()
        .set(&record.key, &record.data, None)
        .expect("local set");
    b.replicate_database().await;

    assert_eq!(a.storage().get(&record.key).expect("get"), None);
}

#[tokio::test]
async fn refresh_marks_buckets_that_found_peers() {
    let config = DhtConfig {
        refresh_interval: Duration::from_secs(3600),
        ..test_config()
    };
    let mut net = TestNetwork::new();
    let a = net.spawn("a", config.clone());
    let b = net.spawn("b", config.clone());
    let _c = net.spawn("c", config.clone());
    net.connect_all().await;

    let idx = a.self_node().zero_prefix_len(b.self_node());
    let due_before = a.table().buckets_needed_for_refresh(config.refresh_interval);
    assert!(due_before.contains(&idx));

    a.refresh_buckets().await;

    let due_after = a.table().buckets_needed_for_refresh(config.refresh_interval);
    assert!(!due_after.contains(&idx));
    assert!(due_after.len() < due_before.len());
}

#[tokio::test]
async fn refresh_leaves_unanswered_buckets_due() {
    let config = test_config();
    let mut net = TestNetwork::new();
    let a = net.spawn("a", config.clone());
    let b = net.spawn("b", config.clone());
    net.connect_all().await;

    net.network.set_offline(b.self_node(), true);
    let idx = a.self_node().zero_prefix_len(b.self_node());
    a.refresh_buckets().await;

    assert!(a
        .table()
        .buckets_needed_for_refresh(config.refresh_interval)
        .contains(&idx));
}

#[tokio::test]
async fn republish_restores_values_the_node_published() {
    let config = DhtConfig {
        republish_interval: Duration::ZERO,
        ..test_config()
    };
    let mut net = TestNetwork::new();
    let a = net.spawn("a", config.clone());
    let b = net.spawn("b", config);
    net.connect_all().await;

    let outcome = a.store(b"republish me".to_vec()).await;
    assert_eq!(outcome.acknowledged, 1);
    b.storage().delete(&outcome.key).expect("delete");

    a.republish().await;
    assert_eq!(
        b.storage().get(&outcome.key).expect("get"),
        Some(b"republish me".to_vec())
    );
}

#[tokio::test]
async fn scheduler_runs_maintenance_on_its_own() {
    let config = DhtConfig {
        tick_interval: Duration::from_millis(50),
        replication_interval: Duration::ZERO,
        ..test_config()
    };
    let mut net = TestNetwork::new();
    let a = net.spawn("a", config.clone());
    let b = net.spawn("b", config);
    net.connect_all().await;

    let record = Record::new(HashAlgorithm::Blake3, b"tick".to_vec());
    b.storage()
        .set(&record.key, &record.data, None)
        .expect("local set");

    let replicated = eventually(Duration::from_secs(2), || {
        matches!(a.storage().get(&record.key), Ok(Some(_)))
    })
    .await;
    assert!(replicated, "the scheduler should replicate without help");
    net.stop_all();
}
