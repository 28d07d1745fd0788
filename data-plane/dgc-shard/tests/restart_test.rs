mod common;

use common::{doc, TestCluster};
use dgc_shard::{ShardError, ShardOptions};
use dgc_storage::DocStore;
use serde_json::json;
use std::time::Duration;

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn stop_flushes_and_restart_reproduces_committed_state() {
    let cluster = TestCluster::new();
    // Persistence driven purely by the shutdown path
    let shard = cluster
        .start_shard(ShardOptions {
            persist_interval_ms: 60_000,
            ..TestCluster::options("s1")
        })
        .await;

    for (key, age) in [("user:1", 30), ("user:2", 41)] {
        shard.lock("c1", key).await.unwrap();
        shard
            .insert("c1", key, doc(json!({"_id": key, "age": age})))
            .await
            .unwrap();
        shard.commit("c1", key).await.unwrap();
    }

    shard.stop().await.unwrap();

    // After stop every public call fails fast
    assert!(matches!(
        shard.find("c1", "user:1").await.unwrap_err(),
        ShardError::Shutdown
    ));
    assert!(matches!(
        shard.lock("c1", "user:1").await.unwrap_err(),
        ShardError::Shutdown
    ));

    // Committed state became durable and the coordinator locks were freed
    assert_eq!(
        cluster.store.get("user", "1").await.unwrap(),
        Some(doc(json!({"_id": "user:1", "age": 30})))
    );
    assert_eq!(cluster.coord.holder("user:1").await, None);
    assert_eq!(cluster.coord.holder("user:2").await, None);

    // A restart serves the last committed state
    shard.start().await.unwrap();
    assert_eq!(
        shard.find_field("c1", "user:2", "age").await.unwrap(),
        Some(json!(41))
    );
    shard.stop().await.unwrap();
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn stop_rolls_back_uncommitted_holds() {
    let cluster = TestCluster::new();
    let shard = cluster
        .start_shard(ShardOptions {
            stop_grace_ms: 50,
            ..TestCluster::options("s1")
        })
        .await;

    shard.lock("c1", "user:3").await.unwrap();
    shard
        .insert("c1", "user:3", doc(json!({"_id": "3"})))
        .await
        .unwrap();

    // The owner never commits; the grace period lapses and the hold is
    // force-released with its mutations rolled back
    shard.stop().await.unwrap();
    assert_eq!(cluster.store.get("user", "3").await.unwrap(), None);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn inflight_commit_lands_during_the_stop_grace_window() {
    let cluster = TestCluster::new();
    // Flushing is left to the shutdown path
    let shard = cluster
        .start_shard(ShardOptions {
            persist_interval_ms: 60_000,
            ..TestCluster::options("s1")
        })
        .await;
    let rain = doc(json!({"_id": "4", "age": 30}));

    shard.lock("c1", "user:4").await.unwrap();
    shard.insert("c1", "user:4", rain.clone()).await.unwrap();

    // The commit races stop(): it starts after the drain begins and must
    // still be allowed to land inside the grace window
    let committer = {
        let shard = shard.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            shard.commit("c1", "user:4").await
        })
    };

    shard.stop().await.unwrap();
    committer
        .await
        .unwrap()
        .expect("commit must land during the stop grace window");

    // The committed value survived the shutdown flush
    assert_eq!(cluster.store.get("user", "4").await.unwrap(), Some(rain));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn start_and_stop_are_idempotent() {
    let cluster = TestCluster::new();
    let shard = cluster.shard("s1").await;

    shard.start().await.unwrap();
    shard.lock("c1", "user:1").await.unwrap();
    shard
        .insert("c1", "user:1", doc(json!({"_id": "1"})))
        .await
        .unwrap();
    shard.commit("c1", "user:1").await.unwrap();

    shard.stop().await.unwrap();
    shard.stop().await.unwrap();
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn calls_before_start_fail_fast() {
    let cluster = TestCluster::new();
    let shard = dgc_shard::DocumentShard::new(
        TestCluster::options("s1"),
        dgc_storage::AnyDocStore::Memory(cluster.store.clone()),
        std::sync::Arc::new(cluster.coord.clone()),
    );
    assert!(matches!(
        shard.find("c1", "user:1").await.unwrap_err(),
        ShardError::Shutdown
    ));
}
