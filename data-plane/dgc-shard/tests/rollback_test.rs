mod common;

use common::{doc, TestCluster};
use dgc_shard::ShardOptions;
use dgc_storage::DocStore;
use serde_json::json;

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn rollback_restores_the_value_at_start_of_hold() {
    let cluster = TestCluster::new();
    let shard = cluster.shard("s1").await;

    shard.lock("c1", "user:1").await.unwrap();
    shard
        .insert("c1", "user:1", doc(json!({"_id": "1", "age": 30})))
        .await
        .unwrap();
    shard.commit("c1", "user:1").await.unwrap();

    shard.lock("c1", "user:1").await.unwrap();
    let updated = shard
        .update("c1", "user:1", doc(json!({"age": 31})))
        .await
        .unwrap();
    assert_eq!(updated.get("age"), Some(&json!(31)));
    assert_eq!(
        shard.find_field("c1", "user:1", "age").await.unwrap(),
        Some(json!(31))
    );

    shard.rollback("c1", "user:1").await.unwrap();
    assert_eq!(
        shard.find_field("c1", "user:1", "age").await.unwrap(),
        Some(json!(30))
    );
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn rollback_after_insert_restores_absent() {
    let cluster = TestCluster::new();
    let shard = cluster.shard("s1").await;

    shard.lock("c1", "user:1").await.unwrap();
    shard
        .insert("c1", "user:1", doc(json!({"_id": "1"})))
        .await
        .unwrap();
    shard.rollback("c1", "user:1").await.unwrap();

    assert_eq!(shard.find("c1", "user:1").await.unwrap(), None);

    // The undone insert is not dirty; nothing reaches the backend
    shard.save_all().await.unwrap();
    assert_eq!(cluster.store.get("user", "1").await.unwrap(), None);
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn rollback_without_prior_mutation_is_a_no_op() {
    let cluster = TestCluster::new();
    let shard = cluster.shard("s1").await;
    let rain = doc(json!({"_id": "1", "name": "rain"}));

    shard.lock("c1", "user:1").await.unwrap();
    shard.insert("c1", "user:1", rain.clone()).await.unwrap();
    shard.commit("c1", "user:1").await.unwrap();

    shard.lock("c1", "user:1").await.unwrap();
    shard.rollback("c1", "user:1").await.unwrap();
    assert_eq!(shard.find("c1", "user:1").await.unwrap(), Some(rain));
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn rollback_only_reverts_mutations_since_the_last_commit() {
    let cluster = TestCluster::new();
    // Keep the background pipeline out of the picture so the flush below
    // is driven by save_all alone
    let shard = cluster
        .start_shard(ShardOptions {
            persist_interval_ms: 60_000,
            ..TestCluster::options("s1")
        })
        .await;

    shard.lock("c1", "counter:1").await.unwrap();
    shard
        .insert("c1", "counter:1", doc(json!({"v": 1})))
        .await
        .unwrap();
    shard.commit("c1", "counter:1").await.unwrap();

    // A later hold is rolled back; the earlier commit must still be
    // pending for the backend
    shard.lock("c1", "counter:1").await.unwrap();
    shard
        .update("c1", "counter:1", doc(json!({"v": 2})))
        .await
        .unwrap();
    shard.rollback("c1", "counter:1").await.unwrap();

    assert_eq!(
        shard.find_field("c1", "counter:1", "v").await.unwrap(),
        Some(json!(1))
    );

    shard.save_all().await.unwrap();
    assert_eq!(
        cluster.store.get("counter", "1").await.unwrap(),
        Some(doc(json!({"v": 1})))
    );
}
