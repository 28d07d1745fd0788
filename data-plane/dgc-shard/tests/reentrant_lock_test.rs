mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{doc, TestCluster};
use dgc_shard::ShardError;
use serde_json::json;

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn lock_is_reentrant_for_the_owning_connection() {
    let cluster = TestCluster::new();
    let shard = cluster.shard("s1").await;

    shard.lock("c1", "user:1").await.unwrap();
    // Re-entrant: same connection, no deadlock
    shard.lock("c1", "user:1").await.unwrap();

    // A second connection must wait for the commit
    let waiter = {
        let shard = shard.clone();
        tokio::spawn(async move { shard.lock("c2", "user:1").await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished(), "c2 acquired a held lock");

    shard.commit("c1", "user:1").await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter was never granted the lock")
        .unwrap()
        .unwrap();

    // Ownership changed hands: c1 can no longer mutate
    assert!(matches!(
        shard
            .insert("c1", "user:1", doc(json!({"_id": "1"})))
            .await
            .unwrap_err(),
        ShardError::ContractViolation(_)
    ));
    shard.commit("c2", "user:1").await.unwrap();
}

#[test_log::test(tokio::test(flavor = "multi_thread"))]
async fn waiters_are_granted_in_fifo_order() {
    let cluster = TestCluster::new();
    let shard = cluster.shard("s1").await;
    let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

    shard.lock("c1", "user:1").await.unwrap();

    let enqueue = |conn: &'static str| {
        let shard = shard.clone();
        let order = Arc::clone(&order);
        tokio::spawn(async move {
            shard.lock(conn, "user:1").await.unwrap();
            order.lock().unwrap().push(conn);
            shard.commit(conn, "user:1").await.unwrap();
        })
    };

    let second = enqueue("c2");
    tokio::time::sleep(Duration::from_millis(50)).await;
    let third = enqueue("c3");
    tokio::time::sleep(Duration::from_millis(50)).await;

    shard.commit("c1", "user:1").await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), async {
        second.await.unwrap();
        third.await.unwrap();
    })
    .await
    .expect("queued waiters never completed");

    assert_eq!(*order.lock().unwrap(), vec!["c2", "c3"]);
}
