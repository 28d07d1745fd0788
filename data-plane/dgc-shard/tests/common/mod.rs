#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use dgc_coord::MemoryCoordinator;
use dgc_shard::{DocumentShard, ShardOptions};
use dgc_storage::{AnyDocStore, Document, MemoryDocStore, StoreConfig};

/// Shared durable backend and coordination service; every shard started
/// from one cluster coordinates through the same state, as separate
/// processes would through the real services.
pub struct TestCluster {
    pub coord: MemoryCoordinator,
    pub store: MemoryDocStore,
}

impl TestCluster {
    pub fn new() -> Self {
        Self {
            coord: MemoryCoordinator::new(),
            store: MemoryDocStore::new(StoreConfig::memory())
                .expect("memory store"),
        }
    }

    /// Base options for tests: fast persistence, no unload grace
    pub fn options(shard_id: &str) -> ShardOptions {
        ShardOptions {
            shard_id: Some(shard_id.to_string()),
            persist_interval_ms: 50,
            ..Default::default()
        }
    }

    pub async fn start_shard(&self, options: ShardOptions) -> DocumentShard {
        let shard = DocumentShard::new(
            options,
            AnyDocStore::Memory(self.store.clone()),
            Arc::new(self.coord.clone()),
        );
        shard.start().await.expect("start shard");
        shard
    }

    pub async fn shard(&self, shard_id: &str) -> DocumentShard {
        self.start_shard(Self::options(shard_id)).await
    }
}

pub fn doc(value: serde_json::Value) -> Document {
    Document::try_from(value).expect("JSON object")
}

/// Poll until the condition holds or the timeout lapses
pub async fn wait_until<F: FnMut() -> bool>(
    mut condition: F,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
