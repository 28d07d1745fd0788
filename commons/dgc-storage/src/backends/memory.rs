use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::{
    DocStore, Document, StoreBackendType, StoreConfig, StorageError,
    StorageResult,
};

type CollectionMap = HashMap<String, HashMap<String, Document>>;

/// In-memory document store driver.
///
/// Clones share the underlying map, so multiple shards in one process can
/// treat one instance as their common durable backend.
#[derive(Debug, Clone)]
pub struct MemoryDocStore {
    collections: Arc<RwLock<CollectionMap>>,
    config: StoreConfig,
}

impl MemoryDocStore {
    /// Create a new memory store
    pub fn new(config: StoreConfig) -> StorageResult<Self> {
        if config.backend_type != StoreBackendType::Memory {
            return Err(StorageError::configuration(
                "Invalid backend type for MemoryDocStore",
            ));
        }

        Ok(Self {
            collections: Arc::new(RwLock::new(HashMap::new())),
            config,
        })
    }

    /// Number of resident documents across all collections
    pub async fn count(&self) -> u64 {
        let collections = self.collections.read().await;
        collections.values().map(|c| c.len() as u64).sum()
    }
}

impl Default for MemoryDocStore {
    fn default() -> Self {
        Self {
            collections: Arc::new(RwLock::new(HashMap::new())),
            config: StoreConfig::memory(),
        }
    }
}

#[async_trait]
impl DocStore for MemoryDocStore {
    async fn start(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn stop(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn get(
        &self,
        collection: &str,
        id: &str,
    ) -> StorageResult<Option<Document>> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    async fn set(
        &self,
        collection: &str,
        id: &str,
        doc: &Document,
    ) -> StorageResult<()> {
        let mut collections = self.collections.write().await;
        collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), doc.clone());
        Ok(())
    }

    async fn del(&self, collection: &str, id: &str) -> StorageResult<()> {
        let mut collections = self.collections.write().await;
        if let Some(docs) = collections.get_mut(collection) {
            docs.remove(id);
        }
        Ok(())
    }

    async fn drop_collection(&self, collection: &str) -> StorageResult<()> {
        let mut collections = self.collections.write().await;
        collections.remove(collection);
        Ok(())
    }

    fn backend_type(&self) -> StoreBackendType {
        self.config.backend_type.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> Document {
        Document::try_from(value).unwrap()
    }

    #[tokio::test]
    async fn test_memory_store_basic_operations() {
        let store = MemoryDocStore::new(StoreConfig::memory()).unwrap();
        let d = doc(json!({"_id": "1", "name": "rain"}));

        store.set("user", "1", &d).await.unwrap();
        assert_eq!(store.get("user", "1").await.unwrap(), Some(d));

        store.del("user", "1").await.unwrap();
        assert_eq!(store.get("user", "1").await.unwrap(), None);

        // del on absent is a success
        store.del("user", "1").await.unwrap();
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let store = MemoryDocStore::new(StoreConfig::memory()).unwrap();
        let peer = store.clone();

        let d = doc(json!({"v": 1}));
        store.set("user", "1", &d).await.unwrap();
        assert_eq!(peer.get("user", "1").await.unwrap(), Some(d));
    }

    #[tokio::test]
    async fn test_drop_collection() {
        let store = MemoryDocStore::new(StoreConfig::memory()).unwrap();
        store.set("user", "1", &doc(json!({"v": 1}))).await.unwrap();
        store.set("user", "2", &doc(json!({"v": 2}))).await.unwrap();
        store.set("order", "1", &doc(json!({"v": 3}))).await.unwrap();

        store.drop_collection("user").await.unwrap();
        assert_eq!(store.get("user", "1").await.unwrap(), None);
        assert_eq!(store.get("user", "2").await.unwrap(), None);
        assert!(store.get("order", "1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_wrong_backend_type_rejected() {
        let result = MemoryDocStore::new(StoreConfig::redb("/tmp/x.redb"));
        assert!(matches!(
            result.unwrap_err(),
            StorageError::Configuration(_)
        ));
    }
}
