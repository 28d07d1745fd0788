#![cfg(feature = "redb")]

use async_trait::async_trait;
use std::ops::Bound;
use std::path::Path;

use crate::{
    DocStore, Document, StoreBackendType, StoreConfig, StorageError,
    StorageResult,
};

use redb::{Database, ReadableTable, TableDefinition};

// Single KV table; keys are `collection:id`, values are JSON documents
const DOCS: TableDefinition<'static, &'static [u8], &'static [u8]> =
    TableDefinition::new("docs");

/// Redb-backed document store driver
pub struct RedbDocStore {
    db: Database,
    config: StoreConfig,
}

impl RedbDocStore {
    /// Open or create a redb database given a `StoreConfig::redb(path)`
    pub fn new(config: StoreConfig) -> StorageResult<Self> {
        if config.backend_type != StoreBackendType::Redb {
            return Err(StorageError::configuration(
                "RedbDocStore requires backend_type=Redb",
            ));
        }

        let path = config
            .path
            .clone()
            .ok_or_else(|| StorageError::configuration("Path is required"))?;

        let db = if Path::new(&path).exists() {
            Database::open(path)
                .map_err(|e| StorageError::backend(e.to_string()))?
        } else {
            if let Some(parent) = Path::new(&path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .map_err(StorageError::Io)?;
                }
            }
            Database::create(path)
                .map_err(|e| StorageError::backend(e.to_string()))?
        };

        // Ensure the table exists so later read transactions can open it
        let wtxn = db
            .begin_write()
            .map_err(|e| StorageError::backend(e.to_string()))?;
        {
            let _ = wtxn
                .open_table(DOCS)
                .map_err(|e| StorageError::backend(e.to_string()))?;
        }
        wtxn.commit()
            .map_err(|e| StorageError::backend(e.to_string()))?;

        Ok(Self { db, config })
    }

    fn doc_key(collection: &str, id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(collection.len() + id.len() + 1);
        key.extend_from_slice(collection.as_bytes());
        key.push(b':');
        key.extend_from_slice(id.as_bytes());
        key
    }
}

#[async_trait]
impl DocStore for RedbDocStore {
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
        let key = Self::doc_key(collection, id);
        let rtxn = self
            .db
            .begin_read()
            .map_err(|e| StorageError::backend(e.to_string()))?;
        let table = rtxn
            .open_table(DOCS)
            .map_err(|e| StorageError::backend(e.to_string()))?;
        let value = table
            .get(key.as_slice())
            .map_err(|e| StorageError::backend(e.to_string()))?;
        match value {
            Some(bytes) => Ok(Some(Document::from_slice(bytes.value())?)),
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        collection: &str,
        id: &str,
        doc: &Document,
    ) -> StorageResult<()> {
        let key = Self::doc_key(collection, id);
        let bytes = doc.to_bytes()?;
        let wtxn = self
            .db
            .begin_write()
            .map_err(|e| StorageError::backend(e.to_string()))?;
        {
            let mut table = wtxn
                .open_table(DOCS)
                .map_err(|e| StorageError::backend(e.to_string()))?;
            table
                .insert(key.as_slice(), bytes.as_slice())
                .map_err(|e| StorageError::backend(e.to_string()))?;
        }
        wtxn.commit()
            .map_err(|e| StorageError::backend(e.to_string()))?;
        Ok(())
    }

    async fn del(&self, collection: &str, id: &str) -> StorageResult<()> {
        let key = Self::doc_key(collection, id);
        let wtxn = self
            .db
            .begin_write()
            .map_err(|e| StorageError::backend(e.to_string()))?;
        {
            let mut table = wtxn
                .open_table(DOCS)
                .map_err(|e| StorageError::backend(e.to_string()))?;
            let _ = table
                .remove(key.as_slice())
                .map_err(|e| StorageError::backend(e.to_string()))?;
        }
        wtxn.commit()
            .map_err(|e| StorageError::backend(e.to_string()))?;
        Ok(())
    }

    async fn drop_collection(&self, collection: &str) -> StorageResult<()> {
        // All keys for a collection share the `collection:` prefix; the
        // byte after ':' bounds the range
        let mut start = collection.as_bytes().to_vec();
        start.push(b':');
        let mut end = collection.as_bytes().to_vec();
        end.push(b':' + 1);

        let wtxn = self
            .db
            .begin_write()
            .map_err(|e| StorageError::backend(e.to_string()))?;
        {
            let mut table = wtxn
                .open_table(DOCS)
                .map_err(|e| StorageError::backend(e.to_string()))?;

            let mut keys: Vec<Vec<u8>> = Vec::new();
            for item in table
                .range::<&[u8]>((
                    Bound::Included(start.as_slice()),
                    Bound::Excluded(end.as_slice()),
                ))
                .map_err(|e| StorageError::backend(e.to_string()))?
            {
                let (k, _v) =
                    item.map_err(|e| StorageError::backend(e.to_string()))?;
                keys.push(k.value().to_vec());
            }

            for k in &keys {
                let _ = table
                    .remove(k.as_slice())
                    .map_err(|e| StorageError::backend(e.to_string()))?;
            }
        }
        wtxn.commit()
            .map_err(|e| StorageError::backend(e.to_string()))?;
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

    fn temp_store(dir: &tempfile::TempDir) -> RedbDocStore {
        let path = dir.path().join("docs.redb");
        RedbDocStore::new(StoreConfig::redb(path.to_string_lossy()))
            .expect("open redb store")
    }

    #[tokio::test]
    async fn test_redb_store_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = temp_store(&dir);

        let d = doc(json!({"_id": "1", "name": "rain", "age": 30}));
        store.set("user", "1", &d).await.unwrap();
        assert_eq!(store.get("user", "1").await.unwrap(), Some(d));

        store.del("user", "1").await.unwrap();
        assert_eq!(store.get("user", "1").await.unwrap(), None);
        store.del("user", "1").await.unwrap();
    }

    #[tokio::test]
    async fn test_redb_store_survives_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let d = doc(json!({"v": 7}));
        {
            let store = temp_store(&dir);
            store.set("user", "1", &d).await.unwrap();
        }
        let store = temp_store(&dir);
        assert_eq!(store.get("user", "1").await.unwrap(), Some(d));
    }

    #[tokio::test]
    async fn test_redb_drop_collection_is_prefix_scoped() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = temp_store(&dir);

        store.set("user", "1", &doc(json!({"v": 1}))).await.unwrap();
        store.set("user", "2", &doc(json!({"v": 2}))).await.unwrap();
        // `users` shares a textual prefix with `user` but is another collection
        store.set("users", "1", &doc(json!({"v": 3}))).await.unwrap();

        store.drop_collection("user").await.unwrap();
        assert_eq!(store.get("user", "1").await.unwrap(), None);
        assert_eq!(store.get("user", "2").await.unwrap(), None);
        assert!(store.get("users", "1").await.unwrap().is_some());
    }
}
