use async_trait::async_trait;
use std::sync::Arc;

use crate::backends::memory::MemoryDocStore;
#[cfg(feature = "redb")]
use crate::backends::redb::RedbDocStore;
use crate::{
    DocStore, Document, StoreBackendType, StoreConfig, StorageError,
    StorageResult,
};

/// Enum dispatch over the available document store drivers
#[derive(Clone)]
pub enum AnyDocStore {
    Memory(MemoryDocStore),
    #[cfg(feature = "redb")]
    Redb(Arc<RedbDocStore>),
}

impl AnyDocStore {
    /// Open the driver selected by the configuration
    pub fn open(config: StoreConfig) -> StorageResult<Self> {
        config.validate().map_err(StorageError::configuration)?;
        match config.backend_type {
            StoreBackendType::Memory => {
                Ok(AnyDocStore::Memory(MemoryDocStore::new(config)?))
            }
            StoreBackendType::Redb => {
                #[cfg(feature = "redb")]
                {
                    Ok(AnyDocStore::Redb(Arc::new(RedbDocStore::new(config)?)))
                }
                #[cfg(not(feature = "redb"))]
                {
                    Err(StorageError::configuration(
                        "redb backend feature not enabled",
                    ))
                }
            }
        }
    }
}

#[async_trait]
impl DocStore for AnyDocStore {
    async fn start(&self) -> StorageResult<()> {
        match self {
            Self::Memory(s) => s.start().await,
            #[cfg(feature = "redb")]
            Self::Redb(s) => s.start().await,
        }
    }

    async fn stop(&self) -> StorageResult<()> {
        match self {
            Self::Memory(s) => s.stop().await,
            #[cfg(feature = "redb")]
            Self::Redb(s) => s.stop().await,
        }
    }

    async fn get(
        &self,
        collection: &str,
        id: &str,
    ) -> StorageResult<Option<Document>> {
        match self {
            Self::Memory(s) => s.get(collection, id).await,
            #[cfg(feature = "redb")]
            Self::Redb(s) => s.get(collection, id).await,
        }
    }

    async fn set(
        &self,
        collection: &str,
        id: &str,
        doc: &Document,
    ) -> StorageResult<()> {
        match self {
            Self::Memory(s) => s.set(collection, id, doc).await,
            #[cfg(feature = "redb")]
            Self::Redb(s) => s.set(collection, id, doc).await,
        }
    }

    async fn del(&self, collection: &str, id: &str) -> StorageResult<()> {
        match self {
            Self::Memory(s) => s.del(collection, id).await,
            #[cfg(feature = "redb")]
            Self::Redb(s) => s.del(collection, id).await,
        }
    }

    async fn drop_collection(&self, collection: &str) -> StorageResult<()> {
        match self {
            Self::Memory(s) => s.drop_collection(collection).await,
            #[cfg(feature = "redb")]
            Self::Redb(s) => s.drop_collection(collection).await,
        }
    }

    fn backend_type(&self) -> StoreBackendType {
        match self {
            Self::Memory(s) => s.backend_type(),
            #[cfg(feature = "redb")]
            Self::Redb(s) => s.backend_type(),
        }
    }
}
