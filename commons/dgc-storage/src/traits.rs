use async_trait::async_trait;

use crate::{Document, StorageResult};

/// Uniform interface over durable document store drivers.
///
/// Documents are opaque values keyed by `(collection, id)`. `get` returns
/// `None` (distinct from an empty document) when the key has never been
/// written or has been deleted. `set` overwrites, `del` on an absent key is
/// a success.
#[async_trait]
pub trait DocStore: Send + Sync {
    /// Open connections / resources. Idempotent.
    async fn start(&self) -> StorageResult<()>;

    /// Release connections / resources. Idempotent.
    async fn stop(&self) -> StorageResult<()>;

    /// Read one document, or `None` if absent
    async fn get(
        &self,
        collection: &str,
        id: &str,
    ) -> StorageResult<Option<Document>>;

    /// Write one document, overwriting any previous value
    async fn set(
        &self,
        collection: &str,
        id: &str,
        doc: &Document,
    ) -> StorageResult<()>;

    /// Delete one document; succeeds when the document is already absent
    async fn del(&self, collection: &str, id: &str) -> StorageResult<()>;

    /// Remove a whole collection (test harness use)
    async fn drop_collection(&self, collection: &str) -> StorageResult<()>;

    /// Get backend type information
    fn backend_type(&self) -> crate::StoreBackendType;
}
