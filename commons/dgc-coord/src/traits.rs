use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::CoordResult;

/// Outcome of an atomic set-if-absent lock attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockAttempt {
    /// The lock is now held by the caller
    Acquired,
    /// Another owner holds the lock
    Held { holder: String },
}

/// A message delivered on a subscribed channel
#[derive(Debug, Clone)]
pub struct CoordMessage {
    pub channel: String,
    pub payload: String,
}

/// Client interface over the shared coordination service.
///
/// The service arbitrates cross-shard key ownership: an expiring
/// single-holder record per key, touched only through atomic primitives,
/// plus pub/sub on key-scoped channels for release-request signalling.
#[async_trait]
pub trait CoordinationDriver: Send + Sync {
    /// Atomic set-if-absent of the ownership record with expiry `ttl`.
    /// A re-lock by the current holder refreshes the expiry.
    async fn lock(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> CoordResult<LockAttempt>;

    /// Atomic compare-and-delete. Returns `false` when the record is
    /// missing or held by a different owner.
    async fn unlock(&self, key: &str, owner: &str) -> CoordResult<bool>;

    /// Extend the expiry iff still held by `owner`
    async fn renew(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> CoordResult<bool>;

    /// Unconditional delete of the ownership record
    async fn force_unlock(&self, key: &str) -> CoordResult<()>;

    /// Publish a payload on a channel
    async fn publish(&self, channel: &str, payload: &str) -> CoordResult<()>;

    /// Receive every publish on channels starting with `prefix`
    async fn subscribe(
        &self,
        prefix: &str,
    ) -> CoordResult<mpsc::UnboundedReceiver<CoordMessage>>;
}
