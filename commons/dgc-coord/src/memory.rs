use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

use crate::{
    CoordMessage, CoordResult, CoordinationDriver, LockAttempt,
};

struct LockRecord {
    holder: String,
    expires_at: Instant,
}

struct Subscriber {
    prefix: String,
    tx: mpsc::UnboundedSender<CoordMessage>,
}

#[derive(Default)]
struct CoordState {
    locks: Mutex<HashMap<String, LockRecord>>,
    subscribers: Mutex<Vec<Subscriber>>,
}

/// In-process coordination driver.
///
/// Clones share state, so multiple shards in one process coordinate
/// through a single instance. Expiry is evaluated lazily on access, which
/// matches the peers' behavior: a hung holder is only displaced when
/// someone asks.
#[derive(Clone, Default)]
pub struct MemoryCoordinator {
    state: Arc<CoordState>,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder of a key's ownership record, if unexpired
    pub async fn holder(&self, key: &str) -> Option<String> {
        let locks = self.state.locks.lock().await;
        locks.get(key).and_then(|record| {
            (record.expires_at > Instant::now())
                .then(|| record.holder.clone())
        })
    }
}

#[async_trait]
impl CoordinationDriver for MemoryCoordinator {
    async fn lock(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> CoordResult<LockAttempt> {
        let mut locks = self.state.locks.lock().await;
        let now = Instant::now();
        match locks.get(key) {
            Some(record)
                if record.expires_at > now && record.holder != owner =>
            {
                Ok(LockAttempt::Held {
                    holder: record.holder.clone(),
                })
            }
            _ => {
                locks.insert(
                    key.to_string(),
                    LockRecord {
                        holder: owner.to_string(),
                        expires_at: now + ttl,
                    },
                );
                Ok(LockAttempt::Acquired)
            }
        }
    }

    async fn unlock(&self, key: &str, owner: &str) -> CoordResult<bool> {
        let mut locks = self.state.locks.lock().await;
        match locks.get(key) {
            Some(record) if record.holder == owner => {
                locks.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn renew(
        &self,
        key: &str,
        owner: &str,
        ttl: Duration,
    ) -> CoordResult<bool> {
        let mut locks = self.state.locks.lock().await;
        let now = Instant::now();
        match locks.get_mut(key) {
            Some(record)
                if record.holder == owner && record.expires_at > now =>
            {
                record.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn force_unlock(&self, key: &str) -> CoordResult<()> {
        let mut locks = self.state.locks.lock().await;
        locks.remove(key);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> CoordResult<()> {
        let mut subscribers = self.state.subscribers.lock().await;
        // Deliver to matching subscribers, pruning closed ones
        subscribers.retain(|sub| {
            if !channel.starts_with(&sub.prefix) {
                return !sub.tx.is_closed();
            }
            sub.tx
                .send(CoordMessage {
                    channel: channel.to_string(),
                    payload: payload.to_string(),
                })
                .is_ok()
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        prefix: &str,
    ) -> CoordResult<mpsc::UnboundedReceiver<CoordMessage>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.state.subscribers.lock().await;
        subscribers.push(Subscriber {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_lock_is_set_if_absent() {
        let coord = MemoryCoordinator::new();

        assert_eq!(
            coord.lock("user:1", "s1", TTL).await.unwrap(),
            LockAttempt::Acquired
        );
        assert_eq!(
            coord.lock("user:1", "s2", TTL).await.unwrap(),
            LockAttempt::Held {
                holder: "s1".to_string()
            }
        );
        // Re-lock by the holder refreshes and succeeds
        assert_eq!(
            coord.lock("user:1", "s1", TTL).await.unwrap(),
            LockAttempt::Acquired
        );
    }

    #[tokio::test]
    async fn test_unlock_is_compare_and_delete() {
        let coord = MemoryCoordinator::new();
        coord.lock("user:1", "s1", TTL).await.unwrap();

        assert!(!coord.unlock("user:1", "s2").await.unwrap());
        assert!(coord.unlock("user:1", "s1").await.unwrap());
        // Already gone
        assert!(!coord.unlock("user:1", "s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_lock_can_be_taken() {
        let coord = MemoryCoordinator::new();
        coord
            .lock("user:1", "s1", Duration::from_millis(20))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(
            coord.lock("user:1", "s2", TTL).await.unwrap(),
            LockAttempt::Acquired
        );
        // The displaced holder can no longer renew or unlock
        assert!(!coord.renew("user:1", "s1", TTL).await.unwrap());
        assert!(!coord.unlock("user:1", "s1").await.unwrap());
    }

    #[tokio::test]
    async fn test_renew_extends_only_for_holder() {
        let coord = MemoryCoordinator::new();
        coord
            .lock("user:1", "s1", Duration::from_millis(80))
            .await
            .unwrap();

        assert!(!coord.renew("user:1", "s2", TTL).await.unwrap());
        assert!(coord.renew("user:1", "s1", TTL).await.unwrap());

        tokio::time::sleep(Duration::from_millis(120)).await;
        // Still held thanks to the renewal
        assert_eq!(coord.holder("user:1").await.as_deref(), Some("s1"));
    }

    #[tokio::test]
    async fn test_force_unlock_is_unconditional() {
        let coord = MemoryCoordinator::new();
        coord.lock("user:1", "s1", TTL).await.unwrap();
        coord.force_unlock("user:1").await.unwrap();
        assert_eq!(
            coord.lock("user:1", "s2", TTL).await.unwrap(),
            LockAttempt::Acquired
        );
    }

    #[tokio::test]
    async fn test_publish_respects_prefix() {
        let coord = MemoryCoordinator::new();
        let mut requests = coord.subscribe("request:").await.unwrap();
        let mut other = coord.subscribe("other:").await.unwrap();

        coord.publish("request:user:1", "s2").await.unwrap();

        let msg = requests.recv().await.unwrap();
        assert_eq!(msg.channel, "request:user:1");
        assert_eq!(msg.payload, "s2");
        assert!(other.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let coord = MemoryCoordinator::new();
        let peer = coord.clone();

        coord.lock("user:1", "s1", TTL).await.unwrap();
        assert_eq!(
            peer.lock("user:1", "s2", TTL).await.unwrap(),
            LockAttempt::Held {
                holder: "s1".to_string()
            }
        );
    }
}
