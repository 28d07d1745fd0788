use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use dgc_storage::{DocStore, StorageError};

use crate::error::{FaultKind, ShardError, ShardFault};
use crate::key::split_key;
use crate::slot::{Slot, SlotState, WaiterSignal};

use super::DocumentShard;

impl DocumentShard {
    /// Periodic write-behind: flush dirty unowned slots so commit latency
    /// stays decoupled from backend latency
    pub(crate) async fn persist_loop(self) {
        let period = self
            .core
            .options
            .persist_interval()
            .max(std::time::Duration::from_millis(1));
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if !self.core.running.load(Ordering::Acquire) {
                break;
            }
            if let Err(err) = self.save_pass(false).await {
                debug!(error = %err, "background save pass incomplete");
            }
        }
    }

    /// One pass over the slot table. Before a slot's pending write is
    /// committed to the backend, the coordinator lock is verified (renewal
    /// doubles as verification); a seized lock means the local copy is
    /// stale, so its mutations are discarded and the slot is dropped
    /// without writing. With `verify_all`, verification also covers clean
    /// slots.
    pub(crate) async fn save_pass(
        &self,
        verify_all: bool,
    ) -> Result<(), ShardError> {
        let ttl = self.core.options.auto_unlock_timeout();
        let mut lost: Vec<String> = Vec::new();
        let mut backend_failure: Option<StorageError> = None;

        for slot in self.collect_slots().await {
            let (state, flushable) = {
                let inner = slot.locked();
                (inner.state, inner.dirty && inner.owner.is_none())
            };
            if state != SlotState::Loaded {
                continue;
            }
            if !flushable && !verify_all {
                continue;
            }

            match self
                .core
                .coord
                .renew(&slot.key, &self.core.shard_id, ttl)
                .await
            {
                Ok(true) => {}
                Ok(false) => {
                    lost.push(slot.key.clone());
                    self.force_evict(&slot);
                    continue;
                }
                Err(err) => {
                    warn!(
                        key = %slot.key,
                        error = %err,
                        "coordinator unavailable during save pass"
                    );
                    continue;
                }
            }

            if !flushable {
                continue;
            }
            if let Err(err) = self.flush_slot(&slot).await {
                warn!(
                    key = %slot.key,
                    error = %err,
                    "flush failed, slot stays dirty for the next pass"
                );
                self.emit_fault(ShardFault {
                    kind: FaultKind::BackendUnavailable,
                    keys: vec![slot.key.clone()],
                    detail: err.to_string(),
                });
                backend_failure = Some(err);
            }
        }

        if !lost.is_empty() {
            self.emit_fault(ShardFault {
                kind: FaultKind::LockLost,
                keys: lost.clone(),
                detail: "coordinator lock seized by a peer".to_string(),
            });
            return Err(ShardError::LockLost { keys: lost });
        }
        if let Some(err) = backend_failure {
            return Err(ShardError::BackendUnavailable(err));
        }
        Ok(())
    }

    /// Write one dirty slot through to the backend. The document and its
    /// version are snapshotted under the slot mutex and the write happens
    /// outside it; `dirty` is only cleared when no mutation raced the
    /// write.
    async fn flush_slot(&self, slot: &Arc<Slot>) -> Result<(), StorageError> {
        let snapshot = {
            let inner = slot.locked();
            if inner.state != SlotState::Loaded
                || !inner.dirty
                || inner.owner.is_some()
            {
                None
            } else {
                Some((inner.doc.clone(), inner.version))
            }
        };
        let Some((doc, version)) = snapshot else {
            return Ok(());
        };

        let (collection, id) = split_key(&slot.key);
        match &doc {
            Some(doc) => self.core.store.set(collection, id, doc).await?,
            None => self.core.store.del(collection, id).await?,
        }

        {
            let mut inner = slot.locked();
            if inner.version == version {
                inner.dirty = false;
                inner.has_committed = false;
            }
        }
        self.core.metrics.inc_flushes();
        Ok(())
    }

    /// Drop a slot whose coordinator lock was seized by a peer: local
    /// mutations are discarded, nothing is written, waiters retry against
    /// the new holder. Synchronous so an aborted caller cannot leave the
    /// slot half-evicted.
    pub(crate) fn force_evict(&self, slot: &Arc<Slot>) {
        {
            let mut inner = slot.locked();
            if inner.state != SlotState::Loaded {
                return;
            }
            inner.state = SlotState::Unloading;
            inner.owner = None;
            inner.doc = None;
            inner.shadow = None;
            inner.dirty = false;
            inner.has_committed = false;
            inner.release_requested = false;
        }
        slot.notify_state(SlotState::Unloading);
        slot.coord_held.store(false, Ordering::Release);

        self.core.slots.remove(&slot.key);
        let waiters = {
            let mut inner = slot.locked();
            inner.state = SlotState::Unloaded;
            std::mem::take(&mut inner.waiters)
        };
        for (_, waiter) in waiters {
            let _ = waiter.send(WaiterSignal::Retry);
        }
        slot.notify_state(SlotState::Unloaded);
        self.core.metrics.inc_forced_evictions();
        warn!(
            shard = %self.core.shard_id,
            key = %slot.key,
            "dropped local copy after losing the coordinator lock"
        );
    }
}
