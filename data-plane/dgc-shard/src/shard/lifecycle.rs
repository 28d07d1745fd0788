use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::{interval, sleep, Duration, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use dgc_coord::{CoordError, CoordMessage, LockAttempt};
use dgc_storage::{DocStore, Document, StorageError};

use crate::error::{FaultKind, ShardError, ShardFault};
use crate::key::split_key;
use crate::slot::{Slot, SlotState, WaiterSignal};

use super::{DocumentShard, RELEASE_CHANNEL_PREFIX};

const BACKOFF_FLOOR: Duration = Duration::from_millis(5);
const BACKOFF_CEILING: Duration = Duration::from_millis(500);

impl DocumentShard {
    /// Bring a freshly inserted `Loading` slot to `Loaded`: take the
    /// coordinator lock, read the backend, then drain waiters. On failure
    /// the slot is dropped and queued waiters retry from scratch.
    pub(crate) async fn load_slot(
        &self,
        slot: &Arc<Slot>,
        take_owner: Option<&str>,
    ) -> Result<(), ShardError> {
        match self.try_load(slot).await {
            Ok(doc) => {
                let schedule = {
                    let mut inner = slot.locked();
                    inner.doc = doc;
                    inner.state = SlotState::Loaded;
                    inner.touch();
                    match take_owner {
                        Some(conn) => inner.owner = Some(conn.to_string()),
                        None => Slot::grant_next(&mut inner),
                    }
                    inner.release_requested && inner.owner.is_none()
                };
                slot.notify_state(SlotState::Loaded);
                self.core.metrics.inc_loads();
                if schedule {
                    // A peer asked for this key while it was loading
                    self.schedule_unload(
                        Arc::clone(slot),
                        self.core.options.unload_delay(),
                    );
                }
                Ok(())
            }
            Err(err) => {
                self.abandon_load(slot).await;
                Err(err)
            }
        }
    }

    async fn try_load(
        &self,
        slot: &Arc<Slot>,
    ) -> Result<Option<Document>, ShardError> {
        self.acquire_key_lock(&slot.key).await?;
        slot.coord_held.store(true, Ordering::Release);
        if !self.core.running.load(Ordering::Acquire) {
            return Err(ShardError::Shutdown);
        }
        let (collection, id) = split_key(&slot.key);
        let doc = self
            .read_with_retry(collection, id)
            .await
            .map_err(ShardError::BackendUnavailable)?;
        Ok(doc)
    }

    /// Acquire the coordinator lock for `key`. On contention, publish a
    /// release request and retry with exponential backoff; once the
    /// holder's patience window lapses it is presumed hung and the lock is
    /// forcibly removed.
    async fn acquire_key_lock(&self, key: &str) -> Result<(), ShardError> {
        let ttl = self.core.options.auto_unlock_timeout();
        let deadline = Instant::now() + ttl;
        let mut backoff = BACKOFF_FLOOR;
        loop {
            match self
                .core
                .coord
                .lock(key, &self.core.shard_id, ttl)
                .await?
            {
                LockAttempt::Acquired => return Ok(()),
                LockAttempt::Held { holder } => {
                    self.core.metrics.inc_lock_contention();
                    if Instant::now() >= deadline {
                        warn!(
                            shard = %self.core.shard_id,
                            key,
                            holder = %holder,
                            "lock holder presumed hung, forcing unlock"
                        );
                        self.core.coord.force_unlock(key).await?;
                        sleep(BACKOFF_FLOOR).await;
                        continue;
                    }
                    self.core
                        .coord
                        .publish(
                            &format!("{}{}", RELEASE_CHANNEL_PREFIX, key),
                            &self.core.shard_id,
                        )
                        .await?;
                    let remaining = deadline
                        .checked_duration_since(Instant::now())
                        .unwrap_or(Duration::ZERO);
                    sleep(backoff.min(remaining).max(Duration::from_millis(1)))
                        .await;
                    backoff = (backoff * 2).min(BACKOFF_CEILING);
                }
            }
        }
    }

    /// Drop a slot whose load failed and send queued waiters back to retry
    async fn abandon_load(&self, slot: &Arc<Slot>) {
        self.core.slots.remove_async(&slot.key).await;
        let waiters = {
            let mut inner = slot.locked();
            inner.state = SlotState::Unloaded;
            std::mem::take(&mut inner.waiters)
        };
        for (_, waiter) in waiters {
            let _ = waiter.send(WaiterSignal::Retry);
        }
        slot.notify_state(SlotState::Unloaded);
        if slot.coord_held.swap(false, Ordering::AcqRel) {
            let _ = self
                .core
                .coord
                .unlock(&slot.key, &self.core.shard_id)
                .await;
        }
    }

    pub(crate) fn schedule_unload(&self, slot: Arc<Slot>, delay: Duration) {
        let shard = self.clone();
        tokio::spawn(async move {
            if !delay.is_zero() {
                sleep(delay).await;
            }
            if !shard.core.running.load(Ordering::Acquire) {
                return;
            }
            if let Err(err) = shard.unload_slot(&slot).await {
                debug!(
                    key = %slot.key,
                    error = %err,
                    "scheduled unload did not complete"
                );
            }
        });
    }

    /// Drive `Loaded -> Unloading -> Unloaded`: flush dirty state, release
    /// the coordinator lock, drop the slot and wake every waiter. Returns
    /// without effect unless the slot is `Loaded` with no owner.
    pub(crate) async fn unload_slot(
        &self,
        slot: &Arc<Slot>,
    ) -> Result<(), ShardError> {
        {
            let mut inner = slot.locked();
            if inner.state != SlotState::Loaded || inner.owner.is_some() {
                return Ok(());
            }
            inner.state = SlotState::Unloading;
        }
        slot.notify_state(SlotState::Unloading);

        // Mutations are impossible while `Unloading`: ownership is only
        // granted on `Loaded` slots, so the snapshot below is stable
        let (dirty, doc) = {
            let inner = slot.locked();
            (inner.dirty, inner.doc.clone())
        };
        if dirty {
            match self.write_with_retry(&slot.key, &doc).await {
                Ok(()) => {
                    let mut inner = slot.locked();
                    inner.dirty = false;
                    inner.has_committed = false;
                    self.core.metrics.inc_flushes();
                }
                Err(err) => {
                    // Keep the slot resident and dirty; hand ownership to
                    // the next waiter if any
                    {
                        let mut inner = slot.locked();
                        inner.state = SlotState::Loaded;
                        Slot::grant_next(&mut inner);
                    }
                    slot.notify_state(SlotState::Loaded);
                    self.emit_fault(ShardFault {
                        kind: FaultKind::BackendUnavailable,
                        keys: vec![slot.key.clone()],
                        detail: err.to_string(),
                    });
                    return Err(ShardError::BackendUnavailable(err));
                }
            }
        }

        match self
            .core
            .coord
            .unlock(&slot.key, &self.core.shard_id)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    shard = %self.core.shard_id,
                    key = %slot.key,
                    "coordinator lock was seized before release"
                );
                self.emit_fault(ShardFault {
                    kind: FaultKind::LockLost,
                    keys: vec![slot.key.clone()],
                    detail: "lock expired and was seized before release"
                        .to_string(),
                });
            }
            Err(err) => {
                warn!(
                    key = %slot.key,
                    error = %err,
                    "failed to release coordinator lock"
                );
                self.emit_fault(ShardFault {
                    kind: FaultKind::Coordination,
                    keys: vec![slot.key.clone()],
                    detail: err.to_string(),
                });
            }
        }
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
        self.core.metrics.inc_unloads();
        debug!(shard = %self.core.shard_id, key = %slot.key, "slot unloaded");
        Ok(())
    }

    async fn read_with_retry(
        &self,
        collection: &str,
        id: &str,
    ) -> Result<Option<Document>, StorageError> {
        let deadline =
            Instant::now() + self.core.options.auto_unlock_timeout();
        let mut backoff = Duration::from_millis(10);
        loop {
            match self.core.store.get(collection, id).await {
                Ok(doc) => return Ok(doc),
                Err(err) => {
                    if Instant::now() + backoff >= deadline {
                        return Err(err);
                    }
                    debug!(collection, id, error = %err, "backend read failed, retrying");
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_CEILING);
                }
            }
        }
    }

    pub(crate) async fn write_with_retry(
        &self,
        key: &str,
        doc: &Option<Document>,
    ) -> Result<(), StorageError> {
        let (collection, id) = split_key(key);
        let deadline =
            Instant::now() + self.core.options.auto_unlock_timeout();
        let mut backoff = Duration::from_millis(10);
        loop {
            let result = match doc {
                Some(doc) => self.core.store.set(collection, id, doc).await,
                None => self.core.store.del(collection, id).await,
            };
            match result {
                Ok(()) => return Ok(()),
                Err(err) => {
                    if Instant::now() + backoff >= deadline {
                        return Err(err);
                    }
                    debug!(key, error = %err, "backend write failed, retrying");
                    sleep(backoff).await;
                    backoff = (backoff * 2).min(BACKOFF_CEILING);
                }
            }
        }
    }

    // ---- background pipelines ----

    /// Consume release requests published by peers
    pub(crate) async fn release_loop(
        self,
        mut releases: mpsc::UnboundedReceiver<CoordMessage>,
    ) {
        while let Some(msg) = releases.recv().await {
            if !self.core.running.load(Ordering::Acquire) {
                break;
            }
            let Some(key) = msg.channel.strip_prefix(RELEASE_CHANNEL_PREFIX)
            else {
                continue;
            };
            self.handle_release_request(key, &msg.payload).await;
        }
        // A subscription that dies while the shard runs leaves peers
        // unable to request releases; surface that
        if self.core.running.load(Ordering::Acquire) {
            let err = CoordError::ChannelClosed;
            warn!(
                shard = %self.core.shard_id,
                error = %err,
                "release-request subscription ended"
            );
            self.emit_fault(ShardFault {
                kind: FaultKind::Coordination,
                keys: Vec::new(),
                detail: err.to_string(),
            });
        }
    }

    /// A peer asked for `key`: unload right away when nobody holds the
    /// write lock, otherwise flag the slot so the next commit or rollback
    /// schedules the unload.
    pub(crate) async fn handle_release_request(
        &self,
        key: &str,
        requester: &str,
    ) {
        if requester == self.core.shard_id {
            return;
        }
        let Some(slot) = self.get_slot(key) else {
            return;
        };
        self.core.metrics.inc_release_requests();
        let immediate = {
            let mut inner = slot.locked();
            match inner.state {
                SlotState::Loaded => {
                    if inner.owner.is_none() {
                        true
                    } else {
                        inner.release_requested = true;
                        false
                    }
                }
                SlotState::Loading => {
                    inner.release_requested = true;
                    false
                }
                _ => false,
            }
        };
        if immediate {
            debug!(
                shard = %self.core.shard_id,
                key,
                requester,
                "peer requested release, unloading"
            );
            // A peer is blocked on this key; skip the grace period
            self.schedule_unload(slot, Duration::ZERO);
        }
    }

    /// Renew every held coordinator lock at a third of the ttl. A rejected
    /// renewal means the lock expired and was seized: the local copy is
    /// stale and gets dropped.
    pub(crate) async fn renew_loop(self) {
        let ttl = self.core.options.auto_unlock_timeout();
        let period = (ttl / 3).max(Duration::from_millis(10));
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if !self.core.running.load(Ordering::Acquire) {
                break;
            }
            for slot in self.collect_slots().await {
                if !slot.coord_held.load(Ordering::Acquire) {
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
                        self.emit_fault(ShardFault {
                            kind: FaultKind::LockLost,
                            keys: vec![slot.key.clone()],
                            detail: "lock renewal rejected".to_string(),
                        });
                        self.force_evict(&slot);
                    }
                    Err(err) => {
                        warn!(
                            key = %slot.key,
                            error = %err,
                            "coordinator lock renewal failed"
                        );
                    }
                }
            }
        }
    }

    /// Evict slots whose last touch is older than the idle threshold
    pub(crate) async fn idle_loop(self, idle: Duration) {
        let period = (idle / 4).max(Duration::from_millis(10));
        loop {
            sleep(period).await;
            if !self.core.running.load(Ordering::Acquire) {
                break;
            }
            for slot in self.collect_slots().await {
                let expired = {
                    let inner = slot.locked();
                    inner.state == SlotState::Loaded
                        && inner.owner.is_none()
                        && inner.last_touched.elapsed() >= idle
                };
                if expired {
                    debug!(key = %slot.key, "idle timeout reached, unloading");
                    if let Err(err) = self.unload_slot(&slot).await {
                        debug!(
                            key = %slot.key,
                            error = %err,
                            "idle unload did not complete"
                        );
                    }
                }
            }
        }
    }
}
