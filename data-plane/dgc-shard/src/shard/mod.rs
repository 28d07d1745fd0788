mod lifecycle;
mod persistence;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use scc::HashMap;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration, Instant};
use tracing::{info, warn};

use dgc_coord::{CoordinationDriver, MemoryCoordinator};
use dgc_storage::{AnyDocStore, DocStore, Document};

use crate::error::{ShardError, ShardFault};
use crate::metrics::ShardMetrics;
use crate::slot::{Slot, SlotState, WaiterSignal};
use crate::ShardOptions;

/// Channel prefix carrying cross-shard release requests
pub(crate) const RELEASE_CHANNEL_PREFIX: &str = "request:";

pub(crate) struct ShardCore {
    pub(crate) options: ShardOptions,
    pub(crate) shard_id: String,
    pub(crate) store: AnyDocStore,
    pub(crate) coord: Arc<dyn CoordinationDriver>,
    pub(crate) slots: HashMap<String, Arc<Slot>>,
    pub(crate) metrics: Arc<ShardMetrics>,
    /// Cleared only once `stop`'s grace period has lapsed; in-flight
    /// holds may mutate, commit and roll back while it is set
    pub(crate) running: AtomicBool,
    /// Cleared the moment `stop` begins, rejecting new `lock`/`find`
    /// entries while the drain is still in progress
    pub(crate) accepting: AtomicBool,
    pub(crate) tasks: Mutex<Vec<JoinHandle<()>>>,
    pub(crate) faults: broadcast::Sender<ShardFault>,
}

/// One shard of the coordinated document cache.
///
/// Reads and writes run at memory speed against slots resident in this
/// process; the coordination service guarantees that at most one shard
/// holds an active copy of a key at any instant. The handle is cheap to
/// clone; all clones drive the same shard.
#[derive(Clone)]
pub struct DocumentShard {
    pub(crate) core: Arc<ShardCore>,
}

enum LockStep {
    Acquired,
    Wait(tokio::sync::oneshot::Receiver<WaiterSignal>),
    Stale,
}

enum FindStep {
    Hit(Option<Document>),
    Wait(tokio::sync::watch::Receiver<SlotState>),
    Stale,
}

impl DocumentShard {
    /// Compose a shard from injected parts
    pub fn new(
        options: ShardOptions,
        store: AnyDocStore,
        coord: Arc<dyn CoordinationDriver>,
    ) -> Self {
        let shard_id = options.get_shard_id();
        let (faults, _) = broadcast::channel(64);
        Self {
            core: Arc::new(ShardCore {
                options,
                shard_id,
                store,
                coord,
                slots: HashMap::new(),
                metrics: Arc::new(ShardMetrics::default()),
                running: AtomicBool::new(false),
                accepting: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
                faults,
            }),
        }
    }

    /// Build a shard from configuration: the selected store driver plus an
    /// etcd coordinator when endpoints are configured, or a private
    /// in-process coordinator otherwise.
    pub async fn connect(options: ShardOptions) -> Result<Self, ShardError> {
        let store = AnyDocStore::open(options.store_config()?)?;
        let coord: Arc<dyn CoordinationDriver> = match &options.coord_endpoints
        {
            Some(endpoints) => {
                let endpoints: Vec<String> = endpoints
                    .split(',')
                    .map(|e| e.trim().to_string())
                    .filter(|e| !e.is_empty())
                    .collect();
                Arc::new(
                    dgc_coord::EtcdCoordinator::connect(
                        endpoints,
                        "dgc".to_string(),
                    )
                    .await?,
                )
            }
            None => Arc::new(MemoryCoordinator::new()),
        };
        Ok(Self::new(options, store, coord))
    }

    pub fn shard_id(&self) -> &str {
        &self.core.shard_id
    }

    pub fn metrics(&self) -> Arc<ShardMetrics> {
        Arc::clone(&self.core.metrics)
    }

    /// Observe background faults (failed unloads, lost locks)
    pub fn subscribe_faults(&self) -> broadcast::Receiver<ShardFault> {
        self.core.faults.subscribe()
    }

    /// Start the shard: open the store, subscribe to release requests and
    /// spawn the background pipelines. Idempotent.
    pub async fn start(&self) -> Result<(), ShardError> {
        if self.core.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Err(err) = self.core.store.start().await {
            self.core.running.store(false, Ordering::Release);
            return Err(err.into());
        }
        let releases =
            match self.core.coord.subscribe(RELEASE_CHANNEL_PREFIX).await {
                Ok(rx) => rx,
                Err(err) => {
                    self.core.running.store(false, Ordering::Release);
                    return Err(err.into());
                }
            };

        {
            let mut tasks = self.core.tasks.lock().await;
            tasks.push(tokio::spawn(self.clone().release_loop(releases)));
            tasks.push(tokio::spawn(self.clone().persist_loop()));
            tasks.push(tokio::spawn(self.clone().renew_loop()));
            if let Some(idle) = self.core.options.doc_idle_timeout() {
                tasks.push(tokio::spawn(self.clone().idle_loop(idle)));
            }
        }
        self.core.accepting.store(true, Ordering::Release);

        info!(shard = %self.core.shard_id, "document shard started");
        Ok(())
    }

    /// Stop the shard: drain in-flight holds for a bounded grace period,
    /// flush and unload every resident slot, release coordinator locks and
    /// stop the store. Idempotent; afterwards all public calls fail fast.
    pub async fn stop(&self) -> Result<(), ShardError> {
        if !self.core.accepting.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        info!(shard = %self.core.shard_id, "stopping document shard");

        // New entries are rejected from here on, but connections already
        // holding a slot may still commit or roll back until the grace
        // period lapses
        let deadline = Instant::now() + self.core.options.stop_grace();
        while self.any_owner_held().await && Instant::now() < deadline {
            sleep(Duration::from_millis(10)).await;
        }
        self.core.running.store(false, Ordering::Release);

        {
            let mut tasks = self.core.tasks.lock().await;
            for task in tasks.drain(..) {
                task.abort();
            }
        }

        for slot in self.collect_slots().await {
            {
                let mut inner = slot.locked();
                if inner.owner.is_some() {
                    warn!(
                        shard = %self.core.shard_id,
                        key = %slot.key,
                        "force-releasing a held write lock at shutdown"
                    );
                    // Uncommitted work is rolled back; only committed
                    // state may reach the backend
                    if let Some(prev) = inner.shadow.take() {
                        inner.doc = prev;
                        inner.dirty = inner.has_committed;
                        inner.version += 1;
                    }
                    inner.owner = None;
                }
            }
            if let Err(err) = self.unload_slot(&slot).await {
                warn!(
                    key = %slot.key,
                    error = %err,
                    "unload failed during shutdown"
                );
            }
        }

        self.core.store.stop().await?;
        info!(shard = %self.core.shard_id, "document shard stopped");
        Ok(())
    }

    /// Acquire the per-connection write lock on `key`, loading the slot if
    /// needed. Re-entrant for the owning connection; other connections
    /// queue FIFO.
    pub async fn lock(&self, conn: &str, key: &str) -> Result<(), ShardError> {
        loop {
            self.ensure_accepting()?;
            let (slot, fresh) = self.get_or_create_slot(key).await;
            if fresh {
                self.load_slot(&slot, Some(conn)).await?;
                return Ok(());
            }

            let step = {
                let mut inner = slot.locked();
                match inner.state {
                    SlotState::Loaded => {
                        if inner.owner.as_deref() == Some(conn) {
                            inner.touch();
                            LockStep::Acquired
                        } else if inner.owner.is_none() {
                            inner.owner = Some(conn.to_string());
                            inner.touch();
                            LockStep::Acquired
                        } else {
                            LockStep::Wait(Slot::enqueue_waiter(
                                &mut inner, conn,
                            ))
                        }
                    }
                    SlotState::Loading | SlotState::Unloading => {
                        LockStep::Wait(Slot::enqueue_waiter(&mut inner, conn))
                    }
                    SlotState::Unloaded => LockStep::Stale,
                }
            };

            match step {
                LockStep::Acquired => return Ok(()),
                LockStep::Stale => continue,
                LockStep::Wait(rx) => match rx.await {
                    Ok(WaiterSignal::Granted) => return Ok(()),
                    Ok(WaiterSignal::Retry) | Err(_) => continue,
                },
            }
        }
    }

    /// Read the current document for `key`, loading the slot if needed.
    /// Non-owners may read; reads never block on the write lock.
    pub async fn find(
        &self,
        _conn: &str,
        key: &str,
    ) -> Result<Option<Document>, ShardError> {
        loop {
            self.ensure_accepting()?;
            let (slot, fresh) = self.get_or_create_slot(key).await;
            if fresh {
                self.load_slot(&slot, None).await?;
            }

            let step = {
                let mut inner = slot.locked();
                match inner.state {
                    SlotState::Loaded => {
                        inner.touch();
                        FindStep::Hit(inner.doc.clone())
                    }
                    SlotState::Loading | SlotState::Unloading => {
                        FindStep::Wait(slot.watch_state())
                    }
                    SlotState::Unloaded => FindStep::Stale,
                }
            };

            match step {
                FindStep::Hit(doc) => return Ok(doc),
                FindStep::Stale => continue,
                FindStep::Wait(mut rx) => {
                    // A closed channel means the slot was dropped; retry
                    let _ = rx.changed().await;
                }
            }
        }
    }

    /// Read one field of the document for `key`
    pub async fn find_field(
        &self,
        conn: &str,
        key: &str,
        field: &str,
    ) -> Result<Option<Value>, ShardError> {
        Ok(self
            .find(conn, key)
            .await?
            .and_then(|doc| doc.get(field).cloned()))
    }

    /// Create the document for `key`. Requires the write lock and an
    /// absent document.
    pub async fn insert(
        &self,
        conn: &str,
        key: &str,
        doc: Document,
    ) -> Result<(), ShardError> {
        self.ensure_running()?;
        let slot = self.owned_slot(conn, key)?;
        let mut inner = slot.locked();
        if inner.state != SlotState::Loaded
            || inner.owner.as_deref() != Some(conn)
        {
            return Err(not_owner(conn, key));
        }
        if inner.doc.is_some() {
            return Err(ShardError::contract(format!(
                "insert on existing document '{}'",
                key
            )));
        }
        inner.capture_shadow();
        inner.doc = Some(doc);
        inner.dirty = true;
        inner.version += 1;
        inner.touch();
        Ok(())
    }

    /// Patch the document for `key` by shallow field assignment and return
    /// the updated document. Requires the write lock and a present
    /// document.
    pub async fn update(
        &self,
        conn: &str,
        key: &str,
        patch: Document,
    ) -> Result<Document, ShardError> {
        self.ensure_running()?;
        let slot = self.owned_slot(conn, key)?;
        let mut inner = slot.locked();
        if inner.state != SlotState::Loaded
            || inner.owner.as_deref() != Some(conn)
        {
            return Err(not_owner(conn, key));
        }
        if inner.doc.is_none() {
            return Err(ShardError::contract(format!(
                "update on absent document '{}'",
                key
            )));
        }
        inner.capture_shadow();
        let updated = {
            let doc = inner.doc.get_or_insert_with(Document::new);
            doc.apply_patch(&patch);
            doc.clone()
        };
        inner.dirty = true;
        inner.version += 1;
        inner.touch();
        Ok(updated)
    }

    /// Delete the document for `key`. Requires the write lock.
    pub async fn remove(
        &self,
        conn: &str,
        key: &str,
    ) -> Result<(), ShardError> {
        self.ensure_running()?;
        let slot = self.owned_slot(conn, key)?;
        let mut inner = slot.locked();
        if inner.state != SlotState::Loaded
            || inner.owner.as_deref() != Some(conn)
        {
            return Err(not_owner(conn, key));
        }
        inner.capture_shadow();
        inner.doc = None;
        inner.dirty = true;
        inner.version += 1;
        inner.touch();
        Ok(())
    }

    /// Commit the hold: drop the rollback shadow, release the write lock
    /// and wake the next waiter. Persistence is batched; nothing is
    /// written here. Idempotent when the lock is not held.
    pub async fn commit(
        &self,
        conn: &str,
        key: &str,
    ) -> Result<(), ShardError> {
        self.ensure_running()?;
        let Some(slot) = self.get_slot(key) else {
            return Ok(());
        };
        let schedule = {
            let mut inner = slot.locked();
            match inner.owner.as_deref() {
                Some(owner) if owner == conn => {
                    inner.shadow = None;
                    if inner.dirty {
                        inner.has_committed = true;
                    }
                    inner.owner = None;
                    inner.touch();
                    Slot::grant_next(&mut inner);
                    inner.release_requested && inner.owner.is_none()
                }
                Some(_) => {
                    return Err(ShardError::contract(format!(
                        "commit by connection '{}' that does not hold '{}'",
                        conn, key
                    )));
                }
                None => false,
            }
        };
        if schedule {
            self.schedule_unload(slot, self.core.options.unload_delay());
        }
        Ok(())
    }

    /// Roll the hold back to the value observed at its start, release the
    /// write lock and wake the next waiter. A no-op without prior
    /// mutation; the slot stays dirty if an unflushed commit exists.
    pub async fn rollback(
        &self,
        conn: &str,
        key: &str,
    ) -> Result<(), ShardError> {
        self.ensure_running()?;
        let Some(slot) = self.get_slot(key) else {
            return Ok(());
        };
        let schedule = {
            let mut inner = slot.locked();
            match inner.owner.as_deref() {
                Some(owner) if owner == conn => {
                    if let Some(prev) = inner.shadow.take() {
                        inner.doc = prev;
                        inner.dirty = inner.has_committed;
                        inner.version += 1;
                    }
                    inner.owner = None;
                    inner.touch();
                    Slot::grant_next(&mut inner);
                    inner.release_requested && inner.owner.is_none()
                }
                Some(_) => {
                    return Err(ShardError::contract(format!(
                        "rollback by connection '{}' that does not hold '{}'",
                        conn, key
                    )));
                }
                None => false,
            }
        };
        if schedule {
            self.schedule_unload(slot, self.core.options.unload_delay());
        }
        Ok(())
    }

    /// Whether `key` currently has a `Loaded` slot (test introspection)
    pub fn is_loaded(&self, key: &str) -> bool {
        self.core
            .slots
            .read(key, |_, slot| slot.locked().state == SlotState::Loaded)
            .unwrap_or(false)
    }

    /// Flush every dirty unowned slot now, verifying the coordinator lock
    /// for each resident key first. Keys whose lock was seized are
    /// force-evicted and named in the returned `LockLost` error.
    pub async fn save_all(&self) -> Result<(), ShardError> {
        self.ensure_running()?;
        self.save_pass(true).await
    }

    // ---- internals shared by the lifecycle and persistence pipelines ----

    /// Gate for operations of connections that already hold or touched a
    /// slot; stays open through `stop`'s grace period so in-flight holds
    /// can finish
    pub(crate) fn ensure_running(&self) -> Result<(), ShardError> {
        if self.core.running.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(ShardError::Shutdown)
        }
    }

    /// Gate for new entries (`lock`/`find`); closes the moment `stop`
    /// begins draining
    fn ensure_accepting(&self) -> Result<(), ShardError> {
        if self.core.accepting.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(ShardError::Shutdown)
        }
    }

    pub(crate) fn get_slot(&self, key: &str) -> Option<Arc<Slot>> {
        self.core.slots.read(key, |_, slot| Arc::clone(slot))
    }

    fn owned_slot(
        &self,
        conn: &str,
        key: &str,
    ) -> Result<Arc<Slot>, ShardError> {
        self.get_slot(key).ok_or_else(|| not_owner(conn, key))
    }

    pub(crate) async fn get_or_create_slot(
        &self,
        key: &str,
    ) -> (Arc<Slot>, bool) {
        loop {
            if let Some(slot) = self
                .core
                .slots
                .read_async(key, |_, slot| Arc::clone(slot))
                .await
            {
                return (slot, false);
            }
            let slot = Slot::new(key.to_string());
            match self
                .core
                .slots
                .insert_async(key.to_string(), Arc::clone(&slot))
                .await
            {
                Ok(()) => return (slot, true),
                Err(_) => continue,
            }
        }
    }

    pub(crate) async fn collect_slots(&self) -> Vec<Arc<Slot>> {
        let mut slots = Vec::new();
        self.core
            .slots
            .scan_async(|_, slot| {
                slots.push(Arc::clone(slot));
            })
            .await;
        slots
    }

    async fn any_owner_held(&self) -> bool {
        self.collect_slots()
            .await
            .iter()
            .any(|slot| slot.locked().owner.is_some())
    }

    pub(crate) fn emit_fault(&self, fault: ShardFault) {
        // Nobody subscribed is fine
        let _ = self.core.faults.send(fault);
    }
}

fn not_owner(conn: &str, key: &str) -> ShardError {
    ShardError::contract(format!(
        "connection '{}' does not hold the write lock on '{}'",
        conn, key
    ))
}
