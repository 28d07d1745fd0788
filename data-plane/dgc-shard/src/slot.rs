use std::collections::VecDeque;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use dgc_storage::Document;
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;

/// Residency state of one key within one shard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Loading,
    Loaded,
    Unloading,
    Unloaded,
}

/// Signal delivered to a queued ownership waiter
#[derive(Debug)]
pub(crate) enum WaiterSignal {
    /// Ownership was assigned to the waiter; the slot is `Loaded`
    Granted,
    /// The slot went away; look it up again and retry
    Retry,
}

pub(crate) struct SlotInner {
    pub state: SlotState,
    /// Current (possibly uncommitted) document, `None` = absent
    pub doc: Option<Document>,
    /// Pre-mutation value captured on the first mutation of a hold;
    /// outer `None` = nothing captured since the last commit/rollback
    pub shadow: Option<Option<Document>>,
    /// Connection currently holding the write lock
    pub owner: Option<String>,
    /// Has the slot diverged from the backend since the last flush
    pub dirty: bool,
    /// A commit since the last flush keeps the slot dirty across rollback
    pub has_committed: bool,
    /// Bumped on every mutation; guards flushes against concurrent writes
    pub version: u64,
    pub last_touched: Instant,
    /// A peer asked for release; honored once the owner lets go
    pub release_requested: bool,
    /// FIFO queue of pending ownership acquisitions
    pub waiters: VecDeque<(String, oneshot::Sender<WaiterSignal>)>,
}

impl SlotInner {
    #[inline]
    pub fn touch(&mut self) {
        self.last_touched = Instant::now();
    }

    /// Capture the pre-mutation value if this hold has not yet done so
    #[inline]
    pub fn capture_shadow(&mut self) {
        if self.shadow.is_none() {
            self.shadow = Some(self.doc.clone());
        }
    }
}

/// The unit of in-memory residency for one key
pub(crate) struct Slot {
    pub key: String,
    pub inner: Mutex<SlotInner>,
    /// Set while this shard holds the coordinator lock for `key`
    pub coord_held: AtomicBool,
    state_tx: watch::Sender<SlotState>,
    // Held so the sender outlives every transition notification
    state_rx: watch::Receiver<SlotState>,
}

impl Slot {
    pub fn new(key: String) -> Arc<Self> {
        let (state_tx, state_rx) = watch::channel(SlotState::Loading);
        Arc::new(Self {
            key,
            inner: Mutex::new(SlotInner {
                state: SlotState::Loading,
                doc: None,
                shadow: None,
                owner: None,
                dirty: false,
                has_committed: false,
                version: 0,
                last_touched: Instant::now(),
                release_requested: false,
                waiters: VecDeque::new(),
            }),
            coord_held: AtomicBool::new(false),
            state_tx,
            state_rx,
        })
    }

    #[inline]
    pub fn locked(&self) -> MutexGuard<'_, SlotInner> {
        self.inner.lock()
    }

    /// Subscribe to state transitions. Must be called while holding the
    /// slot mutex so a transition cannot slip between the state read and
    /// the subscription.
    pub fn watch_state(&self) -> watch::Receiver<SlotState> {
        self.state_rx.clone()
    }

    /// Announce a state transition to watchers. Called after the slot
    /// mutex has been released.
    pub fn notify_state(&self, state: SlotState) {
        let _ = self.state_tx.send_replace(state);
    }

    /// Enqueue an ownership waiter at the back of the FIFO
    pub fn enqueue_waiter(
        inner: &mut SlotInner,
        conn: &str,
    ) -> oneshot::Receiver<WaiterSignal> {
        let (tx, rx) = oneshot::channel();
        inner.waiters.push_back((conn.to_string(), tx));
        rx
    }

    /// Hand ownership to the front waiter, skipping ones that gave up.
    /// Ownership is assigned before the waiter resumes, so late arrivals
    /// cannot barge in between wake-up and acquisition.
    pub fn grant_next(inner: &mut SlotInner) {
        while let Some((conn, waiter)) = inner.waiters.pop_front() {
            if waiter.send(WaiterSignal::Granted).is_ok() {
                inner.owner = Some(conn);
                inner.touch();
                return;
            }
        }
    }
}
