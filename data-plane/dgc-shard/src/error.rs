use dgc_coord::CoordError;
use dgc_storage::StorageError;

/// Errors surfaced to shard API callers
#[derive(Debug, thiserror::Error)]
pub enum ShardError {
    /// The caller broke a precondition; never retried
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// Transient backend I/O failure that outlived the internal retries
    #[error("backend unavailable: {0}")]
    BackendUnavailable(#[from] StorageError),

    #[error("coordination failure: {0}")]
    Coordination(#[from] CoordError),

    /// The coordinator lock expired and was seized before pending writes
    /// could be flushed; the named keys were force-evicted
    #[error("coordinator lock lost for keys {keys:?}")]
    LockLost { keys: Vec<String> },

    #[error("shard is not running")]
    Shutdown,
}

impl ShardError {
    pub fn contract<T: ToString>(msg: T) -> Self {
        Self::ContractViolation(msg.to_string())
    }
}

/// Fault categories reported on the shard's observable fault channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    BackendUnavailable,
    LockLost,
    Coordination,
}

/// A background failure (unload or persistence) surfaced for observers.
/// Local state stays consistent; the fault is informational.
#[derive(Debug, Clone)]
pub struct ShardFault {
    pub kind: FaultKind,
    pub keys: Vec<String>,
    pub detail: String,
}
