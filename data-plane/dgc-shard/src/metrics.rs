use std::sync::atomic::{AtomicU64, Ordering};

/// Shard metrics for monitoring
#[derive(Debug, Default)]
pub struct ShardMetrics {
    pub loads_total: AtomicU64,
    pub unloads_total: AtomicU64,
    pub flushes_total: AtomicU64,
    pub release_requests_total: AtomicU64,
    pub lock_contention_total: AtomicU64,
    pub forced_evictions_total: AtomicU64,
}

impl ShardMetrics {
    #[inline]
    pub fn inc_loads(&self) {
        self.loads_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_unloads(&self) {
        self.unloads_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_flushes(&self) {
        self.flushes_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_release_requests(&self) {
        self.release_requests_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_lock_contention(&self) {
        self.lock_contention_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_forced_evictions(&self) {
        self.forced_evictions_total.fetch_add(1, Ordering::Relaxed);
    }
}
