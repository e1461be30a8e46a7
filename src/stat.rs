//! I/O statistics.
//!
//! Counters are owned by the manager and grow monotonically for its
//! lifetime. They record the soft events of the engine: segment
//! map/unmap traffic in the buffer pool and hit/evict traffic in the
//! latch table.

use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of a manager's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoStat {
    pub pool_maps: u64,
    pub pool_unmaps: u64,
    pub latch_hits: u64,
    pub latch_evicts: u64,
}

#[derive(Default)]
pub(crate) struct StatCounters {
    pool_maps: AtomicU64,
    pool_unmaps: AtomicU64,
    latch_hits: AtomicU64,
    latch_evicts: AtomicU64,
}

impl StatCounters {
    pub(crate) fn count_pool_map(&self) {
        let _ = self.pool_maps.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_pool_unmap(&self) {
        let _ = self.pool_unmaps.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_latch_hit(&self) {
        let _ = self.latch_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn count_latch_evict(&self) {
        let _ = self.latch_evicts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> IoStat {
        IoStat {
            pool_maps: self.pool_maps.load(Ordering::Relaxed),
            pool_unmaps: self.pool_unmaps.load(Ordering::Relaxed),
            latch_hits: self.latch_hits.load(Ordering::Relaxed),
            latch_evicts: self.latch_evicts.load(Ordering::Relaxed),
        }
    }
}
