use std::sync::{Mutex, PoisonError};

use serde::Serialize;

/// Hit and miss counters for a read-through cache.
///
/// Each counter has its own lock, so recording a hit never contends with
/// recording a miss. [`CacheStats::snapshot`] reads the counters one after the
/// other: a single snapshot taken under concurrent writes may pair a hit count
/// and a miss count from slightly different instants. Once writers are quiet
/// the snapshot is exact.
#[derive(Debug, Default)]
pub struct CacheStats {
    hit: Mutex<u64>,
    miss: Mutex<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheSnapshot {
    pub hit: u64,
    pub miss: u64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        *self.hit.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    }

    pub fn record_miss(&self) {
        *self.miss.lock().unwrap_or_else(PoisonError::into_inner) += 1;
    }

    pub fn snapshot(&self) -> CacheSnapshot {
        let hit = *self.hit.lock().unwrap_or_else(PoisonError::into_inner);
        let miss = *self.miss.lock().unwrap_or_else(PoisonError::into_inner);

        CacheSnapshot { hit, miss }
    }
}
