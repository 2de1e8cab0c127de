//! Diagnostic gauges for pool memory usage.
//!
//! All counters use `Relaxed` ordering. Cross-counter snapshots may be
//! transiently inconsistent (a pool's mapped bytes may appear before its
//! live-pool increment). This is acceptable for diagnostic display.
//! Do NOT use these values for allocation decisions.

use crate::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// Under contention, subtract-before-add races are tolerated and the raw
/// value may transiently dip below zero. Readers should always use
/// `get()`, which clamps negative values to zero.
pub struct Counter(AtomicIsize);

impl Counter {
    #[cfg(not(loom))]
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[cfg(loom)]
    pub fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        // Diagnostic counters only: clamp absurd deltas instead of panicking.
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed).max(0).cast_unsigned()
    }
}

// Bytes currently mapped by live pools (stride × max_cpus per pool).
crate::sync::static_atomic! {
    pub static TOTAL_MAPPED: Counter = Counter::new();
}
// Pools currently present in the directory.
crate::sync::static_atomic! {
    pub static POOLS_LIVE: Counter = Counter::new();
}
// Items currently allocated across all pools.
crate::sync::static_atomic! {
    pub static ITEMS_LIVE: Counter = Counter::new();
}

/// Point-in-time snapshot of the gauges.
#[derive(Debug, Clone, Copy)]
pub struct MempoolStats {
    pub mapped_bytes: usize,
    pub live_pools: usize,
    pub live_items: usize,
}

pub fn snapshot() -> MempoolStats {
    MempoolStats {
        mapped_bytes: TOTAL_MAPPED.get(),
        live_pools: POOLS_LIVE.get(),
        live_items: ITEMS_LIVE.get(),
    }
}
