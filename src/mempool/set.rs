use std::fmt;

use super::error::PoolError;
use super::handle::{PerCpuPtr, POOL_INDEX_SHIFT};
use super::pool::{malloc_index, Pool};
use crate::sync::Mutex;

/// One entry per possible item order: an order never exceeds the handle
/// offset width.
const SET_ENTRIES: usize = POOL_INDEX_SHIFT as usize;

/// Smallest usable order: every slot must hold a free-list link.
const SET_MIN_ORDER: usize = std::mem::size_of::<usize>().trailing_zeros() as usize;

fn order_for_len(len: usize) -> usize {
    // Anything past the largest representable class can never fit; the
    // sentinel makes the class scan come up empty instead of overflowing
    // the power-of-two rounding below.
    if len > 1 << (SET_ENTRIES - 1) {
        return SET_ENTRIES;
    }
    let order = len.max(1).next_power_of_two().trailing_zeros() as usize;
    order.max(SET_MIN_ORDER)
}

/// A set of pools indexed by power-of-two size class, offering
/// variable-length allocation. At most one pool per size class; requests
/// go to the smallest fitting pool and fall back to larger classes when a
/// pool runs out of slots.
pub struct PoolSet {
    /// Entry `o` holds the pool with `item_order == o`, if any. The lock
    /// covers add and lookup only; it is released before entering a pool.
    entries: Mutex<[Option<Pool>; SET_ENTRIES]>,
}

impl Default for PoolSet {
    fn default() -> Self {
        Self::new()
    }
}

impl PoolSet {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(std::array::from_fn(|_| None)),
        }
    }

    /// Move `pool` into the set under its size class.
    ///
    /// # Errors
    ///
    /// If the class is already occupied the pool is handed back inside
    /// [`RejectedPool`].
    ///
    /// This API is MT-safe.
    pub fn add_pool(&self, pool: Pool) -> Result<(), RejectedPool> {
        let order = pool.item_order() as usize;
        let mut entries = self.entries.lock().unwrap();
        if entries[order].is_some() {
            return Err(RejectedPool { pool, order: order as u32 });
        }
        entries[order] = Some(pool);
        Ok(())
    }

    /// Allocate `len` bytes: smallest present class that fits, falling
    /// back to the next larger class on exhaustion. A `len` of 0 is
    /// treated as the minimum size class.
    ///
    /// # Errors
    ///
    /// Returns `Exhausted` when no present pool both fits `len` and has a
    /// slot left.
    ///
    /// This API is MT-safe.
    pub fn malloc(&self, len: usize) -> Result<PerCpuPtr, PoolError> {
        self.malloc_impl(len, false)
    }

    /// [`malloc`](PoolSet::malloc) with the slot cleared on every CPU.
    ///
    /// This API is MT-safe.
    pub fn zmalloc(&self, len: usize) -> Result<PerCpuPtr, PoolError> {
        self.malloc_impl(len, true)
    }

    fn malloc_impl(&self, len: usize, zeroed: bool) -> Result<PerCpuPtr, PoolError> {
        let mut min_order = order_for_len(len);
        loop {
            // Find the smallest present candidate, then drop the set lock
            // before entering the pool.
            let candidate = {
                let entries = self.entries.lock().unwrap();
                entries[min_order.min(SET_ENTRIES)..]
                    .iter()
                    .enumerate()
                    .find_map(|(i, entry)| {
                        entry.as_ref().map(|pool| (min_order + i, pool.index()))
                    })
            };
            let Some((order, index)) = candidate else {
                return Err(PoolError::Exhausted);
            };
            match malloc_index(index, zeroed) {
                Ok(handle) => return Ok(handle),
                // This class ran dry while we weren't looking; retry one
                // class up.
                Err(PoolError::Exhausted) => min_order = order + 1,
                Err(e) => return Err(e),
            }
        }
    }

    /// Destroy the set and every pool in it, in ascending class order.
    ///
    /// # Errors
    ///
    /// Stops at the first pool whose teardown fails and returns its error;
    /// the remaining pools are torn down best-effort as the set drops.
    pub fn destroy(self) -> Result<(), PoolError> {
        let mut entries = self.entries.lock().unwrap();
        for slot in entries.iter_mut() {
            if let Some(pool) = slot.take() {
                pool.destroy()?;
            }
        }
        Ok(())
    }
}

/// Returned by [`PoolSet::add_pool`] when the pool's size class is already
/// occupied; carries the pool back to the caller.
pub struct RejectedPool {
    pub pool: Pool,
    order: u32,
}

impl RejectedPool {
    /// The occupied size class.
    pub fn order(&self) -> u32 {
        self.order
    }
}

impl fmt::Debug for RejectedPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RejectedPool(order={})", self.order)
    }
}

impl fmt::Display for RejectedPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "size class {} already has a pool", self.order)
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use crate::mempool::attr::PoolAttr;
    use crate::mempool::pool::percpu_free;

    fn percpu_pool(name: &str, item_len: usize, stride: usize) -> Pool {
        let mut attr = PoolAttr::new();
        attr.set_percpu(stride, 2).unwrap();
        Pool::create(Some(name), item_len, &attr).unwrap()
    }

    #[test]
    fn test_order_for_len() {
        assert_eq!(order_for_len(0), SET_MIN_ORDER);
        assert_eq!(order_for_len(1), SET_MIN_ORDER);
        assert_eq!(order_for_len(16), 4);
        assert_eq!(order_for_len(17), 5);
        assert_eq!(order_for_len(64), 6);
        // Oversize lengths map to the sentinel past the last class.
        assert_eq!(order_for_len(1 << (SET_ENTRIES - 1)), SET_ENTRIES - 1);
        assert_eq!(order_for_len((1 << (SET_ENTRIES - 1)) + 1), SET_ENTRIES);
        assert_eq!(order_for_len(usize::MAX), SET_ENTRIES);
    }

    #[test]
    fn test_malloc_oversize_len_is_exhausted_not_panic() {
        let _guard = crate::mempool::TEST_MUTEX.read().unwrap();
        let set = PoolSet::new();
        set.add_pool(percpu_pool("oversize", 16, 1 << 16)).unwrap();

        assert!(matches!(set.malloc(usize::MAX).unwrap_err(), PoolError::Exhausted));
        assert!(matches!(
            set.zmalloc(1 << (usize::BITS - 1)).unwrap_err(),
            PoolError::Exhausted
        ));
        set.destroy().unwrap();
    }

    #[test]
    fn test_add_pool_rejects_duplicate_class() {
        let _guard = crate::mempool::TEST_MUTEX.read().unwrap();
        let set = PoolSet::new();
        set.add_pool(percpu_pool("dup-a", 32, 1 << 16)).unwrap();

        let rejected = set
            .add_pool(percpu_pool("dup-b", 32, 1 << 16))
            .unwrap_err();
        assert_eq!(rejected.order(), 5);
        // The rejected pool is still ours to destroy.
        rejected.pool.destroy().unwrap();

        set.destroy().unwrap();
    }

    #[test]
    fn test_malloc_picks_smallest_fitting_class() {
        let _guard = crate::mempool::TEST_MUTEX.read().unwrap();
        let set = PoolSet::new();
        set.add_pool(percpu_pool("fit-16", 16, 1 << 16)).unwrap();
        set.add_pool(percpu_pool("fit-256", 256, 1 << 16)).unwrap();

        let small = set.malloc(10).unwrap();
        let large = set.malloc(100).unwrap();
        assert_ne!(small.pool_index(), large.pool_index());

        percpu_free(small);
        percpu_free(large);
        set.destroy().unwrap();
    }

    #[test]
    fn test_len_zero_uses_minimum_class() {
        let _guard = crate::mempool::TEST_MUTEX.read().unwrap();
        let set = PoolSet::new();
        set.add_pool(percpu_pool("zero-len", 64, 1 << 16)).unwrap();

        let h = set.malloc(0).unwrap();
        percpu_free(h);
        set.destroy().unwrap();
    }

    #[test]
    fn test_malloc_without_fitting_pool() {
        let _guard = crate::mempool::TEST_MUTEX.read().unwrap();
        let set = PoolSet::new();
        set.add_pool(percpu_pool("only-16", 16, 1 << 16)).unwrap();

        // 1 KiB does not fit the only (16-byte) class.
        assert!(matches!(set.malloc(1024).unwrap_err(), PoolError::Exhausted));
        set.destroy().unwrap();
    }

    #[test]
    fn test_fallback_to_larger_class_on_exhaustion() {
        let _guard = crate::mempool::TEST_MUTEX.read().unwrap();
        let set = PoolSet::new();
        let small = percpu_pool("fall-16", 16, 1 << 16);
        let small_index = small.index();
        set.add_pool(small).unwrap();
        let large = percpu_pool("fall-64", 64, 1 << 16);
        let large_index = large.index();
        set.add_pool(large).unwrap();

        // Drain the 16-byte pool completely: 65536 / 16 slots.
        let mut handles = Vec::new();
        for _ in 0..(1 << 12) {
            let h = set.malloc(16).unwrap();
            assert_eq!(h.pool_index(), small_index);
            handles.push(h);
        }

        // The next 16-byte request spills into the 64-byte class.
        let spilled = set.malloc(16).unwrap();
        assert_eq!(spilled.pool_index(), large_index);

        percpu_free(spilled);
        for h in handles {
            percpu_free(h);
        }
        set.destroy().unwrap();
    }

    #[test]
    fn test_set_zmalloc_zeroes_both_cpus() {
        let _guard = crate::mempool::TEST_MUTEX.read().unwrap();
        let set = PoolSet::new();
        set.add_pool(percpu_pool("zset", 32, 1 << 16)).unwrap();

        let h = set.malloc(32).unwrap();
        for cpu in 0..2 {
            // Safety: test code; slot is 32 bytes on each CPU.
            unsafe { std::ptr::write_bytes(h.ptr(cpu), 0xEE, 32) };
        }
        percpu_free(h);

        let z = set.zmalloc(32).unwrap();
        assert_eq!(z, h);
        for cpu in 0..2 {
            // Safety: test code.
            let slice = unsafe { std::slice::from_raw_parts(z.ptr(cpu), 32) };
            assert!(slice.iter().all(|&b| b == 0));
        }
        percpu_free(z);
        set.destroy().unwrap();
    }
}
