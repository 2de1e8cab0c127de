use std::ptr::{self, NonNull};
// Directory slots deliberately bypass the loom shim: each slot is a
// publish-once pointer that outlives a loom model iteration (see sync.rs).
use std::sync::atomic::{AtomicPtr, Ordering as SlotOrdering};

use fixedbitset::FixedBitSet;

use super::attr::PoolAttr;
use super::error::PoolError;
use super::handle::{PerCpuPtr, DEFAULT_STRIDE, FIRST_POOL_INDEX, MAX_POOLS, MAX_STRIDE};
use super::stats;
use super::vm::{page_size, MapBackend, MmapBackend};
use crate::sync::{Arc, Mutex, OnceLock};

/// Intrusive free-list link, written into the freed slot itself.
#[repr(C)]
struct FreeNode {
    next: *mut FreeNode,
}

/// Mutable pool state, serialised by the per-pool mutex.
struct PoolState {
    /// Head of the LIFO free list. The link nodes live in CPU 0's slice at
    /// each item's offset, which centralises allocator writes; the risk of
    /// false sharing with genuine CPU-0 workload is accepted. Revisit if it
    /// shows up in profiles.
    free_head: *mut FreeNode,
    /// Bump cursor: slots in `[0, next_unused)` have been handed out at
    /// least once.
    next_unused: usize,
    /// Robust mode only. One bit per slot, set while the slot is allocated.
    /// Bits stay zero for slots never handed out.
    free_bitmap: Option<FixedBitSet>,
}

// Safety: the raw free-list pointer targets memory owned by the pool's
// mapping; it is only dereferenced under the pool mutex.
unsafe impl Send for PoolState {}

pub(crate) struct PoolInner {
    name: Option<String>,
    index: usize,
    base: NonNull<u8>,
    stride: usize,
    item_len: usize,
    item_order: u32,
    max_cpus: usize,
    backend: Arc<dyn MapBackend>,
    state: Mutex<PoolState>,
}

// Safety: PoolInner owns its mapping; all mutation goes through the state
// mutex, and the immutable fields are read-only after publication.
unsafe impl Send for PoolInner {}
// Safety: same as above.
unsafe impl Sync for PoolInner {}

impl PoolInner {
    pub(crate) fn base(&self) -> NonNull<u8> {
        self.base
    }

    pub(crate) fn stride(&self) -> usize {
        self.stride
    }

    pub(crate) fn max_cpus(&self) -> usize {
        self.max_cpus
    }

    fn mapping_len(&self) -> usize {
        self.stride * self.max_cpus
    }

    fn slot_count(&self) -> usize {
        self.stride >> self.item_order
    }

    fn debug_name(&self) -> &str {
        self.name.as_deref().unwrap_or("<anonymous>")
    }

    /// Robust-mode teardown validation: walk the free list checking every
    /// node, then require the bitmap to be empty (no live allocations).
    /// Panics on violation — these are programming bugs.
    fn robust_destroy_check(&self) {
        let st = self.state.lock().unwrap();
        if st.free_bitmap.is_none() {
            return;
        }

        let mut seen = FixedBitSet::with_capacity(self.slot_count());
        let base = self.base.as_ptr() as usize;
        let mut node = st.free_head;
        while !node.is_null() {
            let addr = node as usize;
            let in_range = addr >= base && addr < base + self.stride;
            let offset = addr.wrapping_sub(base);
            if !in_range || offset % self.item_len != 0 || offset >= st.next_unused {
                panic!(
                    "free list corruption in pool {}: node {:#x} is not a handed-out slot",
                    self.debug_name(),
                    addr
                );
            }
            let slot = offset >> self.item_order;
            if seen.contains(slot) {
                panic!(
                    "free list corruption in pool {}: slot {slot} linked twice",
                    self.debug_name()
                );
            }
            seen.insert(slot);
            // Safety: node verified above to be an aligned slot inside
            // CPU 0's slice.
            node = unsafe { (*node).next };
        }

        let bitmap = st.free_bitmap.as_ref().unwrap();
        if let Some(slot) = bitmap.ones().next() {
            panic!(
                "memory leak in pool {}: slot {slot} still allocated at destroy",
                self.debug_name()
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Pool directory
// ---------------------------------------------------------------------------

/// Process-wide table of live pools, indexed by the high bits of every
/// handle. Slot 0 stays empty so a zero word never names a live pool.
struct Directory {
    /// Serialises create/destroy. Held across the backend `map` call so the
    /// claimed slot stays reserved; creation is not a hot path. A std Mutex
    /// even under loom — creation is not a modelled synchronization point,
    /// and the directory outlives loom model iterations.
    create_lock: std::sync::Mutex<()>,
    slots: Box<[AtomicPtr<PoolInner>]>,
}

fn directory() -> &'static Directory {
    static DIRECTORY: OnceLock<Directory> = OnceLock::new();
    DIRECTORY.get_or_init(|| Directory {
        create_lock: std::sync::Mutex::new(()),
        slots: (0..MAX_POOLS)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect(),
    })
}

/// Resolve a directory index to its live pool.
///
/// Handles into destroyed pools are undefined by contract; the non-null
/// check here turns the common stale-handle mistake into a panic instead
/// of a wild dereference.
fn lookup(pool_index: usize) -> &'static PoolInner {
    let raw = directory().slots[pool_index].load(SlotOrdering::Acquire);
    assert!(
        !raw.is_null(),
        "handle does not name a live pool (directory index {pool_index})"
    );
    // Safety: non-null slots hold a pointer published by Box::into_raw at
    // create; it is reclaimed only after the slot is cleared at destroy.
    unsafe { &*raw }
}

// ---------------------------------------------------------------------------
// Pool
// ---------------------------------------------------------------------------

/// One fixed-size-class pool: a single contiguous mapping of
/// `stride × max_cpus` bytes, carved into identical slices of `stride`
/// bytes per CPU. Every allocation reserves the same offset in all slices.
///
/// `Pool` is a handle; the pool itself lives in the process-wide directory
/// until [`destroy`](Pool::destroy) (or drop, which runs the same
/// teardown, ignoring unmap errors).
#[derive(Debug)]
pub struct Pool {
    index: usize,
}

impl Pool {
    /// Create a pool for items of `item_len` bytes (raised to the machine
    /// word size, then rounded to the next power of two), configured by
    /// `attr`. `name` is informational and shows up in robust-mode
    /// diagnostics.
    ///
    /// The stride is rounded up to a page multiple. If `attr` carries an
    /// init callback it runs once per CPU slice, on the freshly mapped
    /// zero-filled region, before this returns.
    ///
    /// # Errors
    ///
    /// - `InvalidConfig` if `item_len` exceeds the stride, or the stride
    ///   exceeds the handle encoding's capacity.
    /// - `DirectoryFull` if all pool indexes are taken.
    /// - `MapFailed` with the backend's errno if the mapping fails.
    ///
    /// This API is MT-safe.
    pub fn create(name: Option<&str>, item_len: usize, attr: &PoolAttr) -> Result<Pool, PoolError> {
        // Every slot must be able to hold a free-list link.
        let item_len = item_len.max(std::mem::size_of::<usize>());
        if item_len > MAX_STRIDE {
            return Err(PoolError::InvalidConfig(format!(
                "item_len {item_len} exceeds the largest representable stride"
            )));
        }
        let item_len = item_len.next_power_of_two();
        let item_order = item_len.trailing_zeros();

        let mut stride = attr.kind.stride();
        if stride == 0 {
            stride = DEFAULT_STRIDE;
        }
        let stride = stride
            .checked_next_multiple_of(page_size())
            .ok_or_else(|| PoolError::InvalidConfig("stride overflows when page-aligned".to_string()))?;
        let max_cpus = attr.kind.max_cpus();

        if item_len > stride {
            return Err(PoolError::InvalidConfig(format!(
                "item_len {item_len} does not fit in stride {stride}"
            )));
        }
        if stride > MAX_STRIDE {
            return Err(PoolError::InvalidConfig(format!(
                "stride {stride} exceeds the handle offset range ({MAX_STRIDE})"
            )));
        }
        let mapping_len = stride.checked_mul(max_cpus).ok_or_else(|| {
            PoolError::InvalidConfig(format!(
                "stride {stride} times {max_cpus} CPUs overflows"
            ))
        })?;

        let backend: Arc<dyn MapBackend> = match &attr.backend {
            Some(b) => b.clone(),
            None => Arc::new(MmapBackend),
        };

        let dir = directory();
        let _guard = dir
            .create_lock
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        // Linear scan for the first empty directory slot.
        let index = (FIRST_POOL_INDEX..MAX_POOLS)
            .find(|&i| dir.slots[i].load(SlotOrdering::Relaxed).is_null())
            .ok_or(PoolError::DirectoryFull)?;

        let base = backend.map(mapping_len).map_err(PoolError::MapFailed)?;

        if let Some(init) = &attr.init {
            for cpu in 0..max_cpus {
                // Safety: the mapping is mapping_len = stride * max_cpus
                // bytes and nothing else references it yet.
                let slice = unsafe {
                    std::slice::from_raw_parts_mut(base.as_ptr().add(stride * cpu), stride)
                };
                init(slice, cpu);
            }
        }

        let free_bitmap = attr
            .robust
            .then(|| FixedBitSet::with_capacity(stride >> item_order));

        let inner = Box::new(PoolInner {
            name: name.map(str::to_string),
            index,
            base,
            stride,
            item_len,
            item_order,
            max_cpus,
            backend,
            state: Mutex::new(PoolState {
                free_head: ptr::null_mut(),
                next_unused: 0,
                free_bitmap,
            }),
        });

        dir.slots[index].store(Box::into_raw(inner), SlotOrdering::Release);
        stats::TOTAL_MAPPED.add(mapping_len);
        stats::POOLS_LIVE.add(1);
        Ok(Pool { index })
    }

    /// Allocate one item. The returned handle addresses the same slot in
    /// every CPU slice; the slot contents are *not* cleared (see
    /// [`zmalloc`](Pool::zmalloc)).
    ///
    /// # Errors
    ///
    /// Returns `Exhausted` when the free list is empty and the bump cursor
    /// has reached the end of the slice.
    ///
    /// This API is MT-safe.
    pub fn malloc(&self) -> Result<PerCpuPtr, PoolError> {
        malloc_index(self.index, false)
    }

    /// [`malloc`](Pool::malloc), plus clearing the slot's `item_len` bytes
    /// in every CPU slice before returning. Zeroing happens outside the
    /// pool lock; the slot already belongs to the caller at that point.
    ///
    /// This API is MT-safe.
    pub fn zmalloc(&self) -> Result<PerCpuPtr, PoolError> {
        malloc_index(self.index, true)
    }

    /// Destroy the pool: robust-mode validation, unmap, directory slot
    /// cleared. Outstanding handles become invalid; using one afterwards
    /// is undefined.
    ///
    /// # Errors
    ///
    /// `UnmapFailed` with the backend's errno. The pool then stays
    /// resident in the directory (its slot is not reused) since its
    /// mapping could not be torn down.
    ///
    /// # Panics
    ///
    /// In robust mode, panics on a leaked allocation or a corrupt free
    /// list.
    pub fn destroy(self) -> Result<(), PoolError> {
        let index = self.index;
        std::mem::forget(self);
        destroy_index(index, true)
    }

    /// Move the pool's pages to the NUMA node matching each CPU slice.
    /// See [`range_init_numa`](super::numa::range_init_numa) for the
    /// per-range variant. `flags` go to `move_pages(2)` verbatim; a zero
    /// `flags` is a successful no-op. Not available off Linux, where this
    /// is also a successful no-op.
    ///
    /// # Errors
    ///
    /// `MovePagesFailed` with the kernel's errno.
    pub fn init_numa(&self, flags: i32) -> Result<(), PoolError> {
        super::numa::pool_init_numa(lookup(self.index), flags)
    }

    /// Item size after rounding (a power of two).
    pub fn item_len(&self) -> usize {
        lookup(self.index).item_len
    }

    /// log₂ of [`item_len`](Pool::item_len).
    pub fn item_order(&self) -> u32 {
        lookup(self.index).item_order
    }

    /// Reserved bytes per CPU slice, page-aligned.
    pub fn stride(&self) -> usize {
        lookup(self.index).stride
    }

    /// Number of CPU slices in the mapping (1 for a global pool).
    pub fn max_cpus(&self) -> usize {
        lookup(self.index).max_cpus
    }

    /// Informational name given at create.
    pub fn name(&self) -> Option<String> {
        lookup(self.index).name.clone()
    }

    /// Directory index of this pool, carried in the high bits of every
    /// handle it issues.
    pub fn index(&self) -> usize {
        self.index
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        // Skip the robust checks when already unwinding: a leak panic on
        // top of a live panic would abort before the test harness sees
        // either.
        let check_robust = !std::thread::panicking();
        let _ = destroy_index(self.index, check_robust);
    }
}

fn destroy_index(index: usize, check_robust: bool) -> Result<(), PoolError> {
    let inner = lookup(index);
    if check_robust {
        inner.robust_destroy_check();
    }

    let dir = directory();
    let _guard = dir
        .create_lock
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner);

    let raw = dir.slots[index].load(SlotOrdering::Relaxed);
    let mapping_len = inner.mapping_len();
    // Safety: base/len are exactly what this backend's map returned at
    // create; the pool is being retired and callers hold no references.
    unsafe { inner.backend.unmap(inner.base, mapping_len) }.map_err(PoolError::UnmapFailed)?;

    dir.slots[index].store(ptr::null_mut(), SlotOrdering::Release);
    stats::TOTAL_MAPPED.sub(mapping_len);
    stats::POOLS_LIVE.sub(1);
    // Safety: published by Box::into_raw at create; the slot is cleared, so
    // no new lookups can reach it, and the only handle was consumed.
    drop(unsafe { Box::from_raw(raw) });
    Ok(())
}

pub(crate) fn malloc_index(index: usize, zeroed: bool) -> Result<PerCpuPtr, PoolError> {
    let inner = lookup(index);
    let item_offset;
    {
        let mut st = inner.state.lock().unwrap();
        if !st.free_head.is_null() {
            let node = st.free_head;
            // Links live in CPU 0's slice, so the node address is directly
            // base + item_offset.
            item_offset = node as usize - inner.base.as_ptr() as usize;
            // Safety: node was written by percpu_free and is still owned by
            // the free list.
            st.free_head = unsafe { (*node).next };
            mark_allocated(&mut st, item_offset >> inner.item_order, inner);
        } else if st.next_unused + inner.item_len <= inner.stride {
            item_offset = st.next_unused;
            st.next_unused += inner.item_len;
            mark_allocated(&mut st, item_offset >> inner.item_order, inner);
        } else {
            return Err(PoolError::Exhausted);
        }
    }
    stats::ITEMS_LIVE.add(1);

    if zeroed {
        for cpu in 0..inner.max_cpus {
            // Safety: item_offset + item_len <= stride, so the write stays
            // inside CPU `cpu`'s slice; the slot belongs to this caller.
            unsafe {
                ptr::write_bytes(
                    inner.base.as_ptr().add(cpu * inner.stride + item_offset),
                    0,
                    inner.item_len,
                );
            }
        }
    }

    Ok(PerCpuPtr::encode(index, item_offset))
}

fn mark_allocated(st: &mut PoolState, slot: usize, inner: &PoolInner) {
    if let Some(bitmap) = &mut st.free_bitmap {
        assert!(
            !bitmap.contains(slot),
            "allocator corruption in pool {}: slot {slot} handed out twice",
            inner.debug_name()
        );
        bitmap.insert(slot);
    }
}

/// Return an item to its pool's free list.
///
/// The slot goes to the head of the LIFO free list; the link node is
/// written into CPU 0's slice at the item's offset.
///
/// Freeing a handle twice, or after its pool was destroyed, is undefined;
/// robust pools turn the former into a panic.
///
/// This API is MT-safe.
pub fn percpu_free(ptr: PerCpuPtr) {
    let inner = lookup(ptr.pool_index());
    let item_offset = ptr.item_offset();
    debug_assert!(
        item_offset % inner.item_len == 0 && item_offset < inner.stride,
        "handle offset {item_offset:#x} is not an item boundary of pool {}",
        inner.debug_name()
    );

    {
        let mut st = inner.state.lock().unwrap();
        if let Some(bitmap) = &mut st.free_bitmap {
            let slot = item_offset >> inner.item_order;
            assert!(
                bitmap.contains(slot),
                "double free detected in pool {}: slot {slot}",
                inner.debug_name()
            );
            bitmap.set(slot, false);
        }
        let node = inner.base.as_ptr().wrapping_add(item_offset).cast::<FreeNode>();
        // Safety: the slot is at least word-sized, lies inside CPU 0's
        // slice, and is owned by this caller until linked below.
        unsafe {
            ptr::write(node, FreeNode { next: st.free_head });
        }
        st.free_head = node;
    }
    stats::ITEMS_LIVE.sub(1);
}

impl PerCpuPtr {
    /// Decode the handle into a real address within `cpu`'s slice:
    /// `base + stride × cpu + item_offset`. A pure address computation —
    /// no pool lock is taken. The caller must keep `cpu` below the pool's
    /// `max_cpus` (checked only in debug builds).
    pub fn ptr(self, cpu: usize) -> *mut u8 {
        let inner = lookup(self.pool_index());
        debug_assert!(
            cpu < inner.max_cpus,
            "cpu {cpu} out of range for pool {} ({} slices)",
            inner.debug_name(),
            inner.max_cpus
        );
        // Safety: item_offset < stride and cpu < max_cpus keep the result
        // inside the pool's mapping.
        unsafe { inner.base.as_ptr().add(inner.stride * cpu + self.item_offset()) }
    }

    /// Plain-pointer view for global pools (`max_cpus = 1`): the CPU 0
    /// address.
    pub fn as_global(self) -> *mut u8 {
        self.ptr(0)
    }
}
