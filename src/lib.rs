//! CPU-local storage (CLS) memory pool allocator.
//!
//! The TLS analogue for CPUs: an allocation from a [`Pool`] reserves one
//! slot per logical CPU, and the returned [`PerCpuPtr`] handle combines
//! with a CPU index to address that CPU's copy. [`PoolSet`] layers
//! variable-length allocation over pools of power-of-two size classes.

pub(crate) mod sync;

// public module: contains implementation details (hidden via pub(crate))
// and TEST_MUTEX (public for tests)
pub mod mempool;

// pools and handles
pub use mempool::attr::PoolAttr;
pub use mempool::handle::{PerCpuPtr, DEFAULT_STRIDE};
pub use mempool::pool::{percpu_free, Pool};
pub use mempool::set::{PoolSet, RejectedPool};

// collaborators
pub use mempool::cpu::current_cpu;
pub use mempool::numa::range_init_numa;
pub use mempool::vm::{page_size, MapBackend, MmapBackend};

// mgmt/stats
pub use mempool::stats::{snapshot as stats, MempoolStats};

// errors
pub use mempool::error::PoolError;
