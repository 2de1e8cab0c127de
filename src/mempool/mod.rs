pub(crate) mod attr;
pub(crate) mod cpu;
pub(crate) mod error;
pub(crate) mod handle;
pub(crate) mod loom_tests;
pub(crate) mod numa;
pub(crate) mod pool;
pub(crate) mod set;
pub(crate) mod stats;
pub(crate) mod vm;

// Tests touching process-global state (the pool directory scan order, the
// stats gauges) serialise through this lock; everything else takes it
// shared.
#[cfg(test)]
crate::sync::static_rwlock! {
    pub static TEST_MUTEX: crate::sync::RwLock<()> = crate::sync::RwLock::new(());
}
