use std::fmt;

use super::error::PoolError;
use super::vm::MapBackend;
use crate::sync::Arc;

/// Per-CPU-slice init callback: `(slice, cpu)`, where `slice` covers the
/// whole stride of that CPU. Runs once per CPU on the freshly mapped,
/// zero-filled region before pool creation returns.
pub(crate) type InitFn = dyn Fn(&mut [u8], usize) + Send + Sync;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum PoolKind {
    /// One slice (`max_cpus = 1`); handles convert to plain pointers.
    Global { stride: usize },
    /// One slice per logical CPU.
    PerCpu { stride: usize, max_cpus: usize },
}

impl PoolKind {
    pub(crate) fn stride(self) -> usize {
        match self {
            PoolKind::Global { stride } | PoolKind::PerCpu { stride, .. } => stride,
        }
    }

    pub(crate) fn max_cpus(self) -> usize {
        match self {
            PoolKind::Global { .. } => 1,
            PoolKind::PerCpu { max_cpus, .. } => max_cpus,
        }
    }
}

/// Pool configuration, captured at [`Pool::create`](super::pool::Pool::create)
/// time. All fields have sensible defaults: a global pool with the default
/// stride, the default `mmap` backend, no init callback, robust checking
/// off. The caller keeps ownership; the attr can be dropped (or reused for
/// another pool) immediately after create.
pub struct PoolAttr {
    pub(crate) backend: Option<Arc<dyn MapBackend>>,
    pub(crate) init: Option<Arc<InitFn>>,
    pub(crate) robust: bool,
    pub(crate) kind: PoolKind,
}

impl Default for PoolAttr {
    fn default() -> Self {
        Self {
            backend: None,
            init: None,
            robust: false,
            // A stride of 0 selects DEFAULT_STRIDE at create time.
            kind: PoolKind::Global { stride: 0 },
        }
    }
}

impl PoolAttr {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the default `mmap` backend with a custom one.
    pub fn set_mmap(&mut self, backend: Arc<dyn MapBackend>) -> &mut Self {
        self.backend = Some(backend);
        self
    }

    /// Install a per-CPU-slice init callback, invoked once per CPU with the
    /// slice and its CPU number before create returns.
    pub fn set_init<F>(&mut self, init: F) -> &mut Self
    where
        F: Fn(&mut [u8], usize) + Send + Sync + 'static,
    {
        self.init = Some(Arc::new(init));
        self
    }

    /// Enable runtime validation: double-free detection on every free,
    /// leak and free-list-corruption detection on destroy. Violations
    /// panic — they are programming bugs, not recoverable errors.
    ///
    /// Memory overhead is one bit per slot (`stride / item_len` bits) for
    /// the lifetime of the pool.
    pub fn set_robust(&mut self) -> &mut Self {
        self.robust = true;
        self
    }

    /// Make the pool per-CPU: `stride` reserved bytes per CPU (0 selects
    /// the default 64 KiB), slices for CPUs `0..max_cpus`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `max_cpus` is zero.
    pub fn set_percpu(&mut self, stride: usize, max_cpus: usize) -> Result<&mut Self, PoolError> {
        if max_cpus == 0 {
            return Err(PoolError::InvalidConfig(
                "per-CPU pool needs at least one CPU".to_string(),
            ));
        }
        self.kind = PoolKind::PerCpu { stride, max_cpus };
        Ok(self)
    }

    /// Make the pool global: a single slice of `stride` bytes (0 selects
    /// the default 64 KiB). Equivalent to a per-CPU pool with one CPU.
    pub fn set_global(&mut self, stride: usize) -> &mut Self {
        self.kind = PoolKind::Global { stride };
        self
    }
}

impl fmt::Debug for PoolAttr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolAttr")
            .field("kind", &self.kind)
            .field("robust", &self.robust)
            .field("custom_backend", &self.backend.is_some())
            .field("has_init", &self.init.is_some())
            .finish()
    }
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_global() {
        let attr = PoolAttr::new();
        assert_eq!(attr.kind, PoolKind::Global { stride: 0 });
        assert!(!attr.robust);
        assert!(attr.backend.is_none());
        assert!(attr.init.is_none());
    }

    #[test]
    fn test_set_percpu_rejects_zero_cpus() {
        let mut attr = PoolAttr::new();
        assert!(matches!(
            attr.set_percpu(0, 0),
            Err(PoolError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_setters_accumulate() {
        let mut attr = PoolAttr::new();
        attr.set_robust();
        attr.set_percpu(1 << 16, 4).unwrap();
        assert!(attr.robust);
        assert_eq!(attr.kind.max_cpus(), 4);
        assert_eq!(attr.kind.stride(), 1 << 16);
    }

    #[test]
    fn test_kind_accessors() {
        assert_eq!(PoolKind::Global { stride: 4096 }.max_cpus(), 1);
        assert_eq!(
            PoolKind::PerCpu { stride: 8192, max_cpus: 8 }.stride(),
            8192
        );
    }
}
