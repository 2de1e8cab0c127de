/// Best-effort "current CPU" oracle.
///
/// Returns the CPU the calling thread last ran on, via the scheduler. The
/// value may be stale the instant it is read; callers needing precision
/// re-check it inside their own restartable section. This is the fallback
/// lookup path — binding to a kernel per-thread fast path is left to the
/// application.
///
/// Platforms without a scheduler query report CPU 0, which keeps
/// single-slice (global) pools fully functional.
pub fn current_cpu() -> usize {
    #[cfg(all(target_os = "linux", not(any(loom, miri))))]
    {
        // Safety: FFI call to sched_getcpu.
        let cpu = unsafe { libc::sched_getcpu() };
        if cpu >= 0 {
            return cpu as usize;
        }
    }
    0
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_current_cpu_is_plausible() {
        // The exact value is scheduler-dependent; it just has to be a small
        // index, not an error sentinel.
        let cpu = current_cpu();
        assert!(cpu < 4096, "implausible CPU index {cpu}");
    }
}
