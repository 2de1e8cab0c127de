//! NUMA page placement.
//!
//! Moves a pool's pages so each CPU slice lives on the memory node of its
//! CPU. Placement is advisory: a pool works correctly without it, just
//! with remote-node latencies.

use super::error::PoolError;
use super::pool::PoolInner;

/// Move every page of each CPU slice of the pool to that CPU's NUMA node.
/// `flags` are passed to `move_pages(2)` verbatim (`MPOL_MF_MOVE`,
/// `MPOL_MF_MOVE_ALL`). A zero `flags` is a successful no-op, as is any
/// call on a platform without NUMA support.
pub(crate) fn pool_init_numa(inner: &PoolInner, flags: i32) -> Result<(), PoolError> {
    if flags == 0 {
        return Ok(());
    }
    #[cfg(all(target_os = "linux", not(any(loom, miri))))]
    {
        let base = inner.base().as_ptr();
        let stride = inner.stride();
        for cpu in 0..inner.max_cpus() {
            let node = linux::node_of_cpu(cpu).map_err(PoolError::MovePagesFailed)?;
            linux::move_range_to_node(base.wrapping_add(cpu * stride), stride, node, flags)
                .map_err(PoolError::MovePagesFailed)?;
        }
    }
    #[cfg(not(all(target_os = "linux", not(any(loom, miri)))))]
    {
        let _ = inner;
    }
    Ok(())
}

/// Move one memory range to the NUMA node of `cpu`. Intended for use from
/// a pool init callback, which receives each CPU slice in turn.
///
/// # Errors
///
/// - `MovePagesFailed` with the kernel's errno.
/// - `NumaUnsupported` on platforms without `move_pages(2)`.
pub fn range_init_numa(addr: *mut u8, len: usize, cpu: usize, flags: i32) -> Result<(), PoolError> {
    #[cfg(all(target_os = "linux", not(any(loom, miri))))]
    {
        let node = linux::node_of_cpu(cpu).map_err(PoolError::MovePagesFailed)?;
        linux::move_range_to_node(addr, len, node, flags).map_err(PoolError::MovePagesFailed)
    }
    #[cfg(not(all(target_os = "linux", not(any(loom, miri)))))]
    {
        let _ = (addr, len, cpu, flags);
        Err(PoolError::NumaUnsupported)
    }
}

#[cfg(all(target_os = "linux", not(any(loom, miri))))]
mod linux {
    use crate::mempool::vm::page_size;
    use std::io;

    /// CPU → NUMA node from sysfs: the cpu directory contains a `nodeK`
    /// entry on NUMA kernels. Machines without exposed topology report
    /// node 0 for every CPU.
    pub(super) fn node_of_cpu(cpu: usize) -> io::Result<i32> {
        let dir = format!("/sys/devices/system/cpu/cpu{cpu}");
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(node) = name.strip_prefix("node") {
                if let Ok(node) = node.parse::<i32>() {
                    return Ok(node);
                }
            }
        }
        Ok(0)
    }

    /// One `move_pages(2)` call covering the whole range, one entry per
    /// page.
    pub(super) fn move_range_to_node(
        addr: *mut u8,
        len: usize,
        node: i32,
        flags: i32,
    ) -> io::Result<()> {
        let page = page_size();
        let nr_pages = len.div_ceil(page);
        if nr_pages == 0 {
            return Ok(());
        }

        let pages: Vec<*mut libc::c_void> = (0..nr_pages)
            .map(|p| addr.wrapping_add(p * page).cast())
            .collect();
        let nodes: Vec<libc::c_int> = vec![node; nr_pages];
        let mut status: Vec<libc::c_int> = vec![-libc::EPERM; nr_pages];

        // Safety: FFI call to move_pages; all three arrays are nr_pages
        // entries long and outlive the call.
        let ret = unsafe {
            libc::syscall(
                libc::SYS_move_pages,
                0 as libc::pid_t,
                nr_pages as libc::c_ulong,
                pages.as_ptr(),
                nodes.as_ptr(),
                status.as_mut_ptr(),
                flags,
            )
        };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        if ret > 0 {
            return Err(io::Error::other(format!(
                "{ret} of {nr_pages} pages could not be moved to node {node}"
            )));
        }
        Ok(())
    }
}
