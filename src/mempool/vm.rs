use std::io;
use std::ptr::NonNull;

/// Mapping backend for pool memory.
///
/// A pool owns exactly one contiguous mapping obtained from its backend at
/// creation and returned at destruction. The default backend
/// ([`MmapBackend`]) asks the operating system for an anonymous
/// read-write private mapping; custom backends can substitute file-backed
/// or pre-reserved memory.
///
/// Contract:
/// - `map` returns the region base, or an error carrying the OS errno.
/// - The returned region must be zero-filled and writable for `len` bytes.
/// - Backend state (the "private cookie" of the C-style callback pair) is
///   whatever the implementing type carries.
pub trait MapBackend: Send + Sync {
    fn map(&self, len: usize) -> io::Result<NonNull<u8>>;

    /// Unmap a region previously returned by [`map`](Self::map).
    ///
    /// # Safety
    /// - `ptr`/`len` must denote exactly one region handed out by `map` on
    ///   this backend, with no live references into it.
    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()>;
}

/// Default backend: anonymous private `mmap`.
#[derive(Debug, Default)]
pub struct MmapBackend;

#[cfg(all(unix, not(any(loom, miri))))]
impl MapBackend for MmapBackend {
    fn map(&self, len: usize) -> io::Result<NonNull<u8>> {
        // Safety: FFI call to mmap.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        match NonNull::new(ptr.cast::<u8>()) {
            Some(p) => Ok(p),
            None => Err(io::Error::other("mmap returned null")),
        }
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        // Safety: FFI call to munmap; caller guarantees ptr/len came from map.
        if unsafe { libc::munmap(ptr.as_ptr().cast::<libc::c_void>(), len) } != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Loom/Miri mock: heap-backed MapBackend (no real mmap)
//
// Under `cfg(loom)` we cannot issue real VM syscalls — loom runs inside a
// single OS process with its own scheduler. Instead every "mapping" is a
// plain zeroed heap allocation, which also lets Miri track the pointer
// provenance of free-list nodes written into the region. Non-unix targets
// take the same path.
// ---------------------------------------------------------------------------
#[cfg(any(loom, miri, not(unix)))]
impl MapBackend for MmapBackend {
    fn map(&self, len: usize) -> io::Result<NonNull<u8>> {
        if len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "zero-size mapping",
            ));
        }
        let layout = std::alloc::Layout::from_size_align(len, page_size())
            .map_err(io::Error::other)?;
        // Safety: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or_else(|| {
            io::Error::new(io::ErrorKind::OutOfMemory, "alloc returned null")
        })
    }

    unsafe fn unmap(&self, ptr: NonNull<u8>, len: usize) -> io::Result<()> {
        let layout = std::alloc::Layout::from_size_align(len, page_size())
            .map_err(io::Error::other)?;
        // Safety: ptr was allocated with the same layout via `map`.
        unsafe { std::alloc::dealloc(ptr.as_ptr(), layout) };
        Ok(())
    }
}

/// OS page size. Pool strides are rounded up to a multiple of this.
#[cfg(all(unix, not(any(loom, miri))))]
pub fn page_size() -> usize {
    use crate::sync::OnceLock;
    static CACHED: OnceLock<usize> = OnceLock::new();
    *CACHED.get_or_init(|| {
        // Safety: FFI call to sysconf.
        let raw = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        assert!(
            raw > 0,
            "sysconf(_SC_PAGESIZE) failed: {}",
            io::Error::last_os_error()
        );
        #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
        {
            raw as usize
        }
    })
}

#[cfg(any(loom, miri, not(unix)))]
pub fn page_size() -> usize {
    4096
}

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;

    #[test]
    fn test_map_write_unmap() {
        let backend = MmapBackend;
        let len = page_size() * 2;
        let ptr = backend.map(len).expect("map failed");

        // Safety: region is len bytes, read-write.
        unsafe {
            let slice = std::slice::from_raw_parts_mut(ptr.as_ptr(), len);
            slice[0] = 42;
            slice[len - 1] = 24;
            assert_eq!(slice[0], 42);
            assert_eq!(slice[len - 1], 24);
        }

        // Safety: ptr/len came from map above.
        unsafe { backend.unmap(ptr, len).expect("unmap failed") };
    }

    #[test]
    fn test_map_returns_zeroed_memory() {
        let backend = MmapBackend;
        let len = page_size();
        let ptr = backend.map(len).expect("map failed");

        // Safety: region is len bytes.
        unsafe {
            let slice = std::slice::from_raw_parts(ptr.as_ptr(), len);
            assert!(slice.iter().all(|&b| b == 0), "mapping not zero-filled");
        }

        // Safety: ptr/len came from map above.
        unsafe { backend.unmap(ptr, len).expect("unmap failed") };
    }

    #[test]
    fn test_page_size_is_power_of_two() {
        let size = page_size();
        assert!(size > 0);
        assert!(size.is_power_of_two(), "page size {size} is not a power of two");
    }

    #[test]
    fn test_independent_mappings() {
        let backend = MmapBackend;
        let len = page_size();
        let a = backend.map(len).expect("map a failed");
        let b = backend.map(len).expect("map b failed");
        assert_ne!(a, b);

        // Safety: both regions are live and len bytes long.
        unsafe {
            *a.as_ptr() = 1;
            *b.as_ptr() = 2;
            assert_eq!(*a.as_ptr(), 1);
            assert_eq!(*b.as_ptr(), 2);
            backend.unmap(a, len).expect("unmap a failed");
            assert_eq!(*b.as_ptr(), 2);
            backend.unmap(b, len).expect("unmap b failed");
        }
    }
}
