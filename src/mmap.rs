//! OS memory facade. Everything the substrate wants from the kernel goes
//! through here: reserving aligned anonymous regions, returning them,
//! hinting unused pages back and the aligned system-malloc pair used by the
//! MALLOC pool source.

#[cfg(unix)]
pub mod _unix {
    use std::io;
    use std::ptr::null_mut;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::mem::{align_up, is_aligned};

    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    /// Constant after the first call.
    pub fn page_size() -> usize {
        let cached = PAGE_SIZE.load(Ordering::Relaxed);
        if cached != 0 {
            return cached;
        }
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
        PAGE_SIZE.store(size, Ordering::Relaxed);
        size
    }

    /// Reserve and commit `size` bytes aligned to `alignment`. Returns null
    /// on failure or when `size == 0`. `alignment` must be a power of two
    /// not smaller than the page size; `size` a multiple of the page size.
    pub fn map_anonymous_aligned(size: usize, alignment: usize) -> *mut u8 {
        if size == 0 {
            return null_mut();
        }
        assert!(alignment.is_power_of_two() && alignment >= page_size());
        assert!(is_aligned(size, page_size()));
        unsafe {
            // Over-map by the alignment, then trim both ends.
            let map_size = size + alignment;
            let raw = libc::mmap(
                null_mut(),
                map_size as _,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            );
            if raw == libc::MAP_FAILED {
                return null_mut();
            }
            let raw = raw as usize;
            let aligned = align_up(raw, alignment);
            let head = aligned - raw;
            if head != 0 {
                libc::munmap(raw as _, head as _);
            }
            let tail = map_size - head - size;
            if tail != 0 {
                libc::munmap((aligned + size) as _, tail as _);
            }
            aligned as *mut u8
        }
    }

    /// Pin a mapping at `at`. Used on 32-bit-pointer builds to keep the
    /// object heap below 4 GiB.
    pub fn map_anonymous_fixed(at: usize, size: usize) -> *mut u8 {
        if size == 0 {
            return null_mut();
        }
        assert!(is_aligned(size, page_size()));
        unsafe {
            let mem = libc::mmap(
                at as _,
                size as _,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON | libc::MAP_FIXED,
                -1,
                0,
            );
            if mem == libc::MAP_FAILED {
                return null_mut();
            }
            mem as *mut u8
        }
    }

    pub fn unmap_raw(mem: *mut u8, size: usize) -> io::Result<()> {
        unsafe {
            if libc::munmap(mem as _, size as _) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }

    /// Hint the kernel that `[from, to)` is unused without unmapping it.
    pub fn release_pages(from: usize, to: usize) {
        debug_assert!(from <= to);
        let start = align_up(from, page_size());
        let end = to & !(page_size() - 1);
        if start >= end {
            return;
        }
        unsafe {
            libc::madvise(start as _, (end - start) as _, libc::MADV_DONTNEED);
        }
    }

    /// System-allocator pair used by the MALLOC pool source only.
    pub fn aligned_malloc(size: usize, alignment: usize) -> *mut u8 {
        debug_assert!(alignment.is_power_of_two());
        let alignment = alignment.max(core::mem::size_of::<usize>());
        unsafe {
            let mut mem = null_mut();
            if libc::posix_memalign(&mut mem, alignment as _, size as _) != 0 {
                return null_mut();
            }
            mem as *mut u8
        }
    }

    pub fn aligned_free(mem: *mut u8) {
        unsafe {
            libc::free(mem as _);
        }
    }
}

#[cfg(unix)]
pub use _unix::*;
