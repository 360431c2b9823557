//! Thin proxy over the system allocator, used as the internal allocator on
//! configurations that do not run the pool-backed one. A per-pointer size
//! map keeps the statistics honest, since `free` has no size parameter.

use std::ptr::null_mut;
use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::mem::{Alignment, DEFAULT_ALIGNMENT};
use crate::mem_stats::MemStats;
use crate::mmap;
use crate::space::SpaceType;

pub struct MallocProxyAllocator {
    allocated_sizes: Mutex<HashMap<usize, usize>>,
    stats: Arc<MemStats>,
}

impl MallocProxyAllocator {
    pub fn new(stats: Arc<MemStats>) -> Self {
        Self {
            allocated_sizes: Mutex::new(HashMap::new()),
            stats,
        }
    }

    pub fn alloc(&self, size: usize, align: Alignment) -> *mut u8 {
        if size == 0 {
            return null_mut();
        }
        let mem = if align > DEFAULT_ALIGNMENT {
            mmap::aligned_malloc(size, align.in_bytes())
        } else {
            unsafe { libc::malloc(size as _) as *mut u8 }
        };
        if mem.is_null() {
            return null_mut();
        }
        self.allocated_sizes.lock().insert(mem as usize, size);
        self.stats.record_allocate_raw(size, SpaceType::Internal);
        mem
    }

    pub fn free(&self, mem: *mut u8) {
        if mem.is_null() {
            return;
        }
        let size = self
            .allocated_sizes
            .lock()
            .remove(&(mem as usize))
            .expect("free of a pointer the malloc proxy never handed out");
        self.stats.record_free_raw(size, SpaceType::Internal);
        unsafe { libc::free(mem as _) };
    }

    pub fn allocated_size(&self, mem: *const u8) -> Option<usize> {
        self.allocated_sizes.lock().get(&(mem as usize)).copied()
    }
}

impl Drop for MallocProxyAllocator {
    fn drop(&mut self) {
        let sizes = self.allocated_sizes.get_mut();
        assert!(
            sizes.is_empty(),
            "malloc proxy torn down with {} live allocations",
            sizes.len()
        );
    }
}
