//! The MALLOC pool source: pools come straight from the system allocator.
//! There is no reserved window, no coalescing and no pool-address map, so
//! reverse lookup is unsupported; production configurations use the MMAP
//! source and this one serves targets without usable anonymous mappings
//! (and tests).

use std::ptr::null_mut;

use parking_lot::Mutex;
use tracing::debug;

use crate::arena::Arena;
use crate::mem::Alignment;
use crate::mem_pool::Pool;
use crate::mmap;
use crate::pool_map::{AllocatorInfo, AllocatorKind};
use crate::space::SpaceType;

#[derive(Default)]
pub struct MallocMemPool {
    // Serialises alloc/free like the MMAP source, even though the system
    // allocator is already thread-safe, so both sources share a contract.
    lock: Mutex<()>,
}

impl MallocMemPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_pool(
        &self,
        size: usize,
        space: SpaceType,
        _kind: AllocatorKind,
        _allocator_header: *const (),
    ) -> Pool {
        let _guard = self.lock.lock();
        let mem = unsafe { libc::malloc(size as _) } as *mut u8;
        if mem.is_null() {
            return Pool::NULL;
        }
        debug!(target: "mempool", size, addr = mem as usize, %space, "malloc pool");
        Pool::new(size, mem)
    }

    pub fn free_pool(&self, mem: *mut u8, size: usize) {
        let _guard = self.lock.lock();
        debug!(target: "mempool", size, addr = mem as usize, "free malloc pool");
        unsafe { libc::free(mem as _) };
    }

    pub fn alloc_arena(
        &self,
        size: usize,
        space: SpaceType,
        _kind: AllocatorKind,
        _allocator_header: *const (),
        start_alignment: Alignment,
    ) -> *mut Arena {
        let _guard = self.lock.lock();
        let mem = mmap::aligned_malloc(size, start_alignment.in_bytes());
        if mem.is_null() {
            return null_mut();
        }
        debug!(target: "mempool", size, addr = mem as usize, %space, "malloc arena");
        unsafe { Arena::write_new(mem, size, start_alignment) }
    }

    pub fn free_arena(&self, arena: *mut Arena) {
        let _guard = self.lock.lock();
        unsafe {
            (*arena).clear_next_link();
            (*arena).clear_prev_link();
        }
        mmap::aligned_free(arena as *mut u8);
    }

    /// The MALLOC source keeps no reverse map.
    pub fn allocator_info_for_addr(&self, addr: usize) -> AllocatorInfo {
        panic!(
            "unsupported operation: the MALLOC pool source cannot reverse-look-up {:#x}",
            addr
        );
    }

    pub fn start_addr_of_pool_for_addr(&self, addr: usize) -> *mut u8 {
        panic!(
            "unsupported operation: the MALLOC pool source cannot reverse-look-up {:#x}",
            addr
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::{DEFAULT_ALIGNMENT, SIZE_1K};

    #[test]
    fn pool_round_trip() {
        let source = MallocMemPool::new();
        let pool = source.alloc_pool(64 * SIZE_1K, SpaceType::Internal, AllocatorKind::RunSlots, std::ptr::null());
        assert!(!pool.is_null());
        unsafe {
            pool.mem().write(0x5a);
            assert_eq!(pool.mem().read(), 0x5a);
        }
        source.free_pool(pool.mem(), pool.size());
    }

    #[test]
    fn arena_round_trip() {
        let source = MallocMemPool::new();
        let arena = source.alloc_arena(
            64 * SIZE_1K,
            SpaceType::Internal,
            AllocatorKind::Arena,
            std::ptr::null(),
            DEFAULT_ALIGNMENT,
        );
        assert!(!arena.is_null());
        unsafe {
            let mem = (*arena).alloc(SIZE_1K, DEFAULT_ALIGNMENT);
            assert!(!mem.is_null());
        }
        source.free_arena(arena);
    }

    #[test]
    #[should_panic(expected = "unsupported operation")]
    fn reverse_lookup_is_fatal() {
        let source = MallocMemPool::new();
        source.allocator_info_for_addr(0x1000);
    }
}
