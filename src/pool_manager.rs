//! The pool manager owns exactly one pool source for the lifetime of a
//! runtime and forwards every pool and arena operation to it. It is a
//! value, not a process-wide singleton: the runtime creates one at startup,
//! threads an `Arc` through the allocators, and dropping the last handle
//! finalizes the source (unmapping everything it still owns).

use std::sync::Arc;

use crate::arena::Arena;
use crate::mem::Alignment;
use crate::mem_config::MemConfig;
use crate::mem_pool::Pool;
use crate::malloc_mem_pool::MallocMemPool;
use crate::mmap_mem_pool::MmapMemPool;
use crate::pool_map::{AllocatorInfo, AllocatorKind};
use crate::space::SpaceType;

/// Which pool source backs the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolSourceKind {
    Mmap,
    Malloc,
}

enum PoolSource {
    Mmap(MmapMemPool),
    Malloc(MallocMemPool),
}

pub struct PoolManager {
    source: PoolSource,
}

impl PoolManager {
    pub fn new(kind: PoolSourceKind, config: &MemConfig) -> Arc<Self> {
        let source = match kind {
            PoolSourceKind::Mmap => PoolSource::Mmap(MmapMemPool::new(config)),
            PoolSourceKind::Malloc => PoolSource::Malloc(MallocMemPool::new()),
        };
        Arc::new(Self { source })
    }

    pub fn source_kind(&self) -> PoolSourceKind {
        match &self.source {
            PoolSource::Mmap(_) => PoolSourceKind::Mmap,
            PoolSource::Malloc(_) => PoolSourceKind::Malloc,
        }
    }

    /// The MMAP source behind this manager. Fatal on a MALLOC runtime;
    /// callers that need the object window must not run on one.
    pub fn mmap_pool(&self) -> &MmapMemPool {
        match &self.source {
            PoolSource::Mmap(pool) => pool,
            PoolSource::Malloc(_) => {
                panic!("unsupported operation: the MALLOC pool source has no object window")
            }
        }
    }

    pub fn alloc_pool(
        &self,
        size: usize,
        space: SpaceType,
        kind: AllocatorKind,
        allocator_header: *const (),
    ) -> Pool {
        match &self.source {
            PoolSource::Mmap(pool) => pool.alloc_pool(size, space, kind, allocator_header),
            PoolSource::Malloc(pool) => pool.alloc_pool(size, space, kind, allocator_header),
        }
    }

    pub fn free_pool(&self, mem: *mut u8, size: usize) {
        match &self.source {
            PoolSource::Mmap(pool) => pool.free_pool(mem, size),
            PoolSource::Malloc(pool) => pool.free_pool(mem, size),
        }
    }

    pub fn alloc_arena(
        &self,
        size: usize,
        space: SpaceType,
        kind: AllocatorKind,
        allocator_header: *const (),
        start_alignment: Alignment,
    ) -> *mut Arena {
        match &self.source {
            PoolSource::Mmap(pool) => {
                pool.alloc_arena(size, space, kind, allocator_header, start_alignment)
            }
            PoolSource::Malloc(pool) => {
                pool.alloc_arena(size, space, kind, allocator_header, start_alignment)
            }
        }
    }

    pub fn free_arena(&self, arena: *mut Arena) {
        match &self.source {
            PoolSource::Mmap(pool) => pool.free_arena(arena),
            PoolSource::Malloc(pool) => pool.free_arena(arena),
        }
    }

    pub fn allocator_info_for_addr(&self, addr: usize) -> AllocatorInfo {
        match &self.source {
            PoolSource::Mmap(pool) => pool.allocator_info_for_addr(addr),
            PoolSource::Malloc(pool) => pool.allocator_info_for_addr(addr),
        }
    }

    pub fn start_addr_of_pool_for_addr(&self, addr: usize) -> *mut u8 {
        match &self.source {
            PoolSource::Mmap(pool) => pool.start_addr_of_pool_for_addr(addr),
            PoolSource::Malloc(pool) => pool.start_addr_of_pool_for_addr(addr),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::{DEFAULT_ALIGNMENT, POOL_ALIGNMENT_IN_BYTES, SIZE_1M};

    #[test]
    fn mmap_manager_round_trip() {
        let manager = PoolManager::new(PoolSourceKind::Mmap, &MemConfig::new(4 * SIZE_1M, 0, 0, 0));
        assert_eq!(manager.source_kind(), PoolSourceKind::Mmap);
        let pool = manager.alloc_pool(
            POOL_ALIGNMENT_IN_BYTES,
            SpaceType::Object,
            AllocatorKind::RunSlots,
            std::ptr::null(),
        );
        assert!(!pool.is_null());
        assert_eq!(
            manager.allocator_info_for_addr(pool.addr() + 100).kind(),
            AllocatorKind::RunSlots
        );
        manager.free_pool(pool.mem(), pool.size());
    }

    #[test]
    fn malloc_manager_allocates_arenas() {
        let manager = PoolManager::new(PoolSourceKind::Malloc, &MemConfig::new(0, 0, 0, 0));
        let arena = manager.alloc_arena(
            SIZE_1M,
            SpaceType::Internal,
            AllocatorKind::Arena,
            std::ptr::null(),
            DEFAULT_ALIGNMENT,
        );
        assert!(!arena.is_null());
        manager.free_arena(arena);
    }
}
