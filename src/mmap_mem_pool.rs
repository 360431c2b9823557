//! The MMAP pool source. Reserves the whole object-heap budget as one
//! contiguous mapping at construction and sub-allocates pool-granularity
//! chunks from it with a cursor. Freed object pools land in a size-keyed
//! map that coalesces adjacent neighbours, and are searched before the
//! cursor moves. Code/internal/compiler pools are individual OS mappings
//! under a running-size cap and are unmapped on free.

use std::collections::{BTreeMap, BTreeSet};
use std::ptr::null_mut;

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::arena::Arena;
use crate::mem::{align_up, is_aligned, Alignment, MAX_HEAP_SIZE, POOL_ALIGNMENT_IN_BYTES};
use crate::mem_config::MemConfig;
use crate::mem_pool::Pool;
use crate::mmap;
use crate::pool_map::{AllocatorInfo, AllocatorKind, PoolMap};
use crate::space::SpaceType;

struct MmapPool {
    size: usize,
    free: bool,
}

/// Freed object-space pools, coalesced and searchable by size.
#[derive(Default)]
struct MmapPoolMap {
    // Every pool carved off the common space, by start address.
    pools: BTreeMap<usize, MmapPool>,
    // Free pools indexed by size for the lower-bound search.
    free_pools: BTreeMap<usize, BTreeSet<usize>>,
}

impl MmapPoolMap {
    fn unfree(&mut self, addr: usize, size: usize) {
        let set = self.free_pools.get_mut(&size).unwrap();
        set.remove(&addr);
        if set.is_empty() {
            self.free_pools.remove(&size);
        }
    }

    fn mark_free(&mut self, addr: usize, size: usize) {
        self.free_pools.entry(size).or_default().insert(addr);
    }

    /// Take the smallest free pool that fits `size`, splitting off the
    /// remainder as a new free pool.
    fn pop_free_pool(&mut self, size: usize) -> Pool {
        let (&pool_size, set) = match self.free_pools.range_mut(size..).next() {
            Some(entry) => entry,
            None => return Pool::NULL,
        };
        let addr = *set.iter().next().unwrap();
        set.remove(&addr);
        if set.is_empty() {
            self.free_pools.remove(&pool_size);
        }
        let pool = self.pools.get_mut(&addr).unwrap();
        debug_assert!(pool.free && pool.size == pool_size);
        pool.free = false;
        if size < pool_size {
            pool.size = size;
            self.pools.insert(
                addr + size,
                MmapPool {
                    size: pool_size - size,
                    free: true,
                },
            );
            self.mark_free(addr + size, pool_size - size);
        }
        Pool::new(size, addr as *mut u8)
    }

    /// Return a pool, coalescing it with free neighbours.
    fn push_free_pool(&mut self, pool: Pool) {
        let mut addr = pool.addr();
        let entry = self
            .pools
            .get_mut(&addr)
            .expect("freed a pool the pool source never handed out");
        assert!(!entry.free, "double free of a pool");
        assert!(entry.size == pool.size());
        let mut size = entry.size;

        let prev_info = self
            .pools
            .range(..addr)
            .next_back()
            .map(|(&a, p)| (a, p.size, p.free));
        if let Some((prev_addr, prev_size, prev_free)) = prev_info {
            if prev_free && prev_addr + prev_size == addr {
                self.unfree(prev_addr, prev_size);
                self.pools.remove(&addr);
                addr = prev_addr;
                size += prev_size;
                self.pools.get_mut(&addr).unwrap().size = size;
            }
        }
        let next_info = self
            .pools
            .range(addr + 1..)
            .next()
            .map(|(&a, p)| (a, p.size, p.free));
        if let Some((next_addr, next_size, next_free)) = next_info {
            if next_free && addr + size == next_addr {
                self.unfree(next_addr, next_size);
                self.pools.remove(&next_addr);
                size += next_size;
            }
        }

        let entry = self.pools.get_mut(&addr).unwrap();
        entry.size = size;
        entry.free = true;
        self.mark_free(addr, size);
    }

    fn add_new_pool(&mut self, pool: Pool) {
        self.pools.insert(
            pool.addr(),
            MmapPool {
                size: pool.size(),
                free: false,
            },
        );
    }

    fn all_free_size(&self) -> usize {
        self.free_pools
            .iter()
            .map(|(size, set)| size * set.len())
            .sum()
    }
}

/// Cursor over the reserved object window.
struct SpaceMemory {
    min_addr: usize,
    max_size: usize,
    occupied: usize,
}

impl SpaceMemory {
    fn alloc_raw_mem(&mut self, size: usize) -> *mut u8 {
        if self.occupied + size > self.max_size {
            return null_mut();
        }
        let mem = self.min_addr + self.occupied;
        self.occupied += size;
        mem as *mut u8
    }

    fn free_space(&self) -> usize {
        self.max_size - self.occupied
    }
}

struct MmapMemPoolState {
    common_space: SpaceMemory,
    common_space_pools: MmapPoolMap,
    pool_map: PoolMap,
    // Pools of the non-object spaces, each its own OS mapping.
    non_object_pools: BTreeMap<usize, (Pool, AllocatorInfo, SpaceType)>,
    code_space_current: usize,
    internal_space_current: usize,
    compiler_space_current: usize,
}

pub struct MmapMemPool {
    min_object_memory_addr: usize,
    mmaped_object_memory_size: usize,
    code_space_max: usize,
    internal_space_max: usize,
    compiler_space_max: usize,
    state: Mutex<MmapMemPoolState>,
}

unsafe impl Send for MmapMemPool {}
unsafe impl Sync for MmapMemPool {}

impl MmapMemPool {
    /// Reserve the whole object budget up front. On 32-bit-pointer targets
    /// the window is pinned below 4 GiB.
    pub fn new(config: &MemConfig) -> Self {
        let object_space_size = align_up(config.object_pool_size(), POOL_ALIGNMENT_IN_BYTES);
        assert!(object_space_size as u64 <= MAX_HEAP_SIZE);
        #[cfg(target_pointer_width = "32")]
        let mem = mmap::map_anonymous_fixed(
            align_up(72 * crate::mem::SIZE_1K, POOL_ALIGNMENT_IN_BYTES),
            object_space_size,
        );
        #[cfg(not(target_pointer_width = "32"))]
        let mem = mmap::map_anonymous_aligned(object_space_size, POOL_ALIGNMENT_IN_BYTES);
        if mem.is_null() && object_space_size != 0 {
            panic!(
                "MmapMemPool: couldn't mmap {} bytes of memory for the system",
                object_space_size
            );
        }
        debug_assert!(is_aligned(mem as usize, POOL_ALIGNMENT_IN_BYTES) || mem.is_null());
        debug!(
            target: "mempool",
            addr = mem as usize,
            size = object_space_size,
            "reserved object window"
        );
        Self {
            min_object_memory_addr: mem as usize,
            mmaped_object_memory_size: object_space_size,
            code_space_max: config.code_pool_size(),
            internal_space_max: config.internal_pool_size(),
            compiler_space_max: config.compiler_pool_size(),
            state: Mutex::new(MmapMemPoolState {
                common_space: SpaceMemory {
                    min_addr: mem as usize,
                    max_size: object_space_size,
                    occupied: 0,
                },
                common_space_pools: MmapPoolMap::default(),
                pool_map: PoolMap::new(object_space_size),
                non_object_pools: BTreeMap::new(),
                code_space_current: 0,
                internal_space_current: 0,
                compiler_space_current: 0,
            }),
        }
    }

    #[inline]
    pub fn min_object_address(&self) -> usize {
        self.min_object_memory_addr
    }

    #[inline]
    pub fn max_object_address(&self) -> usize {
        self.min_object_memory_addr + self.mmaped_object_memory_size
    }

    pub fn alloc_pool(
        &self,
        size: usize,
        space: SpaceType,
        kind: AllocatorKind,
        allocator_header: *const (),
    ) -> Pool {
        let mut state = self.state.lock();
        let pool = self.alloc_pool_unsafe(&mut state, size, space, kind, allocator_header);
        debug!(
            target: "mempool",
            size = pool.size(),
            addr = pool.addr(),
            %space,
            "allocated pool"
        );
        pool
    }

    fn alloc_pool_unsafe(
        &self,
        state: &mut MmapMemPoolState,
        size: usize,
        space: SpaceType,
        kind: AllocatorKind,
        allocator_header: *const (),
    ) -> Pool {
        assert!(is_aligned(size, mmap::page_size()));
        assert!(is_aligned(size, POOL_ALIGNMENT_IN_BYTES));
        let mut pool = Pool::NULL;
        let mut add_to_pool_map = false;
        match space {
            SpaceType::Code | SpaceType::Compiler | SpaceType::Internal => {
                // Always fresh mappings for these spaces.
            }
            SpaceType::Object | SpaceType::HumongousObject | SpaceType::NonMovableObject => {
                add_to_pool_map = true;
                pool = state.common_space_pools.pop_free_pool(size);
                if !pool.is_null() {
                    debug!(target: "mempool", size = pool.size(), addr = pool.addr(), "reused freed pool");
                }
            }
            SpaceType::Undefined => panic!("tried to allocate a pool in the undefined space"),
        }
        if pool.is_null() {
            let mem = self.alloc_raw_mem(state, size, space);
            if !mem.is_null() {
                pool = Pool::new(size, mem);
                if add_to_pool_map {
                    state.common_space_pools.add_new_pool(pool);
                }
            }
        }
        if pool.is_null() {
            return pool;
        }
        let header_addr = if allocator_header.is_null() {
            // Reverse lookups then resolve to the first byte of the pool.
            pool.addr()
        } else {
            allocator_header as usize
        };
        if add_to_pool_map {
            state.pool_map.add_pool(
                pool.addr() - self.min_object_memory_addr,
                pool.size(),
                space,
                kind,
                header_addr,
            );
        } else {
            state.non_object_pools.insert(
                pool.addr(),
                (pool, AllocatorInfo::new(kind, header_addr), space),
            );
        }
        debug_assert!(is_aligned(pool.addr(), POOL_ALIGNMENT_IN_BYTES));
        pool
    }

    fn alloc_raw_mem(&self, state: &mut MmapMemPoolState, size: usize, space: SpaceType) -> *mut u8 {
        let mem = match space {
            SpaceType::Object | SpaceType::HumongousObject | SpaceType::NonMovableObject => {
                state.common_space.alloc_raw_mem(size)
            }
            SpaceType::Code => {
                Self::alloc_capped_raw_mem(size, self.code_space_max, &mut state.code_space_current)
            }
            SpaceType::Internal => Self::alloc_capped_raw_mem(
                size,
                self.internal_space_max,
                &mut state.internal_space_current,
            ),
            SpaceType::Compiler => Self::alloc_capped_raw_mem(
                size,
                self.compiler_space_max,
                &mut state.compiler_space_current,
            ),
            SpaceType::Undefined => panic!("tried to allocate raw memory in the undefined space"),
        };
        if mem.is_null() {
            debug!(target: "mempool", size, %space, "out of raw memory");
        }
        mem
    }

    fn alloc_capped_raw_mem(size: usize, max: usize, current: &mut usize) -> *mut u8 {
        if *current + size > max {
            return null_mut();
        }
        let mem = mmap::map_anonymous_aligned(size, POOL_ALIGNMENT_IN_BYTES);
        if !mem.is_null() {
            *current += size;
        }
        mem
    }

    pub fn free_pool(&self, mem: *mut u8, size: usize) {
        let mut state = self.state.lock();
        self.free_pool_unsafe(&mut state, mem, size);
    }

    fn free_pool_unsafe(&self, state: &mut MmapMemPoolState, mem: *mut u8, size: usize) {
        assert!(is_aligned(size, mmap::page_size()));
        let space = self.space_type_for_addr_unsafe(state, mem as usize);
        match space {
            SpaceType::Object | SpaceType::HumongousObject | SpaceType::NonMovableObject => {
                state.common_space_pools.push_free_pool(Pool::new(size, mem));
                state
                    .pool_map
                    .remove_pool(mem as usize - self.min_object_memory_addr, size);
                mmap::release_pages(mem as usize, mem as usize + size);
            }
            SpaceType::Code | SpaceType::Internal | SpaceType::Compiler => {
                match space {
                    SpaceType::Code => state.code_space_current -= size,
                    SpaceType::Internal => state.internal_space_current -= size,
                    SpaceType::Compiler => state.compiler_space_current -= size,
                    _ => unreachable!(),
                }
                state
                    .non_object_pools
                    .remove(&(mem as usize))
                    .expect("freed a non-object pool the source never handed out");
                if let Err(err) = mmap::unmap_raw(mem, size) {
                    panic!("MmapMemPool: unmap error: {err}");
                }
            }
            SpaceType::Undefined => panic!("freed a pool in the undefined space"),
        }
        debug!(target: "mempool", size, addr = mem as usize, %space, "freed pool");
    }

    /// Allocate a pool and place an [`Arena`] header at its start.
    pub fn alloc_arena(
        &self,
        size: usize,
        space: SpaceType,
        kind: AllocatorKind,
        allocator_header: *const (),
        start_alignment: Alignment,
    ) -> *mut Arena {
        let mut state = self.state.lock();
        let pool = self.alloc_pool_unsafe(&mut state, size, space, kind, allocator_header);
        if pool.is_null() {
            error!(target: "mempool", size, %space, "failed to allocate a new arena");
            return null_mut();
        }
        debug_assert!(pool.size() == size);
        unsafe { Arena::write_new(pool.mem(), pool.size(), start_alignment) }
    }

    pub fn free_arena(&self, arena: *mut Arena) {
        let mut state = self.state.lock();
        unsafe {
            (*arena).clear_next_link();
            (*arena).clear_prev_link();
            let size = (*arena).size() + core::mem::size_of::<Arena>();
            debug_assert!(is_aligned(size, mmap::page_size()));
            self.free_pool_unsafe(&mut state, arena as *mut u8, size);
        }
    }

    fn in_object_window(&self, addr: usize) -> bool {
        addr >= self.min_object_address() && addr < self.max_object_address()
    }

    fn find_in_non_object_pools(
        state: &MmapMemPoolState,
        addr: usize,
    ) -> (Pool, AllocatorInfo, SpaceType) {
        let (_, entry) = state
            .non_object_pools
            .range(..=addr)
            .next_back()
            .expect("address below every non-object pool");
        assert!(addr < entry.0.addr() + entry.0.size());
        *entry
    }

    pub fn allocator_info_for_addr(&self, addr: usize) -> AllocatorInfo {
        let state = self.state.lock();
        if !self.in_object_window(addr) {
            return Self::find_in_non_object_pools(&state, addr).1;
        }
        state
            .pool_map
            .allocator_info(addr - self.min_object_memory_addr)
    }

    pub fn space_type_for_addr(&self, addr: usize) -> SpaceType {
        let state = self.state.lock();
        self.space_type_for_addr_unsafe(&state, addr)
    }

    fn space_type_for_addr_unsafe(&self, state: &MmapMemPoolState, addr: usize) -> SpaceType {
        if !self.in_object_window(addr) {
            return Self::find_in_non_object_pools(state, addr).2;
        }
        let space = state
            .pool_map
            .space_type(addr - self.min_object_memory_addr);
        assert!(space != SpaceType::Undefined);
        space
    }

    pub fn start_addr_of_pool_for_addr(&self, addr: usize) -> *mut u8 {
        let state = self.state.lock();
        if !self.in_object_window(addr) {
            return Self::find_in_non_object_pools(&state, addr).0.mem();
        }
        let relative = state
            .pool_map
            .first_byte_of_pool(addr - self.min_object_memory_addr);
        (relative + self.min_object_memory_addr) as *mut u8
    }

    /// Untouched window bytes plus coalesced freed pools.
    pub fn object_space_free_bytes(&self) -> usize {
        let state = self.state.lock();
        let unused = state.common_space.free_space();
        let freed = state.common_space_pools.all_free_size();
        debug_assert!(unused + freed <= state.common_space.max_size);
        unused + freed
    }
}

impl Drop for MmapMemPool {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for (pool, _, _) in state.non_object_pools.values() {
            let _ = mmap::unmap_raw(pool.mem(), pool.size());
        }
        if self.min_object_memory_addr != 0 {
            if let Err(err) = mmap::unmap_raw(
                self.min_object_memory_addr as *mut u8,
                self.mmaped_object_memory_size,
            ) {
                panic!("MmapMemPool: unmap error on teardown: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::SIZE_1M;

    fn mmap_pool(object: usize, internal: usize, compiler: usize, code: usize) -> MmapMemPool {
        MmapMemPool::new(&MemConfig::new(object, internal, compiler, code))
    }

    #[test]
    fn heap_oom() {
        let pool = mmap_pool(4 * SIZE_1M, 0, 0, 0);
        assert!(!pool
            .alloc_pool(4 * SIZE_1M, SpaceType::HumongousObject, AllocatorKind::Humongous, std::ptr::null())
            .is_null());
        assert!(pool
            .alloc_pool(4 * SIZE_1M, SpaceType::HumongousObject, AllocatorKind::Humongous, std::ptr::null())
            .is_null());
        assert!(pool
            .alloc_pool(4 * SIZE_1M, SpaceType::NonMovableObject, AllocatorKind::Humongous, std::ptr::null())
            .is_null());
        assert!(pool
            .alloc_pool(4 * SIZE_1M, SpaceType::Object, AllocatorKind::Humongous, std::ptr::null())
            .is_null());
    }

    #[test]
    fn heap_oom_does_not_block_other_spaces() {
        let pool = mmap_pool(4 * SIZE_1M, SIZE_1M, SIZE_1M, SIZE_1M);
        assert!(!pool
            .alloc_pool(4 * SIZE_1M, SpaceType::Object, AllocatorKind::Bump, std::ptr::null())
            .is_null());
        assert!(pool
            .alloc_pool(4 * SIZE_1M, SpaceType::Object, AllocatorKind::Bump, std::ptr::null())
            .is_null());
        let compiler = pool.alloc_pool(SIZE_1M, SpaceType::Compiler, AllocatorKind::Bump, std::ptr::null());
        let code = pool.alloc_pool(SIZE_1M, SpaceType::Code, AllocatorKind::Bump, std::ptr::null());
        let internal = pool.alloc_pool(SIZE_1M, SpaceType::Internal, AllocatorKind::Bump, std::ptr::null());
        assert!(!compiler.is_null());
        assert!(!code.is_null());
        assert!(!internal.is_null());
        assert_eq!(pool.space_type_for_addr(code.addr()), SpaceType::Code);
        pool.free_pool(compiler.mem(), compiler.size());
        pool.free_pool(code.mem(), code.size());
        pool.free_pool(internal.mem(), internal.size());
    }

    #[test]
    fn allocator_info_lookup() {
        const POOL_SIZE: usize = 4 * SIZE_1M;
        const POINTER_POOL_OFFSET: usize = SIZE_1M;
        let pool = mmap_pool(POOL_SIZE * 2, 0, 0, 0);
        let allocator_header = Box::into_raw(Box::new(0u32));

        let with_addr = pool.alloc_pool(
            POOL_SIZE,
            SpaceType::Object,
            AllocatorKind::Bump,
            allocator_header as *const (),
        );
        let without_addr =
            pool.alloc_pool(POOL_SIZE, SpaceType::Object, AllocatorKind::Bump, std::ptr::null());
        assert!(!with_addr.is_null());
        assert!(!without_addr.is_null());

        let p = with_addr.addr() + POINTER_POOL_OFFSET;
        assert_eq!(pool.allocator_info_for_addr(p).header_addr(), allocator_header as usize);
        assert_eq!(pool.allocator_info_for_addr(p).kind(), AllocatorKind::Bump);
        assert_eq!(pool.start_addr_of_pool_for_addr(p) as usize, with_addr.addr());

        let p = without_addr.addr() + POINTER_POOL_OFFSET;
        assert_eq!(pool.allocator_info_for_addr(p).header_addr(), without_addr.addr());
        assert_eq!(pool.allocator_info_for_addr(p).kind(), AllocatorKind::Bump);
        assert_eq!(pool.start_addr_of_pool_for_addr(p) as usize, without_addr.addr());

        unsafe { drop(Box::from_raw(allocator_header)) };
    }

    #[test]
    fn freed_pools_coalesce_and_are_reused() {
        let pool = mmap_pool(8 * SIZE_1M, 0, 0, 0);
        let kind = AllocatorKind::Humongous;
        let space = SpaceType::Object;
        let null = std::ptr::null();

        let pool1 = pool.alloc_pool(4 * SIZE_1M, space, kind, null);
        assert!(!pool1.is_null());
        let pool2 = pool.alloc_pool(4 * SIZE_1M, space, kind, null);
        assert!(!pool2.is_null());
        assert!(pool.alloc_pool(4 * SIZE_1M, space, kind, null).is_null());
        pool.free_pool(pool1.mem(), pool1.size());
        pool.free_pool(pool2.mem(), pool2.size());

        // The two freed 4 MiB neighbours must serve one 6 MiB request.
        let pool4 = pool.alloc_pool(6 * SIZE_1M, space, kind, null);
        assert!(!pool4.is_null());
        let pool5 = pool.alloc_pool(SIZE_1M, space, kind, null);
        assert!(!pool5.is_null());
        let pool6 = pool.alloc_pool(SIZE_1M, space, kind, null);
        assert!(!pool6.is_null());
        pool.free_pool(pool6.mem(), pool6.size());
        pool.free_pool(pool4.mem(), pool4.size());
        pool.free_pool(pool5.mem(), pool5.size());
        let pool7 = pool.alloc_pool(8 * SIZE_1M, space, kind, null);
        assert!(!pool7.is_null());
    }

    #[test]
    fn pool_return_round_trip_returns_same_addr() {
        let pool = mmap_pool(8 * SIZE_1M, 0, 0, 0);
        let p1 = pool.alloc_pool(4 * SIZE_1M, SpaceType::Object, AllocatorKind::FreeList, std::ptr::null());
        assert!(!p1.is_null());
        pool.free_pool(p1.mem(), p1.size());
        let p2 = pool.alloc_pool(4 * SIZE_1M, SpaceType::Object, AllocatorKind::FreeList, std::ptr::null());
        assert_eq!(p1.addr(), p2.addr());
    }

    #[test]
    fn arena_alloc_and_free() {
        let pool = mmap_pool(4 * SIZE_1M, 0, 0, 0);
        let arena = pool.alloc_arena(
            SIZE_1M,
            SpaceType::Object,
            AllocatorKind::Arena,
            std::ptr::null(),
            crate::arena::ARENA_DEFAULT_ALIGNMENT,
        );
        assert!(!arena.is_null());
        unsafe {
            assert_eq!((*arena).size(), SIZE_1M - core::mem::size_of::<Arena>());
            let mem = (*arena).alloc(128, crate::arena::ARENA_DEFAULT_ALIGNMENT);
            assert!(!mem.is_null());
        }
        pool.free_arena(arena);
        // The arena pool returned to the free map; a full-window request
        // must still be satisfiable.
        let big = pool.alloc_pool(4 * SIZE_1M, SpaceType::Object, AllocatorKind::Humongous, std::ptr::null());
        assert!(!big.is_null());
    }

    #[test]
    fn object_space_free_bytes_accounting() {
        let pool = mmap_pool(4 * SIZE_1M, 0, 0, 0);
        assert_eq!(pool.object_space_free_bytes(), 4 * SIZE_1M);
        let p = pool.alloc_pool(SIZE_1M, SpaceType::Object, AllocatorKind::Bump, std::ptr::null());
        assert_eq!(pool.object_space_free_bytes(), 3 * SIZE_1M);
        pool.free_pool(p.mem(), p.size());
        assert_eq!(pool.object_space_free_bytes(), 4 * SIZE_1M);
    }
}
