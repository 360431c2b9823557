//! One pool per object. A pool header at the start of each pool links it
//! into an occupied list; freed pools can be parked in a small
//! size-sorted reserved cache to damp alloc/free churn before going back
//! to the pool source.

use std::cell::UnsafeCell;
use std::ptr::null_mut;
use std::sync::Arc;

use tracing::debug;

use crate::alloc_config::AllocConfig;
use crate::lock_config::{LockConfig, MtLockConfig, RwLockKind};
use crate::mem::{align_up, Alignment, ObjectStatus, POOL_ALIGNMENT_IN_BYTES, SIZE_1M};
use crate::mmap;
use crate::object_header::ObjectHeader;
use crate::space::SpaceType;

/// Reserved-cache tuning: at most this many pools, each no bigger than
/// this.
pub const HUMONGOUS_RESERVED_MEM_MAX_POOLS: usize = 0;
pub const HUMONGOUS_RESERVED_MEM_MAX_POOL_SIZE: usize = 8 * SIZE_1M;

#[cfg(debug_assertions)]
const HUMONGOUS_MAX_SIZE: usize = 2 * 1024 * SIZE_1M;
#[cfg(not(debug_assertions))]
const HUMONGOUS_MAX_SIZE: usize = usize::MAX;

#[repr(C)]
struct MemoryPoolHeader {
    prev: *mut MemoryPoolHeader,
    next: *mut MemoryPoolHeader,
    pool_size: usize,
    mem_addr: *mut u8,
}

impl MemoryPoolHeader {
    unsafe fn initialize(header: *mut Self, pool_size: usize) {
        header.write(MemoryPoolHeader {
            prev: null_mut(),
            next: null_mut(),
            pool_size,
            mem_addr: null_mut(),
        });
    }

    /// Fix the object location inside the pool.
    unsafe fn alloc(header: *mut Self, align: Alignment) -> *mut u8 {
        let payload = header as usize + core::mem::size_of::<MemoryPoolHeader>();
        let mem = align_up(payload, align.in_bytes()) as *mut u8;
        (*header).mem_addr = mem;
        mem
    }
}

struct MemoryPoolList {
    head: *mut MemoryPoolHeader,
}

impl MemoryPoolList {
    const fn new() -> Self {
        Self { head: null_mut() }
    }

    fn insert(&mut self, pool: *mut MemoryPoolHeader) {
        unsafe {
            (*pool).prev = null_mut();
            (*pool).next = self.head;
            if !self.head.is_null() {
                (*self.head).prev = pool;
            }
            self.head = pool;
        }
    }

    fn pop(&mut self, pool: *mut MemoryPoolHeader) {
        unsafe {
            let prev = (*pool).prev;
            let next = (*pool).next;
            if prev.is_null() {
                debug_assert!(self.head == pool);
                self.head = next;
            } else {
                (*prev).next = next;
            }
            if !next.is_null() {
                (*next).prev = prev;
            }
            (*pool).prev = null_mut();
            (*pool).next = null_mut();
        }
    }

    fn find_suitable_pool(&self, size: usize) -> *mut MemoryPoolHeader {
        let mut cur = self.head;
        unsafe {
            while !cur.is_null() {
                let payload = cur as usize + core::mem::size_of::<MemoryPoolHeader>();
                let usable = (*cur).pool_size - (payload - cur as usize);
                if usable >= size {
                    return cur;
                }
                cur = (*cur).next;
            }
        }
        null_mut()
    }

    fn iterate(&self, mut visitor: impl FnMut(*mut MemoryPoolHeader)) {
        let mut cur = self.head;
        while !cur.is_null() {
            let next = unsafe { (*cur).next };
            visitor(cur);
            cur = next;
        }
    }
}

/// Freed pools kept sorted ascending by size; a bigger incoming pool
/// crowds out the smallest one once the cache is full.
struct ReservedMemoryPools {
    list: MemoryPoolList,
    elements_count: usize,
}

impl ReservedMemoryPools {
    const fn new() -> Self {
        Self {
            list: MemoryPoolList::new(),
            elements_count: 0,
        }
    }

    fn find_suitable_pool(&self, size: usize) -> *mut MemoryPoolHeader {
        self.list.find_suitable_pool(size)
    }

    fn pop(&mut self, pool: *mut MemoryPoolHeader) {
        self.elements_count -= 1;
        self.list.pop(pool);
    }

    /// Returns the pool that did not fit: the argument itself, a crowded
    /// out smaller pool, or null when everything was absorbed.
    fn try_to_insert(&mut self, pool: *mut MemoryPoolHeader) -> *mut MemoryPoolHeader {
        unsafe {
            if (*pool).pool_size > HUMONGOUS_RESERVED_MEM_MAX_POOL_SIZE {
                return pool;
            }
            if self.elements_count < HUMONGOUS_RESERVED_MEM_MAX_POOLS {
                self.sorted_insert(pool);
                self.elements_count += 1;
                return null_mut();
            }
            let smallest = self.list.head;
            if smallest.is_null() || (*smallest).pool_size >= (*pool).pool_size {
                return pool;
            }
            self.list.pop(smallest);
            self.sorted_insert(pool);
            smallest
        }
    }

    fn sorted_insert(&mut self, pool: *mut MemoryPoolHeader) {
        unsafe {
            let size = (*pool).pool_size;
            let mut prev: *mut MemoryPoolHeader = null_mut();
            let mut cur = self.list.head;
            while !cur.is_null() && (*cur).pool_size < size {
                prev = cur;
                cur = (*cur).next;
            }
            (*pool).prev = prev;
            (*pool).next = cur;
            if !cur.is_null() {
                (*cur).prev = pool;
            }
            if prev.is_null() {
                self.list.head = pool;
            } else {
                (*prev).next = pool;
            }
        }
    }
}

pub struct HumongousObjAllocator<L: LockConfig = MtLockConfig> {
    occupied_pools: UnsafeCell<MemoryPoolList>,
    reserved_pools: UnsafeCell<ReservedMemoryPools>,
    free_pools: UnsafeCell<MemoryPoolList>,
    alloc_free_lock: L::AllocRwLock,
    space: SpaceType,
    config: Arc<AllocConfig>,
}

unsafe impl<L: LockConfig> Send for HumongousObjAllocator<L> {}
unsafe impl<L: LockConfig> Sync for HumongousObjAllocator<L> {}

impl<L: LockConfig> HumongousObjAllocator<L> {
    pub fn new(space: SpaceType, config: Arc<AllocConfig>) -> Self {
        Self {
            occupied_pools: UnsafeCell::new(MemoryPoolList::new()),
            reserved_pools: UnsafeCell::new(ReservedMemoryPools::new()),
            free_pools: UnsafeCell::new(MemoryPoolList::new()),
            alloc_free_lock: <L::AllocRwLock as RwLockKind>::INIT,
            space,
            config,
        }
    }

    pub const fn max_alloc_size() -> usize {
        HUMONGOUS_MAX_SIZE
    }

    /// Pool size needed for an object of `obj_size` bytes, leaving room
    /// for the header and the worst-case alignment drift.
    pub const fn min_pool_size(obj_size: usize) -> usize {
        align_up(
            obj_size + core::mem::size_of::<MemoryPoolHeader>() + Alignment::MAX.in_bytes(),
            POOL_ALIGNMENT_IN_BYTES,
        )
    }

    pub fn add_memory_pool(&self, mem: *mut u8, size: usize) -> bool {
        self.alloc_free_lock.write_lock();
        unsafe {
            let header = mem as *mut MemoryPoolHeader;
            MemoryPoolHeader::initialize(header, size);
            (*self.free_pools.get()).insert(header);
        }
        self.alloc_free_lock.write_unlock();
        debug!(target: "alloc", addr = mem as usize, size, space = %self.space, "humongous pool added");
        true
    }

    pub fn alloc(&self, size: usize, align: Alignment) -> *mut u8 {
        if size == 0 || size >= HUMONGOUS_MAX_SIZE {
            return null_mut();
        }
        let needed = size + align.in_bytes();
        self.alloc_free_lock.write_lock();
        let mem = unsafe {
            let reserved = &mut *self.reserved_pools.get();
            let free = &mut *self.free_pools.get();
            let pool = {
                let cached = reserved.find_suitable_pool(needed);
                if !cached.is_null() {
                    reserved.pop(cached);
                    self.release_unused_pages_on_alloc(cached, size);
                    cached
                } else {
                    let fresh = free.find_suitable_pool(needed);
                    if !fresh.is_null() {
                        free.pop(fresh);
                    }
                    fresh
                }
            };
            if pool.is_null() {
                self.alloc_free_lock.write_unlock();
                return null_mut();
            }
            let mem = MemoryPoolHeader::alloc(pool, align);
            (*self.occupied_pools.get()).insert(pool);
            self.config.memory_init(mem, size);
            self.config.on_alloc((*pool).pool_size, self.space);
            self.config.add_to_crossing_map(mem as usize, size);
            mem
        };
        self.alloc_free_lock.write_unlock();
        mem
    }

    /// Hint the slack of a reused, larger-than-needed pool back to the OS.
    fn release_unused_pages_on_alloc(&self, pool: *mut MemoryPoolHeader, alloc_size: usize) {
        unsafe {
            let first_unused =
                pool as usize + core::mem::size_of::<MemoryPoolHeader>() + alloc_size + Alignment::MAX.in_bytes();
            let pool_end = pool as usize + (*pool).pool_size;
            if first_unused < pool_end {
                mmap::release_pages(first_unused, pool_end);
            }
        }
    }

    pub fn free(&self, mem: *mut u8) {
        self.alloc_free_lock.write_lock();
        unsafe {
            let pool = self.find_occupied_unsafe(mem);
            assert!(
                !pool.is_null(),
                "free of a pointer the humongous allocator does not own"
            );
            (*self.occupied_pools.get()).pop(pool);
            self.config.on_free((*pool).pool_size, self.space);
            self.config
                .remove_from_crossing_map(mem as usize, self.object_extent(pool), None, None);
            (*pool).mem_addr = null_mut();
            let leftover = (*self.reserved_pools.get()).try_to_insert(pool);
            if !leftover.is_null() {
                (*self.free_pools.get()).insert(leftover);
            }
        }
        self.alloc_free_lock.write_unlock();
    }

    fn object_extent(&self, pool: *mut MemoryPoolHeader) -> usize {
        unsafe {
            let obj = (*pool).mem_addr as usize;
            pool as usize + (*pool).pool_size - obj
        }
    }

    unsafe fn find_occupied_unsafe(&self, mem: *mut u8) -> *mut MemoryPoolHeader {
        let mut found = null_mut();
        (*self.occupied_pools.get()).iterate(|pool| {
            if (*pool).mem_addr == mem {
                found = pool;
            }
        });
        found
    }

    pub fn collect(&self, mut death_checker: impl FnMut(*mut ObjectHeader) -> ObjectStatus) {
        let mut dead = Vec::new();
        self.iterate_over_objects(|obj| {
            if death_checker(obj) == ObjectStatus::Dead {
                dead.push(obj as *mut u8);
            }
        });
        for mem in dead {
            self.free(mem);
        }
    }

    pub fn iterate_over_objects(&self, mut visitor: impl FnMut(*mut ObjectHeader)) {
        self.alloc_free_lock.read_lock();
        unsafe {
            (*self.occupied_pools.get()).iterate(|pool| {
                visitor((*pool).mem_addr as *mut ObjectHeader);
            });
        }
        self.alloc_free_lock.read_unlock();
    }

    pub fn iterate_over_objects_in_range(
        &self,
        mut visitor: impl FnMut(*mut ObjectHeader),
        left_border: usize,
        right_border: usize,
    ) {
        self.iterate_over_objects(|obj| {
            let addr = obj as usize;
            if addr >= left_border && addr <= right_border {
                visitor(obj);
            }
        });
    }

    pub fn contain_object(&self, obj: *const ObjectHeader) -> bool {
        self.alloc_free_lock.read_lock();
        let found = unsafe { !self.find_occupied_unsafe(obj as *mut u8).is_null() };
        self.alloc_free_lock.read_unlock();
        found
    }

    pub fn is_live(&self, obj: *const ObjectHeader) -> bool {
        self.contain_object(obj)
    }

    /// Pools neither occupied nor worth caching; the visitor returns them
    /// to the pool source.
    pub fn visit_and_remove_free_pools(&self, mut mem_visitor: impl FnMut(*mut u8, usize)) {
        self.alloc_free_lock.write_lock();
        unsafe {
            let free = &mut *self.free_pools.get();
            while !free.head.is_null() {
                let pool = free.head;
                free.pop(pool);
                mem_visitor(pool as *mut u8, (*pool).pool_size);
            }
        }
        self.alloc_free_lock.write_unlock();
    }

    pub fn visit_and_remove_all_pools(&self, mut mem_visitor: impl FnMut(*mut u8, usize)) {
        self.alloc_free_lock.write_lock();
        unsafe {
            for list in [
                &mut *self.occupied_pools.get(),
                &mut (*self.reserved_pools.get()).list,
                &mut *self.free_pools.get(),
            ] {
                while !list.head.is_null() {
                    let pool = list.head;
                    list.pop(pool);
                    mem_visitor(pool as *mut u8, (*pool).pool_size);
                }
            }
            (*self.reserved_pools.get()).elements_count = 0;
        }
        self.alloc_free_lock.write_unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock_config::StLockConfig;
    use crate::mem::{is_aligned, DEFAULT_ALIGNMENT};
    use crate::mem_config::MemConfig;
    use crate::mem_stats::MemStats;
    use crate::pool_manager::{PoolManager, PoolSourceKind};
    use crate::pool_map::AllocatorKind;

    struct Fixture {
        manager: Arc<PoolManager>,
        allocator: HumongousObjAllocator<StLockConfig>,
    }

    impl Fixture {
        fn new() -> Self {
            let manager = PoolManager::new(
                PoolSourceKind::Mmap,
                &MemConfig::new(64 * SIZE_1M, 0, 0, 0),
            );
            let config = AllocConfig::new(Arc::new(MemStats::new()));
            let allocator =
                HumongousObjAllocator::<StLockConfig>::new(SpaceType::HumongousObject, config);
            Self { manager, allocator }
        }

        fn feed_pool(&self, obj_size: usize) {
            let pool_size = HumongousObjAllocator::<StLockConfig>::min_pool_size(obj_size);
            let pool = self.manager.alloc_pool(
                pool_size,
                SpaceType::HumongousObject,
                AllocatorKind::Humongous,
                std::ptr::null(),
            );
            assert!(!pool.is_null());
            assert!(self.allocator.add_memory_pool(pool.mem(), pool.size()));
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let manager = self.manager.clone();
            self.allocator
                .visit_and_remove_all_pools(|mem, size| manager.free_pool(mem, size));
        }
    }

    #[test]
    fn one_object_per_pool() {
        let f = Fixture::new();
        f.feed_pool(SIZE_1M);
        let mem = f.allocator.alloc(SIZE_1M, DEFAULT_ALIGNMENT);
        assert!(!mem.is_null());
        unsafe { std::ptr::write_bytes(mem, 0x2a, SIZE_1M) };
        assert!(f.allocator.contain_object(mem as *const ObjectHeader));
        // The pool is taken; a second object needs a second pool.
        assert!(f.allocator.alloc(SIZE_1M, DEFAULT_ALIGNMENT).is_null());
        f.allocator.free(mem);
        assert!(!f.allocator.contain_object(mem as *const ObjectHeader));
        assert!(!f.allocator.alloc(SIZE_1M, DEFAULT_ALIGNMENT).is_null());
    }

    #[test]
    fn zero_sized_request_is_rejected() {
        let f = Fixture::new();
        f.feed_pool(SIZE_1M);
        assert!(f.allocator.alloc(0, DEFAULT_ALIGNMENT).is_null());
    }

    #[cfg(debug_assertions)]
    #[test]
    fn debug_max_size_is_enforced() {
        let f = Fixture::new();
        assert!(f.allocator.alloc(HUMONGOUS_MAX_SIZE, DEFAULT_ALIGNMENT).is_null());
        assert!(f
            .allocator
            .alloc(HUMONGOUS_MAX_SIZE + 1, DEFAULT_ALIGNMENT)
            .is_null());
    }

    #[test]
    fn aligned_humongous_object() {
        let f = Fixture::new();
        f.feed_pool(2 * SIZE_1M);
        let align = Alignment::LogAlign13;
        let mem = f.allocator.alloc(SIZE_1M, align);
        assert!(!mem.is_null());
        assert!(is_aligned(mem as usize, align.in_bytes()));
        f.allocator.free(mem);
    }

    #[test]
    fn free_pools_go_back_to_source() {
        let f = Fixture::new();
        f.feed_pool(SIZE_1M);
        let mem = f.allocator.alloc(SIZE_1M, DEFAULT_ALIGNMENT);
        f.allocator.free(mem);
        // The default reserved cache is empty, so the pool is immediately
        // returnable.
        let mut returned = Vec::new();
        f.allocator
            .visit_and_remove_free_pools(|mem, size| returned.push((mem as usize, size)));
        assert_eq!(returned.len(), 1);
        for (mem, size) in returned {
            f.manager.free_pool(mem as *mut u8, size);
        }
    }

    #[test]
    fn collect_and_iterate() {
        let f = Fixture::new();
        f.feed_pool(SIZE_1M);
        f.feed_pool(SIZE_1M);
        let keep = f.allocator.alloc(SIZE_1M, DEFAULT_ALIGNMENT);
        let kill = f.allocator.alloc(SIZE_1M, DEFAULT_ALIGNMENT);
        assert!(!keep.is_null() && !kill.is_null());
        let mut count = 0;
        f.allocator.iterate_over_objects(|_| count += 1);
        assert_eq!(count, 2);
        f.allocator.collect(|obj| {
            if obj as usize == kill as usize {
                ObjectStatus::Dead
            } else {
                ObjectStatus::Alive
            }
        });
        assert!(f.allocator.is_live(keep as *const ObjectHeader));
        assert!(!f.allocator.is_live(kill as *const ObjectHeader));
    }
}
