//! Segregated free-list allocator for medium objects. Free blocks live on
//! sixteen size-bucketed lists kept in descending size order; freeing
//! coalesces with both neighbours, so two adjacent free blocks never
//! coexist. One RW lock per allocator: iteration reads, alloc/free write.

use std::cell::UnsafeCell;
use std::ptr::null_mut;
use std::sync::Arc;

use tracing::debug;

use crate::alloc_config::AllocConfig;
use crate::freelist::{
    FreeListHeader, MemoryBlockHeader, PaddingStatus, FREE_LIST_LINKS_SIZE,
};
use crate::lock_config::{LockConfig, MtLockConfig, RwLockKind};
use crate::mem::{
    align_up, is_aligned, Alignment, ObjectStatus, DEFAULT_ALIGNMENT, DEFAULT_ALIGNMENT_IN_BYTES,
    DEFAULT_ALLOCATOR_POOL_SIZE,
};
use crate::object_header::ObjectHeader;
use crate::runslots::SLOT_MAX_SIZE;
use crate::space::SpaceType;

/// Requests below this land in the runslots allocator instead.
pub const FREELIST_ALLOCATOR_MIN_SIZE: usize = SLOT_MAX_SIZE;
pub const FREELIST_DEFAULT_MEMORY_POOL_SIZE: usize = DEFAULT_ALLOCATOR_POOL_SIZE;

const BLOCK_HEADER_SIZE: usize = core::mem::size_of::<MemoryBlockHeader>();
const POOL_HEADER_SIZE: usize = align_up(core::mem::size_of::<MemoryPoolHeader>(), BLOCK_HEADER_SIZE);

/// Splitting must always be possible, so a single allocation may take at
/// most half a fresh pool.
pub const FREELIST_MAX_ALLOC_SIZE: usize =
    ((FREELIST_DEFAULT_MEMORY_POOL_SIZE - POOL_HEADER_SIZE) / 2) - BLOCK_HEADER_SIZE;

const SEGREGATED_LIST_SIZE: usize = 16;
const SEGREGATED_LIST_FREE_BLOCK_RANGE: usize =
    (FREELIST_MAX_ALLOC_SIZE - FREELIST_ALLOCATOR_MIN_SIZE) / SEGREGATED_LIST_SIZE;

#[repr(C)]
struct MemoryPoolHeader {
    prev: *mut MemoryPoolHeader,
    next: *mut MemoryPoolHeader,
    size: usize,
}

impl MemoryPoolHeader {
    fn first_block(&self) -> *mut MemoryBlockHeader {
        (self as *const Self as usize + POOL_HEADER_SIZE) as *mut MemoryBlockHeader
    }

    fn in_pool(&self, addr: usize) -> bool {
        let start = self as *const Self as usize;
        addr >= start && addr < start + self.size
    }
}

struct SegregatedList {
    heads: [*mut FreeListHeader; SEGREGATED_LIST_SIZE],
}

impl SegregatedList {
    const fn new() -> Self {
        Self {
            heads: [null_mut(); SEGREGATED_LIST_SIZE],
        }
    }

    fn index(size: usize) -> usize {
        if size < FREELIST_ALLOCATOR_MIN_SIZE {
            return 0;
        }
        ((size - FREELIST_ALLOCATOR_MIN_SIZE) / SEGREGATED_LIST_FREE_BLOCK_RANGE)
            .min(SEGREGATED_LIST_SIZE - 1)
    }

    /// Insert keeping each list in descending size order, so the walk for
    /// the most suitable block can stop early.
    fn add(&mut self, free_header: *mut FreeListHeader) {
        unsafe {
            let size = (*free_header).size();
            let index = Self::index(size);
            let mut prev: *mut FreeListHeader = null_mut();
            let mut cur = self.heads[index];
            while !cur.is_null() && (*cur).size() > size {
                prev = cur;
                cur = (*cur).next_free();
            }
            (*free_header).set_next_free(cur);
            (*free_header).set_prev_free(prev);
            if !cur.is_null() {
                (*cur).set_prev_free(free_header);
            }
            if prev.is_null() {
                self.heads[index] = free_header;
            } else {
                (*prev).set_next_free(free_header);
            }
        }
    }

    fn pop(&mut self, free_header: *mut FreeListHeader) {
        unsafe {
            let index = Self::index((*free_header).size());
            let next = (*free_header).next_free();
            let prev = (*free_header).prev_free();
            if !next.is_null() {
                (*next).set_prev_free(prev);
            }
            if prev.is_null() {
                debug_assert!(self.heads[index] == free_header);
                self.heads[index] = next;
            } else {
                (*prev).set_next_free(next);
            }
            (*free_header).set_next_free(null_mut());
            (*free_header).set_prev_free(null_mut());
        }
    }

    /// Smallest free block that fits `size`, searching this bucket and up.
    fn find(&self, size: usize) -> *mut FreeListHeader {
        unsafe {
            for index in Self::index(size)..SEGREGATED_LIST_SIZE {
                let mut best: *mut FreeListHeader = null_mut();
                let mut cur = self.heads[index];
                while !cur.is_null() {
                    let cur_size = (*cur).size();
                    if cur_size >= size {
                        best = cur;
                        if cur_size == size {
                            break;
                        }
                    } else {
                        // Descending order; nothing further fits.
                        break;
                    }
                    cur = (*cur).next_free();
                }
                if !best.is_null() {
                    return best;
                }
            }
        }
        null_mut()
    }
}

pub struct FreeListAllocator<L: LockConfig = MtLockConfig> {
    segregated_list: UnsafeCell<SegregatedList>,
    mempool_head: UnsafeCell<*mut MemoryPoolHeader>,
    alloc_free_lock: L::AllocRwLock,
    space: SpaceType,
    config: Arc<AllocConfig>,
}

unsafe impl<L: LockConfig> Send for FreeListAllocator<L> {}
unsafe impl<L: LockConfig> Sync for FreeListAllocator<L> {}

impl<L: LockConfig> FreeListAllocator<L> {
    pub fn new(space: SpaceType, config: Arc<AllocConfig>) -> Self {
        Self {
            segregated_list: UnsafeCell::new(SegregatedList::new()),
            mempool_head: UnsafeCell::new(null_mut()),
            alloc_free_lock: <L::AllocRwLock as RwLockKind>::INIT,
            space,
            config,
        }
    }

    pub const fn max_alloc_size() -> usize {
        FREELIST_MAX_ALLOC_SIZE
    }

    pub const fn min_pool_size() -> usize {
        FREELIST_DEFAULT_MEMORY_POOL_SIZE
    }

    pub fn add_memory_pool(&self, mem: *mut u8, size: usize) -> bool {
        debug_assert!(is_aligned(mem as usize, BLOCK_HEADER_SIZE));
        if size <= POOL_HEADER_SIZE + BLOCK_HEADER_SIZE + FREELIST_ALLOCATOR_MIN_SIZE {
            return false;
        }
        self.alloc_free_lock.write_lock();
        unsafe {
            let pool = mem as *mut MemoryPoolHeader;
            let head = *self.mempool_head.get();
            pool.write(MemoryPoolHeader {
                prev: null_mut(),
                next: head,
                size,
            });
            if !head.is_null() {
                (*head).prev = pool;
            }
            *self.mempool_head.get() = pool;

            let block = (*pool).first_block();
            MemoryBlockHeader::initialize(
                block,
                size - POOL_HEADER_SIZE - BLOCK_HEADER_SIZE,
                null_mut(),
            );
            (*block).set_last_block_in_pool();
            let free_header = FreeListHeader::from_block(block);
            (*self.segregated_list.get()).add(free_header);
        }
        self.alloc_free_lock.write_unlock();
        debug!(target: "alloc", addr = mem as usize, size, space = %self.space, "freelist pool added");
        true
    }

    pub fn alloc(&self, size: usize, align: Alignment) -> *mut u8 {
        if size == 0 {
            return null_mut();
        }
        let mut alloc_size = align_up(size, DEFAULT_ALIGNMENT_IN_BYTES).max(FREELIST_ALLOCATOR_MIN_SIZE);
        // Aligned requests reserve room to shift the object and describe
        // the shift with a padding header.
        if align > DEFAULT_ALIGNMENT {
            alloc_size += align.in_bytes() + BLOCK_HEADER_SIZE;
        }
        if alloc_size > FREELIST_MAX_ALLOC_SIZE {
            return null_mut();
        }
        self.alloc_free_lock.write_lock();
        let segregated = unsafe { &mut *self.segregated_list.get() };
        let free_header = segregated.find(alloc_size);
        if free_header.is_null() {
            self.alloc_free_lock.write_unlock();
            return null_mut();
        }
        segregated.pop(free_header);
        let block = free_header as *mut MemoryBlockHeader;
        unsafe {
            self.try_split(block, alloc_size, segregated);
            (*block).set_used();
            let mem = self.apply_padding(block, align);
            self.config.memory_init(mem, size);
            self.config.on_alloc((*block).size(), self.space);
            self.config.add_to_crossing_map(mem as usize, size);
            self.alloc_free_lock.write_unlock();
            mem
        }
    }

    /// Peel the tail of `block` off into a new free block when the
    /// remainder is worth tracking.
    unsafe fn try_split(
        &self,
        block: *mut MemoryBlockHeader,
        alloc_size: usize,
        segregated: &mut SegregatedList,
    ) {
        let remainder = (*block).size() - alloc_size;
        if remainder < FREELIST_ALLOCATOR_MIN_SIZE + BLOCK_HEADER_SIZE + FREE_LIST_LINKS_SIZE {
            return;
        }
        let new_block =
            ((*block).raw_memory() as usize + alloc_size) as *mut MemoryBlockHeader;
        MemoryBlockHeader::initialize(new_block, remainder - BLOCK_HEADER_SIZE, block);
        if (*block).is_last_block_in_pool() {
            (*new_block).set_last_block_in_pool();
            (*block).clear_last_block_in_pool();
        } else {
            let next_next = (*new_block).next_header();
            (*next_next).set_prev_header(new_block);
        }
        (*block).set_size(alloc_size);
        segregated.add(FreeListHeader::from_block(new_block));
    }

    /// Shift the object pointer up to `align` and record how.
    unsafe fn apply_padding(&self, block: *mut MemoryBlockHeader, align: Alignment) -> *mut u8 {
        let payload = (*block).raw_memory();
        (*block).set_padding_status(PaddingStatus::Common);
        if align <= DEFAULT_ALIGNMENT || is_aligned(payload as usize, align.in_bytes()) {
            return payload;
        }
        let mut aligned = align_up(payload as usize, align.in_bytes());
        if aligned - (payload as usize) < BLOCK_HEADER_SIZE {
            aligned += align.in_bytes();
        }
        let pad = aligned - payload as usize;
        debug_assert!(pad >= BLOCK_HEADER_SIZE);
        let padding_header = (aligned - BLOCK_HEADER_SIZE) as *mut MemoryBlockHeader;
        MemoryBlockHeader::initialize(padding_header, 0, block);
        (*padding_header).set_padding_status(PaddingStatus::PaddingHeader);
        if pad == BLOCK_HEADER_SIZE {
            (*block).set_padding_status(PaddingStatus::CommonWithPaddingHeader);
        } else {
            (payload as *mut usize).write(pad);
            (*block).set_padding_status(PaddingStatus::CommonWithPaddingSize);
        }
        aligned as *mut u8
    }

    /// Main header for an object pointer, looking through any padding
    /// header in front of it.
    unsafe fn memory_header_for(&self, mem: *mut u8) -> *mut MemoryBlockHeader {
        let header = (mem as usize - BLOCK_HEADER_SIZE) as *mut MemoryBlockHeader;
        if (*header).padding_status() == PaddingStatus::PaddingHeader {
            return (*header).prev_header();
        }
        header
    }

    pub fn free(&self, mem: *mut u8) {
        self.alloc_free_lock.write_lock();
        unsafe {
            assert!(
                self.allocated_by_this_unsafe(mem),
                "free of a pointer the freelist allocator does not own"
            );
            self.free_unsafe(mem);
        }
        self.alloc_free_lock.write_unlock();
    }

    unsafe fn free_unsafe(&self, mem: *mut u8) {
        let mut block = self.memory_header_for(mem);
        debug_assert!((*block).is_used());
        let freed_size = (*block).size();
        // Extent from the object start to the end of its block; never
        // reaches into a neighbouring block.
        let obj_extent = freed_size - (mem as usize - (*block).raw_memory() as usize);

        let (next_obj, prev_obj) = self.used_neighbours(block);
        self.config
            .remove_from_crossing_map(mem as usize, obj_extent, next_obj, prev_obj);

        (*block).set_unused();
        (*block).set_padding_status(PaddingStatus::Common);
        let segregated = &mut *self.segregated_list.get();

        // Coalesce with the previous block.
        let prev = (*block).prev_header();
        if !prev.is_null() && !(*prev).is_used() {
            segregated.pop(prev as *mut FreeListHeader);
            (*prev).set_size((*prev).size() + BLOCK_HEADER_SIZE + (*block).size());
            if (*block).is_last_block_in_pool() {
                (*prev).set_last_block_in_pool();
            } else {
                let next = (*block).next_header();
                (*next).set_prev_header(prev);
            }
            block = prev;
        }
        // And with the next one.
        if !(*block).is_last_block_in_pool() {
            let next = (*block).next_header();
            if !(*next).is_used() {
                segregated.pop(next as *mut FreeListHeader);
                (*block).set_size((*block).size() + BLOCK_HEADER_SIZE + (*next).size());
                if (*next).is_last_block_in_pool() {
                    (*block).set_last_block_in_pool();
                } else {
                    let next_next = (*block).next_header();
                    (*next_next).set_prev_header(block);
                }
            }
        }
        segregated.add(FreeListHeader::from_block(block));
        self.config.on_free(freed_size, self.space);
    }

    /// Object addresses of the nearest used blocks around `block`.
    unsafe fn used_neighbours(
        &self,
        block: *mut MemoryBlockHeader,
    ) -> (Option<usize>, Option<(usize, usize)>) {
        let mut next_obj = None;
        let mut cur = block;
        while !(*cur).is_last_block_in_pool() {
            cur = (*cur).next_header();
            if (*cur).is_used() {
                next_obj = Some((*cur).object_addr() as usize);
                break;
            }
        }
        let mut prev_obj = None;
        let mut cur = (*block).prev_header();
        while !cur.is_null() {
            if (*cur).is_used() {
                prev_obj = Some(((*cur).object_addr() as usize, (*cur).size()));
                break;
            }
            cur = (*cur).prev_header();
        }
        (next_obj, prev_obj)
    }

    unsafe fn allocated_by_this_unsafe(&self, mem: *mut u8) -> bool {
        let mut pool = *self.mempool_head.get();
        while !pool.is_null() {
            if (*pool).in_pool(mem as usize) {
                let mut block = (*pool).first_block();
                loop {
                    if (*block).is_used() && (*block).object_addr() == mem {
                        return true;
                    }
                    if (*block).is_last_block_in_pool() {
                        break;
                    }
                    block = (*block).next_header();
                }
                return false;
            }
            pool = (*pool).next;
        }
        false
    }

    /// Sweep used blocks in address order, freeing the dead ones. The dead
    /// set is gathered before any free so coalescing cannot disturb the
    /// walk.
    pub fn collect(&self, mut death_checker: impl FnMut(*mut ObjectHeader) -> ObjectStatus) {
        let mut dead = Vec::new();
        self.iterate_over_objects(|obj| {
            if death_checker(obj) == ObjectStatus::Dead {
                dead.push(obj as *mut u8);
            }
        });
        self.alloc_free_lock.write_lock();
        for mem in dead {
            unsafe { self.free_unsafe(mem) };
        }
        self.alloc_free_lock.write_unlock();
    }

    pub fn iterate_over_objects(&self, mut visitor: impl FnMut(*mut ObjectHeader)) {
        self.alloc_free_lock.read_lock();
        unsafe {
            let mut pool = *self.mempool_head.get();
            while !pool.is_null() {
                let mut block = (*pool).first_block();
                loop {
                    if (*block).is_used() {
                        visitor((*block).object_addr() as *mut ObjectHeader);
                    }
                    if (*block).is_last_block_in_pool() {
                        break;
                    }
                    block = (*block).next_header();
                }
                pool = (*pool).next;
            }
        }
        self.alloc_free_lock.read_unlock();
    }

    /// Range iteration never leaves the pool containing `left_border`.
    pub fn iterate_over_objects_in_range(
        &self,
        mut visitor: impl FnMut(*mut ObjectHeader),
        left_border: usize,
        right_border: usize,
    ) {
        self.alloc_free_lock.read_lock();
        unsafe {
            let mut pool = *self.mempool_head.get();
            while !pool.is_null() {
                if (*pool).in_pool(left_border) {
                    let mut block = (*pool).first_block();
                    loop {
                        if (*block).is_used() {
                            let obj = (*block).object_addr() as usize;
                            if obj >= left_border && obj <= right_border {
                                visitor(obj as *mut ObjectHeader);
                            }
                        }
                        if (*block).is_last_block_in_pool() {
                            break;
                        }
                        block = (*block).next_header();
                    }
                    break;
                }
                pool = (*pool).next;
            }
        }
        self.alloc_free_lock.read_unlock();
    }

    pub fn contain_object(&self, obj: *const ObjectHeader) -> bool {
        self.alloc_free_lock.read_lock();
        let contained = unsafe { self.allocated_by_this_unsafe(obj as *mut u8) };
        self.alloc_free_lock.read_unlock();
        contained
    }

    pub fn is_live(&self, obj: *const ObjectHeader) -> bool {
        self.contain_object(obj)
    }

    /// Total bytes sitting on the free lists.
    pub fn free_bytes(&self) -> usize {
        self.alloc_free_lock.read_lock();
        let mut total = 0;
        unsafe {
            let segregated = &*self.segregated_list.get();
            for head in segregated.heads {
                let mut cur = head;
                while !cur.is_null() {
                    total += (*cur).size();
                    cur = (*cur).next_free();
                }
            }
        }
        self.alloc_free_lock.read_unlock();
        total
    }

    /// Walk every block of every pool and check the doubly linked
    /// structure; returns the failure count.
    pub fn verify_allocator(&self) -> usize {
        let mut fail_count = 0;
        self.alloc_free_lock.read_lock();
        unsafe {
            let mut pool = *self.mempool_head.get();
            while !pool.is_null() {
                let mut prev: *mut MemoryBlockHeader = null_mut();
                let mut block = (*pool).first_block();
                let mut prev_free = false;
                loop {
                    if (*block).prev_header() != prev {
                        fail_count += 1;
                    }
                    let is_free = !(*block).is_used();
                    if is_free && prev_free {
                        // Adjacent free blocks must have been coalesced.
                        fail_count += 1;
                    }
                    prev_free = is_free;
                    if (*block).is_last_block_in_pool() {
                        break;
                    }
                    prev = block;
                    block = (*block).next_header();
                }
                pool = (*pool).next;
            }
        }
        self.alloc_free_lock.read_unlock();
        fail_count
    }

    /// Hand pools whose only block is free back to the visitor.
    pub fn visit_and_remove_free_pools(&self, mut mem_visitor: impl FnMut(*mut u8, usize)) {
        self.alloc_free_lock.write_lock();
        unsafe {
            let segregated = &mut *self.segregated_list.get();
            let mut pool = *self.mempool_head.get();
            while !pool.is_null() {
                let next = (*pool).next;
                let block = (*pool).first_block();
                if !(*block).is_used() && (*block).is_last_block_in_pool() {
                    segregated.pop(block as *mut FreeListHeader);
                    let prev = (*pool).prev;
                    if !prev.is_null() {
                        (*prev).next = next;
                    } else {
                        *self.mempool_head.get() = next;
                    }
                    if !next.is_null() {
                        (*next).prev = prev;
                    }
                    mem_visitor(pool as *mut u8, (*pool).size);
                }
                pool = next;
            }
        }
        self.alloc_free_lock.write_unlock();
    }

    pub fn visit_and_remove_all_pools(&self, mut mem_visitor: impl FnMut(*mut u8, usize)) {
        self.alloc_free_lock.write_lock();
        unsafe {
            let mut pool = *self.mempool_head.get();
            while !pool.is_null() {
                let next = (*pool).next;
                mem_visitor(pool as *mut u8, (*pool).size);
                pool = next;
            }
            *self.mempool_head.get() = null_mut();
            *self.segregated_list.get() = SegregatedList::new();
        }
        self.alloc_free_lock.write_unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock_config::StLockConfig;
    use crate::mem::SIZE_1M;
    use crate::mem_config::MemConfig;
    use crate::mem_stats::MemStats;
    use crate::pool_manager::{PoolManager, PoolSourceKind};
    use crate::pool_map::AllocatorKind;

    struct Fixture {
        manager: Arc<PoolManager>,
        allocator: FreeListAllocator<StLockConfig>,
    }

    impl Fixture {
        fn new() -> Self {
            let manager = PoolManager::new(
                PoolSourceKind::Mmap,
                &MemConfig::new(64 * SIZE_1M, 0, 0, 0),
            );
            let config = AllocConfig::new(Arc::new(MemStats::new()));
            let allocator = FreeListAllocator::<StLockConfig>::new(SpaceType::Object, config);
            let pool = manager.alloc_pool(
                FREELIST_DEFAULT_MEMORY_POOL_SIZE,
                SpaceType::Object,
                AllocatorKind::FreeList,
                std::ptr::null(),
            );
            assert!(!pool.is_null());
            assert!(allocator.add_memory_pool(pool.mem(), pool.size()));
            Self { manager, allocator }
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
    fn alloc_free_restores_free_bytes() {
        let f = Fixture::new();
        let baseline = f.allocator.free_bytes();
        let mut ptrs = Vec::new();
        for size in [300usize, 1000, 2048, 4096, 100 * 1024] {
            let mem = f.allocator.alloc(size, DEFAULT_ALIGNMENT);
            assert!(!mem.is_null());
            unsafe { std::ptr::write_bytes(mem, 0x3c, size) };
            ptrs.push(mem);
        }
        assert!(f.allocator.free_bytes() < baseline);
        assert_eq!(f.allocator.verify_allocator(), 0);
        for mem in ptrs {
            f.allocator.free(mem);
        }
        assert_eq!(f.allocator.free_bytes(), baseline);
        assert_eq!(f.allocator.verify_allocator(), 0);
    }

    #[test]
    fn aligned_allocations() {
        let f = Fixture::new();
        for log in [4u32, 6, 9, 12] {
            let align = Alignment::from_bytes(1 << log);
            let mem = f.allocator.alloc(1024, align);
            assert!(!mem.is_null());
            assert!(is_aligned(mem as usize, 1 << log));
            unsafe { std::ptr::write_bytes(mem, 0x11, 1024) };
            f.allocator.free(mem);
        }
        assert_eq!(f.allocator.verify_allocator(), 0);
    }

    #[test]
    fn no_two_adjacent_free_blocks() {
        let f = Fixture::new();
        let a = f.allocator.alloc(512, DEFAULT_ALIGNMENT);
        let b = f.allocator.alloc(512, DEFAULT_ALIGNMENT);
        let c = f.allocator.alloc(512, DEFAULT_ALIGNMENT);
        assert!(!a.is_null() && !b.is_null() && !c.is_null());
        f.allocator.free(a);
        f.allocator.free(c);
        assert_eq!(f.allocator.verify_allocator(), 0);
        // Freeing the middle block forces a three-way coalesce.
        f.allocator.free(b);
        assert_eq!(f.allocator.verify_allocator(), 0);
    }

    #[test]
    fn oversized_and_zero_requests_fail() {
        let f = Fixture::new();
        assert!(f.allocator.alloc(0, DEFAULT_ALIGNMENT).is_null());
        assert!(f
            .allocator
            .alloc(FREELIST_MAX_ALLOC_SIZE + 1, DEFAULT_ALIGNMENT)
            .is_null());
        assert!(!f.allocator.alloc(FREELIST_MAX_ALLOC_SIZE, DEFAULT_ALIGNMENT).is_null());
    }

    #[test]
    fn exhaustion_returns_null_until_pool_added() {
        let f = Fixture::new();
        let mut count = 0;
        loop {
            let mem = f.allocator.alloc(FREELIST_MAX_ALLOC_SIZE, DEFAULT_ALIGNMENT);
            if mem.is_null() {
                break;
            }
            count += 1;
        }
        assert!(count >= 2);
        let pool = f.manager.alloc_pool(
            FREELIST_DEFAULT_MEMORY_POOL_SIZE,
            SpaceType::Object,
            AllocatorKind::FreeList,
            std::ptr::null(),
        );
        assert!(f.allocator.add_memory_pool(pool.mem(), pool.size()));
        assert!(!f
            .allocator
            .alloc(FREELIST_MAX_ALLOC_SIZE, DEFAULT_ALIGNMENT)
            .is_null());
    }

    #[test]
    fn collect_sweeps_dead_blocks() {
        let f = Fixture::new();
        let keep = f.allocator.alloc(700, DEFAULT_ALIGNMENT);
        let kill = f.allocator.alloc(700, DEFAULT_ALIGNMENT);
        let baseline = f.allocator.free_bytes();
        f.allocator.collect(|obj| {
            if obj as usize == kill as usize {
                ObjectStatus::Dead
            } else {
                ObjectStatus::Alive
            }
        });
        assert!(f.allocator.contain_object(keep as *const ObjectHeader));
        assert!(!f.allocator.contain_object(kill as *const ObjectHeader));
        assert!(f.allocator.free_bytes() > baseline);
    }

    #[test]
    fn iteration_visits_live_objects_in_order() {
        let f = Fixture::new();
        let a = f.allocator.alloc(300, DEFAULT_ALIGNMENT) as usize;
        let b = f.allocator.alloc(300, DEFAULT_ALIGNMENT) as usize;
        let c = f.allocator.alloc(300, DEFAULT_ALIGNMENT) as usize;
        let mut seen = Vec::new();
        f.allocator.iterate_over_objects(|obj| seen.push(obj as usize));
        assert_eq!(seen, vec![a, b, c]);
        let mut ranged = Vec::new();
        f.allocator
            .iterate_over_objects_in_range(|obj| ranged.push(obj as usize), b, c - 1);
        assert_eq!(ranged, vec![b]);
    }
}
