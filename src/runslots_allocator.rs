//! Size-class slab allocator over runs. For every supported slot size the
//! allocator keeps a doubly linked list of partially used runs; totally
//! free runs are parked on a reusable list and re-sliced with whatever
//! slot size is needed next. Pools come from the pool source in
//! [`DEFAULT_ALLOCATOR_POOL_SIZE`] quanta and are managed by a per-pool
//! header written into their first run.

use std::cell::UnsafeCell;
use std::ptr::null_mut;
use std::sync::Arc;

use tracing::debug;

use crate::alloc_config::AllocConfig;
use crate::lock_config::{LockConfig, MtLockConfig, MutexKind, RwLockKind};
use crate::mem::{align_up, Alignment, ObjectStatus, DEFAULT_ALLOCATOR_POOL_SIZE};
use crate::object_header::ObjectHeader;
use crate::runslots::{
    convert_to_power_of_two_unsafe, FreeSlot, RunSlots, RUNSLOTS_ALIGNMENT_MASK, RUNSLOTS_SIZE,
    SLOT_MAX_SIZE, SLOT_MAX_SIZE_POWER,
};
use crate::space::SpaceType;

pub const RUNSLOTS_MIN_POOL_SIZE: usize = DEFAULT_ALLOCATOR_POOL_SIZE;

const SLOTS_SIZES_VARIANTS: usize = SLOT_MAX_SIZE_POWER + 1;
const FREED_BITMAP_BYTES: usize = RUNSLOTS_MIN_POOL_SIZE / RUNSLOTS_SIZE / 8;

type Run<L> = RunSlots<<L as LockConfig>::AllocMutex>;

/// Doubly linked list of runs sharing one slot size.
struct RunSlotsList<L: LockConfig> {
    head: *mut Run<L>,
    tail: *mut Run<L>,
    lock: L::AllocMutex,
}

impl<L: LockConfig> RunSlotsList<L> {
    const fn new() -> Self {
        Self {
            head: null_mut(),
            tail: null_mut(),
            lock: <L::AllocMutex as MutexKind>::INIT,
        }
    }

    fn lock(&self) {
        self.lock.lock();
    }

    fn unlock(&self) {
        self.lock.unlock();
    }

    fn head(&self) -> *mut Run<L> {
        self.head
    }

    fn push_to_tail(&mut self, run: *mut Run<L>) {
        unsafe {
            debug_assert!((*run).next_runslots().is_null() && (*run).prev_runslots().is_null());
            if self.tail.is_null() {
                self.head = run;
                self.tail = run;
                return;
            }
            (*self.tail).set_next_runslots(run);
            (*run).set_prev_runslots(self.tail);
            self.tail = run;
        }
    }

    fn pop_from_head(&mut self) -> *mut Run<L> {
        let run = self.head;
        if run.is_null() {
            return null_mut();
        }
        self.pop_from_list(run);
        run
    }

    fn pop_from_list(&mut self, run: *mut Run<L>) {
        unsafe {
            let next = (*run).next_runslots();
            let prev = (*run).prev_runslots();
            if run == self.head {
                self.head = next;
            }
            if run == self.tail {
                self.tail = prev;
            }
            if !prev.is_null() {
                (*prev).set_next_runslots(next);
            }
            if !next.is_null() {
                (*next).set_prev_runslots(prev);
            }
            (*run).set_next_runslots(null_mut());
            (*run).set_prev_runslots(null_mut());
        }
    }

    fn is_in_this_list(&self, run: *mut Run<L>) -> bool {
        let mut cur = self.head;
        while !cur.is_null() {
            if cur == run {
                return true;
            }
            cur = unsafe { (*cur).next_runslots() };
        }
        false
    }
}

/// Per-pool header written into the pool's first run-sized block: a bump
/// cursor over untouched runs plus a bitmap of runs returned whole.
#[repr(C)]
struct PoolListElement {
    pool_mem: usize,
    start_mem: usize,
    free_ptr: usize,
    size: usize,
    next_pool: *mut PoolListElement,
    prev_pool: *mut PoolListElement,
    freed_runslots_count: usize,
    freed_bitmap: [u8; FREED_BITMAP_BYTES],
}

const _: () = assert!(core::mem::size_of::<PoolListElement>() <= RUNSLOTS_SIZE);

impl PoolListElement {
    unsafe fn create(mem: *mut u8, size: usize, next: *mut PoolListElement) -> *mut PoolListElement {
        let header = mem as *mut PoolListElement;
        let start = align_up(mem as usize + core::mem::size_of::<PoolListElement>(), RUNSLOTS_SIZE);
        debug_assert!(start < mem as usize + size);
        header.write(PoolListElement {
            pool_mem: mem as usize,
            start_mem: start,
            free_ptr: start,
            size,
            next_pool: next,
            prev_pool: null_mut(),
            freed_runslots_count: 0,
            freed_bitmap: [0; FREED_BITMAP_BYTES],
        });
        header
    }

    fn run_index(&self, run_addr: usize) -> (usize, u8) {
        debug_assert!(run_addr >= self.start_mem);
        let index = (run_addr - self.start_mem) / RUNSLOTS_SIZE;
        (index / 8, 1u8 << (index % 8))
    }

    fn is_freed_run(&self, run_addr: usize) -> bool {
        let (byte, mask) = self.run_index(run_addr);
        self.freed_bitmap[byte] & mask != 0
    }

    fn mark_run_freed(&mut self, run_addr: usize) {
        let (byte, mask) = self.run_index(run_addr);
        debug_assert!(self.freed_bitmap[byte] & mask == 0);
        self.freed_bitmap[byte] |= mask;
        self.freed_runslots_count += 1;
    }

    fn take_freed_run(&mut self) -> usize {
        if self.freed_runslots_count == 0 {
            return 0;
        }
        for (byte_index, byte) in self.freed_bitmap.iter_mut().enumerate() {
            if *byte != 0 {
                let bit = byte.trailing_zeros() as usize;
                *byte &= !(1 << bit);
                self.freed_runslots_count -= 1;
                return self.start_mem + (byte_index * 8 + bit) * RUNSLOTS_SIZE;
            }
        }
        unreachable!("freed-run count out of sync with the bitmap");
    }

    fn take_uninitialized_run(&mut self) -> usize {
        if self.free_ptr + RUNSLOTS_SIZE > self.pool_mem + self.size {
            return 0;
        }
        let run = self.free_ptr;
        self.free_ptr += RUNSLOTS_SIZE;
        run
    }

    fn handed_out_runs(&self) -> usize {
        (self.free_ptr - self.start_mem) / RUNSLOTS_SIZE
    }

    fn has_used_memory(&self) -> bool {
        self.handed_out_runs() != self.freed_runslots_count
    }

    fn in_pool(&self, addr: usize) -> bool {
        addr >= self.pool_mem && addr < self.pool_mem + self.size
    }

    fn in_used_memory(&self, addr: usize) -> bool {
        if addr < self.start_mem || addr >= self.free_ptr {
            return false;
        }
        let run_addr = addr & !RUNSLOTS_ALIGNMENT_MASK;
        !self.is_freed_run(run_addr)
    }
}

struct MemPoolManager {
    head: *mut PoolListElement,
}

impl MemPoolManager {
    fn add_new_memory_pool(&mut self, mem: *mut u8, size: usize) -> bool {
        if size > RUNSLOTS_MIN_POOL_SIZE {
            // The freed-runs bitmap covers exactly one pool quantum.
            return false;
        }
        unsafe {
            let header = PoolListElement::create(mem, size, self.head);
            if !self.head.is_null() {
                (*self.head).prev_pool = header;
            }
            self.head = header;
        }
        true
    }

    fn get_new_run_memory(&mut self) -> usize {
        let mut pool = self.head;
        while !pool.is_null() {
            unsafe {
                let run = (*pool).take_freed_run();
                if run != 0 {
                    return run;
                }
                let run = (*pool).take_uninitialized_run();
                if run != 0 {
                    return run;
                }
                pool = (*pool).next_pool;
            }
        }
        0
    }

    fn find_pool(&self, addr: usize) -> *mut PoolListElement {
        let mut pool = self.head;
        while !pool.is_null() {
            unsafe {
                if (*pool).in_pool(addr) {
                    return pool;
                }
                pool = (*pool).next_pool;
            }
        }
        null_mut()
    }

    fn iterate_live_runs<L: LockConfig>(&self, mut visitor: impl FnMut(*mut Run<L>)) {
        let mut pool = self.head;
        while !pool.is_null() {
            unsafe {
                let mut run_addr = (*pool).start_mem;
                while run_addr < (*pool).free_ptr {
                    if !(*pool).is_freed_run(run_addr) {
                        visitor(run_addr as *mut Run<L>);
                    }
                    run_addr += RUNSLOTS_SIZE;
                }
                pool = (*pool).next_pool;
            }
        }
    }
}

pub struct RunSlotsAllocator<L: LockConfig = MtLockConfig> {
    runslots: [UnsafeCell<RunSlotsList<L>>; SLOTS_SIZES_VARIANTS],
    // Totally free runs kept for reuse with any slot size.
    free_runslots: UnsafeCell<RunSlotsList<L>>,
    memory_pool: UnsafeCell<MemPoolManager>,
    pool_lock: L::AllocRwLock,
    space: SpaceType,
    config: Arc<AllocConfig>,
}

unsafe impl<L: LockConfig> Send for RunSlotsAllocator<L> {}
unsafe impl<L: LockConfig> Sync for RunSlotsAllocator<L> {}

impl<L: LockConfig> RunSlotsAllocator<L> {
    pub fn new(space: SpaceType, config: Arc<AllocConfig>) -> Self {
        Self {
            runslots: [(); SLOTS_SIZES_VARIANTS].map(|_| UnsafeCell::new(RunSlotsList::new())),
            free_runslots: UnsafeCell::new(RunSlotsList::new()),
            memory_pool: UnsafeCell::new(MemPoolManager { head: null_mut() }),
            pool_lock: <L::AllocRwLock as RwLockKind>::INIT,
            space,
            config,
        }
    }

    pub const fn max_alloc_size() -> usize {
        SLOT_MAX_SIZE
    }

    pub const fn min_pool_size() -> usize {
        RUNSLOTS_MIN_POOL_SIZE
    }

    /// `mem` must be page aligned and sized in run multiples.
    pub fn add_memory_pool(&self, mem: *mut u8, size: usize) -> bool {
        debug_assert!(mem as usize & RUNSLOTS_ALIGNMENT_MASK == 0);
        self.pool_lock.write_lock();
        let added = unsafe { (*self.memory_pool.get()).add_new_memory_pool(mem, size) };
        self.pool_lock.write_unlock();
        if added {
            debug!(target: "alloc", addr = mem as usize, size, space = %self.space, "runslots pool added");
        }
        added
    }

    pub fn alloc(&self, size: usize, align: Alignment) -> *mut u8 {
        if size == 0 {
            return null_mut();
        }
        let needed = align_up(size, align.in_bytes());
        if needed > SLOT_MAX_SIZE {
            return null_mut();
        }
        let power = convert_to_power_of_two_unsafe(needed);
        let slot_size = 1usize << power;
        unsafe { &*self.runslots[power].get() }.lock();
        let list = unsafe { &mut *self.runslots[power].get() };
        let mut run = list.head();
        if run.is_null() {
            run = self.take_fresh_run(slot_size);
            if run.is_null() {
                list.unlock();
                return null_mut();
            }
            list.push_to_tail(run);
        }
        let slot;
        unsafe {
            (*run).lock();
            slot = (*run).pop_free_slot();
            debug_assert!(!slot.is_null());
            if (*run).is_full() {
                list.pop_from_list(run);
            }
            (*run).unlock();
        }
        list.unlock();
        let mem = slot as *mut u8;
        self.config.memory_init(mem, slot_size);
        self.config.on_alloc(slot_size, self.space);
        self.config.add_to_crossing_map(mem as usize, needed);
        mem
    }

    /// A reused free run re-initialised for `slot_size`, or a new run from
    /// the pools.
    fn take_fresh_run(&self, slot_size: usize) -> *mut Run<L> {
        unsafe { &*self.free_runslots.get() }.lock();
        let free_list = unsafe { &mut *self.free_runslots.get() };
        let reused = free_list.pop_from_head();
        free_list.unlock();
        if !reused.is_null() {
            let pool_pointer = unsafe { (*reused).pool_pointer() };
            unsafe { Run::<L>::initialize(reused, slot_size, pool_pointer) };
            return reused;
        }
        self.pool_lock.write_lock();
        let manager = unsafe { &mut *self.memory_pool.get() };
        let run_addr = manager.get_new_run_memory();
        let pool = if run_addr != 0 {
            manager.find_pool(run_addr)
        } else {
            null_mut()
        };
        self.pool_lock.write_unlock();
        if run_addr == 0 {
            return null_mut();
        }
        debug_assert!(!pool.is_null());
        let run = run_addr as *mut Run<L>;
        unsafe { Run::<L>::initialize(run, slot_size, pool as usize) };
        run
    }

    pub fn free(&self, mem: *mut u8) {
        self.free_internal(mem);
    }

    fn free_internal(&self, mem: *mut u8) {
        let run = (mem as usize & !RUNSLOTS_ALIGNMENT_MASK) as *mut Run<L>;
        self.pool_lock.read_lock();
        let owned = unsafe {
            let pool = (*self.memory_pool.get()).find_pool(mem as usize);
            !pool.is_null() && (*pool).in_used_memory(mem as usize)
        };
        self.pool_lock.read_unlock();
        assert!(owned, "free of a pointer the runslots allocator does not own");

        // Stable while the slot being freed keeps the run alive.
        let slot_size = unsafe { (*run).slot_size() };
        let power = convert_to_power_of_two_unsafe(slot_size);
        unsafe { &*self.runslots[power].get() }.lock();
        let list = unsafe { &mut *self.runslots[power].get() };
        unsafe {
            (*run).lock();
            let (next_obj, prev_obj) = self.slot_neighbours(run, mem as usize);
            let was_full = (*run).is_full();
            (*run).push_free_slot(mem as *mut FreeSlot);
            let now_empty = (*run).is_empty();
            if was_full {
                debug_assert!(!list.is_in_this_list(run));
                list.push_to_tail(run);
            }
            if now_empty {
                list.pop_from_list(run);
                (*self.free_runslots.get()).lock();
                let free_list = &mut *self.free_runslots.get();
                free_list.push_to_tail(run);
                free_list.unlock();
            }
            (*run).unlock();
            self.config.remove_from_crossing_map(
                mem as usize,
                slot_size,
                next_obj,
                prev_obj.map(|addr| (addr, slot_size)),
            );
        }
        list.unlock();
        self.config.on_free(slot_size, self.space);
    }

    /// Nearest occupied slots around `addr` inside one run. A run never
    /// outgrows its page, so these are exactly the crossing-map
    /// neighbours that matter.
    fn slot_neighbours(&self, run: *mut Run<L>, addr: usize) -> (Option<usize>, Option<usize>) {
        let mut next = None;
        let mut prev = None;
        unsafe {
            (*run).iterate_over_occupied_slots(|obj| {
                let obj = obj as usize;
                if obj < addr {
                    prev = Some(obj);
                } else if obj > addr && next.is_none() {
                    next = Some(obj);
                }
            });
        }
        (next, prev)
    }

    /// Sweep: free every occupied slot whose object the checker pronounces
    /// dead.
    pub fn collect(&self, mut death_checker: impl FnMut(*mut ObjectHeader) -> ObjectStatus) {
        let mut dead = Vec::new();
        self.iterate_over_objects(|obj| {
            if death_checker(obj) == ObjectStatus::Dead {
                dead.push(obj as *mut u8);
            }
        });
        for mem in dead {
            self.free_internal(mem);
        }
    }

    pub fn iterate_over_objects(&self, mut visitor: impl FnMut(*mut ObjectHeader)) {
        self.pool_lock.read_lock();
        let manager = unsafe { &*self.memory_pool.get() };
        manager.iterate_live_runs::<L>(|run| unsafe {
            (*run).lock();
            (*run).iterate_over_occupied_slots(&mut visitor);
            (*run).unlock();
        });
        self.pool_lock.read_unlock();
    }

    pub fn iterate_over_objects_in_range(
        &self,
        mut visitor: impl FnMut(*mut ObjectHeader),
        left_border: usize,
        right_border: usize,
    ) {
        self.pool_lock.read_lock();
        let manager = unsafe { &*self.memory_pool.get() };
        manager.iterate_live_runs::<L>(|run| {
            let run_addr = run as usize;
            if run_addr + RUNSLOTS_SIZE <= left_border || run_addr > right_border {
                return;
            }
            unsafe {
                (*run).lock();
                (*run).iterate_over_occupied_slots(|obj| {
                    let addr = obj as usize;
                    if addr >= left_border && addr <= right_border {
                        visitor(obj);
                    }
                });
                (*run).unlock();
            }
        });
        self.pool_lock.read_unlock();
    }

    pub fn contain_object(&self, obj: *const ObjectHeader) -> bool {
        self.pool_lock.read_lock();
        let manager = unsafe { &*self.memory_pool.get() };
        let pool = manager.find_pool(obj as usize);
        let contained = !pool.is_null() && unsafe { (*pool).in_used_memory(obj as usize) };
        self.pool_lock.read_unlock();
        contained
    }

    pub fn is_live(&self, obj: *const ObjectHeader) -> bool {
        if !self.contain_object(obj) {
            return false;
        }
        let run = (obj as usize & !RUNSLOTS_ALIGNMENT_MASK) as *mut Run<L>;
        unsafe {
            (*run).lock();
            let live = (*run).is_live(obj);
            (*run).unlock();
            live
        }
    }

    /// Run self-checks over every live run; returns the failure count.
    pub fn verify_allocator(&self) -> usize {
        let mut fail_count = 0;
        self.pool_lock.read_lock();
        let manager = unsafe { &*self.memory_pool.get() };
        manager.iterate_live_runs::<L>(|run| unsafe {
            (*run).lock();
            fail_count += (*run).verify_run();
            (*run).unlock();
        });
        self.pool_lock.read_unlock();
        fail_count
    }

    /// Park reusable runs back into their pools, then hand fully unused
    /// pools to the visitor and drop them from the allocator.
    pub fn visit_and_remove_free_pools(&self, mut mem_visitor: impl FnMut(*mut u8, usize)) {
        self.pool_lock.write_lock();
        let manager = unsafe { &mut *self.memory_pool.get() };
        // Every run on the reusable list goes back to its pool's bitmap.
        let free_list = unsafe { &mut *self.free_runslots.get() };
        free_list.lock();
        loop {
            let run = free_list.pop_from_head();
            if run.is_null() {
                break;
            }
            unsafe {
                let pool = (*run).pool_pointer() as *mut PoolListElement;
                (*pool).mark_run_freed(run as usize);
            }
        }
        free_list.unlock();

        let mut pool = manager.head;
        while !pool.is_null() {
            unsafe {
                let next = (*pool).next_pool;
                if !(*pool).has_used_memory() {
                    let prev = (*pool).prev_pool;
                    if !prev.is_null() {
                        (*prev).next_pool = next;
                    } else {
                        manager.head = next;
                    }
                    if !next.is_null() {
                        (*next).prev_pool = prev;
                    }
                    mem_visitor((*pool).pool_mem as *mut u8, (*pool).size);
                }
                pool = next;
            }
        }
        self.pool_lock.write_unlock();
    }

    /// Visit every pool without touching ownership.
    pub fn visit_all_pools(&self, mut mem_visitor: impl FnMut(*mut u8, usize)) {
        self.pool_lock.read_lock();
        let manager = unsafe { &*self.memory_pool.get() };
        let mut pool = manager.head;
        while !pool.is_null() {
            unsafe {
                mem_visitor((*pool).pool_mem as *mut u8, (*pool).size);
                pool = (*pool).next_pool;
            }
        }
        self.pool_lock.read_unlock();
    }

    /// Hand every pool to the visitor and forget them all. Destruction
    /// only; the allocator is unusable afterwards.
    pub fn visit_and_remove_all_pools(&self, mut mem_visitor: impl FnMut(*mut u8, usize)) {
        self.pool_lock.write_lock();
        let manager = unsafe { &mut *self.memory_pool.get() };
        let mut pool = manager.head;
        while !pool.is_null() {
            unsafe {
                let next = (*pool).next_pool;
                mem_visitor((*pool).pool_mem as *mut u8, (*pool).size);
                pool = next;
            }
        }
        manager.head = null_mut();
        self.pool_lock.write_unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock_config::StLockConfig;
    use crate::mem::{is_aligned, DEFAULT_ALIGNMENT, SIZE_1M};
    use crate::mem_config::MemConfig;
    use crate::mem_stats::MemStats;
    use crate::pool_manager::{PoolManager, PoolSourceKind};
    use crate::pool_map::AllocatorKind;

    struct Fixture {
        manager: Arc<PoolManager>,
        allocator: RunSlotsAllocator<StLockConfig>,
    }

    impl Fixture {
        fn new() -> Self {
            let manager = PoolManager::new(
                PoolSourceKind::Mmap,
                &MemConfig::new(64 * SIZE_1M, 0, 0, 0),
            );
            let config = AllocConfig::new(Arc::new(MemStats::new()));
            let allocator = RunSlotsAllocator::<StLockConfig>::new(SpaceType::Object, config);
            let pool = manager.alloc_pool(
                RUNSLOTS_MIN_POOL_SIZE,
                SpaceType::Object,
                AllocatorKind::RunSlots,
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
    fn alloc_free_round_trip() {
        let f = Fixture::new();
        let mem = f.allocator.alloc(64, DEFAULT_ALIGNMENT);
        assert!(!mem.is_null());
        assert!(is_aligned(mem as usize, 64));
        assert!(f.allocator.contain_object(mem as *const ObjectHeader));
        assert!(f.allocator.is_live(mem as *const ObjectHeader));
        f.allocator.free(mem);
        assert!(!f.allocator.is_live(mem as *const ObjectHeader));
    }

    #[test]
    fn oversized_request_is_rejected() {
        let f = Fixture::new();
        assert!(f.allocator.alloc(SLOT_MAX_SIZE + 1, DEFAULT_ALIGNMENT).is_null());
        assert!(f.allocator.alloc(0, DEFAULT_ALIGNMENT).is_null());
        assert!(!f.allocator.alloc(SLOT_MAX_SIZE, DEFAULT_ALIGNMENT).is_null());
    }

    #[test]
    fn full_run_starts_a_new_one() {
        let f = Fixture::new();
        let header = align_up(
            core::mem::size_of::<RunSlots<crate::lock_config::DummyLock>>(),
            crate::runslots::SLOT_MIN_SIZE,
        );
        let slots_per_run = (RUNSLOTS_SIZE - header) / crate::runslots::SLOT_MIN_SIZE;
        let mut first_run_slots = Vec::new();
        for _ in 0..slots_per_run {
            let mem = f.allocator.alloc(8, DEFAULT_ALIGNMENT);
            assert!(!mem.is_null());
            first_run_slots.push(mem as usize);
        }
        let run_of = |addr: usize| addr & !RUNSLOTS_ALIGNMENT_MASK;
        let first_run = run_of(first_run_slots[0]);
        assert!(first_run_slots.iter().all(|&addr| run_of(addr) == first_run));
        // One more than a full page triggers a second run.
        let overflow = f.allocator.alloc(8, DEFAULT_ALIGNMENT);
        assert!(!overflow.is_null());
        assert_ne!(run_of(overflow as usize), first_run);
    }

    #[test]
    fn slot_sizes_share_pools() {
        let f = Fixture::new();
        let mut ptrs = Vec::new();
        for size in [8usize, 16, 24, 48, 100, 200, 256] {
            let mem = f.allocator.alloc(size, DEFAULT_ALIGNMENT);
            assert!(!mem.is_null());
            unsafe { std::ptr::write_bytes(mem, 0x7f, size) };
            ptrs.push(mem);
        }
        assert_eq!(f.allocator.verify_allocator(), 0);
        for mem in ptrs {
            f.allocator.free(mem);
        }
        assert_eq!(f.allocator.verify_allocator(), 0);
    }

    #[test]
    fn collect_frees_dead_objects() {
        let f = Fixture::new();
        let keep = f.allocator.alloc(32, DEFAULT_ALIGNMENT);
        let kill = f.allocator.alloc(32, DEFAULT_ALIGNMENT);
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

    #[test]
    fn emptied_runs_are_reused_for_other_sizes() {
        let f = Fixture::new();
        let mem = f.allocator.alloc(8, DEFAULT_ALIGNMENT);
        let run = mem as usize & !RUNSLOTS_ALIGNMENT_MASK;
        f.allocator.free(mem);
        // The emptied run must service the next request of a different
        // slot size.
        let mem = f.allocator.alloc(256, DEFAULT_ALIGNMENT);
        assert_eq!(mem as usize & !RUNSLOTS_ALIGNMENT_MASK, run);
        f.allocator.free(mem);
    }

    #[test]
    fn free_pools_are_returned() {
        let f = Fixture::new();
        let mem = f.allocator.alloc(128, DEFAULT_ALIGNMENT);
        let mut freed = Vec::new();
        f.allocator.visit_and_remove_free_pools(|mem, size| freed.push((mem as usize, size)));
        assert!(freed.is_empty());
        f.allocator.free(mem);
        f.allocator.visit_and_remove_free_pools(|mem, size| freed.push((mem as usize, size)));
        assert_eq!(freed.len(), 1);
        let (mem, size) = freed[0];
        f.manager.free_pool(mem as *mut u8, size);
    }

    #[test]
    fn range_iteration_respects_borders() {
        let f = Fixture::new();
        let a = f.allocator.alloc(64, DEFAULT_ALIGNMENT) as usize;
        let b = f.allocator.alloc(64, DEFAULT_ALIGNMENT) as usize;
        let c = f.allocator.alloc(64, DEFAULT_ALIGNMENT) as usize;
        let mut seen = Vec::new();
        f.allocator
            .iterate_over_objects_in_range(|obj| seen.push(obj as usize), b, b + 63);
        assert_eq!(seen, vec![b]);
        seen.clear();
        f.allocator
            .iterate_over_objects_in_range(|obj| seen.push(obj as usize), a, c);
        assert_eq!(seen, vec![a, b, c]);
    }
}
