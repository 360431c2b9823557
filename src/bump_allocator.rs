//! Young-generation allocator: one memory pool, objects bumped from the
//! front, TLAB memory carved from the back, unused memory in between.
//!
//! ```text
//! |--------------------------- pool ---------------------------|
//! | allocated objects --> |      free      | <-- TLAB 2 | TLAB 1 |
//! ```
//!
//! The object bump is a CAS loop so mutators missing their TLAB do not
//! serialise on the allocator lock; the lock only guards TLAB bookkeeping,
//! reset and iteration.

use std::cell::UnsafeCell;
use std::ptr::null_mut;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;

use atomic::{Atomic, Ordering};
use crossbeam_utils::CachePadded;
use tracing::debug;

use crate::alloc_config::AllocConfig;
use crate::lock_config::{LockConfig, MtLockConfig, MutexKind};
use crate::mem::{align_up, aligned_object_size, Alignment, ObjectStatus, DEFAULT_ALIGNMENT};
use crate::mem_pool::Pool;
use crate::mem_range::MemRange;
use crate::object_header::ObjectHeader;
use crate::space::SpaceType;
use crate::tlab::TLAB;

struct TlabManager {
    tlabs: Vec<TLAB>,
    cur_tlab_num: usize,
    tlabs_max_count: usize,
}

impl TlabManager {
    fn new(tlabs_max_count: usize) -> Self {
        Self {
            tlabs: (0..tlabs_max_count)
                .map(|_| TLAB::new(null_mut(), 0))
                .collect(),
            cur_tlab_num: 0,
            tlabs_max_count,
        }
    }

    fn get_unused_tlab(&mut self) -> *mut TLAB {
        if self.cur_tlab_num < self.tlabs_max_count {
            let tlab = &mut self.tlabs[self.cur_tlab_num];
            self.cur_tlab_num += 1;
            tlab as *mut TLAB
        } else {
            null_mut()
        }
    }

    fn iterate_over_tlabs(&mut self, mut visitor: impl FnMut(&mut TLAB) -> bool) {
        for tlab in self.tlabs[..self.cur_tlab_num].iter_mut() {
            if !visitor(tlab) {
                return;
            }
        }
    }

    fn reset(&mut self) {
        for tlab in self.tlabs[..self.cur_tlab_num].iter_mut() {
            tlab.reset();
        }
        self.cur_tlab_num = 0;
    }
}

pub struct BumpPointerAllocator<L: LockConfig = MtLockConfig> {
    // Guards the TLAB manager, reset and iteration. The object bump path
    // does not take it.
    allocator_lock: L::AllocMutex,
    pool: Pool,
    start: usize,
    end: usize,
    cursor: CachePadded<Atomic<usize>>,
    tlabs_occupied: AtomicUsize,
    tlab_manager: UnsafeCell<TlabManager>,
    space: SpaceType,
    config: Arc<AllocConfig>,
}

unsafe impl<L: LockConfig> Send for BumpPointerAllocator<L> {}
unsafe impl<L: LockConfig> Sync for BumpPointerAllocator<L> {}

impl<L: LockConfig> BumpPointerAllocator<L> {
    /// Take ownership of `pool` for bump allocation. `tlabs_max_count`
    /// bounds how many TLABs can be handed out before a reset.
    pub fn new(pool: Pool, space: SpaceType, config: Arc<AllocConfig>, tlabs_max_count: usize) -> Self {
        debug_assert!(!pool.is_null());
        debug!(target: "alloc", addr = pool.addr(), size = pool.size(), %space, "bump allocator over pool");
        Self {
            allocator_lock: L::AllocMutex::INIT,
            pool,
            start: pool.addr(),
            end: pool.addr() + pool.size(),
            cursor: CachePadded::new(Atomic::new(pool.addr())),
            tlabs_occupied: AtomicUsize::new(0),
            tlab_manager: UnsafeCell::new(TlabManager::new(tlabs_max_count)),
            space,
            config,
        }
    }

    #[inline]
    pub fn alloc(&self, size: usize, align: Alignment) -> *mut u8 {
        let size = align_up(size, align.in_bytes());
        let mut old;
        let mut aligned;
        loop {
            old = self.cursor.load(Ordering::Relaxed);
            aligned = align_up(old, align.in_bytes());
            let new = aligned + size;
            if new > self.end - self.tlabs_occupied.load(Ordering::Acquire) {
                return null_mut();
            }
            if self
                .cursor
                .compare_exchange_weak(old, new, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
        let mem = aligned as *mut u8;
        self.config.memory_init(mem, size);
        self.config.on_alloc(size, self.space);
        self.config.add_to_crossing_map(aligned, size);
        mem
    }

    /// Carve a TLAB of `size` bytes from the back of the pool. Null when
    /// the TLAB area would collide with bumped objects or all TLAB slots
    /// are taken.
    pub fn create_new_tlab(&self, size: usize) -> *mut TLAB {
        debug_assert!(crate::mem::is_aligned(size, crate::mem::DEFAULT_ALIGNMENT_IN_BYTES));
        self.allocator_lock.lock();
        let occupied = self.tlabs_occupied.load(Ordering::Relaxed) + size;
        let tlab_start = match self.end.checked_sub(occupied) {
            Some(addr) => addr,
            None => {
                self.allocator_lock.unlock();
                return null_mut();
            }
        };
        if tlab_start < self.cursor.load(Ordering::Relaxed) {
            self.allocator_lock.unlock();
            return null_mut();
        }
        let manager = unsafe { &mut *self.tlab_manager.get() };
        let tlab = manager.get_unused_tlab();
        if tlab.is_null() {
            self.allocator_lock.unlock();
            return null_mut();
        }
        self.tlabs_occupied.store(occupied, Ordering::Release);
        unsafe {
            (*tlab).fill(tlab_start as *mut u8, size);
        }
        self.config.on_alloc(size, self.space);
        debug!(target: "alloc", addr = tlab_start, size, "created TLAB");
        self.allocator_lock.unlock();
        tlab
    }

    /// Back to the all-clear state: every object and every TLAB is gone.
    pub fn reset(&self) {
        self.allocator_lock.lock();
        self.cursor.store(self.start, Ordering::SeqCst);
        self.tlabs_occupied.store(0, Ordering::Release);
        unsafe { (*self.tlab_manager.get()).reset() };
        self.allocator_lock.unlock();
    }

    /// The pool must sit directly after the current one.
    pub fn expand_memory(&mut self, mem: *mut u8, size: usize) {
        assert!(mem as usize == self.end);
        self.end += size;
        self.pool = Pool::new(self.pool.size() + size, self.pool.mem());
    }

    pub fn mem_range(&self) -> MemRange {
        MemRange::new(self.start, self.end - 1)
    }

    pub fn iterate_over_objects(&self, mut visitor: impl FnMut(*mut ObjectHeader)) {
        self.allocator_lock.lock();
        self.iterate_bump_area(&mut visitor);
        let manager = unsafe { &mut *self.tlab_manager.get() };
        manager.iterate_over_tlabs(|tlab| {
            tlab.iterate_over_objects(&mut visitor);
            true
        });
        self.allocator_lock.unlock();
    }

    fn iterate_bump_area(&self, visitor: &mut impl FnMut(*mut ObjectHeader)) {
        let mut cur = self.start;
        let end = self.cursor.load(Ordering::Relaxed);
        while cur < end {
            let header = cur as *mut ObjectHeader;
            let size = unsafe { (*header).size() };
            if size == 0 {
                break;
            }
            visitor(header);
            cur += aligned_object_size(size);
        }
    }

    pub fn iterate_over_objects_in_range(
        &self,
        mem_range: &MemRange,
        mut visitor: impl FnMut(*mut ObjectHeader),
    ) {
        if !mem_range.is_intersect(&self.mem_range()) {
            return;
        }
        self.iterate_over_objects(|header| {
            if mem_range.is_address_in_range(header as usize) {
                visitor(header);
            }
        });
    }

    /// Visit dead objects out, move alive ones with the provided visitor.
    /// The TLAB list is walked in hand-out order after the bump area.
    pub fn collect_and_move(
        &self,
        mut death_checker: impl FnMut(*mut ObjectHeader) -> ObjectStatus,
        mut object_move_visitor: impl FnMut(*mut ObjectHeader),
    ) {
        self.allocator_lock.lock();
        self.iterate_bump_area(&mut |header| {
            if death_checker(header) == ObjectStatus::Alive {
                object_move_visitor(header);
            }
        });
        let manager = unsafe { &mut *self.tlab_manager.get() };
        manager.iterate_over_tlabs(|tlab| {
            tlab.collect_and_move(&mut death_checker, &mut object_move_visitor);
            true
        });
        self.allocator_lock.unlock();
    }

    pub fn contain_object(&self, obj: *const ObjectHeader) -> bool {
        let addr = obj as usize;
        if addr >= self.start && addr < self.cursor.load(Ordering::Relaxed) {
            return true;
        }
        self.allocator_lock.lock();
        let manager = unsafe { &mut *self.tlab_manager.get() };
        let mut found = false;
        manager.iterate_over_tlabs(|tlab| {
            if tlab.contain_object(obj) {
                found = true;
                return false;
            }
            true
        });
        self.allocator_lock.unlock();
        found
    }

    pub fn is_live(&self, obj: *const ObjectHeader) -> bool {
        self.contain_object(obj) && unsafe { (*obj).size() != 0 }
    }

    /// Hand the backing pool to the visitor; the allocator keeps nothing.
    pub fn visit_and_remove_all_pools(&mut self, mut mem_visitor: impl FnMut(*mut u8, usize)) {
        if self.pool.is_null() {
            return;
        }
        mem_visitor(self.pool.mem(), self.pool.size());
        self.pool = Pool::NULL;
    }

    /// The single pool is never free while the allocator lives.
    pub fn visit_and_remove_free_pools(&self, _mem_visitor: impl FnMut(*mut u8, usize)) {}

    pub fn pool(&self) -> Pool {
        self.pool
    }
}

pub const BUMP_DEFAULT_ALIGNMENT: Alignment = DEFAULT_ALIGNMENT;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock_config::StLockConfig;
    use crate::mem::{is_aligned, DEFAULT_ALIGNMENT_IN_BYTES, SIZE_1M};
    use crate::mem_config::MemConfig;
    use crate::mem_stats::MemStats;
    use crate::pool_manager::{PoolManager, PoolSourceKind};
    use crate::pool_map::AllocatorKind;

    fn with_allocator(tlabs: usize, f: impl FnOnce(&BumpPointerAllocator<StLockConfig>)) {
        let manager = PoolManager::new(PoolSourceKind::Mmap, &MemConfig::new(4 * SIZE_1M, 0, 0, 0));
        let stats = Arc::new(MemStats::new());
        let config = AllocConfig::new(stats);
        let pool = manager.alloc_pool(
            SIZE_1M,
            SpaceType::Object,
            AllocatorKind::BumpWithTlabs,
            std::ptr::null(),
        );
        let allocator = BumpPointerAllocator::<StLockConfig>::new(pool, SpaceType::Object, config, tlabs);
        f(&allocator);
        manager.free_pool(pool.mem(), pool.size());
    }

    #[test]
    fn bump_and_reset() {
        with_allocator(0, |alloc| {
            let first = alloc.alloc(64, DEFAULT_ALIGNMENT);
            let second = alloc.alloc(64, DEFAULT_ALIGNMENT);
            assert!(!first.is_null() && !second.is_null());
            assert!(second as usize > first as usize);
            assert!(is_aligned(first as usize, DEFAULT_ALIGNMENT_IN_BYTES));
            alloc.reset();
            let again = alloc.alloc(64, DEFAULT_ALIGNMENT);
            assert_eq!(again, first);
        });
    }

    #[test]
    fn pool_exhaustion_returns_null() {
        with_allocator(0, |alloc| {
            assert!(!alloc.alloc(SIZE_1M / 2, DEFAULT_ALIGNMENT).is_null());
            assert!(alloc.alloc(SIZE_1M, DEFAULT_ALIGNMENT).is_null());
        });
    }

    #[test]
    fn tlabs_carved_from_the_back() {
        with_allocator(4, |alloc| {
            let tlab1 = alloc.create_new_tlab(4096);
            let tlab2 = alloc.create_new_tlab(4096);
            assert!(!tlab1.is_null() && !tlab2.is_null());
            unsafe {
                let start1 = (*tlab1).start_addr() as usize;
                let start2 = (*tlab2).start_addr() as usize;
                assert_eq!(start1, alloc.mem_range().end_address() + 1 - 4096);
                assert_eq!(start2, start1 - 4096);
                let mem = (*tlab1).alloc(128);
                assert!(!mem.is_null());
            }
            let obj = alloc.alloc(64, DEFAULT_ALIGNMENT);
            assert!(!obj.is_null());
            assert!((obj as usize) < unsafe { (*tlab2).start_addr() as usize });
        });
    }

    #[test]
    fn tlab_count_limit() {
        with_allocator(2, |alloc| {
            assert!(!alloc.create_new_tlab(4096).is_null());
            assert!(!alloc.create_new_tlab(4096).is_null());
            assert!(alloc.create_new_tlab(4096).is_null());
            alloc.reset();
            assert!(!alloc.create_new_tlab(4096).is_null());
        });
    }

    #[test]
    fn bump_and_tlab_area_collision() {
        with_allocator(512, |alloc| {
            // Fill almost the whole pool from the front.
            assert!(!alloc.alloc(SIZE_1M - 8192, DEFAULT_ALIGNMENT).is_null());
            assert!(!alloc.create_new_tlab(4096).is_null());
            // No room left for a second TLAB.
            assert!(alloc.create_new_tlab(8192).is_null());
        });
    }

    #[test]
    fn iterate_over_allocated_objects() {
        with_allocator(0, |alloc| {
            let sizes = [32usize, 64, 128];
            let mut expected = Vec::new();
            for size in sizes {
                let mem = alloc.alloc(size, DEFAULT_ALIGNMENT) as *mut ObjectHeader;
                unsafe { (*mem).set_size(size) };
                expected.push(mem as usize);
            }
            let mut seen = Vec::new();
            alloc.iterate_over_objects(|header| seen.push(header as usize));
            assert_eq!(seen, expected);
        });
    }
}
