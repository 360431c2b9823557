//! Allocator for objects that must survive a runtime fork read-only. Three
//! states: before the fork it serves small non-movable allocations from an
//! embedded runslots allocator; while forking it copies objects into
//! arenas stacked on the same space; after the fork it is frozen and
//! rejects everything. Liveness after the freeze comes from per-pool mark
//! bitmaps snapshotted at the state switch.

use std::ptr::null_mut;
use std::sync::Arc;

use tracing::debug;

use crate::alloc_config::AllocConfig;
use crate::arena::{Arena, ARENA_DEFAULT_ALIGNMENT};
use crate::lock_config::{LockConfig, MtLockConfig};
use crate::mem::{align_up, Alignment, ObjectStatus, DEFAULT_ARENA_SIZE};
use crate::bitmap::MemBitmap;
use crate::object_header::ObjectHeader;
use crate::pool_manager::PoolManager;
use crate::pool_map::AllocatorKind;
use crate::runslots_allocator::RunSlotsAllocator;
use crate::space::SpaceType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PygoteSpaceState {
    /// Before the fork: small non-movable objects via runslots.
    Init,
    /// At the first fork: copied objects land in arenas.
    Forking,
    /// After the fork: read-only, no allocation, no real free.
    Forked,
}

pub struct PygoteSpaceAllocator<L: LockConfig = MtLockConfig> {
    runslots: RunSlotsAllocator<L>,
    arena: *mut Arena,
    state: PygoteSpaceState,
    live_bitmaps: Vec<MemBitmap>,
    pool_manager: Arc<PoolManager>,
    config: Arc<AllocConfig>,
}

unsafe impl<L: LockConfig> Send for PygoteSpaceAllocator<L> {}

impl<L: LockConfig> PygoteSpaceAllocator<L> {
    pub fn new(pool_manager: Arc<PoolManager>, config: Arc<AllocConfig>) -> Self {
        Self {
            runslots: RunSlotsAllocator::new(SpaceType::Object, config.clone()),
            arena: null_mut(),
            state: PygoteSpaceState::Init,
            live_bitmaps: Vec::new(),
            pool_manager,
            config,
        }
    }

    pub fn state(&self) -> PygoteSpaceState {
        self.state
    }

    pub const fn max_alloc_size() -> usize {
        RunSlotsAllocator::<L>::max_alloc_size()
    }

    pub fn can_alloc_non_movable(&self, size: usize, align: Alignment) -> bool {
        self.state == PygoteSpaceState::Init
            && align_up(size, align.in_bytes()) <= Self::max_alloc_size()
    }

    /// Forward transitions only: Init -> Forking -> Forked. Entering
    /// `Forking` snapshots the liveness of everything allocated so far.
    pub fn set_state(&mut self, new_state: PygoteSpaceState) {
        debug_assert!(new_state != PygoteSpaceState::Init);
        debug_assert!(self.state != PygoteSpaceState::Forked);
        if self.state == PygoteSpaceState::Init && new_state == PygoteSpaceState::Forking {
            self.snapshot_live_bitmaps();
        }
        debug!(target: "alloc", ?new_state, "pygote space state switch");
        self.state = new_state;
    }

    fn snapshot_live_bitmaps(&mut self) {
        let mut pools = Vec::new();
        self.runslots.visit_all_pools(|mem, size| {
            pools.push((mem as usize, size));
        });
        for (mem, size) in pools {
            let bitmap = MemBitmap::new(mem, size);
            self.runslots.iterate_over_objects_in_range(
                |obj| bitmap.set(obj as usize),
                mem,
                mem + size - 1,
            );
            self.live_bitmaps.push(bitmap);
        }
    }

    pub fn alloc(&mut self, size: usize, align: Alignment) -> *mut u8 {
        match self.state {
            PygoteSpaceState::Init => {
                let mem = self.runslots.alloc(size, align);
                if !mem.is_null() {
                    return mem;
                }
                let pool = self.pool_manager.alloc_pool(
                    RunSlotsAllocator::<L>::min_pool_size(),
                    SpaceType::Object,
                    AllocatorKind::RunSlots,
                    &self.runslots as *const _ as *const (),
                );
                if pool.is_null() || !self.runslots.add_memory_pool(pool.mem(), pool.size()) {
                    return null_mut();
                }
                self.config
                    .init_crossing_map_for_memory(pool.addr(), pool.size());
                self.runslots.alloc(size, align)
            }
            PygoteSpaceState::Forking => self.arena_alloc(size, align),
            PygoteSpaceState::Forked => null_mut(),
        }
    }

    /// Copied objects of any size land here during the fork.
    fn arena_alloc(&mut self, size: usize, align: Alignment) -> *mut u8 {
        unsafe {
            if !self.arena.is_null() {
                let mem = (*self.arena).alloc(size, align);
                if !mem.is_null() {
                    self.mark_forking_object(mem as usize);
                    return mem;
                }
            }
            let arena_size = align_up(
                (size + core::mem::size_of::<Arena>()).max(DEFAULT_ARENA_SIZE),
                crate::mem::POOL_ALIGNMENT_IN_BYTES,
            );
            let new_arena = self.pool_manager.alloc_arena(
                arena_size,
                SpaceType::Object,
                AllocatorKind::Arena,
                self as *const Self as *const (),
                ARENA_DEFAULT_ALIGNMENT,
            );
            if new_arena.is_null() {
                return null_mut();
            }
            (*new_arena).link_to(self.arena);
            self.arena = new_arena;
            self.live_bitmaps
                .push(MemBitmap::new((*new_arena).mem() as usize, (*new_arena).size()));
            let mem = (*new_arena).alloc(size, align);
            if !mem.is_null() {
                self.mark_forking_object(mem as usize);
            }
            mem
        }
    }

    fn mark_forking_object(&mut self, addr: usize) {
        for bitmap in &self.live_bitmaps {
            if bitmap.covers(addr) {
                bitmap.set(addr);
                return;
            }
        }
    }

    pub fn free(&mut self, mem: *mut u8) {
        match self.state {
            PygoteSpaceState::Init => self.runslots.free(mem),
            // The space is read-only; a GC can only mark the slot dead.
            _ => {
                for bitmap in &self.live_bitmaps {
                    if bitmap.covers(mem as usize) {
                        bitmap.clear(mem as usize);
                        return;
                    }
                }
            }
        }
    }

    pub fn contain_object(&self, obj: *const ObjectHeader) -> bool {
        if self.runslots.contain_object(obj) {
            return true;
        }
        let mut cur = self.arena;
        while !cur.is_null() {
            unsafe {
                if (*cur).in_arena(obj as *const u8) {
                    return true;
                }
                cur = (*cur).next_arena();
            }
        }
        false
    }

    pub fn is_live(&self, obj: *const ObjectHeader) -> bool {
        match self.state {
            PygoteSpaceState::Init => self.runslots.is_live(obj),
            _ => {
                let addr = obj as usize;
                self.live_bitmaps
                    .iter()
                    .any(|bitmap| bitmap.covers(addr) && bitmap.test(addr))
            }
        }
    }

    pub fn iterate_over_objects(&self, mut visitor: impl FnMut(*mut ObjectHeader)) {
        match self.state {
            PygoteSpaceState::Init => self.runslots.iterate_over_objects(visitor),
            _ => {
                for bitmap in &self.live_bitmaps {
                    bitmap.iterate_over_marked(|addr| visitor(addr as *mut ObjectHeader));
                }
            }
        }
    }

    pub fn iterate_over_objects_in_range(
        &self,
        mut visitor: impl FnMut(*mut ObjectHeader),
        left_border: usize,
        right_border: usize,
    ) {
        match self.state {
            PygoteSpaceState::Init => {
                self.runslots
                    .iterate_over_objects_in_range(visitor, left_border, right_border)
            }
            _ => {
                for bitmap in &self.live_bitmaps {
                    bitmap.iterate_over_marked(|addr| {
                        if addr >= left_border && addr <= right_border {
                            visitor(addr as *mut ObjectHeader);
                        }
                    });
                }
            }
        }
    }

    pub fn collect(&mut self, mut gc_visitor: impl FnMut(*mut ObjectHeader) -> ObjectStatus) {
        match self.state {
            PygoteSpaceState::Init => self.runslots.collect(gc_visitor),
            _ => {
                // Frozen space: dead objects only lose their mark bit.
                let mut dead = Vec::new();
                self.iterate_over_objects(|obj| {
                    if gc_visitor(obj) == ObjectStatus::Dead {
                        dead.push(obj as *mut u8);
                    }
                });
                for mem in dead {
                    self.free(mem);
                }
            }
        }
    }

    pub fn live_bitmaps(&self) -> &[MemBitmap] {
        &self.live_bitmaps
    }

    pub fn visit_and_remove_all_pools(&mut self, mut mem_visitor: impl FnMut(*mut u8, usize)) {
        self.runslots.visit_and_remove_all_pools(&mut mem_visitor);
        while !self.arena.is_null() {
            let next = unsafe { (*self.arena).next_arena() };
            self.pool_manager.free_arena(self.arena);
            self.arena = next;
        }
        self.live_bitmaps.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock_config::StLockConfig;
    use crate::mem::{DEFAULT_ALIGNMENT, SIZE_1M};
    use crate::mem_config::MemConfig;
    use crate::mem_stats::MemStats;
    use crate::pool_manager::PoolSourceKind;

    struct Fixture {
        manager: Arc<PoolManager>,
        allocator: PygoteSpaceAllocator<StLockConfig>,
    }

    impl Fixture {
        fn new() -> Self {
            let manager = PoolManager::new(
                PoolSourceKind::Mmap,
                &MemConfig::new(64 * SIZE_1M, 0, 0, 0),
            );
            let config = AllocConfig::new(Arc::new(MemStats::new()));
            let allocator = PygoteSpaceAllocator::<StLockConfig>::new(manager.clone(), config);
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
    fn init_state_serves_small_objects() {
        let mut f = Fixture::new();
        assert_eq!(f.allocator.state(), PygoteSpaceState::Init);
        assert!(f.allocator.can_alloc_non_movable(64, DEFAULT_ALIGNMENT));
        assert!(!f.allocator.can_alloc_non_movable(1024, DEFAULT_ALIGNMENT));
        let mem = f.allocator.alloc(64, DEFAULT_ALIGNMENT);
        assert!(!mem.is_null());
        assert!(f.allocator.contain_object(mem as *const ObjectHeader));
        assert!(f.allocator.is_live(mem as *const ObjectHeader));
        f.allocator.free(mem);
        assert!(!f.allocator.is_live(mem as *const ObjectHeader));
    }

    #[test]
    fn forking_allocates_from_arena_and_marks_bitmap() {
        let mut f = Fixture::new();
        let survivor = f.allocator.alloc(32, DEFAULT_ALIGNMENT);
        assert!(!survivor.is_null());
        f.allocator.set_state(PygoteSpaceState::Forking);
        // The pre-fork object is snapshotted as live.
        assert!(f.allocator.is_live(survivor as *const ObjectHeader));
        // Copied objects can exceed the runslots limit now.
        let copied = f.allocator.alloc(16 * 1024, DEFAULT_ALIGNMENT);
        assert!(!copied.is_null());
        assert!(f.allocator.is_live(copied as *const ObjectHeader));
        assert!(f.allocator.contain_object(copied as *const ObjectHeader));
    }

    #[test]
    fn forked_state_rejects_allocation() {
        let mut f = Fixture::new();
        let survivor = f.allocator.alloc(32, DEFAULT_ALIGNMENT);
        f.allocator.set_state(PygoteSpaceState::Forking);
        f.allocator.set_state(PygoteSpaceState::Forked);
        assert!(f.allocator.alloc(8, DEFAULT_ALIGNMENT).is_null());
        // A frozen free only clears the mark bit.
        f.allocator.free(survivor);
        assert!(!f.allocator.is_live(survivor as *const ObjectHeader));
        assert!(f.allocator.contain_object(survivor as *const ObjectHeader));
    }

    #[test]
    fn collect_in_frozen_state_clears_marks() {
        let mut f = Fixture::new();
        let a = f.allocator.alloc(32, DEFAULT_ALIGNMENT);
        let b = f.allocator.alloc(32, DEFAULT_ALIGNMENT);
        f.allocator.set_state(PygoteSpaceState::Forking);
        f.allocator.set_state(PygoteSpaceState::Forked);
        f.allocator.collect(|obj| {
            if obj as usize == b as usize {
                ObjectStatus::Dead
            } else {
                ObjectStatus::Alive
            }
        });
        assert!(f.allocator.is_live(a as *const ObjectHeader));
        assert!(!f.allocator.is_live(b as *const ObjectHeader));
    }
}
