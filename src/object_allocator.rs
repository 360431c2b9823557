//! Object-allocator facades: route every object request to the right
//! allocator family by size and kind. Two concrete configurations exist,
//! non-generational (runslots + free list + humongous) and generational
//! (young bump/TLAB space in front, tenured and non-movable tiers behind),
//! each optionally fronted by a pygote space for pre-fork objects.

use std::ptr::null_mut;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::alloc_config::AllocConfig;
use crate::bump_allocator::BumpPointerAllocator;
use crate::crossing_map::CrossingMap;
use crate::freelist_allocator::FreeListAllocator;
use crate::humongous_allocator::HumongousObjAllocator;
use crate::lock_config::{LockConfig, MtLockConfig};
use crate::mem::{align_up, Alignment, ObjectStatus, SIZE_1M};
use crate::mem_range::MemRange;
use crate::mem_stats::MemStats;
use crate::object_header::ObjectHeader;
use crate::pool_manager::PoolManager;
use crate::pool_map::AllocatorKind;
use crate::pygote_space_allocator::PygoteSpaceAllocator;
use crate::runslots_allocator::RunSlotsAllocator;
use crate::space::SpaceType;
use crate::tlab::{TLAB, TLAB_MAX_ALLOC_SIZE, TLAB_SIZE};

/// Collector intent passed into `collect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcCollectMode {
    None,
    Young,
    Full,
}

/// Objects up to this size go to the young space in the generational
/// configuration.
pub const YOUNG_ALLOC_MAX_SIZE: usize = TLAB_MAX_ALLOC_SIZE;
pub const YOUNG_TLAB_SIZE: usize = TLAB_SIZE;
pub const DEFAULT_YOUNG_SPACE_SIZE: usize = 4 * SIZE_1M;

/// Non-generational object allocator: one allocator family per size band,
/// nothing ever moves.
pub struct ObjectAllocatorNoGen<L: LockConfig = MtLockConfig> {
    object_allocator: RunSlotsAllocator<L>,
    large_object_allocator: FreeListAllocator<L>,
    humongous_object_allocator: HumongousObjAllocator<L>,
    pygote_space_allocator: Option<Mutex<PygoteSpaceAllocator<L>>>,
    pool_manager: Arc<PoolManager>,
    config: Arc<AllocConfig>,
}

impl<L: LockConfig> ObjectAllocatorNoGen<L> {
    pub fn new(pool_manager: Arc<PoolManager>, stats: Arc<MemStats>, create_pygote_space: bool) -> Self {
        let config = AllocConfig::new(stats);
        Self {
            object_allocator: RunSlotsAllocator::new(SpaceType::Object, config.clone()),
            large_object_allocator: FreeListAllocator::new(SpaceType::Object, config.clone()),
            humongous_object_allocator: HumongousObjAllocator::new(
                SpaceType::HumongousObject,
                config.clone(),
            ),
            pygote_space_allocator: create_pygote_space
                .then(|| Mutex::new(PygoteSpaceAllocator::new(pool_manager.clone(), config.clone()))),
            pool_manager,
            config,
        }
    }

    pub const fn regular_object_max_size() -> usize {
        RunSlotsAllocator::<L>::max_alloc_size()
    }

    pub const fn large_object_max_size() -> usize {
        FreeListAllocator::<L>::max_alloc_size()
    }

    pub fn allocate(&self, size: usize, align: Alignment) -> *mut u8 {
        let aligned = align_up(size, align.in_bytes());
        if aligned <= Self::regular_object_max_size() {
            allocate_safe(
                size,
                align,
                &self.pool_manager,
                &self.config,
                |s, a| self.object_allocator.alloc(s, a),
                |mem, sz| self.object_allocator.add_memory_pool(mem, sz),
                RunSlotsAllocator::<L>::min_pool_size(),
                SpaceType::Object,
                AllocatorKind::RunSlots,
                &self.object_allocator as *const _ as *const (),
            )
        } else if aligned <= Self::large_object_max_size() {
            allocate_safe(
                size,
                align,
                &self.pool_manager,
                &self.config,
                |s, a| self.large_object_allocator.alloc(s, a),
                |mem, sz| self.large_object_allocator.add_memory_pool(mem, sz),
                FreeListAllocator::<L>::min_pool_size(),
                SpaceType::Object,
                AllocatorKind::FreeList,
                &self.large_object_allocator as *const _ as *const (),
            )
        } else {
            allocate_safe(
                size,
                align,
                &self.pool_manager,
                &self.config,
                |s, a| self.humongous_object_allocator.alloc(s, a),
                |mem, sz| self.humongous_object_allocator.add_memory_pool(mem, sz),
                HumongousObjAllocator::<L>::min_pool_size(aligned),
                SpaceType::HumongousObject,
                AllocatorKind::Humongous,
                &self.humongous_object_allocator as *const _ as *const (),
            )
        }
    }

    /// Nothing moves here, so non-movable requests only differ by going
    /// through the pygote space while it is open.
    pub fn allocate_non_movable(&self, size: usize, align: Alignment) -> *mut u8 {
        if let Some(pygote) = &self.pygote_space_allocator {
            let mut pygote = pygote.lock();
            if pygote.can_alloc_non_movable(size, align) {
                let mem = pygote.alloc(size, align);
                if !mem.is_null() {
                    return mem;
                }
            }
        }
        self.allocate(size, align)
    }

    pub fn collect(
        &self,
        death_checker: &mut dyn FnMut(*mut ObjectHeader) -> ObjectStatus,
        collect_mode: GcCollectMode,
    ) {
        if collect_mode == GcCollectMode::None {
            return;
        }
        self.object_allocator.collect(&mut *death_checker);
        self.large_object_allocator.collect(&mut *death_checker);
        self.humongous_object_allocator.collect(&mut *death_checker);
        if let Some(pygote) = &self.pygote_space_allocator {
            pygote.lock().collect(&mut *death_checker);
        }
    }

    /// Objects served by the regular-size (runslots) tier.
    pub fn iterate_regular_size_objects(&self, mut visitor: impl FnMut(*mut ObjectHeader)) {
        self.object_allocator.iterate_over_objects(&mut visitor);
    }

    /// Everything the other tiers hold.
    pub fn iterate_non_regular_size_objects(&self, mut visitor: impl FnMut(*mut ObjectHeader)) {
        self.large_object_allocator.iterate_over_objects(&mut visitor);
        self.humongous_object_allocator.iterate_over_objects(&mut visitor);
        if let Some(pygote) = &self.pygote_space_allocator {
            pygote.lock().iterate_over_objects(&mut visitor);
        }
    }

    pub fn iterate_over_objects(&self, mut visitor: impl FnMut(*mut ObjectHeader)) {
        self.iterate_regular_size_objects(&mut visitor);
        self.iterate_non_regular_size_objects(&mut visitor);
    }

    pub fn contain_object(&self, obj: *const ObjectHeader) -> bool {
        self.object_allocator.contain_object(obj)
            || self.large_object_allocator.contain_object(obj)
            || self.humongous_object_allocator.contain_object(obj)
            || self
                .pygote_space_allocator
                .as_ref()
                .map(|p| p.lock().contain_object(obj))
                .unwrap_or(false)
    }

    pub fn is_live(&self, obj: *const ObjectHeader) -> bool {
        self.object_allocator.is_live(obj)
            || self.large_object_allocator.is_live(obj)
            || self.humongous_object_allocator.is_live(obj)
            || self
                .pygote_space_allocator
                .as_ref()
                .map(|p| p.lock().is_live(obj))
                .unwrap_or(false)
    }

    pub fn verify_allocator(&self) -> usize {
        self.object_allocator.verify_allocator() + self.large_object_allocator.verify_allocator()
    }

    pub fn is_tlab_supported(&self) -> bool {
        false
    }

    pub fn create_new_tlab(&self) -> *mut TLAB {
        null_mut()
    }

    pub fn pygote_space_allocator(&self) -> Option<&Mutex<PygoteSpaceAllocator<L>>> {
        self.pygote_space_allocator.as_ref()
    }

    /// Return unused pools of every tier to the pool source.
    pub fn reclaim_free_pools(&self) {
        let manager = &self.pool_manager;
        let config = &self.config;
        let free = |mem: *mut u8, size: usize| {
            config.remove_crossing_map_for_memory(mem as usize, size);
            manager.free_pool(mem, size);
        };
        self.object_allocator.visit_and_remove_free_pools(free);
        self.large_object_allocator.visit_and_remove_free_pools(free);
        self.humongous_object_allocator.visit_and_remove_free_pools(free);
    }

    /// Tear everything down; the facade is unusable afterwards.
    pub fn finalize(&self) {
        let manager = &self.pool_manager;
        let config = &self.config;
        let free = |mem: *mut u8, size: usize| {
            config.remove_crossing_map_for_memory(mem as usize, size);
            manager.free_pool(mem, size);
        };
        self.object_allocator.visit_and_remove_all_pools(free);
        self.large_object_allocator.visit_and_remove_all_pools(free);
        self.humongous_object_allocator.visit_and_remove_all_pools(free);
        if let Some(pygote) = &self.pygote_space_allocator {
            pygote.lock().visit_and_remove_all_pools(free);
        }
    }
}

impl<L: LockConfig> Drop for ObjectAllocatorNoGen<L> {
    fn drop(&mut self) {
        self.finalize();
    }
}

/// Generational object allocator: young bump/TLAB space for small
/// allocations, tenured runslots + free list + humongous behind it, and a
/// separate non-movable tier.
pub struct ObjectAllocatorGen<L: LockConfig = MtLockConfig> {
    young_gen_allocator: BumpPointerAllocator<L>,
    object_allocator: RunSlotsAllocator<L>,
    large_object_allocator: FreeListAllocator<L>,
    humongous_object_allocator: HumongousObjAllocator<L>,
    non_movable_object_allocator: RunSlotsAllocator<L>,
    large_non_movable_object_allocator: FreeListAllocator<L>,
    pygote_space_allocator: Option<Mutex<PygoteSpaceAllocator<L>>>,
    crossing_map: Arc<CrossingMap>,
    pool_manager: Arc<PoolManager>,
    config: Arc<AllocConfig>,
}

impl<L: LockConfig> ObjectAllocatorGen<L> {
    /// Needs the MMAP pool source: the crossing map covers its reserved
    /// object window.
    pub fn new(
        pool_manager: Arc<PoolManager>,
        stats: Arc<MemStats>,
        young_space_size: usize,
        tlabs_max_count: usize,
        create_pygote_space: bool,
    ) -> Self {
        let window = pool_manager.mmap_pool();
        let crossing_map = Arc::new(CrossingMap::new(
            window.min_object_address(),
            window.max_object_address() - window.min_object_address(),
        ));
        let config = AllocConfig::with_crossing_map(stats, crossing_map.clone());
        let young_pool = pool_manager.alloc_pool(
            young_space_size,
            SpaceType::Object,
            AllocatorKind::BumpWithTlabs,
            std::ptr::null(),
        );
        assert!(!young_pool.is_null(), "couldn't reserve the young space");
        config.init_crossing_map_for_memory(young_pool.addr(), young_pool.size());
        let young_gen_allocator = BumpPointerAllocator::new(
            young_pool,
            SpaceType::Object,
            config.clone(),
            tlabs_max_count,
        );
        Self {
            young_gen_allocator,
            object_allocator: RunSlotsAllocator::new(SpaceType::Object, config.clone()),
            large_object_allocator: FreeListAllocator::new(SpaceType::Object, config.clone()),
            humongous_object_allocator: HumongousObjAllocator::new(
                SpaceType::HumongousObject,
                config.clone(),
            ),
            non_movable_object_allocator: RunSlotsAllocator::new(
                SpaceType::NonMovableObject,
                config.clone(),
            ),
            large_non_movable_object_allocator: FreeListAllocator::new(
                SpaceType::NonMovableObject,
                config.clone(),
            ),
            pygote_space_allocator: create_pygote_space
                .then(|| Mutex::new(PygoteSpaceAllocator::new(pool_manager.clone(), config.clone()))),
            crossing_map,
            pool_manager,
            config,
        }
    }

    pub const fn young_alloc_max_size() -> usize {
        YOUNG_ALLOC_MAX_SIZE
    }

    pub const fn regular_object_max_size() -> usize {
        RunSlotsAllocator::<L>::max_alloc_size()
    }

    pub const fn large_object_max_size() -> usize {
        FreeListAllocator::<L>::max_alloc_size()
    }

    /// Small objects go to the young space; a null return means the young
    /// space is full and the caller should trigger a young GC. Anything
    /// bigger is tenured immediately.
    pub fn allocate(&self, size: usize, align: Alignment) -> *mut u8 {
        let aligned = align_up(size, align.in_bytes());
        if aligned <= YOUNG_ALLOC_MAX_SIZE {
            return self.young_gen_allocator.alloc(size, align);
        }
        self.allocate_tenured(size, align)
    }

    pub fn allocate_tenured(&self, size: usize, align: Alignment) -> *mut u8 {
        let aligned = align_up(size, align.in_bytes());
        if aligned <= Self::regular_object_max_size() {
            allocate_safe(
                size,
                align,
                &self.pool_manager,
                &self.config,
                |s, a| self.object_allocator.alloc(s, a),
                |mem, sz| self.object_allocator.add_memory_pool(mem, sz),
                RunSlotsAllocator::<L>::min_pool_size(),
                SpaceType::Object,
                AllocatorKind::RunSlots,
                &self.object_allocator as *const _ as *const (),
            )
        } else if aligned <= Self::large_object_max_size() {
            allocate_safe(
                size,
                align,
                &self.pool_manager,
                &self.config,
                |s, a| self.large_object_allocator.alloc(s, a),
                |mem, sz| self.large_object_allocator.add_memory_pool(mem, sz),
                FreeListAllocator::<L>::min_pool_size(),
                SpaceType::Object,
                AllocatorKind::FreeList,
                &self.large_object_allocator as *const _ as *const (),
            )
        } else {
            allocate_safe(
                size,
                align,
                &self.pool_manager,
                &self.config,
                |s, a| self.humongous_object_allocator.alloc(s, a),
                |mem, sz| self.humongous_object_allocator.add_memory_pool(mem, sz),
                HumongousObjAllocator::<L>::min_pool_size(aligned),
                SpaceType::HumongousObject,
                AllocatorKind::Humongous,
                &self.humongous_object_allocator as *const _ as *const (),
            )
        }
    }

    pub fn allocate_non_movable(&self, size: usize, align: Alignment) -> *mut u8 {
        if let Some(pygote) = &self.pygote_space_allocator {
            let mut pygote = pygote.lock();
            if pygote.can_alloc_non_movable(size, align) {
                let mem = pygote.alloc(size, align);
                if !mem.is_null() {
                    return mem;
                }
            }
        }
        let aligned = align_up(size, align.in_bytes());
        if aligned <= Self::regular_object_max_size() {
            allocate_safe(
                size,
                align,
                &self.pool_manager,
                &self.config,
                |s, a| self.non_movable_object_allocator.alloc(s, a),
                |mem, sz| self.non_movable_object_allocator.add_memory_pool(mem, sz),
                RunSlotsAllocator::<L>::min_pool_size(),
                SpaceType::NonMovableObject,
                AllocatorKind::RunSlots,
                &self.non_movable_object_allocator as *const _ as *const (),
            )
        } else if aligned <= Self::large_object_max_size() {
            allocate_safe(
                size,
                align,
                &self.pool_manager,
                &self.config,
                |s, a| self.large_non_movable_object_allocator.alloc(s, a),
                |mem, sz| {
                    self.large_non_movable_object_allocator.add_memory_pool(mem, sz)
                },
                FreeListAllocator::<L>::min_pool_size(),
                SpaceType::NonMovableObject,
                AllocatorKind::FreeList,
                &self.large_non_movable_object_allocator as *const _ as *const (),
            )
        } else {
            // Humongous objects never move anyway.
            allocate_safe(
                size,
                align,
                &self.pool_manager,
                &self.config,
                |s, a| self.humongous_object_allocator.alloc(s, a),
                |mem, sz| self.humongous_object_allocator.add_memory_pool(mem, sz),
                HumongousObjAllocator::<L>::min_pool_size(aligned),
                SpaceType::HumongousObject,
                AllocatorKind::Humongous,
                &self.humongous_object_allocator as *const _ as *const (),
            )
        }
    }

    pub fn create_new_tlab(&self) -> *mut TLAB {
        self.young_gen_allocator.create_new_tlab(YOUNG_TLAB_SIZE)
    }

    pub const fn tlab_max_alloc_size() -> usize {
        TLAB_MAX_ALLOC_SIZE
    }

    pub fn is_tlab_supported(&self) -> bool {
        true
    }

    pub fn has_young_space(&self) -> bool {
        true
    }

    pub fn is_address_in_young_space(&self, address: usize) -> bool {
        self.young_gen_allocator.mem_range().is_address_in_range(address)
    }

    pub fn young_space_mem_range(&self) -> MemRange {
        self.young_gen_allocator.mem_range()
    }

    /// Wipe the young space after its survivors moved out, and give it a
    /// clean crossing map.
    pub fn reset_young_allocator(&self) {
        let range = self.young_gen_allocator.mem_range();
        let size = range.end_address() - range.start_address() + 1;
        self.young_gen_allocator.reset();
        self.config
            .remove_crossing_map_for_memory(range.start_address(), size);
        self.config
            .init_crossing_map_for_memory(range.start_address(), size);
    }

    /// GC hook for evacuating the young space: alive objects are handed to
    /// the move visitor in allocation order, TLABs included.
    pub fn collect_young_and_move(
        &self,
        death_checker: &mut dyn FnMut(*mut ObjectHeader) -> ObjectStatus,
        object_move_visitor: &mut dyn FnMut(*mut ObjectHeader),
    ) {
        self.young_gen_allocator
            .collect_and_move(&mut *death_checker, &mut *object_move_visitor);
    }

    pub fn iterate_over_young_objects(&self, mut visitor: impl FnMut(*mut ObjectHeader)) {
        self.young_gen_allocator.iterate_over_objects(&mut visitor);
    }

    pub fn iterate_over_tenured_objects(&self, mut visitor: impl FnMut(*mut ObjectHeader)) {
        self.object_allocator.iterate_over_objects(&mut visitor);
        self.large_object_allocator.iterate_over_objects(&mut visitor);
        self.humongous_object_allocator.iterate_over_objects(&mut visitor);
        self.non_movable_object_allocator.iterate_over_objects(&mut visitor);
        self.large_non_movable_object_allocator
            .iterate_over_objects(&mut visitor);
        if let Some(pygote) = &self.pygote_space_allocator {
            pygote.lock().iterate_over_objects(&mut visitor);
        }
    }

    pub fn iterate_over_objects(&self, mut visitor: impl FnMut(*mut ObjectHeader)) {
        self.iterate_over_young_objects(&mut visitor);
        self.iterate_over_tenured_objects(&mut visitor);
    }

    pub fn iterate_over_objects_in_range(
        &self,
        mem_range: MemRange,
        mut visitor: impl FnMut(*mut ObjectHeader),
    ) {
        let lo = mem_range.start_address();
        let hi = mem_range.end_address();
        self.young_gen_allocator
            .iterate_over_objects_in_range(&mem_range, &mut visitor);
        self.object_allocator
            .iterate_over_objects_in_range(&mut visitor, lo, hi);
        self.large_object_allocator
            .iterate_over_objects_in_range(&mut visitor, lo, hi);
        self.humongous_object_allocator
            .iterate_over_objects_in_range(&mut visitor, lo, hi);
        self.non_movable_object_allocator
            .iterate_over_objects_in_range(&mut visitor, lo, hi);
        self.large_non_movable_object_allocator
            .iterate_over_objects_in_range(&mut visitor, lo, hi);
        if let Some(pygote) = &self.pygote_space_allocator {
            pygote.lock().iterate_over_objects_in_range(&mut visitor, lo, hi);
        }
    }

    /// Sweep the requested generations. The young space is reclaimed by
    /// `collect_young_and_move` + `reset_young_allocator`, not here.
    pub fn collect(
        &self,
        death_checker: &mut dyn FnMut(*mut ObjectHeader) -> ObjectStatus,
        collect_mode: GcCollectMode,
    ) {
        if collect_mode != GcCollectMode::Full {
            return;
        }
        self.object_allocator.collect(&mut *death_checker);
        self.large_object_allocator.collect(&mut *death_checker);
        self.humongous_object_allocator.collect(&mut *death_checker);
        self.non_movable_object_allocator.collect(&mut *death_checker);
        self.large_non_movable_object_allocator.collect(&mut *death_checker);
        if let Some(pygote) = &self.pygote_space_allocator {
            pygote.lock().collect(&mut *death_checker);
        }
    }

    pub fn contain_object(&self, obj: *const ObjectHeader) -> bool {
        self.young_gen_allocator.contain_object(obj)
            || self.object_allocator.contain_object(obj)
            || self.large_object_allocator.contain_object(obj)
            || self.humongous_object_allocator.contain_object(obj)
            || self.non_movable_object_allocator.contain_object(obj)
            || self.large_non_movable_object_allocator.contain_object(obj)
            || self
                .pygote_space_allocator
                .as_ref()
                .map(|p| p.lock().contain_object(obj))
                .unwrap_or(false)
    }

    pub fn is_live(&self, obj: *const ObjectHeader) -> bool {
        self.young_gen_allocator.is_live(obj)
            || self.object_allocator.is_live(obj)
            || self.large_object_allocator.is_live(obj)
            || self.humongous_object_allocator.is_live(obj)
            || self.non_movable_object_allocator.is_live(obj)
            || self.large_non_movable_object_allocator.is_live(obj)
            || self
                .pygote_space_allocator
                .as_ref()
                .map(|p| p.lock().is_live(obj))
                .unwrap_or(false)
    }

    pub fn verify_allocator(&self) -> usize {
        self.object_allocator.verify_allocator()
            + self.non_movable_object_allocator.verify_allocator()
            + self.large_object_allocator.verify_allocator()
            + self.large_non_movable_object_allocator.verify_allocator()
    }

    pub fn crossing_map(&self) -> &Arc<CrossingMap> {
        &self.crossing_map
    }

    pub fn pygote_space_allocator(&self) -> Option<&Mutex<PygoteSpaceAllocator<L>>> {
        self.pygote_space_allocator.as_ref()
    }

    pub fn reclaim_free_pools(&self) {
        let manager = &self.pool_manager;
        let config = &self.config;
        let free = |mem: *mut u8, size: usize| {
            config.remove_crossing_map_for_memory(mem as usize, size);
            manager.free_pool(mem, size);
        };
        self.object_allocator.visit_and_remove_free_pools(free);
        self.large_object_allocator.visit_and_remove_free_pools(free);
        self.humongous_object_allocator.visit_and_remove_free_pools(free);
        self.non_movable_object_allocator.visit_and_remove_free_pools(free);
        self.large_non_movable_object_allocator
            .visit_and_remove_free_pools(free);
    }

    pub fn finalize(&mut self) {
        let manager = self.pool_manager.clone();
        let config = self.config.clone();
        let free = |mem: *mut u8, size: usize| {
            config.remove_crossing_map_for_memory(mem as usize, size);
            manager.free_pool(mem, size);
        };
        self.object_allocator.visit_and_remove_all_pools(free);
        self.large_object_allocator.visit_and_remove_all_pools(free);
        self.humongous_object_allocator.visit_and_remove_all_pools(free);
        self.non_movable_object_allocator.visit_and_remove_all_pools(free);
        self.large_non_movable_object_allocator
            .visit_and_remove_all_pools(free);
        if let Some(pygote) = &self.pygote_space_allocator {
            pygote.lock().visit_and_remove_all_pools(free);
        }
        self.young_gen_allocator.visit_and_remove_all_pools(free);
    }
}

impl<L: LockConfig> Drop for ObjectAllocatorGen<L> {
    fn drop(&mut self) {
        self.finalize();
    }
}

/// Retry skeleton shared by every tier: try the allocator, and on failure
/// feed it one fresh pool sized to the request before trying again.
#[allow(clippy::too_many_arguments)]
fn allocate_safe(
    size: usize,
    align: Alignment,
    pool_manager: &Arc<PoolManager>,
    config: &Arc<AllocConfig>,
    alloc: impl Fn(usize, Alignment) -> *mut u8,
    add_pool: impl Fn(*mut u8, usize) -> bool,
    pool_size: usize,
    space: SpaceType,
    kind: AllocatorKind,
    allocator_header: *const (),
) -> *mut u8 {
    let mem = alloc(size, align);
    if !mem.is_null() {
        return mem;
    }
    let pool = pool_manager.alloc_pool(pool_size, space, kind, allocator_header);
    if pool.is_null() {
        debug!(target: "alloc", size, %space, "pool source exhausted");
        return null_mut();
    }
    if !add_pool(pool.mem(), pool.size()) {
        pool_manager.free_pool(pool.mem(), pool.size());
        return null_mut();
    }
    config.init_crossing_map_for_memory(pool.addr(), pool.size());
    alloc(size, align)
}
