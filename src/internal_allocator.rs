//! Allocator for runtime-internal memory: metadata, containers, anything
//! that is not a managed object. Same three-tier composition as the object
//! path (runslots, free list, humongous) but over the `Internal` space and
//! with no crossing map. Never mixed with object memory.

use std::ptr::null_mut;
use std::sync::Arc;

use tracing::debug;

use crate::alloc_config::AllocConfig;
use crate::freelist_allocator::FreeListAllocator;
use crate::humongous_allocator::HumongousObjAllocator;
use crate::lock_config::{LockConfig, MtLockConfig};
use crate::mem::{align_up, Alignment, DEFAULT_ALIGNMENT, DEFAULT_ALIGNMENT_IN_BYTES};
use crate::mem_stats::MemStats;
use crate::pool_manager::PoolManager;
use crate::pool_map::AllocatorKind;
use crate::runslots_allocator::RunSlotsAllocator;
use crate::space::SpaceType;

const SIZE_BEFORE_DATA_OFFSET: usize =
    align_up(core::mem::size_of::<usize>(), DEFAULT_ALIGNMENT_IN_BYTES);

pub struct InternalAllocator<L: LockConfig = MtLockConfig> {
    runslots: RunSlotsAllocator<L>,
    freelist: FreeListAllocator<L>,
    humongous: HumongousObjAllocator<L>,
    pool_manager: Arc<PoolManager>,
    config: Arc<AllocConfig>,
}

impl<L: LockConfig> InternalAllocator<L> {
    pub fn new(pool_manager: Arc<PoolManager>, stats: Arc<MemStats>) -> Self {
        let config = AllocConfig::new(stats);
        Self {
            runslots: RunSlotsAllocator::new(SpaceType::Internal, config.clone()),
            freelist: FreeListAllocator::new(SpaceType::Internal, config.clone()),
            humongous: HumongousObjAllocator::new(SpaceType::Internal, config.clone()),
            pool_manager,
            config,
        }
    }

    pub fn stats(&self) -> &MemStats {
        self.config.stats()
    }

    pub fn alloc(&self, size: usize, align: Alignment) -> *mut u8 {
        if size == 0 {
            return null_mut();
        }
        let aligned = align_up(size, align.in_bytes());
        if aligned <= RunSlotsAllocator::<L>::max_alloc_size() {
            let mem = self.runslots.alloc(size, align);
            if !mem.is_null() {
                return mem;
            }
            let pool = self.pool_manager.alloc_pool(
                RunSlotsAllocator::<L>::min_pool_size(),
                SpaceType::Internal,
                AllocatorKind::RunSlots,
                &self.runslots as *const _ as *const (),
            );
            if pool.is_null() || !self.runslots.add_memory_pool(pool.mem(), pool.size()) {
                debug!(target: "alloc", size, "internal runslots pool refill failed");
                return null_mut();
            }
            return self.runslots.alloc(size, align);
        }
        if aligned <= FreeListAllocator::<L>::max_alloc_size() {
            let mem = self.freelist.alloc(size, align);
            if !mem.is_null() {
                return mem;
            }
            let pool = self.pool_manager.alloc_pool(
                FreeListAllocator::<L>::min_pool_size(),
                SpaceType::Internal,
                AllocatorKind::FreeList,
                &self.freelist as *const _ as *const (),
            );
            if pool.is_null() || !self.freelist.add_memory_pool(pool.mem(), pool.size()) {
                debug!(target: "alloc", size, "internal freelist pool refill failed");
                return null_mut();
            }
            return self.freelist.alloc(size, align);
        }
        let mem = self.humongous.alloc(size, align);
        if !mem.is_null() {
            return mem;
        }
        let pool_size = HumongousObjAllocator::<L>::min_pool_size(aligned);
        let pool = self.pool_manager.alloc_pool(
            pool_size,
            SpaceType::Internal,
            AllocatorKind::Humongous,
            &self.humongous as *const _ as *const (),
        );
        if pool.is_null() || !self.humongous.add_memory_pool(pool.mem(), pool.size()) {
            debug!(target: "alloc", size, "internal humongous pool refill failed");
            return null_mut();
        }
        self.humongous.alloc(size, align)
    }

    /// Scoped per-thread variant; the composition is lock-parameterised,
    /// so this is plain `alloc` under another name.
    pub fn alloc_local(&self, size: usize, align: Alignment) -> *mut u8 {
        self.alloc(size, align)
    }

    pub fn free(&self, mem: *mut u8) {
        if mem.is_null() {
            return;
        }
        // The reverse map knows which tier owns the pointer.
        let info = self.pool_manager.allocator_info_for_addr(mem as usize);
        match info.kind() {
            AllocatorKind::RunSlots => self.runslots.free(mem),
            AllocatorKind::FreeList => self.freelist.free(mem),
            AllocatorKind::Humongous => self.humongous.free(mem),
            kind => panic!("internal free hit a foreign pool of kind {kind:?}"),
        }
    }

    /// Typed construction over `alloc`. Null when memory is exhausted.
    pub fn new_in<T>(&self, value: T) -> *mut T {
        let mem = self.alloc(
            core::mem::size_of::<T>(),
            Alignment::from_bytes(core::mem::align_of::<T>().max(4)),
        ) as *mut T;
        if !mem.is_null() {
            unsafe { mem.write(value) };
        }
        mem
    }

    pub fn delete<T>(&self, ptr: *mut T) {
        if ptr.is_null() {
            return;
        }
        unsafe {
            std::ptr::drop_in_place(ptr);
        }
        self.free(ptr as *mut u8);
    }

    /// Array with its element count stashed in a size-aligned header in
    /// front of the data, so deletion needs no caller-supplied length.
    pub fn new_array<T: Default>(&self, len: usize) -> *mut T {
        let mem = self.alloc(
            SIZE_BEFORE_DATA_OFFSET + core::mem::size_of::<T>() * len,
            DEFAULT_ALIGNMENT,
        );
        if mem.is_null() {
            return null_mut();
        }
        unsafe {
            (mem as *mut usize).write(len);
            let data = mem.add(SIZE_BEFORE_DATA_OFFSET) as *mut T;
            for i in 0..len {
                data.add(i).write(T::default());
            }
            data
        }
    }

    pub fn delete_array<T>(&self, data: *mut T) {
        if data.is_null() {
            return;
        }
        unsafe {
            let mem = (data as *mut u8).sub(SIZE_BEFORE_DATA_OFFSET);
            let len = (mem as *mut usize).read();
            for i in 0..len {
                std::ptr::drop_in_place(data.add(i));
            }
            self.free(mem);
        }
    }

    /// Return every pool of every tier to the pool source. The allocator
    /// must not be used afterwards.
    pub fn finalize(&self) {
        let manager = &self.pool_manager;
        self.runslots
            .visit_and_remove_all_pools(|mem, size| manager.free_pool(mem, size));
        self.freelist
            .visit_and_remove_all_pools(|mem, size| manager.free_pool(mem, size));
        self.humongous
            .visit_and_remove_all_pools(|mem, size| manager.free_pool(mem, size));
    }
}

impl<L: LockConfig> Drop for InternalAllocator<L> {
    fn drop(&mut self) {
        self.finalize();
    }
}
