//! Hooks every allocator fires around raw alloc/free: statistics, memory
//! zeroing and (for the generational heap spaces) crossing-map upkeep.
//! Allocators hold the config behind an `Arc` and stay agnostic of whether
//! a crossing map is attached; the internal allocator runs without one.

use std::sync::Arc;

use crate::crossing_map::CrossingMap;
use crate::mem_stats::MemStats;
use crate::space::SpaceType;

pub struct AllocConfig {
    stats: Arc<MemStats>,
    crossing_map: Option<Arc<CrossingMap>>,
}

impl AllocConfig {
    pub fn new(stats: Arc<MemStats>) -> Arc<Self> {
        Arc::new(Self {
            stats,
            crossing_map: None,
        })
    }

    pub fn with_crossing_map(stats: Arc<MemStats>, crossing_map: Arc<CrossingMap>) -> Arc<Self> {
        Arc::new(Self {
            stats,
            crossing_map: Some(crossing_map),
        })
    }

    #[inline]
    pub fn stats(&self) -> &MemStats {
        &self.stats
    }

    #[inline]
    pub fn crossing_map(&self) -> Option<&Arc<CrossingMap>> {
        self.crossing_map.as_ref()
    }

    #[inline]
    pub(crate) fn on_alloc(&self, size: usize, space: SpaceType) {
        self.stats.record_allocate_raw(size, space);
    }

    #[inline]
    pub(crate) fn on_free(&self, size: usize, space: SpaceType) {
        self.stats.record_free_raw(size, space);
    }

    /// Objects must observe zeroed memory before their header is written.
    #[inline]
    pub(crate) fn memory_init(&self, mem: *mut u8, size: usize) {
        unsafe {
            std::ptr::write_bytes(mem, 0, size);
        }
    }

    #[inline]
    pub(crate) fn add_to_crossing_map(&self, mem: usize, size: usize) {
        if let Some(map) = &self.crossing_map {
            map.add_object(mem, size);
        }
    }

    #[inline]
    pub(crate) fn remove_from_crossing_map(
        &self,
        mem: usize,
        size: usize,
        next_obj: Option<usize>,
        prev_obj: Option<(usize, usize)>,
    ) {
        if let Some(map) = &self.crossing_map {
            map.remove_object(mem, size, next_obj, prev_obj);
        }
    }

    #[inline]
    pub(crate) fn init_crossing_map_for_memory(&self, mem: usize, size: usize) {
        if let Some(map) = &self.crossing_map {
            map.initialize_for_memory(mem, size);
        }
    }

    #[inline]
    pub(crate) fn remove_crossing_map_for_memory(&self, mem: usize, size: usize) {
        if let Some(map) = &self.crossing_map {
            map.remove_for_memory(mem, size);
        }
    }
}
