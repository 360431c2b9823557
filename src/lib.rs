//! bolide: the memory substrate for building managed-runtime VMs.
//!
//! Raw OS mappings become typed, per-space memory pools; five allocator
//! families (arena, bump/TLAB, runslots, free list, humongous) share the
//! pool source; a pool-address map answers "who owns this pointer" in
//! O(1); and a crossing map tracks where the nearest enclosing object
//! begins for every heap page, which is what generational card scanning
//! stands on. The [`heap_manager::HeapManager`] facade composes the pieces
//! into a non-generational or generational heap.

pub mod alloc_config;
pub mod arena;
pub mod arena_allocator;
pub mod arena_containers;
pub mod bitmap;
pub mod bump_allocator;
pub mod crossing_map;
pub mod error;
pub mod freelist;
pub mod freelist_allocator;
pub mod frame_allocator;
pub mod heap_manager;
pub mod humongous_allocator;
pub mod internal_allocator;
pub mod lock_config;
pub mod malloc_mem_pool;
pub mod malloc_proxy;
pub mod mem;
pub mod mem_config;
pub mod mem_pool;
pub mod mem_range;
pub mod mem_stats;
pub mod mmap;
pub mod mmap_mem_pool;
pub mod object_allocator;
pub mod object_header;
pub mod pool_manager;
pub mod pool_map;
pub mod pygote_space_allocator;
pub mod runslots;
pub mod runslots_allocator;
pub mod space;
pub mod tlab;

pub use crate::arena_allocator::{ArenaAllocator, ArenaResizeWrapper};
pub use crate::error::AllocError;
pub use crate::heap_manager::{GcCause, GcHandler, HeapKind, HeapManager, MutatorContext};
pub use crate::mem::{Alignment, ObjectStatus, DEFAULT_ALIGNMENT};
pub use crate::mem_config::MemConfig;
pub use crate::mem_stats::MemStats;
pub use crate::object_allocator::GcCollectMode;
pub use crate::object_header::ObjectHeader;
pub use crate::pool_manager::{PoolManager, PoolSourceKind};
pub use crate::space::SpaceType;
pub use crate::tlab::TLAB;
