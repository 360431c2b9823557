//! Stack-of-arenas allocator: no per-object free, wholesale release via
//! `resize`/drop. Single-owner, so no internal locking; a runtime wraps it
//! behind its own synchronisation when threads share one.

use std::sync::Arc;

use tracing::debug;

use crate::arena::{Arena, ARENA_DEFAULT_ALIGNMENT};
use crate::mem::{align_up, Alignment, DEFAULT_ARENA_SIZE, POOL_ALIGNMENT_IN_BYTES};
use crate::pool_manager::PoolManager;
use crate::pool_map::AllocatorKind;
use crate::space::SpaceType;

/// Inline buffer tried before any pool memory.
#[cfg(feature = "arena-on-stack-buf")]
pub const ON_STACK_BUFFER_SIZE: usize = 128 * 1024;

#[cfg(feature = "arena-on-stack-buf")]
struct OnStackBuff {
    buff: [u8; ON_STACK_BUFFER_SIZE],
    cur: usize,
}

#[cfg(feature = "arena-on-stack-buf")]
impl OnStackBuff {
    fn new() -> Self {
        Self {
            buff: [0; ON_STACK_BUFFER_SIZE],
            cur: 0,
        }
    }

    fn alloc(&mut self, size: usize, align: Alignment) -> *mut u8 {
        let base = self.buff.as_ptr() as usize;
        let aligned = align_up(base + self.cur, align.in_bytes());
        if aligned + size > base + ON_STACK_BUFFER_SIZE {
            return std::ptr::null_mut();
        }
        self.cur = aligned + size - base;
        aligned as *mut u8
    }

    fn occupied_size(&self) -> usize {
        self.cur
    }

    fn resize(&mut self, new_size: usize) {
        debug_assert!(new_size <= self.cur);
        self.cur = new_size;
    }
}

pub struct ArenaAllocator {
    arenas: *mut Arena,
    #[cfg(feature = "arena-on-stack-buf")]
    buff: OnStackBuff,
    pool_manager: Arc<PoolManager>,
    space: SpaceType,
    oom_handler: Option<Box<dyn FnMut()>>,
    // When set, a new arena is sized to the request instead of failing
    // requests larger than the default arena.
    limit_alloc_size_by_pool: bool,
}

impl ArenaAllocator {
    pub fn new(pool_manager: Arc<PoolManager>, space: SpaceType) -> Self {
        Self::with_oom_handler_impl(pool_manager, space, None, false)
    }

    pub fn with_alloc_size_limited_by_pool(pool_manager: Arc<PoolManager>, space: SpaceType) -> Self {
        Self::with_oom_handler_impl(pool_manager, space, None, true)
    }

    /// The handler runs once per failed allocation, before null is
    /// returned.
    pub fn with_oom_handler(
        pool_manager: Arc<PoolManager>,
        space: SpaceType,
        oom_handler: Box<dyn FnMut()>,
    ) -> Self {
        Self::with_oom_handler_impl(pool_manager, space, Some(oom_handler), false)
    }

    fn with_oom_handler_impl(
        pool_manager: Arc<PoolManager>,
        space: SpaceType,
        oom_handler: Option<Box<dyn FnMut()>>,
        limit_alloc_size_by_pool: bool,
    ) -> Self {
        Self {
            arenas: std::ptr::null_mut(),
            #[cfg(feature = "arena-on-stack-buf")]
            buff: OnStackBuff::new(),
            pool_manager,
            space,
            oom_handler,
            limit_alloc_size_by_pool,
        }
    }

    pub fn alloc(&mut self, size: usize, align: Alignment) -> *mut u8 {
        #[cfg(feature = "arena-on-stack-buf")]
        let ret = if self.arenas.is_null() {
            let mem = self.buff.alloc(size, align);
            if mem.is_null() {
                self.allocate_and_add_new_pool(size, align)
            } else {
                mem
            }
        } else {
            self.allocate_and_add_new_pool(size, align)
        };
        #[cfg(not(feature = "arena-on-stack-buf"))]
        let ret = self.allocate_and_add_new_pool(size, align);
        if ret.is_null() {
            if let Some(handler) = self.oom_handler.as_mut() {
                handler();
            }
        }
        ret
    }

    fn allocate_and_add_new_pool(&mut self, size: usize, align: Alignment) -> *mut u8 {
        let mut mem = self.head_alloc(size, align);
        if mem.is_null() {
            let added = if self.limit_alloc_size_by_pool {
                self.add_arena_from_pool(
                    (align_up(size, align.in_bytes()) + core::mem::size_of::<Arena>())
                        .max(DEFAULT_ARENA_SIZE),
                )
            } else {
                self.add_arena_from_pool(DEFAULT_ARENA_SIZE)
            };
            if !added {
                debug!(target: "alloc", %size, space = %self.space, "can not add a new arena");
                return std::ptr::null_mut();
            }
            mem = self.head_alloc(size, align);
            debug_assert!(!self.limit_alloc_size_by_pool || !mem.is_null());
        }
        mem
    }

    fn head_alloc(&mut self, size: usize, align: Alignment) -> *mut u8 {
        if self.arenas.is_null() {
            return std::ptr::null_mut();
        }
        unsafe { (*self.arenas).alloc(size, align) }
    }

    fn add_arena_from_pool(&mut self, pool_size: usize) -> bool {
        let pool_size = align_up(pool_size, POOL_ALIGNMENT_IN_BYTES);
        let new_arena = self.pool_manager.alloc_arena(
            pool_size,
            self.space,
            AllocatorKind::Arena,
            self as *const Self as *const (),
            ARENA_DEFAULT_ALIGNMENT,
        );
        if new_arena.is_null() {
            return false;
        }
        unsafe {
            (*new_arena).link_to(self.arenas);
        }
        self.arenas = new_arena;
        true
    }

    /// Typed construction over `alloc`.
    pub fn new_in<T>(&mut self, value: T) -> *mut T {
        let mem = self.alloc(
            core::mem::size_of::<T>(),
            Alignment::from_bytes(core::mem::align_of::<T>().max(4)),
        ) as *mut T;
        if !mem.is_null() {
            unsafe { mem.write(value) };
        }
        mem
    }

    /// Array allocation; elements are zero-initialised by the caller.
    pub fn alloc_array<T>(&mut self, len: usize) -> *mut T {
        self.alloc(
            core::mem::size_of::<T>() * len,
            Alignment::from_bytes(core::mem::align_of::<T>().max(4)),
        ) as *mut T
    }

    pub fn allocated_size(&self) -> usize {
        let mut size = 0;
        #[cfg(feature = "arena-on-stack-buf")]
        {
            size += self.buff.occupied_size();
        }
        let mut cur = self.arenas;
        while !cur.is_null() {
            unsafe {
                size += (*cur).occupied_size();
                cur = (*cur).next_arena();
            }
        }
        size
    }

    /// Shrink the allocator to `new_size` occupied bytes. Arenas whose
    /// whole occupancy falls inside the trimmed suffix are returned to the
    /// pool source; the first partially covered arena is resized in place.
    /// The on-stack buffer is trimmed last, so its prefix survives as long
    /// as any arena does. Never grows.
    pub fn resize(&mut self, new_size: usize) {
        let cur_size = self.allocated_size();
        if cur_size <= new_size {
            assert!(cur_size == new_size, "resize to a bigger size than allocated");
            return;
        }
        let mut bytes_to_delete = cur_size - new_size;
        while !self.arenas.is_null() && bytes_to_delete != 0 {
            unsafe {
                let next = (*self.arenas).next_arena();
                let cur_arena_size = (*self.arenas).occupied_size();
                if cur_arena_size < bytes_to_delete {
                    self.pool_manager.free_arena(self.arenas);
                    self.arenas = next;
                    bytes_to_delete -= cur_arena_size;
                } else {
                    (*self.arenas).resize(cur_arena_size - bytes_to_delete);
                    bytes_to_delete = 0;
                }
            }
        }
        #[cfg(feature = "arena-on-stack-buf")]
        if bytes_to_delete > 0 {
            let stack_size = self.buff.occupied_size();
            debug_assert!(stack_size >= bytes_to_delete);
            self.buff.resize(stack_size - bytes_to_delete);
            bytes_to_delete = 0;
        }
        assert!(bytes_to_delete == 0);
    }
}

impl Drop for ArenaAllocator {
    fn drop(&mut self) {
        let mut cur = self.arenas;
        while !cur.is_null() {
            let next = unsafe { (*cur).next_arena() };
            self.pool_manager.free_arena(cur);
            cur = next;
        }
    }
}

/// Captures the allocated size on entry and resizes back on drop, so a
/// scope can use the allocator as scratch space.
pub struct ArenaResizeWrapper<'a> {
    old_size: usize,
    allocator: &'a mut ArenaAllocator,
}

impl<'a> ArenaResizeWrapper<'a> {
    pub fn new(allocator: &'a mut ArenaAllocator) -> Self {
        Self {
            old_size: allocator.allocated_size(),
            allocator,
        }
    }
}

impl std::ops::Deref for ArenaResizeWrapper<'_> {
    type Target = ArenaAllocator;

    fn deref(&self) -> &ArenaAllocator {
        self.allocator
    }
}

impl std::ops::DerefMut for ArenaResizeWrapper<'_> {
    fn deref_mut(&mut self) -> &mut ArenaAllocator {
        self.allocator
    }
}

impl Drop for ArenaResizeWrapper<'_> {
    fn drop(&mut self) {
        self.allocator.resize(self.old_size);
    }
}
