//! Interpreter-frame allocator: a doubly linked stack of arenas with a
//! growing size schedule. Memory is handed out from the top and only the
//! most recent allocation may be freed, so push/pop of frames is a pointer
//! move. Emptied arenas are kept cached up to a threshold before going
//! back to the pool source.

use std::ptr::null_mut;
use std::sync::Arc;

use tracing::debug;

use crate::arena::Arena;
use crate::mem::{align_up, is_aligned, Alignment, DEFAULT_FRAME_ALIGNMENT, POOL_ALIGNMENT_IN_BYTES};
use crate::pool_manager::PoolManager;
use crate::pool_map::AllocatorKind;
use crate::space::SpaceType;

pub const FIRST_ARENA_SIZE: usize = 256 * 1024;
const ARENA_SIZE_GREW_LEVEL: usize = FIRST_ARENA_SIZE;
const FRAME_ALLOC_MAX_FREE_ARENAS_THRESHOLD: usize = 1;

const _: () = assert!(FIRST_ARENA_SIZE % POOL_ALIGNMENT_IN_BYTES == 0);

pub struct FrameAllocator {
    // Arena holding the most recent live frame.
    cur_arena: *mut Arena,
    // Top of the arena list; equal to `cur_arena` unless empty arenas are
    // cached above it.
    last_alloc_arena: *mut Arena,
    biggest_arena_size: usize,
    arena_size_need_to_grow: bool,
    empty_arenas_count: usize,
    alignment: Alignment,
    zero_frames: bool,
    pool_manager: Arc<PoolManager>,
}

impl FrameAllocator {
    pub fn new(pool_manager: Arc<PoolManager>) -> Self {
        Self::with_alignment(pool_manager, DEFAULT_FRAME_ALIGNMENT, true)
    }

    pub fn with_alignment(
        pool_manager: Arc<PoolManager>,
        alignment: Alignment,
        zero_frames: bool,
    ) -> Self {
        let mut allocator = Self {
            cur_arena: null_mut(),
            last_alloc_arena: null_mut(),
            biggest_arena_size: FIRST_ARENA_SIZE,
            arena_size_need_to_grow: true,
            empty_arenas_count: 0,
            alignment,
            zero_frames,
            pool_manager,
        };
        allocator.cur_arena = allocator.alloc_arena(FIRST_ARENA_SIZE);
        assert!(
            !allocator.cur_arena.is_null(),
            "couldn't allocate the first frame arena"
        );
        allocator.last_alloc_arena = allocator.cur_arena;
        allocator
    }

    fn alloc_arena(&self, size: usize) -> *mut Arena {
        self.pool_manager.alloc_arena(
            size,
            SpaceType::Internal,
            AllocatorKind::Frame,
            self as *const Self as *const (),
            self.alignment,
        )
    }

    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        debug_assert!(is_aligned(size, self.alignment.in_bytes()));
        let mut mem = self.try_to_allocate(size);
        if mem.is_null() {
            if !self.try_allocate_new_arena(size) {
                return null_mut();
            }
            mem = self.try_to_allocate(size);
            if mem.is_null() {
                return null_mut();
            }
        }
        debug_assert!(is_aligned(mem as usize, self.alignment.in_bytes()));
        if self.zero_frames {
            unsafe {
                std::ptr::write_bytes(mem, 0, size);
            }
        }
        mem
    }

    fn try_to_allocate(&mut self, size: usize) -> *mut u8 {
        debug_assert!(!self.cur_arena.is_null());
        unsafe {
            let mem = (*self.cur_arena).alloc(size, self.alignment);
            if !mem.is_null() {
                return mem;
            }
            // Current arena is full; a cached empty arena may sit above it.
            let next = (*self.cur_arena).next_arena();
            if next.is_null() {
                return null_mut();
            }
            let mem = (*next).alloc(size, self.alignment);
            if !mem.is_null() {
                debug_assert!(self.empty_arenas_count > 0);
                self.empty_arenas_count -= 1;
                self.cur_arena = next;
            }
            mem
        }
    }

    fn try_allocate_new_arena(&mut self, size: usize) -> bool {
        let arena_size = self.next_arena_size(align_up(
            size + core::mem::size_of::<Arena>(),
            POOL_ALIGNMENT_IN_BYTES,
        ));
        let new_arena = self.alloc_arena(arena_size);
        if new_arena.is_null() {
            debug!(target: "alloc", size = arena_size, "couldn't get memory for a new frame arena");
            self.arena_size_need_to_grow = false;
            return false;
        }
        unsafe {
            (*self.last_alloc_arena).link_to(new_arena);
            (*new_arena).link_prev(self.last_alloc_arena);
        }
        self.last_alloc_arena = new_arena;
        self.empty_arenas_count += 1;
        true
    }

    fn next_arena_size(&mut self, size: usize) -> usize {
        if self.arena_size_need_to_grow {
            self.biggest_arena_size += ARENA_SIZE_GREW_LEVEL;
            if self.biggest_arena_size < size {
                self.biggest_arena_size = align_up(size, ARENA_SIZE_GREW_LEVEL);
            }
        } else {
            self.arena_size_need_to_grow = true;
        }
        self.biggest_arena_size
    }

    /// Frames are freed strictly in reverse allocation order.
    pub fn free(&mut self, mem: *mut u8) {
        debug_assert!(!self.cur_arena.is_null());
        debug_assert!(is_aligned(mem as usize, self.alignment.in_bytes()));
        unsafe {
            if (*self.cur_arena).in_arena(mem) {
                (*self.cur_arena).free(mem);
            } else {
                assert!(
                    (*self.cur_arena).occupied_size() == 0,
                    "frame freed out of order"
                );
                let prev = (*self.cur_arena).prev_arena();
                assert!(!prev.is_null(), "frame freed out of order");
                self.cur_arena = prev;
                assert!((*self.cur_arena).in_arena(mem), "frame freed out of order");
                (*self.cur_arena).free(mem);
                if self.empty_arenas_count + 1 > FRAME_ALLOC_MAX_FREE_ARENAS_THRESHOLD {
                    self.free_last_arena();
                } else {
                    self.empty_arenas_count += 1;
                }
            }
        }
    }

    fn free_last_arena(&mut self) {
        debug_assert!(!self.last_alloc_arena.is_null());
        let arena_to_free = self.last_alloc_arena;
        unsafe {
            self.last_alloc_arena = (*arena_to_free).prev_arena();
            if arena_to_free == self.cur_arena {
                self.cur_arena = self.last_alloc_arena;
            }
            if !self.last_alloc_arena.is_null() {
                (*self.last_alloc_arena).clear_next_link();
            }
        }
        self.pool_manager.free_arena(arena_to_free);
        self.arena_size_need_to_grow = false;
    }

    pub fn contains(&self, mem: *const u8) -> bool {
        let mut cur = self.cur_arena;
        while !cur.is_null() {
            unsafe {
                if (*cur).in_arena(mem) && (mem as usize) < (*cur).allocated_end() as usize {
                    return true;
                }
                cur = (*cur).prev_arena();
            }
        }
        false
    }
}

impl Drop for FrameAllocator {
    fn drop(&mut self) {
        while !self.last_alloc_arena.is_null() {
            let prev = unsafe { (*self.last_alloc_arena).prev_arena() };
            self.pool_manager.free_arena(self.last_alloc_arena);
            self.last_alloc_arena = prev;
        }
        self.cur_arena = null_mut();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::SIZE_1M;
    use crate::mem_config::MemConfig;
    use crate::pool_manager::PoolSourceKind;

    fn frame_allocator() -> FrameAllocator {
        let manager = PoolManager::new(
            PoolSourceKind::Mmap,
            &MemConfig::new(0, 256 * SIZE_1M, 0, 0),
        );
        FrameAllocator::new(manager)
    }

    #[test]
    fn lifo_alloc_free() {
        const ITERATIONS: usize = 32;
        const FRAME_SIZE: usize = 256;
        let mut alloc = frame_allocator();
        let mut frames = Vec::new();
        let mut prev = 0usize;
        for i in 1..=ITERATIONS {
            let mem = alloc.alloc(FRAME_SIZE);
            assert!(!mem.is_null());
            assert!(mem as usize > prev);
            prev = mem as usize;
            unsafe { (mem as *mut u64).write(i as u64) };
            frames.push(mem);
        }
        for (i, mem) in frames.iter().enumerate().rev() {
            unsafe {
                assert_eq!((*mem as *mut u64).read(), (i + 1) as u64);
            }
            assert!(alloc.contains(*mem));
            alloc.free(*mem);
            assert!(!alloc.contains(*mem));
        }
        // Everything reclaimed: one frame of nearly the whole first arena
        // must fit again.
        let header_align = 2 * DEFAULT_FRAME_ALIGNMENT.in_bytes();
        let big = alloc.alloc(FIRST_ARENA_SIZE - header_align);
        assert!(!big.is_null());
    }

    #[test]
    fn grows_across_arenas() {
        let mut alloc = frame_allocator();
        let frame = 4096;
        let mut frames = Vec::new();
        // More than one arena worth of frames.
        for _ in 0..(FIRST_ARENA_SIZE / frame) * 3 {
            let mem = alloc.alloc(frame);
            assert!(!mem.is_null());
            frames.push(mem);
        }
        for mem in frames.iter().rev() {
            alloc.free(*mem);
        }
    }

    #[test]
    fn oversized_frame_gets_matching_arena() {
        let mut alloc = frame_allocator();
        let huge = 3 * FIRST_ARENA_SIZE;
        let mem = alloc.alloc(huge);
        assert!(!mem.is_null());
        unsafe {
            std::ptr::write_bytes(mem, 0x42, huge);
        }
        alloc.free(mem);
    }

    #[test]
    #[should_panic(expected = "frame freed out of order")]
    fn non_lifo_free_is_fatal() {
        let mut alloc = frame_allocator();
        let first = alloc.alloc(256);
        let _second = alloc.alloc(256);
        alloc.free(first);
        // `first` released everything above it; freeing the stale second
        // pointer now underflows the arena.
        let third = alloc.alloc(FIRST_ARENA_SIZE - 4096);
        let _ = third;
        let outside = (first as usize - FIRST_ARENA_SIZE) as *mut u8;
        alloc.free(outside);
    }

    #[test]
    fn frames_are_zeroed() {
        let mut alloc = frame_allocator();
        let mem = alloc.alloc(512);
        unsafe {
            std::ptr::write_bytes(mem, 0xff, 512);
        }
        alloc.free(mem);
        let mem = alloc.alloc(512);
        unsafe {
            for i in 0..512 {
                assert_eq!(mem.add(i).read(), 0);
            }
        }
    }
}
