//! Thread-local allocation buffer: a bump region carved out of young-gen
//! memory and owned by exactly one mutator thread.
//!
//! The byte offsets of the start/free/end pointer fields are ABI: compiled
//! mutator code loads the thread's TLAB, reads the free and end pointers
//! directly, bumps, and stores the new free pointer back, falling into the
//! runtime only on overflow. [`TLAB::tlab_free_pointer_offset`] and friends
//! must therefore stay compile-time constants.

use std::ptr::null_mut;

use crate::mem::aligned_object_size;
use crate::mem_range::MemRange;
use crate::object_header::ObjectHeader;

pub const TLAB_SIZE: usize = 4 * 1024;
pub const TLAB_MAX_ALLOC_SIZE: usize = TLAB_SIZE;

#[repr(C)]
pub struct TLAB {
    next_tlab: *mut TLAB,
    prev_tlab: *mut TLAB,
    memory_start_addr: *mut u8,
    memory_end_addr: *mut u8,
    cur_free_position: *mut u8,
}

impl TLAB {
    pub fn new(address: *mut u8, size: usize) -> Self {
        let mut tlab = Self {
            next_tlab: null_mut(),
            prev_tlab: null_mut(),
            memory_start_addr: null_mut(),
            memory_end_addr: null_mut(),
            cur_free_position: null_mut(),
        };
        tlab.fill(address, size);
        tlab
    }

    pub fn fill(&mut self, address: *mut u8, size: usize) {
        self.memory_start_addr = address;
        self.memory_end_addr = if address.is_null() {
            null_mut()
        } else {
            (address as usize + size) as *mut u8
        };
        self.cur_free_position = address;
    }

    pub fn reset(&mut self) {
        self.fill(null_mut(), 0);
    }

    pub fn is_empty(&self) -> bool {
        self.memory_start_addr.is_null()
            || self.cur_free_position.is_null()
            || self.memory_end_addr.is_null()
    }

    pub const fn max_alloc_size() -> usize {
        TLAB_MAX_ALLOC_SIZE
    }

    pub const fn default_size() -> usize {
        TLAB_SIZE
    }

    /// Bump-allocate `size` bytes at default alignment. Never blocks,
    /// never grows; null means the owner must fetch a new TLAB.
    #[inline]
    pub fn alloc(&mut self, size: usize) -> *mut u8 {
        let size = aligned_object_size(size);
        if self.is_empty() {
            return null_mut();
        }
        let free = self.cur_free_position as usize;
        if free + size > self.memory_end_addr as usize {
            return null_mut();
        }
        self.cur_free_position = (free + size) as *mut u8;
        free as *mut u8
    }

    pub fn occupied_size(&self) -> usize {
        self.cur_free_position as usize - self.memory_start_addr as usize
    }

    pub fn free_size(&self) -> usize {
        self.memory_end_addr as usize - self.cur_free_position as usize
    }

    pub fn mem_range_for_occupied_memory(&self) -> MemRange {
        MemRange::new(
            self.memory_start_addr as usize,
            self.cur_free_position as usize - 1,
        )
    }

    pub fn start_addr(&self) -> *mut u8 {
        self.memory_start_addr
    }

    pub fn cur_pos(&self) -> *mut u8 {
        self.cur_free_position
    }

    pub fn next_tlab(&self) -> *mut TLAB {
        self.next_tlab
    }

    pub fn prev_tlab(&self) -> *mut TLAB {
        self.prev_tlab
    }

    pub fn set_next_tlab(&mut self, tlab: *mut TLAB) {
        self.next_tlab = tlab;
    }

    pub fn set_prev_tlab(&mut self, tlab: *mut TLAB) {
        self.prev_tlab = tlab;
    }

    /// Walk the objects in allocation order. Relies on object headers
    /// carrying their aligned size.
    pub fn iterate_over_objects(&self, mut visitor: impl FnMut(*mut ObjectHeader)) {
        let mut cur = self.memory_start_addr as usize;
        let end = self.cur_free_position as usize;
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
        if self.is_empty() || self.occupied_size() == 0 {
            return;
        }
        if !mem_range.is_intersect(&self.mem_range_for_occupied_memory()) {
            return;
        }
        self.iterate_over_objects(|header| {
            if mem_range.is_address_in_range(header as usize) {
                visitor(header);
            }
        });
    }

    /// GC hook: visit alive objects in allocation order so the collector
    /// can move them out before the buffer is wiped.
    pub fn collect_and_move(
        &self,
        mut death_checker: impl FnMut(*mut ObjectHeader) -> crate::mem::ObjectStatus,
        mut object_move_visitor: impl FnMut(*mut ObjectHeader),
    ) {
        self.iterate_over_objects(|header| {
            if death_checker(header) == crate::mem::ObjectStatus::Alive {
                object_move_visitor(header);
            }
        });
    }

    pub fn contain_object(&self, obj: *const ObjectHeader) -> bool {
        let addr = obj as usize;
        addr >= self.memory_start_addr as usize && addr < self.cur_free_position as usize
    }

    pub fn is_live(&self, obj: *const ObjectHeader) -> bool {
        if !self.contain_object(obj) {
            return false;
        }
        let mut live = false;
        self.iterate_over_objects(|header| {
            if header as *const ObjectHeader == obj {
                live = true;
            }
        });
        live
    }

    /// ABI: byte offset of the buffer start pointer.
    pub const fn tlab_start_addr_offset() -> usize {
        core::mem::offset_of!(TLAB, memory_start_addr)
    }

    /// ABI: byte offset of the bump ("free") pointer.
    pub const fn tlab_free_pointer_offset() -> usize {
        core::mem::offset_of!(TLAB, cur_free_position)
    }

    /// ABI: byte offset of the buffer end pointer.
    pub const fn tlab_end_addr_offset() -> usize {
        core::mem::offset_of!(TLAB, memory_end_addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::DEFAULT_ALIGNMENT_IN_BYTES;

    #[test]
    fn abi_offsets_are_stable_constants() {
        const START: usize = TLAB::tlab_start_addr_offset();
        const FREE: usize = TLAB::tlab_free_pointer_offset();
        const END: usize = TLAB::tlab_end_addr_offset();
        // Two link words precede the three pointers.
        assert_eq!(START, 2 * core::mem::size_of::<usize>());
        assert_eq!(END, 3 * core::mem::size_of::<usize>());
        assert_eq!(FREE, 4 * core::mem::size_of::<usize>());
    }

    #[test]
    fn compiled_code_fast_path_contract() {
        // What a code generator emits: load free and end through the ABI
        // offsets, bump, store back.
        let mut buf = vec![0u8; TLAB_SIZE];
        let mut tlab = TLAB::new(buf.as_mut_ptr(), TLAB_SIZE);
        let tlab_ptr = &mut tlab as *mut TLAB as *mut u8;
        unsafe {
            let free_slot = tlab_ptr.add(TLAB::tlab_free_pointer_offset()) as *mut usize;
            let end_slot = tlab_ptr.add(TLAB::tlab_end_addr_offset()) as *mut usize;
            let free = *free_slot;
            let end = *end_slot;
            let size = crate::mem::aligned_object_size(24);
            assert!(free + size <= end);
            *free_slot = free + size;
            assert_eq!(tlab.occupied_size(), size);
        }
    }

    #[test]
    fn alloc_until_overflow() {
        let mut buf = vec![0u8; TLAB_SIZE];
        let mut tlab = TLAB::new(buf.as_mut_ptr(), TLAB_SIZE);
        let mut allocated = 0;
        loop {
            let mem = tlab.alloc(64);
            if mem.is_null() {
                break;
            }
            assert!(crate::mem::is_aligned(mem as usize, DEFAULT_ALIGNMENT_IN_BYTES));
            allocated += 64;
        }
        assert_eq!(allocated, TLAB_SIZE);
        assert_eq!(tlab.free_size(), 0);
        tlab.reset();
        assert!(tlab.is_empty());
        assert!(tlab.alloc(8).is_null());
    }

    #[test]
    fn never_grows_past_end() {
        let mut buf = vec![0u8; 256];
        let mut tlab = TLAB::new(buf.as_mut_ptr(), 256);
        assert!(!tlab.alloc(200).is_null());
        assert!(tlab.alloc(64).is_null());
        assert!(!tlab.alloc(48).is_null());
    }
}
