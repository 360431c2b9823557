//! The crossing map answers, for every page of the object heap, "where
//! does the first object in this page begin, or which earlier object
//! covers it?". GC card scanning starts from it.
//!
//! Physically it is two-level: a top array with one slot per
//! pool-granularity region, each lazily backed by a leaf array of 16-bit
//! tagged words, one word per page. A word is 2 bits of status plus a
//! 14-bit offset:
//!
//! - status 0, offset 0: nothing starts in or crosses into this page;
//! - status 0, offset N: no object starts here, but an object beginning N
//!   pages earlier covers this page (N saturates at the field max);
//! - status 1: the first object starting in this page begins `offset`
//!   alignment words in;
//! - status 2: both of the above; `offset` describes the first-starting
//!   object.

use modular_bitfield::prelude::*;
use parking_lot::Mutex;
use tracing::debug;

use crate::mem::{align_up, is_aligned, DEFAULT_ALIGNMENT, POOL_ALIGNMENT_IN_BYTES};

pub const CROSSING_MAP_GRANULARITY: usize = 4096;
const STATIC_ARRAY_GRANULARITY: usize = POOL_ALIGNMENT_IN_BYTES;
const MAPS_IN_LEAF: usize = STATIC_ARRAY_GRANULARITY / CROSSING_MAP_GRANULARITY;
const OBJ_ALIGNMENT_LOG: usize = DEFAULT_ALIGNMENT as usize;

const STATUS_UNINITIALIZED: u8 = 0;
const STATUS_CROSSED_BORDER: u8 = 0;
const STATUS_INITIALIZED: u8 = 1;
const STATUS_INITIALIZED_AND_CROSSED: u8 = 2;

const MAX_OFFSET: u16 = (1 << 14) - 1;

// Every object offset inside one page must be encodable.
const _: () = assert!((CROSSING_MAP_GRANULARITY >> OBJ_ALIGNMENT_LOG) <= MAX_OFFSET as usize);
const _: () = assert!(STATIC_ARRAY_GRANULARITY % CROSSING_MAP_GRANULARITY == 0);

#[bitfield]
#[derive(Clone, Copy)]
struct MapWord {
    status: B2,
    offset: B14,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MapState {
    Uninitialized,
    CrossedBorder,
    Initialized,
    InitializedAndCrossedBorder,
}

impl MapWord {
    fn state(&self) -> MapState {
        match self.status() {
            STATUS_INITIALIZED => MapState::Initialized,
            STATUS_INITIALIZED_AND_CROSSED => MapState::InitializedAndCrossedBorder,
            _ => {
                if self.offset() == 0 {
                    MapState::Uninitialized
                } else {
                    MapState::CrossedBorder
                }
            }
        }
    }

    fn set_uninitialized(&mut self) {
        self.set_status(STATUS_UNINITIALIZED);
        self.set_offset(0);
    }

    fn set_initialized(&mut self, offset: u16) {
        assert!(offset <= MAX_OFFSET, "object offset overflows the crossing map word");
        self.set_status(STATUS_INITIALIZED);
        self.set_offset(offset);
    }

    fn set_initialized_and_crossed_border(&mut self, offset: u16) {
        assert!(offset <= MAX_OFFSET, "object offset overflows the crossing map word");
        self.set_status(STATUS_INITIALIZED_AND_CROSSED);
        self.set_offset(offset);
    }

    fn set_crossed_border(&mut self, offset: u16) {
        debug_assert!(offset != 0);
        self.set_status(STATUS_CROSSED_BORDER);
        self.set_offset(offset);
    }
}

struct CrossingMapState {
    leaves: Vec<Option<Box<[MapWord]>>>,
}

pub struct CrossingMap {
    start_addr: usize,
    map_elements_count: usize,
    state: Mutex<CrossingMapState>,
}

impl CrossingMap {
    /// Cover `[start_addr, start_addr + size)`. Leaves are not allocated
    /// until [`CrossingMap::initialize_for_memory`] is called for a range.
    pub fn new(start_addr: usize, size: usize) -> Self {
        assert!(size % CROSSING_MAP_GRANULARITY == 0);
        assert!(is_aligned(start_addr, CROSSING_MAP_GRANULARITY));
        let static_count = align_up(size, STATIC_ARRAY_GRANULARITY) / STATIC_ARRAY_GRANULARITY;
        debug!(target: "gc", start = start_addr, size, "created crossing map");
        Self {
            start_addr,
            map_elements_count: size / CROSSING_MAP_GRANULARITY,
            state: Mutex::new(CrossingMapState {
                leaves: (0..static_count).map(|_| None).collect(),
            }),
        }
    }

    fn map_num_from_addr(&self, addr: usize) -> usize {
        debug_assert!(addr >= self.start_addr);
        let num = (addr - self.start_addr) / CROSSING_MAP_GRANULARITY;
        assert!(num < self.map_elements_count);
        num
    }

    fn offset_from_addr(&self, addr: usize) -> u16 {
        let offset = (addr - self.start_addr) % CROSSING_MAP_GRANULARITY;
        debug_assert!(is_aligned(offset, 1 << OBJ_ALIGNMENT_LOG));
        (offset >> OBJ_ALIGNMENT_LOG) as u16
    }

    fn addr_from_offset(&self, map_num: usize, offset: u16) -> usize {
        self.start_addr
            + map_num * CROSSING_MAP_GRANULARITY
            + ((offset as usize) << OBJ_ALIGNMENT_LOG)
    }

    fn word<'a>(&self, state: &'a mut CrossingMapState, map_num: usize) -> &'a mut MapWord {
        let leaf = map_num / MAPS_IN_LEAF;
        let rel = map_num % MAPS_IN_LEAF;
        state.leaves[leaf]
            .as_deref_mut()
            .expect("crossing map used for memory it was never initialized for")
            .get_mut(rel)
            .unwrap()
    }

    /// Allocate zeroed leaves for every region intersecting the range.
    pub fn initialize_for_memory(&self, start_addr: usize, size: usize) {
        let mut state = self.state.lock();
        let first = self.leaf_num_from_addr(start_addr);
        let last = self.leaf_num_from_addr(start_addr + size - 1);
        for leaf in first..=last {
            assert!(state.leaves[leaf].is_none());
            state.leaves[leaf] =
                Some(vec![MapWord::new(); MAPS_IN_LEAF].into_boxed_slice());
        }
    }

    /// Drop the leaves covering the range.
    pub fn remove_for_memory(&self, start_addr: usize, size: usize) {
        let mut state = self.state.lock();
        let first = self.leaf_num_from_addr(start_addr);
        let last = self.leaf_num_from_addr(start_addr + size - 1);
        for leaf in first..=last {
            assert!(state.leaves[leaf].is_some());
            state.leaves[leaf] = None;
        }
    }

    fn leaf_num_from_addr(&self, addr: usize) -> usize {
        debug_assert!(addr >= self.start_addr);
        (addr - self.start_addr) / STATIC_ARRAY_GRANULARITY
    }

    /// Record a freshly allocated object.
    pub fn add_object(&self, obj_addr: usize, obj_size: usize) {
        debug_assert!(obj_size != 0);
        let mut state = self.state.lock();
        let first_map = self.map_num_from_addr(obj_addr);
        let obj_offset = self.offset_from_addr(obj_addr);
        let word = self.word(&mut state, first_map);
        match word.state() {
            MapState::Uninitialized => word.set_initialized(obj_offset),
            MapState::CrossedBorder => word.set_initialized_and_crossed_border(obj_offset),
            MapState::Initialized => {
                if word.offset() > obj_offset {
                    word.set_initialized(obj_offset);
                }
            }
            MapState::InitializedAndCrossedBorder => {
                if word.offset() > obj_offset {
                    word.set_initialized_and_crossed_border(obj_offset);
                }
            }
        }
        let final_map = self.map_num_from_addr(obj_addr + obj_size - 1);
        if final_map != first_map {
            self.update_crossed_border_on_adding(&mut state, first_map + 1, final_map);
        }
    }

    fn update_crossed_border_on_adding(
        &self,
        state: &mut CrossingMapState,
        first_crossed_map: usize,
        last_crossed_map: usize,
    ) {
        debug_assert!(last_crossed_map >= first_crossed_map);
        // Pages fully covered by the object. Once the offset saturates, the
        // chain walk just keeps stepping until a non-crossed word shows up.
        let mut map_offset: u16 = 1;
        for map_num in first_crossed_map..last_crossed_map {
            self.word(state, map_num).set_crossed_border(map_offset);
            if map_offset < MAX_OFFSET {
                map_offset += 1;
            }
        }
        let word = self.word(state, last_crossed_map);
        match word.state() {
            MapState::Uninitialized => word.set_crossed_border(map_offset),
            MapState::Initialized => {
                let offset = word.offset();
                word.set_initialized_and_crossed_border(offset);
            }
            state => panic!("crossing map corrupted: unexpected state {state:?} on add"),
        }
    }

    /// Remove an object. The map only knows first-starting objects, so the
    /// caller names the neighbours: `next_obj` is the next object (if any),
    /// `prev_obj`/`prev_size` the previous one, used to re-establish its
    /// crossed-border linkage.
    pub fn remove_object(
        &self,
        obj_addr: usize,
        obj_size: usize,
        next_obj: Option<usize>,
        prev_obj: Option<(usize, usize)>,
    ) {
        let mut state = self.state.lock();
        let first_map = self.map_num_from_addr(obj_addr);
        let obj_offset = self.offset_from_addr(obj_addr);
        let word = self.word(&mut state, first_map);
        debug_assert!(matches!(
            word.state(),
            MapState::Initialized | MapState::InitializedAndCrossedBorder
        ));
        let map_offset = word.offset();
        debug_assert!(map_offset <= obj_offset);
        if map_offset == obj_offset {
            word.set_uninitialized();
        }

        let final_map = self.map_num_from_addr(obj_addr + obj_size - 1);
        for map_num in first_map + 1..=final_map {
            self.word(&mut state, map_num).set_uninitialized();
        }

        if let Some(next_addr) = next_obj {
            let next_map = self.map_num_from_addr(next_addr);
            let next_offset = self.offset_from_addr(next_addr);
            let word = self.word(&mut state, next_map);
            if word.state() == MapState::Uninitialized {
                word.set_initialized(next_offset);
            }
        }

        if let Some((prev_addr, prev_size)) = prev_obj {
            let prev_last_map = self.map_num_from_addr(prev_addr + prev_size - 1);
            let prev_first_map = self.map_num_from_addr(prev_addr);
            if prev_last_map == first_map && prev_first_map != first_map {
                self.update_crossed_border_on_removing(&mut state, prev_last_map);
            }
        }
    }

    fn update_crossed_border_on_removing(&self, state: &mut CrossingMapState, crossed_map: usize) {
        let crossed_state = self.word(state, crossed_map).state();
        match crossed_state {
            MapState::Uninitialized => {
                // The removed object was the first in this page and nothing
                // else starts here; restore the chain by looking one page
                // back.
                assert!(crossed_map > 0);
                let prev_word = self.word(state, crossed_map - 1);
                let prev_state = prev_word.state();
                let prev_offset = prev_word.offset();
                let offset = match prev_state {
                    MapState::Initialized | MapState::InitializedAndCrossedBorder => 1,
                    MapState::CrossedBorder => {
                        if prev_offset < MAX_OFFSET {
                            prev_offset + 1
                        } else {
                            prev_offset
                        }
                    }
                    MapState::Uninitialized => {
                        panic!("crossing map corrupted: broken crossed-border chain")
                    }
                };
                self.word(state, crossed_map).set_crossed_border(offset);
            }
            MapState::Initialized => {
                let word = self.word(state, crossed_map);
                let offset = word.offset();
                word.set_initialized_and_crossed_border(offset);
            }
            state => panic!("crossing map corrupted: unexpected state {state:?} on remove"),
        }
    }

    /// First object starting in `[start_addr, end_addr]` (both inclusive),
    /// or the object crossing into the interval, or None.
    pub fn find_first_object(&self, start_addr: usize, end_addr: usize) -> Option<usize> {
        let mut state = self.state.lock();
        let first_map = self.map_num_from_addr(start_addr);
        let last_map = self.map_num_from_addr(end_addr);
        for map_num in first_map..=last_map {
            if let Some(addr) = self.find_obj_in_map(&mut state, map_num) {
                return Some(addr);
            }
        }
        None
    }

    fn find_obj_in_map(&self, state: &mut CrossingMapState, map_num: usize) -> Option<usize> {
        let word = *self.word(state, map_num);
        match word.state() {
            MapState::Uninitialized => None,
            MapState::Initialized => Some(self.addr_from_offset(map_num, word.offset())),
            MapState::InitializedAndCrossedBorder => {
                // An object crossing into this page starts before the first
                // object starting here; walk back to it.
                debug_assert!(map_num > 0);
                Some(self.walk_crossed_chain(state, map_num - 1))
            }
            MapState::CrossedBorder => {
                debug_assert!(map_num >= word.offset() as usize);
                Some(self.walk_crossed_chain(state, map_num - word.offset() as usize))
            }
        }
    }

    fn walk_crossed_chain(&self, state: &mut CrossingMapState, mut map_num: usize) -> usize {
        loop {
            let word = *self.word(state, map_num);
            if word.state() != MapState::CrossedBorder {
                debug_assert!(word.state() != MapState::Uninitialized);
                return self.addr_from_offset(map_num, word.offset());
            }
            debug_assert!(map_num >= word.offset() as usize);
            map_num -= word.offset() as usize;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::{SIZE_1K, SIZE_1M};

    const PAGE: usize = CROSSING_MAP_GRANULARITY;

    fn with_map(size: usize, f: impl FnOnce(&CrossingMap, usize)) {
        let mem = crate::mmap::map_anonymous_aligned(size, STATIC_ARRAY_GRANULARITY);
        assert!(!mem.is_null());
        let start = mem as usize;
        let map = CrossingMap::new(start, size);
        map.initialize_for_memory(start, size);
        f(&map, start);
        map.remove_for_memory(start, size);
        crate::mmap::unmap_raw(mem, size).unwrap();
    }

    #[test]
    fn one_small_object() {
        with_map(4 * SIZE_1M, |map, start| {
            let obj = start + 3 * PAGE;
            map.add_object(obj, 1);
            assert_eq!(map.find_first_object(obj, obj), Some(obj));
            assert_eq!(map.find_first_object(obj + PAGE, obj + PAGE), None);
            map.remove_object(obj, 1, None, None);
            assert_eq!(map.find_first_object(obj, obj), None);
        });
    }

    #[test]
    fn object_crossing_one_border() {
        with_map(4 * SIZE_1M, |map, start| {
            let obj = start + PAGE;
            let size = 2 * PAGE;
            map.add_object(obj, size);
            assert_eq!(map.find_first_object(obj, obj + size), Some(obj));
            assert_eq!(map.find_first_object(obj + PAGE, obj + size), Some(obj));
            map.remove_object(obj, size, None, None);
            assert_eq!(map.find_first_object(obj, obj + size), None);
            assert_eq!(map.find_first_object(obj + PAGE, obj + size), None);
        });
    }

    #[test]
    fn object_starting_at_last_byte_of_page() {
        with_map(SIZE_1M, |map, start| {
            // Begins in the first page's last alignment word and ends in
            // the next page.
            let obj = start + PAGE - crate::mem::DEFAULT_ALIGNMENT_IN_BYTES;
            map.add_object(obj, 2 * crate::mem::DEFAULT_ALIGNMENT_IN_BYTES);
            assert_eq!(map.find_first_object(obj, obj), Some(obj));
            // The second page is covered only by the crossing object.
            assert_eq!(map.find_first_object(start + PAGE, start + PAGE), Some(obj));
        });
    }

    #[test]
    fn huge_object_chain() {
        with_map(64 * SIZE_1M, |map, start| {
            let obj = start + 5 * PAGE;
            let size = 32 * SIZE_1M;
            map.add_object(obj, size);
            assert_eq!(map.find_first_object(obj, obj), Some(obj));
            let mut probe = SIZE_1M;
            while probe < size {
                let addr = obj + probe;
                assert_eq!(map.find_first_object(addr, addr), Some(obj));
                probe += SIZE_1M;
            }
            map.remove_object(obj, size, None, None);
            let mut probe = SIZE_1M;
            while probe < size {
                let addr = obj + probe;
                assert_eq!(map.find_first_object(addr, addr), None);
                probe += SIZE_1M;
            }
        });
    }

    #[test]
    fn two_objects_in_one_page() {
        with_map(SIZE_1M, |map, start| {
            let first = start + 2 * PAGE + 64;
            let second = start + 2 * PAGE + 512;
            map.add_object(second, 8);
            map.add_object(first, 8);
            assert_eq!(map.find_first_object(first, second), Some(first));
            map.remove_object(first, 8, Some(second), None);
            assert_eq!(map.find_first_object(first, second), Some(second));
        });
    }

    #[test]
    fn middle_object_removal_keeps_crossing_link() {
        with_map(16 * SIZE_1M, |map, start| {
            // Three sequential objects; the first spans many pages, the
            // second is small and sits in the page the first crosses into.
            let first = start + 8;
            let first_size = 4 * SIZE_1M;
            let second = first + first_size;
            let second_size = 8;
            let third = second + second_size;
            let third_size = SIZE_1K;
            map.add_object(first, first_size);
            map.add_object(second, second_size);
            map.add_object(third, third_size);

            // The page holding `second` is also covered by `first`.
            let probe = second;
            assert_eq!(map.find_first_object(probe, probe), Some(first));

            map.remove_object(second, second_size, Some(third), Some((first, first_size)));
            assert_eq!(map.find_first_object(probe, probe), Some(first));
        });
    }

    #[test]
    fn remove_object_restores_pre_add_state() {
        with_map(4 * SIZE_1M, |map, start| {
            let neighbour = start + 7 * PAGE + 128;
            map.add_object(neighbour, 16);
            let obj = start + 8 * PAGE + 256;
            map.add_object(obj, 3 * PAGE);
            map.remove_object(obj, 3 * PAGE, None, None);
            for page in 0..16 {
                let probe = start + page * PAGE;
                let found = map.find_first_object(probe, probe);
                if page == 7 {
                    assert_eq!(found, Some(neighbour));
                } else {
                    assert_eq!(found, None);
                }
            }
        });
    }
}
