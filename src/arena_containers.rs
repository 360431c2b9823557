//! Containers that live inside an arena allocator. Growth allocates a new
//! backing array from the arena and abandons the old one; nothing is ever
//! freed piecemeal, which is exactly the arena contract.

use std::marker::PhantomData;
use std::ptr::null_mut;

use crate::arena_allocator::ArenaAllocator;

/// A growable array whose storage comes from an [`ArenaAllocator`]. The
/// arena is passed into every growing operation rather than stored, so one
/// arena can back any number of containers.
pub struct ArenaVec<T> {
    data: *mut T,
    len: usize,
    cap: usize,
    _marker: PhantomData<T>,
}

impl<T> ArenaVec<T> {
    const DEFAULT_CAPACITY: usize = 4;

    pub const fn new() -> Self {
        Self {
            data: null_mut(),
            len: 0,
            cap: 0,
            _marker: PhantomData,
        }
    }

    pub fn with_capacity(arena: &mut ArenaAllocator, cap: usize) -> Self {
        let mut vec = Self::new();
        if cap != 0 {
            vec.data = arena.alloc_array::<T>(cap);
            assert!(!vec.data.is_null(), "arena exhausted");
            vec.cap = cap;
        }
        vec
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.cap
    }

    pub fn push(&mut self, arena: &mut ArenaAllocator, value: T) {
        if self.len == self.cap {
            self.grow(arena);
        }
        unsafe {
            self.data.add(self.len).write(value);
        }
        self.len += 1;
    }

    fn grow(&mut self, arena: &mut ArenaAllocator) {
        let new_cap = if self.cap == 0 {
            Self::DEFAULT_CAPACITY
        } else {
            self.cap * 2
        };
        let new_data = arena.alloc_array::<T>(new_cap);
        assert!(!new_data.is_null(), "arena exhausted");
        if self.len != 0 {
            unsafe {
                // The old array stays behind in the arena; stacked free only.
                std::ptr::copy_nonoverlapping(self.data, new_data, self.len);
            }
        }
        self.data = new_data;
        self.cap = new_cap;
    }

    pub fn pop(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        Some(unsafe { self.data.add(self.len).read() })
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<&T> {
        if index >= self.len {
            return None;
        }
        Some(unsafe { &*self.data.add(index) })
    }

    #[inline]
    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        if index >= self.len {
            return None;
        }
        Some(unsafe { &mut *self.data.add(index) })
    }

    pub fn as_slice(&self) -> &[T] {
        if self.len == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.data, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        if self.len == 0 {
            return &mut [];
        }
        unsafe { std::slice::from_raw_parts_mut(self.data, self.len) }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.as_slice().iter()
    }

    pub fn clear(&mut self) {
        unsafe {
            std::ptr::drop_in_place(self.as_mut_slice() as *mut [T]);
        }
        self.len = 0;
    }
}

impl<T> Default for ArenaVec<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::SIZE_1M;
    use crate::mem_config::MemConfig;
    use crate::pool_manager::{PoolManager, PoolSourceKind};
    use crate::space::SpaceType;

    fn arena() -> ArenaAllocator {
        let manager = PoolManager::new(
            PoolSourceKind::Mmap,
            &MemConfig::new(16 * SIZE_1M, 16 * SIZE_1M, 0, 0),
        );
        ArenaAllocator::new(manager, SpaceType::Internal)
    }

    #[test]
    fn push_pop_round_trip() {
        let mut arena = arena();
        let mut vec = ArenaVec::new();
        for i in 0..1000usize {
            vec.push(&mut arena, i);
        }
        assert_eq!(vec.len(), 1000);
        for (i, value) in vec.iter().enumerate() {
            assert_eq!(*value, i);
        }
        for i in (0..1000usize).rev() {
            assert_eq!(vec.pop(), Some(i));
        }
        assert!(vec.is_empty());
        assert!(vec.pop().is_none());
    }

    #[test]
    fn growth_preserves_contents() {
        let mut arena = arena();
        let mut vec = ArenaVec::with_capacity(&mut arena, 2);
        assert_eq!(vec.capacity(), 2);
        for i in 0..100u64 {
            vec.push(&mut arena, i * 3);
        }
        assert!(vec.capacity() >= 100);
        assert_eq!(vec.get(99), Some(&297));
        assert_eq!(vec.get(100), None);
        *vec.get_mut(0).unwrap() = 7;
        assert_eq!(vec.as_slice()[0], 7);
    }

    #[test]
    fn many_containers_share_one_arena() {
        let mut arena = arena();
        let mut a = ArenaVec::new();
        let mut b = ArenaVec::new();
        for i in 0..64usize {
            a.push(&mut arena, i);
            b.push(&mut arena, i * 2);
        }
        assert_eq!(a.as_slice().iter().sum::<usize>(), (0..64).sum());
        assert_eq!(b.as_slice().iter().sum::<usize>(), (0..64).map(|i| i * 2).sum());
    }
}
