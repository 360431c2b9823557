//! Minimal managed-object header. The class linker owns the real layout;
//! the substrate only relies on three things: the header is two words, a
//! zero class word means "not yet initialised" (a concurrent sweeper must
//! skip the slot), and the aligned object size is readable from the header
//! so the bump/TLAB spaces can walk objects linearly.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::mem::aligned_object_size;

const SIZE_SHIFT: u64 = 16;
const GC_BITS_MASK: u64 = 0xff;

#[repr(C)]
pub struct ObjectHeader {
    /// Aligned object size in the high bits, GC colour bits in the low byte.
    pub flags: AtomicU64,
    /// Compressed class pointer. Zero until the object is published.
    pub class_word: AtomicU32,
    pub padding: u32,
}

impl ObjectHeader {
    /// Reset a freshly allocated header slot. Must happen before the class
    /// word is published.
    pub fn zero(&self) {
        self.flags.store(0, Ordering::Relaxed);
        self.class_word.store(0, Ordering::Relaxed);
    }

    #[inline]
    pub fn size(&self) -> usize {
        (self.flags.load(Ordering::Relaxed) >> SIZE_SHIFT) as usize
    }

    #[inline]
    pub fn set_size(&self, size: usize) {
        let size = aligned_object_size(size) as u64;
        let old = self.flags.load(Ordering::Relaxed);
        self.flags
            .store((old & GC_BITS_MASK) | (size << SIZE_SHIFT), Ordering::Relaxed);
    }

    #[inline]
    pub fn gc_bits(&self) -> u8 {
        (self.flags.load(Ordering::Relaxed) & GC_BITS_MASK) as u8
    }

    #[inline]
    pub fn set_gc_bits(&self, bits: u8) {
        let old = self.flags.load(Ordering::Relaxed);
        self.flags
            .store((old & !GC_BITS_MASK) | bits as u64, Ordering::Relaxed);
    }

    /// Publishing store: everything written into the object so far must be
    /// visible before a concurrent sweeper can observe the class word.
    #[inline]
    pub fn set_class_word(&self, class_word: u32) {
        debug_assert!(class_word != 0);
        self.class_word.store(class_word, Ordering::Release);
    }

    #[inline]
    pub fn class_word(&self) -> u32 {
        self.class_word.load(Ordering::Acquire)
    }

    /// A zero class word is the sweeper's signal to skip the slot.
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.class_word() != 0
    }

    #[inline]
    pub fn payload(&self) -> *mut u8 {
        unsafe { (self as *const Self as *mut u8).add(core::mem::size_of::<Self>()) }
    }
}

const _: () = assert!(core::mem::size_of::<ObjectHeader>() == 16);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = ObjectHeader {
            flags: AtomicU64::new(0),
            class_word: AtomicU32::new(0),
            padding: 0,
        };
        assert!(!header.is_initialized());
        header.set_size(100);
        header.set_gc_bits(0b11);
        assert_eq!(header.size(), 104); // aligned up to 8
        assert_eq!(header.gc_bits(), 0b11);
        header.set_class_word(42);
        assert!(header.is_initialized());
        assert_eq!(header.size(), 104);
    }
}
