//! Per-space allocation statistics. Every allocator reports raw alloc/free
//! events here; the heap manager reads the totals back for its
//! memory-pressure heuristics and for diagnostics dumps.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::space::SpaceType;

#[derive(Default)]
pub struct MemStats {
    allocated: [AtomicU64; SpaceType::COUNT],
    freed: [AtomicU64; SpaceType::COUNT],
}

impl MemStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_allocate_raw(&self, size: usize, space: SpaceType) {
        self.allocated[space.index()].fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn record_free_raw(&self, size: usize, space: SpaceType) {
        self.freed[space.index()].fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn allocated(&self, space: SpaceType) -> u64 {
        self.allocated[space.index()].load(Ordering::Relaxed)
    }

    pub fn freed(&self, space: SpaceType) -> u64 {
        self.freed[space.index()].load(Ordering::Relaxed)
    }

    /// Bytes currently attributed to `space`.
    pub fn footprint(&self, space: SpaceType) -> u64 {
        self.allocated(space).saturating_sub(self.freed(space))
    }

    pub fn total_footprint(&self) -> u64 {
        let mut total = 0;
        for i in 0..SpaceType::COUNT {
            total += self.allocated[i].load(Ordering::Relaxed);
            total = total.saturating_sub(self.freed[i].load(Ordering::Relaxed));
        }
        total
    }
}

struct FormattedSize(u64);

impl fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ksize = self.0 as f64 / 1024f64;
        if ksize < 1f64 {
            return write!(f, "{}B", self.0);
        }
        let msize = ksize / 1024f64;
        if msize < 1f64 {
            return write!(f, "{:.1}K", ksize);
        }
        write!(f, "{:.1}M", msize)
    }
}

impl fmt::Display for MemStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Memory statistics:")?;
        for space in [
            SpaceType::Object,
            SpaceType::HumongousObject,
            SpaceType::NonMovableObject,
            SpaceType::Internal,
            SpaceType::Code,
            SpaceType::Compiler,
        ] {
            writeln!(
                f,
                "  {}: allocated {}, freed {}",
                space,
                FormattedSize(self.allocated(space)),
                FormattedSize(self.freed(space))
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn footprint_tracks_alloc_and_free() {
        let stats = MemStats::new();
        stats.record_allocate_raw(4096, SpaceType::Object);
        stats.record_allocate_raw(1024, SpaceType::Object);
        stats.record_free_raw(1024, SpaceType::Object);
        assert_eq!(stats.allocated(SpaceType::Object), 5120);
        assert_eq!(stats.freed(SpaceType::Object), 1024);
        assert_eq!(stats.footprint(SpaceType::Object), 4096);
        assert_eq!(stats.footprint(SpaceType::Internal), 0);
    }
}
