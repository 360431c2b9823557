//! Semantic memory partitions. Every pool and every allocator belongs to
//! exactly one space; the heap spaces are the ones the GC walks.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SpaceType {
    Undefined = 0,
    Object,
    HumongousObject,
    NonMovableObject,
    Internal,
    Code,
    Compiler,
}

impl SpaceType {
    pub const COUNT: usize = 7;

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Spaces whose memory holds managed objects and is subject to GC.
    #[inline]
    pub const fn is_heap_space(self) -> bool {
        matches!(
            self,
            SpaceType::Object | SpaceType::HumongousObject | SpaceType::NonMovableObject
        )
    }

    #[inline]
    pub const fn is_runtime_space(self) -> bool {
        matches!(
            self,
            SpaceType::Internal | SpaceType::Code | SpaceType::Compiler
        )
    }
}

impl fmt::Display for SpaceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SpaceType::Undefined => "space-undefined",
            SpaceType::Object => "space-object",
            SpaceType::HumongousObject => "space-humongous-object",
            SpaceType::NonMovableObject => "space-non-movable-object",
            SpaceType::Internal => "space-internal",
            SpaceType::Code => "space-code",
            SpaceType::Compiler => "space-compiler",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heap_space_predicate() {
        assert!(SpaceType::Object.is_heap_space());
        assert!(SpaceType::HumongousObject.is_heap_space());
        assert!(SpaceType::NonMovableObject.is_heap_space());
        assert!(!SpaceType::Internal.is_heap_space());
        assert!(!SpaceType::Code.is_heap_space());
        assert!(!SpaceType::Compiler.is_heap_space());
        assert!(SpaceType::Compiler.is_runtime_space());
    }
}
