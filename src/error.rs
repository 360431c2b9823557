//! Error kinds produced by the substrate. Routine allocation failure is a
//! null/None return inside the allocators; only the facades turn it into one
//! of these. Invariant violations (double free, bad reverse lookup, corrupt
//! crossing map) panic instead, because they mean the heap is corrupt.

use thiserror::Error;

use crate::space::SpaceType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// Allocation retries exhausted or the pool source cannot grow.
    /// Surfaced to the mutator as the language-level out-of-memory error.
    #[error("out of memory: {space} cannot satisfy {size} bytes")]
    OutOfMemory { space: SpaceType, size: usize },

    /// The pool source has no room for a pool of the requested size in the
    /// chosen space.
    #[error("pool exhausted: no room for a {size} byte pool in {space}")]
    PoolExhausted { space: SpaceType, size: usize },
}
