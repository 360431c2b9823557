//! Byte budgets for every space, fixed at runtime start. The config is a
//! plain value threaded into the pool source; nothing mutates it afterwards.

use crate::mem::MAX_HEAP_SIZE;

#[derive(Debug, Clone, Copy)]
pub struct MemConfig {
    object_pool_size: usize,
    internal_pool_size: usize,
    compiler_pool_size: usize,
    code_pool_size: usize,
}

impl MemConfig {
    pub fn new(
        object_pool_size: usize,
        internal_pool_size: usize,
        compiler_pool_size: usize,
        code_pool_size: usize,
    ) -> Self {
        assert!(
            object_pool_size as u64 <= MAX_HEAP_SIZE,
            "object pool budget {} exceeds the {} byte heap window",
            object_pool_size,
            MAX_HEAP_SIZE
        );
        Self {
            object_pool_size,
            internal_pool_size,
            compiler_pool_size,
            code_pool_size,
        }
    }

    #[inline]
    pub fn object_pool_size(&self) -> usize {
        self.object_pool_size
    }

    #[inline]
    pub fn internal_pool_size(&self) -> usize {
        self.internal_pool_size
    }

    #[inline]
    pub fn compiler_pool_size(&self) -> usize {
        self.compiler_pool_size
    }

    #[inline]
    pub fn code_pool_size(&self) -> usize {
        self.code_pool_size
    }
}
