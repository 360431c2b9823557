//! Top-level entry point of the substrate: object allocation with the
//! GC-retry slow path, TLAB lifecycle, frame allocation, and the code and
//! internal allocators, all behind one facade the runtime talks to.

use std::cell::Cell;
use std::ptr::null_mut;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::arena_allocator::ArenaAllocator;
use crate::error::AllocError;
use crate::frame_allocator::FrameAllocator;
use crate::internal_allocator::InternalAllocator;
use crate::lock_config::{LockConfig, MtLockConfig};
use crate::mem::{Alignment, DEFAULT_ALIGNMENT};
use crate::mem_config::MemConfig;
use crate::mem_stats::MemStats;
use crate::object_allocator::{
    GcCollectMode, ObjectAllocatorGen, ObjectAllocatorNoGen, DEFAULT_YOUNG_SPACE_SIZE,
};
use crate::mem::ObjectStatus;
use crate::object_header::ObjectHeader;
use crate::pool_manager::PoolManager;
use crate::space::SpaceType;
use crate::tlab::{TLAB, TLAB_MAX_ALLOC_SIZE};

pub const DEFAULT_TARGET_UTILIZATION: f32 = 0.5;
const ALLOC_RETRIES_BEFORE_OOM: usize = 4;

/// Why the heap manager is invoking the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcCause {
    Young,
    Oom,
}

/// The collector as the heap manager sees it. The slow allocation path may
/// suspend the calling thread inside `run_gc`; the handler is expected to
/// cooperate with the runtime's thread states on its own.
pub trait GcHandler: Send + Sync {
    /// Polled at every allocation; `trigger` runs when it says so.
    fn should_trigger(&self) -> bool {
        false
    }

    fn trigger(&self) {}

    /// Run a collection for `cause` and return the number of reclaimed
    /// bytes.
    fn run_gc(&self, cause: GcCause) -> usize;

    /// Stamp collector bits into a freshly allocated header, before the
    /// class word is published.
    fn init_gc_bits(&self, _obj: *mut ObjectHeader) {}
}

/// Collector stub for runtimes (and tests) without GC wired up.
pub struct NoopGcHandler;

impl GcHandler for NoopGcHandler {
    fn run_gc(&self, _cause: GcCause) -> usize {
        0
    }
}

/// Which heap configuration to build.
pub enum HeapKind {
    NonGenerational,
    Generational {
        young_space_size: usize,
        tlabs_max_count: usize,
    },
}

impl HeapKind {
    pub fn generational() -> Self {
        HeapKind::Generational {
            young_space_size: DEFAULT_YOUNG_SPACE_SIZE,
            tlabs_max_count: 1024,
        }
    }
}

enum ObjectAllocators<L: LockConfig> {
    NoGen(ObjectAllocatorNoGen<L>),
    Gen(ObjectAllocatorGen<L>),
}

/// Per-mutator-thread allocation state. Owned by the scheduler, handed
/// into every allocation by reference; the current TLAB lives here.
pub struct MutatorContext {
    tlab: Cell<*mut TLAB>,
}

impl MutatorContext {
    pub fn new() -> Self {
        Self {
            tlab: Cell::new(null_mut()),
        }
    }

    #[inline]
    pub fn tlab(&self) -> *mut TLAB {
        self.tlab.get()
    }

    fn set_tlab(&self, tlab: *mut TLAB) {
        self.tlab.set(tlab);
    }
}

impl Default for MutatorContext {
    fn default() -> Self {
        Self::new()
    }
}

pub struct HeapManager<L: LockConfig = MtLockConfig> {
    object_allocator: ObjectAllocators<L>,
    internal_allocator: InternalAllocator<L>,
    code_allocator: Mutex<ArenaAllocator>,
    frame_allocator: Mutex<FrameAllocator>,
    gc: Box<dyn GcHandler>,
    use_tlab_for_allocations: bool,
    target_utilization: AtomicU32,
    is_object_finalizable: Option<fn(class_word: u32) -> bool>,
    register_finalize_reference: Option<fn(obj: *mut ObjectHeader, class_word: u32)>,
    // Notification hook fired once per successfully allocated object.
    alloc_event_listener: Option<Box<dyn Fn(*mut ObjectHeader) + Send + Sync>>,
    max_memory: usize,
    stats: Arc<MemStats>,
    pool_manager: Arc<PoolManager>,
}

impl<L: LockConfig> HeapManager<L> {
    pub fn new(
        pool_manager: Arc<PoolManager>,
        config: &MemConfig,
        kind: HeapKind,
        use_tlab: bool,
        gc: Box<dyn GcHandler>,
        create_pygote_space: bool,
    ) -> Self {
        let stats = Arc::new(MemStats::new());
        let object_allocator = match kind {
            HeapKind::NonGenerational => ObjectAllocators::NoGen(ObjectAllocatorNoGen::new(
                pool_manager.clone(),
                stats.clone(),
                create_pygote_space,
            )),
            HeapKind::Generational {
                young_space_size,
                tlabs_max_count,
            } => ObjectAllocators::Gen(ObjectAllocatorGen::new(
                pool_manager.clone(),
                stats.clone(),
                young_space_size,
                tlabs_max_count,
                create_pygote_space,
            )),
        };
        Self {
            object_allocator,
            internal_allocator: InternalAllocator::new(pool_manager.clone(), stats.clone()),
            code_allocator: Mutex::new(ArenaAllocator::with_alloc_size_limited_by_pool(
                pool_manager.clone(),
                SpaceType::Code,
            )),
            frame_allocator: Mutex::new(FrameAllocator::new(pool_manager.clone())),
            gc,
            use_tlab_for_allocations: use_tlab,
            target_utilization: AtomicU32::new(DEFAULT_TARGET_UTILIZATION.to_bits()),
            is_object_finalizable: None,
            register_finalize_reference: None,
            alloc_event_listener: None,
            max_memory: config.object_pool_size(),
            stats,
            pool_manager,
        }
    }

    /// Allocate and initialise a managed object. `size` covers the header.
    /// The slow path runs the GC up to four times before reporting OOM;
    /// any reclaim resets the retry budget.
    pub fn allocate_object(
        &self,
        class_word: u32,
        size: usize,
        align: Alignment,
        thread: Option<&MutatorContext>,
    ) -> Result<*mut ObjectHeader, AllocError> {
        if self.gc.should_trigger() {
            self.gc.trigger();
        }
        let mut mem = self.try_allocate_object(size, align, thread);
        if mem.is_null() {
            mem = self.allocate_with_gc_retries(size, || {
                self.try_allocate_object(size, align, thread)
            })?;
        }
        Ok(self.initialize_object(mem, class_word, size))
    }

    fn try_allocate_object(
        &self,
        size: usize,
        align: Alignment,
        thread: Option<&MutatorContext>,
    ) -> *mut u8 {
        if self.use_tlab_for_allocations && size <= self.tlab_max_alloc_size() {
            if let Some(ctx) = thread {
                let tlab = ctx.tlab();
                if !tlab.is_null() {
                    let mem = unsafe { (*tlab).alloc(size) };
                    if !mem.is_null() {
                        return mem;
                    }
                }
                // Retired TLAB; install a fresh one and retry once.
                if self.create_new_tlab(ctx) {
                    let mem = unsafe { (*ctx.tlab()).alloc(size) };
                    if !mem.is_null() {
                        return mem;
                    }
                }
            }
        }
        match &self.object_allocator {
            ObjectAllocators::NoGen(alloc) => alloc.allocate(size, align),
            ObjectAllocators::Gen(alloc) => alloc.allocate(size, align),
        }
    }

    /// Same retry-and-throw skeleton, routed to the non-movable tier.
    pub fn allocate_non_movable_object(
        &self,
        class_word: u32,
        size: usize,
        align: Alignment,
    ) -> Result<*mut ObjectHeader, AllocError> {
        if self.gc.should_trigger() {
            self.gc.trigger();
        }
        let mut mem = match &self.object_allocator {
            ObjectAllocators::NoGen(alloc) => alloc.allocate_non_movable(size, align),
            ObjectAllocators::Gen(alloc) => alloc.allocate_non_movable(size, align),
        };
        if mem.is_null() {
            mem = self.allocate_with_gc_retries(size, || match &self.object_allocator {
                ObjectAllocators::NoGen(alloc) => alloc.allocate_non_movable(size, align),
                ObjectAllocators::Gen(alloc) => alloc.allocate_non_movable(size, align),
            })?;
        }
        Ok(self.initialize_object(mem, class_word, size))
    }

    fn allocate_with_gc_retries(
        &self,
        size: usize,
        retry: impl Fn() -> *mut u8,
    ) -> Result<*mut u8, AllocError> {
        let is_gen = matches!(self.object_allocator, ObjectAllocators::Gen(_));
        let mut attempt = 0;
        while attempt < ALLOC_RETRIES_BEFORE_OOM {
            let cause = if !is_gen || attempt == ALLOC_RETRIES_BEFORE_OOM - 1 {
                GcCause::Oom
            } else {
                GcCause::Young
            };
            debug!(target: "gc", ?cause, attempt, "allocation slow path");
            let reclaimed = self.gc.run_gc(cause);
            let mem = retry();
            if !mem.is_null() {
                return Ok(mem);
            }
            if reclaimed > 0 {
                // The collector is still making progress; keep trying.
                attempt = 0;
            } else {
                attempt += 1;
            }
        }
        error!(target: "alloc", size, "allocation retries exhausted");
        Err(AllocError::OutOfMemory {
            space: SpaceType::Object,
            size,
        })
    }

    fn initialize_object(&self, mem: *mut u8, class_word: u32, size: usize) -> *mut ObjectHeader {
        let header = mem as *mut ObjectHeader;
        unsafe {
            // GC bits first; the class word publishes the object, and a
            // concurrent sweeper skips anything with a zero class word.
            (*header).zero();
            self.gc.init_gc_bits(header);
            (*header).set_size(size);
            if let Some(is_finalizable) = self.is_object_finalizable {
                if is_finalizable(class_word) {
                    if let Some(register) = self.register_finalize_reference {
                        register(header, class_word);
                    }
                }
            }
            (*header).set_class_word(class_word);
        }
        if let Some(listener) = &self.alloc_event_listener {
            listener(header);
        }
        header
    }

    /// Interpreter frame memory; LIFO within one heap manager.
    pub fn allocate_frame(&self, size: usize) -> Result<*mut u8, AllocError> {
        let mem = self.frame_allocator.lock().alloc(size);
        if !mem.is_null() {
            return Ok(mem);
        }
        self.allocate_with_gc_retries(size, || self.frame_allocator.lock().alloc(size))
    }

    pub fn free_frame(&self, mem: *mut u8) {
        self.frame_allocator.lock().free(mem);
    }

    pub fn frame_allocator_contains(&self, mem: *const u8) -> bool {
        self.frame_allocator.lock().contains(mem)
    }

    /// Compiled code bytes live in the code space until teardown.
    pub fn allocate_code(&self, code: &[u8]) -> *mut u8 {
        let mut allocator = self.code_allocator.lock();
        let mem = allocator.alloc(code.len(), DEFAULT_ALIGNMENT);
        if !mem.is_null() {
            unsafe {
                std::ptr::copy_nonoverlapping(code.as_ptr(), mem, code.len());
            }
        }
        mem
    }

    pub fn use_tlab_for_allocations(&self) -> bool {
        self.use_tlab_for_allocations
    }

    pub fn tlab_max_alloc_size(&self) -> usize {
        match &self.object_allocator {
            ObjectAllocators::NoGen(_) => 0,
            ObjectAllocators::Gen(_) => TLAB_MAX_ALLOC_SIZE,
        }
    }

    /// Fetch a fresh TLAB for the thread, linking it behind the retired
    /// one. The compiled-code fast path picks the new buffer up through
    /// the thread context.
    pub fn create_new_tlab(&self, thread: &MutatorContext) -> bool {
        let tlab = match &self.object_allocator {
            ObjectAllocators::NoGen(alloc) => alloc.create_new_tlab(),
            ObjectAllocators::Gen(alloc) => alloc.create_new_tlab(),
        };
        if tlab.is_null() {
            return false;
        }
        self.register_tlab(thread, tlab);
        true
    }

    fn register_tlab(&self, thread: &MutatorContext, tlab: *mut TLAB) {
        let old = thread.tlab();
        if !old.is_null() {
            unsafe {
                (*old).set_next_tlab(tlab);
                (*tlab).set_prev_tlab(old);
            }
        }
        thread.set_tlab(tlab);
    }

    pub fn target_heap_utilization(&self) -> f32 {
        f32::from_bits(self.target_utilization.load(Ordering::Relaxed))
    }

    pub fn set_target_heap_utilization(&self, target: f32) {
        debug_assert!(target > 0.0 && target <= 1.0);
        self.target_utilization
            .store(target.to_bits(), Ordering::Relaxed);
    }

    pub fn set_is_object_finalizable_func(&mut self, func: fn(u32) -> bool) {
        self.is_object_finalizable = Some(func);
    }

    pub fn set_register_finalize_reference_func(&mut self, func: fn(*mut ObjectHeader, u32)) {
        self.register_finalize_reference = Some(func);
    }

    pub fn set_alloc_event_listener(&mut self, listener: Box<dyn Fn(*mut ObjectHeader) + Send + Sync>) {
        self.alloc_event_listener = Some(listener);
    }

    pub fn max_memory(&self) -> usize {
        self.max_memory
    }

    pub fn total_memory(&self) -> usize {
        (self.stats.footprint(SpaceType::Object)
            + self.stats.footprint(SpaceType::HumongousObject)
            + self.stats.footprint(SpaceType::NonMovableObject)) as usize
    }

    pub fn free_memory(&self) -> usize {
        self.max_memory.saturating_sub(self.total_memory())
    }

    pub fn stats(&self) -> &Arc<MemStats> {
        &self.stats
    }

    pub fn internal_allocator(&self) -> &InternalAllocator<L> {
        &self.internal_allocator
    }

    pub fn pool_manager(&self) -> &Arc<PoolManager> {
        &self.pool_manager
    }

    pub fn object_allocator_gen(&self) -> Option<&ObjectAllocatorGen<L>> {
        match &self.object_allocator {
            ObjectAllocators::Gen(alloc) => Some(alloc),
            ObjectAllocators::NoGen(_) => None,
        }
    }

    pub fn object_allocator_no_gen(&self) -> Option<&ObjectAllocatorNoGen<L>> {
        match &self.object_allocator {
            ObjectAllocators::NoGen(alloc) => Some(alloc),
            ObjectAllocators::Gen(_) => None,
        }
    }

    pub fn contain_object(&self, obj: *const ObjectHeader) -> bool {
        match &self.object_allocator {
            ObjectAllocators::NoGen(alloc) => alloc.contain_object(obj),
            ObjectAllocators::Gen(alloc) => alloc.contain_object(obj),
        }
    }

    pub fn is_live_object(&self, obj: *const ObjectHeader) -> bool {
        match &self.object_allocator {
            ObjectAllocators::NoGen(alloc) => alloc.is_live(obj),
            ObjectAllocators::Gen(alloc) => alloc.is_live(obj),
        }
    }

    pub fn iterate_over_objects(&self, visitor: impl FnMut(*mut ObjectHeader)) {
        match &self.object_allocator {
            ObjectAllocators::NoGen(alloc) => alloc.iterate_over_objects(visitor),
            ObjectAllocators::Gen(alloc) => alloc.iterate_over_objects(visitor),
        }
    }

    pub fn collect(
        &self,
        death_checker: &mut dyn FnMut(*mut ObjectHeader) -> ObjectStatus,
        mode: GcCollectMode,
    ) {
        match &self.object_allocator {
            ObjectAllocators::NoGen(alloc) => alloc.collect(death_checker, mode),
            ObjectAllocators::Gen(alloc) => alloc.collect(death_checker, mode),
        }
    }

    /// Walk every allocator's self-checks; returns the failure count.
    pub fn verify_heap(&self) -> usize {
        match &self.object_allocator {
            ObjectAllocators::NoGen(alloc) => alloc.verify_allocator(),
            ObjectAllocators::Gen(alloc) => alloc.verify_allocator(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock_config::StLockConfig;
    use crate::mem::SIZE_1M;
    use crate::pool_manager::PoolSourceKind;
    use std::sync::atomic::AtomicUsize;

    const CLASS_WORD: u32 = 0x1701;

    // RUST_LOG=mempool=debug,alloc=debug shows the allocator activity.
    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    }

    fn heap(kind: HeapKind, use_tlab: bool, gc: Box<dyn GcHandler>) -> HeapManager<StLockConfig> {
        init_tracing();
        let config = MemConfig::new(64 * SIZE_1M, 64 * SIZE_1M, 8 * SIZE_1M, 8 * SIZE_1M);
        let manager = PoolManager::new(PoolSourceKind::Mmap, &config);
        HeapManager::new(manager, &config, kind, use_tlab, gc, false)
    }

    #[test]
    fn object_allocation_initialises_header() {
        let heap = heap(HeapKind::generational(), false, Box::new(NoopGcHandler));
        let obj = heap
            .allocate_object(CLASS_WORD, 48, DEFAULT_ALIGNMENT, None)
            .unwrap();
        unsafe {
            assert_eq!((*obj).class_word(), CLASS_WORD);
            assert_eq!((*obj).size(), 48);
            assert!((*obj).is_initialized());
        }
        assert!(heap.contain_object(obj));
        assert!(heap.is_live_object(obj));
    }

    #[test]
    fn tlab_fast_path_serves_small_objects() {
        let heap = heap(HeapKind::generational(), true, Box::new(NoopGcHandler));
        let ctx = MutatorContext::new();
        let first = heap
            .allocate_object(CLASS_WORD, 64, DEFAULT_ALIGNMENT, Some(&ctx))
            .unwrap();
        assert!(!ctx.tlab().is_null());
        let second = heap
            .allocate_object(CLASS_WORD, 64, DEFAULT_ALIGNMENT, Some(&ctx))
            .unwrap();
        // Both bumped out of the same TLAB.
        assert_eq!(second as usize, first as usize + 64);
        let gen = heap.object_allocator_gen().unwrap();
        assert!(gen.is_address_in_young_space(first as usize));
    }

    #[test]
    fn tlab_overflow_installs_a_new_one() {
        let heap = heap(HeapKind::generational(), true, Box::new(NoopGcHandler));
        let ctx = MutatorContext::new();
        assert!(heap.create_new_tlab(&ctx));
        let first_tlab = ctx.tlab();
        // Fill the TLAB to its end.
        loop {
            let mem = unsafe { (*first_tlab).alloc(1024) };
            if mem.is_null() {
                break;
            }
        }
        let obj = heap
            .allocate_object(CLASS_WORD, 1024, DEFAULT_ALIGNMENT, Some(&ctx))
            .unwrap();
        assert!(!obj.is_null());
        assert_ne!(ctx.tlab(), first_tlab);
        unsafe {
            assert_eq!((*ctx.tlab()).prev_tlab(), first_tlab);
            assert_eq!((*first_tlab).next_tlab(), ctx.tlab());
        }
    }

    #[test]
    fn oom_after_exhausted_retries() {
        struct CountingGc(AtomicUsize);
        impl GcHandler for CountingGc {
            fn run_gc(&self, _cause: GcCause) -> usize {
                self.0.fetch_add(1, Ordering::Relaxed);
                0
            }
        }
        let config = MemConfig::new(4 * SIZE_1M, 16 * SIZE_1M, 0, 0);
        let manager = PoolManager::new(PoolSourceKind::Mmap, &config);
        let heap: HeapManager<StLockConfig> = HeapManager::new(
            manager,
            &config,
            HeapKind::NonGenerational,
            false,
            Box::new(CountingGc(AtomicUsize::new(0))),
            false,
        );
        // Two humongous objects exhaust the 4 MiB window.
        let first = heap.allocate_object(CLASS_WORD, 2 * SIZE_1M, DEFAULT_ALIGNMENT, None);
        assert!(first.is_ok());
        let second = heap.allocate_object(CLASS_WORD, 16 * SIZE_1M, DEFAULT_ALIGNMENT, None);
        assert_eq!(
            second.unwrap_err(),
            AllocError::OutOfMemory {
                space: SpaceType::Object,
                size: 16 * SIZE_1M,
            }
        );
    }

    #[test]
    fn gc_cause_escalates_to_oom() {
        struct CauseRecorder(Mutex<Vec<GcCause>>);
        impl GcHandler for CauseRecorder {
            fn run_gc(&self, cause: GcCause) -> usize {
                self.0.lock().push(cause);
                0
            }
        }
        let config = MemConfig::new(4 * SIZE_1M, 16 * SIZE_1M, 0, 0);
        let manager = PoolManager::new(PoolSourceKind::Mmap, &config);
        let gc = Box::new(CauseRecorder(Mutex::new(Vec::new())));
        let gc_ref: *const CauseRecorder = &*gc;
        let heap: HeapManager<StLockConfig> = HeapManager::new(
            manager,
            &config,
            HeapKind::Generational {
                young_space_size: SIZE_1M,
                tlabs_max_count: 4,
            },
            false,
            gc,
            false,
        );
        let result = heap.allocate_object(CLASS_WORD, 8 * SIZE_1M, DEFAULT_ALIGNMENT, None);
        assert!(result.is_err());
        let causes = unsafe { (*gc_ref).0.lock().clone() };
        assert_eq!(
            causes,
            vec![GcCause::Young, GcCause::Young, GcCause::Young, GcCause::Oom]
        );
    }

    #[test]
    fn finalizable_objects_are_registered() {
        use std::sync::atomic::AtomicUsize;
        static REGISTERED: AtomicUsize = AtomicUsize::new(0);
        let mut heap = heap(HeapKind::NonGenerational, false, Box::new(NoopGcHandler));
        heap.set_is_object_finalizable_func(|class_word| class_word == CLASS_WORD);
        heap.set_register_finalize_reference_func(|_, _| {
            REGISTERED.fetch_add(1, Ordering::Relaxed);
        });
        heap.allocate_object(CLASS_WORD, 32, DEFAULT_ALIGNMENT, None)
            .unwrap();
        heap.allocate_object(0x99, 32, DEFAULT_ALIGNMENT, None).unwrap();
        assert_eq!(REGISTERED.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn frame_allocation_round_trip() {
        let heap = heap(HeapKind::NonGenerational, false, Box::new(NoopGcHandler));
        let frame = heap.allocate_frame(512).unwrap();
        assert!(heap.frame_allocator_contains(frame));
        heap.free_frame(frame);
        assert!(!heap.frame_allocator_contains(frame));
    }

    #[test]
    fn code_allocation_copies_bytes() {
        let heap = heap(HeapKind::NonGenerational, false, Box::new(NoopGcHandler));
        let code = [0x55u8, 0x48, 0x89, 0xe5, 0xc3];
        let mem = heap.allocate_code(&code);
        assert!(!mem.is_null());
        unsafe {
            for (i, byte) in code.iter().enumerate() {
                assert_eq!(mem.add(i).read(), *byte);
            }
        }
    }

    #[test]
    fn target_utilization_setting() {
        let heap = heap(HeapKind::NonGenerational, false, Box::new(NoopGcHandler));
        assert_eq!(heap.target_heap_utilization(), DEFAULT_TARGET_UTILIZATION);
        heap.set_target_heap_utilization(0.75);
        assert_eq!(heap.target_heap_utilization(), 0.75);
    }

    #[test]
    fn memory_accounting() {
        let heap = heap(HeapKind::NonGenerational, false, Box::new(NoopGcHandler));
        assert_eq!(heap.max_memory(), 64 * SIZE_1M);
        let before = heap.total_memory();
        heap.allocate_object(CLASS_WORD, 1000, DEFAULT_ALIGNMENT, None)
            .unwrap();
        assert!(heap.total_memory() > before);
        assert!(heap.free_memory() < heap.max_memory());
    }
}
