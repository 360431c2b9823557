//! Lock shapes for the allocators. Every allocator is generic over a
//! [`LockConfig`]; the multi-threaded instantiation holds real parking_lot
//! raw locks, the single-threaded one holds zero-sized no-ops, so an ST
//! build pays nothing for synchronisation.
//!
//! The raw locks are taken and released manually around the unsafe
//! allocator internals instead of through RAII guards, since lock and
//! unlock frequently sit on different sides of raw-pointer surgery.

use parking_lot::lock_api::{RawMutex as RawMutexApi, RawRwLock as RawRwLockApi};
use parking_lot::{RawMutex, RawRwLock};

pub trait MutexKind: Send + Sync + Sized {
    const INIT: Self;
    fn lock(&self);
    fn unlock(&self);
}

pub trait RwLockKind: Send + Sync + Sized {
    const INIT: Self;
    fn read_lock(&self);
    fn read_unlock(&self);
    fn write_lock(&self);
    fn write_unlock(&self);
}

pub struct CommonMutex {
    raw: RawMutex,
}

impl MutexKind for CommonMutex {
    const INIT: Self = CommonMutex {
        raw: RawMutex::INIT,
    };

    #[inline]
    fn lock(&self) {
        self.raw.lock();
    }

    #[inline]
    fn unlock(&self) {
        unsafe { self.raw.unlock() }
    }
}

pub struct CommonRwLock {
    raw: RawRwLock,
}

impl RwLockKind for CommonRwLock {
    const INIT: Self = CommonRwLock {
        raw: RawRwLock::INIT,
    };

    #[inline]
    fn read_lock(&self) {
        self.raw.lock_shared();
    }

    #[inline]
    fn read_unlock(&self) {
        unsafe { self.raw.unlock_shared() }
    }

    #[inline]
    fn write_lock(&self) {
        self.raw.lock_exclusive();
    }

    #[inline]
    fn write_unlock(&self) {
        unsafe { self.raw.unlock_exclusive() }
    }
}

/// Zero-sized stand-in for single-threaded instantiations.
pub struct DummyLock;

impl MutexKind for DummyLock {
    const INIT: Self = DummyLock;

    #[inline(always)]
    fn lock(&self) {}

    #[inline(always)]
    fn unlock(&self) {}
}

impl RwLockKind for DummyLock {
    const INIT: Self = DummyLock;

    #[inline(always)]
    fn read_lock(&self) {}

    #[inline(always)]
    fn read_unlock(&self) {}

    #[inline(always)]
    fn write_lock(&self) {}

    #[inline(always)]
    fn write_unlock(&self) {}
}

/// Picks the lock types an allocator instantiates.
pub trait LockConfig: 'static {
    type AllocMutex: MutexKind;
    type AllocRwLock: RwLockKind;
}

/// Real locks for parallel mutators.
pub struct MtLockConfig;

impl LockConfig for MtLockConfig {
    type AllocMutex = CommonMutex;
    type AllocRwLock = CommonRwLock;
}

/// No-op locks for a single-threaded runtime.
pub struct StLockConfig;

impl LockConfig for StLockConfig {
    type AllocMutex = DummyLock;
    type AllocRwLock = DummyLock;
}

const _: () = assert!(core::mem::size_of::<DummyLock>() == 0);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_mutex_excludes() {
        let lock = CommonMutex::INIT;
        lock.lock();
        lock.unlock();
        lock.lock();
        lock.unlock();
    }

    #[test]
    fn rw_lock_allows_shared_readers() {
        let lock = CommonRwLock::INIT;
        lock.read_lock();
        lock.read_lock();
        lock.read_unlock();
        lock.read_unlock();
        lock.write_lock();
        lock.write_unlock();
    }
}
