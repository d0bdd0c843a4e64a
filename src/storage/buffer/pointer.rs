//! Reference-counted handle to a pooled page buffer.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::memory::{DirectMemoryPool, PooledBuffer};
use crate::storage::page::PageKey;

pub type FrameReadGuard = ArcRwLockReadGuard<RawRwLock, PooledBuffer>;
pub type FrameWriteGuard = ArcRwLockWriteGuard<RawRwLock, PooledBuffer>;

/// Set once the last referrer is gone and the buffer went back to the pool.
const RELEASED: usize = 1 << (usize::BITS - 1);

/// A page buffer shared between the read cache and the write cache.
///
/// Each structure holding the pointer counts as one referrer. When the count
/// drops to zero the buffer is returned to the pool, exactly once; any later
/// use of the pointer is an `InvalidState` error.
pub struct CachePointer {
    key: PageKey,
    frame: Arc<RwLock<PooledBuffer>>,
    referrers: AtomicUsize,
    dirty: AtomicBool,
    pool: Arc<DirectMemoryPool>,
}

impl CachePointer {
    /// Wraps `buffer`, owned by one referrer: the caller.
    pub fn new(key: PageKey, buffer: PooledBuffer, pool: Arc<DirectMemoryPool>) -> Arc<Self> {
        Arc::new(Self {
            key,
            frame: Arc::new(RwLock::new(buffer)),
            referrers: AtomicUsize::new(1),
            dirty: AtomicBool::new(false),
            pool,
        })
    }

    pub fn key(&self) -> PageKey {
        self.key
    }

    pub fn referrers(&self) -> usize {
        self.referrers.load(Ordering::Acquire) & !RELEASED
    }

    pub fn is_released(&self) -> bool {
        self.referrers.load(Ordering::Acquire) & RELEASED != 0
    }

    fn released_error(&self) -> StorageError {
        StorageError::InvalidState(format!(
            "cache pointer of page {} used after its buffer was released",
            self.key
        ))
    }

    pub fn increment_referrer(&self) -> StorageResult<()> {
        self.referrers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n & RELEASED == 0).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| self.released_error())
    }

    /// Drops one referrer; the last one returns the buffer to the pool.
    pub fn decrement_referrer(&self) -> StorageResult<()> {
        let previous = self
            .referrers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| match n {
                0 => None,
                n if n & RELEASED != 0 => None,
                1 => Some(RELEASED),
                n => Some(n - 1),
            })
            .map_err(|_| self.released_error())?;

        if previous == 1 {
            let buffer = std::mem::replace(&mut *self.frame.write(), PooledBuffer::detached());
            self.pool.release(buffer)?;
        }
        Ok(())
    }

    /// Shared lock on the page bytes; blocks while a writer holds the page.
    pub fn read(&self) -> StorageResult<FrameReadGuard> {
        if self.is_released() {
            return Err(self.released_error());
        }
        Ok(self.frame.read_arc())
    }

    /// Exclusive lock on the page bytes; blocks until all holders let go.
    pub fn write(&self) -> StorageResult<FrameWriteGuard> {
        if self.is_released() {
            return Err(self.released_error());
        }
        Ok(self.frame.write_arc())
    }

    /// Shared lock if no writer holds the page right now.
    pub fn try_read(&self) -> StorageResult<Option<FrameReadGuard>> {
        if self.is_released() {
            return Err(self.released_error());
        }
        Ok(self.frame.try_read_arc())
    }

    /// Blocks until no writer holds the page.
    pub fn wait_for_writers(&self) {
        drop(self.frame.read());
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub(crate) fn set_dirty(&self, dirty: bool) {
        self.dirty.store(dirty, Ordering::Release);
    }
}

impl std::fmt::Debug for CachePointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachePointer")
            .field("key", &self.key)
            .field("referrers", &self.referrers())
            .field("released", &self.is_released())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}
