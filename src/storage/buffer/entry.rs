use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use super::pointer::CachePointer;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::PageKey;

/// A page resident in the read cache.
///
/// `usage` counts the guards currently handed out; the entry may only be
/// evicted while it is zero.
#[derive(Debug)]
pub struct CacheEntry {
    key: PageKey,
    pointer: Arc<CachePointer>,
    usage: AtomicU32,
}

impl CacheEntry {
    pub fn new(key: PageKey, pointer: Arc<CachePointer>) -> Self {
        Self {
            key,
            pointer,
            usage: AtomicU32::new(0),
        }
    }

    pub fn key(&self) -> PageKey {
        self.key
    }

    pub fn pointer(&self) -> &Arc<CachePointer> {
        &self.pointer
    }

    pub fn usage(&self) -> u32 {
        self.usage.load(Ordering::Acquire)
    }

    pub fn is_dirty(&self) -> bool {
        self.pointer.is_dirty()
    }

    pub fn is_evictable(&self) -> bool {
        self.usage() == 0
    }

    /// Returns the new usage count.
    pub fn acquire(&self) -> u32 {
        self.usage.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Returns the new usage count.
    pub fn release(&self) -> StorageResult<u32> {
        self.usage
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map(|previous| previous - 1)
            .map_err(|_| {
                StorageError::InvalidState(format!("page {} released more than acquired", self.key))
            })
    }
}
