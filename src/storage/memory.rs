//! Page-sized buffer pool.
//!
//! Every page image held by the caches lives in a buffer handed out by the
//! [`DirectMemoryPool`]. Buffers are recycled through a bounded free list so a
//! steady-state workload does not hit the allocator. Sharing of a buffer
//! between cache structures is tracked by
//! [`CachePointer`](crate::storage::buffer::CachePointer), which returns the
//! buffer here once the last referrer lets go.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::storage::error::{StorageError, StorageResult};

/// Why a buffer was requested. Diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AllocationIntent {
    LoadPage,
    AllocatePage,
    FlushSnapshot,
    Backup,
    Recovery,
}

impl AllocationIntent {
    const COUNT: usize = 5;

    pub const ALL: [AllocationIntent; Self::COUNT] = [
        AllocationIntent::LoadPage,
        AllocationIntent::AllocatePage,
        AllocationIntent::FlushSnapshot,
        AllocationIntent::Backup,
        AllocationIntent::Recovery,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// A fixed-size, zero-initialised buffer owned by the pool.
pub struct PooledBuffer {
    data: Box<[u8]>,
}

impl PooledBuffer {
    /// Zero-length placeholder left behind once a buffer went back to the
    /// pool.
    pub(crate) fn detached() -> Self {
        Self {
            data: Vec::new().into_boxed_slice(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.data.len())
            .finish()
    }
}

/// Snapshot of pool accounting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStats {
    pub page_size: usize,
    pub in_use: usize,
    pub free: usize,
    pub allocated_total: usize,
    pub intents: Vec<(AllocationIntent, usize)>,
}

pub struct DirectMemoryPool {
    page_size: usize,
    max_free: usize,
    free: Mutex<Vec<Box<[u8]>>>,
    in_use: AtomicUsize,
    allocated_total: AtomicUsize,
    intents: [AtomicUsize; AllocationIntent::COUNT],
}

impl DirectMemoryPool {
    pub fn new(page_size: usize, max_free: usize) -> Self {
        Self {
            page_size,
            max_free,
            free: Mutex::new(Vec::with_capacity(max_free.min(64))),
            in_use: AtomicUsize::new(0),
            allocated_total: AtomicUsize::new(0),
            intents: Default::default(),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Hands out a zeroed buffer of the configured page size.
    pub fn acquire(&self, intent: AllocationIntent) -> PooledBuffer {
        self.intents[intent.index()].fetch_add(1, Ordering::Relaxed);
        self.in_use.fetch_add(1, Ordering::SeqCst);

        let recycled = self.free.lock().pop();
        let data = match recycled {
            Some(mut data) => {
                data.fill(0);
                data
            }
            None => {
                self.allocated_total.fetch_add(1, Ordering::Relaxed);
                vec![0u8; self.page_size].into_boxed_slice()
            }
        };

        PooledBuffer { data }
    }

    /// Hands out a buffer holding a copy of `source`.
    pub fn acquire_copy(&self, intent: AllocationIntent, source: &[u8]) -> StorageResult<PooledBuffer> {
        if source.len() != self.page_size {
            return Err(StorageError::InvalidState(format!(
                "cannot copy {} bytes into a {} byte page buffer",
                source.len(),
                self.page_size
            )));
        }
        let mut buffer = self.acquire(intent);
        buffer.copy_from_slice(source);
        Ok(buffer)
    }

    /// Returns a buffer to the pool.
    pub fn release(&self, buffer: PooledBuffer) -> StorageResult<()> {
        if buffer.len() != self.page_size {
            return Err(StorageError::InvalidState(format!(
                "buffer of {} bytes released into a pool of {} byte pages",
                buffer.len(),
                self.page_size
            )));
        }

        self.in_use
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .map_err(|_| {
                StorageError::InvalidState(
                    "buffer released more times than it was acquired".to_string(),
                )
            })?;

        let mut free = self.free.lock();
        if free.len() < self.max_free {
            free.push(buffer.data);
        }
        Ok(())
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            page_size: self.page_size,
            in_use: self.in_use(),
            free: self.free.lock().len(),
            allocated_total: self.allocated_total.load(Ordering::Relaxed),
            intents: AllocationIntent::ALL
                .iter()
                .map(|intent| (*intent, self.intents[intent.index()].load(Ordering::Relaxed)))
                .collect(),
        }
    }
}

impl fmt::Debug for DirectMemoryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DirectMemoryPool")
            .field("page_size", &self.page_size)
            .field("in_use", &self.in_use())
            .finish()
    }
}
