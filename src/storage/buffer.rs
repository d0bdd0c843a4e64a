pub mod entry;
pub mod lru;
pub mod pointer;
pub mod replacer;
pub mod write_cache;

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

pub use entry::CacheEntry;
pub use pointer::{CachePointer, FrameReadGuard, FrameWriteGuard};
use replacer::Replacer;
pub use write_cache::WriteCache;

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::memory::AllocationIntent;
use crate::storage::page::layout;
use crate::storage::page::{DiffRecorder, DurablePage, FileId, PageKey, PageView};
use crate::storage::wal::Lsn;

/// Bounded cache of page buffers in front of the write cache.
///
/// Pages are handed out behind RAII guards holding the page's shared or
/// exclusive lock. A page is pinned while any guard exists and only unpinned
/// pages are candidates for eviction.
#[derive(Clone)]
pub struct ReadCache {
    inner: Arc<ReadCacheInner>,
}

struct ReadCacheInner {
    entries: DashMap<PageKey, Arc<CacheEntry>>,
    replacer: Mutex<Box<dyn Replacer>>,
    write_cache: Arc<WriteCache>,
    capacity: usize,
}

impl ReadCache {
    pub fn new(write_cache: Arc<WriteCache>, replacer: Box<dyn Replacer>, capacity: usize) -> Self {
        Self {
            inner: Arc::new(ReadCacheInner {
                entries: DashMap::with_capacity(capacity),
                replacer: Mutex::new(replacer),
                write_cache,
                capacity: capacity.max(1),
            }),
        }
    }

    pub fn write_cache(&self) -> &Arc<WriteCache> {
        &self.inner.write_cache
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of cached pages.
    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn contains(&self, key: PageKey) -> bool {
        self.inner.entries.contains_key(&key)
    }

    /// Loads a page under a shared lock.
    pub fn load_for_read(&self, key: PageKey) -> StorageResult<PageReadGuard> {
        let pin = self.pin(key)?;
        let guard = pin.entry.pointer().read()?;
        Ok(PageReadGuard {
            key,
            guard,
            _pin: pin,
        })
    }

    /// Loads a page under an exclusive lock, blocking until every other
    /// holder lets go.
    pub fn load_for_write(&self, key: PageKey) -> StorageResult<PageWriteGuard> {
        let pin = self.pin(key)?;
        let pointer = Arc::clone(pin.entry.pointer());
        let guard = pointer.write()?;
        Ok(PageWriteGuard {
            key,
            pointer,
            guard,
            _pin: pin,
        })
    }

    /// Appends a zeroed page to the file and returns it locked for write.
    pub fn allocate_new_page(&self, file_id: FileId) -> StorageResult<(u64, PageWriteGuard)> {
        self.make_room()?;
        let write_cache = &self.inner.write_cache;
        let page_index = write_cache.allocate_page(file_id)?;
        let key = PageKey::new(file_id, page_index);

        let pool = write_cache.pool();
        let pointer = CachePointer::new(key, pool.acquire(AllocationIntent::AllocatePage), Arc::clone(pool));
        let guard = pointer.write()?;
        let entry = Arc::new(CacheEntry::new(key, Arc::clone(&pointer)));
        entry.acquire();
        if let Some(stale) = self.inner.entries.insert(key, Arc::clone(&entry)) {
            stale.pointer().decrement_referrer()?;
        }
        self.inner.replacer.lock().pin(key);

        Ok((
            page_index,
            PageWriteGuard {
                key,
                pointer,
                guard,
                _pin: PagePin {
                    cache: Arc::clone(&self.inner),
                    entry,
                },
            },
        ))
    }

    /// Finds or loads the entry and bumps its usage.
    fn pin(&self, key: PageKey) -> StorageResult<PagePin> {
        let cached = self.inner.entries.get(&key).map(|slot| {
            slot.acquire();
            Arc::clone(slot.value())
        });
        let entry = match cached {
            Some(entry) => entry,
            None => {
                self.make_room()?;
                let slot = self.inner.entries.entry(key).or_try_insert_with(|| {
                    let pointer = self.inner.write_cache.load(key)?;
                    Ok::<_, StorageError>(Arc::new(CacheEntry::new(key, pointer)))
                })?;
                slot.acquire();
                Arc::clone(slot.value())
            }
        };
        self.inner.replacer.lock().pin(key);
        Ok(PagePin {
            cache: Arc::clone(&self.inner),
            entry,
        })
    }

    /// Evicts until there is room for one more page. Clean pages go first;
    /// when only dirty ones are left, the least recently used is written
    /// back and then evicted.
    fn make_room(&self) -> StorageResult<()> {
        let inner = &self.inner;
        let mut write_backs = 0;
        while inner.entries.len() >= inner.capacity {
            let mut evicted = None;
            let mut dirty_candidate = None;
            inner.replacer.lock().evict(&mut |key| {
                let removed = inner.entries.remove_if(key, |_, entry| {
                    if entry.usage() != 0 {
                        return false;
                    }
                    if entry.is_dirty() {
                        dirty_candidate.get_or_insert(*key);
                        return false;
                    }
                    true
                });
                match removed {
                    Some((_, entry)) => {
                        evicted = Some(entry);
                        true
                    }
                    None => false,
                }
            });

            if let Some(entry) = evicted {
                entry.pointer().decrement_referrer()?;
                continue;
            }
            match dirty_candidate {
                Some(key) if write_backs < inner.capacity => {
                    log::debug!("Read cache full of dirty pages; writing back {}", key);
                    inner.write_cache.flush_page(key)?;
                    write_backs += 1;
                }
                _ => {
                    log::warn!("Read cache exhausted: all {} pages pinned", inner.capacity);
                    return Err(StorageError::CacheExhausted(inner.capacity));
                }
            }
        }
        Ok(())
    }

    /// Drops every cached page of a file. Fails if one of them is in use.
    pub fn clear_file(&self, file_id: FileId) -> StorageResult<()> {
        let keys: Vec<PageKey> = self
            .inner
            .entries
            .iter()
            .filter(|e| e.key().file_id == file_id)
            .map(|e| *e.key())
            .collect();
        for key in keys {
            match self.inner.entries.remove_if(&key, |_, entry| entry.usage() == 0) {
                Some((_, entry)) => {
                    self.inner.replacer.lock().remove(key);
                    entry.pointer().decrement_referrer()?;
                }
                None if self.inner.entries.contains_key(&key) => {
                    return Err(StorageError::InvalidState(format!(
                        "page {} is in use while its file is cleared",
                        key
                    )));
                }
                None => {}
            }
        }
        Ok(())
    }

    /// Empties the file and drops its pages from both caches.
    pub fn truncate_file(&self, file_id: FileId) -> StorageResult<()> {
        self.clear_file(file_id)?;
        self.inner.write_cache.truncate_file(file_id)
    }

    /// Deletes the file and drops its pages from both caches.
    pub fn delete_file(&self, file_id: FileId) -> StorageResult<()> {
        self.clear_file(file_id)?;
        self.inner.write_cache.delete_file(file_id)
    }

    /// Drops every unpinned page.
    pub fn clear(&self) -> StorageResult<()> {
        let keys: Vec<PageKey> = self.inner.entries.iter().map(|e| *e.key()).collect();
        for key in keys {
            if let Some((_, entry)) = self.inner.entries.remove_if(&key, |_, entry| entry.usage() == 0) {
                self.inner.replacer.lock().remove(key);
                entry.pointer().decrement_referrer()?;
            }
        }
        Ok(())
    }
}

/// Keeps a cache entry pinned; unpins it on drop.
struct PagePin {
    cache: Arc<ReadCacheInner>,
    entry: Arc<CacheEntry>,
}

impl Drop for PagePin {
    fn drop(&mut self) {
        match self.entry.release() {
            Ok(0) => {
                // The entry may have been dropped or pinned again since its
                // usage reached zero; only a cached, idle entry is evictable.
                let mut replacer = self.cache.replacer.lock();
                let key = self.entry.key();
                let idle = self
                    .cache
                    .entries
                    .get(&key)
                    .is_some_and(|cached| Arc::ptr_eq(cached.value(), &self.entry) && cached.usage() == 0);
                if idle {
                    replacer.unpin(key);
                }
            }
            Ok(_) => {}
            Err(e) => log::error!("{}", e),
        }
    }
}

/// Shared access to a cached page. The lock is released before the pin.
pub struct PageReadGuard {
    key: PageKey,
    guard: FrameReadGuard,
    _pin: PagePin,
}

impl PageReadGuard {
    pub fn key(&self) -> PageKey {
        self.key
    }

    pub fn lsn(&self) -> Lsn {
        layout::page_lsn(&self.guard)
    }

    pub fn view(&self) -> PageView<'_> {
        PageView::new(&self.guard)
    }
}

impl Deref for PageReadGuard {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

/// Exclusive access to a cached page.
pub struct PageWriteGuard {
    key: PageKey,
    pointer: Arc<CachePointer>,
    guard: FrameWriteGuard,
    _pin: PagePin,
}

impl PageWriteGuard {
    pub fn key(&self) -> PageKey {
        self.key
    }

    pub fn pointer(&self) -> &Arc<CachePointer> {
        &self.pointer
    }

    pub fn lsn(&self) -> Lsn {
        layout::page_lsn(&self.guard)
    }

    pub fn set_lsn(&mut self, lsn: Lsn) {
        layout::set_page_lsn(&mut self.guard, lsn);
    }

    pub fn view(&self) -> PageView<'_> {
        PageView::new(&self.guard)
    }

    /// Typed, diff-recording access to the page.
    pub fn durable<'a>(&'a mut self, recorder: &'a mut DiffRecorder) -> DurablePage<'a> {
        DurablePage::recording(&mut self.guard, recorder)
    }
}

impl Deref for PageWriteGuard {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

impl DerefMut for PageWriteGuard {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::config::WalConfig;
    use crate::storage::memory::DirectMemoryPool;
    use crate::storage::wal::WriteAheadLog;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    const PAGE: usize = 4096;

    fn create_test_cache(capacity: usize) -> anyhow::Result<(TempDir, ReadCache, FileId)> {
        let dir = tempdir()?;
        let wal = Arc::new(WriteAheadLog::open(
            &dir.path().join("wal"),
            "test",
            WalConfig {
                sync_on_commit: false,
                ..Default::default()
            },
        )?);
        let pool = Arc::new(DirectMemoryPool::new(PAGE, 16));
        let write_cache = Arc::new(WriteCache::open(dir.path(), 1, PAGE, pool, wal, 1, true)?);
        let file = write_cache.add_file("test.dat")?;
        let cache = ReadCache::new(write_cache, Box::new(lru::LruReplacer::new()), capacity);
        Ok((dir, cache, file))
    }

    fn allocate_and_store(cache: &ReadCache, file: FileId, byte: u8) -> anyhow::Result<PageKey> {
        let (index, mut guard) = cache.allocate_new_page(file)?;
        guard[PAGE - 1] = byte;
        cache.write_cache().store(guard.key(), guard.pointer(), Lsn::ZERO)?;
        Ok(PageKey::new(file, index))
    }

    #[test]
    fn test_allocate_and_read_back() -> anyhow::Result<()> {
        let (_dir, cache, file) = create_test_cache(8)?;
        let (index, mut guard) = cache.allocate_new_page(file)?;
        assert_eq!(index, 0);
        guard[100] = 42;
        drop(guard);

        let guard = cache.load_for_read(PageKey::new(file, 0))?;
        assert_eq!(guard[100], 42);
        assert_eq!(cache.write_cache().filled_up_to(file)?, 1);
        Ok(())
    }

    #[test]
    fn test_cleared_pages_leave_no_evictable_key() -> anyhow::Result<()> {
        let (_dir, cache, file) = create_test_cache(8)?;
        let key = allocate_and_store(&cache, file, 9)?;

        std::thread::scope(|scope| -> anyhow::Result<()> {
            let reader = scope.spawn(|| -> StorageResult<()> {
                for _ in 0..2000 {
                    drop(cache.load_for_read(key)?);
                }
                Ok(())
            });
            for _ in 0..2000 {
                match cache.clear_file(file) {
                    Ok(()) | Err(StorageError::InvalidState(_)) => {}
                    Err(e) => return Err(e.into()),
                }
            }
            reader.join().map_err(|_| anyhow::anyhow!("reader panicked"))??;
            Ok(())
        })?;

        assert!(cache.inner.replacer.lock().size() <= cache.len());
        cache.clear()?;
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.inner.replacer.lock().size(), 0);
        Ok(())
    }

    #[test]
    fn test_shared_readers() -> anyhow::Result<()> {
        let (_dir, cache, file) = create_test_cache(8)?;
        let key = allocate_and_store(&cache, file, 5)?;
        let a = cache.load_for_read(key)?;
        let b = cache.load_for_read(key)?;
        assert_eq!(a[PAGE - 1], b[PAGE - 1]);
        Ok(())
    }

    #[test]
    fn test_writer_blocks_second_writer() -> anyhow::Result<()> {
        let (_dir, cache, file) = create_test_cache(8)?;
        let key = allocate_and_store(&cache, file, 1)?;

        let guard = cache.load_for_write(key)?;
        let acquired = Arc::new(AtomicBool::new(false));
        let handle = {
            let cache = cache.clone();
            let acquired = acquired.clone();
            std::thread::spawn(move || {
                let mut guard = cache.load_for_write(key).unwrap();
                acquired.store(true, Ordering::SeqCst);
                guard[200] = 2;
            })
        };

        std::thread::sleep(Duration::from_millis(100));
        assert!(!acquired.load(Ordering::SeqCst));
        drop(guard);
        handle.join().unwrap();
        assert!(acquired.load(Ordering::SeqCst));
        assert_eq!(cache.load_for_read(key)?[200], 2);
        Ok(())
    }

    #[test]
    fn test_clean_pages_are_evicted_lru_first() -> anyhow::Result<()> {
        let (_dir, cache, file) = create_test_cache(3)?;
        let keys: Vec<PageKey> = (0..3)
            .map(|i| allocate_and_store(&cache, file, i as u8 + 1))
            .collect::<anyhow::Result<_>>()?;
        cache.write_cache().flush()?;

        // Touch page 0 so page 1 becomes the least recently used
        drop(cache.load_for_read(keys[0])?);
        let fourth = allocate_and_store(&cache, file, 4)?;
        assert_eq!(cache.len(), 3);
        assert!(!cache.contains(keys[1]));
        assert!(cache.contains(keys[0]));
        assert!(cache.contains(fourth));

        // Reload comes from disk with identical content
        assert_eq!(cache.load_for_read(keys[1])?[PAGE - 1], 2);
        Ok(())
    }

    #[test]
    fn test_dirty_victim_is_written_back() -> anyhow::Result<()> {
        let (_dir, cache, file) = create_test_cache(2)?;
        let first = allocate_and_store(&cache, file, 1)?;
        allocate_and_store(&cache, file, 2)?;
        assert_eq!(cache.write_cache().dirty_pages(), 2);

        allocate_and_store(&cache, file, 3)?;
        assert_eq!(cache.len(), 2);
        assert!(!cache.contains(first));
        assert!(!cache.write_cache().is_dirty(first));
        assert_eq!(cache.load_for_read(first)?[PAGE - 1], 1);
        Ok(())
    }

    #[test]
    fn test_pinned_cache_is_exhausted() -> anyhow::Result<()> {
        let (_dir, cache, file) = create_test_cache(2)?;
        let (_, _a) = cache.allocate_new_page(file)?;
        let (_, _b) = cache.allocate_new_page(file)?;
        assert!(matches!(
            cache.allocate_new_page(file),
            Err(StorageError::CacheExhausted(2))
        ));
        Ok(())
    }

    #[test]
    fn test_evicted_dirty_page_is_served_from_write_cache() -> anyhow::Result<()> {
        let (_dir, cache, file) = create_test_cache(4)?;
        let key = allocate_and_store(&cache, file, 7)?;
        cache.clear()?;
        assert!(!cache.contains(key));
        assert!(cache.write_cache().is_dirty(key));
        assert_eq!(cache.load_for_read(key)?[PAGE - 1], 7);
        Ok(())
    }

    #[test]
    fn test_clear_file_refuses_pinned_pages() -> anyhow::Result<()> {
        let (_dir, cache, file) = create_test_cache(4)?;
        let key = allocate_and_store(&cache, file, 1)?;
        let guard = cache.load_for_read(key)?;
        assert!(matches!(
            cache.clear_file(file),
            Err(StorageError::InvalidState(_))
        ));
        drop(guard);
        cache.truncate_file(file)?;
        assert!(!cache.contains(key));
        assert_eq!(cache.write_cache().filled_up_to(file)?, 0);
        Ok(())
    }

    #[test]
    fn test_buffers_return_to_pool() -> anyhow::Result<()> {
        let (_dir, cache, file) = create_test_cache(4)?;
        for i in 0..3 {
            allocate_and_store(&cache, file, i)?;
        }
        cache.write_cache().flush()?;
        cache.clear()?;
        assert_eq!(cache.write_cache().pool().in_use(), 0);
        Ok(())
    }
}
