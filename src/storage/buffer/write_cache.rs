//! Write cache: dirty page tracking and the file store.
//!
//! Pages modified by committed atomic operations are handed over with
//! [`WriteCache::store`] and written back in ascending order of the first
//! LSN that dirtied them. Before a page image reaches its data file the WAL
//! is flushed at least up to the page LSN, so the log always covers what is
//! on disk.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};

use super::pointer::CachePointer;
use crate::storage::disk::{FileRegistry, PageFile};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::memory::{AllocationIntent, DirectMemoryPool, PooledBuffer};
use crate::storage::page::layout;
use crate::storage::page::{FileId, PageKey};
use crate::storage::wal::{Lsn, WalRecord, WriteAheadLog};

#[derive(Debug)]
struct DirtyPage {
    pointer: Arc<CachePointer>,
    /// LSN of the first change not yet on disk.
    first_lsn: Lsn,
    /// Bumped on every store, so a flush knows whether it wrote the latest
    /// image.
    version: u64,
}

enum WriteBack {
    Clean,
    Written,
    Busy(Arc<CachePointer>),
}

pub struct WriteCache {
    dir: PathBuf,
    page_size: usize,
    pool: Arc<DirectMemoryPool>,
    wal: Arc<WriteAheadLog>,
    registry: FileRegistry,
    files: DashMap<FileId, Arc<PageFile>>,
    dirty: DashMap<PageKey, DirtyPage>,
    version: AtomicU64,
    flush_retries: u32,
    check_checksums: bool,
    broken: RwLock<Option<String>>,
    /// Held while dirty entries are written back or dropped.
    flush_lock: Mutex<()>,
}

impl WriteCache {
    /// Opens the file store in `dir` and every file listed in its registry.
    pub fn open(
        dir: &Path,
        storage_id: u32,
        page_size: usize,
        pool: Arc<DirectMemoryPool>,
        wal: Arc<WriteAheadLog>,
        flush_retries: u32,
        check_checksums: bool,
    ) -> StorageResult<Self> {
        std::fs::create_dir_all(dir)
            .map_err(|e| StorageError::io(format!("creating storage directory {}", dir.display()), e))?;
        let registry = FileRegistry::open(dir, storage_id)?;

        let files = DashMap::new();
        for (name, file_id) in registry.files() {
            let file = PageFile::open(&dir.join(&name), &name, file_id, page_size)?;
            log::debug!("Opened data file {} ({}) with {} pages", name, file_id, file.page_count());
            files.insert(file_id, Arc::new(file));
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            page_size,
            pool,
            wal,
            registry,
            files,
            dirty: DashMap::new(),
            version: AtomicU64::new(0),
            flush_retries,
            check_checksums,
            broken: RwLock::new(None),
            flush_lock: Mutex::new(()),
        })
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn pool(&self) -> &Arc<DirectMemoryPool> {
        &self.pool
    }

    pub fn wal(&self) -> &Arc<WriteAheadLog> {
        &self.wal
    }

    pub fn is_broken(&self) -> bool {
        self.broken.read().is_some()
    }

    /// Refuses every later write. The first reason is kept.
    pub fn mark_broken(&self, reason: impl Into<String>) {
        let mut broken = self.broken.write();
        if broken.is_none() {
            let reason = reason.into();
            log::error!("Storage marked broken: {}", reason);
            *broken = Some(reason);
        }
    }

    pub fn check_writable(&self) -> StorageResult<()> {
        match &*self.broken.read() {
            Some(reason) => Err(StorageError::Broken(reason.clone())),
            None => Ok(()),
        }
    }

    fn file(&self, file_id: FileId) -> StorageResult<Arc<PageFile>> {
        self.files
            .get(&file_id)
            .map(|f| Arc::clone(f.value()))
            .ok_or_else(|| StorageError::FileNotFound(file_id.to_string()))
    }

    /// Creates a new, empty data file.
    pub fn add_file(&self, name: &str) -> StorageResult<FileId> {
        self.check_writable()?;
        let file_id = self.registry.reserve(name)?;
        let file = PageFile::create(&self.dir.join(name), name, file_id, self.page_size)?;
        self.files.insert(file_id, Arc::new(file));
        log::debug!("Added data file {} ({})", name, file_id);
        Ok(file_id)
    }

    /// Re-creates a file under a known id. Used by log replay; a file that
    /// already exists under that id is kept as is.
    pub fn add_file_with_id(&self, name: &str, file_id: FileId) -> StorageResult<()> {
        if self.files.contains_key(&file_id) {
            return Ok(());
        }
        self.registry.register(name, file_id)?;
        let path = self.dir.join(name);
        let file = if path.exists() {
            PageFile::open(&path, name, file_id, self.page_size)?
        } else {
            PageFile::create(&path, name, file_id, self.page_size)?
        };
        self.files.insert(file_id, Arc::new(file));
        Ok(())
    }

    pub fn open_file(&self, name: &str) -> StorageResult<FileId> {
        self.registry
            .file_id(name)
            .filter(|id| self.files.contains_key(id))
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))
    }

    pub fn file_id(&self, name: &str) -> Option<FileId> {
        self.registry.file_id(name)
    }

    pub fn file_name(&self, file_id: FileId) -> Option<String> {
        self.registry.file_name(file_id)
    }

    pub fn exists(&self, file_id: FileId) -> bool {
        self.files.contains_key(&file_id)
    }

    pub fn files(&self) -> Vec<(String, FileId)> {
        self.registry.files()
    }

    /// Number of pages logically present in the file.
    pub fn filled_up_to(&self, file_id: FileId) -> StorageResult<u64> {
        Ok(self.file(file_id)?.page_count())
    }

    pub fn allocate_page(&self, file_id: FileId) -> StorageResult<u64> {
        self.check_writable()?;
        self.file(file_id)?.allocate_page()
    }

    /// Extends the file so that `key` exists.
    pub fn ensure_page(&self, key: PageKey) -> StorageResult<()> {
        self.file(key.file_id)?.ensure_page(key.page_index)
    }

    /// Drops every dirty page of the file and cuts it to zero pages.
    ///
    /// Truncation bypasses atomic operations; the log only records that it
    /// happened, so replay can report pages it cannot vouch for.
    pub fn truncate_file(&self, file_id: FileId) -> StorageResult<()> {
        self.check_writable()?;
        let file = self.file(file_id)?;
        self.wal.log(&WalRecord::non_tx_operation(file_id))?;
        let _flushing = self.flush_lock.lock();
        self.drop_dirty_pages(file_id)?;
        file.truncate(0)
    }

    /// Drops every dirty page of the file and removes it from disk and from
    /// the registry.
    pub fn delete_file(&self, file_id: FileId) -> StorageResult<()> {
        self.check_writable()?;
        let _flushing = self.flush_lock.lock();
        self.drop_dirty_pages(file_id)?;
        let (_, file) = self
            .files
            .remove(&file_id)
            .ok_or_else(|| StorageError::FileNotFound(file_id.to_string()))?;
        self.registry.remove(file_id)?;
        std::fs::remove_file(file.path()).map_err(|e| StorageError::file_io("deleting", file_id, e))?;
        log::debug!("Deleted data file {} ({})", file.name(), file_id);
        Ok(())
    }

    fn drop_dirty_pages(&self, file_id: FileId) -> StorageResult<()> {
        let keys: Vec<PageKey> = self
            .dirty
            .iter()
            .filter(|d| d.key().file_id == file_id)
            .map(|d| *d.key())
            .collect();
        for key in keys {
            if let Some((_, page)) = self.dirty.remove(&key) {
                page.pointer.set_dirty(false);
                page.pointer.decrement_referrer()?;
            }
        }
        Ok(())
    }

    /// Returns the buffer of a page for the read cache, with one referrer
    /// taken on its behalf: the dirty copy if there is one, otherwise the
    /// image read from disk.
    pub fn load(&self, key: PageKey) -> StorageResult<Arc<CachePointer>> {
        if let Some(page) = self.dirty.get(&key) {
            page.pointer.increment_referrer()?;
            return Ok(Arc::clone(&page.pointer));
        }

        let file = self.file(key.file_id)?;
        if key.page_index >= file.page_count() {
            return Err(StorageError::RecordNotFound(key));
        }
        let mut buffer = self.pool.acquire(AllocationIntent::LoadPage);
        if let Err(e) = self.read_verified(&file, key, &mut buffer) {
            self.pool.release(buffer)?;
            return Err(e);
        }
        Ok(CachePointer::new(key, buffer, Arc::clone(&self.pool)))
    }

    fn read_verified(&self, file: &PageFile, key: PageKey, buf: &mut [u8]) -> StorageResult<()> {
        file.read_page(key.page_index, buf)?;
        if self.check_checksums && !layout::verify_checksum(buf) {
            return Err(StorageError::Corruption(format!(
                "page {} fails its checksum",
                key
            )));
        }
        Ok(())
    }

    /// Reads the on-disk image of a page, bypassing the dirty set.
    pub fn read_page_image(&self, key: PageKey, buf: &mut [u8]) -> StorageResult<()> {
        let file = self.file(key.file_id)?;
        self.read_verified(&file, key, buf)
    }

    /// Marks a page dirty. `lsn` is the first change of the caller not yet
    /// on disk; the smallest one is kept.
    pub fn store(&self, key: PageKey, pointer: &Arc<CachePointer>, lsn: Lsn) -> StorageResult<()> {
        self.check_writable()?;
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        match self.dirty.entry(key) {
            Entry::Occupied(mut occupied) => {
                let page = occupied.get_mut();
                if !Arc::ptr_eq(&page.pointer, pointer) {
                    pointer.increment_referrer()?;
                    let previous = std::mem::replace(&mut page.pointer, Arc::clone(pointer));
                    previous.set_dirty(false);
                    previous.decrement_referrer()?;
                }
                page.first_lsn = page.first_lsn.min(lsn);
                page.version = version;
                pointer.set_dirty(true);
            }
            Entry::Vacant(vacant) => {
                pointer.increment_referrer()?;
                pointer.set_dirty(true);
                vacant.insert(DirtyPage {
                    pointer: Arc::clone(pointer),
                    first_lsn: lsn,
                    version,
                });
            }
        }
        Ok(())
    }

    pub fn dirty_pages(&self) -> usize {
        self.dirty.len()
    }

    pub fn is_dirty(&self, key: PageKey) -> bool {
        self.dirty.contains_key(&key)
    }

    /// Smallest LSN whose change is not on disk yet.
    pub fn min_dirty_lsn(&self) -> Option<Lsn> {
        self.dirty.iter().map(|d| d.first_lsn).min()
    }

    fn dirty_keys_by_lsn(&self) -> Vec<PageKey> {
        let mut keys: Vec<(Lsn, PageKey)> = self.dirty.iter().map(|d| (d.first_lsn, *d.key())).collect();
        keys.sort();
        keys.into_iter().map(|(_, key)| key).collect()
    }

    /// Writes back one page. The caller holds `flush_lock`, which keeps the
    /// dirty entry, and with it the pointer, alive.
    fn try_write_back(&self, key: PageKey) -> StorageResult<WriteBack> {
        let (pointer, version) = match self.dirty.get(&key) {
            Some(page) => (Arc::clone(&page.pointer), page.version),
            None => return Ok(WriteBack::Clean),
        };

        let mut snapshot = {
            let guard = match pointer.try_read()? {
                Some(guard) => guard,
                None => return Ok(WriteBack::Busy(pointer)),
            };
            self.pool.acquire_copy(AllocationIntent::FlushSnapshot, &guard)?
        };
        let written = self.persist(key, &mut snapshot);
        self.pool.release(snapshot)?;
        written?;

        self.dirty.remove_if(&key, |_, page| {
            let unchanged = page.version == version;
            if unchanged {
                page.pointer.set_dirty(false);
            }
            unchanged
        })
        .map(|(_, page)| page.pointer.decrement_referrer())
        .transpose()?;
        Ok(WriteBack::Written)
    }

    fn persist(&self, key: PageKey, page: &mut PooledBuffer) -> StorageResult<()> {
        self.check_writable()?;
        let lsn = layout::page_lsn(page);
        if !lsn.is_zero() && !self.wal.is_flushed(lsn) {
            self.wal.flush_until(lsn)?;
            if !self.wal.is_flushed(lsn) {
                return Err(StorageError::InvalidState(format!(
                    "page {} carries {} beyond the end of the durable log",
                    key, lsn
                )));
            }
        }
        layout::stamp_checksum(page);

        let file = self.file(key.file_id)?;
        let mut attempt = 0;
        loop {
            match file.write_page(key.page_index, page) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.flush_retries => {
                    attempt += 1;
                    log::warn!("Write of page {} failed (attempt {}): {}", key, attempt, e);
                    std::thread::sleep(Duration::from_millis(10 << attempt.min(6)));
                }
                Err(e) => {
                    self.mark_broken(format!("page {} could not be written: {}", key, e));
                    return Err(e);
                }
            }
        }
    }

    /// Writes back a single page, waiting for a writer to finish with it.
    pub fn flush_page(&self, key: PageKey) -> StorageResult<bool> {
        loop {
            let outcome = {
                let _flushing = self.flush_lock.lock();
                self.try_write_back(key)?
            };
            match outcome {
                WriteBack::Clean => return Ok(false),
                WriteBack::Written => return Ok(true),
                WriteBack::Busy(pointer) => pointer.wait_for_writers(),
            }
        }
    }

    /// Writes back every dirty page, oldest first, and syncs the data
    /// files. Pages held for write are waited for.
    ///
    /// Must not be called by a thread that holds a page write lock.
    pub fn flush(&self) -> StorageResult<()> {
        loop {
            let busy = {
                let _flushing = self.flush_lock.lock();
                let mut busy = Vec::new();
                for key in self.dirty_keys_by_lsn() {
                    if let WriteBack::Busy(pointer) = self.try_write_back(key)? {
                        busy.push(pointer);
                    }
                }
                busy
            };
            if busy.is_empty() {
                break;
            }
            for pointer in busy {
                pointer.wait_for_writers();
            }
        }
        self.sync_files()
    }

    /// Background path: writes back up to `limit` of the oldest dirty pages,
    /// skipping pages held for write. Returns the number written.
    pub fn flush_batch(&self, limit: usize) -> StorageResult<usize> {
        let mut written = 0;
        {
            let _flushing = self.flush_lock.lock();
            for key in self.dirty_keys_by_lsn().into_iter().take(limit) {
                if let WriteBack::Written = self.try_write_back(key)? {
                    written += 1;
                }
            }
        }
        if written > 0 {
            self.sync_files()?;
        }
        Ok(written)
    }

    pub fn sync_files(&self) -> StorageResult<()> {
        let files: Vec<Arc<PageFile>> = self.files.iter().map(|f| Arc::clone(f.value())).collect();
        for file in files {
            file.sync()?;
        }
        Ok(())
    }

    /// Drops every dirty page without writing it. Used when the storage is
    /// torn down without a flush.
    pub fn discard(&self) -> StorageResult<()> {
        let _flushing = self.flush_lock.lock();
        let keys: Vec<PageKey> = self.dirty.iter().map(|d| *d.key()).collect();
        for key in keys {
            if let Some((_, page)) = self.dirty.remove(&key) {
                page.pointer.decrement_referrer()?;
            }
        }
        Ok(())
    }
}
