//! A running atomic operation.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::lock_api::ArcRwLockReadGuard;
use parking_lot::RawRwLock;

use super::id::OperationUnitId;
use super::manager::AtomicOperationsManager;
use crate::storage::buffer::PageWriteGuard;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{
    restore_changes, revert_changes, DiffRecorder, DurablePage, FileId, PageDiff, PageKey, PageView,
    PAGE_HEADER_SIZE,
};
use crate::storage::wal::{Lsn, WalRecord};

/// A page modified by the operation. Its write lock is held until the
/// operation ends.
struct TouchedPage {
    guard: PageWriteGuard,
    /// Page LSN before the operation touched it.
    pre_lsn: Lsn,
    /// LSN of the first record of this operation on the page.
    first_lsn: Option<Lsn>,
    /// Logged diffs, oldest first.
    applied: Vec<PageDiff>,
    /// Allocated by this operation; only redo diffs are recorded.
    allocated: bool,
}

impl TouchedPage {
    fn recorder(&self) -> DiffRecorder {
        if self.allocated {
            DiffRecorder::redo_only()
        } else {
            DiffRecorder::new()
        }
    }

    /// Undoes changes made in memory that never reached the log.
    fn discard(&mut self, unlogged: &[PageDiff]) -> StorageResult<()> {
        if unlogged.is_empty() {
            return Ok(());
        }
        if self.allocated {
            self.guard[PAGE_HEADER_SIZE..].fill(0);
            restore_changes(&mut self.guard, &self.applied)
        } else {
            revert_changes(&mut self.guard, unlogged)
        }
    }

    /// Brings the page back to its state before the operation.
    fn revert(&mut self) -> StorageResult<()> {
        if self.allocated {
            self.guard.fill(0);
            return Ok(());
        }
        revert_changes(&mut self.guard, &self.applied)?;
        let pre_lsn = self.pre_lsn;
        self.guard.set_lsn(pre_lsn);
        Ok(())
    }
}

/// All-or-nothing group of page changes.
///
/// Every page touched stays locked for write until the operation ends, so no
/// other operation sees its changes before they are committed. Dropping an
/// operation that was neither committed nor rolled back rolls it back.
pub struct AtomicOperation {
    manager: Arc<AtomicOperationsManager>,
    unit_id: OperationUnitId,
    start_lsn: Lsn,
    last_lsn: Lsn,
    pages: BTreeMap<PageKey, TouchedPage>,
    created_files: Vec<FileId>,
    deleted_files: Vec<FileId>,
    finished: bool,
    _freeze: ArcRwLockReadGuard<RawRwLock, ()>,
}

impl AtomicOperation {
    pub(crate) fn new(
        manager: Arc<AtomicOperationsManager>,
        unit_id: OperationUnitId,
        start_lsn: Lsn,
        freeze: ArcRwLockReadGuard<RawRwLock, ()>,
    ) -> Self {
        Self {
            manager,
            unit_id,
            start_lsn,
            last_lsn: start_lsn,
            pages: BTreeMap::new(),
            created_files: Vec::new(),
            deleted_files: Vec::new(),
            finished: false,
            _freeze: freeze,
        }
    }

    pub fn unit_id(&self) -> OperationUnitId {
        self.unit_id
    }

    pub fn start_lsn(&self) -> Lsn {
        self.start_lsn
    }

    /// Pages locked by this operation.
    pub fn touched_pages(&self) -> usize {
        self.pages.len()
    }

    pub fn holds(&self, key: PageKey) -> bool {
        self.pages.contains_key(&key)
    }

    fn log(&mut self, record: &WalRecord) -> StorageResult<Lsn> {
        let lsn = self.manager.wal().log(record)?;
        self.last_lsn = lsn;
        Ok(lsn)
    }

    fn touch(&mut self, key: PageKey) -> StorageResult<&mut TouchedPage> {
        if !self.pages.contains_key(&key) {
            let guard = self.manager.read_cache().load_for_write(key)?;
            let pre_lsn = guard.lsn();
            self.pages.insert(
                key,
                TouchedPage {
                    guard,
                    pre_lsn,
                    first_lsn: None,
                    applied: Vec::new(),
                    allocated: false,
                },
            );
        }
        self.pages.get_mut(&key).ok_or(StorageError::PageNotHeld(key))
    }

    /// Reads a page. Pages this operation holds are read through its own
    /// lock.
    pub fn read_page<R>(&self, key: PageKey, f: impl FnOnce(PageView<'_>) -> R) -> StorageResult<R> {
        match self.pages.get(&key) {
            Some(page) => Ok(f(page.guard.view())),
            None => {
                let guard = self.manager.read_cache().load_for_read(key)?;
                Ok(f(guard.view()))
            }
        }
    }

    /// Changes a page through `f`. The diffs `f` records are logged as one
    /// update record; if `f` fails they are undone and nothing is logged.
    pub fn update_page<R>(
        &mut self,
        key: PageKey,
        f: impl FnOnce(&mut DurablePage<'_>) -> StorageResult<R>,
    ) -> StorageResult<R> {
        self.manager.write_cache().check_writable()?;
        let unit_id = self.unit_id;
        let prev = self.last_lsn;

        let page = self.touch(key)?;
        let mut recorder = page.recorder();
        let result = f(&mut page.guard.durable(&mut recorder));
        let diffs = recorder.take();

        let value = match result {
            Ok(value) => value,
            Err(e) => {
                page.discard(&diffs)?;
                return Err(e);
            }
        };
        if diffs.is_empty() {
            return Ok(value);
        }

        let record = WalRecord::update_page(unit_id, key, Some(prev), diffs.clone());
        let logged = self.manager.wal().log(&record);
        let page = self.touch(key)?;
        match logged {
            Ok(lsn) => {
                page.guard.set_lsn(lsn);
                page.first_lsn.get_or_insert(lsn);
                page.applied.extend(diffs);
                self.last_lsn = lsn;
                Ok(value)
            }
            Err(e) => {
                page.discard(&diffs)?;
                Err(e)
            }
        }
    }

    /// Appends a page to the file and keeps it locked. Returns its index.
    pub fn allocate_page(&mut self, file_id: FileId) -> StorageResult<u64> {
        self.manager.write_cache().check_writable()?;
        let (page_index, mut guard) = self.manager.read_cache().allocate_new_page(file_id)?;
        let key = PageKey::new(file_id, page_index);

        // An empty update makes replay extend the file up to this page.
        let lsn = self.log(&WalRecord::update_page(self.unit_id, key, Some(self.last_lsn), Vec::new()))?;
        guard.set_lsn(lsn);
        self.pages.insert(
            key,
            TouchedPage {
                guard,
                pre_lsn: Lsn::ZERO,
                first_lsn: Some(lsn),
                applied: Vec::new(),
                allocated: true,
            },
        );
        Ok(page_index)
    }

    /// Creates a data file. It is removed again if the operation rolls
    /// back.
    pub fn add_file(&mut self, name: &str) -> StorageResult<FileId> {
        let file_id = self.manager.write_cache().add_file(name)?;
        self.created_files.push(file_id);
        self.log(&WalRecord::file_created(self.unit_id, file_id, name))?;
        Ok(file_id)
    }

    /// Deletes a data file once the operation commits.
    pub fn delete_file(&mut self, file_id: FileId) -> StorageResult<()> {
        self.manager.write_cache().check_writable()?;
        if !self.manager.write_cache().exists(file_id) {
            return Err(StorageError::FileNotFound(file_id.to_string()));
        }
        self.log(&WalRecord::file_deleted(self.unit_id, file_id))?;
        self.deleted_files.push(file_id);
        Ok(())
    }

    /// Logs the end record and hands the changed pages to the write cache.
    ///
    /// If the end record cannot be written the storage is marked broken and
    /// the unit is left to recovery.
    pub fn commit(mut self) -> StorageResult<()> {
        self.finished = true;
        let manager = Arc::clone(&self.manager);
        let mut pages = std::mem::take(&mut self.pages);

        let ended = manager
            .wal()
            .log_atomic_operation_end(self.unit_id, false)
            .and_then(|lsn| {
                if manager.sync_on_commit() {
                    manager.wal().flush_until(lsn)
                } else {
                    Ok(())
                }
            });
        if let Err(e) = ended {
            manager
                .write_cache()
                .mark_broken(format!("end record of {} could not be written: {}", self.unit_id, e));
            // Readers must not see changes the log cannot vouch for.
            for (key, page) in pages.iter_mut() {
                if let Err(revert) = page.revert() {
                    log::error!("Page {} could not be reverted: {}", key, revert);
                }
            }
            drop(pages);
            manager.unregister(self.unit_id);
            return Err(e);
        }

        let mut stored = Ok(());
        for (key, page) in &pages {
            if let Some(lsn) = page.first_lsn {
                stored = manager.write_cache().store(*key, page.guard.pointer(), lsn);
                if stored.is_err() {
                    break;
                }
            }
        }
        drop(pages);
        manager.unregister(self.unit_id);
        stored?;

        for file_id in std::mem::take(&mut self.deleted_files) {
            manager.read_cache().delete_file(file_id)?;
        }
        log::debug!("Committed atomic operation {}", self.unit_id);
        Ok(())
    }

    /// Reverts every change, logs a rollback end record and removes the
    /// files the operation created.
    pub fn rollback(mut self) -> StorageResult<()> {
        self.finished = true;
        self.rollback_changes()
    }

    fn rollback_changes(&mut self) -> StorageResult<()> {
        let manager = Arc::clone(&self.manager);
        let mut pages = std::mem::take(&mut self.pages);

        let mut reverted = Ok(());
        for (key, page) in pages.iter_mut() {
            if let Err(e) = page.revert() {
                manager
                    .write_cache()
                    .mark_broken(format!("page {} could not be reverted: {}", key, e));
                reverted = Err(e);
            }
        }
        let ended = manager.wal().log_atomic_operation_end(self.unit_id, true);
        if let Err(e) = &ended {
            manager
                .write_cache()
                .mark_broken(format!("end record of {} could not be written: {}", self.unit_id, e));
        }
        drop(pages);
        manager.unregister(self.unit_id);

        for file_id in std::mem::take(&mut self.created_files).into_iter().rev() {
            manager.read_cache().delete_file(file_id)?;
        }
        self.deleted_files.clear();
        ended?;
        reverted?;
        log::debug!("Rolled back atomic operation {}", self.unit_id);
        Ok(())
    }
}

impl Drop for AtomicOperation {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        log::warn!("Atomic operation {} dropped while running; rolling back", self.unit_id);
        if let Err(e) = self.rollback_changes() {
            log::error!("Rollback of {} failed: {}", self.unit_id, e);
        }
    }
}
