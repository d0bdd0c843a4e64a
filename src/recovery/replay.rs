//! Crash recovery by log replay.
//!
//! Replay runs in two steps:
//! 1. Redo: records are read forward from the redo LSN of the last
//!    checkpoint and buffered per unit. When a unit's end record shows it
//!    committed, its changes are applied; rolled back units are dropped.
//! 2. Undo: units without an end record are reverted from the old values
//!    their full diffs carry. Pages they appended are zeroed.

use std::collections::{BTreeMap, BTreeSet};

use crate::storage::buffer::ReadCache;
use crate::storage::error::StorageResult;
use crate::storage::page::{restore_changes, revert_changes, FileId, PageDiff, PageKey};
use crate::storage::wal::{Lsn, UpdatePageRecord, WalRecord, WriteAheadLog};
use crate::transaction::{OperationUnitId, OperationUnitIdGenerator};

/// Recovery statistics.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Number of records read.
    pub records_analyzed: usize,
    /// Number of page updates applied.
    pub records_redone: usize,
    /// Number of page updates reverted.
    pub records_undone: usize,
    /// Units found committed.
    pub units_redone: usize,
    /// Units found rolled back.
    pub units_discarded: usize,
    /// Units without an end record.
    pub units_undone: usize,
    /// First LSN replayed.
    pub start_lsn: Option<Lsn>,
    /// Last LSN replayed.
    pub end_lsn: Option<Lsn>,
}

type UnitRecords = Vec<(Lsn, WalRecord)>;

/// Replays the log into the caches.
pub struct LogReplay<'a> {
    read_cache: &'a ReadCache,
    wal: &'a WriteAheadLog,
    ids: &'a OperationUnitIdGenerator,
}

impl<'a> LogReplay<'a> {
    pub fn new(read_cache: &'a ReadCache, wal: &'a WriteAheadLog, ids: &'a OperationUnitIdGenerator) -> Self {
        Self { read_cache, wal, ids }
    }

    /// Where replay starts: the redo LSN of the checkpoint named by the
    /// master record, or the start of the log.
    pub fn start_lsn(&self) -> StorageResult<Option<Lsn>> {
        let checkpoint = match self.wal.last_checkpoint()? {
            Some(lsn) => lsn,
            None => return self.wal.begin(),
        };
        match self.wal.read(checkpoint) {
            Ok(Some(WalRecord::CheckpointStart(start))) => {
                self.ids.advance_past(start.unit_id_watermark);
                if start.redo_lsn.is_zero() {
                    Ok(Some(checkpoint))
                } else {
                    Ok(Some(start.redo_lsn))
                }
            }
            Ok(_) => {
                log::warn!("Master record points at {}, which is no checkpoint; replaying the whole log", checkpoint);
                self.wal.begin()
            }
            Err(e) => {
                log::warn!("Checkpoint at {} is unreadable ({}); replaying the whole log", checkpoint, e);
                self.wal.begin()
            }
        }
    }

    /// Replays from the last checkpoint.
    pub fn recover(&self) -> StorageResult<RecoveryStats> {
        let start = self.start_lsn()?;
        self.replay_from(start)
    }

    pub fn replay_from(&self, start: Option<Lsn>) -> StorageResult<RecoveryStats> {
        let mut stats = RecoveryStats {
            start_lsn: start,
            ..RecoveryStats::default()
        };
        let start = match start {
            Some(start) => start,
            None => {
                log::info!("WAL is empty; nothing to recover");
                return Ok(stats);
            }
        };
        log::info!("Replaying WAL from {}", start);

        let mut units: BTreeMap<OperationUnitId, UnitRecords> = BTreeMap::new();
        for item in self.wal.iter_from(start) {
            let (lsn, record) = item?;
            stats.records_analyzed += 1;
            stats.end_lsn = Some(lsn);
            if let Some(unit_id) = record.unit_id() {
                self.ids.advance_past(unit_id);
            }

            match record {
                WalRecord::AtomicUnitStart(start) => {
                    units.entry(start.unit_id).or_default();
                }
                WalRecord::AtomicUnitEnd(end) => {
                    let records = units.remove(&end.unit_id).unwrap_or_default();
                    if end.rollback {
                        self.discard_unit(end.unit_id, records)?;
                        stats.units_discarded += 1;
                    } else {
                        self.redo_unit(records, &mut stats)?;
                        stats.units_redone += 1;
                    }
                }
                WalRecord::UpdatePage(_) | WalRecord::FileCreated(_) | WalRecord::FileDeleted(_) => {
                    if let Some(unit_id) = record.unit_id() {
                        units.entry(unit_id).or_default().push((lsn, record));
                    }
                }
                WalRecord::NonTxOperationPerformed(op) => {
                    log::warn!(
                        "Non-transactional change to file {} at {}; its pages may be inconsistent",
                        op.file_id,
                        lsn
                    );
                }
                WalRecord::CheckpointStart(start) => self.ids.advance_past(start.unit_id_watermark),
                WalRecord::CheckpointEnd(_) => {}
            }
        }

        // Newest first.
        let mut torn: Vec<(OperationUnitId, UnitRecords)> = units.into_iter().collect();
        torn.sort_by_key(|(_, records)| std::cmp::Reverse(records.last().map(|(lsn, _)| *lsn)));
        for (unit_id, records) in torn {
            self.undo_unit(unit_id, records, &mut stats)?;
            stats.units_undone += 1;
        }

        log::info!(
            "Recovery done: {} record(s) read, {} unit(s) redone, {} undone, {} discarded",
            stats.records_analyzed,
            stats.units_redone,
            stats.units_undone,
            stats.units_discarded
        );
        Ok(stats)
    }

    fn redo_unit(&self, records: UnitRecords, stats: &mut RecoveryStats) -> StorageResult<()> {
        let write_cache = self.read_cache.write_cache();
        for (lsn, record) in records {
            match record {
                WalRecord::FileCreated(created) => {
                    write_cache.add_file_with_id(&created.name, created.file_id)?;
                }
                WalRecord::FileDeleted(deleted) => {
                    if write_cache.exists(deleted.file_id) {
                        self.read_cache.delete_file(deleted.file_id)?;
                    }
                }
                WalRecord::UpdatePage(update) => {
                    if self.redo_page(lsn, &update)? {
                        stats.records_redone += 1;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Applies an update unless the page already carries it.
    fn redo_page(&self, lsn: Lsn, update: &UpdatePageRecord) -> StorageResult<bool> {
        let key = update.page_key();
        let write_cache = self.read_cache.write_cache();
        if !write_cache.exists(key.file_id) {
            log::debug!("Skipping update of {} at {}: file no longer exists", key, lsn);
            return Ok(false);
        }
        write_cache.ensure_page(key)?;

        let mut guard = self.read_cache.load_for_write(key)?;
        if guard.lsn() >= lsn {
            return Ok(false);
        }
        restore_changes(&mut guard, &update.diffs)?;
        guard.set_lsn(lsn);
        write_cache.store(key, guard.pointer(), lsn)?;
        Ok(true)
    }

    /// A unit rolled back in process left its pages as they were. Only the
    /// files it created may have survived a crash during the rollback.
    fn discard_unit(&self, unit_id: OperationUnitId, records: UnitRecords) -> StorageResult<()> {
        for file_id in created_files(&records) {
            if self.read_cache.write_cache().exists(file_id) {
                log::debug!("Removing file {} created by rolled back unit {}", file_id, unit_id);
                self.read_cache.delete_file(file_id)?;
            }
        }
        Ok(())
    }

    fn undo_unit(&self, unit_id: OperationUnitId, records: UnitRecords, stats: &mut RecoveryStats) -> StorageResult<()> {
        log::warn!(
            "Atomic operation {} has no end record; undoing {} record(s)",
            unit_id,
            records.len()
        );
        let created = created_files(&records);

        // Pages the unit allocated go back to zeros, as an in-process
        // rollback leaves them.
        let allocated = allocated_pages(&records, &created);
        for (key, lsn) in &allocated {
            if self.reset_page(*key, *lsn)? {
                stats.records_undone += 1;
            }
        }

        for (lsn, record) in records.iter().rev() {
            if let WalRecord::UpdatePage(update) = record {
                if allocated.contains_key(&update.page_key()) || created.contains(&update.file_id) {
                    continue;
                }
                if self.undo_page(*lsn, update)? {
                    stats.records_undone += 1;
                }
            }
        }

        for file_id in created {
            if self.read_cache.write_cache().exists(file_id) {
                self.read_cache.delete_file(file_id)?;
            }
        }
        Ok(())
    }

    /// Zeroes a page the torn unit appended. Pages never written to disk
    /// need nothing.
    fn reset_page(&self, key: PageKey, lsn: Lsn) -> StorageResult<bool> {
        let write_cache = self.read_cache.write_cache();
        if !write_cache.exists(key.file_id) || key.page_index >= write_cache.filled_up_to(key.file_id)? {
            return Ok(false);
        }
        log::debug!("Resetting page {} allocated by a torn unit", key);
        let mut guard = self.read_cache.load_for_write(key)?;
        guard.fill(0);
        write_cache.store(key, guard.pointer(), lsn)?;
        Ok(true)
    }

    /// Writes back the old values of an update. Pages never written to disk
    /// have nothing to undo.
    fn undo_page(&self, lsn: Lsn, update: &UpdatePageRecord) -> StorageResult<bool> {
        let key = update.page_key();
        let write_cache = self.read_cache.write_cache();
        if !write_cache.exists(key.file_id) || key.page_index >= write_cache.filled_up_to(key.file_id)? {
            return Ok(false);
        }
        let mut guard = self.read_cache.load_for_write(key)?;
        revert_changes(&mut guard, &update.diffs)?;
        write_cache.store(key, guard.pointer(), lsn)?;
        Ok(true)
    }
}

fn is_undoable(update: &UpdatePageRecord) -> bool {
    update.diffs.iter().all(PageDiff::is_full)
}

/// Pages appended by the unit to files it did not create, with the LSN of
/// the unit's last record on each. Allocation logs an empty update and
/// later changes to such a page are redo-only.
fn allocated_pages(records: &[(Lsn, WalRecord)], created: &BTreeSet<FileId>) -> BTreeMap<PageKey, Lsn> {
    let mut pages = BTreeMap::new();
    for (lsn, record) in records {
        if let WalRecord::UpdatePage(update) = record {
            if created.contains(&update.file_id) {
                continue;
            }
            let key = update.page_key();
            if update.diffs.is_empty() || !is_undoable(update) || pages.contains_key(&key) {
                pages.insert(key, *lsn);
            }
        }
    }
    pages
}

fn created_files(records: &[(Lsn, WalRecord)]) -> BTreeSet<FileId> {
    records
        .iter()
        .filter_map(|(_, record)| match record {
            WalRecord::FileCreated(created) => Some(created.file_id),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::buffer::lru::LruReplacer;
    use crate::storage::buffer::WriteCache;
    use crate::storage::config::WalConfig;
    use crate::storage::memory::DirectMemoryPool;
    use crate::storage::page::{DiffKind, PageKey};
    use std::path::Path;
    use std::sync::Arc;
    use tempfile::tempdir;

    const PAGE: usize = 4096;

    fn open(dir: &Path) -> anyhow::Result<ReadCache> {
        let wal = Arc::new(WriteAheadLog::open(&dir.join("wal"), "replay", WalConfig::default())?);
        let pool = Arc::new(DirectMemoryPool::new(PAGE, 16));
        let write_cache = Arc::new(WriteCache::open(dir, 1, PAGE, pool, wal, 0, true)?);
        Ok(ReadCache::new(write_cache, Box::new(LruReplacer::new()), 16))
    }

    fn int_diff(offset: usize, old: i32, new: i32) -> anyhow::Result<PageDiff> {
        Ok(PageDiff::full(
            DiffKind::Int,
            (crate::storage::page::PAGE_HEADER_SIZE + offset) as u32,
            old.to_le_bytes().to_vec(),
            new.to_le_bytes().to_vec(),
        )?)
    }

    #[test]
    fn test_empty_log_is_a_no_op() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let cache = open(dir.path())?;
        let ids = OperationUnitIdGenerator::new();
        let stats = LogReplay::new(&cache, cache.write_cache().wal(), &ids).recover()?;
        assert_eq!(stats, RecoveryStats::default());
        Ok(())
    }

    #[test]
    fn test_committed_unit_is_redone_and_torn_unit_undone() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let file = FileId::compose(1, 1);
        let key = PageKey::new(file, 0);
        {
            let cache = open(dir.path())?;
            let wal = cache.write_cache().wal();
            let unit = OperationUnitId::new(1);
            wal.log(&WalRecord::atomic_unit_start(unit, None))?;
            wal.log(&WalRecord::file_created(unit, file, "t.dat"))?;
            wal.log(&WalRecord::update_page(unit, key, None, vec![int_diff(8, 0, 42)?]))?;
            wal.log(&WalRecord::atomic_unit_end(unit, false))?;

            let torn = OperationUnitId::new(2);
            wal.log(&WalRecord::atomic_unit_start(torn, None))?;
            wal.log(&WalRecord::update_page(torn, key, None, vec![int_diff(8, 42, 7)?]))?;
            wal.flush()?;
        }

        let cache = open(dir.path())?;
        let ids = OperationUnitIdGenerator::new();
        let stats = LogReplay::new(&cache, cache.write_cache().wal(), &ids).recover()?;
        assert_eq!(stats.units_redone, 1);
        assert_eq!(stats.units_undone, 1);
        assert_eq!(stats.records_redone, 1);
        assert_eq!(ids.next(), OperationUnitId::new(3));

        let guard = cache.load_for_read(key)?;
        assert_eq!(guard.view().get_int(8)?, 42);
        Ok(())
    }

    #[test]
    fn test_replaying_twice_gives_same_page() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let file = FileId::compose(1, 1);
        let key = PageKey::new(file, 3);
        {
            let cache = open(dir.path())?;
            let wal = cache.write_cache().wal();
            let unit = OperationUnitId::new(1);
            wal.log(&WalRecord::atomic_unit_start(unit, None))?;
            wal.log(&WalRecord::file_created(unit, file, "t.dat"))?;
            wal.log(&WalRecord::update_page(unit, key, None, vec![int_diff(0, 0, 5)?, int_diff(4, 0, 6)?]))?;
            wal.log(&WalRecord::atomic_unit_end(unit, false))?;
            wal.flush()?;
        }

        let first = {
            let cache = open(dir.path())?;
            let ids = OperationUnitIdGenerator::new();
            LogReplay::new(&cache, cache.write_cache().wal(), &ids).recover()?;
            let image = cache.load_for_read(key)?.to_vec();
            cache.write_cache().flush()?;
            image
        };
        // The page on disk now carries the update; replay must leave it alone.
        let cache = open(dir.path())?;
        let ids = OperationUnitIdGenerator::new();
        let stats = LogReplay::new(&cache, cache.write_cache().wal(), &ids).recover()?;
        assert_eq!(stats.records_redone, 0);
        let second = cache.load_for_read(key)?.to_vec();
        assert_eq!(first[crate::storage::page::PAGE_HEADER_SIZE..], second[crate::storage::page::PAGE_HEADER_SIZE..]);
        Ok(())
    }

    #[test]
    fn test_rolled_back_unit_leaves_no_file() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let file = FileId::compose(1, 1);
        {
            let cache = open(dir.path())?;
            cache.write_cache().add_file_with_id("tmp.dat", file)?;
            let wal = cache.write_cache().wal();
            let unit = OperationUnitId::new(4);
            wal.log(&WalRecord::atomic_unit_start(unit, None))?;
            wal.log(&WalRecord::file_created(unit, file, "tmp.dat"))?;
            wal.log(&WalRecord::atomic_unit_end(unit, true))?;
            wal.flush()?;
        }

        let cache = open(dir.path())?;
        let ids = OperationUnitIdGenerator::new();
        let stats = LogReplay::new(&cache, cache.write_cache().wal(), &ids).recover()?;
        assert_eq!(stats.units_discarded, 1);
        assert!(!cache.write_cache().exists(file));
        Ok(())
    }

    #[test]
    fn test_torn_unit_resets_pages_it_allocated() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let file = FileId::compose(1, 1);
        let kept = PageKey::new(file, 0);
        let appended = PageKey::new(file, 1);
        {
            let cache = open(dir.path())?;
            cache.write_cache().add_file_with_id("t.dat", file)?;
            let wal = cache.write_cache().wal();
            let unit = OperationUnitId::new(1);
            wal.log(&WalRecord::atomic_unit_start(unit, None))?;
            wal.log(&WalRecord::update_page(unit, kept, None, vec![int_diff(8, 0, 42)?]))?;
            wal.log(&WalRecord::atomic_unit_end(unit, false))?;

            let torn = OperationUnitId::new(2);
            wal.log(&WalRecord::atomic_unit_start(torn, None))?;
            wal.log(&WalRecord::update_page(torn, appended, None, Vec::new()))?;
            let redo_only = PageDiff::partial(
                DiffKind::Int,
                (crate::storage::page::PAGE_HEADER_SIZE + 8) as u32,
                99i32.to_le_bytes().to_vec(),
            )?;
            wal.log(&WalRecord::update_page(torn, appended, None, vec![redo_only]))?;
            wal.flush()?;
            // The appended page reached the file before the crash.
            cache.write_cache().ensure_page(appended)?;
        }

        let cache = open(dir.path())?;
        let ids = OperationUnitIdGenerator::new();
        let stats = LogReplay::new(&cache, cache.write_cache().wal(), &ids).recover()?;
        assert_eq!(stats.units_undone, 1);
        assert_eq!(stats.records_redone, 1);
        assert_eq!(stats.records_undone, 1);

        assert_eq!(cache.load_for_read(kept)?.view().get_int(8)?, 42);
        let reset = cache.load_for_read(appended)?;
        assert!(reset.iter().all(|byte| *byte == 0));
        Ok(())
    }

    #[test]
    fn test_truncation_record_is_read_past() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let file = FileId::compose(1, 1);
        {
            let cache = open(dir.path())?;
            cache.write_cache().add_file_with_id("t.dat", file)?;
            cache.truncate_file(file)?;
            cache.write_cache().wal().flush()?;
        }

        let cache = open(dir.path())?;
        let ids = OperationUnitIdGenerator::new();
        let stats = LogReplay::new(&cache, cache.write_cache().wal(), &ids).recover()?;
        assert_eq!(stats.records_analyzed, 1);
        assert_eq!(stats.units_undone, 0);
        assert!(cache.write_cache().exists(file));
        Ok(())
    }
}
