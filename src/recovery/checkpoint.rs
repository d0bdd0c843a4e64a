//! Checkpoint management for recovery.
//!
//! Implements fuzzy checkpointing, which lets atomic operations continue
//! while the checkpoint is taken, and full checkpoints that first write back
//! every dirty page.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::storage::error::StorageResult;
use crate::storage::wal::{CheckpointKind, Lsn, WalRecord, WriteAheadLog};
use crate::transaction::AtomicOperationsManager;

/// Outcome of one checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub kind: CheckpointKind,
    /// LSN of the checkpoint start record, kept in the master record.
    pub start_lsn: Lsn,
    /// LSN replay has to start from.
    pub redo_lsn: Lsn,
    /// WAL segments removed after the checkpoint.
    pub segments_removed: usize,
}

/// Checkpoint manager handles creating checkpoints and trimming the log
/// behind them.
pub struct CheckpointManager {
    wal: Arc<WriteAheadLog>,
    operations: Arc<AtomicOperationsManager>,
    /// Last checkpoint taken; also serializes checkpoints.
    last: Mutex<Option<Checkpoint>>,
}

impl CheckpointManager {
    pub fn new(operations: Arc<AtomicOperationsManager>) -> Self {
        CheckpointManager {
            wal: Arc::clone(operations.wal()),
            operations,
            last: Mutex::new(None),
        }
    }

    pub fn last_checkpoint(&self) -> Option<Checkpoint> {
        *self.last.lock()
    }

    /// Records where replay has to start without writing pages.
    ///
    /// The redo LSN is the smallest of the first LSN of every dirty page and
    /// the start LSN of every running operation; with neither, it is the
    /// checkpoint itself.
    pub fn fuzzy_checkpoint(&self) -> StorageResult<Checkpoint> {
        self.take(CheckpointKind::Fuzzy)
    }

    /// Writes back every dirty page, then checkpoints.
    ///
    /// Must not be called by a thread that has an atomic operation running.
    pub fn full_checkpoint(&self) -> StorageResult<Checkpoint> {
        self.operations.write_cache().flush()?;
        self.take(CheckpointKind::Full)
    }

    fn take(&self, kind: CheckpointKind) -> StorageResult<Checkpoint> {
        let mut last = self.last.lock();
        let write_cache = self.operations.write_cache();
        write_cache.check_writable()?;

        let (start_lsn, redo_lsn) = self.operations.with_operations_table(|oldest_running| {
            let redo = [write_cache.min_dirty_lsn(), oldest_running]
                .into_iter()
                .flatten()
                .min();
            let watermark = self.operations.unit_ids().current();
            let start = self.wal.log(&WalRecord::checkpoint_start(
                kind,
                redo.unwrap_or(Lsn::ZERO),
                watermark,
            ))?;
            Ok((start, redo.unwrap_or(start)))
        })?;

        let end = self.wal.log(&WalRecord::checkpoint_end(start_lsn))?;
        self.wal.flush_until(end)?;
        self.wal.write_master_record(start_lsn)?;
        let segments_removed = self.wal.cut_till(redo_lsn)?;

        let checkpoint = Checkpoint {
            kind,
            start_lsn,
            redo_lsn,
            segments_removed,
        };
        log::info!(
            "{:?} checkpoint at {}, redo from {}, {} WAL segment(s) removed",
            kind,
            start_lsn,
            redo_lsn,
            segments_removed
        );
        *last = Some(checkpoint);
        Ok(checkpoint)
    }
}
