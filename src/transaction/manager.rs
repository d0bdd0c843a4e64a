//! Atomic operations manager.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::lock_api::ArcRwLockWriteGuard;
use parking_lot::{Mutex, RawRwLock, RwLock};

use super::id::{OperationUnitId, OperationUnitIdGenerator};
use super::operation::AtomicOperation;
use crate::storage::buffer::{ReadCache, WriteCache};
use crate::storage::error::StorageResult;
use crate::storage::wal::{Lsn, WriteAheadLog};

/// Blocks new atomic operations while held. Obtained from
/// [`AtomicOperationsManager::freeze`] once every running operation ended.
pub type OperationsFreeze = ArcRwLockWriteGuard<RawRwLock, ()>;

/// Starts and ends atomic operations and keeps the table of running ones.
///
/// Every operation holds a shared lock on the freezer for its whole life,
/// so taking the exclusive side waits for running operations and keeps new
/// ones out.
pub struct AtomicOperationsManager {
    read_cache: ReadCache,
    wal: Arc<WriteAheadLog>,
    ids: OperationUnitIdGenerator,
    /// Running operations by unit id, with the LSN of their start record.
    active: Mutex<BTreeMap<OperationUnitId, Lsn>>,
    freezer: Arc<RwLock<()>>,
    sync_on_commit: bool,
}

impl AtomicOperationsManager {
    pub fn new(read_cache: ReadCache, sync_on_commit: bool) -> Arc<Self> {
        let wal = Arc::clone(read_cache.write_cache().wal());
        Arc::new(Self {
            read_cache,
            wal,
            ids: OperationUnitIdGenerator::new(),
            active: Mutex::new(BTreeMap::new()),
            freezer: Arc::new(RwLock::new(())),
            sync_on_commit,
        })
    }

    pub fn read_cache(&self) -> &ReadCache {
        &self.read_cache
    }

    pub fn write_cache(&self) -> &Arc<WriteCache> {
        self.read_cache.write_cache()
    }

    pub fn wal(&self) -> &Arc<WriteAheadLog> {
        &self.wal
    }

    pub fn unit_ids(&self) -> &OperationUnitIdGenerator {
        &self.ids
    }

    pub(crate) fn sync_on_commit(&self) -> bool {
        self.sync_on_commit
    }

    /// Logs the start record of a new unit and registers it as running.
    pub fn start_atomic_operation(
        self: &Arc<Self>,
        metadata: Option<Vec<u8>>,
    ) -> StorageResult<AtomicOperation> {
        self.write_cache().check_writable()?;
        let freeze = self.freezer.read_arc();
        let unit_id = self.ids.next();

        let start_lsn = {
            let mut active = self.active.lock();
            let lsn = self.wal.log_atomic_operation_start(unit_id, metadata)?;
            active.insert(unit_id, lsn);
            self.wal.add_cut_till_limit(lsn);
            lsn
        };
        log::debug!("Started atomic operation {} at {}", unit_id, start_lsn);

        Ok(AtomicOperation::new(Arc::clone(self), unit_id, start_lsn, freeze))
    }

    /// Commits the operation, or rolls it back when `rollback` is set.
    pub fn end_atomic_operation(&self, operation: AtomicOperation, rollback: bool) -> StorageResult<()> {
        if rollback {
            operation.rollback()
        } else {
            operation.commit()
        }
    }

    /// Removes a finished unit from the table.
    pub(crate) fn unregister(&self, unit_id: OperationUnitId) {
        let start = self.active.lock().remove(&unit_id);
        if let Some(lsn) = start {
            if let Err(e) = self.wal.remove_cut_till_limit(lsn) {
                log::error!("{}", e);
            }
        }
    }

    pub fn active_operations(&self) -> usize {
        self.active.lock().len()
    }

    /// Start LSN of the oldest running operation.
    pub fn min_active_start_lsn(&self) -> Option<Lsn> {
        self.active.lock().values().min().copied()
    }

    /// Runs `f` with the start LSN of the oldest running operation while no
    /// operation can start. Whatever `f` logs precedes the start record of
    /// every operation missing from the table.
    pub(crate) fn with_operations_table<R>(
        &self,
        f: impl FnOnce(Option<Lsn>) -> StorageResult<R>,
    ) -> StorageResult<R> {
        let active = self.active.lock();
        f(active.values().min().copied())
    }

    /// Waits for running operations to end and blocks new ones until the
    /// returned guard is dropped.
    ///
    /// Must not be called by a thread that has an operation running.
    pub fn freeze(&self) -> OperationsFreeze {
        let guard = self.freezer.write_arc();
        log::info!("Atomic operations frozen");
        guard
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::buffer::lru::LruReplacer;
    use crate::storage::config::WalConfig;
    use crate::storage::memory::DirectMemoryPool;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    const PAGE: usize = 4096;

    fn setup() -> anyhow::Result<(TempDir, Arc<AtomicOperationsManager>)> {
        let dir = tempdir()?;
        let wal = Arc::new(WriteAheadLog::open(&dir.path().join("wal"), "ops", WalConfig::default())?);
        let pool = Arc::new(DirectMemoryPool::new(PAGE, 16));
        let write_cache = Arc::new(WriteCache::open(dir.path(), 1, PAGE, pool, wal, 0, true)?);
        let read_cache = ReadCache::new(write_cache, Box::new(LruReplacer::new()), 16);
        Ok((dir, AtomicOperationsManager::new(read_cache, true)))
    }

    #[test]
    fn test_operations_table_tracks_running_units() -> anyhow::Result<()> {
        let (_dir, manager) = setup()?;
        assert_eq!(manager.min_active_start_lsn(), None);

        let first = manager.start_atomic_operation(None)?;
        let second = manager.start_atomic_operation(Some(b"meta".to_vec()))?;
        assert_eq!(manager.active_operations(), 2);
        assert_eq!(manager.min_active_start_lsn(), Some(first.start_lsn()));
        assert!(first.unit_id() < second.unit_id());

        manager.end_atomic_operation(first, false)?;
        assert_eq!(manager.min_active_start_lsn(), Some(second.start_lsn()));
        manager.end_atomic_operation(second, true)?;
        assert_eq!(manager.active_operations(), 0);
        Ok(())
    }

    #[test]
    fn test_running_operation_pins_the_log() -> anyhow::Result<()> {
        let (_dir, manager) = setup()?;
        let operation = manager.start_atomic_operation(None)?;
        manager.wal().append_new_segment()?;
        manager.wal().append_new_segment()?;

        assert_eq!(manager.wal().cut_till(manager.wal().next_lsn())?, 0);
        manager.end_atomic_operation(operation, false)?;
        assert!(manager.wal().cut_till(manager.wal().next_lsn())? > 0);
        Ok(())
    }

    #[test]
    fn test_freeze_waits_for_running_operations() -> anyhow::Result<()> {
        let (_dir, manager) = setup()?;
        let operation = manager.start_atomic_operation(None)?;
        let frozen = Arc::new(AtomicBool::new(false));

        let handle = {
            let manager = Arc::clone(&manager);
            let frozen = Arc::clone(&frozen);
            std::thread::spawn(move || {
                let _freeze = manager.freeze();
                frozen.store(true, Ordering::SeqCst);
            })
        };

        std::thread::sleep(Duration::from_millis(100));
        assert!(!frozen.load(Ordering::SeqCst));
        manager.end_atomic_operation(operation, false)?;
        handle.join().unwrap();
        assert!(frozen.load(Ordering::SeqCst));
        Ok(())
    }
}
