//! Paginated storage: the façade tying the caches, the write-ahead log and
//! atomic operations together.
//!
//! A storage lives in one directory:
//!
//! - one data file per registered name, plus `name_id_map.cm`
//! - `wal/` with the log segments and the master record
//! - `dirty.fl` while the storage is open; finding it on open means the
//!   previous instance did not close cleanly and the log is replayed

pub mod worker;

use std::fs::{self, File};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::recovery::{Checkpoint, CheckpointManager, LogReplay, RecoveryStats};
use crate::storage::buffer::lru::LruReplacer;
use crate::storage::buffer::{PageReadGuard, ReadCache, WriteCache};
use crate::storage::config::StorageConfig;
use crate::storage::disk::REGISTRY_FILE_NAME;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::memory::DirectMemoryPool;
use crate::storage::page::{record, FileId, PageKey};
use crate::storage::wal::WriteAheadLog;
use crate::transaction::{AtomicOperationsManager, Session};
use worker::{FlushWorker, WorkerConfig};

pub const DIRTY_MARKER: &str = "dirty.fl";

pub struct PaginatedStorage {
    config: StorageConfig,
    pool: Arc<DirectMemoryPool>,
    wal: Arc<WriteAheadLog>,
    read_cache: ReadCache,
    operations: Arc<AtomicOperationsManager>,
    checkpoints: Arc<CheckpointManager>,
    worker: Option<FlushWorker>,
    recovery: Option<RecoveryStats>,
    closed: bool,
}

impl PaginatedStorage {
    /// Opens the storage in `config.path`, creating it when the directory is
    /// empty. The log is replayed if the storage was not closed cleanly.
    pub fn open(config: StorageConfig) -> StorageResult<Self> {
        config.validate()?;
        fs::create_dir_all(&config.path)
            .map_err(|e| StorageError::io(format!("creating {}", config.path.display()), e))?;

        let crashed = config.path.join(DIRTY_MARKER).exists();
        let mut storage = Self::assemble(config)?;
        if crashed {
            log::warn!(
                "Storage '{}' was not closed cleanly; recovering",
                storage.config.name
            );
            storage.recover()?;
        } else {
            // Keep unit ids unique across restarts.
            LogReplay::new(&storage.read_cache, &storage.wal, storage.operations.unit_ids()).start_lsn()?;
        }
        storage.start()?;
        Ok(storage)
    }

    /// Creates a new storage; fails if one already exists in `config.path`.
    pub fn create(config: StorageConfig) -> StorageResult<Self> {
        if config.path.join(REGISTRY_FILE_NAME).exists() {
            return Err(StorageError::FileExists(config.path.display().to_string()));
        }
        Self::open(config)
    }

    fn assemble(config: StorageConfig) -> StorageResult<Self> {
        let pool = Arc::new(DirectMemoryPool::new(config.page_size, config.pool_max_free_buffers));
        let wal = Arc::new(WriteAheadLog::open(&config.wal_dir(), &config.name, config.wal.clone())?);
        let write_cache = Arc::new(WriteCache::open(
            &config.path,
            config.storage_id,
            config.page_size,
            Arc::clone(&pool),
            Arc::clone(&wal),
            config.flush_retries,
            config.check_page_checksums,
        )?);
        let read_cache = ReadCache::new(write_cache, Box::new(LruReplacer::new()), config.cache_pages());
        let operations = AtomicOperationsManager::new(read_cache.clone(), config.wal.sync_on_commit);
        let checkpoints = Arc::new(CheckpointManager::new(Arc::clone(&operations)));

        Ok(Self {
            config,
            pool,
            wal,
            read_cache,
            operations,
            checkpoints,
            worker: None,
            recovery: None,
            closed: false,
        })
    }

    fn recover(&mut self) -> StorageResult<()> {
        let stats = LogReplay::new(&self.read_cache, &self.wal, self.operations.unit_ids()).recover()?;
        self.checkpoints.full_checkpoint()?;
        self.recovery = Some(stats);
        Ok(())
    }

    /// Drops the dirty marker and starts background flushing.
    fn start(&mut self) -> StorageResult<()> {
        let marker = self.marker_path();
        File::create(&marker)
            .and_then(|file| file.sync_all())
            .map_err(|e| StorageError::io(format!("creating {}", marker.display()), e))?;

        self.worker = Some(FlushWorker::start(
            Arc::clone(self.read_cache.write_cache()),
            Arc::clone(&self.checkpoints),
            WorkerConfig {
                flush_interval: Duration::from_millis(self.config.flush_interval_ms),
                checkpoint_interval: Duration::from_millis(self.config.checkpoint_interval_ms),
                max_dirty_pages: self.config.max_dirty_pages,
            },
        )?);
        log::info!(
            "Opened storage '{}' at {} ({} file(s))",
            self.config.name,
            self.config.path.display(),
            self.files().len()
        );
        Ok(())
    }

    fn marker_path(&self) -> PathBuf {
        self.config.path.join(DIRTY_MARKER)
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<DirectMemoryPool> {
        &self.pool
    }

    pub fn wal(&self) -> &Arc<WriteAheadLog> {
        &self.wal
    }

    pub fn read_cache(&self) -> &ReadCache {
        &self.read_cache
    }

    pub fn write_cache(&self) -> &Arc<WriteCache> {
        self.read_cache.write_cache()
    }

    pub fn operations(&self) -> &Arc<AtomicOperationsManager> {
        &self.operations
    }

    /// What replay did when this instance was opened, if it had to run.
    pub fn recovery_stats(&self) -> Option<&RecoveryStats> {
        self.recovery.as_ref()
    }

    pub fn is_broken(&self) -> bool {
        self.write_cache().is_broken()
    }

    pub fn session(&self) -> Session {
        Session::new(Arc::clone(&self.operations))
    }

    pub fn file_id(&self, name: &str) -> Option<FileId> {
        self.write_cache().file_id(name)
    }

    pub fn open_file(&self, name: &str) -> StorageResult<FileId> {
        self.write_cache().open_file(name)
    }

    pub fn file_name(&self, file_id: FileId) -> Option<String> {
        self.write_cache().file_name(file_id)
    }

    pub fn files(&self) -> Vec<(String, FileId)> {
        self.write_cache().files()
    }

    pub fn filled_up_to(&self, file_id: FileId) -> StorageResult<u64> {
        self.write_cache().filled_up_to(file_id)
    }

    /// Loads a page under a shared lock.
    ///
    /// A thread must not call this for a page its own running operation
    /// holds; read through the operation instead.
    pub fn read_page(&self, file_id: FileId, page_index: u64) -> StorageResult<PageReadGuard> {
        self.read_cache.load_for_read(PageKey::new(file_id, page_index))
    }

    pub fn read_record(&self, file_id: FileId, page_index: u64) -> StorageResult<Vec<u8>> {
        let key = PageKey::new(file_id, page_index);
        let guard = self.read_cache.load_for_read(key)?;
        record::read_record(guard.view())?.ok_or(StorageError::RecordNotFound(key))
    }

    /// Writes back every dirty page.
    pub fn flush(&self) -> StorageResult<()> {
        match &self.worker {
            Some(worker) => worker.flush().map(|_| ()),
            None => self.write_cache().flush(),
        }
    }

    /// Takes a fuzzy checkpoint and trims the log behind it.
    pub fn checkpoint(&self) -> StorageResult<Checkpoint> {
        match &self.worker {
            Some(worker) => worker.checkpoint(),
            None => self.checkpoints.fuzzy_checkpoint(),
        }
    }

    pub fn full_checkpoint(&self) -> StorageResult<Checkpoint> {
        self.checkpoints.full_checkpoint()
    }

    pub(crate) fn checkpoints(&self) -> &Arc<CheckpointManager> {
        &self.checkpoints
    }

    /// Flushes everything, checkpoints and removes the dirty marker.
    pub fn close(mut self) -> StorageResult<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> StorageResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Some(worker) = self.worker.take() {
            worker.shutdown();
        }
        let running = self.operations.active_operations();
        if running > 0 {
            log::warn!("Closing storage with {} atomic operation(s) running", running);
        }

        self.checkpoints.full_checkpoint()?;
        self.wal.close()?;
        let marker = self.marker_path();
        fs::remove_file(&marker).map_err(|e| StorageError::io(format!("removing {}", marker.display()), e))?;
        log::info!("Closed storage '{}'", self.config.name);
        Ok(())
    }

    /// Stops without writing anything, as a crash would. Buffered log
    /// records and dirty pages are lost; the next open recovers.
    pub fn halt(mut self) {
        self.closed = true;
        if let Some(worker) = self.worker.take() {
            worker.shutdown();
        }
        if let Err(e) = self.write_cache().discard() {
            log::error!("{}", e);
        }
        log::warn!("Storage '{}' halted", self.config.name);
    }
}

impl Drop for PaginatedStorage {
    fn drop(&mut self) {
        // Best effort close on drop
        if let Err(e) = self.shutdown() {
            log::error!("Closing storage '{}' failed: {}", self.config.name, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(path: &std::path::Path) -> StorageConfig {
        StorageConfig {
            page_size: 4096,
            cache_size: 16 * 4096,
            ..StorageConfig::new(path)
        }
    }

    #[test]
    fn test_create_refuses_existing_storage() -> anyhow::Result<()> {
        let dir = tempdir()?;
        PaginatedStorage::create(config(dir.path()))?.close()?;
        assert!(matches!(
            PaginatedStorage::create(config(dir.path())),
            Err(StorageError::FileExists(_))
        ));
        Ok(())
    }

    #[test]
    fn test_create_refuses_storage_without_files() -> anyhow::Result<()> {
        let dir = tempdir()?;
        PaginatedStorage::open(config(dir.path()))?.close()?;
        assert!(matches!(
            PaginatedStorage::create(config(dir.path())),
            Err(StorageError::FileExists(_))
        ));
        Ok(())
    }

    #[test]
    fn test_dirty_marker_lifecycle() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let storage = PaginatedStorage::open(config(dir.path()))?;
        assert!(dir.path().join(DIRTY_MARKER).exists());
        assert!(storage.recovery_stats().is_none());
        storage.close()?;
        assert!(!dir.path().join(DIRTY_MARKER).exists());

        PaginatedStorage::open(config(dir.path()))?.halt();
        assert!(dir.path().join(DIRTY_MARKER).exists());
        let storage = PaginatedStorage::open(config(dir.path()))?;
        assert!(storage.recovery_stats().is_some());
        Ok(())
    }

    #[test]
    fn test_records_survive_close() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let (file, index) = {
            let storage = PaginatedStorage::open(config(dir.path()))?;
            let mut session = storage.session();
            let file = session.add_file("records.dat")?;
            let index = session.create_record(file, b"persisted")?;
            drop(session);
            storage.close()?;
            (file, index)
        };

        let storage = PaginatedStorage::open(config(dir.path()))?;
        assert_eq!(storage.open_file("records.dat")?, file);
        assert_eq!(storage.read_record(file, index)?, b"persisted");
        assert_eq!(storage.filled_up_to(file)?, 1);
        Ok(())
    }

    #[test]
    fn test_unit_ids_continue_after_reopen() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let last = {
            let storage = PaginatedStorage::open(config(dir.path()))?;
            let mut session = storage.session();
            session.add_file("a.dat")?;
            session.add_file("b.dat")?;
            drop(session);
            let last = storage.operations().unit_ids().current();
            storage.close()?;
            last
        };
        let storage = PaginatedStorage::open(config(dir.path()))?;
        assert!(storage.operations().unit_ids().next() > last);
        Ok(())
    }
}
