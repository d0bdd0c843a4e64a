//! Sessions: the caller-facing handle for atomic operations.

use std::sync::Arc;

use super::manager::AtomicOperationsManager;
use super::operation::AtomicOperation;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{record, DurablePage, FileId, PageKey};

/// One caller's view of the storage.
///
/// A session runs at most one atomic operation at a time. Calls made while
/// no operation is running are wrapped in an operation of their own.
pub struct Session {
    manager: Arc<AtomicOperationsManager>,
    current: Option<AtomicOperation>,
}

impl Session {
    pub fn new(manager: Arc<AtomicOperationsManager>) -> Self {
        Self {
            manager,
            current: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.current.is_some()
    }

    pub fn current_operation(&mut self) -> Option<&mut AtomicOperation> {
        self.current.as_mut()
    }

    pub fn begin(&mut self) -> StorageResult<()> {
        self.begin_with_metadata(None)
    }

    /// Starts an operation whose start record carries `metadata`.
    pub fn begin_with_metadata(&mut self, metadata: Option<Vec<u8>>) -> StorageResult<()> {
        if self.current.is_some() {
            return Err(StorageError::NestedOperation);
        }
        self.current = Some(self.manager.start_atomic_operation(metadata)?);
        Ok(())
    }

    pub fn commit(&mut self) -> StorageResult<()> {
        let operation = self.current.take().ok_or(StorageError::NoActiveOperation)?;
        self.manager.end_atomic_operation(operation, false)
    }

    pub fn rollback(&mut self) -> StorageResult<()> {
        let operation = self.current.take().ok_or(StorageError::NoActiveOperation)?;
        self.manager.end_atomic_operation(operation, true)
    }

    pub fn execute_inside_atomic_operation(
        &mut self,
        f: impl FnOnce(&mut AtomicOperation) -> StorageResult<()>,
    ) -> StorageResult<()> {
        self.calculate_inside_atomic_operation(f)
    }

    /// Runs `f` inside the running operation, or inside a new one that is
    /// committed afterwards. When `f` fails the whole operation is rolled
    /// back and the error returned.
    pub fn calculate_inside_atomic_operation<R>(
        &mut self,
        f: impl FnOnce(&mut AtomicOperation) -> StorageResult<R>,
    ) -> StorageResult<R> {
        if let Some(operation) = self.current.as_mut() {
            let result = f(operation);
            if result.is_err() {
                if let Some(operation) = self.current.take() {
                    if let Err(e) = operation.rollback() {
                        log::error!("Rollback after a failed step failed: {}", e);
                    }
                }
            }
            return result;
        }

        let mut operation = self.manager.start_atomic_operation(None)?;
        match f(&mut operation) {
            Ok(value) => {
                operation.commit()?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback) = operation.rollback() {
                    log::error!("Rollback after a failed step failed: {}", rollback);
                }
                Err(e)
            }
        }
    }

    /// Creates a data file.
    pub fn add_file(&mut self, name: &str) -> StorageResult<FileId> {
        self.calculate_inside_atomic_operation(|op| op.add_file(name))
    }

    /// Deletes a data file when the operation commits.
    pub fn delete_file(&mut self, file_id: FileId) -> StorageResult<()> {
        self.execute_inside_atomic_operation(|op| op.delete_file(file_id))
    }

    pub fn allocate_page(&mut self, file_id: FileId) -> StorageResult<u64> {
        self.calculate_inside_atomic_operation(|op| op.allocate_page(file_id))
    }

    /// Stores `bytes` in a new page of the file and returns its index.
    pub fn create_record(&mut self, file_id: FileId, bytes: &[u8]) -> StorageResult<u64> {
        self.calculate_inside_atomic_operation(|op| {
            let page_index = op.allocate_page(file_id)?;
            op.update_page(PageKey::new(file_id, page_index), |page| record::write_record(page, bytes))?;
            Ok(page_index)
        })
    }

    /// Reads the record of a page, through the running operation if there
    /// is one.
    pub fn read_record(&mut self, file_id: FileId, page_index: u64) -> StorageResult<Vec<u8>> {
        let key = PageKey::new(file_id, page_index);
        let found = match self.current.as_ref() {
            Some(operation) => operation.read_page(key, record::read_record)??,
            None => {
                let guard = self.manager.read_cache().load_for_read(key)?;
                record::read_record(guard.view())?
            }
        };
        found.ok_or(StorageError::RecordNotFound(key))
    }

    pub fn update_page<R>(
        &mut self,
        file_id: FileId,
        page_index: u64,
        f: impl FnOnce(&mut DurablePage<'_>) -> StorageResult<R>,
    ) -> StorageResult<R> {
        let key = PageKey::new(file_id, page_index);
        self.calculate_inside_atomic_operation(|op| op.update_page(key, f))
    }

    /// Deletes the record of a page. The page itself stays allocated.
    pub fn delete_page(&mut self, file_id: FileId, page_index: u64) -> StorageResult<()> {
        let key = PageKey::new(file_id, page_index);
        self.execute_inside_atomic_operation(|op| {
            if op.update_page(key, record::delete_record)? {
                Ok(())
            } else {
                Err(StorageError::RecordNotFound(key))
            }
        })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(operation) = self.current.take() {
            log::warn!("Session closed with operation {} running", operation.unit_id());
            if let Err(e) = operation.rollback() {
                log::error!("{}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::buffer::lru::LruReplacer;
    use crate::storage::buffer::{ReadCache, WriteCache};
    use crate::storage::config::WalConfig;
    use crate::storage::memory::DirectMemoryPool;
    use crate::storage::wal::WriteAheadLog;
    use tempfile::{tempdir, TempDir};

    fn setup() -> anyhow::Result<(TempDir, Session)> {
        let dir = tempdir()?;
        let wal = Arc::new(WriteAheadLog::open(&dir.path().join("wal"), "s", WalConfig::default())?);
        let pool = Arc::new(DirectMemoryPool::new(4096, 16));
        let write_cache = Arc::new(WriteCache::open(dir.path(), 1, 4096, pool, wal, 0, true)?);
        let read_cache = ReadCache::new(write_cache, Box::new(LruReplacer::new()), 16);
        Ok((dir, Session::new(AtomicOperationsManager::new(read_cache, false))))
    }

    #[test]
    fn test_nested_begin_is_refused() -> anyhow::Result<()> {
        let (_dir, mut session) = setup()?;
        session.begin()?;
        assert!(matches!(session.begin(), Err(StorageError::NestedOperation)));
        session.commit()?;
        assert!(matches!(session.commit(), Err(StorageError::NoActiveOperation)));
        assert!(matches!(session.rollback(), Err(StorageError::NoActiveOperation)));
        Ok(())
    }

    #[test]
    fn test_records_inside_explicit_operation() -> anyhow::Result<()> {
        let (_dir, mut session) = setup()?;
        session.begin()?;
        let file = session.add_file("records.dat")?;
        let first = session.create_record(file, b"alpha")?;
        let second = session.create_record(file, b"beta")?;
        assert_eq!(session.read_record(file, first)?, b"alpha");
        session.commit()?;

        assert_eq!((first, second), (0, 1));
        assert_eq!(session.read_record(file, second)?, b"beta");

        session.delete_page(file, first)?;
        assert!(matches!(
            session.read_record(file, first),
            Err(StorageError::RecordNotFound(_))
        ));
        assert!(matches!(
            session.delete_page(file, first),
            Err(StorageError::RecordNotFound(_))
        ));
        Ok(())
    }

    #[test]
    fn test_rollback_discards_everything() -> anyhow::Result<()> {
        let (_dir, mut session) = setup()?;
        let file = session.add_file("records.dat")?;
        let index = session.create_record(file, b"kept")?;

        session.begin()?;
        session.update_page(file, index, |page| record::write_record(page, b"lost"))?;
        session.rollback()?;
        assert_eq!(session.read_record(file, index)?, b"kept");
        Ok(())
    }

    #[test]
    fn test_failed_step_rolls_back_running_operation() -> anyhow::Result<()> {
        let (_dir, mut session) = setup()?;
        let file = session.add_file("records.dat")?;
        let index = session.create_record(file, b"v1")?;

        session.begin()?;
        session.update_page(file, index, |page| record::write_record(page, b"v2"))?;
        let failed = session.update_page(file, index, |page| record::write_record(page, &[0u8; 8192]));
        assert!(failed.is_err());
        assert!(!session.is_active());
        assert_eq!(session.read_record(file, index)?, b"v1");
        Ok(())
    }
}
