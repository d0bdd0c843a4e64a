//! Storage configuration.
//!
//! The configuration is handed in fully formed; nothing in the storage core
//! reads files or environment variables to build it.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::storage::error::{StorageError, StorageResult};

/// Default page size in bytes.
pub const DEFAULT_PAGE_SIZE: usize = 8192;

pub const MIN_PAGE_SIZE: usize = 4 * 1024;
pub const MAX_PAGE_SIZE: usize = 64 * 1024;

/// Directory of the log segments inside the storage directory.
pub const WAL_DIR_NAME: &str = "wal";

/// Write-ahead log configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalConfig {
    /// Maximum size of a single WAL segment in bytes.
    pub max_segment_size: u64,
    /// Whether to fsync the WAL when an atomic operation commits.
    pub sync_on_commit: bool,
    /// Size of the in-memory append buffer before it is written out.
    pub buffer_size: usize,
}

impl Default for WalConfig {
    fn default() -> Self {
        WalConfig {
            max_segment_size: 64 * 1024 * 1024,
            sync_on_commit: true,
            buffer_size: 1024 * 1024,
        }
    }
}

/// Configuration of a paginated storage instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding data files, WAL segments and metadata.
    pub path: PathBuf,
    /// Storage name, used as the WAL file prefix.
    pub name: String,
    /// Identifier embedded in every file id of this storage.
    pub storage_id: u32,
    pub page_size: usize,
    /// Read cache budget in bytes.
    pub cache_size: usize,
    /// Dirty pages tolerated before background flushing writes back the
    /// excess in one go.
    pub max_dirty_pages: usize,
    pub flush_interval_ms: u64,
    pub checkpoint_interval_ms: u64,
    /// How many times a failed page write is retried before the storage is
    /// marked broken.
    pub flush_retries: u32,
    pub check_page_checksums: bool,
    /// Upper bound on free buffers kept by the memory pool.
    pub pool_max_free_buffers: usize,
    pub wal: WalConfig,
}

impl StorageConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        StorageConfig {
            path: path.into(),
            ..Default::default()
        }
    }

    /// Number of pages the read cache may hold.
    pub fn cache_pages(&self) -> usize {
        (self.cache_size / self.page_size).max(1)
    }

    pub fn wal_dir(&self) -> PathBuf {
        self.path.join(WAL_DIR_NAME)
    }

    pub fn validate(&self) -> StorageResult<()> {
        if !self.page_size.is_power_of_two()
            || self.page_size < MIN_PAGE_SIZE
            || self.page_size > MAX_PAGE_SIZE
        {
            return Err(StorageError::InvalidConfig(format!(
                "page size {} must be a power of two between {} and {}",
                self.page_size, MIN_PAGE_SIZE, MAX_PAGE_SIZE
            )));
        }
        if self.cache_size < self.page_size {
            return Err(StorageError::InvalidConfig(format!(
                "cache size {} is smaller than one page",
                self.cache_size
            )));
        }
        if self.name.is_empty() {
            return Err(StorageError::InvalidConfig("storage name is empty".into()));
        }
        if self.flush_interval_ms == 0 || self.checkpoint_interval_ms == 0 {
            return Err(StorageError::InvalidConfig(
                "flush and checkpoint intervals must be positive".into(),
            ));
        }
        if self.wal.max_segment_size < self.page_size as u64 * 2 {
            return Err(StorageError::InvalidConfig(format!(
                "WAL segment size {} must hold at least two pages",
                self.wal.max_segment_size
            )));
        }
        Ok(())
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            path: PathBuf::from("pagedb_data"),
            name: "pagedb".to_string(),
            storage_id: 1,
            page_size: DEFAULT_PAGE_SIZE,
            cache_size: 64 * DEFAULT_PAGE_SIZE,
            max_dirty_pages: 1024,
            flush_interval_ms: 100,
            checkpoint_interval_ms: 5_000,
            flush_retries: 3,
            check_page_checksums: true,
            pool_max_free_buffers: 256,
            wal: WalConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = StorageConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache_pages(), 64);
    }

    #[test]
    fn test_page_size_must_be_power_of_two() {
        let config = StorageConfig {
            page_size: 5000,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(StorageError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_page_size_bounds() {
        for page_size in [2048, 128 * 1024] {
            let config = StorageConfig {
                page_size,
                cache_size: page_size * 16,
                ..Default::default()
            };
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn test_config_serde() {
        let config = StorageConfig::new("/tmp/somewhere");
        let bytes = bincode::serialize(&config).unwrap();
        let decoded: StorageConfig = bincode::deserialize(&bytes).unwrap();
        assert_eq!(config, decoded);
    }
}
