//! Storage layer of pagedb.
//!
//! This module provides the foundation for durable, page-based storage. Key
//! components:
//!
//! - **Memory**: A pool of page-sized buffers reused across the caches
//! - **Page**: Page identity, the page header layout and change diffs
//! - **Disk**: Data files and the registry mapping file names to ids
//! - **Buffer**: The read cache (LRU, pinning) over the write cache (dirty pages)
//! - **WAL**: The segmented write-ahead log and its master record
//!
//! Pages are never written back before the log describing their changes is
//! durable, which is what lets recovery rebuild them after a crash.

pub mod buffer;
pub mod config;
pub mod disk;
pub mod error;
pub mod memory;
pub mod page;
pub mod wal;

pub use buffer::{PageReadGuard, PageWriteGuard, ReadCache, WriteCache};
pub use config::{StorageConfig, WalConfig};
pub use error::{StorageError, StorageResult};
pub use memory::{AllocationIntent, DirectMemoryPool};
pub use page::{DurablePage, FileId, PageKey, PageView};
pub use wal::{Lsn, WalRecord, WriteAheadLog};
