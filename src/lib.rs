//! pagedb: a page-oriented storage engine.
//!
//! Fixed-size pages live in data files and are cached in memory. Changes
//! are grouped into atomic operations, logged to a segmented write-ahead
//! log before they reach disk, and replayed after a crash.

pub mod backup;
pub mod paginated;
pub mod recovery;
pub mod storage;
pub mod transaction;

pub use backup::{BackupOptions, BackupStats, ByteTransform};
pub use paginated::PaginatedStorage;
pub use storage::{StorageConfig, StorageError, StorageResult};
pub use transaction::Session;
