//! Storage layer error types.

use std::io;

use thiserror::Error;

use crate::storage::page::{FileId, PageKey};

/// Errors that can occur in the storage layer.
#[derive(Error, Debug)]
pub enum StorageError {
    /// An internal invariant was violated. Never retried; indicates a bug.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid page diff: {0}")]
    InvalidDiff(String),

    #[error("IO error while {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("Page not found: {0}")]
    RecordNotFound(PageKey),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("File already exists: {0}")]
    FileExists(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Atomic operation already started in this session")]
    NestedOperation,

    #[error("No atomic operation is active in this session")]
    NoActiveOperation,

    #[error("Page {0} is not locked by the current atomic operation")]
    PageNotHeld(PageKey),

    #[error("Read cache is exhausted: all {0} cached pages are in use")]
    CacheExhausted(usize),

    #[error("Storage is broken and refuses writes: {0}")]
    Broken(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage is closed")]
    Closed,
}

impl StorageError {
    /// Wraps an I/O error with a description of the failed operation.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        StorageError::Io {
            context: context.into(),
            source,
        }
    }

    /// Wraps an I/O error that happened on a specific page.
    pub fn page_io(op: &str, key: PageKey, source: io::Error) -> Self {
        Self::io(format!("{} page {}", op, key), source)
    }

    /// Wraps an I/O error that happened on a whole file.
    pub fn file_io(op: &str, file_id: FileId, source: io::Error) -> Self {
        Self::io(format!("{} file {}", op, file_id), source)
    }

    /// Returns true for failures a flush may retry.
    pub fn is_transient(&self) -> bool {
        match self {
            StorageError::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::Other
            ),
            _ => false,
        }
    }
}

impl From<bincode::Error> for StorageError {
    fn from(e: bincode::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
