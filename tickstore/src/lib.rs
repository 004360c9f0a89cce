//! tickstore - Partitioned Columnar Time-Series Storage
//!
//! Rows are stored column by column in memory-mapped, fixed-width files, one
//! directory per time partition. Commits whose timestamps fall behind data that
//! is already on disk are routed through the out-of-order (O3) merge engine,
//! which rewrites the affected partitions on a worker pool and publishes them
//! only once every column of every touched partition has been merged.

pub mod config;
pub mod storage;
pub mod o3;
pub mod table;

use std::io;
use std::path::PathBuf;

// Re-export main types
pub use config::StoreConfig;
pub use storage::{BSearchType, FixedColumn, KeyIndex, LockManager, LockMode, PagedArena, PartitionBy, PartitionLock, VarColumn};
pub use o3::{CommitClass, O3Engine, PartitionAction};
pub use table::{ColumnDef, ColumnType, ColumnValues, CommitSummary, RowBatch, TableMeta, TableReader, TableWriter};

/// Storage engine error type
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(io::Error),

    #[error("Row {index} out of bounds (size {size})")]
    OutOfBounds { index: u64, size: u64 },

    #[error("Slow channel: {0}")]
    SlowChannel(String),

    #[error("Disconnected: {0}")]
    Disconnected(String),

    #[error("End of stream: {0}")]
    EndOfStream(String),

    #[error("Lock unavailable: {}", .0.display())]
    LockUnavailable(PathBuf),

    #[error("Index corrupt: {0}")]
    IndexCorrupt(String),

    #[error("Invalid file format: {0}")]
    InvalidFileFormat(String),

    #[error("Checksum mismatch: {0}")]
    ChecksumMismatch(String),

    #[error("Column not found: {0}")]
    ColumnNotFound(String),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Worker pool error: {0}")]
    WorkerPool(String),

    #[error("Commit aborted: {0}")]
    CommitAborted(Box<StoreError>),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// Classify an OS error into the storage taxonomy.
    ///
    /// Backpressure (`WouldBlock`, `Interrupted`, `TimedOut`) becomes
    /// `SlowChannel`, a dropped peer becomes `Disconnected` and a short read
    /// becomes `EndOfStream`. Everything else stays a plain `Io` error.
    pub fn from_io(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut => {
                StoreError::SlowChannel(err.to_string())
            }
            io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted => StoreError::Disconnected(err.to_string()),
            io::ErrorKind::UnexpectedEof => StoreError::EndOfStream(err.to_string()),
            _ => StoreError::Io(err),
        }
    }

    /// Whether the operation may succeed if simply retried
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::SlowChannel(_))
    }
}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        StoreError::from_io(err)
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// Run `op`, retrying transient failures up to `budget` extra attempts.
///
/// Non-transient errors are returned immediately. Once the budget is spent the
/// last transient error is surfaced as-is and callers treat it as fatal.
pub fn retry_transient<T, F>(budget: u32, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempt = 0;
    loop {
        match op() {
            Err(e) if e.is_transient() && attempt < budget => {
                attempt += 1;
                log::debug!("transient failure (attempt {}/{}): {}", attempt, budget, e);
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_classification() {
        let e = StoreError::from(io::Error::new(io::ErrorKind::WouldBlock, "busy"));
        assert!(matches!(e, StoreError::SlowChannel(_)));
        assert!(e.is_transient());

        let e = StoreError::from(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert!(matches!(e, StoreError::Disconnected(_)));
        assert!(!e.is_transient());

        let e = StoreError::from(io::Error::new(io::ErrorKind::UnexpectedEof, "short"));
        assert!(matches!(e, StoreError::EndOfStream(_)));

        let e = StoreError::from(io::Error::new(io::ErrorKind::NotFound, "missing"));
        assert!(matches!(e, StoreError::Io(_)));
    }

    #[test]
    fn test_retry_within_budget() {
        let mut calls = 0;
        let out = retry_transient(3, || {
            calls += 1;
            if calls < 3 {
                Err(StoreError::SlowChannel("busy".into()))
            } else {
                Ok(calls)
            }
        })
        .unwrap();
        assert_eq!(out, 3);
    }

    #[test]
    fn test_retry_budget_exhausted() {
        let mut calls = 0;
        let out: Result<()> = retry_transient(2, || {
            calls += 1;
            Err(StoreError::SlowChannel("busy".into()))
        });
        assert!(matches!(out, Err(StoreError::SlowChannel(_))));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_retry_skips_fatal() {
        let mut calls = 0;
        let out: Result<()> = retry_transient(5, || {
            calls += 1;
            Err(StoreError::OutOfBounds { index: 1, size: 0 })
        });
        assert!(out.is_err());
        assert_eq!(calls, 1);
    }
}
