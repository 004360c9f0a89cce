//! Store configuration
//!
//! Loaded from JSON. Every field has a default, so a config file only needs
//! to name the settings it overrides.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::storage::PartitionBy;
use crate::{Result, StoreError};

/// Default growth increment for column files (1 MB)
pub const DEFAULT_COLUMN_PAGE_SIZE: u64 = 1024 * 1024;
/// Default arena page size (64 KB)
pub const DEFAULT_ARENA_PAGE_SIZE: usize = 64 * 1024;
/// Default distinct-value hint for key indexes
pub const DEFAULT_INDEX_DISTINCT_HINT: u64 = 256;
/// Default retry budget for transient I/O failures
pub const DEFAULT_RETRY_BUDGET: u32 = 3;

/// Store configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Worker threads for column copy/merge tasks
    pub worker_threads: usize,
    /// Column files grow in multiples of this many bytes
    pub column_page_size: u64,
    /// Page size of the arenas backing key indexes
    pub arena_page_size: usize,
    /// Distinct-value hint used when a column does not specify one
    pub index_distinct_hint: u64,
    /// Extra attempts for transient I/O failures inside a task
    pub retry_budget: u32,
    /// Partitioning applied to tables created without an explicit choice
    pub partition_by: PartitionBy,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            worker_threads: workers,
            column_page_size: DEFAULT_COLUMN_PAGE_SIZE,
            arena_page_size: DEFAULT_ARENA_PAGE_SIZE,
            index_distinct_hint: DEFAULT_INDEX_DISTINCT_HINT,
            retry_budget: DEFAULT_RETRY_BUDGET,
            partition_by: PartitionBy::Day,
        }
    }
}

impl StoreConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        let config: StoreConfig = serde_json::from_slice(&bytes)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the settings are usable
    pub fn validate(&self) -> Result<()> {
        if self.worker_threads == 0 {
            return Err(StoreError::InvalidArgument("worker_threads must be positive".into()));
        }
        if self.column_page_size == 0 {
            return Err(StoreError::InvalidArgument("column_page_size must be positive".into()));
        }
        if self.arena_page_size < crate::storage::index::ENTRY_SIZE {
            return Err(StoreError::InvalidArgument(format!(
                "arena_page_size must hold at least one index entry ({} bytes)",
                crate::storage::index::ENTRY_SIZE
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_partial_config_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, r#"{ "worker_threads": 2, "partition_by": "Month" }"#).unwrap();

        let config = StoreConfig::load(&path).unwrap();
        assert_eq!(config.worker_threads, 2);
        assert_eq!(config.partition_by, PartitionBy::Month);
        assert_eq!(config.column_page_size, DEFAULT_COLUMN_PAGE_SIZE);
        assert_eq!(config.retry_budget, DEFAULT_RETRY_BUDGET);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        std::fs::write(&path, r#"{ "worker_threads": 0 }"#).unwrap();
        assert!(StoreConfig::load(&path).is_err());

        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(StoreConfig::load(&path), Err(StoreError::Serialization(_))));
    }
}
