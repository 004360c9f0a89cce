//! Table reader
//!
//! Reads committed partitions under a shared lock. A partition being
//! rewritten by a writer is refused with `LockUnavailable` instead of
//! waiting; the caller retries once the commit has published.

use std::path::{Path, PathBuf};

use super::schema::{ColumnDef, TableMeta};
use super::txn::{PartitionState, TxnState};
use crate::config::StoreConfig;
use crate::storage::{FixedColumn, FixedValue, KeyIndex, LockManager, PartitionLock, VarColumn};
use crate::{Result, StoreError};

pub struct TableReader {
    dir: PathBuf,
    meta: TableMeta,
    config: StoreConfig,
}

impl TableReader {
    pub fn open(dir: &Path, config: StoreConfig) -> Result<Self> {
        let meta = TableMeta::load(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            meta,
            config,
        })
    }

    pub fn meta(&self) -> &TableMeta {
        &self.meta
    }

    /// Currently published partitions
    pub fn partitions(&self) -> Result<Vec<PartitionState>> {
        Ok(TxnState::load(&self.dir)?.partitions)
    }

    /// Open one partition for reading.
    ///
    /// The row count is read after the shared lock is taken, so it always
    /// matches the files in the directory.
    pub fn partition(&self, name: &str) -> Result<PartitionReader> {
        let path = self.dir.join(name);
        let lock = LockManager::require_shared(&path)?;

        let state = match TxnState::load(&self.dir) {
            Ok(txn) => txn.partition(name).cloned(),
            Err(e) => {
                LockManager::release(lock);
                return Err(e);
            }
        };
        let Some(state) = state else {
            LockManager::release(lock);
            return Err(StoreError::InvalidArgument(format!("no partition named {}", name)));
        };

        Ok(PartitionReader {
            dir: path,
            state,
            meta: self.meta.clone(),
            config: self.config.clone(),
            lock: Some(lock),
        })
    }
}

pub struct PartitionReader {
    dir: PathBuf,
    state: PartitionState,
    meta: TableMeta,
    config: StoreConfig,
    lock: Option<PartitionLock>,
}

impl PartitionReader {
    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn row_count(&self) -> u64 {
        self.state.row_count
    }

    pub fn state(&self) -> &PartitionState {
        &self.state
    }

    fn fixed_column(&self, def: &ColumnDef) -> Result<FixedColumn> {
        if def.column_type.is_var() {
            return Err(StoreError::SchemaMismatch(format!("column '{}' is variable-length", def.name)));
        }
        let mut col = FixedColumn::open(&self.dir.join(def.data_file()), self.config.column_page_size)?;
        if col.size() < self.state.row_count {
            return Err(StoreError::InvalidFileFormat(format!(
                "{}/{}: {} rows on disk, {} committed",
                self.state.name,
                def.name,
                col.size(),
                self.state.row_count
            )));
        }
        col.truncate(self.state.row_count)?;
        Ok(col)
    }

    /// All committed values of a fixed-width column
    pub fn read_fixed<T: FixedValue>(&self, column: &str) -> Result<Vec<T>> {
        let col = self.fixed_column(self.meta.column(column)?)?;
        (0..col.size()).map(|row| col.get::<T>(row)).collect()
    }

    pub fn read_timestamps(&self) -> Result<Vec<i64>> {
        self.read_fixed(&self.meta.timestamp)
    }

    /// All committed values of a variable-length column
    pub fn read_var(&self, column: &str) -> Result<Vec<Vec<u8>>> {
        let def = self.meta.column(column)?;
        if !def.column_type.is_var() {
            return Err(StoreError::SchemaMismatch(format!("column '{}' is fixed-width", column)));
        }
        let mut col = VarColumn::open(
            &self.dir.join(def.offsets_file()),
            &self.dir.join(def.data_file()),
            self.config.column_page_size,
        )?;
        col.truncate(self.state.row_count)?;
        (0..col.len()).map(|row| col.get(row).map(<[u8]>::to_vec)).collect()
    }

    pub fn read_strings(&self, column: &str) -> Result<Vec<String>> {
        Ok(self
            .read_var(column)?
            .into_iter()
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .collect())
    }

    /// Rows whose indexed `column` equals `key`, ascending.
    ///
    /// Uses the stored index when it covers exactly the committed rows and
    /// regenerates it in memory otherwise.
    pub fn rows_for_key(&self, column: &str, key: i64) -> Result<Vec<u64>> {
        let def = self.meta.column(column)?;
        if !def.indexed {
            return Err(StoreError::InvalidArgument(format!("column '{}' is not indexed", column)));
        }
        let col = self.fixed_column(def)?;
        let index = KeyIndex::load_or_rebuild(
            &self.dir.join(def.index_file()),
            &col,
            def.distinct_hint.unwrap_or(self.config.index_distinct_hint),
            self.config.arena_page_size,
        )?;
        let mut rows: Vec<u64> = index.rows_for_key(key).collect();
        rows.sort_unstable();
        Ok(rows)
    }
}

impl Drop for PartitionReader {
    fn drop(&mut self) {
        if let Some(lock) = self.lock.take() {
            LockManager::release(lock);
        }
    }
}
