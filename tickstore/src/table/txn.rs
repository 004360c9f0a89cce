//! Transaction state (`_txn.json`)
//!
//! The single source of truth for what is committed: partition list, row
//! counts and timestamp bounds. Column files may hold rows past the recorded
//! count (left by a commit that never published); readers and writers ignore
//! them.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::Result;

pub const TXN_FILE: &str = "_txn.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionState {
    pub floor: i64,
    pub name: String,
    pub row_count: u64,
    pub min_timestamp: i64,
    pub max_timestamp: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnState {
    /// Number of the last published commit
    pub txn: u64,
    /// Ordered by floor
    pub partitions: Vec<PartitionState>,
}

impl TxnState {
    pub fn load(table_dir: &Path) -> Result<Self> {
        read_json(&table_dir.join(TXN_FILE))
    }

    pub fn save(&self, table_dir: &Path) -> Result<()> {
        write_json_atomic(&table_dir.join(TXN_FILE), self)
    }

    pub fn partition(&self, name: &str) -> Option<&PartitionState> {
        self.partitions.iter().find(|p| p.name == name)
    }

    pub fn partition_at(&self, floor: i64) -> Option<&PartitionState> {
        self.partitions
            .binary_search_by_key(&floor, |p| p.floor)
            .ok()
            .map(|i| &self.partitions[i])
    }

    /// Insert or replace the state of one partition, keeping floor order
    pub fn upsert(&mut self, state: PartitionState) {
        match self.partitions.binary_search_by_key(&state.floor, |p| p.floor) {
            Ok(i) => self.partitions[i] = state,
            Err(i) => self.partitions.insert(i, state),
        }
    }

    pub fn row_count(&self) -> u64 {
        self.partitions.iter().map(|p| p.row_count).sum()
    }

    pub fn max_timestamp(&self) -> Option<i64> {
        self.partitions.last().map(|p| p.max_timestamp)
    }
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Write to `<path>.tmp`, fsync, then rename over `path`
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    {
        let mut file: File = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        let bytes = serde_json::to_vec_pretty(value)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn part(floor: i64, rows: u64) -> PartitionState {
        PartitionState {
            floor,
            name: format!("p{}", floor),
            row_count: rows,
            min_timestamp: floor,
            max_timestamp: floor + 10,
        }
    }

    #[test]
    fn test_upsert_keeps_order() {
        let mut state = TxnState::default();
        state.upsert(part(20, 1));
        state.upsert(part(0, 2));
        state.upsert(part(10, 3));
        state.upsert(part(20, 5));

        let floors: Vec<i64> = state.partitions.iter().map(|p| p.floor).collect();
        assert_eq!(floors, vec![0, 10, 20]);
        assert_eq!(state.row_count(), 10);
        assert_eq!(state.partition_at(20).unwrap().row_count, 5);
        assert_eq!(state.partition("p10").unwrap().floor, 10);
        assert_eq!(state.max_timestamp(), Some(30));
        assert!(state.partition_at(5).is_none());
    }

    #[test]
    fn test_atomic_save_replaces_file() {
        let dir = tempdir().unwrap();
        let mut state = TxnState::default();
        state.save(dir.path()).unwrap();

        state.txn = 7;
        state.upsert(part(0, 4));
        state.save(dir.path()).unwrap();

        assert_eq!(TxnState::load(dir.path()).unwrap(), state);
        assert!(!dir.path().join("_txn.json.tmp").exists());
    }
}
