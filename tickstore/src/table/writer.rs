//! Table writer
//!
//! Owns a table directory exclusively and runs every commit through the same
//! cycle:
//!
//! 1. validate the batch and sort it by timestamp
//! 2. analyze: per partition, append / merge / create
//! 3. lock every touched partition exclusively
//! 4. dispatch merge and create jobs to the O3 engine; they write staging
//!    directories `<partition>.o3-<txn>`
//! 5. append in place to partitions that only grow at the end
//! 6. publish: swap staging directories in, then rewrite `_txn.json`
//!
//! Any failure before `_txn.json` is replaced undoes steps 4-6, so readers
//! only ever see the previous or the new state.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use super::batch::RowBatch;
use super::schema::{ColumnDef, TableMeta, META_FILE};
use super::txn::{PartitionState, TxnState};
use crate::config::StoreConfig;
use crate::o3::{
    analyze, sort_permutation, CommitClass, O3Engine, OooColumnData, PartitionAction, PartitionJob,
    PartitionPlan, PartitionSource,
};
use crate::storage::{FixedColumn, KeyIndex, LockManager, PartitionLock, VarColumn};
use crate::{retry_transient, Result, StoreError};

/// Outcome of one commit
#[derive(Debug, Clone, PartialEq)]
pub struct CommitSummary {
    pub txn: u64,
    pub class: CommitClass,
    pub rows: u64,
    pub partitions: Vec<(String, PartitionAction)>,
}

pub struct TableWriter {
    dir: PathBuf,
    meta: TableMeta,
    txn: TxnState,
    config: StoreConfig,
    engine: O3Engine,
    table_lock: Option<PartitionLock>,
}

impl TableWriter {
    /// Create a new, empty table
    pub fn create(dir: &Path, meta: TableMeta, config: StoreConfig) -> Result<Self> {
        meta.validate()?;
        fs::create_dir_all(dir)?;
        let lock = LockManager::require_exclusive(dir)?;
        let result = (|| -> Result<(TxnState, O3Engine)> {
            if dir.join(META_FILE).exists() {
                return Err(StoreError::InvalidArgument(format!(
                    "table already exists at {}",
                    dir.display()
                )));
            }
            meta.save(dir)?;
            let txn = TxnState::default();
            txn.save(dir)?;
            let engine = O3Engine::new(config.clone())?;
            Ok((txn, engine))
        })();

        match result {
            Ok((txn, engine)) => {
                log::info!("Created table at {}", dir.display());
                Ok(Self {
                    dir: dir.to_path_buf(),
                    meta,
                    txn,
                    config,
                    engine,
                    table_lock: Some(lock),
                })
            }
            Err(e) => {
                LockManager::release(lock);
                Err(e)
            }
        }
    }

    /// Open an existing table, cleaning up after any interrupted commit
    pub fn open(dir: &Path, config: StoreConfig) -> Result<Self> {
        let lock = LockManager::require_exclusive(dir)?;
        let result = (|| -> Result<(TableMeta, TxnState, O3Engine)> {
            let meta = TableMeta::load(dir)?;
            let txn = TxnState::load(dir)?;
            recover(dir, &txn)?;
            let engine = O3Engine::new(config.clone())?;
            Ok((meta, txn, engine))
        })();

        match result {
            Ok((meta, txn, engine)) => {
                log::info!(
                    "Opened table at {} (txn {}, {} partitions)",
                    dir.display(),
                    txn.txn,
                    txn.partitions.len()
                );
                Ok(Self {
                    dir: dir.to_path_buf(),
                    meta,
                    txn,
                    config,
                    engine,
                    table_lock: Some(lock),
                })
            }
            Err(e) => {
                LockManager::release(lock);
                Err(e)
            }
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn meta(&self) -> &TableMeta {
        &self.meta
    }

    pub fn txn_state(&self) -> &TxnState {
        &self.txn
    }

    pub fn partitions(&self) -> &[PartitionState] {
        &self.txn.partitions
    }

    pub fn row_count(&self) -> u64 {
        self.txn.row_count()
    }

    pub fn max_timestamp(&self) -> Option<i64> {
        self.txn.max_timestamp()
    }

    /// Commit a batch whose rows may be in any timestamp order
    pub fn commit(&mut self, batch: &RowBatch) -> Result<CommitSummary> {
        batch.validate(&self.meta)?;
        if batch.is_empty() {
            return Ok(CommitSummary {
                txn: self.txn.txn,
                class: CommitClass::Append,
                rows: 0,
                partitions: Vec::new(),
            });
        }

        let started = Instant::now();
        let timestamps = batch.timestamps(&self.meta)?;
        let order = sort_permutation(timestamps);
        let sorted_ts: Vec<i64> = order.iter().map(|&row| timestamps[row]).collect();

        let plan = analyze(&sorted_ts, self.meta.partition_by, |floor, _| self.locate(floor))?;
        let txn = self.txn.txn + 1;
        log::info!(
            "Commit {}: {:?}, {} rows over {} partitions",
            txn,
            plan.class,
            batch.len(),
            plan.partitions.len()
        );

        let locks = self.lock_partitions(&plan.partitions)?;
        let summary = CommitSummary {
            txn,
            class: plan.class,
            rows: batch.len() as u64,
            partitions: plan
                .partitions
                .iter()
                .map(|p| (p.name.clone(), p.action))
                .collect(),
        };

        let mut pending = PendingCommit::default();
        let result = self.apply(txn, plan.partitions, batch, &order, &mut pending);
        if let Err(e) = &result {
            log::warn!("Commit {} aborted: {}", txn, e);
            pending.rollback(self);
        }
        for lock in locks {
            LockManager::release(lock);
        }
        result.map_err(|e| StoreError::CommitAborted(Box::new(e)))?;

        pending.discard_old();
        log::info!("Commit {} published in {:?}", txn, started.elapsed());
        Ok(summary)
    }

    fn locate(&self, floor: i64) -> Result<Option<PartitionSource>> {
        let Some(state) = self.txn.partition_at(floor) else {
            return Ok(None);
        };
        let ts = self.meta.timestamp_column()?;
        let path = self.dir.join(&state.name).join(ts.data_file());
        Ok(Some(PartitionSource {
            row_count: state.row_count,
            timestamps: FixedColumn::open(&path, self.config.column_page_size)?,
        }))
    }

    fn lock_partitions(&self, partitions: &[PartitionPlan]) -> Result<Vec<PartitionLock>> {
        let mut locks = Vec::with_capacity(partitions.len());
        for plan in partitions {
            let path = self.dir.join(&plan.name);
            match LockManager::lock_exclusive(&path) {
                Ok(Some(lock)) => locks.push(lock),
                Ok(None) => {
                    locks.into_iter().for_each(LockManager::release);
                    return Err(StoreError::LockUnavailable(path));
                }
                Err(e) => {
                    locks.into_iter().for_each(LockManager::release);
                    return Err(e);
                }
            }
        }
        Ok(locks)
    }

    fn apply(
        &mut self,
        txn: u64,
        mut partitions: Vec<PartitionPlan>,
        batch: &RowBatch,
        order: &[usize],
        pending: &mut PendingCommit,
    ) -> Result<()> {
        // DISPATCH: one job per rewritten partition, into staging
        let mut jobs = Vec::new();
        for plan in partitions.iter_mut().filter(|p| p.action != PartitionAction::Append) {
            let staging = self.dir.join(format!("{}.o3-{}", plan.name, txn));
            if staging.exists() {
                fs::remove_dir_all(&staging)?;
            }
            fs::create_dir_all(&staging)?;
            pending.staging.push(staging.clone());

            jobs.push(PartitionJob {
                name: plan.name.clone(),
                src_dir: (plan.action == PartitionAction::Merge).then(|| self.dir.join(&plan.name)),
                dst_dir: staging,
                blocks: plan.blocks(),
                merge_index: std::mem::take(&mut plan.merge_index),
                output_rows: plan.output_rows(),
                columns: self.gather_columns(batch, &order[plan.ooo_lo..plan.ooo_hi])?,
            });
        }
        self.engine.execute(jobs)?;

        // APPEND in place
        for plan in partitions.iter().filter(|p| p.action == PartitionAction::Append) {
            pending.appended.push((plan.name.clone(), plan.data_row_count));
            let columns = self.gather_columns(batch, &order[plan.ooo_lo..plan.ooo_hi])?;
            let part_dir = self.dir.join(&plan.name);
            for (def, data) in &columns {
                retry_transient(self.config.retry_budget, || {
                    self.append_column(&part_dir, def, data, plan.data_row_count, plan.ooo_rows())
                })?;
            }
        }

        // PUBLISH
        for plan in partitions.iter().filter(|p| p.action != PartitionAction::Append) {
            let live = self.dir.join(&plan.name);
            let staging = self.dir.join(format!("{}.o3-{}", plan.name, txn));
            let old = match plan.action {
                PartitionAction::Merge => {
                    let old = self.dir.join(format!("{}.old-{}", plan.name, txn));
                    fs::rename(&live, &old)?;
                    Some(old)
                }
                _ => {
                    // leftover of a commit that never reached _txn.json
                    if live.exists() {
                        fs::remove_dir_all(&live)?;
                    }
                    None
                }
            };
            pending.published.push((live.clone(), old));
            fs::rename(&staging, &live)?;
            pending.staging.retain(|s| s != &staging);
        }

        let mut state = self.txn.clone();
        state.txn = txn;
        for plan in &partitions {
            state.upsert(PartitionState {
                floor: plan.floor,
                name: plan.name.clone(),
                row_count: plan.output_rows(),
                min_timestamp: plan.min_timestamp(),
                max_timestamp: plan.max_timestamp(),
            });
        }
        state.save(&self.dir)?;
        self.txn = state;
        Ok(())
    }

    fn gather_columns(&self, batch: &RowBatch, rows: &[usize]) -> Result<Vec<(ColumnDef, OooColumnData)>> {
        self.meta
            .columns
            .iter()
            .map(|def| Ok((def.clone(), batch.column(&def.name)?.gather(rows))))
            .collect()
    }

    /// Append `rows` new values after the first `base_rows` committed ones.
    /// Rows past `base_rows` left by an unpublished commit are overwritten.
    fn append_column(
        &self,
        part_dir: &Path,
        def: &ColumnDef,
        data: &OooColumnData,
        base_rows: u64,
        rows: u64,
    ) -> Result<()> {
        let page = self.config.column_page_size;
        match def.column_type.fixed_width() {
            Some(width) => {
                let mut col = FixedColumn::open_or_create(&part_dir.join(def.data_file()), width, page)?;
                check_base(col.path(), col.size(), base_rows)?;
                col.truncate(base_rows)?;

                let index_path = part_dir.join(def.index_file());
                let index = if def.indexed {
                    Some(KeyIndex::load_or_rebuild(
                        &index_path,
                        &col,
                        self.hint_for(def),
                        self.config.arena_page_size,
                    )?)
                } else {
                    None
                };

                col.append_block(data.records(0, rows, width)?)?;
                col.commit()?;

                if let Some(mut index) = index {
                    index.extend_from(&col, base_rows)?;
                    index.save(&index_path)?;
                }
            }
            None => {
                let fix_path = part_dir.join(def.offsets_file());
                let mut col = VarColumn::open_or_create(&fix_path, &part_dir.join(def.data_file()), page)?;
                check_base(&fix_path, col.len(), base_rows)?;
                col.truncate(base_rows)?;
                for row in 0..rows {
                    col.append(data.value(row)?)?;
                }
                col.commit()?;
            }
        }
        Ok(())
    }

    fn hint_for(&self, def: &ColumnDef) -> u64 {
        def.distinct_hint.unwrap_or(self.config.index_distinct_hint)
    }

    /// Put the first `base_rows` rows back as the committed size of every column
    fn truncate_partition(&self, name: &str, base_rows: u64) -> Result<()> {
        let part_dir = self.dir.join(name);
        let page = self.config.column_page_size;
        for def in &self.meta.columns {
            match def.column_type.fixed_width() {
                Some(_) => {
                    let path = part_dir.join(def.data_file());
                    if !path.exists() {
                        continue;
                    }
                    let mut col = FixedColumn::open(&path, page)?;
                    if col.size() > base_rows {
                        col.truncate(base_rows)?;
                        col.commit()?;
                    }
                }
                None => {
                    let fix_path = part_dir.join(def.offsets_file());
                    let var_path = part_dir.join(def.data_file());
                    if !fix_path.exists() || !var_path.exists() {
                        continue;
                    }
                    let mut col = VarColumn::open(&fix_path, &var_path, page)?;
                    if col.len() > base_rows {
                        col.truncate(base_rows)?;
                        col.commit()?;
                    }
                }
            }
        }
        Ok(())
    }
}

impl Drop for TableWriter {
    fn drop(&mut self) {
        if let Some(lock) = self.table_lock.take() {
            LockManager::release(lock);
        }
    }
}

fn check_base(path: &Path, size: u64, base_rows: u64) -> Result<()> {
    if size < base_rows {
        return Err(StoreError::InvalidFileFormat(format!(
            "{}: {} rows on disk, {} committed",
            path.display(),
            size,
            base_rows
        )));
    }
    Ok(())
}

/// Side effects of an in-flight commit, for rollback
#[derive(Default)]
struct PendingCommit {
    staging: Vec<PathBuf>,
    /// Partition name and its committed row count before this commit
    appended: Vec<(String, u64)>,
    /// Live directory and where its previous contents were moved
    published: Vec<(PathBuf, Option<PathBuf>)>,
}

impl PendingCommit {
    fn rollback(&mut self, writer: &TableWriter) {
        for (live, old) in self.published.drain(..).rev() {
            if live.exists() {
                if let Err(e) = fs::remove_dir_all(&live) {
                    log::warn!("Rollback: failed to remove {}: {}", live.display(), e);
                }
            }
            if let Some(old) = old {
                if let Err(e) = fs::rename(&old, &live) {
                    log::warn!("Rollback: failed to restore {}: {}", live.display(), e);
                }
            }
        }
        for (name, base_rows) in self.appended.drain(..) {
            if let Err(e) = writer.truncate_partition(&name, base_rows) {
                log::warn!("Rollback: failed to truncate {}: {}", name, e);
            }
        }
        for dir in self.staging.drain(..) {
            remove_dir_quietly(&dir);
        }
    }

    /// Drop the pre-merge copies of partitions once the new state is published
    fn discard_old(&mut self) {
        for (_, old) in self.published.drain(..) {
            if let Some(old) = old {
                remove_dir_quietly(&old);
            }
        }
    }
}

fn remove_dir_quietly(dir: &Path) {
    if let Err(e) = fs::remove_dir_all(dir) {
        if e.kind() != io::ErrorKind::NotFound {
            log::warn!("Failed to remove {}: {}", dir.display(), e);
        }
    }
}

/// Undo what an interrupted commit left behind.
///
/// Staging directories are always discarded. A `<name>.old-<n>` directory is
/// the previous copy of a partition: if commit `n` made it into `_txn.json` it
/// is stale, otherwise it is moved back into place.
fn recover(dir: &Path, txn: &TxnState) -> Result<()> {
    let entries = fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;
    for entry in entries {
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();

        if let Some((_, n)) = name.rsplit_once(".o3-") {
            if n.parse::<u64>().is_ok() {
                log::warn!("Recovery: discarding staging directory {}", name);
                fs::remove_dir_all(entry.path())?;
            }
        } else if let Some((partition, n)) = name.rsplit_once(".old-") {
            let Ok(n) = n.parse::<u64>() else { continue };
            if n <= txn.txn {
                log::info!("Recovery: removing superseded {}", name);
                fs::remove_dir_all(entry.path())?;
            } else {
                log::warn!("Recovery: restoring {} from unpublished commit {}", partition, n);
                let live = dir.join(partition);
                if live.exists() {
                    fs::remove_dir_all(&live)?;
                }
                fs::rename(entry.path(), &live)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::PartitionBy;
    use crate::table::{ColumnType, ColumnValues};
    use tempfile::tempdir;

    fn meta() -> TableMeta {
        TableMeta::new(
            vec![
                ColumnDef::new("ts", ColumnType::Timestamp),
                ColumnDef::new("v", ColumnType::Long),
            ],
            "ts",
            PartitionBy::None,
        )
    }

    fn config() -> StoreConfig {
        StoreConfig {
            worker_threads: 2,
            column_page_size: 4096,
            ..StoreConfig::default()
        }
    }

    fn batch(ts: &[i64]) -> RowBatch {
        RowBatch::new()
            .with_column("ts", ColumnValues::Timestamp(ts.to_vec()))
            .with_column("v", ColumnValues::Long(ts.iter().map(|t| t * 10).collect()))
    }

    fn column(dir: &Path, file: &str) -> Vec<i64> {
        let col = FixedColumn::open(&dir.join("default").join(file), 4096).unwrap();
        (0..col.size()).map(|r| col.get::<i64>(r).unwrap()).collect()
    }

    #[test]
    fn test_create_open_and_exclusivity() {
        let dir = tempdir().unwrap();
        let table = dir.path().join("t");
        let writer = TableWriter::create(&table, meta(), config()).unwrap();
        assert!(matches!(
            TableWriter::open(&table, config()),
            Err(StoreError::LockUnavailable(_))
        ));
        drop(writer);

        let writer = TableWriter::open(&table, config()).unwrap();
        assert_eq!(writer.row_count(), 0);
        assert!(writer.max_timestamp().is_none());
        drop(writer);

        assert!(TableWriter::create(&table, meta(), config()).is_err());
    }

    #[test]
    fn test_append_then_merge() {
        let dir = tempdir().unwrap();
        let table = dir.path().join("t");
        let mut writer = TableWriter::create(&table, meta(), config()).unwrap();

        let first = writer.commit(&batch(&[30, 10, 20])).unwrap();
        assert_eq!(first.partitions, vec![("default".to_string(), PartitionAction::Create)]);
        let second = writer.commit(&batch(&[40, 50])).unwrap();
        assert_eq!(second.class, CommitClass::Append);
        let third = writer.commit(&batch(&[15, 45])).unwrap();
        assert_eq!(third.class, CommitClass::Merge);
        assert_eq!(third.txn, 3);

        assert_eq!(column(&table, "ts.d"), vec![10, 15, 20, 30, 40, 45, 50]);
        assert_eq!(column(&table, "v.d"), vec![100, 150, 200, 300, 400, 450, 500]);
        assert_eq!(writer.row_count(), 7);
        assert_eq!(writer.max_timestamp(), Some(50));
        assert!(!table.join("default.old-3").exists());
        assert!(!table.join("default.o3-3").exists());
    }

    #[test]
    fn test_empty_batch_is_noop() {
        let dir = tempdir().unwrap();
        let mut writer = TableWriter::create(&dir.path().join("t"), meta(), config()).unwrap();
        let summary = writer.commit(&batch(&[])).unwrap();
        assert_eq!(summary.rows, 0);
        assert_eq!(writer.txn_state().txn, 0);
    }

    #[test]
    fn test_recover_restores_unpublished_merge() {
        let dir = tempdir().unwrap();
        let table = dir.path().join("t");
        let mut writer = TableWriter::create(&table, meta(), config()).unwrap();
        writer.commit(&batch(&[10, 20])).unwrap();
        drop(writer);

        // crash between swapping directories and writing _txn.json for txn 2
        fs::rename(table.join("default"), table.join("default.old-2")).unwrap();
        fs::create_dir(table.join("default")).unwrap();
        fs::create_dir(table.join("default.o3-2")).unwrap();

        let writer = TableWriter::open(&table, config()).unwrap();
        assert!(!table.join("default.old-2").exists());
        assert!(!table.join("default.o3-2").exists());
        assert_eq!(column(&table, "ts.d"), vec![10, 20]);
        assert_eq!(writer.row_count(), 2);
    }
}
