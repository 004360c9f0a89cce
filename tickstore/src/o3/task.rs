//! Column copy/merge task
//!
//! A partition job is cut into one [`CopyTask`] per column. Each task writes a
//! complete destination column from an ordered list of [`CopyBlock`]s, then
//! reports to the partition's column counter. Tasks are built fresh per
//! dispatch and never mutated after construction.

use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use byteorder::{ByteOrder, LittleEndian};

use super::merge_index::{MergeIndex, MergeSource};
use super::progress::PartitionProgress;
use crate::config::StoreConfig;
use crate::storage::{FixedColumn, KeyIndex, VarColumn};
use crate::table::ColumnDef;
use crate::{retry_transient, Result, StoreError};

/// One contiguous piece of a destination column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyBlock {
    /// Existing partition rows `[lo, hi)`, copied verbatim
    Data { lo: u64, hi: u64 },
    /// Out-of-order rows `[lo, hi)`, copied verbatim
    Ooo { lo: u64, hi: u64 },
    /// Rows interleaved by the partition's merge index
    Merge,
}

/// Out-of-order values of one column, already in timestamp order.
///
/// Fixed-width columns keep packed records in `fix`. Variable-length columns
/// keep `u64` start offsets in `fix` and the payload bytes in `var`.
#[derive(Debug, Clone, Default)]
pub struct OooColumnData {
    pub fix: Vec<u8>,
    pub var: Option<Vec<u8>>,
}

impl OooColumnData {
    pub fn fixed(records: Vec<u8>) -> Self {
        Self { fix: records, var: None }
    }

    pub fn variable(offsets: Vec<u8>, payload: Vec<u8>) -> Self {
        Self {
            fix: offsets,
            var: Some(payload),
        }
    }

    /// Packed records `[lo, hi)` of a fixed-width column
    pub fn records(&self, lo: u64, hi: u64, width: usize) -> Result<&[u8]> {
        let (start, end) = (lo as usize * width, hi as usize * width);
        if lo > hi || end > self.fix.len() {
            return Err(StoreError::OutOfBounds {
                index: hi,
                size: (self.fix.len() / width.max(1)) as u64,
            });
        }
        Ok(&self.fix[start..end])
    }

    /// Payload of one row of a variable-length column
    pub fn value(&self, row: u64) -> Result<&[u8]> {
        let payload = self
            .var
            .as_deref()
            .ok_or_else(|| StoreError::SchemaMismatch("fixed-width data read as variable".into()))?;
        let rows = (self.fix.len() / 8) as u64;
        if row >= rows {
            return Err(StoreError::OutOfBounds { index: row, size: rows });
        }
        let at = row as usize * 8;
        let start = LittleEndian::read_u64(&self.fix[at..at + 8]) as usize;
        let end = if row + 1 < rows {
            LittleEndian::read_u64(&self.fix[at + 8..at + 16]) as usize
        } else {
            payload.len()
        };
        payload.get(start..end).ok_or_else(|| {
            StoreError::InvalidBatch(format!("row {} spans {}..{} of {} payload bytes", row, start, end, payload.len()))
        })
    }
}

/// Everything needed to rebuild one partition
#[derive(Debug)]
pub struct PartitionJob {
    pub name: String,
    /// Existing partition directory; `None` for a partition being created
    pub src_dir: Option<PathBuf>,
    /// Staging directory receiving the rebuilt columns
    pub dst_dir: PathBuf,
    pub blocks: Vec<CopyBlock>,
    pub merge_index: MergeIndex,
    pub output_rows: u64,
    pub columns: Vec<(ColumnDef, OooColumnData)>,
}

/// Immutable descriptor of one column's share of a partition job
pub struct CopyTask {
    partition: Arc<str>,
    column: ColumnDef,
    src_dir: Option<Arc<Path>>,
    dst_dir: Arc<Path>,
    blocks: Arc<[CopyBlock]>,
    merge_index: Arc<MergeIndex>,
    ooo: OooColumnData,
    output_rows: u64,
    distinct_hint: u64,
    column_page_size: u64,
    arena_page_size: usize,
    retry_budget: u32,
    progress: Arc<PartitionProgress>,
}

impl CopyTask {
    /// Split a partition job into per-column tasks sharing one column counter
    pub fn for_partition(job: PartitionJob, config: &StoreConfig, progress: Arc<PartitionProgress>) -> Vec<CopyTask> {
        let partition: Arc<str> = Arc::from(job.name.as_str());
        let src_dir: Option<Arc<Path>> = job.src_dir.map(Arc::from);
        let dst_dir: Arc<Path> = Arc::from(job.dst_dir);
        let blocks: Arc<[CopyBlock]> = Arc::from(job.blocks);
        let merge_index = Arc::new(job.merge_index);

        job.columns
            .into_iter()
            .map(|(column, ooo)| CopyTask {
                partition: partition.clone(),
                distinct_hint: column.distinct_hint.unwrap_or(config.index_distinct_hint),
                column,
                src_dir: src_dir.clone(),
                dst_dir: dst_dir.clone(),
                blocks: blocks.clone(),
                merge_index: merge_index.clone(),
                ooo,
                output_rows: job.output_rows,
                column_page_size: config.column_page_size,
                arena_page_size: config.arena_page_size,
                retry_budget: config.retry_budget,
                progress: progress.clone(),
            })
            .collect()
    }

    pub fn column(&self) -> &ColumnDef {
        &self.column
    }

    /// Whether existing partition rows are rewritten
    pub fn partition_mutates(&self) -> bool {
        self.src_dir.is_some()
    }

    pub fn is_indexed(&self) -> bool {
        self.column.indexed
    }

    /// Write the destination column and report to the column counter
    pub fn run(self) {
        if self.progress.commit().has_failed() {
            // commit is already lost; just count down
            self.progress.column_done(Ok(()));
            return;
        }

        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            retry_transient(self.retry_budget, || self.copy_column())
        }))
        .unwrap_or_else(|_| {
            Err(StoreError::WorkerPool(format!(
                "copy task {}/{} panicked",
                self.partition, self.column.name
            )))
        });

        match &outcome {
            Ok(()) => log::debug!(
                "O3 column {}/{} done: {} rows in {:?} (mutates: {})",
                self.partition,
                self.column.name,
                self.output_rows,
                started.elapsed(),
                self.partition_mutates()
            ),
            Err(e) => log::warn!("O3 column {}/{} failed: {}", self.partition, self.column.name, e),
        }
        self.progress.column_done(outcome);
    }

    fn copy_column(&self) -> Result<()> {
        match self.column.column_type.fixed_width() {
            Some(width) => self.copy_fixed(width),
            None => self.copy_var(),
        }
    }

    fn source_dir(&self) -> Result<&Path> {
        self.src_dir.as_deref().ok_or_else(|| {
            StoreError::InvalidArgument(format!("partition {} has no existing data to copy", self.partition))
        })
    }

    fn needs_source(&self) -> bool {
        self.blocks
            .iter()
            .any(|b| matches!(b, CopyBlock::Data { .. } | CopyBlock::Merge))
    }

    fn copy_fixed(&self, width: usize) -> Result<()> {
        let src = if self.needs_source() {
            let path = self.source_dir()?.join(self.column.data_file());
            Some(FixedColumn::open(&path, self.column_page_size)?)
        } else {
            None
        };

        let dst_path = self.dst_dir.join(self.column.data_file());
        let mut dst = FixedColumn::create(&dst_path, width, self.column_page_size)?;
        dst.reserve(self.output_rows)?;

        for block in self.blocks.iter() {
            match *block {
                CopyBlock::Data { lo, hi } => {
                    dst.append_block(require(&src)?.records(lo, hi)?)?;
                }
                CopyBlock::Ooo { lo, hi } => {
                    dst.append_block(self.ooo.records(lo, hi, width)?)?;
                }
                CopyBlock::Merge => {
                    let src = require(&src)?;
                    for entry in self.merge_index.entries() {
                        match entry.source {
                            MergeSource::Data => dst.append_bytes(src.record(entry.row)?)?,
                            MergeSource::Ooo => dst.append_bytes(self.ooo.records(entry.row, entry.row + 1, width)?)?,
                        };
                    }
                }
            }
        }

        self.check_rows(dst.size())?;
        dst.commit()?;

        if self.column.indexed {
            let index = KeyIndex::rebuild(&dst, self.distinct_hint, self.arena_page_size)?;
            index.save(&self.dst_dir.join(self.column.index_file()))?;
        }
        Ok(())
    }

    fn copy_var(&self) -> Result<()> {
        let src = if self.needs_source() {
            let dir = self.source_dir()?;
            Some(VarColumn::open(
                &dir.join(self.column.offsets_file()),
                &dir.join(self.column.data_file()),
                self.column_page_size,
            )?)
        } else {
            None
        };

        let mut dst = VarColumn::create(
            &self.dst_dir.join(self.column.offsets_file()),
            &self.dst_dir.join(self.column.data_file()),
            self.column_page_size,
        )?;
        let payload_bytes = src.as_ref().map_or(0, VarColumn::var_len)
            + self.ooo.var.as_ref().map_or(0, |v| v.len() as u64);
        dst.reserve(self.output_rows, payload_bytes)?;

        for block in self.blocks.iter() {
            match *block {
                CopyBlock::Data { lo, hi } => dst.copy_rows_from(require(&src)?, lo, hi)?,
                CopyBlock::Ooo { lo, hi } => {
                    for row in lo..hi {
                        dst.append(self.ooo.value(row)?)?;
                    }
                }
                CopyBlock::Merge => {
                    let src = require(&src)?;
                    for entry in self.merge_index.entries() {
                        match entry.source {
                            MergeSource::Data => dst.append(src.get(entry.row)?)?,
                            MergeSource::Ooo => dst.append(self.ooo.value(entry.row)?)?,
                        };
                    }
                }
            }
        }

        self.check_rows(dst.len())?;
        dst.commit()
    }

    fn check_rows(&self, written: u64) -> Result<()> {
        if written != self.output_rows {
            return Err(StoreError::InvalidFileFormat(format!(
                "{}/{}: wrote {} rows, expected {}",
                self.partition, self.column.name, written, self.output_rows
            )));
        }
        Ok(())
    }
}

fn require<T>(source: &Option<T>) -> Result<&T> {
    source
        .as_ref()
        .ok_or_else(|| StoreError::InvalidArgument("copy block needs existing partition data".into()))
}
