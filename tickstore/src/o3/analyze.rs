//! Commit analysis
//!
//! Splits a timestamp-sorted batch by partition and decides, per partition,
//! whether its rows can be appended, must be merged with the rows already on
//! disk, or start a new partition. Merge boundaries come from
//! [`FixedColumn::edge_search`] on the partition's timestamp column, so only
//! the overlapping middle of a partition is interleaved row by row.

use byteorder::{ByteOrder, LittleEndian};

use super::merge_index::MergeIndex;
use super::task::CopyBlock;
use crate::storage::{BSearchType, FixedColumn, PartitionBy};
use crate::{Result, StoreError};

/// Shape of a whole commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitClass {
    /// Every row lands at or after the end of its partition
    Append,
    /// Rows overlap data already committed to one partition
    Merge,
    /// Rows span more than one partition
    Split,
}

/// What happens to one partition touched by a commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionAction {
    /// Rows appended in place
    Append,
    /// Existing rows rewritten together with the new ones
    Merge,
    /// Partition does not exist yet
    Create,
}

/// Existing partition as seen by the analysis
pub struct PartitionSource {
    /// Committed row count
    pub row_count: u64,
    /// The partition's designated timestamp column
    pub timestamps: FixedColumn,
}

#[derive(Debug)]
pub struct PartitionPlan {
    pub floor: i64,
    pub name: String,
    pub action: PartitionAction,
    /// Range of the sorted batch that falls into this partition
    pub ooo_lo: usize,
    pub ooo_hi: usize,
    pub ooo_ts_min: i64,
    pub ooo_ts_max: i64,
    pub data_row_count: u64,
    pub data_ts_min: Option<i64>,
    pub data_ts_max: Option<i64>,
    /// Data rows `[0, prefix_hi)` sort at or before the first batch row
    pub prefix_hi: u64,
    /// Data rows `[merge_data_hi, data_row_count)` sort after the last batch row
    pub merge_data_hi: u64,
    /// Interleaving of data rows `[prefix_hi, merge_data_hi)` with the batch
    /// rows; empty unless the action is `Merge`
    pub merge_index: MergeIndex,
}

impl PartitionPlan {
    pub fn ooo_rows(&self) -> u64 {
        (self.ooo_hi - self.ooo_lo) as u64
    }

    pub fn output_rows(&self) -> u64 {
        self.data_row_count + self.ooo_rows()
    }

    pub fn min_timestamp(&self) -> i64 {
        self.data_ts_min.map_or(self.ooo_ts_min, |d| d.min(self.ooo_ts_min))
    }

    pub fn max_timestamp(&self) -> i64 {
        self.data_ts_max.map_or(self.ooo_ts_max, |d| d.max(self.ooo_ts_max))
    }

    /// Destination layout of the rebuilt partition
    pub fn blocks(&self) -> Vec<CopyBlock> {
        let ooo = CopyBlock::Ooo {
            lo: 0,
            hi: self.ooo_rows(),
        };
        match self.action {
            PartitionAction::Create => vec![ooo],
            PartitionAction::Append => {
                let mut blocks = Vec::with_capacity(2);
                if self.data_row_count > 0 {
                    blocks.push(CopyBlock::Data {
                        lo: 0,
                        hi: self.data_row_count,
                    });
                }
                blocks.push(ooo);
                blocks
            }
            PartitionAction::Merge => {
                let mut blocks = Vec::with_capacity(3);
                if self.prefix_hi > 0 {
                    blocks.push(CopyBlock::Data {
                        lo: 0,
                        hi: self.prefix_hi,
                    });
                }
                blocks.push(CopyBlock::Merge);
                if self.merge_data_hi < self.data_row_count {
                    blocks.push(CopyBlock::Data {
                        lo: self.merge_data_hi,
                        hi: self.data_row_count,
                    });
                }
                blocks
            }
        }
    }
}

#[derive(Debug)]
pub struct CommitPlan {
    pub class: CommitClass,
    pub partitions: Vec<PartitionPlan>,
}

impl CommitPlan {
    /// Partitions that go through the worker pool
    pub fn rewrites(&self) -> impl Iterator<Item = &PartitionPlan> {
        self.partitions
            .iter()
            .filter(|p| p.action != PartitionAction::Append)
    }

    /// Partitions appended in place
    pub fn appends(&self) -> impl Iterator<Item = &PartitionPlan> {
        self.partitions
            .iter()
            .filter(|p| p.action == PartitionAction::Append)
    }
}

/// Classify a batch whose timestamps are `sorted_ts` (ascending).
///
/// `locate(floor, name)` returns the existing partition for a floor, if any.
/// Nothing is written; a failed analysis leaves no trace.
pub fn analyze<F>(sorted_ts: &[i64], partition_by: PartitionBy, mut locate: F) -> Result<CommitPlan>
where
    F: FnMut(i64, &str) -> Result<Option<PartitionSource>>,
{
    let mut partitions = Vec::new();
    let mut lo = 0usize;

    while lo < sorted_ts.len() {
        let floor = partition_by.floor(sorted_ts[lo])?;
        let hi = match partition_by.next_floor(floor)? {
            Some(next) => lo + sorted_ts[lo..].partition_point(|&ts| ts < next),
            None => sorted_ts.len(),
        };
        if hi == lo {
            return Err(StoreError::InvalidBatch(format!(
                "timestamp {} falls outside partition starting at {}",
                sorted_ts[lo], floor
            )));
        }
        let name = partition_by.dir_name(floor)?;
        let source = locate(floor, &name)?;
        partitions.push(plan_partition(floor, name, &sorted_ts[lo..hi], lo, source)?);
        lo = hi;
    }

    let class = if partitions.len() > 1 {
        CommitClass::Split
    } else if partitions.iter().any(|p| p.action == PartitionAction::Merge) {
        CommitClass::Merge
    } else {
        CommitClass::Append
    };

    Ok(CommitPlan { class, partitions })
}

fn plan_partition(
    floor: i64,
    name: String,
    ooo_ts: &[i64],
    ooo_lo: usize,
    source: Option<PartitionSource>,
) -> Result<PartitionPlan> {
    let ooo_ts_min = ooo_ts[0];
    let ooo_ts_max = ooo_ts[ooo_ts.len() - 1];
    let mut plan = PartitionPlan {
        floor,
        name,
        action: PartitionAction::Create,
        ooo_lo,
        ooo_hi: ooo_lo + ooo_ts.len(),
        ooo_ts_min,
        ooo_ts_max,
        data_row_count: 0,
        data_ts_min: None,
        data_ts_max: None,
        prefix_hi: 0,
        merge_data_hi: 0,
        merge_index: MergeIndex::empty(),
    };

    let Some(PartitionSource {
        row_count,
        mut timestamps,
    }) = source
    else {
        return Ok(plan);
    };

    if row_count > timestamps.size() {
        return Err(StoreError::InvalidFileFormat(format!(
            "{}: {} committed rows recorded but timestamp column holds {}",
            plan.name,
            row_count,
            timestamps.size()
        )));
    }
    // rows past the committed count belong to an unfinished commit
    timestamps.truncate(row_count)?;

    plan.action = PartitionAction::Append;
    plan.data_row_count = row_count;
    plan.prefix_hi = row_count;
    plan.merge_data_hi = row_count;
    if row_count == 0 {
        return Ok(plan);
    }

    let data_min = timestamps.get::<i64>(0)?;
    let data_max = timestamps.get::<i64>(row_count - 1)?;
    plan.data_ts_min = Some(data_min);
    plan.data_ts_max = Some(data_max);
    if ooo_ts_min >= data_max {
        return Ok(plan);
    }

    plan.action = PartitionAction::Merge;
    plan.prefix_hi = rows_at_or_before(&timestamps, ooo_ts_min)?;
    plan.merge_data_hi = rows_at_or_before(&timestamps, ooo_ts_max)?;

    let data_ts: Vec<i64> = timestamps
        .records(plan.prefix_hi, plan.merge_data_hi)?
        .chunks_exact(8)
        .map(LittleEndian::read_i64)
        .collect();
    plan.merge_index = MergeIndex::build(&data_ts, plan.prefix_hi, ooo_ts);
    Ok(plan)
}

/// Number of leading rows with timestamp `<= ts`
fn rows_at_or_before(timestamps: &FixedColumn, ts: i64) -> Result<u64> {
    let found = timestamps.edge_search(ts, BSearchType::OlderOrSame)?;
    Ok(if found < 0 { 0 } else { found as u64 + 1 })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::o3::merge_index::MergeSource;
    use std::path::Path;
    use tempfile::tempdir;

    const HOUR: i64 = 3_600_000_000;

    fn ts_column(dir: &Path, name: &str, values: &[i64]) -> FixedColumn {
        let mut col = FixedColumn::create(&dir.join(name), 8, 4096).unwrap();
        for &v in values {
            col.append(v).unwrap();
        }
        col.commit().unwrap();
        col
    }

    #[test]
    fn test_new_partition_is_created() {
        let plan = analyze(&[HOUR, 2 * HOUR], PartitionBy::Day, |_, _| Ok(None)).unwrap();
        assert_eq!(plan.class, CommitClass::Append);
        assert_eq!(plan.partitions.len(), 1);
        let p = &plan.partitions[0];
        assert_eq!(p.action, PartitionAction::Create);
        assert_eq!(p.name, "1970-01-01");
        assert_eq!(p.blocks(), vec![CopyBlock::Ooo { lo: 0, hi: 2 }]);
    }

    #[test]
    fn test_batch_after_data_appends() {
        let dir = tempdir().unwrap();
        let existing = [10, 20, 30];
        let plan = analyze(&[30, 40], PartitionBy::None, |_, _| {
            Ok(Some(PartitionSource {
                row_count: 3,
                timestamps: ts_column(dir.path(), "ts.d", &existing),
            }))
        })
        .unwrap();

        assert_eq!(plan.class, CommitClass::Append);
        let p = &plan.partitions[0];
        assert_eq!(p.action, PartitionAction::Append);
        assert_eq!(p.output_rows(), 5);
        assert_eq!((p.min_timestamp(), p.max_timestamp()), (10, 40));
        assert_eq!(plan.appends().count(), 1);
        assert_eq!(plan.rewrites().count(), 0);
    }

    #[test]
    fn test_overlap_merges_only_the_middle() {
        let dir = tempdir().unwrap();
        let existing = [10, 20, 20, 30, 40, 50];
        let batch = [20, 35];
        let plan = analyze(&batch, PartitionBy::None, |_, _| {
            Ok(Some(PartitionSource {
                row_count: 6,
                timestamps: ts_column(dir.path(), "ts.d", &existing),
            }))
        })
        .unwrap();

        assert_eq!(plan.class, CommitClass::Merge);
        let p = &plan.partitions[0];
        assert_eq!(p.action, PartitionAction::Merge);
        // 10, 20, 20 sort at or before 20; 40, 50 sort after 35
        assert_eq!((p.prefix_hi, p.merge_data_hi), (3, 4));
        assert_eq!(
            p.blocks(),
            vec![
                CopyBlock::Data { lo: 0, hi: 3 },
                CopyBlock::Merge,
                CopyBlock::Data { lo: 4, hi: 6 },
            ]
        );
        let entries: Vec<(MergeSource, u64)> = p.merge_index.entries().iter().map(|e| (e.source, e.row)).collect();
        assert_eq!(
            entries,
            vec![(MergeSource::Ooo, 0), (MergeSource::Data, 3), (MergeSource::Ooo, 1)]
        );
        assert_eq!(p.output_rows(), 8);
    }

    #[test]
    fn test_uncommitted_tail_ignored() {
        let dir = tempdir().unwrap();
        let plan = analyze(&[25], PartitionBy::None, |_, _| {
            // 99 was appended by a commit that never published
            Ok(Some(PartitionSource {
                row_count: 2,
                timestamps: ts_column(dir.path(), "ts.d", &[10, 20, 99]),
            }))
        })
        .unwrap();
        assert_eq!(plan.partitions[0].action, PartitionAction::Append);
        assert_eq!(plan.partitions[0].data_row_count, 2);
    }

    #[test]
    fn test_batch_spanning_partitions_splits() {
        let dir = tempdir().unwrap();
        let day = 24 * HOUR;
        let batch = [HOUR, 2 * HOUR, day + HOUR, 3 * day];
        let mut seen = Vec::new();
        let plan = analyze(&batch, PartitionBy::Day, |floor, name| {
            seen.push(name.to_string());
            if floor == day {
                Ok(Some(PartitionSource {
                    row_count: 1,
                    timestamps: ts_column(dir.path(), "d1.d", &[day + 2 * HOUR]),
                }))
            } else {
                Ok(None)
            }
        })
        .unwrap();

        assert_eq!(plan.class, CommitClass::Split);
        assert_eq!(seen, vec!["1970-01-01", "1970-01-02", "1970-01-04"]);
        let actions: Vec<_> = plan.partitions.iter().map(|p| p.action).collect();
        assert_eq!(
            actions,
            vec![PartitionAction::Create, PartitionAction::Merge, PartitionAction::Create]
        );
        let ranges: Vec<_> = plan.partitions.iter().map(|p| (p.ooo_lo, p.ooo_hi)).collect();
        assert_eq!(ranges, vec![(0, 2), (2, 3), (3, 4)]);
        assert_eq!(plan.rewrites().count(), 3);
    }

    #[test]
    fn test_short_timestamp_column_rejected() {
        let dir = tempdir().unwrap();
        let result = analyze(&[5], PartitionBy::None, |_, _| {
            Ok(Some(PartitionSource {
                row_count: 4,
                timestamps: ts_column(dir.path(), "ts.d", &[1, 2]),
            }))
        });
        assert!(matches!(result, Err(StoreError::InvalidFileFormat(_))));
    }

    #[test]
    fn test_extreme_timestamps_unpartitioned() {
        let plan = analyze(&[i64::MIN, 5, i64::MAX], PartitionBy::None, |_, _| Ok(None)).unwrap();
        assert_eq!(plan.partitions.len(), 1);
        let p = &plan.partitions[0];
        assert_eq!((p.ooo_lo, p.ooo_hi), (0, 3));
        assert_eq!((p.min_timestamp(), p.max_timestamp()), (i64::MIN, i64::MAX));
    }

    #[test]
    fn test_extreme_timestamps_partitioned_rejected() {
        let result = analyze(&[5, i64::MAX], PartitionBy::Day, |_, _| Ok(None));
        assert!(matches!(result, Err(StoreError::InvalidBatch(_))));
        let result = analyze(&[i64::MIN, 5], PartitionBy::Hour, |_, _| Ok(None));
        assert!(matches!(result, Err(StoreError::InvalidBatch(_))));
    }
}
