//! Timestamp merge index
//!
//! One entry per output row of a merge region, naming the source the row is
//! copied from. Existing data wins ties, so same-timestamp rows keep the order
//! in which they were committed.

use rayon::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeSource {
    /// Row of the partition already on disk
    Data,
    /// Row of the out-of-order batch
    Ooo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeEntry {
    pub source: MergeSource,
    /// Row index inside its source
    pub row: u64,
}

#[derive(Debug, Default)]
pub struct MergeIndex {
    entries: Vec<MergeEntry>,
}

impl MergeIndex {
    /// Interleave two ascending timestamp runs.
    ///
    /// `data_ts[i]` is the timestamp of partition row `data_base + i`;
    /// `ooo_ts[j]` is the timestamp of out-of-order row `j`.
    pub fn build(data_ts: &[i64], data_base: u64, ooo_ts: &[i64]) -> Self {
        let mut entries = Vec::with_capacity(data_ts.len() + ooo_ts.len());
        let (mut i, mut j) = (0usize, 0usize);

        while i < data_ts.len() && j < ooo_ts.len() {
            if data_ts[i] <= ooo_ts[j] {
                entries.push(MergeEntry {
                    source: MergeSource::Data,
                    row: data_base + i as u64,
                });
                i += 1;
            } else {
                entries.push(MergeEntry {
                    source: MergeSource::Ooo,
                    row: j as u64,
                });
                j += 1;
            }
        }
        entries.extend((i..data_ts.len()).map(|i| MergeEntry {
            source: MergeSource::Data,
            row: data_base + i as u64,
        }));
        entries.extend((j..ooo_ts.len()).map(|j| MergeEntry {
            source: MergeSource::Ooo,
            row: j as u64,
        }));

        Self { entries }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[MergeEntry] {
        &self.entries
    }
}

/// Row order that sorts `timestamps` ascending, keeping arrival order for
/// equal timestamps
pub fn sort_permutation(timestamps: &[i64]) -> Vec<usize> {
    let mut order: Vec<usize> = (0..timestamps.len()).collect();
    // par_sort_by_key is a stable merge sort
    order.par_sort_by_key(|&row| timestamps[row]);
    order
}
