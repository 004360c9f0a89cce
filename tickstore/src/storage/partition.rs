//! Time partitioning
//!
//! Timestamps are microseconds since the Unix epoch (UTC). A partition covers
//! `[floor, next_floor)` and is stored in a directory named after its floor.

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::{Result, StoreError};

const MICROS_PER_HOUR: i64 = 3_600_000_000;
const MICROS_PER_DAY: i64 = 24 * MICROS_PER_HOUR;

/// Directory name of the single partition of an unpartitioned table
pub const DEFAULT_PARTITION_NAME: &str = "default";

/// How rows are bucketed into partition directories
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PartitionBy {
    /// Single partition holding every row
    None,
    Hour,
    #[default]
    Day,
    Month,
    Year,
}

impl PartitionBy {
    /// Start of the partition containing `ts`
    pub fn floor(self, ts: i64) -> Result<i64> {
        match self {
            PartitionBy::None => Ok(i64::MIN),
            PartitionBy::Hour => fixed_floor(ts, MICROS_PER_HOUR),
            PartitionBy::Day => fixed_floor(ts, MICROS_PER_DAY),
            PartitionBy::Month => {
                let dt = to_datetime(ts)?;
                start_of(dt.year(), dt.month())
            }
            PartitionBy::Year => {
                let dt = to_datetime(ts)?;
                start_of(dt.year(), 1)
            }
        }
    }

    /// Start of the partition following the one that starts at `floor`.
    ///
    /// `None` means the partition is unbounded above: the table is not
    /// partitioned, or the next floor does not fit in an `i64`.
    pub fn next_floor(self, floor: i64) -> Result<Option<i64>> {
        match self {
            PartitionBy::None => Ok(None),
            PartitionBy::Hour => Ok(floor.checked_add(MICROS_PER_HOUR)),
            PartitionBy::Day => Ok(floor.checked_add(MICROS_PER_DAY)),
            PartitionBy::Month => {
                let dt = to_datetime(floor)?;
                if dt.month() == 12 {
                    start_of(dt.year() + 1, 1).map(Some)
                } else {
                    start_of(dt.year(), dt.month() + 1).map(Some)
                }
            }
            PartitionBy::Year => {
                let dt = to_datetime(floor)?;
                start_of(dt.year() + 1, 1).map(Some)
            }
        }
    }

    /// Directory name for the partition starting at `floor`
    pub fn dir_name(self, floor: i64) -> Result<String> {
        let pattern = match self {
            PartitionBy::None => return Ok(DEFAULT_PARTITION_NAME.to_string()),
            PartitionBy::Hour => "%Y-%m-%dT%H",
            PartitionBy::Day => "%Y-%m-%d",
            PartitionBy::Month => "%Y-%m",
            PartitionBy::Year => "%Y",
        };
        Ok(to_datetime(floor)?.format(pattern).to_string())
    }
}

fn fixed_floor(ts: i64, unit: i64) -> Result<i64> {
    ts.div_euclid(unit)
        .checked_mul(unit)
        .ok_or_else(|| StoreError::InvalidBatch(format!("timestamp {} out of range", ts)))
}

fn to_datetime(ts: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(ts)
        .ok_or_else(|| StoreError::InvalidBatch(format!("timestamp {} out of range", ts)))
}

fn start_of(year: i32, month: u32) -> Result<i64> {
    NaiveDate::from_ymd_opt(year, month, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc().timestamp_micros())
        .ok_or_else(|| StoreError::InvalidBatch(format!("no partition for {}-{:02}", year, month)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn micros(y: i32, m: u32, d: u32, h: u32, min: u32) -> i64 {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, 0)
            .unwrap()
            .and_utc()
            .timestamp_micros()
    }

    #[test]
    fn test_floors() {
        let ts = micros(2024, 3, 15, 13, 45);
        assert_eq!(PartitionBy::Hour.floor(ts).unwrap(), micros(2024, 3, 15, 13, 0));
        assert_eq!(PartitionBy::Day.floor(ts).unwrap(), micros(2024, 3, 15, 0, 0));
        assert_eq!(PartitionBy::Month.floor(ts).unwrap(), micros(2024, 3, 1, 0, 0));
        assert_eq!(PartitionBy::Year.floor(ts).unwrap(), micros(2024, 1, 1, 0, 0));
        assert_eq!(PartitionBy::None.floor(ts).unwrap(), i64::MIN);
    }

    #[test]
    fn test_floor_before_epoch() {
        let ts = micros(1969, 12, 31, 23, 30);
        assert_eq!(PartitionBy::Day.floor(ts).unwrap(), micros(1969, 12, 31, 0, 0));
        assert_eq!(PartitionBy::Hour.floor(ts).unwrap(), micros(1969, 12, 31, 23, 0));
    }

    #[test]
    fn test_next_floor_rolls_over() {
        let dec = micros(2023, 12, 1, 0, 0);
        assert_eq!(PartitionBy::Month.next_floor(dec).unwrap(), Some(micros(2024, 1, 1, 0, 0)));
        let feb = micros(2024, 2, 1, 0, 0);
        assert_eq!(PartitionBy::Month.next_floor(feb).unwrap(), Some(micros(2024, 3, 1, 0, 0)));
        let day = micros(2024, 2, 29, 0, 0);
        assert_eq!(PartitionBy::Day.next_floor(day).unwrap(), Some(micros(2024, 3, 1, 0, 0)));
    }

    #[test]
    fn test_next_floor_unbounded() {
        assert_eq!(PartitionBy::None.next_floor(i64::MIN).unwrap(), None);
        let last_hour = PartitionBy::Hour.floor(i64::MAX).unwrap();
        assert_eq!(PartitionBy::Hour.next_floor(last_hour).unwrap(), None);
        let last_day = PartitionBy::Day.floor(i64::MAX).unwrap();
        assert_eq!(PartitionBy::Day.next_floor(last_day).unwrap(), None);
        // beyond the calendar range: an error, not a partition
        assert!(PartitionBy::Day.dir_name(last_day).is_err());
        assert!(PartitionBy::Month.floor(i64::MAX).is_err());
        assert!(PartitionBy::Day.floor(i64::MIN).is_err());
        assert!(PartitionBy::Hour.floor(i64::MIN).is_err());
    }

    #[test]
    fn test_dir_names() {
        let ts = micros(2024, 3, 5, 7, 0);
        assert_eq!(PartitionBy::Hour.dir_name(ts).unwrap(), "2024-03-05T07");
        assert_eq!(PartitionBy::Day.dir_name(ts).unwrap(), "2024-03-05");
        assert_eq!(PartitionBy::Month.dir_name(ts).unwrap(), "2024-03");
        assert_eq!(PartitionBy::Year.dir_name(ts).unwrap(), "2024");
        assert_eq!(PartitionBy::None.dir_name(i64::MIN).unwrap(), "default");
    }
}
