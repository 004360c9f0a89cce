//! Fixed-width column storage
//!
//! A column is one memory-mapped file: a [`ColumnHeader`] followed by densely
//! packed little-endian records. Appends grow the mapping in page-sized
//! steps; `commit` makes the current logical size durable by flushing the new
//! records first and then rewriting the header's committed row count.

use std::path::Path;

use super::file::MappedFile;
use super::header::{ColumnHeader, COLUMN_HEADER_SIZE};
use crate::{Result, StoreError};

const DATA_START: u64 = COLUMN_HEADER_SIZE as u64;

/// Boundary policy for [`FixedColumn::edge_search`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BSearchType {
    /// Smallest index whose value is `>=` the target (first of any duplicates)
    NewerOrSame,
    /// Largest index whose value is `<=` the target (last of any duplicates)
    OlderOrSame,
}

/// Decode a negative edge-search result into the row it would be inserted at.
///
/// Misses are encoded as `-(insertion_point + 1)`: `-1` means "before the
/// first row", `-(size + 1)` means "after the last row".
#[inline]
pub fn edge_insertion_point(encoded: i64) -> Option<u64> {
    if encoded < 0 {
        Some((-(encoded + 1)) as u64)
    } else {
        None
    }
}

/// A value with a fixed little-endian encoding
pub trait FixedValue: Copy {
    const WIDTH: usize;
    fn write_le(self, out: &mut [u8]);
    fn read_le(bytes: &[u8]) -> Self;
}

macro_rules! impl_fixed_value {
    ($($t:ty),*) => {
        $(
            impl FixedValue for $t {
                const WIDTH: usize = std::mem::size_of::<$t>();

                #[inline]
                fn write_le(self, out: &mut [u8]) {
                    out[..Self::WIDTH].copy_from_slice(&self.to_le_bytes());
                }

                #[inline]
                fn read_le(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; std::mem::size_of::<$t>()];
                    raw.copy_from_slice(&bytes[..Self::WIDTH]);
                    <$t>::from_le_bytes(raw)
                }
            }
        )*
    };
}

impl_fixed_value!(i8, u8, i16, i32, i64, u64, f32, f64);

/// Append-only, fixed-width column backed by a memory-mapped file
pub struct FixedColumn {
    file: MappedFile,
    /// Record width in bytes
    width: usize,
    /// Write-visible row count
    size: u64,
    /// Durable row count, as recorded in the header
    committed: u64,
}

impl FixedColumn {
    /// Create an empty column file
    pub fn create(path: &Path, width: usize, page_size: u64) -> Result<Self> {
        if width == 0 {
            return Err(StoreError::InvalidArgument("column width must be positive".into()));
        }
        let mut file = MappedFile::create(path, DATA_START, page_size)?;
        file.write_at(0, &ColumnHeader::new(width as u32).to_bytes())?;
        file.flush_range(0, COLUMN_HEADER_SIZE)?;
        Ok(Self {
            file,
            width,
            size: 0,
            committed: 0,
        })
    }

    /// Open an existing column; the logical size is the committed row count
    pub fn open(path: &Path, page_size: u64) -> Result<Self> {
        let file = MappedFile::open(path, page_size)?;
        let header = ColumnHeader::from_bytes(file.read_at(0, COLUMN_HEADER_SIZE)?)?;
        let width = header.width as usize;

        let needed = DATA_START + header.committed_rows * width as u64;
        if needed > file.capacity() {
            return Err(StoreError::InvalidFileFormat(format!(
                "{}: header claims {} rows but file holds {} bytes",
                path.display(),
                header.committed_rows,
                file.capacity()
            )));
        }

        Ok(Self {
            file,
            width,
            size: header.committed_rows,
            committed: header.committed_rows,
        })
    }

    /// Open `path` if it exists, otherwise create it
    pub fn open_or_create(path: &Path, width: usize, page_size: u64) -> Result<Self> {
        if path.exists() {
            let column = Self::open(path, page_size)?;
            if column.width != width {
                return Err(StoreError::SchemaMismatch(format!(
                    "{}: width {} on disk, {} expected",
                    path.display(),
                    column.width,
                    width
                )));
            }
            Ok(column)
        } else {
            Self::create(path, width, page_size)
        }
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Current logical row count
    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Row count last made durable by `commit`
    #[inline]
    pub fn committed_size(&self) -> u64 {
        self.committed
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    #[inline]
    fn offset_of(&self, row: u64) -> u64 {
        DATA_START + row * self.width as u64
    }

    /// Make room for `rows` more records without remapping on every append
    pub fn reserve(&mut self, rows: u64) -> Result<()> {
        let required = self.offset_of(self.size + rows);
        self.file.ensure_capacity(required)
    }

    /// Append one raw record, returning its row index
    pub fn append_bytes(&mut self, record: &[u8]) -> Result<u64> {
        if record.len() != self.width {
            return Err(StoreError::InvalidArgument(format!(
                "record of {} bytes for width {}",
                record.len(),
                self.width
            )));
        }
        self.append_block(record)?;
        Ok(self.size - 1)
    }

    /// Append a run of packed records
    pub fn append_block(&mut self, records: &[u8]) -> Result<()> {
        if records.len() % self.width != 0 {
            return Err(StoreError::InvalidArgument(format!(
                "block of {} bytes is not a multiple of width {}",
                records.len(),
                self.width
            )));
        }
        let rows = (records.len() / self.width) as u64;
        if rows == 0 {
            return Ok(());
        }
        self.reserve(rows)?;
        let offset = self.offset_of(self.size);
        self.file.write_at(offset, records)?;
        self.size += rows;
        Ok(())
    }

    /// Raw bytes of one record
    pub fn record(&self, row: u64) -> Result<&[u8]> {
        if row >= self.size {
            return Err(StoreError::OutOfBounds {
                index: row,
                size: self.size,
            });
        }
        self.file.read_at(self.offset_of(row), self.width)
    }

    /// Raw bytes of rows `[lo, hi)`
    pub fn records(&self, lo: u64, hi: u64) -> Result<&[u8]> {
        if hi > self.size || lo > hi {
            return Err(StoreError::OutOfBounds {
                index: hi,
                size: self.size,
            });
        }
        let len = ((hi - lo) as usize) * self.width;
        self.file.read_at(self.offset_of(lo), len)
    }

    /// Overwrite an existing record
    pub fn put_bytes(&mut self, row: u64, record: &[u8]) -> Result<()> {
        if row >= self.size {
            return Err(StoreError::OutOfBounds {
                index: row,
                size: self.size,
            });
        }
        if record.len() != self.width {
            return Err(StoreError::InvalidArgument(format!(
                "record of {} bytes for width {}",
                record.len(),
                self.width
            )));
        }
        let offset = self.offset_of(row);
        self.file.write_at(offset, record)
    }

    fn check_width<T: FixedValue>(&self) -> Result<()> {
        if T::WIDTH != self.width {
            return Err(StoreError::SchemaMismatch(format!(
                "value width {} on column of width {}",
                T::WIDTH,
                self.width
            )));
        }
        Ok(())
    }

    /// Append a typed value
    pub fn append<T: FixedValue>(&mut self, value: T) -> Result<u64> {
        self.check_width::<T>()?;
        let mut buf = [0u8; 8];
        value.write_le(&mut buf);
        self.append_bytes(&buf[..T::WIDTH])
    }

    /// Read a typed value
    pub fn get<T: FixedValue>(&self, row: u64) -> Result<T> {
        self.check_width::<T>()?;
        Ok(T::read_le(self.record(row)?))
    }

    /// Overwrite a typed value
    pub fn put<T: FixedValue>(&mut self, row: u64, value: T) -> Result<()> {
        self.check_width::<T>()?;
        let mut buf = [0u8; 8];
        value.write_le(&mut buf);
        self.put_bytes(row, &buf[..T::WIDTH])
    }

    /// Reset the logical size. File space is kept for later appends.
    pub fn truncate(&mut self, rows: u64) -> Result<()> {
        if rows > self.size {
            return Err(StoreError::OutOfBounds {
                index: rows,
                size: self.size,
            });
        }
        self.size = rows;
        Ok(())
    }

    /// Publish the current logical size.
    ///
    /// New records are flushed before the header so the committed count never
    /// points at bytes that are not yet on disk.
    pub fn commit(&mut self) -> Result<()> {
        if self.size > self.committed {
            let start = self.offset_of(self.committed);
            let len = ((self.size - self.committed) as usize) * self.width;
            self.file.flush_range(start, len)?;
        }
        let mut header = ColumnHeader::new(self.width as u32);
        header.committed_rows = self.size;
        self.file.write_at(0, &header.to_bytes())?;
        self.file.flush_range(0, COLUMN_HEADER_SIZE)?;
        self.committed = self.size;
        Ok(())
    }

    /// Duplicate-aware binary search over an ascending column of `i64`.
    ///
    /// Returns the boundary row for the policy, or `-(insertion_point + 1)` when
    /// no row qualifies: `-1` for `OlderOrSame` below every value and
    /// `-(size + 1)` for `NewerOrSame` above every value.
    pub fn edge_search(&self, value: i64, policy: BSearchType) -> Result<i64> {
        self.check_width::<i64>()?;
        let size = self.size;
        match policy {
            BSearchType::NewerOrSame => {
                // first row with column[row] >= value
                let idx = self.partition_point(|v| v < value)?;
                if idx == size {
                    Ok(-(size as i64) - 1)
                } else {
                    Ok(idx as i64)
                }
            }
            BSearchType::OlderOrSame => {
                // last row with column[row] <= value
                let idx = self.partition_point(|v| v <= value)?;
                if idx == 0 {
                    Ok(-1)
                } else {
                    Ok(idx as i64 - 1)
                }
            }
        }
    }

    /// First row for which `pred` is false, assuming `pred` holds on a prefix
    fn partition_point<F>(&self, pred: F) -> Result<u64>
    where
        F: Fn(i64) -> bool,
    {
        let mut lo = 0u64;
        let mut hi = self.size;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if pred(self.get::<i64>(mid)?) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }
}
