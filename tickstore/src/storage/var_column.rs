//! Variable-length column storage
//!
//! A fix/var file pair. The fix file is a [`FixedColumn`] of `u64` offsets,
//! one per row plus a trailing end offset; the var file is a width-1 column
//! holding the raw payload bytes back to back. Row `i` spans
//! `[fix[i], fix[i + 1])`.
//!
//! The committed end offset, not the var file's size, decides where the
//! payload ends. Bytes past it are left over from an interrupted commit and
//! are cut on open.

use std::path::Path;

use super::column::FixedColumn;
use crate::{Result, StoreError};

pub struct VarColumn {
    fix: FixedColumn,
    var: FixedColumn,
}

impl VarColumn {
    pub fn create(fix_path: &Path, var_path: &Path, page_size: u64) -> Result<Self> {
        let mut fix = FixedColumn::create(fix_path, 8, page_size)?;
        fix.append(0u64)?;
        fix.commit()?;
        Ok(Self {
            fix,
            var: FixedColumn::create(var_path, 1, page_size)?,
        })
    }

    pub fn open(fix_path: &Path, var_path: &Path, page_size: u64) -> Result<Self> {
        let fix = FixedColumn::open(fix_path, page_size)?;
        let mut var = FixedColumn::open(var_path, page_size)?;
        if fix.width() != 8 || var.width() != 1 || fix.size() == 0 {
            return Err(StoreError::InvalidFileFormat(format!(
                "{} is not a fix/var pair",
                fix_path.display()
            )));
        }
        let end = fix.get::<u64>(fix.size() - 1)?;
        if end > var.size() {
            return Err(StoreError::InvalidFileFormat(format!(
                "{}: end offset {} beyond payload size {}",
                fix_path.display(),
                end,
                var.size()
            )));
        }
        if end < var.size() {
            log::debug!(
                "{}: dropping {} uncommitted payload bytes",
                var_path.display(),
                var.size() - end
            );
            var.truncate(end)?;
        }
        Ok(Self { fix, var })
    }

    pub fn open_or_create(fix_path: &Path, var_path: &Path, page_size: u64) -> Result<Self> {
        if fix_path.exists() && var_path.exists() {
            Self::open(fix_path, var_path, page_size)
        } else {
            Self::create(fix_path, var_path, page_size)
        }
    }

    /// Row count
    #[inline]
    pub fn len(&self) -> u64 {
        self.fix.size() - 1
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Logical size of the payload file in bytes
    #[inline]
    pub fn var_len(&self) -> u64 {
        self.var.size()
    }

    /// Pre-size both files for `rows` more rows carrying `payload_bytes` in total
    pub fn reserve(&mut self, rows: u64, payload_bytes: u64) -> Result<()> {
        self.fix.reserve(rows)?;
        self.var.reserve(payload_bytes)
    }

    /// Append one value, returning its row index
    pub fn append(&mut self, payload: &[u8]) -> Result<u64> {
        let row = self.len();
        self.var.append_block(payload)?;
        self.fix.append(self.var.size())?;
        Ok(row)
    }

    /// Append rows `[lo, hi)` of `src`, moving the payload as one block and
    /// rebasing each offset onto this column's payload end
    pub fn copy_rows_from(&mut self, src: &VarColumn, lo: u64, hi: u64) -> Result<()> {
        if lo >= hi {
            return Ok(());
        }
        if hi > src.len() {
            return Err(StoreError::OutOfBounds {
                index: hi,
                size: src.len(),
            });
        }
        let start = src.fix.get::<u64>(lo)?;
        let end = src.fix.get::<u64>(hi)?;
        let base = self.var.size();

        self.fix.reserve(hi - lo)?;
        self.var.append_block(src.var.records(start, end)?)?;
        for row in lo + 1..=hi {
            let offset = src.fix.get::<u64>(row)?;
            self.fix.append(offset - start + base)?;
        }
        Ok(())
    }

    /// Start offset and length of a row's payload
    pub fn span(&self, row: u64) -> Result<(u64, u64)> {
        if row >= self.len() {
            return Err(StoreError::OutOfBounds {
                index: row,
                size: self.len(),
            });
        }
        let start = self.fix.get::<u64>(row)?;
        let end = self.fix.get::<u64>(row + 1)?;
        if end < start {
            return Err(StoreError::InvalidFileFormat(format!(
                "row {} has negative length",
                row
            )));
        }
        Ok((start, end - start))
    }

    /// Payload of one row
    pub fn get(&self, row: u64) -> Result<&[u8]> {
        let (start, len) = self.span(row)?;
        self.var.records(start, start + len)
    }

    /// Drop rows at and after `rows`, along with their payload bytes
    pub fn truncate(&mut self, rows: u64) -> Result<()> {
        if rows > self.len() {
            return Err(StoreError::OutOfBounds {
                index: rows,
                size: self.len(),
            });
        }
        let payload_end = self.fix.get::<u64>(rows)?;
        self.var.truncate(payload_end)?;
        self.fix.truncate(rows + 1)
    }

    /// Publish both files, payload first so committed offsets never dangle
    pub fn commit(&mut self) -> Result<()> {
        self.var.commit()?;
        self.fix.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_append_and_get() {
        let dir = tempdir().unwrap();
        let mut col = VarColumn::create(&dir.path().join("s.i"), &dir.path().join("s.d"), 4096).unwrap();

        col.append(b"alpha").unwrap();
        col.append(b"").unwrap();
        col.append(b"gamma ray").unwrap();

        assert_eq!(col.len(), 3);
        assert_eq!(col.get(0).unwrap(), b"alpha");
        assert_eq!(col.get(1).unwrap(), b"");
        assert_eq!(col.get(2).unwrap(), b"gamma ray");
        assert_eq!(col.var_len(), 14);
        assert!(col.get(3).is_err());
    }

    #[test]
    fn test_reopen_sees_committed_rows_only() {
        let dir = tempdir().unwrap();
        let fix = dir.path().join("s.i");
        let var = dir.path().join("s.d");

        let mut col = VarColumn::create(&fix, &var, 64).unwrap();
        for i in 0..1000 {
            col.append(format!("value-{}", i).as_bytes()).unwrap();
        }
        col.commit().unwrap();
        col.append(b"not committed").unwrap();
        drop(col);

        let col = VarColumn::open(&fix, &var, 64).unwrap();
        assert_eq!(col.len(), 1000);
        assert_eq!(col.get(999).unwrap(), b"value-999");
    }

    #[test]
    fn test_truncate_drops_payload() {
        let dir = tempdir().unwrap();
        let mut col = VarColumn::create(&dir.path().join("s.i"), &dir.path().join("s.d"), 4096).unwrap();
        col.append(b"one").unwrap();
        col.append(b"two").unwrap();
        col.append(b"three").unwrap();

        col.truncate(1).unwrap();
        assert_eq!(col.len(), 1);
        assert_eq!(col.var_len(), 3);

        col.append(b"deux").unwrap();
        assert_eq!(col.get(1).unwrap(), b"deux");
        assert!(col.truncate(9).is_err());
    }

    #[test]
    fn test_copy_rows_rebases_offsets() {
        let dir = tempdir().unwrap();
        let mut src = VarColumn::create(&dir.path().join("a.i"), &dir.path().join("a.d"), 4096).unwrap();
        for word in ["zero", "one", "two", "three", "four"] {
            src.append(word.as_bytes()).unwrap();
        }

        let mut dst = VarColumn::create(&dir.path().join("b.i"), &dir.path().join("b.d"), 4096).unwrap();
        dst.append(b"head").unwrap();
        dst.copy_rows_from(&src, 1, 4).unwrap();
        dst.copy_rows_from(&src, 2, 2).unwrap();

        assert_eq!(dst.len(), 4);
        assert_eq!(dst.get(1).unwrap(), b"one");
        assert_eq!(dst.get(2).unwrap(), b"two");
        assert_eq!(dst.get(3).unwrap(), b"three");
        assert_eq!(dst.var_len(), (4 + 3 + 3 + 5) as u64);
        assert!(dst.copy_rows_from(&src, 3, 6).is_err());
    }

    #[test]
    fn test_uncommitted_payload_cut_on_open() {
        let dir = tempdir().unwrap();
        let fix = dir.path().join("s.i");
        let var = dir.path().join("s.d");

        let mut col = VarColumn::create(&fix, &var, 4096).unwrap();
        col.append(b"abc").unwrap();
        col.commit().unwrap();
        drop(col);

        // payload committed, offsets never were
        let mut payload = FixedColumn::open(&var, 4096).unwrap();
        payload.append_block(b"XYZ").unwrap();
        payload.commit().unwrap();
        drop(payload);

        let mut col = VarColumn::open(&fix, &var, 4096).unwrap();
        assert_eq!(col.len(), 1);
        assert_eq!(col.get(0).unwrap(), b"abc");
        assert_eq!(col.var_len(), 3);
        col.truncate(1).unwrap();
        assert_eq!(col.get(0).unwrap(), b"abc");

        col.append(b"de").unwrap();
        col.commit().unwrap();
        drop(col);

        let col = VarColumn::open(&fix, &var, 4096).unwrap();
        assert_eq!(col.get(0).unwrap(), b"abc");
        assert_eq!(col.get(1).unwrap(), b"de");
        assert_eq!(col.var_len(), 5);
    }

    #[test]
    fn test_empty_column_reopens() {
        let dir = tempdir().unwrap();
        let fix = dir.path().join("s.i");
        let var = dir.path().join("s.d");
        drop(VarColumn::create(&fix, &var, 4096).unwrap());

        let mut col = VarColumn::open(&fix, &var, 4096).unwrap();
        assert!(col.is_empty());
        assert!(col.get(0).is_err());
        col.truncate(0).unwrap();
        assert_eq!(col.var_len(), 0);
    }

    #[test]
    fn test_reserve_keeps_contents() {
        let dir = tempdir().unwrap();
        let mut col = VarColumn::create(&dir.path().join("s.i"), &dir.path().join("s.d"), 64).unwrap();
        col.append(b"first").unwrap();
        col.reserve(500, 10_000).unwrap();
        assert_eq!(col.len(), 1);
        assert_eq!(col.var_len(), 5);
        for i in 0..500 {
            col.append(format!("{:020}", i).as_bytes()).unwrap();
        }
        assert_eq!(col.get(0).unwrap(), b"first");
        assert_eq!(col.get(500).unwrap(), format!("{:020}", 499).as_bytes());
    }
}
