//! File I/O with memory mapping

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use memmap2::{MmapMut, MmapOptions};

use crate::{Result, StoreError};

/// A read-write memory-mapped file with bounds-checked byte access.
///
/// Slices handed out borrow the mapping, so they can never outlive a
/// [`MappedFile::ensure_capacity`] call that remaps the file.
pub struct MappedFile {
    /// Underlying file
    file: File,
    /// Memory-mapped region, always the full file length
    mmap: MmapMut,
    /// Growth increment in bytes
    page_size: u64,
    /// File path
    path: PathBuf,
}

impl MappedFile {
    /// Create (or truncate) a file with at least `initial_len` bytes mapped
    pub fn create(path: &Path, initial_len: u64, page_size: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let len = round_up(initial_len.max(1), page_size);
        file.set_len(len)?;
        let mmap = Self::map(&file)?;

        Ok(Self {
            file,
            mmap,
            page_size,
            path: path.to_path_buf(),
        })
    }

    /// Open an existing file
    pub fn open(path: &Path, page_size: u64) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        if file.metadata()?.len() == 0 {
            return Err(StoreError::InvalidFileFormat(format!(
                "{} is empty",
                path.display()
            )));
        }
        let mmap = Self::map(&file)?;

        Ok(Self {
            file,
            mmap,
            page_size,
            path: path.to_path_buf(),
        })
    }

    fn map(file: &File) -> Result<MmapMut> {
        // SAFETY: the file stays open for as long as the mapping exists (both
        // live in the same struct) and is only resized through `ensure_capacity`,
        // which replaces the mapping before any further access.
        let mmap = unsafe { MmapOptions::new().map_mut(file)? };
        Ok(mmap)
    }

    /// Mapped capacity in bytes
    #[inline]
    pub fn capacity(&self) -> u64 {
        self.mmap.len() as u64
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Grow the file so that at least `required` bytes are mapped.
    ///
    /// Growth doubles the current size (or jumps straight to `required`) and is
    /// rounded to the page size.
    pub fn ensure_capacity(&mut self, required: u64) -> Result<()> {
        let current = self.capacity();
        if required <= current {
            return Ok(());
        }
        let new_len = round_up(required.max(current.saturating_mul(2)), self.page_size);

        self.mmap.flush()?;
        self.file.set_len(new_len)?;
        self.mmap = Self::map(&self.file)?;
        Ok(())
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<(usize, usize)> {
        let start = offset as usize;
        let end = start
            .checked_add(len)
            .ok_or_else(|| StoreError::InvalidArgument("range overflows".into()))?;
        if end > self.mmap.len() {
            return Err(StoreError::OutOfBounds {
                index: end as u64,
                size: self.capacity(),
            });
        }
        Ok((start, end))
    }

    /// Read raw bytes at offset
    pub fn read_at(&self, offset: u64, len: usize) -> Result<&[u8]> {
        let (start, end) = self.check_range(offset, len)?;
        Ok(&self.mmap[start..end])
    }

    /// Mutable view of raw bytes at offset
    pub fn slice_mut(&mut self, offset: u64, len: usize) -> Result<&mut [u8]> {
        let (start, end) = self.check_range(offset, len)?;
        Ok(&mut self.mmap[start..end])
    }

    /// Write raw bytes at offset. The range must already be mapped.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.slice_mut(offset, data.len())?.copy_from_slice(data);
        Ok(())
    }

    pub fn read_u64(&self, offset: u64) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.read_at(offset, 8)?))
    }

    pub fn write_u64(&mut self, offset: u64, value: u64) -> Result<()> {
        LittleEndian::write_u64(self.slice_mut(offset, 8)?, value);
        Ok(())
    }

    /// Flush a byte range to disk
    pub fn flush_range(&self, offset: u64, len: usize) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        let (start, end) = self.check_range(offset, len)?;
        self.mmap.flush_range(start, end - start)?;
        Ok(())
    }

    /// Flush all changes to disk
    pub fn flush(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }
}

/// Round `value` up to a multiple of `page`
#[inline]
pub(crate) fn round_up(value: u64, page: u64) -> u64 {
    let page = page.max(1);
    value.div_ceil(page) * page
}
