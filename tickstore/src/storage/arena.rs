//! Paged arena for append-only records
//!
//! Memory is handed out from fixed-size pages. An allocation returns a logical
//! offset (`page * page_size + position`) that stays valid until the arena is
//! cleared or closed; pages are never moved or compacted. A record never
//! straddles two pages: if it does not fit in what is left of the current
//! page, allocation moves on to the next page and the tail is wasted.

use std::io::{Read, Write};

use byteorder::{ByteOrder, LittleEndian};

use crate::{Result, StoreError};

pub struct PagedArena {
    pages: Vec<Box<[u8]>>,
    page_size: usize,
    /// Index of the page allocations currently come from
    page: usize,
    /// Allocation cursor inside `page`
    pos: usize,
}

impl PagedArena {
    pub fn new(page_size: usize) -> Self {
        Self {
            pages: Vec::new(),
            page_size: page_size.max(1),
            page: 0,
            pos: 0,
        }
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Pages currently held, including pages kept across `clear`
    #[inline]
    pub fn page_count(&self) -> usize {
        self.pages.len()
    }

    /// Logical end of the allocated region
    #[inline]
    pub fn allocated(&self) -> u64 {
        (self.page * self.page_size + self.pos) as u64
    }

    /// Reserve `size` contiguous bytes and return their logical offset
    pub fn allocate(&mut self, size: usize) -> Result<u64> {
        if size == 0 || size > self.page_size {
            return Err(StoreError::InvalidArgument(format!(
                "cannot allocate {} bytes from {}-byte pages",
                size, self.page_size
            )));
        }
        if self.pages.is_empty() {
            self.pages.push(self.new_page());
            self.page = 0;
            self.pos = 0;
        }
        if self.pos + size > self.page_size {
            self.page += 1;
            self.pos = 0;
            if self.page == self.pages.len() {
                self.pages.push(self.new_page());
            }
        }
        let offset = self.allocated();
        self.pos += size;
        Ok(offset)
    }

    fn new_page(&self) -> Box<[u8]> {
        vec![0u8; self.page_size].into_boxed_slice()
    }

    /// Resolve a logical offset to its page and in-page position
    pub fn address_of(&self, offset: u64) -> Result<(usize, usize)> {
        if offset >= self.allocated() {
            return Err(StoreError::OutOfBounds {
                index: offset,
                size: self.allocated(),
            });
        }
        let offset = offset as usize;
        Ok((offset / self.page_size, offset % self.page_size))
    }

    fn check(&self, offset: u64, len: usize) -> Result<(usize, usize)> {
        let (page, at) = self.address_of(offset)?;
        if at + len > self.page_size || offset + len as u64 > self.allocated() {
            return Err(StoreError::OutOfBounds {
                index: offset + len as u64,
                size: self.allocated(),
            });
        }
        Ok((page, at))
    }

    pub fn slice(&self, offset: u64, len: usize) -> Result<&[u8]> {
        let (page, at) = self.check(offset, len)?;
        Ok(&self.pages[page][at..at + len])
    }

    pub fn slice_mut(&mut self, offset: u64, len: usize) -> Result<&mut [u8]> {
        let (page, at) = self.check(offset, len)?;
        Ok(&mut self.pages[page][at..at + len])
    }

    pub fn read_u64(&self, offset: u64) -> Result<u64> {
        Ok(LittleEndian::read_u64(self.slice(offset, 8)?))
    }

    pub fn write_u64(&mut self, offset: u64, value: u64) -> Result<()> {
        LittleEndian::write_u64(self.slice_mut(offset, 8)?, value);
        Ok(())
    }

    /// Forget all allocations but keep the pages for reuse
    pub fn clear(&mut self) {
        self.page = 0;
        self.pos = 0;
    }

    /// Release every page
    pub fn close(&mut self) {
        self.pages = Vec::new();
        self.page = 0;
        self.pos = 0;
    }

    /// Write the allocated pages, whole, to `out`. Returns bytes written.
    pub fn write_image<W: Write>(&self, out: &mut W) -> Result<u64> {
        if self.allocated() == 0 {
            return Ok(0);
        }
        for page in &self.pages[..=self.page] {
            out.write_all(page)?;
        }
        Ok(((self.page + 1) * self.page_size) as u64)
    }

    /// Rebuild an arena from an image produced by [`PagedArena::write_image`]
    pub fn read_image<R: Read>(input: &mut R, page_size: usize, allocated: u64) -> Result<Self> {
        let mut arena = Self::new(page_size);
        if allocated == 0 {
            return Ok(arena);
        }
        let allocated = allocated as usize;
        let page_count = allocated.div_ceil(arena.page_size);
        for _ in 0..page_count {
            let mut page = arena.new_page();
            input.read_exact(&mut page)?;
            arena.pages.push(page);
        }
        arena.page = (allocated - 1) / arena.page_size;
        arena.pos = allocated - arena.page * arena.page_size;
        Ok(arena)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offsets_are_monotonic() {
        let mut arena = PagedArena::new(64);
        let a = arena.allocate(16).unwrap();
        let b = arena.allocate(16).unwrap();
        let c = arena.allocate(32).unwrap();
        assert_eq!((a, b, c), (0, 16, 32));
        assert_eq!(arena.page_count(), 1);
    }

    #[test]
    fn test_record_never_straddles_pages() {
        let mut arena = PagedArena::new(64);
        arena.allocate(40).unwrap();
        // 24 bytes left on page 0, so a 32-byte record starts page 1
        let offset = arena.allocate(32).unwrap();
        assert_eq!(offset, 64);
        assert_eq!(arena.page_count(), 2);
        assert_eq!(arena.address_of(offset).unwrap(), (1, 0));
    }

    #[test]
    fn test_values_stable_across_growth() {
        let mut arena = PagedArena::new(32);
        let mut offsets = Vec::new();
        for i in 0..100u64 {
            let offset = arena.allocate(8).unwrap();
            arena.write_u64(offset, i * 3).unwrap();
            offsets.push(offset);
        }
        for (i, offset) in offsets.into_iter().enumerate() {
            assert_eq!(arena.read_u64(offset).unwrap(), i as u64 * 3);
        }
    }

    #[test]
    fn test_clear_reuses_pages() {
        let mut arena = PagedArena::new(32);
        for _ in 0..10 {
            arena.allocate(16).unwrap();
        }
        let pages = arena.page_count();
        arena.clear();
        assert_eq!(arena.allocated(), 0);
        assert_eq!(arena.allocate(16).unwrap(), 0);
        assert_eq!(arena.page_count(), pages);
        assert!(arena.read_u64(16).is_err());

        arena.close();
        assert_eq!(arena.page_count(), 0);
    }

    #[test]
    fn test_oversized_allocation_rejected() {
        let mut arena = PagedArena::new(32);
        assert!(arena.allocate(33).is_err());
        assert!(arena.allocate(0).is_err());
    }

    #[test]
    fn test_image_roundtrip() {
        let mut arena = PagedArena::new(32);
        let mut offsets = Vec::new();
        for i in 0..9u64 {
            let offset = arena.allocate(8).unwrap();
            arena.write_u64(offset, i + 100).unwrap();
            offsets.push(offset);
        }

        let mut image = Vec::new();
        let written = arena.write_image(&mut image).unwrap();
        assert_eq!(written as usize, image.len());

        let restored = PagedArena::read_image(&mut image.as_slice(), 32, arena.allocated()).unwrap();
        assert_eq!(restored.allocated(), arena.allocated());
        for (i, offset) in offsets.into_iter().enumerate() {
            assert_eq!(restored.read_u64(offset).unwrap(), i as u64 + 100);
        }
    }
}
