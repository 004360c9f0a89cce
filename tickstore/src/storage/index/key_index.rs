//! Bucketed key → row-id index
//!
//! Keys hash into `bucket_mask + 1` buckets. Each bucket is a singly linked
//! chain of `(key, row id, next)` entries allocated from a [`PagedArena`], so
//! appends are O(1) and a cursor replays a bucket in append order.
//!
//! The index only ever grows. When a merge moves rows around, existing row
//! ids are meaningless, so the owner rebuilds the index from the merged
//! column with [`KeyIndex::rebuild`] instead of patching it.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use ahash::RandomState;
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::storage::arena::PagedArena;
use crate::storage::column::FixedColumn;
use crate::{Result, StoreError};

/// Bytes per chained entry: key (i64), row id (u64), next offset (u64)
pub const ENTRY_SIZE: usize = 24;
/// Chain terminator
const NIL: u64 = u64::MAX;

const INDEX_MAGIC: &[u8; 8] = b"TSKIDX01";
const INDEX_HEADER_SIZE: usize = 48;

// Fixed seeds keep bucket placement stable across processes, which the
// persisted bucket table depends on.
const HASH_SEEDS: [u64; 4] = [
    0x9e37_79b9_7f4a_7c15,
    0xbf58_476d_1ce4_e5b9,
    0x94d0_49bb_1331_11eb,
    0x2545_f491_4f6c_dd1d,
];

/// Bucket mask for a distinct-value hint: the hint rounded up to a power of
/// two, minus one
pub fn bucket_mask_for(distinct_hint: u64) -> u64 {
    distinct_hint.max(1).next_power_of_two() - 1
}

pub struct KeyIndex {
    arena: PagedArena,
    bucket_mask: u64,
    /// First entry of each bucket
    heads: Vec<u64>,
    /// Last entry of each bucket, for O(1) append
    tails: Vec<u64>,
    entry_count: u64,
    hasher: RandomState,
}

impl KeyIndex {
    /// Create an empty index sized for roughly `distinct_hint` keys
    pub fn new(distinct_hint: u64, arena_page_size: usize) -> Self {
        Self::with_mask(bucket_mask_for(distinct_hint), PagedArena::new(arena_page_size))
    }

    fn with_mask(bucket_mask: u64, arena: PagedArena) -> Self {
        let buckets = (bucket_mask + 1) as usize;
        Self {
            arena,
            bucket_mask,
            heads: vec![NIL; buckets],
            tails: vec![NIL; buckets],
            entry_count: 0,
            hasher: RandomState::with_seeds(HASH_SEEDS[0], HASH_SEEDS[1], HASH_SEEDS[2], HASH_SEEDS[3]),
        }
    }

    #[inline]
    pub fn bucket_mask(&self) -> u64 {
        self.bucket_mask
    }

    #[inline]
    pub fn bucket_count(&self) -> usize {
        self.heads.len()
    }

    /// Number of (key, row id) entries
    #[inline]
    pub fn len(&self) -> u64 {
        self.entry_count
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entry_count == 0
    }

    /// Bucket a key hashes to
    #[inline]
    pub fn bucket_of(&self, key: i64) -> usize {
        (self.hasher.hash_one(key) & self.bucket_mask) as usize
    }

    /// Append a (key, row id) pair to the key's bucket
    pub fn add(&mut self, key: i64, row_id: u64) -> Result<()> {
        let bucket = self.bucket_of(key);
        let offset = self.arena.allocate(ENTRY_SIZE)?;
        self.arena.write_u64(offset, key as u64)?;
        self.arena.write_u64(offset + 8, row_id)?;
        self.arena.write_u64(offset + 16, NIL)?;

        match self.tails[bucket] {
            NIL => self.heads[bucket] = offset,
            tail => self.arena.write_u64(tail + 16, offset)?,
        }
        self.tails[bucket] = offset;
        self.entry_count += 1;
        Ok(())
    }

    /// Row ids of a bucket in append order.
    ///
    /// The cursor is single-pass; request a new one to scan again.
    pub fn cursor(&self, bucket: usize) -> Result<IndexCursor<'_>> {
        let head = *self.heads.get(bucket).ok_or(StoreError::OutOfBounds {
            index: bucket as u64,
            size: self.heads.len() as u64,
        })?;
        Ok(IndexCursor {
            arena: &self.arena,
            next: head,
            key: None,
        })
    }

    /// Row ids recorded for `key`, in append order
    pub fn rows_for_key(&self, key: i64) -> IndexCursor<'_> {
        IndexCursor {
            arena: &self.arena,
            next: self.heads[self.bucket_of(key)],
            key: Some(key),
        }
    }

    /// Drop all entries, keeping arena pages for reuse
    pub fn clear(&mut self) {
        self.arena.clear();
        self.heads.fill(NIL);
        self.tails.fill(NIL);
        self.entry_count = 0;
    }

    /// Regenerate an index from every committed row of a key column.
    ///
    /// Supports 4-byte (`Int`/`Symbol`) and 8-byte (`Long`) keys.
    pub fn rebuild(column: &FixedColumn, distinct_hint: u64, arena_page_size: usize) -> Result<Self> {
        let mut index = Self::new(distinct_hint, arena_page_size);
        index.extend_from(column, 0)?;
        Ok(index)
    }

    /// Index rows `[from_row, column.size())` of a key column
    pub fn extend_from(&mut self, column: &FixedColumn, from_row: u64) -> Result<()> {
        for row in from_row..column.size() {
            let key = match column.width() {
                4 => column.get::<i32>(row)? as i64,
                8 => column.get::<i64>(row)?,
                w => {
                    return Err(StoreError::SchemaMismatch(format!(
                        "cannot index column of width {}",
                        w
                    )))
                }
            };
            self.add(key, row)?;
        }
        Ok(())
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Write the index image atomically (temp file + rename)
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut body = Vec::with_capacity(self.heads.len() * 16);
        for (&head, &tail) in self.heads.iter().zip(self.tails.iter()) {
            body.write_u64::<LittleEndian>(head)?;
            body.write_u64::<LittleEndian>(tail)?;
        }
        self.arena.write_image(&mut body)?;

        let mut header = Vec::with_capacity(INDEX_HEADER_SIZE);
        header.extend_from_slice(INDEX_MAGIC);
        header.write_u64::<LittleEndian>(self.bucket_mask)?;
        header.write_u64::<LittleEndian>(self.arena.page_size() as u64)?;
        header.write_u64::<LittleEndian>(self.entry_count)?;
        header.write_u64::<LittleEndian>(self.arena.allocated())?;
        header.write_u32::<LittleEndian>(crc32fast::hash(&body))?;
        header.resize(INDEX_HEADER_SIZE, 0);

        let tmp = path.with_extension("k.tmp");
        {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            let mut writer = BufWriter::new(file);
            writer.write_all(&header)?;
            writer.write_all(&body)?;
            writer.flush()?;
            writer.get_ref().sync_all()?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Load an index image.
    ///
    /// A bucket mask different from `expected_mask` means the image no longer
    /// matches its column's configuration and is reported as `IndexCorrupt`;
    /// callers regenerate rather than repair.
    pub fn load(path: &Path, expected_mask: u64) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);

        let mut header = [0u8; INDEX_HEADER_SIZE];
        reader.read_exact(&mut header)?;
        if &header[0..8] != INDEX_MAGIC {
            return Err(StoreError::IndexCorrupt(format!("{}: bad magic", path.display())));
        }
        let mut fields = &header[8..];
        let bucket_mask = fields.read_u64::<LittleEndian>()?;
        let page_size = fields.read_u64::<LittleEndian>()? as usize;
        let entry_count = fields.read_u64::<LittleEndian>()?;
        let allocated = fields.read_u64::<LittleEndian>()?;
        let checksum = fields.read_u32::<LittleEndian>()?;

        if bucket_mask != expected_mask {
            return Err(StoreError::IndexCorrupt(format!(
                "{}: bucket mask {} on disk, {} expected",
                path.display(),
                bucket_mask,
                expected_mask
            )));
        }

        let mut body = Vec::new();
        reader.read_to_end(&mut body)?;
        if crc32fast::hash(&body) != checksum {
            return Err(StoreError::IndexCorrupt(format!("{}: checksum mismatch", path.display())));
        }

        let buckets = (bucket_mask + 1) as usize;
        if body.len() < buckets * 16 {
            return Err(StoreError::IndexCorrupt(format!("{}: bucket table truncated", path.display())));
        }
        let (table, image) = body.split_at(buckets * 16);
        let arena = PagedArena::read_image(&mut &image[..], page_size, allocated)?;

        let mut index = Self::with_mask(bucket_mask, arena);
        let mut table = table;
        for bucket in 0..buckets {
            index.heads[bucket] = table.read_u64::<LittleEndian>()?;
            index.tails[bucket] = table.read_u64::<LittleEndian>()?;
        }
        index.entry_count = entry_count;
        Ok(index)
    }

    /// Load the index at `path`, or rebuild it from `column` when it is
    /// missing or does not match the expected layout
    pub fn load_or_rebuild(
        path: &Path,
        column: &FixedColumn,
        distinct_hint: u64,
        arena_page_size: usize,
    ) -> Result<Self> {
        let expected = bucket_mask_for(distinct_hint);
        match Self::load(path, expected) {
            Ok(index) if index.len() == column.size() => Ok(index),
            Ok(index) => {
                log::warn!(
                    "{}: index covers {} rows, column has {}; regenerating",
                    path.display(),
                    index.len(),
                    column.size()
                );
                Self::rebuild(column, distinct_hint, arena_page_size)
            }
            Err(StoreError::IndexCorrupt(reason)) => {
                log::warn!("{}; regenerating", reason);
                Self::rebuild(column, distinct_hint, arena_page_size)
            }
            Err(StoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                Self::rebuild(column, distinct_hint, arena_page_size)
            }
            Err(StoreError::EndOfStream(_)) => {
                log::warn!("{}: index image truncated; regenerating", path.display());
                Self::rebuild(column, distinct_hint, arena_page_size)
            }
            Err(e) => Err(e),
        }
    }
}

/// Forward-only cursor over a bucket chain
pub struct IndexCursor<'a> {
    arena: &'a PagedArena,
    next: u64,
    /// When set, entries with other keys are skipped
    key: Option<i64>,
}

impl Iterator for IndexCursor<'_> {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        while self.next != NIL {
            let offset = self.next;
            let key = self.arena.read_u64(offset).ok()? as i64;
            let row_id = self.arena.read_u64(offset + 8).ok()?;
            self.next = self.arena.read_u64(offset + 16).ok()?;
            if self.key.map_or(true, |k| k == key) {
                return Some(row_id);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_bucket_mask() {
        assert_eq!(bucket_mask_for(0), 0);
        assert_eq!(bucket_mask_for(100), 127);
        assert_eq!(bucket_mask_for(128), 127);
        assert_eq!(bucket_mask_for(129), 255);

        let idx = KeyIndex::new(100, 4096);
        assert_eq!(idx.bucket_count(), 128);
    }

    #[test]
    fn test_cursor_in_append_order() {
        let mut idx = KeyIndex::new(8, 64);
        let rows = [(3, 0), (5, 1), (3, 2), (7, 3), (3, 4)];
        for (key, row) in rows {
            idx.add(key, row).unwrap();
        }
        assert_eq!(idx.len(), 5);
        assert_eq!(idx.rows_for_key(3).collect::<Vec<_>>(), vec![0, 2, 4]);
        assert_eq!(idx.rows_for_key(5).collect::<Vec<_>>(), vec![1]);
        assert_eq!(idx.rows_for_key(42).count(), 0);

        let bucket = idx.bucket_of(3);
        let in_bucket: Vec<u64> = idx.cursor(bucket).unwrap().collect();
        // the bucket may hold other keys, but key 3's rows appear in order
        let filtered: Vec<u64> = in_bucket.into_iter().filter(|r| [0, 2, 4].contains(r)).collect();
        assert_eq!(filtered, vec![0, 2, 4]);
        assert!(idx.cursor(idx.bucket_count()).is_err());
    }

    #[test]
    fn test_every_row_reachable_from_some_bucket() {
        let mut idx = KeyIndex::new(16, 128);
        for row in 0..1000u64 {
            idx.add((row % 37) as i64, row).unwrap();
        }
        let mut seen: Vec<u64> = (0..idx.bucket_count())
            .flat_map(|b| idx.cursor(b).unwrap().collect::<Vec<_>>())
            .collect();
        seen.sort_unstable();
        assert_eq!(seen, (0..1000).collect::<Vec<_>>());
    }

    #[test]
    fn test_clear() {
        let mut idx = KeyIndex::new(4, 64);
        idx.add(1, 10).unwrap();
        idx.clear();
        assert!(idx.is_empty());
        assert_eq!(idx.rows_for_key(1).count(), 0);
        idx.add(1, 11).unwrap();
        assert_eq!(idx.rows_for_key(1).collect::<Vec<_>>(), vec![11]);
    }

    #[test]
    fn test_persistence() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sym.k");

        let mut idx = KeyIndex::new(32, 96);
        for row in 0..500u64 {
            idx.add((row % 11) as i64, row).unwrap();
        }
        idx.save(&path).unwrap();

        let loaded = KeyIndex::load(&path, bucket_mask_for(32)).unwrap();
        assert_eq!(loaded.len(), 500);
        for key in 0..11i64 {
            assert_eq!(
                loaded.rows_for_key(key).collect::<Vec<_>>(),
                idx.rows_for_key(key).collect::<Vec<_>>()
            );
        }
    }

    #[test]
    fn test_bucket_mismatch_is_corruption() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("sym.k");
        KeyIndex::new(32, 96).save(&path).unwrap();

        assert!(matches!(
            KeyIndex::load(&path, bucket_mask_for(1024)),
            Err(StoreError::IndexCorrupt(_))
        ));
    }

    #[test]
    fn test_rebuild_from_column() {
        let dir = tempdir().unwrap();
        let col_path = dir.path().join("sym.d");
        let mut col = FixedColumn::create(&col_path, 4, 4096).unwrap();
        for key in [4i32, 9, 4, 4, 1] {
            col.append(key).unwrap();
        }
        col.commit().unwrap();

        let idx = KeyIndex::rebuild(&col, 8, 4096).unwrap();
        assert_eq!(idx.rows_for_key(4).collect::<Vec<_>>(), vec![0, 2, 3]);

        // wrong layout on disk forces regeneration
        let path = dir.path().join("sym.k");
        KeyIndex::new(1024, 4096).save(&path).unwrap();
        let idx = KeyIndex::load_or_rebuild(&path, &col, 8, 4096).unwrap();
        assert_eq!(idx.bucket_mask(), bucket_mask_for(8));
        assert_eq!(idx.rows_for_key(9).collect::<Vec<_>>(), vec![1]);
    }
}
