//! Column file header definition

use std::io::{Cursor, Read};

use byteorder::{LittleEndian, ReadBytesExt};

use crate::{Result, StoreError};

/// Magic bytes at the start of every column file
pub const COLUMN_MAGIC: &[u8; 8] = b"TSCOLv1\0";
/// Header size; column records start right after it
pub const COLUMN_HEADER_SIZE: usize = 64;
/// Bytes covered by the header checksum
const CHECKSUM_SPAN: usize = 24;

/// Column file header (64 bytes)
///
/// ```text
/// 0..8    magic "TSCOLv1\0"
/// 8..12   record width in bytes (u32)
/// 12..16  flags (u32, reserved)
/// 16..24  committed row count (u64)
/// 24..28  CRC32 of bytes 0..24
/// 28..64  reserved
/// ```
///
/// The committed row count is the durable logical-size marker: readers trust
/// it, never the file length.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnHeader {
    pub width: u32,
    pub flags: u32,
    pub committed_rows: u64,
}

impl ColumnHeader {
    pub fn new(width: u32) -> Self {
        Self {
            width,
            flags: 0,
            committed_rows: 0,
        }
    }

    /// Serialize to bytes
    pub fn to_bytes(&self) -> [u8; COLUMN_HEADER_SIZE] {
        let mut buf = [0u8; COLUMN_HEADER_SIZE];
        buf[0..8].copy_from_slice(COLUMN_MAGIC);
        buf[8..12].copy_from_slice(&self.width.to_le_bytes());
        buf[12..16].copy_from_slice(&self.flags.to_le_bytes());
        buf[16..24].copy_from_slice(&self.committed_rows.to_le_bytes());
        let checksum = crc32fast::hash(&buf[0..CHECKSUM_SPAN]);
        buf[24..28].copy_from_slice(&checksum.to_le_bytes());
        buf
    }

    /// Deserialize and validate
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < COLUMN_HEADER_SIZE {
            return Err(StoreError::InvalidFileFormat("column header truncated".into()));
        }
        let mut cursor = Cursor::new(bytes);

        let mut magic = [0u8; 8];
        cursor.read_exact(&mut magic)?;
        if &magic != COLUMN_MAGIC {
            return Err(StoreError::InvalidFileFormat("bad column magic".into()));
        }

        let width = cursor.read_u32::<LittleEndian>()?;
        let flags = cursor.read_u32::<LittleEndian>()?;
        let committed_rows = cursor.read_u64::<LittleEndian>()?;
        let stored = cursor.read_u32::<LittleEndian>()?;

        let computed = crc32fast::hash(&bytes[0..CHECKSUM_SPAN]);
        if stored != computed {
            return Err(StoreError::ChecksumMismatch("column header".into()));
        }
        if width == 0 {
            return Err(StoreError::InvalidFileFormat("zero record width".into()));
        }

        Ok(Self {
            width,
            flags,
            committed_rows,
        })
    }
}
