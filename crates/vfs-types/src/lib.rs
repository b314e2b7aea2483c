#![forbid(unsafe_code)]
//! Shared newtypes, on-disk constants and byte-level parse helpers.
//!
//! Every other VaultFS crate depends on this one. It carries no I/O and no
//! runtime error type; decode failures are reported as [`ParseError`] and
//! converted at crate boundaries.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ── Format constants ────────────────────────────────────────────────────────

/// Superblock magic number.
pub const VAULTFS_MAGIC: u32 = 0x4242_4242;
/// Magic stamped at the start of every extent node.
pub const EXTENT_MAGIC: u16 = 0x1727;

pub const BLOCK_SIZE: u32 = 4096;
pub const BLOCK_SIZE_BYTES: usize = 4096;

pub const SUPERBLOCK_BLOCK: BlockNumber = BlockNumber(0);
pub const GDT_BLOCK: BlockNumber = BlockNumber(1);
/// First block belonging to group 0.
pub const FIRST_GROUP_BLOCK: u64 = 2;

pub const DEFAULT_BLOCKS_PER_GROUP: u32 = 32_768;
pub const DEFAULT_INODES_PER_GROUP: u32 = 32_768;

pub const INODE_SIZE: usize = 128;
pub const INODES_PER_BLOCK: u32 = 32;

pub const GROUP_DESC_SIZE: usize = 16;
pub const GROUP_DESCS_PER_BLOCK: u32 = 256;

/// Bits available in one bitmap block.
pub const BITS_PER_BITMAP_BLOCK: u32 = BLOCK_SIZE * 8;

/// Header, index and leaf records of an extent node are all this size.
pub const EXTENT_ENTRY_SIZE: usize = 10;
/// Slots in the inode-embedded extent root (header included).
pub const EXTENT_ROOT_SLOTS: usize = 10;
pub const EXTENT_ROOT_BYTES: usize = EXTENT_ROOT_SLOTS * EXTENT_ENTRY_SIZE;
pub const EXTENT_ROOT_MAX_ENTRIES: u16 = 9;
pub const EXTENT_NODE_MAX_ENTRIES: u16 = 408;
pub const MAX_TREE_DEPTH: u16 = 5;
/// Largest run a single leaf record can describe.
pub const MAX_EXTENT_LEN: u32 = 65_535;

pub const DIR_RECORD_SIZE: usize = 262;
pub const DIR_RECORDS_PER_BLOCK: usize = 15;
pub const MAX_FILENAME: usize = 255;
pub const MAX_DIR_RECORDS: usize = 65_536;

/// Blocks reserved for a new file at creation time.
pub const INITIAL_FILE_SPACE: u32 = 1;

pub const PASSWORD_HASH_SIZE: usize = 128;

// ── Newtypes ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

/// Block group index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupNumber(pub u32);

impl InodeNumber {
    /// Free-slot sentinel in directory records; never assigned.
    pub const RESERVED: Self = Self(0);
    pub const ROOT: Self = Self(1);

    /// Narrow to the 32-bit on-disk representation.
    pub fn to_disk(self) -> Result<u32, ParseError> {
        u32::try_from(self.0).map_err(|_| ParseError::IntegerConversion {
            field: "inode_number",
        })
    }
}

impl BlockNumber {
    /// Narrow to the 32-bit on-disk representation used by extent records.
    pub fn to_disk(self) -> Result<u32, ParseError> {
        u32::try_from(self.0).map_err(|_| ParseError::IntegerConversion {
            field: "block_number",
        })
    }

    #[must_use]
    pub fn checked_add(self, blocks: u64) -> Option<Self> {
        self.0.checked_add(blocks).map(Self)
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for GroupNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Group that owns inode `ino`.
#[must_use]
#[expect(clippy::cast_possible_truncation)]
pub fn inode_to_group(ino: InodeNumber, inodes_per_group: u32) -> GroupNumber {
    if inodes_per_group == 0 {
        return GroupNumber(0);
    }
    GroupNumber((ino.0 / u64::from(inodes_per_group)) as u32)
}

/// Position of inode `ino` inside its group's bitmap and inode table.
#[must_use]
#[expect(clippy::cast_possible_truncation)]
pub fn inode_index_in_group(ino: InodeNumber, inodes_per_group: u32) -> u32 {
    if inodes_per_group == 0 {
        return 0;
    }
    (ino.0 % u64::from(inodes_per_group)) as u32
}

// ── Parse errors and helpers ────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn ensure_slice_mut(data: &mut [u8], offset: usize, len: usize) -> Result<&mut [u8], ParseError> {
    let available = data.len();
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > available {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: available.saturating_sub(offset),
        });
    }

    Ok(&mut data[offset..end])
}

#[inline]
pub fn read_u8(data: &[u8], offset: usize) -> Result<u8, ParseError> {
    let bytes = ensure_slice(data, offset, 1)?;
    Ok(bytes[0])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[inline]
pub fn write_u8(data: &mut [u8], offset: usize, value: u8) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 1)?[0] = value;
    Ok(())
}

#[inline]
pub fn write_le_u16(data: &mut [u8], offset: usize, value: u16) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 2)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u32(data: &mut [u8], offset: usize, value: u32) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 4)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_le_u64(data: &mut [u8], offset: usize, value: u64) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, 8)?.copy_from_slice(&value.to_le_bytes());
    Ok(())
}

#[inline]
pub fn write_bytes(data: &mut [u8], offset: usize, bytes: &[u8]) -> Result<(), ParseError> {
    ensure_slice_mut(data, offset, bytes.len())?.copy_from_slice(bytes);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn read_helpers_decode_little_endian() {
        let data = [0x34, 0x12, 0x78, 0x56, 0xBC, 0x9A, 0xF0, 0xDE];
        assert_eq!(read_le_u16(&data, 0).unwrap(), 0x1234);
        assert_eq!(read_le_u32(&data, 0).unwrap(), 0x5678_1234);
        assert_eq!(read_le_u64(&data, 0).unwrap(), 0xDEF0_9ABC_5678_1234);
        assert_eq!(read_u8(&data, 7).unwrap(), 0xDE);
    }

    #[test]
    fn read_past_end_reports_insufficient_data() {
        let data = [0_u8; 3];
        let err = read_le_u32(&data, 1).unwrap_err();
        assert_eq!(
            err,
            ParseError::InsufficientData {
                needed: 4,
                offset: 1,
                actual: 2,
            }
        );
    }

    #[test]
    fn offset_overflow_is_invalid_field() {
        let data = [0_u8; 4];
        assert!(matches!(
            ensure_slice(&data, usize::MAX, 2),
            Err(ParseError::InvalidField { field: "offset", .. })
        ));
    }

    #[test]
    fn write_helpers_reject_out_of_bounds() {
        let mut data = [0_u8; 4];
        write_le_u16(&mut data, 2, 0xBEEF).unwrap();
        assert_eq!(data, [0, 0, 0xEF, 0xBE]);
        assert!(write_le_u32(&mut data, 2, 1).is_err());
        assert!(write_bytes(&mut data, 4, &[1]).is_err());
    }

    #[test]
    fn inode_geometry_reserves_zero() {
        assert_eq!(inode_to_group(InodeNumber::ROOT, 32), GroupNumber(0));
        assert_eq!(inode_index_in_group(InodeNumber::ROOT, 32), 1);
        assert_eq!(inode_to_group(InodeNumber(64), 32), GroupNumber(2));
        assert_eq!(inode_index_in_group(InodeNumber(65), 32), 1);
    }

    #[test]
    fn layout_constants_fit_in_a_block() {
        assert_eq!(EXTENT_ROOT_BYTES + 28, INODE_SIZE);
        assert!(DIR_RECORD_SIZE * DIR_RECORDS_PER_BLOCK <= BLOCK_SIZE_BYTES);
        assert_eq!(
            usize::from(EXTENT_NODE_MAX_ENTRIES + 1) * EXTENT_ENTRY_SIZE,
            4090
        );
        assert_eq!(GROUP_DESCS_PER_BLOCK as usize * GROUP_DESC_SIZE, BLOCK_SIZE_BYTES);
        assert_eq!(INODES_PER_BLOCK as usize * INODE_SIZE, BLOCK_SIZE_BYTES);
    }

    #[test]
    fn on_disk_narrowing() {
        assert_eq!(InodeNumber(7).to_disk().unwrap(), 7);
        assert!(InodeNumber(u64::from(u32::MAX) + 1).to_disk().is_err());
        assert!(BlockNumber(u64::MAX).to_disk().is_err());
    }

    proptest! {
        #[test]
        fn u32_write_then_read_matches(value: u32, offset in 0_usize..60) {
            let mut buf = [0_u8; 64];
            write_le_u32(&mut buf, offset, value).unwrap();
            prop_assert_eq!(read_le_u32(&buf, offset).unwrap(), value);
        }
    }
}
