//! Fixed-slot directory records.
//!
//! Each directory block holds [`DIR_RECORDS_PER_BLOCK`] records of
//! [`DIR_RECORD_SIZE`] bytes. A slot whose inode field is zero is free.

use crate::inode::FileType;
use serde::{Deserialize, Serialize};
use vfs_types::{
    DIR_RECORD_SIZE, DIR_RECORDS_PER_BLOCK, MAX_FILENAME, ParseError, ensure_slice,
    ensure_slice_mut, read_le_u16, read_le_u32, read_u8, write_bytes, write_le_u16,
    write_le_u32, write_u8,
};

const D_INO: usize = 0;
const D_NAME_LEN: usize = 4;
const D_FILE_TYPE: usize = 6;
const D_NAME: usize = 7;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirRecord {
    pub ino: u32,
    pub file_type: FileType,
    pub name: Vec<u8>,
}

impl DirRecord {
    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

/// Byte offset of `slot` inside a directory block.
pub fn dir_record_offset(slot: usize) -> Result<usize, ParseError> {
    if slot >= DIR_RECORDS_PER_BLOCK {
        return Err(ParseError::InvalidField {
            field: "dir_slot",
            reason: "slot index beyond block capacity",
        });
    }
    Ok(slot * DIR_RECORD_SIZE)
}

/// Inode field of a slot; zero means free.
pub fn read_dir_record_ino(block: &[u8], slot: usize) -> Result<u32, ParseError> {
    read_le_u32(block, dir_record_offset(slot)? + D_INO)
}

pub fn parse_dir_record(block: &[u8], slot: usize) -> Result<DirRecord, ParseError> {
    let rec = ensure_slice(block, dir_record_offset(slot)?, DIR_RECORD_SIZE)?;
    let ino = read_le_u32(rec, D_INO)?;
    let name_len = usize::from(read_le_u16(rec, D_NAME_LEN)?);
    if name_len > MAX_FILENAME {
        return Err(ParseError::InvalidField {
            field: "name_len",
            reason: "exceeds maximum filename length",
        });
    }
    let file_type = FileType::from_raw(read_u8(rec, D_FILE_TYPE)?);
    let name = ensure_slice(rec, D_NAME, name_len)?.to_vec();
    Ok(DirRecord {
        ino,
        file_type,
        name,
    })
}

/// Overwrite `slot` with `record`, zero-padding the name buffer.
pub fn write_dir_record(block: &mut [u8], slot: usize, record: &DirRecord) -> Result<(), ParseError> {
    if record.name.len() > MAX_FILENAME {
        return Err(ParseError::InvalidField {
            field: "name_len",
            reason: "exceeds maximum filename length",
        });
    }
    let rec = ensure_slice_mut(block, dir_record_offset(slot)?, DIR_RECORD_SIZE)?;
    rec.fill(0);
    write_le_u32(rec, D_INO, record.ino)?;
    let name_len = u16::try_from(record.name.len())
        .map_err(|_| ParseError::IntegerConversion { field: "name_len" })?;
    write_le_u16(rec, D_NAME_LEN, name_len)?;
    write_u8(rec, D_FILE_TYPE, record.file_type.to_raw())?;
    write_bytes(rec, D_NAME, &record.name)?;
    Ok(())
}

/// Free a slot by zeroing its inode field. Name bytes are left in place.
pub fn clear_dir_record(block: &mut [u8], slot: usize) -> Result<(), ParseError> {
    write_le_u32(block, dir_record_offset(slot)? + D_INO, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vfs_types::BLOCK_SIZE_BYTES;

    fn record(ino: u32, name: &str) -> DirRecord {
        DirRecord {
            ino,
            file_type: FileType::Regular,
            name: name.as_bytes().to_vec(),
        }
    }

    #[test]
    fn slots_are_packed_back_to_back() {
        let mut block = vec![0_u8; BLOCK_SIZE_BYTES];
        write_dir_record(&mut block, 1, &record(9, "hello")).unwrap();
        assert_eq!(&block[262..266], &9_u32.to_le_bytes());
        assert_eq!(&block[266..268], &5_u16.to_le_bytes());
        assert_eq!(block[268], 1);
        assert_eq!(&block[269..274], b"hello");
        assert_eq!(read_dir_record_ino(&block, 0).unwrap(), 0);
        assert_eq!(parse_dir_record(&block, 1).unwrap(), record(9, "hello"));
    }

    #[test]
    fn clear_keeps_name_bytes() {
        let mut block = vec![0_u8; BLOCK_SIZE_BYTES];
        write_dir_record(&mut block, 14, &record(3, "x")).unwrap();
        clear_dir_record(&mut block, 14).unwrap();
        assert_eq!(read_dir_record_ino(&block, 14).unwrap(), 0);
        assert_eq!(parse_dir_record(&block, 14).unwrap().name, b"x");
    }

    #[test]
    fn slot_fifteen_is_out_of_range() {
        let block = vec![0_u8; BLOCK_SIZE_BYTES];
        assert!(read_dir_record_ino(&block, DIR_RECORDS_PER_BLOCK).is_err());
    }

    #[test]
    fn overlong_names_are_rejected() {
        let mut block = vec![0_u8; BLOCK_SIZE_BYTES];
        let long = "a".repeat(MAX_FILENAME + 1);
        assert!(write_dir_record(&mut block, 0, &record(2, &long)).is_err());
        let max = "b".repeat(MAX_FILENAME);
        write_dir_record(&mut block, 0, &record(2, &max)).unwrap();
        assert_eq!(parse_dir_record(&block, 0).unwrap().name.len(), MAX_FILENAME);

        block[4..6].copy_from_slice(&300_u16.to_le_bytes());
        assert!(parse_dir_record(&block, 0).is_err());
    }
}
