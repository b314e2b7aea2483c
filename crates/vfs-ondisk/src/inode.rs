//! 128-byte inode records, file types and protection modes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use vfs_types::{
    EXTENT_ROOT_BYTES, INODE_SIZE, ParseError, read_fixed, read_le_u16, read_le_u32, read_u8,
    write_bytes, write_le_u16, write_le_u32, write_u8,
};

pub const S_IFMT: u16 = 0o170_000;
pub const S_IFREG: u16 = 0o100_000;
pub const S_IFDIR: u16 = 0o040_000;
pub const S_IFLNK: u16 = 0o120_000;

const I_MODE: usize = 0;
const I_UID: usize = 2;
const I_GID: usize = 4;
const I_COMMITTED: usize = 6;
const I_PROT_MODE: usize = 7;
const I_SIZE: usize = 8;
const I_CTIME: usize = 12;
const I_ATIME: usize = 16;
const I_MTIME: usize = 20;
const I_BLOCKS: usize = 24;
const I_EXTENT_ROOT: usize = 28;

/// Write-protection policy attached to a file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtectionMode {
    /// `P_RG`: single session, append only; no writes once committed.
    #[default]
    Regular,
    /// `P_MS`: appends allowed across sessions, no overwrites once committed.
    MultiSession,
    /// `P_FW`: unrestricted writes.
    FreeWrite,
}

impl ProtectionMode {
    pub fn from_raw(raw: u8) -> Result<Self, ParseError> {
        match raw {
            0x00 => Ok(Self::Regular),
            0x01 => Ok(Self::MultiSession),
            0x02 => Ok(Self::FreeWrite),
            _ => Err(ParseError::InvalidField {
                field: "prot_mode",
                reason: "unknown protection mode",
            }),
        }
    }

    #[must_use]
    pub fn to_raw(self) -> u8 {
        match self {
            Self::Regular => 0x00,
            Self::MultiSession => 0x01,
            Self::FreeWrite => 0x02,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Regular => "P_RG",
            Self::MultiSession => "P_MS",
            Self::FreeWrite => "P_FW",
        }
    }
}

impl FromStr for ProtectionMode {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "P_RG" => Ok(Self::Regular),
            "P_MS" => Ok(Self::MultiSession),
            "P_FW" => Ok(Self::FreeWrite),
            _ => Err(ParseError::InvalidField {
                field: "protection",
                reason: "expected P_RG, P_MS or P_FW",
            }),
        }
    }
}

impl fmt::Display for ProtectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// File type tag stored in directory records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FileType {
    Unknown = 0,
    Regular = 1,
    Directory = 2,
    Symlink = 7,
}

impl FileType {
    #[must_use]
    pub fn from_raw(val: u8) -> Self {
        match val {
            1 => Self::Regular,
            2 => Self::Directory,
            7 => Self::Symlink,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn from_mode(mode: u16) -> Self {
        match mode & S_IFMT {
            S_IFREG => Self::Regular,
            S_IFDIR => Self::Directory,
            S_IFLNK => Self::Symlink,
            _ => Self::Unknown,
        }
    }

    #[must_use]
    pub fn to_raw(self) -> u8 {
        self as u8
    }
}

/// On-disk inode record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InodeRecord {
    pub mode: u16,
    pub uid: u16,
    pub gid: u16,
    pub committed: u8,
    pub prot_mode: u8,
    pub size: u32,
    pub ctime: u32,
    pub atime: u32,
    pub mtime: u32,
    /// Number of data blocks mapped by the extent tree.
    pub blocks: u32,
    /// Embedded extent-tree root (header plus nine entries).
    pub extent_root: [u8; EXTENT_ROOT_BYTES],
}

impl Default for InodeRecord {
    fn default() -> Self {
        Self {
            mode: 0,
            uid: 0,
            gid: 0,
            committed: 0,
            prot_mode: 0,
            size: 0,
            ctime: 0,
            atime: 0,
            mtime: 0,
            blocks: 0,
            extent_root: [0_u8; EXTENT_ROOT_BYTES],
        }
    }
}

impl InodeRecord {
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        if bytes.len() < INODE_SIZE {
            return Err(ParseError::InsufficientData {
                needed: INODE_SIZE,
                offset: 0,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            mode: read_le_u16(bytes, I_MODE)?,
            uid: read_le_u16(bytes, I_UID)?,
            gid: read_le_u16(bytes, I_GID)?,
            committed: read_u8(bytes, I_COMMITTED)?,
            prot_mode: read_u8(bytes, I_PROT_MODE)?,
            size: read_le_u32(bytes, I_SIZE)?,
            ctime: read_le_u32(bytes, I_CTIME)?,
            atime: read_le_u32(bytes, I_ATIME)?,
            mtime: read_le_u32(bytes, I_MTIME)?,
            blocks: read_le_u32(bytes, I_BLOCKS)?,
            extent_root: read_fixed::<EXTENT_ROOT_BYTES>(bytes, I_EXTENT_ROOT)?,
        })
    }

    pub fn write_to_bytes(&self, bytes: &mut [u8]) -> Result<(), ParseError> {
        write_le_u16(bytes, I_MODE, self.mode)?;
        write_le_u16(bytes, I_UID, self.uid)?;
        write_le_u16(bytes, I_GID, self.gid)?;
        write_u8(bytes, I_COMMITTED, self.committed)?;
        write_u8(bytes, I_PROT_MODE, self.prot_mode)?;
        write_le_u32(bytes, I_SIZE, self.size)?;
        write_le_u32(bytes, I_CTIME, self.ctime)?;
        write_le_u32(bytes, I_ATIME, self.atime)?;
        write_le_u32(bytes, I_MTIME, self.mtime)?;
        write_le_u32(bytes, I_BLOCKS, self.blocks)?;
        write_bytes(bytes, I_EXTENT_ROOT, &self.extent_root)?;
        Ok(())
    }

    #[must_use]
    pub fn file_type(&self) -> FileType {
        FileType::from_mode(self.mode)
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    #[must_use]
    pub fn is_regular(&self) -> bool {
        self.mode & S_IFMT == S_IFREG
    }

    /// A zeroed mode marks a free inode slot.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.mode == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inode_fields_land_at_fixed_offsets() {
        let mut rec = InodeRecord {
            mode: S_IFREG | 0o644,
            uid: 1000,
            gid: 100,
            committed: 1,
            prot_mode: 2,
            size: 8192,
            ctime: 11,
            atime: 12,
            mtime: 13,
            blocks: 2,
            ..InodeRecord::default()
        };
        rec.extent_root[0] = 0x27;
        rec.extent_root[99] = 0xFF;

        let mut bytes = [0_u8; INODE_SIZE];
        rec.write_to_bytes(&mut bytes).unwrap();
        assert_eq!(&bytes[0..2], &(S_IFREG | 0o644).to_le_bytes());
        assert_eq!(bytes[6], 1);
        assert_eq!(bytes[7], 2);
        assert_eq!(&bytes[24..28], &2_u32.to_le_bytes());
        assert_eq!(bytes[28], 0x27);
        assert_eq!(bytes[127], 0xFF);
        assert_eq!(InodeRecord::parse_from_bytes(&bytes).unwrap(), rec);
    }

    #[test]
    fn short_buffer_is_rejected() {
        assert!(matches!(
            InodeRecord::parse_from_bytes(&[0_u8; 100]),
            Err(ParseError::InsufficientData { needed: 128, .. })
        ));
    }

    #[test]
    fn protection_mode_strings() {
        assert_eq!("P_RG".parse::<ProtectionMode>().unwrap(), ProtectionMode::Regular);
        assert_eq!("P_MS".parse::<ProtectionMode>().unwrap(), ProtectionMode::MultiSession);
        assert_eq!("P_FW".parse::<ProtectionMode>().unwrap(), ProtectionMode::FreeWrite);
        assert!("p_fw".parse::<ProtectionMode>().is_err());
        assert_eq!(ProtectionMode::FreeWrite.to_string(), "P_FW");
        assert!(ProtectionMode::from_raw(3).is_err());
        assert_eq!(ProtectionMode::from_raw(1).unwrap().to_raw(), 1);
    }

    #[test]
    fn file_type_from_mode() {
        assert_eq!(FileType::from_mode(S_IFDIR | 0o755), FileType::Directory);
        assert_eq!(FileType::from_mode(S_IFREG), FileType::Regular);
        assert_eq!(FileType::from_mode(0), FileType::Unknown);
        assert_eq!(FileType::from_raw(FileType::Symlink.to_raw()), FileType::Symlink);
    }
}
