//! Superblock (block 0) and group descriptor table (block 1).

use serde::{Deserialize, Serialize};
use vfs_types::{
    BLOCK_SIZE_BYTES, DEFAULT_BLOCKS_PER_GROUP, DEFAULT_INODES_PER_GROUP, GROUP_DESC_SIZE,
    GROUP_DESCS_PER_BLOCK, PASSWORD_HASH_SIZE, ParseError, VAULTFS_MAGIC, ensure_slice,
    ensure_slice_mut, read_fixed,
    read_le_u16, read_le_u32, read_le_u64, write_bytes, write_le_u16, write_le_u32,
    write_le_u64,
};

const SB_MAGIC: usize = 0;
const SB_INODES_COUNT: usize = 4;
const SB_BLOCKS_COUNT: usize = 8;
const SB_FREE_INODES: usize = 12;
const SB_FREE_BLOCKS: usize = 16;
const SB_MOUNT_TIME: usize = 20;
const SB_PASSWORD_HASH: usize = 28;
const SB_BLOCKS_PER_GROUP: usize = 156;
const SB_INODES_PER_GROUP: usize = 160;
const SB_GROUPS_COUNT: usize = 164;
const SB_END: usize = 168;

/// Decoded superblock.
///
/// The geometry fields are zero on images written before they existed; the
/// accessors substitute the system defaults in that case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub magic: u32,
    pub inodes_count: u32,
    pub blocks_count: u32,
    pub free_inodes_count: u32,
    pub free_blocks_count: u32,
    /// Seconds since the epoch of the last mount.
    pub mount_time: u64,
    pub password_hash: [u8; PASSWORD_HASH_SIZE],
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub groups_count: u32,
}

impl Superblock {
    pub fn parse(block: &[u8]) -> Result<Self, ParseError> {
        if block.len() < SB_END {
            return Err(ParseError::InsufficientData {
                needed: SB_END,
                offset: 0,
                actual: block.len(),
            });
        }
        let magic = read_le_u32(block, SB_MAGIC)?;
        if magic != VAULTFS_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(VAULTFS_MAGIC),
                actual: u64::from(magic),
            });
        }
        Ok(Self {
            magic,
            inodes_count: read_le_u32(block, SB_INODES_COUNT)?,
            blocks_count: read_le_u32(block, SB_BLOCKS_COUNT)?,
            free_inodes_count: read_le_u32(block, SB_FREE_INODES)?,
            free_blocks_count: read_le_u32(block, SB_FREE_BLOCKS)?,
            mount_time: read_le_u64(block, SB_MOUNT_TIME)?,
            password_hash: read_fixed::<PASSWORD_HASH_SIZE>(block, SB_PASSWORD_HASH)?,
            blocks_per_group: read_le_u32(block, SB_BLOCKS_PER_GROUP)?,
            inodes_per_group: read_le_u32(block, SB_INODES_PER_GROUP)?,
            groups_count: read_le_u32(block, SB_GROUPS_COUNT)?,
        })
    }

    /// Encode into the first bytes of `block`; the rest is left untouched.
    pub fn write_to(&self, block: &mut [u8]) -> Result<(), ParseError> {
        write_le_u32(block, SB_MAGIC, self.magic)?;
        write_le_u32(block, SB_INODES_COUNT, self.inodes_count)?;
        write_le_u32(block, SB_BLOCKS_COUNT, self.blocks_count)?;
        write_le_u32(block, SB_FREE_INODES, self.free_inodes_count)?;
        write_le_u32(block, SB_FREE_BLOCKS, self.free_blocks_count)?;
        write_le_u64(block, SB_MOUNT_TIME, self.mount_time)?;
        write_bytes(block, SB_PASSWORD_HASH, &self.password_hash)?;
        write_le_u32(block, SB_BLOCKS_PER_GROUP, self.blocks_per_group)?;
        write_le_u32(block, SB_INODES_PER_GROUP, self.inodes_per_group)?;
        write_le_u32(block, SB_GROUPS_COUNT, self.groups_count)?;
        Ok(())
    }

    /// Encode into a fresh zero-padded block.
    pub fn to_block(&self) -> Result<Vec<u8>, ParseError> {
        let mut block = vec![0_u8; BLOCK_SIZE_BYTES];
        self.write_to(&mut block)?;
        Ok(block)
    }

    #[must_use]
    pub fn effective_blocks_per_group(&self) -> u32 {
        if self.blocks_per_group == 0 {
            DEFAULT_BLOCKS_PER_GROUP
        } else {
            self.blocks_per_group
        }
    }

    #[must_use]
    pub fn effective_inodes_per_group(&self) -> u32 {
        if self.inodes_per_group == 0 {
            DEFAULT_INODES_PER_GROUP
        } else {
            self.inodes_per_group
        }
    }

    /// Structural checks that do not need the device.
    pub fn validate(&self) -> Result<(), ParseError> {
        if self.free_blocks_count > self.blocks_count {
            return Err(ParseError::InvalidField {
                field: "free_blocks_count",
                reason: "exceeds blocks_count",
            });
        }
        if self.free_inodes_count > self.inodes_count {
            return Err(ParseError::InvalidField {
                field: "free_inodes_count",
                reason: "exceeds inodes_count",
            });
        }
        if self.groups_count > GROUP_DESCS_PER_BLOCK {
            return Err(ParseError::InvalidField {
                field: "groups_count",
                reason: "group descriptor table must fit one block",
            });
        }
        Ok(())
    }
}

// ── Group descriptors ───────────────────────────────────────────────────────

const GD_FREE_BLOCKS: usize = 0;
const GD_FREE_INODES: usize = 4;
const GD_FLAGS: usize = 8;

/// One entry of the group descriptor table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupDesc {
    pub free_blocks_count: u32,
    pub free_inodes_count: u32,
    pub flags: u16,
}

impl GroupDesc {
    pub fn parse_from_bytes(bytes: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            free_blocks_count: read_le_u32(bytes, GD_FREE_BLOCKS)?,
            free_inodes_count: read_le_u32(bytes, GD_FREE_INODES)?,
            flags: read_le_u16(bytes, GD_FLAGS)?,
        })
    }

    pub fn write_to_bytes(&self, bytes: &mut [u8]) -> Result<(), ParseError> {
        write_le_u32(bytes, GD_FREE_BLOCKS, self.free_blocks_count)?;
        write_le_u32(bytes, GD_FREE_INODES, self.free_inodes_count)?;
        write_le_u16(bytes, GD_FLAGS, self.flags)?;
        write_bytes(bytes, GD_FLAGS + 2, &[0_u8; 6])?;
        Ok(())
    }
}

/// Decode the first `count` descriptors of the GDT block.
pub fn parse_gdt(block: &[u8], count: u32) -> Result<Vec<GroupDesc>, ParseError> {
    if count > GROUP_DESCS_PER_BLOCK {
        return Err(ParseError::InvalidField {
            field: "groups_count",
            reason: "group descriptor table must fit one block",
        });
    }
    (0..count as usize)
        .map(|g| {
            let bytes = ensure_slice(block, g * GROUP_DESC_SIZE, GROUP_DESC_SIZE)?;
            GroupDesc::parse_from_bytes(bytes)
        })
        .collect()
}

/// Encode a full, zero-padded GDT block.
pub fn serialize_gdt(descs: &[GroupDesc]) -> Result<Vec<u8>, ParseError> {
    if descs.len() > GROUP_DESCS_PER_BLOCK as usize {
        return Err(ParseError::InvalidField {
            field: "groups_count",
            reason: "group descriptor table must fit one block",
        });
    }
    let mut block = vec![0_u8; BLOCK_SIZE_BYTES];
    for (g, desc) in descs.iter().enumerate() {
        desc.write_to_bytes(ensure_slice_mut(&mut block, g * GROUP_DESC_SIZE, GROUP_DESC_SIZE)?)?;
    }
    Ok(block)
}
