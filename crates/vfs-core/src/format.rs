//! Writing an empty filesystem.

use serde::{Deserialize, Serialize};
use tracing::info;
use vfs_alloc::FsGeometry;
use vfs_alloc::bitmap::Bitmap;
use vfs_block::BlockDevice;
use vfs_error::{Result, VfsError};
use vfs_extent::init;
use vfs_inode::now_secs;
use vfs_ondisk::{GroupDesc, InodeRecord, ProtectionMode, S_IFDIR, Superblock, serialize_gdt};
use vfs_types::{
    BLOCK_SIZE, BlockNumber, DEFAULT_BLOCKS_PER_GROUP, DEFAULT_INODES_PER_GROUP, GDT_BLOCK,
    GroupNumber,
    INODE_SIZE, InodeNumber, PASSWORD_HASH_SIZE, SUPERBLOCK_BLOCK, VAULTFS_MAGIC,
};

/// Layout parameters for [`format`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormatOptions {
    pub blocks_per_group: u32,
    /// Must be a multiple of 32 (one inode-table block).
    pub inodes_per_group: u32,
    /// Stored verbatim, zero-padded to 128 bytes.
    pub password_hash: Vec<u8>,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            blocks_per_group: DEFAULT_BLOCKS_PER_GROUP,
            inodes_per_group: DEFAULT_INODES_PER_GROUP,
            password_hash: Vec::new(),
        }
    }
}

/// Zero-pad `hash` into the superblock field.
pub(crate) fn pad_password_hash(hash: &[u8]) -> Result<[u8; PASSWORD_HASH_SIZE]> {
    if hash.len() > PASSWORD_HASH_SIZE {
        return Err(VfsError::InvalidArgument(format!(
            "password hash is {} bytes, at most {PASSWORD_HASH_SIZE} fit",
            hash.len()
        )));
    }
    let mut out = [0_u8; PASSWORD_HASH_SIZE];
    out[..hash.len()].copy_from_slice(hash);
    Ok(out)
}

fn encode_err(block: u64, err: &impl std::fmt::Display) -> VfsError {
    VfsError::Format(format!("encode block {block}: {err}"))
}

/// Lay out an empty filesystem over the whole device.
///
/// Every group gets zeroed bitmaps and inode table. Inodes 0 and 1 and the
/// first data block of group 0 are marked used; inode 1 is the root
/// directory owning that block. Returns the superblock that was written.
pub fn format(dev: &dyn BlockDevice, options: &FormatOptions) -> Result<Superblock> {
    if dev.block_size() != BLOCK_SIZE {
        return Err(VfsError::InvalidGeometry(format!(
            "block size {} is not {BLOCK_SIZE}",
            dev.block_size()
        )));
    }
    let password_hash = pad_password_hash(&options.password_hash)?;
    let geo = FsGeometry::new(
        dev.block_count(),
        options.blocks_per_group,
        options.inodes_per_group,
    )?;
    let blocks_count = u32::try_from(geo.total_blocks).map_err(|_| {
        VfsError::InvalidGeometry(format!("{} blocks overflow u32", geo.total_blocks))
    })?;

    let zero = vec![0_u8; BLOCK_SIZE as usize];
    let mut descs = Vec::with_capacity(geo.group_count as usize);
    for g in 0..geo.group_count {
        let group = GroupNumber(g);
        let start = geo.group_start(group).0;
        for block in start..geo.first_data_block(group).0 {
            dev.write_block(BlockNumber(block), &zero)?;
        }
        descs.push(GroupDesc {
            free_blocks_count: geo.data_blocks_in_group(group),
            free_inodes_count: geo.inodes_per_group,
            flags: 0,
        });
    }

    // Group 0: reserved inode 0, root inode 1, root directory block.
    let g0 = GroupNumber(0);
    let mut block = zero.clone();
    let mut inodes = Bitmap::new(geo.inodes_per_group);
    inodes
        .set_range(0, 2)
        .map_err(|err| encode_err(geo.inode_bitmap_block(g0).0, &err))?;
    inodes.write_into(&mut block);
    dev.write_block(geo.inode_bitmap_block(g0), &block)?;

    let mut block = zero.clone();
    let mut data = Bitmap::new(geo.data_blocks_in_group(g0));
    data.set_range(0, 1)
        .map_err(|err| encode_err(geo.data_bitmap_block(g0).0, &err))?;
    data.write_into(&mut block);
    dev.write_block(geo.data_bitmap_block(g0), &block)?;

    descs[0].free_inodes_count -= 2;
    descs[0].free_blocks_count -= 1;

    let root_block = geo.first_data_block(g0);
    dev.write_block(root_block, &zero)?;
    let now = now_secs();
    let mut root = InodeRecord {
        mode: S_IFDIR | 0o755,
        prot_mode: ProtectionMode::FreeWrite.to_raw(),
        size: BLOCK_SIZE,
        ctime: now,
        atime: now,
        mtime: now,
        blocks: 1,
        ..InodeRecord::default()
    };
    init(&mut root.extent_root, root_block, 1)?;
    let (itable, offset) = geo.inode_location(InodeNumber::ROOT)?;
    let mut block = zero.clone();
    root.write_to_bytes(&mut block[offset..offset + INODE_SIZE])
        .map_err(|err| encode_err(itable.0, &err))?;
    dev.write_block(itable, &block)?;

    let gdt = serialize_gdt(&descs).map_err(|err| encode_err(GDT_BLOCK.0, &err))?;
    dev.write_block(GDT_BLOCK, &gdt)?;

    let sb = Superblock {
        magic: VAULTFS_MAGIC,
        inodes_count: geo.total_inodes(),
        blocks_count,
        free_inodes_count: descs.iter().map(|d| d.free_inodes_count).sum(),
        free_blocks_count: descs.iter().map(|d| d.free_blocks_count).sum(),
        mount_time: 0,
        password_hash,
        blocks_per_group: geo.blocks_per_group,
        inodes_per_group: geo.inodes_per_group,
        groups_count: geo.group_count,
    };
    let block = sb.to_block().map_err(|err| encode_err(SUPERBLOCK_BLOCK.0, &err))?;
    dev.write_block(SUPERBLOCK_BLOCK, &block)?;
    dev.sync()?;

    info!(
        blocks = geo.total_blocks,
        groups = geo.group_count,
        inodes = sb.inodes_count,
        free_blocks = sb.free_blocks_count,
        "format_complete"
    );
    Ok(sb)
}

#[cfg(test)]
mod tests {
    use super::*;
    use vfs_block::mem_block_device;
    use vfs_ondisk::parse_gdt;

    #[test]
    fn hundred_block_image_has_one_group() {
        let dev = mem_block_device(BLOCK_SIZE, 100).unwrap();
        let options = FormatOptions {
            inodes_per_group: 32,
            ..FormatOptions::default()
        };
        let sb = format(&dev, &options).unwrap();
        assert_eq!(sb.groups_count, 1);
        assert_eq!(sb.blocks_count, 100);
        assert_eq!(sb.inodes_count, 32);
        assert_eq!(sb.free_inodes_count, 30);
        // 100 - superblock - GDT - 2 bitmaps - 1 inode table - root block
        assert_eq!(sb.free_blocks_count, 94);

        let parsed = Superblock::parse(dev.read_block(SUPERBLOCK_BLOCK).unwrap().as_slice()).unwrap();
        assert_eq!(parsed, sb);
        let gdt = parse_gdt(dev.read_block(GDT_BLOCK).unwrap().as_slice(), 1).unwrap();
        assert_eq!(gdt[0].free_blocks_count, 94);

        let root = InodeRecord::parse_from_bytes(
            &dev.read_block(BlockNumber(4)).unwrap().as_slice()[INODE_SIZE..2 * INODE_SIZE],
        )
        .unwrap();
        assert!(root.is_dir());
        assert_eq!(root.blocks, 1);
    }

    #[test]
    fn oversized_password_hash_is_rejected() {
        let dev = mem_block_device(BLOCK_SIZE, 100).unwrap();
        let options = FormatOptions {
            inodes_per_group: 32,
            password_hash: vec![1; PASSWORD_HASH_SIZE + 1],
            ..FormatOptions::default()
        };
        assert!(matches!(
            format(&dev, &options),
            Err(VfsError::InvalidArgument(_))
        ));
    }

    #[test]
    fn geometry_errors_surface() {
        let dev = mem_block_device(BLOCK_SIZE, 100).unwrap();
        let options = FormatOptions {
            inodes_per_group: 33,
            ..FormatOptions::default()
        };
        assert!(matches!(
            format(&dev, &options),
            Err(VfsError::InvalidGeometry(_))
        ));
    }
}
