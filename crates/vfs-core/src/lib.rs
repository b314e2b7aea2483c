#![forbid(unsafe_code)]
//! Mounted VaultFS filesystem.
//!
//! [`VaultFs`] is the explicit per-mount context: it owns the write-back
//! buffer cache, the in-memory group descriptor table, the inode cache and
//! the superblock fields that are not derived from the group table (mount
//! time and password hash). Every operation goes through it, so several
//! images can be mounted side by side in one process.
//!
//! ## Flush cadence
//!
//! Bitmaps, inodes and directory blocks are written through the buffer
//! cache as they change. The superblock and the group descriptor table are
//! rewritten in full only by [`VaultFs::sync`] and [`VaultFs::unmount`];
//! between checkpoints the live counts exist only in memory.

mod file;
mod format;

pub use format::{FormatOptions, format};
pub use vfs_alloc::GroupMismatch;
pub use vfs_dir::DirEntry;
pub use vfs_error::{Result, VfsError};
pub use vfs_inode::{InodeHandle, UnlinkKind};
pub use vfs_ondisk::{FileType, ProtectionMode, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG, Superblock};
pub use vfs_types::{BLOCK_SIZE, BlockNumber, GDT_BLOCK, InodeNumber, MAX_FILENAME, SUPERBLOCK_BLOCK};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};
use vfs_alloc::{FsGeometry, GroupTable};
use vfs_block::{BlockDevice, BufferCache, ByteBlockDevice, FileByteDevice};
use vfs_extent::{mapped_blocks, tree_blocks};
use vfs_inode::{InodeTable, now_secs};
use vfs_ondisk::parse_gdt;
use vfs_types::{PASSWORD_HASH_SIZE, ParseError};

// ── Options ─────────────────────────────────────────────────────────────────

/// Options controlling how an image is mounted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountOptions {
    /// Capacity of the write-back buffer cache, in blocks.
    pub cache_blocks: usize,
    /// Protection given to regular files created during this mount.
    pub default_protection: ProtectionMode,
    /// Skip the superblock count checks, the device-size check and the
    /// bitmap reconciliation. For inspecting damaged images only.
    pub skip_geometry_check: bool,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            cache_blocks: 1024,
            default_protection: ProtectionMode::Regular,
            skip_geometry_check: false,
        }
    }
}

/// `statfs(2)`-style summary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatFs {
    pub block_size: u32,
    pub blocks: u64,
    pub free_blocks: u64,
    pub files: u64,
    pub free_files: u64,
    pub name_max: u32,
}

/// Inode attributes as seen by the host layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeAttr {
    pub ino: InodeNumber,
    pub file_type: FileType,
    pub mode: u16,
    pub uid: u16,
    pub gid: u16,
    pub size: u32,
    /// Mapped data blocks.
    pub blocks: u32,
    pub links: u16,
    pub protection: ProtectionMode,
    pub committed: bool,
    pub atime: u32,
    pub mtime: u32,
    pub ctime: u32,
}

/// Parse a textual protection mode (`P_RG`, `P_MS`, `P_FW`).
pub fn parse_protection(text: &str) -> Result<ProtectionMode> {
    ProtectionMode::from_str(text).map_err(|err| VfsError::InvalidArgument(err.to_string()))
}

fn mount_err(what: &str, err: &ParseError) -> VfsError {
    match err {
        ParseError::InvalidMagic { .. } => {
            VfsError::Format(format!("{what}: not a VaultFS image ({err})"))
        }
        _ => VfsError::Format(format!("{what}: {err}")),
    }
}

// ── Filesystem ──────────────────────────────────────────────────────────────

type CachedDevice = BufferCache<Arc<dyn BlockDevice>>;

/// A mounted filesystem.
pub struct VaultFs {
    cache: Arc<CachedDevice>,
    groups: Arc<GroupTable>,
    inodes: InodeTable,
    /// Last written superblock; counts are refreshed from `groups` on sync.
    sb: Mutex<Superblock>,
}

impl std::fmt::Debug for VaultFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultFs")
            .field("geometry", self.geometry())
            .field("free_blocks", &self.groups.free_blocks_total())
            .field("free_inodes", &self.groups.free_inodes_total())
            .finish_non_exhaustive()
    }
}

impl VaultFs {
    /// Open the image file at `path` read-write and mount it.
    pub fn open(path: impl AsRef<Path>, options: &MountOptions) -> Result<Self> {
        let file = FileByteDevice::open(path.as_ref())?;
        if !file.is_writable() {
            return Err(VfsError::PermissionDenied);
        }
        let dev = ByteBlockDevice::new(file, BLOCK_SIZE)?;
        Self::mount(Arc::new(dev), options)
    }

    /// Mount a formatted device.
    ///
    /// Validates the magic, the geometry and the descriptor table, stamps
    /// the mount time and loads the root inode.
    pub fn mount(device: Arc<dyn BlockDevice>, options: &MountOptions) -> Result<Self> {
        if device.block_size() != BLOCK_SIZE {
            return Err(VfsError::Format(format!(
                "device block size {} is not {BLOCK_SIZE}",
                device.block_size()
            )));
        }
        let device_blocks = device.block_count();
        let cache = Arc::new(BufferCache::new(device, options.cache_blocks)?);

        let mut sb = Superblock::parse(cache.read_block(SUPERBLOCK_BLOCK)?.as_slice())
            .map_err(|err| mount_err("superblock", &err))?;
        if !options.skip_geometry_check {
            sb.validate().map_err(|err| mount_err("superblock", &err))?;
            if u64::from(sb.blocks_count) > device_blocks {
                return Err(VfsError::InvalidGeometry(format!(
                    "superblock records {} blocks, device has {device_blocks}",
                    sb.blocks_count
                )));
            }
        }
        let geo = FsGeometry::from_superblock(&sb)?;
        let descs = parse_gdt(cache.read_block(GDT_BLOCK)?.as_slice(), geo.group_count)
            .map_err(|err| mount_err("group descriptor table", &err))?;
        let groups = Arc::new(GroupTable::from_descs(geo, &descs)?);

        if u64::from(sb.free_blocks_count) != groups.free_blocks_total()
            || u64::from(sb.free_inodes_count) != groups.free_inodes_total()
        {
            warn!(
                sb_free_blocks = sb.free_blocks_count,
                gdt_free_blocks = groups.free_blocks_total(),
                sb_free_inodes = sb.free_inodes_count,
                gdt_free_inodes = groups.free_inodes_total(),
                "superblock_count_mismatch"
            );
        }
        if !options.skip_geometry_check {
            for m in groups.reconcile(&*cache)? {
                warn!(
                    group = m.group.0,
                    bitmap = m.bitmap,
                    recorded = m.recorded,
                    actual = m.actual,
                    "gdt_mismatch"
                );
            }
        }

        sb.mount_time = u64::from(now_secs());
        let dev: Arc<dyn BlockDevice> = Arc::clone(&cache) as Arc<dyn BlockDevice>;
        let inodes = InodeTable::new(dev, Arc::clone(&groups), options.default_protection);
        let root = inodes.get_or_load(InodeNumber::ROOT)?;
        if !root.is_dir() {
            return Err(VfsError::Format("root inode is not a directory".into()));
        }

        let fs = Self {
            cache,
            groups,
            inodes,
            sb: Mutex::new(sb),
        };
        fs.write_superblock()?;
        info!(
            blocks = fs.geometry().total_blocks,
            groups = fs.geometry().group_count,
            free_blocks = fs.groups.free_blocks_total(),
            free_inodes = fs.groups.free_inodes_total(),
            "mount_complete"
        );
        Ok(fs)
    }

    #[must_use]
    pub fn geometry(&self) -> &FsGeometry {
        self.groups.geometry()
    }

    /// The superblock with live free counts.
    #[must_use]
    pub fn superblock(&self) -> Superblock {
        let mut sb = self.sb.lock().clone();
        sb.free_blocks_count = u32::try_from(self.groups.free_blocks_total()).unwrap_or(u32::MAX);
        sb.free_inodes_count = u32::try_from(self.groups.free_inodes_total()).unwrap_or(u32::MAX);
        sb
    }

    pub fn statfs(&self) -> StatFs {
        let sb = self.sb.lock();
        StatFs {
            block_size: BLOCK_SIZE,
            blocks: u64::from(sb.blocks_count),
            free_blocks: self.groups.free_blocks_total(),
            files: u64::from(sb.inodes_count),
            free_files: self.groups.free_inodes_total(),
            name_max: u32::try_from(MAX_FILENAME).unwrap_or(u32::MAX),
        }
    }

    /// Compare the descriptor counts with the bitmaps on disk.
    pub fn check_counts(&self) -> Result<Vec<GroupMismatch>> {
        self.groups.reconcile(&*self.cache)
    }

    fn write_superblock(&self) -> Result<()> {
        let block = self
            .superblock()
            .to_block()
            .map_err(|err| VfsError::corruption(SUPERBLOCK_BLOCK.0, err.to_string()))?;
        self.cache.write_block(SUPERBLOCK_BLOCK, &block)
    }

    /// Rewrite the superblock and the whole descriptor table, then flush
    /// every dirty block and sync the device.
    pub fn sync(&self) -> Result<()> {
        self.write_superblock()?;
        let gdt = vfs_ondisk::serialize_gdt(&self.groups.snapshot())
            .map_err(|err| VfsError::corruption(GDT_BLOCK.0, err.to_string()))?;
        self.cache.write_block(GDT_BLOCK, &gdt)?;
        let dirty = self.cache.dirty_count();
        self.cache.sync()?;
        debug!(dirty, "fs_sync");
        Ok(())
    }

    pub fn unmount(self) -> Result<()> {
        self.sync()?;
        info!(
            free_blocks = self.groups.free_blocks_total(),
            free_inodes = self.groups.free_inodes_total(),
            "unmount_complete"
        );
        Ok(())
    }

    // ── Inodes ──────────────────────────────────────────────────────────

    pub fn inode(&self, ino: InodeNumber) -> Result<InodeHandle> {
        self.inodes.get_or_load(ino)
    }

    pub fn stat(&self, ino: InodeNumber) -> Result<InodeAttr> {
        let inode = self.inodes.get_or_load(ino)?;
        let committed = inode.is_committed();
        let state = inode.lock();
        let r = &state.record;
        Ok(InodeAttr {
            ino,
            file_type: r.file_type(),
            mode: r.mode,
            uid: r.uid,
            gid: r.gid,
            size: r.size,
            blocks: r.blocks,
            links: state.links,
            protection: state.protection(),
            committed,
            atime: r.atime,
            mtime: r.mtime,
            ctime: r.ctime,
        })
    }

    /// Mapped data blocks and extent node blocks of an inode.
    pub fn block_usage(&self, ino: InodeNumber) -> Result<(u64, u32)> {
        let inode = self.inodes.get_or_load(ino)?;
        let state = inode.lock();
        let dev = self.inodes.device();
        Ok((
            mapped_blocks(dev, state.root())?,
            tree_blocks(dev, state.root())?,
        ))
    }

    // ── Namespace ───────────────────────────────────────────────────────

    pub fn lookup(&self, parent: InodeNumber, name: &str) -> Result<InodeNumber> {
        let dir = self.inodes.get_or_load(parent)?;
        Ok(self.inodes.lookup(&dir, name.as_bytes())?.ino())
    }

    /// Resolve an absolute path. Empty components and `.` are skipped;
    /// `..` is not supported because directories hold no parent record.
    pub fn resolve_path(&self, path: &str) -> Result<InodeNumber> {
        let rest = path
            .strip_prefix('/')
            .ok_or_else(|| VfsError::InvalidArgument(format!("path {path:?} is not absolute")))?;
        let mut ino = InodeNumber::ROOT;
        for component in rest.split('/').filter(|c| !c.is_empty() && *c != ".") {
            if component == ".." {
                return Err(VfsError::InvalidArgument("'..' is not supported".into()));
            }
            ino = self.lookup(ino, component)?;
        }
        Ok(ino)
    }

    /// Entries of `dir` after the first `offset` occupied records.
    pub fn read_dir(&self, dir: InodeNumber, offset: u64) -> Result<Vec<DirEntry>> {
        let inode = self.inodes.get_or_load(dir)?;
        let state = inode.lock();
        if !state.is_dir() {
            return Err(VfsError::NotDirectory);
        }
        self.inodes
            .dir_store()
            .iterate(state.root(), offset)?
            .collect()
    }

    /// Create a regular file (or the file type carried by `mode`).
    pub fn create(&self, parent: InodeNumber, name: &str, mode: u16) -> Result<InodeNumber> {
        let mode = if mode & S_IFMT == 0 { mode | S_IFREG } else { mode };
        let dir = self.inodes.get_or_load(parent)?;
        Ok(self.inodes.create(&dir, name.as_bytes(), mode)?.ino())
    }

    pub fn mkdir(&self, parent: InodeNumber, name: &str) -> Result<InodeNumber> {
        let dir = self.inodes.get_or_load(parent)?;
        Ok(self
            .inodes
            .create(&dir, name.as_bytes(), S_IFDIR | 0o755)?
            .ino())
    }

    pub fn unlink(&self, parent: InodeNumber, name: &str) -> Result<()> {
        let dir = self.inodes.get_or_load(parent)?;
        self.inodes.unlink(&dir, name.as_bytes(), UnlinkKind::File)?;
        Ok(())
    }

    pub fn rmdir(&self, parent: InodeNumber, name: &str) -> Result<()> {
        let dir = self.inodes.get_or_load(parent)?;
        self.inodes
            .unlink(&dir, name.as_bytes(), UnlinkKind::Directory)?;
        Ok(())
    }

    // ── Protection ──────────────────────────────────────────────────────

    /// Protection for regular files created from now on.
    pub fn set_default_protection(&self, mode: ProtectionMode) {
        self.inodes.set_default_protection(mode);
    }

    #[must_use]
    pub fn default_protection(&self) -> ProtectionMode {
        self.inodes.default_protection()
    }

    pub fn set_protection(&self, ino: InodeNumber, mode: ProtectionMode) -> Result<()> {
        let inode = self.inodes.get_or_load(ino)?;
        inode.set_protection(mode);
        self.inodes.write_back(&inode)
    }

    /// Close the write session of `ino`. Returns whether this call set the
    /// committed flag.
    pub fn try_commit(&self, ino: InodeNumber) -> Result<bool> {
        let inode = self.inodes.get_or_load(ino)?;
        let won = inode.try_commit();
        if won {
            self.inodes.write_back(&inode)?;
            debug!(ino = ino.0, "inode_commit");
        }
        Ok(won)
    }

    #[must_use]
    pub fn password_hash(&self) -> [u8; PASSWORD_HASH_SIZE] {
        self.sb.lock().password_hash
    }

    /// Replace the stored hash; persisted by the next [`sync`](Self::sync).
    pub fn set_password_hash(&self, hash: &[u8]) -> Result<()> {
        let padded = format::pad_password_hash(hash)?;
        self.sb.lock().password_hash = padded;
        Ok(())
    }

    /// Compare `candidate` with the stored hash in constant time.
    #[must_use]
    pub fn verify_password_hash(&self, candidate: &[u8]) -> bool {
        let Ok(padded) = format::pad_password_hash(candidate) else {
            return false;
        };
        let stored = self.password_hash();
        stored
            .iter()
            .zip(padded.iter())
            .fold(0_u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}
