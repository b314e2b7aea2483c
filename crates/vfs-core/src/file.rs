//! Block-granular file data access.
//!
//! Writes are gated by the protection mode once a file is committed:
//!
//! | mode | committed write |
//! |------|-----------------|
//! | `P_RG` | denied |
//! | `P_MS` | only to blocks not yet mapped (append) |
//! | `P_FW` | allowed |

use crate::VaultFs;
use tracing::{debug, error, trace};
use vfs_alloc::{AllocHint, BlockAlloc};
use vfs_error::{Result, VfsError};
use vfs_extent::{allocate_new_block, free_from, search};
use vfs_inode::{Inode, InodeState, now_secs};
use vfs_ondisk::ProtectionMode;
use vfs_types::{BLOCK_SIZE, BLOCK_SIZE_BYTES, BlockNumber, InodeNumber, inode_to_group};

fn check_write(inode: &Inode, state: &InodeState, already_mapped: bool) -> Result<()> {
    if !inode.is_committed() {
        return Ok(());
    }
    match state.protection() {
        ProtectionMode::FreeWrite => Ok(()),
        ProtectionMode::MultiSession if !already_mapped => Ok(()),
        mode => {
            debug!(ino = inode.ino().0, mode = mode.as_str(), "write_denied");
            Err(VfsError::PermissionDenied)
        }
    }
}

/// A handle fetched before a concurrent unlink released the inode.
fn check_live(inode: &Inode, state: &InodeState) -> Result<()> {
    if state.links == 0 {
        return Err(VfsError::NotFound(format!("inode {} was removed", inode.ino())));
    }
    Ok(())
}

impl VaultFs {
    fn data_hint(&self, ino: InodeNumber) -> AllocHint {
        AllocHint {
            goal_group: Some(inode_to_group(ino, self.geometry().inodes_per_group)),
            goal_block: None,
        }
    }

    fn zero_runs(&self, runs: &[BlockAlloc]) -> Result<()> {
        let zero = vec![0_u8; BLOCK_SIZE_BYTES];
        for run in runs {
            for block in run.start.0..run.start.0 + u64::from(run.count) {
                self.inodes.device().write_block(BlockNumber(block), &zero)?;
            }
        }
        Ok(())
    }

    /// Map `logical` while holding the inode lock, extending the file's
    /// mapping up to it. New data blocks are zeroed.
    ///
    /// File mappings are dense, so afterwards the file holds exactly
    /// `logical + 1` data blocks.
    fn map_locked(&self, inode: &Inode, state: &mut InodeState, logical: u32) -> Result<BlockNumber> {
        let end = logical.checked_add(1).ok_or_else(|| {
            VfsError::InvalidArgument(format!("block {logical} is past the largest file"))
        })?;
        let dev = self.inodes.device();
        let hint = self.data_hint(inode.ino());
        let mut alloc = self.inodes.allocator();
        let outcome = allocate_new_block(
            dev,
            &mut state.record.extent_root,
            logical,
            &hint,
            &mut alloc,
        )?;
        if !outcome.new_data.is_empty() {
            self.zero_runs(&outcome.new_data)?;
            let added = outcome.new_data_blocks();
            if u64::from(state.record.blocks) + added != u64::from(end) {
                error!(
                    ino = inode.ino().0,
                    blocks = state.record.blocks,
                    added,
                    end,
                    invariant = "dense_mapping",
                    "file_block_count_mismatch"
                );
            }
            state.record.blocks = end;
            trace!(
                ino = inode.ino().0,
                logical,
                physical = outcome.physical.0,
                new_data = added,
                new_tree_blocks = outcome.new_tree_blocks,
                "file_map"
            );
        }
        Ok(outcome.physical)
    }

    /// Physical block behind `logical`. With `create`, an unmapped block is
    /// allocated (together with any gap before it) and persisted.
    pub fn map_block(&self, ino: InodeNumber, logical: u32, create: bool) -> Result<Option<BlockNumber>> {
        let inode = self.inodes.get_or_load(ino)?;
        let mut state = inode.lock();
        check_live(&inode, &state)?;
        if let Some(physical) = search(self.inodes.device(), state.root(), logical)? {
            return Ok(Some(physical));
        }
        if !create {
            return Ok(None);
        }
        check_write(&inode, &state, false)?;
        let physical = self.map_locked(&inode, &mut state, logical)?;
        self.inodes.write_back_locked(&inode, &state)?;
        Ok(Some(physical))
    }

    /// Read one block of file data. Unmapped blocks read as zeros.
    pub fn read_block(&self, ino: InodeNumber, logical: u32) -> Result<Vec<u8>> {
        let inode = self.inodes.get_or_load(ino)?;
        let state = inode.lock();
        check_live(&inode, &state)?;
        if state.is_dir() {
            return Err(VfsError::IsDirectory);
        }
        match search(self.inodes.device(), state.root(), logical)? {
            Some(physical) => Ok(self.inodes.device().read_block(physical)?.into_inner()),
            None => Ok(vec![0; BLOCK_SIZE_BYTES]),
        }
    }

    /// Write one full block at `logical`, extending the file if needed.
    pub fn write_block(&self, ino: InodeNumber, logical: u32, data: &[u8]) -> Result<()> {
        if data.len() != BLOCK_SIZE_BYTES {
            return Err(VfsError::InvalidArgument(format!(
                "write of {} bytes, expected one {BLOCK_SIZE}-byte block",
                data.len()
            )));
        }
        let end = u32::try_from((u64::from(logical) + 1) * u64::from(BLOCK_SIZE)).map_err(|_| {
            VfsError::InvalidArgument(format!("block {logical} is past the largest file size"))
        })?;
        let inode = self.inodes.get_or_load(ino)?;
        let mut state = inode.lock();
        check_live(&inode, &state)?;
        if state.is_dir() {
            return Err(VfsError::IsDirectory);
        }
        let mapped = search(self.inodes.device(), state.root(), logical)?;
        check_write(&inode, &state, mapped.is_some())?;
        let physical = match mapped {
            Some(physical) => physical,
            None => self.map_locked(&inode, &mut state, logical)?,
        };
        self.inodes.device().write_block(physical, data)?;

        let now = now_secs();
        state.record.size = state.record.size.max(end);
        state.record.mtime = now;
        state.record.ctime = now;
        self.inodes.write_back_locked(&inode, &state)
    }

    /// Set the file size, freeing every block past the new end.
    ///
    /// A partial last block keeps its stale tail bytes.
    pub fn truncate(&self, ino: InodeNumber, new_size: u32) -> Result<()> {
        let inode = self.inodes.get_or_load(ino)?;
        let mut state = inode.lock();
        check_live(&inode, &state)?;
        if state.is_dir() {
            return Err(VfsError::IsDirectory);
        }
        check_write(&inode, &state, true)?;

        let keep = new_size.div_ceil(BLOCK_SIZE);
        let mut alloc = self.inodes.allocator();
        let freed = free_from(
            self.inodes.device(),
            &mut state.record.extent_root,
            keep,
            &mut alloc,
        )?;
        let remaining = state.record.blocks.min(keep);
        if u64::from(state.record.blocks - remaining) != freed.data_blocks {
            error!(
                ino = ino.0,
                blocks = state.record.blocks,
                keep,
                freed = freed.data_blocks,
                invariant = "dense_mapping",
                "file_block_count_mismatch"
            );
        }
        let now = now_secs();
        state.record.blocks = remaining;
        state.record.size = new_size;
        state.record.mtime = now;
        state.record.ctime = now;
        self.inodes.write_back_locked(&inode, &state)?;
        debug!(
            ino = ino.0,
            new_size,
            data_blocks = freed.data_blocks,
            tree_blocks = freed.tree_blocks,
            "file_truncate"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::tests::small_fs;
    use crate::{InodeNumber, ProtectionMode, VfsError};
    use vfs_ondisk::InodeRecord;

    fn block(byte: u8) -> Vec<u8> {
        vec![byte; 4096]
    }

    #[test]
    fn new_file_reads_zeros_and_grows_on_write() {
        let fs = small_fs();
        let f = fs.create(InodeNumber::ROOT, "f", 0o644).unwrap();
        assert_eq!(fs.stat(f).unwrap().size, 0);
        assert_eq!(fs.read_block(f, 0).unwrap(), block(0));
        assert_eq!(fs.read_block(f, 9).unwrap(), block(0));

        fs.write_block(f, 3, &block(7)).unwrap();
        let attr = fs.stat(f).unwrap();
        assert_eq!(attr.size, 4 * 4096);
        assert_eq!(attr.blocks, 4);
        assert_eq!(fs.read_block(f, 3).unwrap(), block(7));
        assert_eq!(fs.read_block(f, 2).unwrap(), block(0));
    }

    #[test]
    fn short_writes_and_directories_are_rejected() {
        let fs = small_fs();
        let f = fs.create(InodeNumber::ROOT, "f", 0o644).unwrap();
        assert!(matches!(
            fs.write_block(f, 0, &[1; 100]),
            Err(VfsError::InvalidArgument(_))
        ));
        assert!(matches!(
            fs.write_block(InodeNumber::ROOT, 0, &block(1)),
            Err(VfsError::IsDirectory)
        ));
        assert!(matches!(fs.truncate(InodeNumber::ROOT, 0), Err(VfsError::IsDirectory)));
    }

    #[test]
    fn committed_regular_file_is_read_only() {
        let fs = small_fs();
        let f = fs.create(InodeNumber::ROOT, "f", 0o644).unwrap();
        fs.write_block(f, 0, &block(1)).unwrap();
        assert!(fs.try_commit(f).unwrap());

        assert!(matches!(fs.write_block(f, 0, &block(2)), Err(VfsError::PermissionDenied)));
        assert!(matches!(fs.write_block(f, 1, &block(2)), Err(VfsError::PermissionDenied)));
        assert!(matches!(fs.truncate(f, 0), Err(VfsError::PermissionDenied)));
        assert_eq!(fs.read_block(f, 0).unwrap(), block(1));
    }

    #[test]
    fn committed_multi_session_file_only_appends() {
        let fs = small_fs();
        fs.set_default_protection(ProtectionMode::MultiSession);
        let f = fs.create(InodeNumber::ROOT, "f", 0o644).unwrap();
        fs.write_block(f, 0, &block(1)).unwrap();
        assert!(fs.try_commit(f).unwrap());

        assert!(matches!(fs.write_block(f, 0, &block(2)), Err(VfsError::PermissionDenied)));
        fs.write_block(f, 1, &block(3)).unwrap();
        assert!(matches!(fs.write_block(f, 1, &block(4)), Err(VfsError::PermissionDenied)));
        assert_eq!(fs.read_block(f, 1).unwrap(), block(3));
    }

    #[test]
    fn committed_free_write_file_stays_writable() {
        let fs = small_fs();
        let f = fs.create(InodeNumber::ROOT, "f", 0o644).unwrap();
        fs.set_protection(f, ProtectionMode::FreeWrite).unwrap();
        fs.try_commit(f).unwrap();
        fs.write_block(f, 0, &block(5)).unwrap();
        fs.write_block(f, 0, &block(6)).unwrap();
        assert_eq!(fs.read_block(f, 0).unwrap(), block(6));
        fs.truncate(f, 0).unwrap();
    }

    #[test]
    fn truncate_returns_blocks() {
        let fs = small_fs();
        let f = fs.create(InodeNumber::ROOT, "f", 0o644).unwrap();
        let before = fs.statfs().free_blocks;
        for logical in 0..8 {
            fs.write_block(f, logical, &block(9)).unwrap();
        }
        assert_eq!(fs.statfs().free_blocks, before - 7);

        fs.truncate(f, 4096 + 1).unwrap();
        let attr = fs.stat(f).unwrap();
        assert_eq!(attr.size, 4097);
        assert_eq!(attr.blocks, 2);
        assert_eq!(fs.statfs().free_blocks, before - 1);
        assert_eq!(fs.map_block(f, 2, false).unwrap(), None);
        assert_eq!(fs.read_block(f, 5).unwrap(), block(0));

        fs.truncate(f, 0).unwrap();
        assert_eq!(fs.stat(f).unwrap().blocks, 0);
        assert_eq!(fs.statfs().free_blocks, before + 1);
    }

    #[test]
    fn map_block_extends_mapping() {
        let fs = small_fs();
        let f = fs.create(InodeNumber::ROOT, "f", 0o644).unwrap();
        assert!(fs.map_block(f, 0, false).unwrap().is_some());
        assert_eq!(fs.map_block(f, 2, false).unwrap(), None);
        let physical = fs.map_block(f, 2, true).unwrap().unwrap();
        assert_eq!(fs.map_block(f, 2, false).unwrap(), Some(physical));
        assert_eq!(fs.stat(f).unwrap().blocks, 3);
        assert_eq!(fs.stat(f).unwrap().size, 0);
    }

    #[test]
    fn removed_inode_reports_not_found() {
        let fs = small_fs();
        let f = fs.create(InodeNumber::ROOT, "f", 0o644).unwrap();
        fs.write_block(f, 0, &block(1)).unwrap();
        fs.unlink(InodeNumber::ROOT, "f").unwrap();
        assert!(matches!(fs.read_block(f, 0), Err(VfsError::NotFound(_))));
        assert!(matches!(fs.write_block(f, 0, &block(2)), Err(VfsError::NotFound(_))));

        // A handle still cached when another unlink released the inode.
        let g = fs.create(InodeNumber::ROOT, "g", 0o644).unwrap();
        let handle = fs.inode(g).unwrap();
        {
            let mut state = handle.lock();
            state.record = InodeRecord::default();
            state.links = 0;
        }
        assert!(matches!(fs.read_block(g, 0), Err(VfsError::NotFound(_))));
        assert!(matches!(fs.write_block(g, 0, &block(3)), Err(VfsError::NotFound(_))));
        assert!(matches!(fs.map_block(g, 0, true), Err(VfsError::NotFound(_))));
        assert!(matches!(fs.truncate(g, 0), Err(VfsError::NotFound(_))));
    }

    #[test]
    fn writes_past_the_largest_file_size_are_rejected() {
        let fs = small_fs();
        let f = fs.create(InodeNumber::ROOT, "f", 0o644).unwrap();
        let free = fs.statfs().free_blocks;

        // Block 2^20 ends past 4 GiB, beyond the 32-bit size field.
        assert!(matches!(
            fs.write_block(f, 1 << 20, &block(1)),
            Err(VfsError::InvalidArgument(_))
        ));
        assert!(matches!(
            fs.map_block(f, u32::MAX, true),
            Err(VfsError::InvalidArgument(_))
        ));
        assert_eq!(fs.statfs().free_blocks, free);
        let attr = fs.stat(f).unwrap();
        assert_eq!(attr.size, 0);
        assert_eq!(attr.blocks, 1);
    }
}
