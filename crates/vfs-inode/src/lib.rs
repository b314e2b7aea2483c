#![forbid(unsafe_code)]
//! Inode metadata layer.
//!
//! Inodes are 128-byte records in each group's inode table. The
//! [`InodeTable`] caches one shared [`Inode`] per live inode number; its
//! mutex guards the record (including the embedded extent root) and the
//! in-memory link count. Every metadata change is written straight back to
//! the inode-table block under that block's stripe lock.
//!
//! Lock order: parent inode, then child inode, then block stripes. The cache
//! map lock is never held while taking an inode lock.

use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, error, trace, warn};
use vfs_alloc::{AllocHint, BlockAlloc, FsGeometry, GroupTable, InodeAlloc};
use vfs_block::{BlockDevice, BlockLockTable};
use vfs_dir::{DirStore, validate_name};
use vfs_error::{Result, VfsError};
use vfs_extent::{ExtentRoot, GroupAllocator, free_from, init};
use vfs_ondisk::{FileType, InodeRecord, ProtectionMode};
use vfs_types::{BlockNumber, INITIAL_FILE_SPACE, INODE_SIZE, InodeNumber, inode_to_group};

/// Seconds since the epoch, saturating at `u32::MAX`.
#[must_use]
pub fn now_secs() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u32::try_from(d.as_secs()).unwrap_or(u32::MAX))
}

/// Link count implied by the file type; links are not stored on disk.
fn default_links(file_type: FileType) -> u16 {
    match file_type {
        FileType::Directory => 2,
        _ => 1,
    }
}

// ── Inode ───────────────────────────────────────────────────────────────────

/// Mutable part of an inode, guarded by [`Inode::lock`].
#[derive(Debug)]
pub struct InodeState {
    pub record: InodeRecord,
    /// In-memory link count.
    pub links: u16,
}

impl InodeState {
    #[must_use]
    pub fn file_type(&self) -> FileType {
        self.record.file_type()
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.record.is_dir()
    }

    /// Protection mode; records are validated on load so this never falls
    /// back in practice.
    #[must_use]
    pub fn protection(&self) -> ProtectionMode {
        ProtectionMode::from_raw(self.record.prot_mode).unwrap_or_default()
    }

    #[must_use]
    pub fn root(&self) -> &ExtentRoot {
        &self.record.extent_root
    }
}

/// One cached inode.
#[derive(Debug)]
pub struct Inode {
    ino: InodeNumber,
    block: BlockNumber,
    offset: usize,
    state: Mutex<InodeState>,
    /// One-shot write lock, set with a compare-and-swap.
    committed: AtomicU8,
}

/// Shared handle to a cached inode.
pub type InodeHandle = Arc<Inode>;

impl Inode {
    fn new(ino: InodeNumber, block: BlockNumber, offset: usize, record: InodeRecord) -> Self {
        let committed = u8::from(record.committed != 0);
        let links = if record.is_free() {
            0
        } else {
            default_links(record.file_type())
        };
        Self {
            ino,
            block,
            offset,
            state: Mutex::new(InodeState { record, links }),
            committed: AtomicU8::new(committed),
        }
    }

    #[must_use]
    pub fn ino(&self) -> InodeNumber {
        self.ino
    }

    /// Lock the record. Do not call the other accessors while holding it.
    pub fn lock(&self) -> MutexGuard<'_, InodeState> {
        self.state.lock()
    }

    #[must_use]
    pub fn file_type(&self) -> FileType {
        self.state.lock().file_type()
    }

    #[must_use]
    pub fn is_dir(&self) -> bool {
        self.state.lock().is_dir()
    }

    #[must_use]
    pub fn size(&self) -> u32 {
        self.state.lock().record.size
    }

    #[must_use]
    pub fn links(&self) -> u16 {
        self.state.lock().links
    }

    #[must_use]
    pub fn protection(&self) -> ProtectionMode {
        self.state.lock().protection()
    }

    /// Change the protection mode in memory; persist with
    /// [`InodeTable::write_back`].
    pub fn set_protection(&self, mode: ProtectionMode) {
        let mut state = self.state.lock();
        state.record.prot_mode = mode.to_raw();
        state.record.ctime = now_secs();
    }

    /// Set the committed flag if it is clear.
    ///
    /// Returns whether this call performed the transition; concurrent
    /// callers see exactly one `true`.
    pub fn try_commit(&self) -> bool {
        self.committed
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::Acquire) != 0
    }

    /// The record as it would be written now.
    #[must_use]
    pub fn snapshot(&self) -> InodeRecord {
        let state = self.state.lock();
        self.disk_record(&state)
    }

    fn disk_record(&self, state: &InodeState) -> InodeRecord {
        let mut record = state.record.clone();
        record.committed = self.committed.load(Ordering::Acquire);
        record
    }
}

/// What [`InodeTable::unlink`] is allowed to remove.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnlinkKind {
    /// Anything but a directory (`unlink(2)`).
    File,
    /// Only an empty directory (`rmdir(2)`).
    Directory,
    Any,
}

// ── Inode table ─────────────────────────────────────────────────────────────

/// Inode cache plus the operations that create and destroy inodes.
pub struct InodeTable {
    dev: Arc<dyn BlockDevice>,
    groups: Arc<GroupTable>,
    locks: BlockLockTable,
    cache: Mutex<HashMap<InodeNumber, InodeHandle>>,
    default_protection: AtomicU8,
}

impl std::fmt::Debug for InodeTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InodeTable")
            .field("geometry", self.geometry())
            .field("cached", &self.cached())
            .finish_non_exhaustive()
    }
}

impl InodeTable {
    #[must_use]
    pub fn new(
        dev: Arc<dyn BlockDevice>,
        groups: Arc<GroupTable>,
        default_protection: ProtectionMode,
    ) -> Self {
        Self {
            dev,
            groups,
            locks: BlockLockTable::default(),
            cache: Mutex::new(HashMap::new()),
            default_protection: AtomicU8::new(default_protection.to_raw()),
        }
    }

    #[must_use]
    pub fn device(&self) -> &dyn BlockDevice {
        &*self.dev
    }

    #[must_use]
    pub fn groups(&self) -> &GroupTable {
        &self.groups
    }

    #[must_use]
    pub fn geometry(&self) -> &FsGeometry {
        self.groups.geometry()
    }

    /// Directory operations sharing this table's block stripes.
    #[must_use]
    pub fn dir_store(&self) -> DirStore<'_> {
        DirStore::new(&*self.dev, &self.locks)
    }

    #[must_use]
    pub fn allocator(&self) -> GroupAllocator<'_> {
        GroupAllocator::new(&*self.dev, &self.groups)
    }

    #[must_use]
    pub fn cached(&self) -> usize {
        self.cache.lock().len()
    }

    /// Protection applied to regular files created from now on.
    #[must_use]
    pub fn default_protection(&self) -> ProtectionMode {
        ProtectionMode::from_raw(self.default_protection.load(Ordering::Acquire))
            .unwrap_or_default()
    }

    pub fn set_default_protection(&self, mode: ProtectionMode) {
        self.default_protection.store(mode.to_raw(), Ordering::Release);
    }

    // ── Load and store ──────────────────────────────────────────────────

    /// Return the cached inode, reading it from the inode table on a miss.
    pub fn get_or_load(&self, ino: InodeNumber) -> Result<InodeHandle> {
        if let Some(handle) = self.cache.lock().get(&ino) {
            return Ok(Arc::clone(handle));
        }

        let (block, offset) = self.geometry().inode_location(ino)?;
        let buf = self.dev.read_block(block)?;
        let bytes = buf
            .as_slice()
            .get(offset..offset + INODE_SIZE)
            .ok_or_else(|| VfsError::corruption(block.0, "inode slot beyond block end"))?;
        let record = InodeRecord::parse_from_bytes(bytes)
            .map_err(|err| VfsError::corruption(block.0, format!("inode {ino}: {err}")))?;
        if record.is_free() {
            return Err(VfsError::NotFound(format!("inode {ino} is not in use")));
        }
        if let Err(err) = ProtectionMode::from_raw(record.prot_mode) {
            error!(ino = ino.0, raw = record.prot_mode, "inode_protection_invalid");
            return Err(VfsError::corruption(block.0, format!("inode {ino}: {err}")));
        }

        let loaded = Arc::new(Inode::new(ino, block, offset, record));
        let mut cache = self.cache.lock();
        // Another thread may have loaded it meanwhile; keep the first copy.
        let handle = cache.entry(ino).or_insert(loaded);
        trace!(ino = ino.0, block = block.0, "inode_load");
        Ok(Arc::clone(handle))
    }

    /// Lock `inode` and persist it.
    pub fn write_back(&self, inode: &Inode) -> Result<()> {
        let state = inode.lock();
        self.write_back_locked(inode, &state)
    }

    /// Persist `inode` for a caller that already holds its lock.
    pub fn write_back_locked(&self, inode: &Inode, state: &InodeState) -> Result<()> {
        self.store_record(inode.block, inode.offset, &inode.disk_record(state))
    }

    fn store_record(&self, block: BlockNumber, offset: usize, record: &InodeRecord) -> Result<()> {
        let _guard = self.locks.lock(block);
        let mut buf = self.dev.read_block(block)?;
        let slot = buf
            .as_mut_slice()
            .get_mut(offset..offset + INODE_SIZE)
            .ok_or_else(|| VfsError::corruption(block.0, "inode slot beyond block end"))?;
        record
            .write_to_bytes(slot)
            .map_err(|err| VfsError::corruption(block.0, format!("encode inode: {err}")))?;
        self.dev.write_block(block, buf.as_slice())
    }

    fn zero_run(&self, run: BlockAlloc) -> Result<()> {
        let zero = vec![0_u8; self.dev.block_size() as usize];
        for block in run.start.0..run.start.0 + u64::from(run.count) {
            self.dev.write_block(BlockNumber(block), &zero)?;
        }
        Ok(())
    }

    fn group_hint(&self, ino: InodeNumber) -> AllocHint {
        AllocHint {
            goal_group: Some(inode_to_group(ino, self.geometry().inodes_per_group)),
            goal_block: None,
        }
    }

    // ── Namespace ───────────────────────────────────────────────────────

    /// Resolve `name` inside the directory `parent`.
    pub fn lookup(&self, parent: &Inode, name: &[u8]) -> Result<InodeHandle> {
        let ino = {
            let state = parent.lock();
            if !state.is_dir() {
                return Err(VfsError::NotDirectory);
            }
            self.dir_store().lookup_by_name(state.root(), name)?
        };
        self.get_or_load(ino)
    }

    /// Create an inode of type `mode` and link it as `name` in `parent`.
    ///
    /// The inode is placed in (or near) the parent's group together with
    /// its first data block. Any failure after the inode bit is reserved
    /// returns the bit, the data block and the inode slot to their free
    /// state.
    pub fn create(&self, parent: &Inode, name: &[u8], mode: u16) -> Result<InodeHandle> {
        validate_name(name)?;
        let file_type = FileType::from_mode(mode);
        if file_type == FileType::Unknown {
            return Err(VfsError::InvalidArgument(format!(
                "unsupported file mode {mode:#o}"
            )));
        }

        let mut pstate = parent.lock();
        if !pstate.is_dir() {
            return Err(VfsError::NotDirectory);
        }
        if pstate.links == 0 {
            return Err(VfsError::NotFound(format!(
                "directory {} was removed",
                parent.ino
            )));
        }
        if self.dir_store().find(pstate.root(), name)?.is_some() {
            return Err(VfsError::Exists);
        }

        let near = inode_to_group(parent.ino, self.geometry().inodes_per_group);
        let reserved = self.groups.alloc_inode(&*self.dev, near)?;
        let mut data = None;
        match self.populate(parent, &mut pstate, name, mode, reserved, &mut data) {
            Ok(handle) => {
                debug!(
                    ino = reserved.ino.0,
                    parent = parent.ino.0,
                    group = reserved.group.0,
                    mode,
                    "inode_create"
                );
                Ok(handle)
            }
            Err(err) => {
                self.undo_create(reserved.ino, data, &err);
                Err(err)
            }
        }
    }

    fn populate(
        &self,
        parent: &Inode,
        pstate: &mut InodeState,
        name: &[u8],
        mode: u16,
        reserved: InodeAlloc,
        data: &mut Option<BlockAlloc>,
    ) -> Result<InodeHandle> {
        let file_type = FileType::from_mode(mode);
        let hint = AllocHint {
            goal_group: Some(reserved.group),
            goal_block: None,
        };
        let run = self
            .groups
            .alloc_blocks(&*self.dev, INITIAL_FILE_SPACE, &hint)?;
        *data = Some(run);
        self.zero_run(run)?;

        let now = now_secs();
        let is_dir = file_type == FileType::Directory;
        let mut record = InodeRecord {
            mode,
            prot_mode: if is_dir {
                ProtectionMode::FreeWrite.to_raw()
            } else {
                self.default_protection().to_raw()
            },
            size: if is_dir {
                run.count.saturating_mul(self.dev.block_size())
            } else {
                0
            },
            ctime: now,
            atime: now,
            mtime: now,
            blocks: run.count,
            ..InodeRecord::default()
        };
        init(&mut record.extent_root, run.start, run.count)?;

        let (block, offset) = self.geometry().inode_location(reserved.ino)?;
        let handle = Arc::new(Inode::new(reserved.ino, block, offset, record));
        self.write_back(&handle)?;

        let dirs = self.dir_store();
        let mut alloc = self.allocator();
        let (old_blocks, old_size) = (pstate.record.blocks, pstate.record.size);
        let out = dirs.insert(
            &mut pstate.record.extent_root,
            name,
            reserved.ino,
            file_type,
            &self.group_hint(parent.ino),
            &mut alloc,
        )?;

        let old_links = pstate.links;
        let updated = u32::try_from(out.new_data_blocks)
            .map_err(|_| VfsError::corruption(parent.block.0, "directory grew past u32 blocks"))
            .and_then(|grown| {
                pstate.record.blocks = pstate.record.blocks.saturating_add(grown);
                if grown > 0 {
                    pstate.record.size =
                        pstate.record.blocks.saturating_mul(self.dev.block_size());
                }
                pstate.record.mtime = now;
                pstate.record.ctime = now;
                if is_dir {
                    pstate.links = pstate.links.saturating_add(1);
                }
                self.write_back_locked(parent, pstate)
            });
        if let Err(err) = updated {
            // Without the parent on disk the new record must not survive.
            if let Err(undo) = dirs.remove(pstate.root(), reserved.ino) {
                error!(ino = reserved.ino.0, error = %undo, "dir_unlink_undo_failed");
            }
            if out.new_data_blocks > 0 {
                // The on-disk parent never referenced the appended block.
                if let Err(undo) =
                    free_from(&*self.dev, &mut pstate.record.extent_root, old_blocks, &mut alloc)
                {
                    error!(ino = parent.ino.0, error = %undo, "dir_grow_undo_failed");
                }
            }
            pstate.record.blocks = old_blocks;
            pstate.record.size = old_size;
            pstate.links = old_links;
            return Err(err);
        }

        self.cache.lock().insert(reserved.ino, Arc::clone(&handle));
        Ok(handle)
    }

    fn undo_create(&self, ino: InodeNumber, data: Option<BlockAlloc>, cause: &VfsError) {
        warn!(ino = ino.0, error = %cause, "inode_create_rollback");
        if let Some(run) = data {
            if let Err(err) = self.groups.free_blocks(&*self.dev, run.start, run.count) {
                error!(ino = ino.0, start = run.start.0, error = %err, "inode_create_rollback_failed");
            }
        }
        match self.geometry().inode_location(ino) {
            Ok((block, offset)) => {
                if let Err(err) = self.store_record(block, offset, &InodeRecord::default()) {
                    error!(ino = ino.0, error = %err, "inode_create_rollback_failed");
                }
            }
            Err(err) => error!(ino = ino.0, error = %err, "inode_create_rollback_failed"),
        }
        if let Err(err) = self.groups.free_inode(&*self.dev, ino) {
            error!(ino = ino.0, error = %err, "inode_create_rollback_failed");
        }
    }

    /// Remove `name` from `parent` and drop one link of its inode, releasing
    /// the inode when no link remains.
    ///
    /// Directories must be empty. Returns the inode that was unlinked.
    pub fn unlink(&self, parent: &Inode, name: &[u8], kind: UnlinkKind) -> Result<InodeNumber> {
        let mut pstate = parent.lock();
        if !pstate.is_dir() {
            return Err(VfsError::NotDirectory);
        }
        let dirs = self.dir_store();
        let Some((_, record)) = dirs.find(pstate.root(), name)? else {
            return Err(VfsError::NotFound(String::from_utf8_lossy(name).into_owned()));
        };
        let child_ino = InodeNumber(u64::from(record.ino));
        let child = self.get_or_load(child_ino)?;
        let mut cstate = child.lock();

        let child_is_dir = cstate.is_dir();
        match kind {
            UnlinkKind::File if child_is_dir => return Err(VfsError::IsDirectory),
            UnlinkKind::Directory if !child_is_dir => return Err(VfsError::NotDirectory),
            _ => {}
        }
        if child_is_dir && !dirs.is_empty(cstate.root())? {
            return Err(VfsError::NotEmpty);
        }
        dirs.remove_by_name(pstate.root(), name)?;

        let now = now_secs();
        if child_is_dir {
            cstate.links = 0;
            pstate.links = pstate.links.saturating_sub(1);
        } else {
            cstate.links = cstate.links.saturating_sub(1);
        }
        pstate.record.mtime = now;
        pstate.record.ctime = now;
        self.write_back_locked(parent, &pstate)?;

        if cstate.links == 0 {
            self.release_locked(&child, &mut cstate)?;
        } else {
            cstate.record.ctime = now;
            self.write_back_locked(&child, &cstate)?;
        }
        trace!(parent = parent.ino.0, ino = child_ino.0, "inode_unlink");
        Ok(child_ino)
    }

    /// Free every block of `inode`, zero its record and clear its bit.
    pub fn release(&self, inode: &Inode) -> Result<()> {
        let mut state = inode.lock();
        self.release_locked(inode, &mut state)
    }

    fn release_locked(&self, inode: &Inode, state: &mut InodeState) -> Result<()> {
        let mut alloc = self.allocator();
        let freed = free_from(&*self.dev, &mut state.record.extent_root, 0, &mut alloc)?;
        state.record = InodeRecord::default();
        state.links = 0;
        inode.committed.store(0, Ordering::Release);
        self.write_back_locked(inode, state)?;
        self.groups.free_inode(&*self.dev, inode.ino)?;
        self.cache.lock().remove(&inode.ino);
        debug!(
            ino = inode.ino.0,
            data_blocks = freed.data_blocks,
            tree_blocks = freed.tree_blocks,
            "inode_release"
        );
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
