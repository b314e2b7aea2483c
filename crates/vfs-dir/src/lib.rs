#![forbid(unsafe_code)]
//! Directory record store.
//!
//! A directory's entries are fixed 262-byte slots packed 15 to a block in
//! the data blocks its extent tree maps. Every operation scans those blocks
//! in logical order, slot by slot; there is no index. A slot whose inode
//! field is zero is free.
//!
//! Claiming and clearing a slot re-reads its block under that block's
//! stripe of the [`BlockLockTable`], so concurrent inserters race for a
//! slot without a directory-wide lock and exactly one of them wins. Growing
//! the directory needs `&mut` access to its extent root, which the caller
//! serializes.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, trace};
use vfs_alloc::AllocHint;
use vfs_block::{BlockBuf, BlockDevice, BlockLockTable};
use vfs_error::{Result, VfsError};
use vfs_extent::{BlockAllocator, ExtentRoot, allocate_new_block, free_from, last_mapped, walk};
use vfs_ondisk::{
    DirRecord, ExtentLeaf, FileType, clear_dir_record, parse_dir_record, read_dir_record_ino,
    write_dir_record,
};
use vfs_types::{
    BlockNumber, DIR_RECORDS_PER_BLOCK, InodeNumber, MAX_DIR_RECORDS, MAX_FILENAME, ParseError,
};

/// Most data blocks a directory may grow to.
#[expect(clippy::cast_possible_truncation)]
pub const MAX_DIR_BLOCKS: u32 = MAX_DIR_RECORDS.div_ceil(DIR_RECORDS_PER_BLOCK) as u32;

/// Reject names that cannot be stored as a single directory record.
pub fn validate_name(name: &[u8]) -> Result<()> {
    if name.len() > MAX_FILENAME {
        return Err(VfsError::NameTooLong);
    }
    if name.is_empty() {
        return Err(VfsError::InvalidArgument("empty file name".into()));
    }
    if name == b"." || name == b".." {
        return Err(VfsError::InvalidArgument(format!(
            "reserved file name {:?}",
            String::from_utf8_lossy(name)
        )));
    }
    if name.iter().any(|&b| b == b'/' || b == 0) {
        return Err(VfsError::InvalidArgument(
            "file name contains '/' or NUL".into(),
        ));
    }
    Ok(())
}

// ── Types ───────────────────────────────────────────────────────────────────

/// Position of one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRef {
    pub block: BlockNumber,
    pub slot: usize,
}

/// An occupied record as produced by [`DirStore::iterate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub ino: InodeNumber,
    pub file_type: FileType,
    pub name: Vec<u8>,
    /// Offset to pass to [`DirStore::iterate`] to resume after this entry.
    pub next_offset: u64,
}

impl DirEntry {
    #[must_use]
    pub fn name_str(&self) -> String {
        String::from_utf8_lossy(&self.name).into_owned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertOutcome {
    pub slot: SlotRef,
    /// Data blocks added to the directory (0 unless it had to grow).
    pub new_data_blocks: u64,
    /// Extent tree node blocks added while growing.
    pub new_tree_blocks: u32,
}

fn record_corruption(block: BlockNumber, err: &ParseError) -> VfsError {
    error!(block = block.0, detail = %err, "dir_record_invalid");
    VfsError::corruption(block.0, format!("directory record: {err}"))
}

fn slot_ino(block: BlockNumber, data: &[u8], slot: usize) -> Result<u32> {
    read_dir_record_ino(data, slot).map_err(|err| record_corruption(block, &err))
}

// ── Store ───────────────────────────────────────────────────────────────────

/// Directory operations against one mounted device.
pub struct DirStore<'a> {
    dev: &'a dyn BlockDevice,
    locks: &'a BlockLockTable,
    max_blocks: u32,
}

impl<'a> DirStore<'a> {
    #[must_use]
    pub fn new(dev: &'a dyn BlockDevice, locks: &'a BlockLockTable) -> Self {
        Self {
            dev,
            locks,
            max_blocks: MAX_DIR_BLOCKS,
        }
    }

    /// Lower the per-directory block cap.
    #[must_use]
    pub fn with_block_limit(mut self, max_blocks: u32) -> Self {
        self.max_blocks = max_blocks.min(MAX_DIR_BLOCKS);
        self
    }

    /// Physical data blocks of the directory in logical order.
    pub fn data_blocks(&self, root: &ExtentRoot) -> Result<Vec<BlockNumber>> {
        let mut blocks = Vec::new();
        walk(self.dev, root, &mut |leaf: &ExtentLeaf| {
            let start = u64::from(leaf.physical_start);
            blocks.extend((start..start + u64::from(leaf.len)).map(BlockNumber));
            Ok(())
        })?;
        Ok(blocks)
    }

    /// Visit occupied records in scan order until `visit` returns `Some`.
    fn scan<T>(
        &self,
        root: &ExtentRoot,
        mut visit: impl FnMut(SlotRef, DirRecord) -> Option<T>,
    ) -> Result<Option<T>> {
        for block in self.data_blocks(root)? {
            let buf = self.dev.read_block(block)?;
            let data = buf.as_slice();
            for slot in 0..DIR_RECORDS_PER_BLOCK {
                if slot_ino(block, data, slot)? == 0 {
                    continue;
                }
                let record =
                    parse_dir_record(data, slot).map_err(|err| record_corruption(block, &err))?;
                if let Some(found) = visit(SlotRef { block, slot }, record) {
                    return Ok(Some(found));
                }
            }
        }
        Ok(None)
    }

    // ── Insert ──────────────────────────────────────────────────────────

    /// Write `record` into `slot` of `block` if that slot is still free.
    ///
    /// Returns whether this call claimed the slot.
    pub fn try_claim_slot(&self, block: BlockNumber, slot: usize, record: &DirRecord) -> Result<bool> {
        let _guard = self.locks.lock(block);
        let mut buf = self.dev.read_block(block)?;
        if slot_ino(block, buf.as_slice(), slot)? != 0 {
            return Ok(false);
        }
        write_dir_record(buf.as_mut_slice(), slot, record)
            .map_err(|err| record_corruption(block, &err))?;
        self.dev.write_block(block, buf.as_slice())?;
        Ok(true)
    }

    /// Claim the first free slot in the blocks the directory already has.
    pub fn try_insert(&self, root: &ExtentRoot, record: &DirRecord) -> Result<Option<SlotRef>> {
        for block in self.data_blocks(root)? {
            let buf = self.dev.read_block(block)?;
            for slot in 0..DIR_RECORDS_PER_BLOCK {
                if slot_ino(block, buf.as_slice(), slot)? == 0
                    && self.try_claim_slot(block, slot, record)?
                {
                    trace!(block = block.0, slot, ino = record.ino, "dir_insert");
                    return Ok(Some(SlotRef { block, slot }));
                }
            }
        }
        Ok(None)
    }

    /// Add `name -> ino` to the directory, growing it by one zeroed block
    /// when every existing slot is taken.
    ///
    /// Does not check for an existing record with the same name.
    pub fn insert(
        &self,
        root: &mut ExtentRoot,
        name: &[u8],
        ino: InodeNumber,
        file_type: FileType,
        hint: &AllocHint,
        alloc: &mut dyn BlockAllocator,
    ) -> Result<InsertOutcome> {
        validate_name(name)?;
        if ino == InodeNumber::RESERVED {
            return Err(VfsError::InvalidArgument(
                "inode 0 cannot be linked".into(),
            ));
        }
        let record = DirRecord {
            ino: ino
                .to_disk()
                .map_err(|err| VfsError::InvalidArgument(err.to_string()))?,
            file_type,
            name: name.to_vec(),
        };

        if let Some(slot) = self.try_insert(root, &record)? {
            return Ok(InsertOutcome {
                slot,
                new_data_blocks: 0,
                new_tree_blocks: 0,
            });
        }

        let end = last_mapped(self.dev, root)?.map_or(0, |(end, _)| end);
        if end >= u64::from(self.max_blocks) {
            debug!(blocks = end, ino = ino.0, "dir_full");
            return Err(VfsError::DirectoryFull);
        }
        let logical = u32::try_from(end).map_err(|_| VfsError::DirectoryFull)?;
        let out = allocate_new_block(self.dev, root, logical, hint, alloc)?;

        if let Err(err) = self.zero_runs(&out.new_data) {
            if let Err(undo) = free_from(self.dev, root, logical, alloc) {
                error!(logical, error = %undo, "dir_grow_undo_failed");
            }
            return Err(err);
        }
        debug!(block = out.physical.0, logical, "dir_grow");

        for slot in 0..DIR_RECORDS_PER_BLOCK {
            if self.try_claim_slot(out.physical, slot, &record)? {
                trace!(block = out.physical.0, slot, ino = record.ino, "dir_insert");
                return Ok(InsertOutcome {
                    slot: SlotRef {
                        block: out.physical,
                        slot,
                    },
                    new_data_blocks: out.new_data_blocks(),
                    new_tree_blocks: out.new_tree_blocks,
                });
            }
        }
        Err(VfsError::DirectoryFull)
    }

    fn zero_runs(&self, runs: &[vfs_alloc::BlockAlloc]) -> Result<()> {
        let zero = vec![0_u8; self.dev.block_size() as usize];
        for run in runs {
            for block in run.start.0..run.start.0 + u64::from(run.count) {
                self.dev.write_block(BlockNumber(block), &zero)?;
            }
        }
        Ok(())
    }

    // ── Remove ──────────────────────────────────────────────────────────

    /// Free `slot` if its current record still satisfies `matches`.
    fn clear_if(
        &self,
        slot: SlotRef,
        matches: impl Fn(&DirRecord) -> bool,
    ) -> Result<Option<DirRecord>> {
        let _guard = self.locks.lock(slot.block);
        let mut buf = self.dev.read_block(slot.block)?;
        if slot_ino(slot.block, buf.as_slice(), slot.slot)? == 0 {
            return Ok(None);
        }
        let record = parse_dir_record(buf.as_slice(), slot.slot)
            .map_err(|err| record_corruption(slot.block, &err))?;
        if !matches(&record) {
            return Ok(None);
        }
        clear_dir_record(buf.as_mut_slice(), slot.slot)
            .map_err(|err| record_corruption(slot.block, &err))?;
        self.dev.write_block(slot.block, buf.as_slice())?;
        trace!(block = slot.block.0, slot = slot.slot, ino = record.ino, "dir_remove");
        Ok(Some(record))
    }

    fn remove_where(
        &self,
        root: &ExtentRoot,
        what: impl Fn() -> String,
        matches: impl Fn(&DirRecord) -> bool,
    ) -> Result<(SlotRef, DirRecord)> {
        loop {
            let Some(slot) = self.scan(root, |slot, record| matches(&record).then_some(slot))? else {
                return Err(VfsError::NotFound(what()));
            };
            // The slot may have changed between the scan and the lock.
            if let Some(record) = self.clear_if(slot, &matches)? {
                return Ok((slot, record));
            }
        }
    }

    /// Free the record that points at `ino`. Name bytes stay in place.
    pub fn remove(&self, root: &ExtentRoot, ino: InodeNumber) -> Result<SlotRef> {
        let target = ino
            .to_disk()
            .map_err(|_| VfsError::NotFound(format!("inode {ino}")))?;
        let (slot, _) = self.remove_where(
            root,
            || format!("inode {ino}"),
            |record| record.ino == target,
        )?;
        Ok(slot)
    }

    /// Free the record named `name` and return it.
    pub fn remove_by_name(&self, root: &ExtentRoot, name: &[u8]) -> Result<DirRecord> {
        let (_, record) = self.remove_where(
            root,
            || String::from_utf8_lossy(name).into_owned(),
            |record| record.name == name,
        )?;
        Ok(record)
    }

    // ── Lookup ──────────────────────────────────────────────────────────

    /// First occupied record named `name`, if any.
    pub fn find(&self, root: &ExtentRoot, name: &[u8]) -> Result<Option<(SlotRef, DirRecord)>> {
        self.scan(root, |slot, record| (record.name == name).then_some((slot, record)))
    }

    pub fn lookup_by_name(&self, root: &ExtentRoot, name: &[u8]) -> Result<InodeNumber> {
        match self.find(root, name)? {
            Some((_, record)) => Ok(InodeNumber(u64::from(record.ino))),
            None => Err(VfsError::NotFound(String::from_utf8_lossy(name).into_owned())),
        }
    }

    pub fn occupied_count(&self, root: &ExtentRoot) -> Result<usize> {
        let mut count = 0;
        self.scan(root, |_, _| {
            count += 1;
            None::<()>
        })?;
        Ok(count)
    }

    pub fn is_empty(&self, root: &ExtentRoot) -> Result<bool> {
        Ok(self.scan(root, |_, _| Some(()))?.is_none())
    }

    /// Occupied records in scan order, skipping the first `start_offset`.
    ///
    /// Offsets count occupied records, not slots, so a listing resumed with
    /// [`DirEntry::next_offset`] continues after the last entry returned.
    /// The block list is captured here; blocks added later are not seen.
    pub fn iterate(&self, root: &ExtentRoot, start_offset: u64) -> Result<DirIter<'a>> {
        Ok(DirIter {
            dev: self.dev,
            blocks: self.data_blocks(root)?.into_iter(),
            current: None,
            slot: 0,
            seen: 0,
            skip: start_offset,
            failed: false,
        })
    }
}

// ── Iteration ───────────────────────────────────────────────────────────────

/// Lazy directory listing; reads one block at a time.
pub struct DirIter<'a> {
    dev: &'a dyn BlockDevice,
    blocks: std::vec::IntoIter<BlockNumber>,
    current: Option<(BlockNumber, BlockBuf)>,
    slot: usize,
    seen: u64,
    skip: u64,
    failed: bool,
}

impl DirIter<'_> {
    fn advance(&mut self) -> Result<Option<DirEntry>> {
        loop {
            if self.current.is_none() || self.slot >= DIR_RECORDS_PER_BLOCK {
                let Some(block) = self.blocks.next() else {
                    return Ok(None);
                };
                self.current = Some((block, self.dev.read_block(block)?));
                self.slot = 0;
            }
            let Some((block, buf)) = &self.current else {
                return Ok(None);
            };
            let slot = self.slot;
            self.slot += 1;

            let data = buf.as_slice();
            if slot_ino(*block, data, slot)? == 0 {
                continue;
            }
            self.seen += 1;
            if self.seen <= self.skip {
                continue;
            }
            let record = parse_dir_record(data, slot).map_err(|err| record_corruption(*block, &err))?;
            return Ok(Some(DirEntry {
                ino: InodeNumber(u64::from(record.ino)),
                file_type: record.file_type,
                name: record.name,
                next_offset: self.seen,
            }));
        }
    }
}

impl Iterator for DirIter<'_> {
    type Item = Result<DirEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.advance() {
            Ok(entry) => entry.map(Ok),
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}
