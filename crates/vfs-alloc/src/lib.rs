#![forbid(unsafe_code)]
//! Block and inode allocation.
//!
//! ## Design
//!
//! The allocator is layered:
//!
//! 1. **Bitmap**: typed bit manipulation, see [`bitmap::Bitmap`].
//! 2. **FsGeometry**: where each group's bitmaps, inode table and data
//!    blocks live.
//! 3. **GroupTable**: per-group free counts held in atomics, one bitmap
//!    lock per group, and the filesystem-wide totals.
//!
//! Free counts are reserved optimistically with an atomic
//! decrement-and-check before the bitmap is touched. A reservation that
//! cannot be satisfied from the bitmap is returned before the next group is
//! tried, so every public entry point leaves the counts unchanged on error.

pub mod bitmap;

use bitmap::{Bitmap, BitmapError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::{debug, error, trace, warn};
use vfs_block::BlockDevice;
use vfs_error::{Result, VfsError};
use vfs_ondisk::{GroupDesc, Superblock};
use vfs_types::{
    BITS_PER_BITMAP_BLOCK, BlockNumber, FIRST_GROUP_BLOCK, GROUP_DESCS_PER_BLOCK, GroupNumber,
    INODE_SIZE, INODES_PER_BLOCK, InodeNumber, inode_index_in_group, inode_to_group,
};

// ── Allocation hint ─────────────────────────────────────────────────────────

/// Hint for the block allocator to guide placement decisions.
#[derive(Debug, Clone, Default)]
pub struct AllocHint {
    /// Preferred block group (e.g., same as parent inode).
    pub goal_group: Option<GroupNumber>,
    /// Preferred block number (e.g., adjacent to last allocated extent).
    pub goal_block: Option<BlockNumber>,
}

// ── Allocation result ───────────────────────────────────────────────────────

/// Result of a block allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockAlloc {
    /// First allocated block.
    pub start: BlockNumber,
    /// Number of contiguous blocks allocated.
    pub count: u32,
}

/// Result of an inode allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InodeAlloc {
    pub ino: InodeNumber,
    pub group: GroupNumber,
}

// ── Filesystem geometry ─────────────────────────────────────────────────────

/// Cached filesystem geometry needed by the allocator.
///
/// Group `g` starts at block `2 + g * blocks_per_group` and holds the data
/// bitmap, the inode bitmap, the inode table and then its data blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsGeometry {
    pub blocks_per_group: u32,
    pub inodes_per_group: u32,
    pub total_blocks: u64,
    pub group_count: u32,
}

impl FsGeometry {
    /// Lay out `total_blocks` into groups.
    ///
    /// A trailing group too small to hold its metadata plus one data block
    /// is left unused.
    pub fn new(total_blocks: u64, blocks_per_group: u32, inodes_per_group: u32) -> Result<Self> {
        if inodes_per_group == 0 || inodes_per_group % INODES_PER_BLOCK != 0 {
            return Err(VfsError::InvalidGeometry(format!(
                "inodes_per_group {inodes_per_group} must be a non-zero multiple of {INODES_PER_BLOCK}"
            )));
        }
        if inodes_per_group > BITS_PER_BITMAP_BLOCK {
            return Err(VfsError::InvalidGeometry(format!(
                "inodes_per_group {inodes_per_group} exceeds one bitmap block"
            )));
        }
        let metadata = 2 + inodes_per_group / INODES_PER_BLOCK;
        if blocks_per_group <= metadata {
            return Err(VfsError::InvalidGeometry(format!(
                "blocks_per_group {blocks_per_group} leaves no room for data"
            )));
        }
        if blocks_per_group - metadata > BITS_PER_BITMAP_BLOCK {
            return Err(VfsError::InvalidGeometry(format!(
                "blocks_per_group {blocks_per_group} exceeds one data bitmap block"
            )));
        }

        let usable = total_blocks.saturating_sub(FIRST_GROUP_BLOCK);
        let full = usable / u64::from(blocks_per_group);
        let tail = usable % u64::from(blocks_per_group);
        let groups = full + u64::from(tail > u64::from(metadata));
        if groups == 0 {
            return Err(VfsError::InvalidGeometry(format!(
                "{total_blocks} blocks cannot hold a single group"
            )));
        }
        if groups > u64::from(GROUP_DESCS_PER_BLOCK) {
            return Err(VfsError::InvalidGeometry(format!(
                "{groups} groups exceed the {GROUP_DESCS_PER_BLOCK}-entry descriptor table"
            )));
        }
        let group_count = u32::try_from(groups)
            .map_err(|_| VfsError::InvalidGeometry("group count overflow".into()))?;
        if u64::from(group_count) * u64::from(inodes_per_group) > u64::from(u32::MAX) {
            return Err(VfsError::InvalidGeometry("inode count overflows u32".into()));
        }

        Ok(Self {
            blocks_per_group,
            inodes_per_group,
            total_blocks,
            group_count,
        })
    }

    /// Derive geometry from a parsed superblock.
    pub fn from_superblock(sb: &Superblock) -> Result<Self> {
        let geo = Self::new(
            u64::from(sb.blocks_count),
            sb.effective_blocks_per_group(),
            sb.effective_inodes_per_group(),
        )?;
        if sb.groups_count != 0 && sb.groups_count != geo.group_count {
            return Err(VfsError::InvalidGeometry(format!(
                "superblock records {} groups, layout yields {}",
                sb.groups_count, geo.group_count
            )));
        }
        if u64::from(sb.inodes_count) != u64::from(geo.total_inodes()) {
            return Err(VfsError::InvalidGeometry(format!(
                "superblock records {} inodes, layout yields {}",
                sb.inodes_count,
                geo.total_inodes()
            )));
        }
        Ok(geo)
    }

    #[must_use]
    pub fn total_inodes(&self) -> u32 {
        self.group_count * self.inodes_per_group
    }

    #[must_use]
    pub fn inode_table_blocks(&self) -> u32 {
        self.inodes_per_group / INODES_PER_BLOCK
    }

    /// Bitmap and inode-table blocks at the head of every group.
    #[must_use]
    pub fn metadata_blocks(&self) -> u32 {
        2 + self.inode_table_blocks()
    }

    #[must_use]
    pub fn group_start(&self, group: GroupNumber) -> BlockNumber {
        BlockNumber(FIRST_GROUP_BLOCK + u64::from(group.0) * u64::from(self.blocks_per_group))
    }

    #[must_use]
    pub fn data_bitmap_block(&self, group: GroupNumber) -> BlockNumber {
        self.group_start(group)
    }

    #[must_use]
    pub fn inode_bitmap_block(&self, group: GroupNumber) -> BlockNumber {
        BlockNumber(self.group_start(group).0 + 1)
    }

    #[must_use]
    pub fn inode_table_block(&self, group: GroupNumber) -> BlockNumber {
        BlockNumber(self.group_start(group).0 + 2)
    }

    #[must_use]
    pub fn first_data_block(&self, group: GroupNumber) -> BlockNumber {
        BlockNumber(self.group_start(group).0 + u64::from(self.metadata_blocks()))
    }

    /// Data blocks in a group; the last group may be short.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn data_blocks_in_group(&self, group: GroupNumber) -> u32 {
        if group.0 >= self.group_count {
            return 0;
        }
        let start = self.group_start(group).0;
        let span = self
            .total_blocks
            .saturating_sub(start)
            .min(u64::from(self.blocks_per_group)) as u32;
        span.saturating_sub(self.metadata_blocks())
    }

    /// Data blocks across every group.
    #[must_use]
    pub fn total_data_blocks(&self) -> u64 {
        (0..self.group_count)
            .map(|g| u64::from(self.data_blocks_in_group(GroupNumber(g))))
            .sum()
    }

    /// Absolute block for data-bitmap bit `bit` of `group`.
    #[must_use]
    pub fn data_bit_to_block(&self, group: GroupNumber, bit: u32) -> BlockNumber {
        BlockNumber(self.first_data_block(group).0 + u64::from(bit))
    }

    /// Convert an absolute data block to (group, data-bitmap bit).
    ///
    /// Superblock, GDT, bitmap and inode-table blocks have no bit and are
    /// reported as corruption when freed.
    #[expect(clippy::cast_possible_truncation)]
    pub fn block_to_data_bit(&self, block: BlockNumber) -> Result<(GroupNumber, u32)> {
        let rel = block.0.checked_sub(FIRST_GROUP_BLOCK).ok_or_else(|| {
            VfsError::corruption(block.0, "block precedes the first group")
        })?;
        let group = GroupNumber((rel / u64::from(self.blocks_per_group)) as u32);
        let offset = (rel % u64::from(self.blocks_per_group)) as u32;
        if group.0 >= self.group_count {
            return Err(VfsError::corruption(block.0, "block beyond the last group"));
        }
        let Some(bit) = offset.checked_sub(self.metadata_blocks()) else {
            return Err(VfsError::corruption(block.0, "block is group metadata"));
        };
        if bit >= self.data_blocks_in_group(group) {
            return Err(VfsError::corruption(block.0, "block beyond the group data area"));
        }
        Ok((group, bit))
    }

    /// Inode-table block and byte offset holding `ino`.
    pub fn inode_location(&self, ino: InodeNumber) -> Result<(BlockNumber, usize)> {
        if ino.0 == 0 || ino.0 >= u64::from(self.total_inodes()) {
            return Err(VfsError::NotFound(format!("inode {ino} out of range")));
        }
        let group = inode_to_group(ino, self.inodes_per_group);
        let index = inode_index_in_group(ino, self.inodes_per_group);
        let block = self.inode_table_block(group).0 + u64::from(index / INODES_PER_BLOCK);
        let offset = (index % INODES_PER_BLOCK) as usize * INODE_SIZE;
        Ok((BlockNumber(block), offset))
    }

    /// Group owning a data block, for locality hints. Metadata blocks map to
    /// their own group.
    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn group_of_block(&self, block: BlockNumber) -> GroupNumber {
        let rel = block.0.saturating_sub(FIRST_GROUP_BLOCK);
        let group = (rel / u64::from(self.blocks_per_group)) as u32;
        GroupNumber(group.min(self.group_count.saturating_sub(1)))
    }
}

// ── Group table ─────────────────────────────────────────────────────────────

#[derive(Debug)]
struct GroupSlot {
    free_blocks: AtomicU32,
    free_inodes: AtomicU32,
    flags: u16,
    /// Serializes read-modify-write of this group's data bitmap.
    data_lock: Mutex<()>,
    /// Serializes read-modify-write of this group's inode bitmap.
    inode_lock: Mutex<()>,
}

/// Which bitmap of a group an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BitmapKind {
    Data,
    Inode,
}

impl BitmapKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Data => "data",
            Self::Inode => "inode",
        }
    }
}

/// In-memory group descriptor table plus filesystem-wide free totals.
///
/// Owned by the mounted filesystem; every allocator operation goes through
/// it, so independent mounts never share state.
#[derive(Debug)]
pub struct GroupTable {
    geo: FsGeometry,
    groups: Vec<GroupSlot>,
    free_blocks_total: AtomicU64,
    free_inodes_total: AtomicU64,
}

impl GroupTable {
    /// Build from descriptors read off disk.
    pub fn from_descs(geo: FsGeometry, descs: &[GroupDesc]) -> Result<Self> {
        if descs.len() != geo.group_count as usize {
            return Err(VfsError::Format(format!(
                "descriptor table has {} entries, geometry has {} groups",
                descs.len(),
                geo.group_count
            )));
        }
        let mut groups = Vec::with_capacity(descs.len());
        let mut free_blocks_total = 0_u64;
        let mut free_inodes_total = 0_u64;
        for (g, desc) in (0_u32..).zip(descs) {
            let group = GroupNumber(g);
            if desc.free_blocks_count > geo.data_blocks_in_group(group) {
                return Err(VfsError::Format(format!(
                    "group {group} claims {} free blocks of {}",
                    desc.free_blocks_count,
                    geo.data_blocks_in_group(group)
                )));
            }
            if desc.free_inodes_count > geo.inodes_per_group {
                return Err(VfsError::Format(format!(
                    "group {group} claims {} free inodes of {}",
                    desc.free_inodes_count, geo.inodes_per_group
                )));
            }
            free_blocks_total += u64::from(desc.free_blocks_count);
            free_inodes_total += u64::from(desc.free_inodes_count);
            groups.push(GroupSlot {
                free_blocks: AtomicU32::new(desc.free_blocks_count),
                free_inodes: AtomicU32::new(desc.free_inodes_count),
                flags: desc.flags,
                data_lock: Mutex::new(()),
                inode_lock: Mutex::new(()),
            });
        }
        Ok(Self {
            geo,
            groups,
            free_blocks_total: AtomicU64::new(free_blocks_total),
            free_inodes_total: AtomicU64::new(free_inodes_total),
        })
    }

    #[must_use]
    pub fn geometry(&self) -> &FsGeometry {
        &self.geo
    }

    #[must_use]
    pub fn free_blocks_total(&self) -> u64 {
        self.free_blocks_total.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn free_inodes_total(&self) -> u64 {
        self.free_inodes_total.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn free_blocks_in(&self, group: GroupNumber) -> u32 {
        self.groups
            .get(group.0 as usize)
            .map_or(0, |s| s.free_blocks.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn free_inodes_in(&self, group: GroupNumber) -> u32 {
        self.groups
            .get(group.0 as usize)
            .map_or(0, |s| s.free_inodes.load(Ordering::Acquire))
    }

    /// Current descriptors, for the GDT flush.
    #[must_use]
    pub fn snapshot(&self) -> Vec<GroupDesc> {
        self.groups
            .iter()
            .map(|s| GroupDesc {
                free_blocks_count: s.free_blocks.load(Ordering::Acquire),
                free_inodes_count: s.free_inodes.load(Ordering::Acquire),
                flags: s.flags,
            })
            .collect()
    }

    fn slot(&self, group: GroupNumber) -> Result<&GroupSlot> {
        self.groups.get(group.0 as usize).ok_or_else(|| {
            VfsError::corruption(
                self.geo.group_start(group).0,
                format!("group {group} out of range"),
            )
        })
    }

    fn counter(slot: &GroupSlot, kind: BitmapKind) -> &AtomicU32 {
        match kind {
            BitmapKind::Data => &slot.free_blocks,
            BitmapKind::Inode => &slot.free_inodes,
        }
    }

    fn total(&self, kind: BitmapKind) -> &AtomicU64 {
        match kind {
            BitmapKind::Data => &self.free_blocks_total,
            BitmapKind::Inode => &self.free_inodes_total,
        }
    }

    fn bitmap_block(&self, group: GroupNumber, kind: BitmapKind) -> BlockNumber {
        match kind {
            BitmapKind::Data => self.geo.data_bitmap_block(group),
            BitmapKind::Inode => self.geo.inode_bitmap_block(group),
        }
    }

    fn bitmap_len(&self, group: GroupNumber, kind: BitmapKind) -> u32 {
        match kind {
            BitmapKind::Data => self.geo.data_blocks_in_group(group),
            BitmapKind::Inode => self.geo.inodes_per_group,
        }
    }

    /// Nearest group to `near` advertising at least `need` free units.
    /// Equal distances resolve to the lower group index.
    fn pick_group(
        &self,
        near: GroupNumber,
        need: u32,
        kind: BitmapKind,
        excluded: &[bool],
    ) -> Option<GroupNumber> {
        (0_u32..)
            .zip(&self.groups)
            .filter(|(g, slot)| {
                !excluded[*g as usize] && Self::counter(slot, kind).load(Ordering::Acquire) >= need
            })
            .min_by_key(|(g, _)| (g.abs_diff(near.0), *g))
            .map(|(g, _)| GroupNumber(g))
    }

    /// Atomically take `need` from `counter`, failing if it would underflow.
    fn reserve(counter: &AtomicU32, need: u32) -> bool {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(need))
            .is_ok()
    }

    /// Claim a run of `count` bits in an already reserved group.
    ///
    /// Returns `Ok(None)` when the bitmap has enough free bits but no run of
    /// the requested length. Returns corruption when the bitmap has fewer
    /// free bits than the descriptor promised.
    fn claim_run(
        &self,
        dev: &dyn BlockDevice,
        group: GroupNumber,
        kind: BitmapKind,
        count: u32,
        goal: Option<u32>,
    ) -> Result<Option<u32>> {
        let slot = self.slot(group)?;
        let block = self.bitmap_block(group, kind);
        let _guard = match kind {
            BitmapKind::Data => slot.data_lock.lock(),
            BitmapKind::Inode => slot.inode_lock.lock(),
        };

        let mut buf = dev.read_block(block)?;
        let mut bitmap = Bitmap::from_bytes(buf.as_slice(), self.bitmap_len(group, kind));
        let found = match goal {
            Some(goal) => bitmap.find_free_run_from(goal, count),
            None => bitmap.find_free_run(count),
        };
        let Some(start) = found else {
            // Our reservation is still held, so the bitmap must show at least
            // the advertised count plus what we took.
            let advertised = Self::counter(slot, kind).load(Ordering::Acquire) + count;
            let actual = bitmap.count_free();
            if actual < advertised {
                warn!(group = group.0, kind = kind.as_str(), advertised, actual, "gdt_undercount");
                return Err(VfsError::corruption(
                    block.0,
                    format!(
                        "{} bitmap of group {group} has {actual} free bits, descriptor claims {advertised}",
                        kind.as_str()
                    ),
                ));
            }
            return Ok(None);
        };

        bitmap
            .set_range(start, count)
            .map_err(|e| bitmap_corruption(block, &e))?;
        bitmap.write_into(buf.as_mut_slice());
        dev.write_block(block, buf.as_slice())?;
        Ok(Some(start))
    }

    fn alloc_bits(
        &self,
        dev: &dyn BlockDevice,
        near: GroupNumber,
        count: u32,
        kind: BitmapKind,
        goal_bit: Option<(GroupNumber, u32)>,
    ) -> Result<(GroupNumber, u32)> {
        let mut excluded = vec![false; self.groups.len()];
        loop {
            let Some(group) = self.pick_group(near, count, kind, &excluded) else {
                debug!(near = near.0, count, kind = kind.as_str(), "alloc_no_space");
                return Err(VfsError::NoSpace);
            };
            let slot = self.slot(group)?;
            let counter = Self::counter(slot, kind);
            if !Self::reserve(counter, count) {
                // Lost a race since the scan; rescan with fresh counts.
                continue;
            }

            let goal = goal_bit.and_then(|(g, bit)| (g == group).then_some(bit));
            match self.claim_run(dev, group, kind, count, goal) {
                Ok(Some(start)) => {
                    self.total(kind).fetch_sub(u64::from(count), Ordering::AcqRel);
                    return Ok((group, start));
                }
                Ok(None) => {
                    counter.fetch_add(count, Ordering::AcqRel);
                    debug!(group = group.0, count, kind = kind.as_str(), "alloc_group_fragmented");
                    excluded[group.0 as usize] = true;
                }
                Err(err) => {
                    counter.fetch_add(count, Ordering::AcqRel);
                    return Err(err);
                }
            }
        }
    }

    fn free_bits(
        &self,
        dev: &dyn BlockDevice,
        group: GroupNumber,
        kind: BitmapKind,
        start: u32,
        count: u32,
    ) -> Result<()> {
        let slot = self.slot(group)?;
        let block = self.bitmap_block(group, kind);
        {
            let _guard = match kind {
                BitmapKind::Data => slot.data_lock.lock(),
                BitmapKind::Inode => slot.inode_lock.lock(),
            };
            let mut buf = dev.read_block(block)?;
            let mut bitmap = Bitmap::from_bytes(buf.as_slice(), self.bitmap_len(group, kind));
            bitmap.clear_range(start, count).map_err(|e| {
                error!(
                    group = group.0,
                    kind = kind.as_str(),
                    start,
                    count,
                    "bitmap_double_free"
                );
                bitmap_corruption(block, &e)
            })?;
            bitmap.write_into(buf.as_mut_slice());
            dev.write_block(block, buf.as_slice())?;
        }
        Self::counter(slot, kind).fetch_add(count, Ordering::AcqRel);
        self.total(kind).fetch_add(u64::from(count), Ordering::AcqRel);
        Ok(())
    }

    // ── Blocks ──────────────────────────────────────────────────────────

    /// Allocate `count` contiguous data blocks.
    ///
    /// Strategy: nearest group (by index distance from the hint's group)
    /// whose free count covers the request; within that group, start the
    /// bitmap search at the goal block when it lies there.
    pub fn alloc_blocks(
        &self,
        dev: &dyn BlockDevice,
        count: u32,
        hint: &AllocHint,
    ) -> Result<BlockAlloc> {
        if count == 0 {
            return Err(VfsError::InvalidArgument("cannot allocate 0 blocks".into()));
        }
        let near = hint
            .goal_group
            .or_else(|| hint.goal_block.map(|b| self.geo.group_of_block(b)))
            .unwrap_or(GroupNumber(0));
        let goal_bit = hint
            .goal_block
            .and_then(|b| self.geo.block_to_data_bit(b).ok());

        let (group, bit) = self.alloc_bits(dev, near, count, BitmapKind::Data, goal_bit)?;
        let start = self.geo.data_bit_to_block(group, bit);
        trace!(group = group.0, start = start.0, count, "alloc_blocks");
        Ok(BlockAlloc { start, count })
    }

    /// Free `count` contiguous data blocks starting at `start`.
    ///
    /// The whole range must lie inside one group's data area and be
    /// currently allocated; otherwise nothing is changed and corruption is
    /// reported.
    pub fn free_blocks(&self, dev: &dyn BlockDevice, start: BlockNumber, count: u32) -> Result<()> {
        if count == 0 {
            return Ok(());
        }
        let (group, bit) = self.geo.block_to_data_bit(start)?;
        if u64::from(bit) + u64::from(count) > u64::from(self.geo.data_blocks_in_group(group)) {
            return Err(VfsError::corruption(
                start.0,
                format!("free of {count} blocks crosses the end of group {group}"),
            ));
        }
        self.free_bits(dev, group, BitmapKind::Data, bit, count)?;
        trace!(group = group.0, start = start.0, count, "free_blocks");
        Ok(())
    }

    // ── Inodes ──────────────────────────────────────────────────────────

    /// Allocate one inode, preferring `near` and then the closest group.
    pub fn alloc_inode(&self, dev: &dyn BlockDevice, near: GroupNumber) -> Result<InodeAlloc> {
        let (group, bit) = self.alloc_bits(dev, near, 1, BitmapKind::Inode, None)?;
        let ino = InodeNumber(
            u64::from(group.0) * u64::from(self.geo.inodes_per_group) + u64::from(bit),
        );
        if ino == InodeNumber::RESERVED {
            // Bit 0 of group 0 is set at format time; reaching here means the
            // bitmap was damaged. Undo the claim before reporting.
            self.free_bits(dev, group, BitmapKind::Inode, bit, 1)?;
            return Err(VfsError::corruption(
                self.geo.inode_bitmap_block(group).0,
                "reserved inode 0 was free in the bitmap",
            ));
        }
        trace!(ino = ino.0, group = group.0, "alloc_inode");
        Ok(InodeAlloc { ino, group })
    }

    pub fn free_inode(&self, dev: &dyn BlockDevice, ino: InodeNumber) -> Result<()> {
        if ino == InodeNumber::RESERVED || ino.0 >= u64::from(self.geo.total_inodes()) {
            return Err(VfsError::NotFound(format!("inode {ino} out of range")));
        }
        let group = inode_to_group(ino, self.geo.inodes_per_group);
        let bit = inode_index_in_group(ino, self.geo.inodes_per_group);
        self.free_bits(dev, group, BitmapKind::Inode, bit, 1)?;
        trace!(ino = ino.0, group = group.0, "free_inode");
        Ok(())
    }

    // ── Consistency ─────────────────────────────────────────────────────

    /// Compare every descriptor with a popcount of its bitmaps.
    ///
    /// Read-only; callers decide whether a mismatch is fatal.
    pub fn reconcile(&self, dev: &dyn BlockDevice) -> Result<Vec<GroupMismatch>> {
        let mut mismatches = Vec::new();
        for g in 0..self.geo.group_count {
            let group = GroupNumber(g);
            let slot = self.slot(group)?;
            for kind in [BitmapKind::Data, BitmapKind::Inode] {
                let buf = dev.read_block(self.bitmap_block(group, kind))?;
                let actual = Bitmap::from_bytes(buf.as_slice(), self.bitmap_len(group, kind))
                    .count_free();
                let recorded = Self::counter(slot, kind).load(Ordering::Acquire);
                if actual != recorded {
                    mismatches.push(GroupMismatch {
                        group,
                        bitmap: kind.as_str(),
                        recorded,
                        actual,
                    });
                }
            }
        }
        Ok(mismatches)
    }
}

/// A descriptor count that disagrees with its bitmap.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct GroupMismatch {
    pub group: GroupNumber,
    pub bitmap: &'static str,
    pub recorded: u32,
    pub actual: u32,
}

fn bitmap_corruption(block: BlockNumber, err: &BitmapError) -> VfsError {
    VfsError::corruption(block.0, err.to_string())
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use proptest::prelude::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use vfs_block::BlockBuf;
    use vfs_types::BLOCK_SIZE;

    struct MemBlockDevice {
        blocks: PlMutex<HashMap<u64, Vec<u8>>>,
        count: u64,
    }

    impl MemBlockDevice {
        fn new(count: u64) -> Self {
            Self {
                blocks: PlMutex::new(HashMap::new()),
                count,
            }
        }
    }

    impl BlockDevice for MemBlockDevice {
        fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
            let blocks = self.blocks.lock();
            Ok(BlockBuf::new(blocks.get(&block.0).cloned().unwrap_or_else(|| {
                vec![0_u8; BLOCK_SIZE as usize]
            })))
        }

        fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
            self.blocks.lock().insert(block.0, data.to_vec());
            Ok(())
        }

        fn block_size(&self) -> u32 {
            BLOCK_SIZE
        }

        fn block_count(&self) -> u64 {
            self.count
        }

        fn sync(&self) -> Result<()> {
            Ok(())
        }
    }

    /// Three groups of 64 blocks, 32 inodes each: 3 metadata + 61 data.
    fn make_geometry() -> FsGeometry {
        FsGeometry::new(2 + 3 * 64, 64, 32).expect("geometry")
    }

    fn make_groups(geo: &FsGeometry) -> GroupTable {
        let descs: Vec<GroupDesc> = (0..geo.group_count)
            .map(|g| GroupDesc {
                free_blocks_count: geo.data_blocks_in_group(GroupNumber(g)),
                free_inodes_count: geo.inodes_per_group,
                flags: 0,
            })
            .collect();
        GroupTable::from_descs(geo.clone(), &descs).expect("groups")
    }

    fn hint_group(g: u32) -> AllocHint {
        AllocHint {
            goal_group: Some(GroupNumber(g)),
            goal_block: None,
        }
    }

    // ── Geometry ────────────────────────────────────────────────────────

    #[test]
    fn geometry_layout() {
        let geo = make_geometry();
        assert_eq!(geo.group_count, 3);
        assert_eq!(geo.metadata_blocks(), 3);
        assert_eq!(geo.data_bitmap_block(GroupNumber(1)), BlockNumber(66));
        assert_eq!(geo.inode_table_block(GroupNumber(1)), BlockNumber(68));
        assert_eq!(geo.first_data_block(GroupNumber(1)), BlockNumber(69));
        assert_eq!(geo.data_blocks_in_group(GroupNumber(2)), 61);
        assert_eq!(geo.total_inodes(), 96);
    }

    #[test]
    fn hundred_block_device_has_one_short_group() {
        let geo = FsGeometry::new(100, 32_768, 32).unwrap();
        assert_eq!(geo.group_count, 1);
        assert_eq!(geo.data_blocks_in_group(GroupNumber(0)), 95);
        assert_eq!(geo.first_data_block(GroupNumber(0)), BlockNumber(5));
    }

    #[test]
    fn tiny_tail_group_is_dropped() {
        // 2 full groups plus a 3-block tail that cannot hold metadata + data.
        let geo = FsGeometry::new(2 + 2 * 64 + 3, 64, 32).unwrap();
        assert_eq!(geo.group_count, 2);
        let geo = FsGeometry::new(2 + 2 * 64 + 4, 64, 32).unwrap();
        assert_eq!(geo.group_count, 3);
        assert_eq!(geo.data_blocks_in_group(GroupNumber(2)), 1);
    }

    #[test]
    fn bad_geometry_is_rejected() {
        assert!(FsGeometry::new(1000, 64, 33).is_err());
        assert!(FsGeometry::new(1000, 3, 32).is_err());
        assert!(FsGeometry::new(4, 64, 32).is_err());
        assert!(FsGeometry::new(2 + 300 * 64, 64, 32).is_err());
    }

    #[test]
    fn data_bit_mapping_roundtrip_and_metadata_rejection() {
        let geo = make_geometry();
        let block = geo.data_bit_to_block(GroupNumber(2), 10);
        assert_eq!(geo.block_to_data_bit(block).unwrap(), (GroupNumber(2), 10));
        assert!(geo.block_to_data_bit(BlockNumber(0)).unwrap_err().is_corruption());
        assert!(geo.block_to_data_bit(BlockNumber(67)).unwrap_err().is_corruption());
        assert!(geo.block_to_data_bit(BlockNumber(500)).unwrap_err().is_corruption());
    }

    #[test]
    fn inode_location_math() {
        let geo = make_geometry();
        assert_eq!(geo.inode_location(InodeNumber(1)).unwrap(), (BlockNumber(4), 128));
        assert_eq!(geo.inode_location(InodeNumber(33)).unwrap(), (BlockNumber(68), 128));
        assert!(geo.inode_location(InodeNumber(0)).is_err());
        assert!(geo.inode_location(InodeNumber(96)).is_err());
    }

    // ── Blocks ──────────────────────────────────────────────────────────

    #[test]
    fn alloc_and_free_roundtrip() {
        let dev = MemBlockDevice::new(200);
        let geo = make_geometry();
        let groups = make_groups(&geo);
        let before = groups.free_blocks_total();

        let alloc = groups.alloc_blocks(&dev, 5, &hint_group(0)).unwrap();
        assert_eq!(alloc.start, BlockNumber(5));
        assert_eq!(groups.free_blocks_total(), before - 5);
        assert_eq!(groups.free_blocks_in(GroupNumber(0)), 56);

        groups.free_blocks(&dev, alloc.start, alloc.count).unwrap();
        assert_eq!(groups.free_blocks_total(), before);
        assert!(groups.reconcile(&dev).unwrap().is_empty());
    }

    #[test]
    fn nearest_group_wins_and_ties_go_low() {
        let dev = MemBlockDevice::new(200);
        let geo = make_geometry();
        let groups = make_groups(&geo);

        let a = groups.alloc_blocks(&dev, 61, &hint_group(1)).unwrap();
        assert_eq!(geo.group_of_block(a.start), GroupNumber(1));
        // Group 1 is full; groups 0 and 2 are equally distant.
        let b = groups.alloc_blocks(&dev, 1, &hint_group(1)).unwrap();
        assert_eq!(geo.group_of_block(b.start), GroupNumber(0));
    }

    #[test]
    fn goal_block_extends_previous_run() {
        let dev = MemBlockDevice::new(200);
        let geo = make_geometry();
        let groups = make_groups(&geo);
        let first = groups.alloc_blocks(&dev, 2, &hint_group(2)).unwrap();
        groups.alloc_blocks(&dev, 3, &hint_group(2)).unwrap();
        groups.free_blocks(&dev, BlockNumber(first.start.0 + 2), 3).unwrap();

        let hint = AllocHint {
            goal_group: None,
            goal_block: Some(BlockNumber(first.start.0 + 2)),
        };
        let next = groups.alloc_blocks(&dev, 1, &hint).unwrap();
        assert_eq!(next.start.0, first.start.0 + 2);
    }

    #[test]
    fn no_space_leaves_counts_unchanged() {
        let dev = MemBlockDevice::new(200);
        let geo = make_geometry();
        let groups = make_groups(&geo);
        let before = groups.snapshot();
        assert!(matches!(
            groups.alloc_blocks(&dev, 62, &hint_group(0)),
            Err(VfsError::NoSpace)
        ));
        assert_eq!(groups.snapshot(), before);
    }

    #[test]
    fn fragmented_group_falls_through_to_next() {
        let dev = MemBlockDevice::new(200);
        let geo = make_geometry();
        let groups = make_groups(&geo);
        // Checkerboard group 0 so no run of 2 exists though 30 bits are free.
        let all = groups.alloc_blocks(&dev, 61, &hint_group(0)).unwrap();
        for i in (0..60).step_by(2) {
            groups.free_blocks(&dev, BlockNumber(all.start.0 + i), 1).unwrap();
        }
        let snapshot_g0 = groups.free_blocks_in(GroupNumber(0));
        let alloc = groups.alloc_blocks(&dev, 2, &hint_group(0)).unwrap();
        assert_eq!(geo.group_of_block(alloc.start), GroupNumber(1));
        assert_eq!(groups.free_blocks_in(GroupNumber(0)), snapshot_g0);
    }

    #[test]
    fn undercounted_bitmap_is_corruption() {
        let dev = MemBlockDevice::new(200);
        let geo = make_geometry();
        let groups = make_groups(&geo);
        // Mark every data bit of group 0 used behind the table's back.
        dev.write_block(geo.data_bitmap_block(GroupNumber(0)), &[0xFF; 4096])
            .unwrap();
        let before = groups.snapshot();
        let err = groups.alloc_blocks(&dev, 1, &hint_group(0)).unwrap_err();
        assert!(err.is_corruption());
        assert_eq!(groups.snapshot(), before);
    }

    #[test]
    fn double_free_is_detected() {
        let dev = MemBlockDevice::new(200);
        let geo = make_geometry();
        let groups = make_groups(&geo);
        let alloc = groups.alloc_blocks(&dev, 2, &hint_group(0)).unwrap();
        groups.free_blocks(&dev, alloc.start, 2).unwrap();
        let before = groups.free_blocks_total();
        assert!(groups.free_blocks(&dev, alloc.start, 1).unwrap_err().is_corruption());
        assert_eq!(groups.free_blocks_total(), before);
    }

    #[test]
    fn freeing_metadata_is_corruption() {
        let dev = MemBlockDevice::new(200);
        let geo = make_geometry();
        let groups = make_groups(&geo);
        assert!(groups.free_blocks(&dev, BlockNumber(1), 1).unwrap_err().is_corruption());
        assert!(groups.free_blocks(&dev, geo.inode_table_block(GroupNumber(0)), 1)
            .unwrap_err()
            .is_corruption());
    }

    // ── Inodes ──────────────────────────────────────────────────────────

    #[test]
    fn inode_zero_is_never_returned() {
        let dev = MemBlockDevice::new(200);
        let geo = make_geometry();
        let groups = make_groups(&geo);
        let mut bitmap = vec![0_u8; 4096];
        bitmap[0] = 0b11;
        dev.write_block(geo.inode_bitmap_block(GroupNumber(0)), &bitmap)
            .unwrap();
        let descs: Vec<GroupDesc> = groups
            .snapshot()
            .into_iter()
            .enumerate()
            .map(|(g, mut d)| {
                if g == 0 {
                    d.free_inodes_count -= 2;
                }
                d
            })
            .collect();
        let groups = GroupTable::from_descs(geo, &descs).unwrap();

        let a = groups.alloc_inode(&dev, GroupNumber(0)).unwrap();
        assert_eq!(a.ino, InodeNumber(2));
        groups.free_inode(&dev, a.ino).unwrap();
        assert!(groups.free_inode(&dev, InodeNumber(0)).is_err());
    }

    #[test]
    fn inode_alloc_spills_to_nearest_group() {
        let dev = MemBlockDevice::new(200);
        let geo = make_geometry();
        let groups = make_groups(&geo);
        for _ in 0..32 {
            groups.alloc_inode(&dev, GroupNumber(2)).unwrap();
        }
        let spill = groups.alloc_inode(&dev, GroupNumber(2)).unwrap();
        assert_eq!(spill.group, GroupNumber(1));
        assert_eq!(spill.ino, InodeNumber(32));
    }

    #[test]
    fn concurrent_allocations_are_disjoint() {
        let dev = Arc::new(MemBlockDevice::new(200));
        let geo = make_geometry();
        let groups = Arc::new(make_groups(&geo));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let dev = Arc::clone(&dev);
                let groups = Arc::clone(&groups);
                std::thread::spawn(move || {
                    let mut got = Vec::new();
                    for _ in 0..10 {
                        let a = groups
                            .alloc_blocks(dev.as_ref(), 4, &hint_group(t % 3))
                            .expect("alloc");
                        got.push(a);
                    }
                    got
                })
            })
            .collect();
        let mut blocks: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().expect("join"))
            .flat_map(|a| a.start.0..a.start.0 + u64::from(a.count))
            .collect();
        let n = blocks.len();
        blocks.sort_unstable();
        blocks.dedup();
        assert_eq!(blocks.len(), n);
        assert_eq!(groups.free_blocks_total(), 183 - 160);
        assert!(groups.reconcile(dev.as_ref()).unwrap().is_empty());
    }

    proptest! {
        #[test]
        fn free_count_conservation(ops in proptest::collection::vec((1_u32..8, 0_u32..3, proptest::bool::ANY), 1..40)) {
            let dev = MemBlockDevice::new(200);
            let geo = make_geometry();
            let groups = make_groups(&geo);
            let total = groups.free_blocks_total();
            let mut live: Vec<BlockAlloc> = Vec::new();
            for (count, g, free_one) in ops {
                if free_one {
                    if let Some(a) = live.pop() {
                        groups.free_blocks(&dev, a.start, a.count).unwrap();
                    }
                } else if let Ok(a) = groups.alloc_blocks(&dev, count, &hint_group(g)) {
                    live.push(a);
                }
                let held: u64 = live.iter().map(|a| u64::from(a.count)).sum();
                prop_assert_eq!(groups.free_blocks_total(), total - held);
                prop_assert!(groups.free_blocks_total() <= geo.total_data_blocks());
            }
            prop_assert!(groups.reconcile(&dev).unwrap().is_empty());
        }
    }
}
