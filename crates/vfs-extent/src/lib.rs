#![forbid(unsafe_code)]
//! Extent tree engine.
//!
//! Maps a file's logical blocks to physical blocks through a tree whose
//! root lives in the inode's 100-byte extent area and whose deeper nodes
//! occupy full blocks.
//!
//! Depth 0: the root holds up to 9 leaf extents directly.
//! Depth 1: the root indexes up to 9 leaf blocks of 408 extents each.
//! Each further level multiplies capacity by 408, up to depth 5.
//!
//! Files grow only at the end, so a tree always maps a dense prefix
//! `[0, logical_end)` of the file. Mutations stage node rewrites in memory
//! and touch the device only once every allocation has succeeded; on error
//! every claimed block is returned and the root is left as it was.

mod store;

use store::{NodeStore, child_block};
use tracing::{debug, error, trace, warn};
use vfs_alloc::{AllocHint, BlockAlloc, GroupTable};
use vfs_block::BlockDevice;
use vfs_error::{Result, VfsError};
use vfs_ondisk::{ExtentHeader, ExtentIndex, ExtentLeaf, ExtentNode, parse_extent_node, write_extent_node};
use vfs_types::{
    BlockNumber, EXTENT_NODE_MAX_ENTRIES, EXTENT_ROOT_BYTES, EXTENT_ROOT_MAX_ENTRIES,
    MAX_EXTENT_LEN, MAX_TREE_DEPTH,
};

/// The extent area embedded in an inode record.
pub type ExtentRoot = [u8; EXTENT_ROOT_BYTES];

// ── Allocator seam ──────────────────────────────────────────────────────────

/// Source of physical blocks for data runs and tree nodes.
pub trait BlockAllocator {
    /// Claim `count` contiguous blocks, or fail with `NoSpace`.
    fn alloc_blocks(&mut self, count: u32, hint: &AllocHint) -> Result<BlockAlloc>;

    /// Return a run previously handed out by `alloc_blocks`.
    fn free_blocks(&mut self, start: BlockNumber, count: u32) -> Result<()>;
}

/// [`BlockAllocator`] backed by a mounted filesystem's group table.
pub struct GroupAllocator<'a> {
    dev: &'a dyn BlockDevice,
    groups: &'a GroupTable,
}

impl<'a> GroupAllocator<'a> {
    #[must_use]
    pub fn new(dev: &'a dyn BlockDevice, groups: &'a GroupTable) -> Self {
        Self { dev, groups }
    }
}

impl BlockAllocator for GroupAllocator<'_> {
    fn alloc_blocks(&mut self, count: u32, hint: &AllocHint) -> Result<BlockAlloc> {
        self.groups.alloc_blocks(self.dev, count, hint)
    }

    fn free_blocks(&mut self, start: BlockNumber, count: u32) -> Result<()> {
        self.groups.free_blocks(self.dev, start, count)
    }
}

// ── Root codec ──────────────────────────────────────────────────────────────

/// Block number reported in corruption errors raised for the inode root.
const ROOT_BLOCK: u64 = 0;

fn parse_root(root: &ExtentRoot) -> Result<(ExtentHeader, ExtentNode)> {
    let (header, node) = parse_extent_node(root).map_err(|err| {
        error!(
            invariant = "root.header",
            detail = %err,
            "extent_invariant_violation"
        );
        VfsError::corruption(ROOT_BLOCK, format!("bad inode extent root: {err}"))
    })?;
    if header.max_entries != EXTENT_ROOT_MAX_ENTRIES {
        error!(
            invariant = "root.max_entries",
            got = header.max_entries,
            "extent_invariant_violation"
        );
        return Err(VfsError::corruption(
            ROOT_BLOCK,
            format!("inode extent root capacity {}", header.max_entries),
        ));
    }
    Ok((header, node))
}

fn encode_root(root: &mut ExtentRoot, depth: u16, node: &ExtentNode) -> Result<()> {
    write_extent_node(root, EXTENT_ROOT_MAX_ENTRIES, depth, node)
        .map_err(|err| VfsError::corruption(ROOT_BLOCK, format!("encode extent root: {err}")))
}

fn disk_block(block: BlockNumber) -> Result<u32> {
    block
        .to_disk()
        .map_err(|_| VfsError::corruption(block.0, "block number exceeds extent field width"))
}

// ── Init ────────────────────────────────────────────────────────────────────

/// Write an empty depth-0 root.
pub fn init_empty(root: &mut ExtentRoot) -> Result<()> {
    encode_root(root, 0, &ExtentNode::Leaf(Vec::new()))
}

/// Write a depth-0 root with the single extent `{0, len, first}`.
pub fn init(root: &mut ExtentRoot, first: BlockNumber, len: u32) -> Result<()> {
    let len = u16::try_from(len)
        .ok()
        .filter(|&len| len > 0)
        .ok_or_else(|| VfsError::InvalidArgument(format!("initial extent length {len}")))?;
    let leaf = ExtentLeaf {
        logical_block: 0,
        len,
        physical_start: disk_block(first)?,
    };
    encode_root(root, 0, &ExtentNode::Leaf(vec![leaf]))
}

// ── Search ──────────────────────────────────────────────────────────────────

/// Map `logical` to its physical block, or `None` if it is not mapped.
pub fn search(dev: &dyn BlockDevice, root: &ExtentRoot, logical: u32) -> Result<Option<BlockNumber>> {
    let (header, mut node) = parse_root(root)?;
    let store = NodeStore::new(dev);
    let mut depth = header.depth;

    loop {
        match node {
            ExtentNode::Leaf(leaves) => {
                let found = search_leaf(&leaves, logical);
                if let Some(physical) = found {
                    trace!(logical, physical = physical.0, "extent_search_hit");
                } else {
                    trace!(logical, "extent_search_hole");
                }
                return Ok(found);
            }
            ExtentNode::Index(indexes) => {
                let Some(index) = find_index_child(&indexes, logical) else {
                    return Ok(None);
                };
                depth -= 1;
                (_, node) = store.read(child_block(index)?, depth)?;
            }
        }
    }
}

fn search_leaf(leaves: &[ExtentLeaf], target: u32) -> Option<BlockNumber> {
    let pos = leaves.partition_point(|leaf| leaf.logical_block <= target);
    let leaf = leaves.get(pos.checked_sub(1)?)?;
    leaf.contains(target).then(|| {
        BlockNumber(u64::from(leaf.physical_start) + u64::from(target - leaf.logical_block))
    })
}

/// The last index whose range starts at or before `target`.
fn find_index_child(indexes: &[ExtentIndex], target: u32) -> Option<&ExtentIndex> {
    let pos = indexes.partition_point(|idx| idx.logical_block <= target);
    indexes.get(pos.checked_sub(1)?)
}

// ── Walk ────────────────────────────────────────────────────────────────────

/// Visit every leaf extent in logical order. Returns the number visited.
pub fn walk<F>(dev: &dyn BlockDevice, root: &ExtentRoot, visitor: &mut F) -> Result<usize>
where
    F: FnMut(&ExtentLeaf) -> Result<()>,
{
    let (header, node) = parse_root(root)?;
    let store = NodeStore::new(dev);
    walk_node(&store, header.depth, &node, visitor)
}

fn walk_node<F>(store: &NodeStore<'_>, depth: u16, node: &ExtentNode, visitor: &mut F) -> Result<usize>
where
    F: FnMut(&ExtentLeaf) -> Result<()>,
{
    match node {
        ExtentNode::Leaf(leaves) => {
            for leaf in leaves {
                visitor(leaf)?;
            }
            Ok(leaves.len())
        }
        ExtentNode::Index(indexes) => {
            let mut count = 0;
            for index in indexes {
                let (_, child) = store.read(child_block(index)?, depth - 1)?;
                count += walk_node(store, depth - 1, &child, visitor)?;
            }
            Ok(count)
        }
    }
}

/// The first unmapped logical block and the physical block mapped just
/// before it, or `None` for an empty tree.
pub fn last_mapped(dev: &dyn BlockDevice, root: &ExtentRoot) -> Result<Option<(u64, BlockNumber)>> {
    let (header, mut node) = parse_root(root)?;
    let store = NodeStore::new(dev);
    let mut depth = header.depth;
    loop {
        match node {
            ExtentNode::Leaf(leaves) => {
                return Ok(leaves
                    .last()
                    .map(|leaf| (leaf.logical_end(), BlockNumber(leaf.physical_end().saturating_sub(1)))));
            }
            ExtentNode::Index(indexes) => {
                let Some(index) = indexes.last() else {
                    return Ok(None);
                };
                depth -= 1;
                (_, node) = store.read(child_block(index)?, depth)?;
            }
        }
    }
}

/// Total data blocks mapped by the tree.
pub fn mapped_blocks(dev: &dyn BlockDevice, root: &ExtentRoot) -> Result<u64> {
    let mut total = 0_u64;
    walk(dev, root, &mut |leaf: &ExtentLeaf| {
        total += u64::from(leaf.len);
        Ok(())
    })?;
    Ok(total)
}

/// Number of node blocks below the inode root.
pub fn tree_blocks(dev: &dyn BlockDevice, root: &ExtentRoot) -> Result<u32> {
    let (header, node) = parse_root(root)?;
    let store = NodeStore::new(dev);
    count_nodes(&store, header.depth, &node)
}

fn count_nodes(store: &NodeStore<'_>, depth: u16, node: &ExtentNode) -> Result<u32> {
    let ExtentNode::Index(indexes) = node else {
        return Ok(0);
    };
    let mut count = 0;
    for index in indexes {
        let (_, child) = store.read(child_block(index)?, depth - 1)?;
        count += 1 + count_nodes(store, depth - 1, &child)?;
    }
    Ok(count)
}

// ── Allocate ────────────────────────────────────────────────────────────────

/// Result of [`allocate_new_block`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocOutcome {
    /// Physical block now mapped at the requested logical block.
    pub physical: BlockNumber,
    /// Data runs claimed by this call, in logical order. Their contents are
    /// whatever the device held before.
    pub new_data: Vec<BlockAlloc>,
    /// Tree node blocks claimed by this call.
    pub new_tree_blocks: u32,
}

impl AllocOutcome {
    #[must_use]
    pub fn new_data_blocks(&self) -> u64 {
        self.new_data.iter().map(|run| u64::from(run.count)).sum()
    }
}

/// One node on the rightmost root-to-leaf path.
struct PathLevel {
    /// `None` for the inode root.
    block: Option<BlockNumber>,
    depth: u16,
    max_entries: u16,
    node: ExtentNode,
}

impl PathLevel {
    fn has_room(&self) -> bool {
        self.node.len() < usize::from(self.max_entries)
    }
}

fn load_right_path(store: &NodeStore<'_>, root: &ExtentRoot) -> Result<Vec<PathLevel>> {
    let (header, node) = parse_root(root)?;
    let mut path = vec![PathLevel {
        block: None,
        depth: header.depth,
        max_entries: EXTENT_ROOT_MAX_ENTRIES,
        node,
    }];
    while let Some(level) = path.last() {
        let ExtentNode::Index(indexes) = &level.node else {
            break;
        };
        let Some(index) = indexes.last() else {
            let block = level.block.map_or(ROOT_BLOCK, |b| b.0);
            error!(block, invariant = "index.entries", "extent_invariant_violation");
            return Err(VfsError::corruption(block, "extent index node has no entries"));
        };
        let block = child_block(index)?;
        let depth = level.depth - 1;
        let (_, node) = store.read(block, depth)?;
        path.push(PathLevel {
            block: Some(block),
            depth,
            max_entries: EXTENT_NODE_MAX_ENTRIES,
            node,
        });
    }
    Ok(path)
}

fn path_last_leaf(path: &[PathLevel]) -> Option<ExtentLeaf> {
    match &path.last()?.node {
        ExtentNode::Leaf(leaves) => leaves.last().copied(),
        ExtentNode::Index(_) => None,
    }
}

/// Staged state of one tree mutation.
struct Mutation<'d> {
    store: NodeStore<'d>,
    hint: AllocHint,
    data: Vec<BlockAlloc>,
    tree: Vec<BlockNumber>,
}

impl<'d> Mutation<'d> {
    fn new(dev: &'d dyn BlockDevice, hint: AllocHint) -> Self {
        Self {
            store: NodeStore::new(dev),
            hint,
            data: Vec::new(),
            tree: Vec::new(),
        }
    }

    /// Map every logical block in `[end, target]`, returning the physical
    /// block of `target`.
    fn extend(
        &mut self,
        alloc: &mut dyn BlockAllocator,
        path: &mut Vec<PathLevel>,
        end: u64,
        target: u32,
    ) -> Result<BlockNumber> {
        if !path[0].has_room() && path[0].depth < MAX_TREE_DEPTH {
            self.grow_root(alloc, path)?;
        }

        let target = u64::from(target);
        let mut next = end;
        let mut physical = None;
        while next <= target {
            let want = u32::try_from((target - next + 1).min(u64::from(MAX_EXTENT_LEN)))
                .unwrap_or(MAX_EXTENT_LEN);
            let run = self.claim_data(alloc, want)?;
            let logical = u32::try_from(next)
                .map_err(|_| VfsError::InvalidArgument(format!("logical block {next}")))?;
            self.append_run(alloc, path, logical, run)?;
            let run_end = next + u64::from(run.count);
            if target < run_end {
                physical = Some(BlockNumber(run.start.0 + (target - next)));
            }
            next = run_end;
        }
        physical.ok_or_else(|| VfsError::corruption(ROOT_BLOCK, "allocation stopped short of target"))
    }

    /// Claim up to `want` contiguous data blocks, halving the request on
    /// `NoSpace` until a single block is asked for.
    fn claim_data(&mut self, alloc: &mut dyn BlockAllocator, want: u32) -> Result<BlockAlloc> {
        let mut want = want;
        loop {
            match alloc.alloc_blocks(want, &self.hint) {
                Ok(run) => {
                    self.data.push(run);
                    self.hint.goal_block = run.start.checked_add(u64::from(run.count));
                    return Ok(run);
                }
                Err(VfsError::NoSpace) if want > 1 => {
                    trace!(want, "extent_alloc_shrink");
                    want /= 2;
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn claim_node(&mut self, alloc: &mut dyn BlockAllocator) -> Result<BlockNumber> {
        let run = alloc.alloc_blocks(1, &self.hint)?;
        self.tree.push(run.start);
        Ok(run.start)
    }

    fn stage_level(&mut self, level: &PathLevel) -> Result<()> {
        match level.block {
            Some(block) => self.store.stage(block, level.depth, &level.node),
            None => Ok(()),
        }
    }

    /// Move the root's content into a new block and point the root at it.
    fn grow_root(&mut self, alloc: &mut dyn BlockAllocator, path: &mut Vec<PathLevel>) -> Result<()> {
        let block = self.claim_node(alloc)?;
        let child = disk_block(block)?;
        let root = &mut path[0];
        let old_depth = root.depth;
        let first = root.node.first_logical().unwrap_or(0);
        self.store.stage(block, old_depth, &root.node)?;

        let node = std::mem::replace(
            &mut root.node,
            ExtentNode::Index(vec![ExtentIndex {
                logical_block: first,
                child_block: child,
            }]),
        );
        root.depth = old_depth + 1;
        path.insert(
            1,
            PathLevel {
                block: Some(block),
                depth: old_depth,
                max_entries: EXTENT_NODE_MAX_ENTRIES,
                node,
            },
        );
        debug!(
            old_depth,
            new_depth = old_depth + 1,
            relocated_to = block.0,
            "extent_root_grow"
        );
        Ok(())
    }

    /// Record `run` as the extent starting at `logical`.
    fn append_run(
        &mut self,
        alloc: &mut dyn BlockAllocator,
        path: &mut Vec<PathLevel>,
        logical: u32,
        run: BlockAlloc,
    ) -> Result<()> {
        let leaf = ExtentLeaf {
            logical_block: logical,
            len: u16::try_from(run.count)
                .map_err(|_| VfsError::InvalidArgument(format!("run of {} blocks", run.count)))?,
            physical_start: disk_block(run.start)?,
        };

        loop {
            let leaf_pos = path.len() - 1;
            let level = &mut path[leaf_pos];
            let ExtentNode::Leaf(leaves) = &mut level.node else {
                return Err(VfsError::corruption(
                    level.block.map_or(ROOT_BLOCK, |b| b.0),
                    "rightmost path does not end in a leaf",
                ));
            };

            if let Some(last) = leaves.last_mut() {
                let contiguous = last.logical_end() == u64::from(leaf.logical_block)
                    && last.physical_end() == u64::from(leaf.physical_start);
                if contiguous && u32::from(last.len) + run.count <= MAX_EXTENT_LEN {
                    last.len += leaf.len;
                    trace!(
                        logical_block = last.logical_block,
                        len = last.len,
                        "extent_merge"
                    );
                    let level = &path[leaf_pos];
                    return self.stage_level(level);
                }
            }
            if leaves.len() < usize::from(level.max_entries) {
                leaves.push(leaf);
                trace!(logical, physical = run.start.0, count = run.count, "extent_append");
                let level = &path[leaf_pos];
                return self.stage_level(level);
            }

            if let Some(parent) = (0..leaf_pos).rev().find(|&i| path[i].has_room()) {
                return self.add_branch(alloc, path, parent, leaf);
            }
            if path[0].depth >= MAX_TREE_DEPTH {
                warn!(depth = path[0].depth, logical, "extent_tree_full");
                return Err(VfsError::NoSpace);
            }
            self.grow_root(alloc, path)?;
        }
    }

    /// Hang a fresh chain of nodes ending in a one-extent leaf off the index
    /// node at `path[parent]`.
    fn add_branch(
        &mut self,
        alloc: &mut dyn BlockAllocator,
        path: &mut Vec<PathLevel>,
        parent: usize,
        leaf: ExtentLeaf,
    ) -> Result<()> {
        let parent_depth = path[parent].depth;
        let mut blocks = Vec::with_capacity(usize::from(parent_depth));
        for _ in 0..parent_depth {
            blocks.push(self.claim_node(alloc)?);
        }

        let mut chain = Vec::with_capacity(blocks.len());
        for (k, depth) in (0..parent_depth).rev().enumerate() {
            let node = match blocks.get(k + 1) {
                Some(&child) if depth > 0 => ExtentNode::Index(vec![ExtentIndex {
                    logical_block: leaf.logical_block,
                    child_block: disk_block(child)?,
                }]),
                _ => ExtentNode::Leaf(vec![leaf]),
            };
            self.store.stage(blocks[k], depth, &node)?;
            chain.push(PathLevel {
                block: Some(blocks[k]),
                depth,
                max_entries: EXTENT_NODE_MAX_ENTRIES,
                node,
            });
        }

        let ExtentNode::Index(indexes) = &mut path[parent].node else {
            return Err(VfsError::corruption(ROOT_BLOCK, "branch parent is not an index node"));
        };
        indexes.push(ExtentIndex {
            logical_block: leaf.logical_block,
            child_block: disk_block(blocks[0])?,
        });
        let level = &path[parent];
        self.stage_level(level)?;
        path.truncate(parent + 1);
        path.extend(chain);
        debug!(
            parent_depth,
            new_nodes = blocks.len(),
            logical = leaf.logical_block,
            "extent_branch_add"
        );
        Ok(())
    }

    /// Return everything claimed so far.
    fn rollback(self, alloc: &mut dyn BlockAllocator) {
        debug!(
            data_runs = self.data.len(),
            tree_blocks = self.tree.len(),
            "extent_alloc_rollback"
        );
        for block in self.tree.iter().rev() {
            if let Err(err) = alloc.free_blocks(*block, 1) {
                error!(block = block.0, error = %err, "extent_rollback_failed");
            }
        }
        for run in self.data.iter().rev() {
            if let Err(err) = alloc.free_blocks(run.start, run.count) {
                error!(
                    block = run.start.0,
                    count = run.count,
                    error = %err,
                    "extent_rollback_failed"
                );
            }
        }
    }
}

/// Extend the file so that `logical` is mapped and return its physical
/// block.
///
/// Every logical block between the current end of the file and `logical`
/// is mapped on the way. Data runs are requested as long as possible and
/// halved on `NoSpace` down to single blocks. A run physically contiguous
/// with the last extent is merged into it.
///
/// If the inode root is full it is first relocated into a new block and
/// replaced by a single index entry, adding one level to the tree.
///
/// On error every block claimed by this call is freed and `root` is left
/// unchanged.
pub fn allocate_new_block(
    dev: &dyn BlockDevice,
    root: &mut ExtentRoot,
    logical: u32,
    hint: &AllocHint,
    alloc: &mut dyn BlockAllocator,
) -> Result<AllocOutcome> {
    if let Some(physical) = search(dev, root, logical)? {
        return Ok(AllocOutcome {
            physical,
            new_data: Vec::new(),
            new_tree_blocks: 0,
        });
    }

    let mut mutation = Mutation::new(dev, hint.clone());
    let mut path = load_right_path(&mutation.store, root)?;
    let last = path_last_leaf(&path);
    let end = last.map_or(0, ExtentLeaf::logical_end);
    if u64::from(logical) < end {
        error!(
            logical,
            logical_end = end,
            invariant = "dense_mapping",
            "extent_invariant_violation"
        );
        return Err(VfsError::corruption(
            ROOT_BLOCK,
            format!("logical block {logical} is an unmapped hole below end {end}"),
        ));
    }
    if let Some(leaf) = last {
        mutation.hint.goal_block = Some(BlockNumber(leaf.physical_end()));
    }

    let physical = match mutation.extend(alloc, &mut path, end, logical) {
        Ok(physical) => physical,
        Err(err) => {
            mutation.rollback(alloc);
            return Err(err);
        }
    };

    let mut new_root = *root;
    if let Err(err) = encode_root(&mut new_root, path[0].depth, &path[0].node) {
        mutation.rollback(alloc);
        return Err(err);
    }
    let Ok(new_tree_blocks) = u32::try_from(mutation.tree.len()) else {
        let count = mutation.tree.len();
        mutation.rollback(alloc);
        return Err(VfsError::InvalidArgument(format!(
            "mapping logical block {logical} needs {count} tree blocks"
        )));
    };

    let Mutation {
        store, data, tree, ..
    } = mutation;
    store.commit().map_err(|err| {
        // Some nodes may already reference the new blocks, so they are
        // leaked rather than freed.
        error!(
            data_runs = data.len(),
            tree_blocks = tree.len(),
            error = %err,
            "extent_commit_failed"
        );
        err
    })?;
    *root = new_root;

    trace!(
        logical,
        physical = physical.0,
        data_runs = data.len(),
        new_tree_blocks,
        depth = path[0].depth,
        "extent_allocate_done"
    );
    Ok(AllocOutcome {
        physical,
        new_data: data,
        new_tree_blocks,
    })
}

// ── Free ────────────────────────────────────────────────────────────────────

/// Blocks released by [`free_from`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FreeOutcome {
    pub data_blocks: u64,
    pub tree_blocks: u32,
}

#[derive(Default)]
struct Freed {
    data: Vec<BlockAlloc>,
    tree: Vec<BlockNumber>,
}

/// Unmap and free every logical block at or after `start`.
///
/// The extent straddling `start` is shortened; later extents are removed.
/// Subtrees left empty are freed along with their index entries, and the
/// root absorbs a lone child small enough to fit in the inode. Node
/// rewrites reach the device before any block is returned to `alloc`.
pub fn free_from(
    dev: &dyn BlockDevice,
    root: &mut ExtentRoot,
    start: u32,
    alloc: &mut dyn BlockAllocator,
) -> Result<FreeOutcome> {
    let (header, mut node) = parse_root(root)?;
    let mut depth = header.depth;
    trace!(start, tree_depth = depth, "extent_free_start");

    let mut store = NodeStore::new(dev);
    let mut freed = Freed::default();
    match &mut node {
        ExtentNode::Leaf(leaves) => trim_leaves(leaves, start, &mut freed.data),
        ExtentNode::Index(indexes) => trim_indexes(&mut store, indexes, depth, start, &mut freed)?,
    }
    if node.is_empty() {
        depth = 0;
        node = ExtentNode::Leaf(Vec::new());
    }
    shrink_root(&mut store, &mut depth, &mut node, &mut freed)?;

    let mut new_root = *root;
    encode_root(&mut new_root, depth, &node)?;
    store.commit()?;
    *root = new_root;

    let mut outcome = FreeOutcome::default();
    for run in &freed.data {
        alloc.free_blocks(run.start, run.count)?;
        outcome.data_blocks += u64::from(run.count);
    }
    for &block in &freed.tree {
        alloc.free_blocks(block, 1)?;
        outcome.tree_blocks += 1;
    }
    trace!(
        start,
        data_blocks = outcome.data_blocks,
        tree_blocks = outcome.tree_blocks,
        "extent_free_done"
    );
    Ok(outcome)
}

#[expect(clippy::cast_possible_truncation)]
fn trim_leaves(leaves: &mut Vec<ExtentLeaf>, start: u32, freed: &mut Vec<BlockAlloc>) {
    let mut kept = Vec::with_capacity(leaves.len());
    for leaf in leaves.drain(..) {
        if leaf.logical_end() <= u64::from(start) {
            kept.push(leaf);
        } else if leaf.logical_block >= start {
            freed.push(BlockAlloc {
                start: BlockNumber(u64::from(leaf.physical_start)),
                count: u32::from(leaf.len),
            });
        } else {
            // Straddles `start`: keep the head, free the tail.
            let keep = start - leaf.logical_block;
            kept.push(ExtentLeaf {
                len: keep as u16,
                ..leaf
            });
            freed.push(BlockAlloc {
                start: BlockNumber(u64::from(leaf.physical_start) + u64::from(keep)),
                count: u32::from(leaf.len) - keep,
            });
        }
    }
    *leaves = kept;
}

fn trim_indexes(
    store: &mut NodeStore<'_>,
    indexes: &mut Vec<ExtentIndex>,
    depth: u16,
    start: u32,
    freed: &mut Freed,
) -> Result<()> {
    let mut pos = 0;
    while pos < indexes.len() {
        // Children whose successor starts at or before `start` lie wholly
        // below it.
        if indexes
            .get(pos + 1)
            .is_some_and(|next| next.logical_block <= start)
        {
            pos += 1;
            continue;
        }

        let block = child_block(&indexes[pos])?;
        let (_, mut child) = store.read(block, depth - 1)?;
        match &mut child {
            ExtentNode::Leaf(leaves) => trim_leaves(leaves, start, &mut freed.data),
            ExtentNode::Index(children) => trim_indexes(store, children, depth - 1, start, freed)?,
        }

        if let Some(first) = child.first_logical() {
            indexes[pos].logical_block = first;
            store.stage(block, depth - 1, &child)?;
            pos += 1;
        } else {
            trace!(
                freed_block_num = block.0,
                reason = "empty_subtree",
                "extent_block_free"
            );
            store.discard(block);
            freed.tree.push(block);
            indexes.remove(pos);
        }
    }
    Ok(())
}

/// Pull a lone child into the root while it fits there.
fn shrink_root(
    store: &mut NodeStore<'_>,
    depth: &mut u16,
    node: &mut ExtentNode,
    freed: &mut Freed,
) -> Result<()> {
    while *depth > 0 {
        let ExtentNode::Index(indexes) = &*node else {
            break;
        };
        let [only] = indexes.as_slice() else {
            break;
        };
        let block = child_block(only)?;
        let (_, child) = store.read(block, *depth - 1)?;
        if child.len() > usize::from(EXTENT_ROOT_MAX_ENTRIES) {
            break;
        }
        *node = child;
        *depth -= 1;
        store.discard(block);
        freed.tree.push(block);
        debug!(freed_block_num = block.0, new_depth = *depth, "extent_root_shrink");
    }
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use proptest::prelude::*;
    use std::collections::{BTreeMap, BTreeSet, HashMap};
    use vfs_alloc::FsGeometry;
    use vfs_block::BlockBuf;
    use vfs_ondisk::GroupDesc;
    use vfs_types::{BLOCK_SIZE, GroupNumber};

    struct MemBlockDevice {
        blocks: Mutex<HashMap<u64, Vec<u8>>>,
    }

    impl MemBlockDevice {
        fn new() -> Self {
            Self {
                blocks: Mutex::new(HashMap::new()),
            }
        }

        fn zero(&self, block: BlockNumber) {
            self.blocks.lock().remove(&block.0);
        }
    }

    impl BlockDevice for MemBlockDevice {
        fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
            let blocks = self.blocks.lock();
            Ok(BlockBuf::new(
                blocks
                    .get(&block.0)
                    .cloned()
                    .unwrap_or_else(|| vec![0_u8; BLOCK_SIZE as usize]),
            ))
        }

        fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
            self.blocks.lock().insert(block.0, data.to_vec());
            Ok(())
        }

        fn block_size(&self) -> u32 {
            BLOCK_SIZE
        }

        fn block_count(&self) -> u64 {
            1 << 20
        }

        fn sync(&self) -> Result<()> {
            Ok(())
        }
    }

    /// Hands out blocks in increasing order, leaving `gap` unused blocks
    /// after every run so consecutive runs never merge unless `gap == 0`.
    struct SeqAllocator {
        next: u64,
        gap: u64,
        limit: u64,
        max_run: u32,
        live: BTreeSet<u64>,
    }

    impl SeqAllocator {
        fn new(gap: u64) -> Self {
            Self {
                next: 100,
                gap,
                limit: u64::MAX,
                max_run: u32::MAX,
                live: BTreeSet::new(),
            }
        }
    }

    impl BlockAllocator for SeqAllocator {
        fn alloc_blocks(&mut self, count: u32, _hint: &AllocHint) -> Result<BlockAlloc> {
            if count > self.max_run || self.next + u64::from(count) > self.limit {
                return Err(VfsError::NoSpace);
            }
            let start = self.next;
            self.live.extend(start..start + u64::from(count));
            self.next = start + u64::from(count) + self.gap;
            Ok(BlockAlloc {
                start: BlockNumber(start),
                count,
            })
        }

        fn free_blocks(&mut self, start: BlockNumber, count: u32) -> Result<()> {
            for block in start.0..start.0 + u64::from(count) {
                if !self.live.remove(&block) {
                    return Err(VfsError::corruption(block, "double free"));
                }
            }
            Ok(())
        }
    }

    fn empty_root() -> ExtentRoot {
        let mut root = [0_u8; EXTENT_ROOT_BYTES];
        init_empty(&mut root).expect("init");
        root
    }

    fn root_header(root: &ExtentRoot) -> ExtentHeader {
        parse_root(root).expect("root").0
    }

    /// Allocate logical blocks `0..count` one call at a time and return the
    /// mapping observed after each call.
    fn grow_to(
        dev: &MemBlockDevice,
        root: &mut ExtentRoot,
        alloc: &mut SeqAllocator,
        count: u32,
    ) -> BTreeMap<u32, BlockNumber> {
        let mut mapping = BTreeMap::new();
        for logical in 0..count {
            let out = allocate_new_block(dev, root, logical, &AllocHint::default(), alloc)
                .expect("allocate");
            mapping.insert(logical, out.physical);
        }
        mapping
    }

    fn assert_mapping(dev: &MemBlockDevice, root: &ExtentRoot, mapping: &BTreeMap<u32, BlockNumber>) {
        for (&logical, &physical) in mapping {
            assert_eq!(
                search(dev, root, logical).expect("search"),
                Some(physical),
                "logical {logical}"
            );
        }
    }

    fn assert_sorted_non_overlapping(dev: &MemBlockDevice, root: &ExtentRoot) {
        let mut prev_end = 0_u64;
        walk(dev, root, &mut |leaf: &ExtentLeaf| {
            assert!(leaf.len > 0);
            assert!(u64::from(leaf.logical_block) >= prev_end);
            prev_end = leaf.logical_end();
            Ok(())
        })
        .expect("walk");
    }

    #[test]
    fn init_maps_single_run() {
        let dev = MemBlockDevice::new();
        let mut root = [0_u8; EXTENT_ROOT_BYTES];
        init(&mut root, BlockNumber(50), 3).unwrap();

        assert_eq!(search(&dev, &root, 0).unwrap(), Some(BlockNumber(50)));
        assert_eq!(search(&dev, &root, 2).unwrap(), Some(BlockNumber(52)));
        assert_eq!(search(&dev, &root, 3).unwrap(), None);
        assert_eq!(last_mapped(&dev, &root).unwrap(), Some((3, BlockNumber(52))));
        assert_eq!(mapped_blocks(&dev, &root).unwrap(), 3);
        assert_eq!(tree_blocks(&dev, &root).unwrap(), 0);
        assert!(init(&mut root, BlockNumber(50), 0).is_err());
        assert!(init(&mut root, BlockNumber(50), 70_000).is_err());
    }

    #[test]
    fn empty_tree_has_no_mappings() {
        let dev = MemBlockDevice::new();
        let root = empty_root();
        assert_eq!(search(&dev, &root, 0).unwrap(), None);
        assert_eq!(last_mapped(&dev, &root).unwrap(), None);
        assert_eq!(walk(&dev, &root, &mut |_: &ExtentLeaf| Ok(())).unwrap(), 0);
    }

    #[test]
    fn zeroed_root_is_corruption() {
        let dev = MemBlockDevice::new();
        let root = [0_u8; EXTENT_ROOT_BYTES];
        assert!(search(&dev, &root, 0).unwrap_err().is_corruption());
    }

    #[test]
    fn contiguous_appends_merge_into_one_leaf() {
        let dev = MemBlockDevice::new();
        let mut root = empty_root();
        let mut alloc = SeqAllocator::new(0);
        let mapping = grow_to(&dev, &mut root, &mut alloc, 10);

        assert_eq!(walk(&dev, &root, &mut |_: &ExtentLeaf| Ok(())).unwrap(), 1);
        assert_eq!(mapping[&9], BlockNumber(109));
        assert_eq!(last_mapped(&dev, &root).unwrap(), Some((10, BlockNumber(109))));
    }

    #[test]
    fn allocating_a_mapped_block_is_a_lookup() {
        let dev = MemBlockDevice::new();
        let mut root = empty_root();
        let mut alloc = SeqAllocator::new(1);
        grow_to(&dev, &mut root, &mut alloc, 3);
        let before = alloc.live.clone();

        let out = allocate_new_block(&dev, &mut root, 1, &AllocHint::default(), &mut alloc).unwrap();
        assert_eq!(out.physical, BlockNumber(102));
        assert!(out.new_data.is_empty());
        assert_eq!(alloc.live, before);
    }

    #[test]
    fn gap_is_filled_up_to_target() {
        let dev = MemBlockDevice::new();
        let mut root = empty_root();
        let mut alloc = SeqAllocator::new(0);

        let out = allocate_new_block(&dev, &mut root, 19, &AllocHint::default(), &mut alloc).unwrap();
        assert_eq!(out.physical, BlockNumber(119));
        assert_eq!(out.new_data_blocks(), 20);
        for logical in 0..20 {
            assert_eq!(
                search(&dev, &root, logical).unwrap(),
                Some(BlockNumber(100 + u64::from(logical)))
            );
        }
    }

    #[test]
    fn full_root_grows_one_level() {
        let dev = MemBlockDevice::new();
        let mut root = empty_root();
        let mut alloc = SeqAllocator::new(1);
        let mut mapping = grow_to(&dev, &mut root, &mut alloc, 9);

        let header = root_header(&root);
        assert_eq!((header.depth, header.entries), (0, 9));

        let out = allocate_new_block(&dev, &mut root, 9, &AllocHint::default(), &mut alloc).unwrap();
        mapping.insert(9, out.physical);
        assert_eq!(out.new_tree_blocks, 1);

        let header = root_header(&root);
        assert_eq!((header.depth, header.entries), (1, 1));
        assert_eq!(tree_blocks(&dev, &root).unwrap(), 1);
        assert_mapping(&dev, &root, &mapping);
        assert_eq!(walk(&dev, &root, &mut |_: &ExtentLeaf| Ok(())).unwrap(), 10);
    }

    #[test]
    fn full_leaf_block_adds_branch() {
        let dev = MemBlockDevice::new();
        let mut root = empty_root();
        let mut alloc = SeqAllocator::new(1);
        let mapping = grow_to(&dev, &mut root, &mut alloc, 409);

        let header = root_header(&root);
        assert_eq!((header.depth, header.entries), (1, 2));
        assert_eq!(tree_blocks(&dev, &root).unwrap(), 2);
        assert_mapping(&dev, &root, &mapping);
    }

    #[test]
    fn deep_tree_round_trip() {
        let dev = MemBlockDevice::new();
        let mut root = empty_root();
        let mut alloc = SeqAllocator::new(1);
        let count = 9 * 408 + 2;
        let mapping = grow_to(&dev, &mut root, &mut alloc, count);

        assert_eq!(root_header(&root).depth, 2);
        assert_mapping(&dev, &root, &mapping);
        assert_sorted_non_overlapping(&dev, &root);
        assert_eq!(walk(&dev, &root, &mut |_: &ExtentLeaf| Ok(())).unwrap(), count as usize);
        assert_eq!(
            last_mapped(&dev, &root).unwrap(),
            Some((u64::from(count), mapping[&(count - 1)]))
        );
        assert_eq!(search(&dev, &root, count).unwrap(), None);
    }

    #[test]
    fn requests_shrink_under_fragmentation() {
        let dev = MemBlockDevice::new();
        let mut root = empty_root();
        let mut alloc = SeqAllocator::new(1);
        alloc.max_run = 4;

        let out = allocate_new_block(&dev, &mut root, 9, &AllocHint::default(), &mut alloc).unwrap();
        assert!(out.new_data.iter().all(|run| run.count <= 4));
        assert_eq!(out.new_data_blocks(), 10);
        assert_eq!(mapped_blocks(&dev, &root).unwrap(), 10);
        assert_sorted_non_overlapping(&dev, &root);
    }

    #[test]
    fn failed_growth_rolls_back() {
        let dev = MemBlockDevice::new();
        let mut root = empty_root();
        let mut alloc = SeqAllocator::new(1);
        grow_to(&dev, &mut root, &mut alloc, 9);

        // One block left: the root relocation takes it, the data run fails.
        alloc.limit = alloc.next + 1;
        let root_before = root;
        let live_before = alloc.live.clone();

        let err = allocate_new_block(&dev, &mut root, 9, &AllocHint::default(), &mut alloc)
            .unwrap_err();
        assert!(matches!(err, VfsError::NoSpace));
        assert_eq!(root, root_before);
        assert_eq!(alloc.live, live_before);
        assert_eq!(search(&dev, &root, 8).unwrap(), Some(BlockNumber(116)));
    }

    #[test]
    fn hole_below_end_is_corruption() {
        let dev = MemBlockDevice::new();
        let mut root = [0_u8; EXTENT_ROOT_BYTES];
        let node = ExtentNode::Leaf(vec![
            ExtentLeaf {
                logical_block: 0,
                len: 2,
                physical_start: 100,
            },
            ExtentLeaf {
                logical_block: 5,
                len: 1,
                physical_start: 200,
            },
        ]);
        encode_root(&mut root, 0, &node).unwrap();
        let mut alloc = SeqAllocator::new(0);

        let err = allocate_new_block(&dev, &mut root, 3, &AllocHint::default(), &mut alloc)
            .unwrap_err();
        assert!(err.is_corruption());
        assert!(alloc.live.is_empty());
    }

    #[test]
    fn damaged_child_is_corruption() {
        let dev = MemBlockDevice::new();
        let mut root = empty_root();
        let mut alloc = SeqAllocator::new(1);
        grow_to(&dev, &mut root, &mut alloc, 10);

        let ExtentNode::Index(indexes) = parse_root(&root).unwrap().1 else {
            panic!("expected index root");
        };
        dev.zero(BlockNumber(u64::from(indexes[0].child_block)));

        assert!(search(&dev, &root, 3).unwrap_err().is_corruption());
        assert!(walk(&dev, &root, &mut |_: &ExtentLeaf| Ok(())).unwrap_err().is_corruption());
    }

    #[test]
    fn free_from_trims_straddling_extent() {
        let dev = MemBlockDevice::new();
        let mut root = empty_root();
        let mut alloc = SeqAllocator::new(1);
        allocate_new_block(&dev, &mut root, 9, &AllocHint::default(), &mut alloc).unwrap();
        allocate_new_block(&dev, &mut root, 14, &AllocHint::default(), &mut alloc).unwrap();
        assert_eq!(walk(&dev, &root, &mut |_: &ExtentLeaf| Ok(())).unwrap(), 2);

        let out = free_from(&dev, &mut root, 5, &mut alloc).unwrap();
        assert_eq!(out, FreeOutcome { data_blocks: 10, tree_blocks: 0 });
        assert_eq!(search(&dev, &root, 4).unwrap(), Some(BlockNumber(104)));
        assert_eq!(search(&dev, &root, 5).unwrap(), None);
        assert_eq!(last_mapped(&dev, &root).unwrap(), Some((5, BlockNumber(104))));
        assert_eq!(alloc.live, (100..105).collect::<BTreeSet<u64>>());
    }

    #[test]
    fn free_from_zero_releases_whole_tree() {
        let dev = MemBlockDevice::new();
        let mut root = empty_root();
        let mut alloc = SeqAllocator::new(1);
        grow_to(&dev, &mut root, &mut alloc, 420);
        assert_eq!(tree_blocks(&dev, &root).unwrap(), 2);

        let out = free_from(&dev, &mut root, 0, &mut alloc).unwrap();
        assert_eq!(out, FreeOutcome { data_blocks: 420, tree_blocks: 2 });
        let header = root_header(&root);
        assert_eq!((header.depth, header.entries), (0, 0));
        assert!(alloc.live.is_empty());
    }

    #[test]
    fn free_from_collapses_small_child_into_root() {
        let dev = MemBlockDevice::new();
        let mut root = empty_root();
        let mut alloc = SeqAllocator::new(1);
        let mut mapping = grow_to(&dev, &mut root, &mut alloc, 10);
        assert_eq!(root_header(&root).depth, 1);

        let out = free_from(&dev, &mut root, 5, &mut alloc).unwrap();
        assert_eq!(out, FreeOutcome { data_blocks: 5, tree_blocks: 1 });
        assert_eq!(root_header(&root).depth, 0);
        mapping.retain(|&logical, _| logical < 5);
        assert_mapping(&dev, &root, &mapping);
    }

    #[test]
    fn free_from_past_end_keeps_everything() {
        let dev = MemBlockDevice::new();
        let mut root = empty_root();
        let mut alloc = SeqAllocator::new(1);
        let mapping = grow_to(&dev, &mut root, &mut alloc, 420);

        let out = free_from(&dev, &mut root, 420, &mut alloc).unwrap();
        assert_eq!(out, FreeOutcome::default());
        assert_mapping(&dev, &root, &mapping);
    }

    #[test]
    fn regrow_after_truncate() {
        let dev = MemBlockDevice::new();
        let mut root = empty_root();
        let mut alloc = SeqAllocator::new(1);
        grow_to(&dev, &mut root, &mut alloc, 500);
        free_from(&dev, &mut root, 100, &mut alloc).unwrap();

        let out = allocate_new_block(&dev, &mut root, 149, &AllocHint::default(), &mut alloc).unwrap();
        assert_eq!(out.new_data_blocks(), 50);
        assert_eq!(mapped_blocks(&dev, &root).unwrap(), 150);
        assert_sorted_non_overlapping(&dev, &root);
    }

    #[test]
    fn group_allocator_prefers_hinted_group() {
        let dev = MemBlockDevice::new();
        let geo = FsGeometry::new(2 + 3 * 64, 64, 32).unwrap();
        let descs: Vec<GroupDesc> = (0..geo.group_count)
            .map(|g| GroupDesc {
                free_blocks_count: geo.data_blocks_in_group(GroupNumber(g)),
                free_inodes_count: geo.inodes_per_group,
                flags: 0,
            })
            .collect();
        let groups = GroupTable::from_descs(geo.clone(), &descs).unwrap();
        let before = groups.free_blocks_total();

        let mut root = empty_root();
        let hint = AllocHint {
            goal_group: Some(GroupNumber(1)),
            goal_block: None,
        };
        let mut alloc = GroupAllocator::new(&dev, &groups);
        let out = allocate_new_block(&dev, &mut root, 29, &hint, &mut alloc).unwrap();
        assert_eq!(geo.group_of_block(out.physical), GroupNumber(1));
        assert_eq!(groups.free_blocks_in(GroupNumber(1)), 61 - 30);
        assert_eq!(groups.free_blocks_total(), before - 30);

        let freed = free_from(&dev, &mut root, 0, &mut alloc).unwrap();
        assert_eq!(freed.data_blocks, 30);
        assert_eq!(groups.free_blocks_total(), before);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn appended_mappings_survive_growth(
            steps in proptest::collection::vec(1_u32..40, 1..60),
            gap in 0_u64..2,
            max_run in 1_u32..8,
        ) {
            let dev = MemBlockDevice::new();
            let mut root = empty_root();
            let mut alloc = SeqAllocator::new(gap);
            alloc.max_run = max_run;
            let mut mapping = BTreeMap::new();
            let mut logical = 0_u32;
            for step in steps {
                logical += step;
                let out = allocate_new_block(&dev, &mut root, logical, &AllocHint::default(), &mut alloc)
                    .expect("allocate");
                prop_assert_eq!(search(&dev, &root, logical).expect("search"), Some(out.physical));
                mapping.insert(logical, out.physical);
            }
            for (&logical, &physical) in &mapping {
                prop_assert_eq!(search(&dev, &root, logical).expect("search"), Some(physical));
            }
            let tree = u64::from(tree_blocks(&dev, &root).expect("tree"));
            let data = mapped_blocks(&dev, &root).expect("mapped");
            prop_assert_eq!(data, u64::from(logical) + 1);
            prop_assert_eq!(alloc.live.len() as u64, data + tree);
        }
    }
}
