//! Staged access to extent node blocks.
//!
//! Mutating tree operations read nodes through a [`NodeStore`] and stage
//! their rewrites in memory. Nothing reaches the device until
//! [`NodeStore::commit`], so an operation that fails halfway leaves every
//! on-disk node as it was.

use std::collections::BTreeMap;
use tracing::error;
use vfs_block::BlockDevice;
use vfs_error::{Result, VfsError};
use vfs_ondisk::{ExtentHeader, ExtentIndex, ExtentNode, parse_extent_node, write_extent_node};
use vfs_types::{BlockNumber, EXTENT_NODE_MAX_ENTRIES, FIRST_GROUP_BLOCK};

pub(crate) struct NodeStore<'a> {
    dev: &'a dyn BlockDevice,
    pending: BTreeMap<BlockNumber, Vec<u8>>,
}

impl<'a> NodeStore<'a> {
    pub(crate) fn new(dev: &'a dyn BlockDevice) -> Self {
        Self {
            dev,
            pending: BTreeMap::new(),
        }
    }

    /// Load a non-root node and check it sits at `expected_depth`.
    pub(crate) fn read(
        &self,
        block: BlockNumber,
        expected_depth: u16,
    ) -> Result<(ExtentHeader, ExtentNode)> {
        let fetched;
        let data: &[u8] = match self.pending.get(&block) {
            Some(bytes) => bytes,
            None => {
                fetched = self.dev.read_block(block)?;
                fetched.as_slice()
            }
        };

        let (header, node) = parse_extent_node(data).map_err(|err| {
            error!(
                block = block.0,
                invariant = "header",
                detail = %err,
                "extent_invariant_violation"
            );
            VfsError::corruption(block.0, format!("bad extent node: {err}"))
        })?;

        if header.depth != expected_depth {
            error!(
                block = block.0,
                invariant = "header.depth",
                expected = expected_depth,
                got = header.depth,
                "extent_invariant_violation"
            );
            return Err(VfsError::corruption(
                block.0,
                format!(
                    "extent tree depth mismatch: expected {expected_depth}, got {}",
                    header.depth
                ),
            ));
        }
        if header.max_entries > EXTENT_NODE_MAX_ENTRIES {
            error!(
                block = block.0,
                invariant = "header.max_entries",
                got = header.max_entries,
                "extent_invariant_violation"
            );
            return Err(VfsError::corruption(
                block.0,
                format!("extent node capacity {} too large", header.max_entries),
            ));
        }
        Ok((header, node))
    }

    /// Stage a full-block node rewrite.
    pub(crate) fn stage(&mut self, block: BlockNumber, depth: u16, node: &ExtentNode) -> Result<()> {
        let mut buf = vec![0_u8; self.dev.block_size() as usize];
        write_extent_node(&mut buf, EXTENT_NODE_MAX_ENTRIES, depth, node)
            .map_err(|err| VfsError::corruption(block.0, format!("encode extent node: {err}")))?;
        self.pending.insert(block, buf);
        Ok(())
    }

    /// Drop any staged write for a block that is about to be freed.
    pub(crate) fn discard(&mut self, block: BlockNumber) {
        self.pending.remove(&block);
    }

    /// Write every staged node in block order.
    pub(crate) fn commit(self) -> Result<()> {
        for (block, data) in self.pending {
            self.dev.write_block(block, &data)?;
        }
        Ok(())
    }
}

/// Resolve an index entry to its child block, refusing pointers into the
/// superblock or descriptor table.
pub(crate) fn child_block(index: &ExtentIndex) -> Result<BlockNumber> {
    let block = u64::from(index.child_block);
    if block < FIRST_GROUP_BLOCK {
        error!(
            child = block,
            invariant = "index.child_block",
            "extent_invariant_violation"
        );
        return Err(VfsError::corruption(
            block,
            "extent index points at a reserved block",
        ));
    }
    Ok(BlockNumber(block))
}
