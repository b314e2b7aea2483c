//! Extent node codec.
//!
//! A node is a 10-byte header followed by `max_entries` 10-byte slots. The
//! same layout is used for the 100-byte root embedded in the inode and for
//! full-block nodes; only `max_entries` differs.

use serde::{Deserialize, Serialize};
use vfs_types::{
    EXTENT_ENTRY_SIZE, EXTENT_MAGIC, MAX_TREE_DEPTH, ParseError, ensure_slice_mut, read_le_u16,
    read_le_u32, write_le_u16, write_le_u32,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentHeader {
    pub magic: u16,
    pub entries: u16,
    pub max_entries: u16,
    pub depth: u16,
}

impl ExtentHeader {
    #[must_use]
    pub fn new(max_entries: u16, depth: u16) -> Self {
        Self {
            magic: EXTENT_MAGIC,
            entries: 0,
            max_entries,
            depth,
        }
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.entries >= self.max_entries
    }
}

/// Depth-0 record: `len` logical blocks starting at `logical_block` live at
/// consecutive physical blocks starting at `physical_start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentLeaf {
    pub logical_block: u32,
    pub len: u16,
    pub physical_start: u32,
}

impl ExtentLeaf {
    /// One past the last logical block covered.
    #[must_use]
    pub fn logical_end(self) -> u64 {
        u64::from(self.logical_block) + u64::from(self.len)
    }

    /// One past the last physical block covered.
    #[must_use]
    pub fn physical_end(self) -> u64 {
        u64::from(self.physical_start) + u64::from(self.len)
    }

    #[must_use]
    pub fn contains(self, logical: u32) -> bool {
        logical >= self.logical_block && u64::from(logical) < self.logical_end()
    }
}

/// Depth>0 record pointing at a child node block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentIndex {
    pub logical_block: u32,
    pub child_block: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtentNode {
    Leaf(Vec<ExtentLeaf>),
    Index(Vec<ExtentIndex>),
}

impl ExtentNode {
    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Leaf(leaves) => leaves.len(),
            Self::Index(indexes) => indexes.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Smallest logical block this node claims, if any.
    #[must_use]
    pub fn first_logical(&self) -> Option<u32> {
        match self {
            Self::Leaf(leaves) => leaves.first().map(|l| l.logical_block),
            Self::Index(indexes) => indexes.first().map(|i| i.logical_block),
        }
    }
}

fn slot_offset(idx: usize) -> usize {
    (idx + 1) * EXTENT_ENTRY_SIZE
}

/// Decode and validate only the header.
pub fn parse_extent_header(bytes: &[u8]) -> Result<ExtentHeader, ParseError> {
    let header = ExtentHeader {
        magic: read_le_u16(bytes, 0)?,
        entries: read_le_u16(bytes, 2)?,
        max_entries: read_le_u16(bytes, 4)?,
        depth: read_le_u16(bytes, 6)?,
    };

    if header.magic != EXTENT_MAGIC {
        return Err(ParseError::InvalidMagic {
            expected: u64::from(EXTENT_MAGIC),
            actual: u64::from(header.magic),
        });
    }
    if header.entries > header.max_entries {
        return Err(ParseError::InvalidField {
            field: "eh_entries",
            reason: "entries exceed max",
        });
    }
    if header.depth > MAX_TREE_DEPTH {
        return Err(ParseError::InvalidField {
            field: "eh_depth",
            reason: "exceeds maximum tree depth",
        });
    }
    if slot_offset(usize::from(header.max_entries)) > bytes.len() {
        return Err(ParseError::InvalidField {
            field: "eh_max",
            reason: "capacity exceeds node size",
        });
    }
    Ok(header)
}

pub fn parse_extent_node(bytes: &[u8]) -> Result<(ExtentHeader, ExtentNode), ParseError> {
    let header = parse_extent_header(bytes)?;
    let count = usize::from(header.entries);

    if header.depth == 0 {
        let mut leaves = Vec::with_capacity(count);
        for idx in 0..count {
            let base = slot_offset(idx);
            leaves.push(ExtentLeaf {
                logical_block: read_le_u32(bytes, base)?,
                len: read_le_u16(bytes, base + 4)?,
                physical_start: read_le_u32(bytes, base + 6)?,
            });
        }
        Ok((header, ExtentNode::Leaf(leaves)))
    } else {
        let mut indexes = Vec::with_capacity(count);
        for idx in 0..count {
            let base = slot_offset(idx);
            indexes.push(ExtentIndex {
                logical_block: read_le_u32(bytes, base)?,
                child_block: read_le_u32(bytes, base + 4)?,
            });
        }
        Ok((header, ExtentNode::Index(indexes)))
    }
}

/// Encode `node` over the header and slot area of `bytes`.
///
/// Unused slots are zeroed. A leaf node must be written at depth 0 and an
/// index node at depth > 0.
pub fn write_extent_node(
    bytes: &mut [u8],
    max_entries: u16,
    depth: u16,
    node: &ExtentNode,
) -> Result<(), ParseError> {
    let is_leaf = matches!(node, ExtentNode::Leaf(_));
    if is_leaf != (depth == 0) {
        return Err(ParseError::InvalidField {
            field: "eh_depth",
            reason: "node kind does not match depth",
        });
    }
    let entries = u16::try_from(node.len()).map_err(|_| ParseError::IntegerConversion {
        field: "eh_entries",
    })?;
    if entries > max_entries {
        return Err(ParseError::InvalidField {
            field: "eh_entries",
            reason: "entries exceed max",
        });
    }

    let area = ensure_slice_mut(bytes, 0, slot_offset(usize::from(max_entries)))?;
    area.fill(0);
    write_le_u16(area, 0, EXTENT_MAGIC)?;
    write_le_u16(area, 2, entries)?;
    write_le_u16(area, 4, max_entries)?;
    write_le_u16(area, 6, depth)?;

    match node {
        ExtentNode::Leaf(leaves) => {
            for (idx, leaf) in leaves.iter().enumerate() {
                let base = slot_offset(idx);
                write_le_u32(area, base, leaf.logical_block)?;
                write_le_u16(area, base + 4, leaf.len)?;
                write_le_u32(area, base + 6, leaf.physical_start)?;
            }
        }
        ExtentNode::Index(indexes) => {
            for (idx, index) in indexes.iter().enumerate() {
                let base = slot_offset(idx);
                write_le_u32(area, base, index.logical_block)?;
                write_le_u32(area, base + 4, index.child_block)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vfs_types::{
        BLOCK_SIZE_BYTES, EXTENT_NODE_MAX_ENTRIES, EXTENT_ROOT_BYTES, EXTENT_ROOT_MAX_ENTRIES,
    };

    #[test]
    fn root_leaf_layout() {
        let mut root = [0_u8; EXTENT_ROOT_BYTES];
        let node = ExtentNode::Leaf(vec![ExtentLeaf {
            logical_block: 0,
            len: 3,
            physical_start: 42,
        }]);
        write_extent_node(&mut root, EXTENT_ROOT_MAX_ENTRIES, 0, &node).unwrap();

        assert_eq!(&root[0..2], &EXTENT_MAGIC.to_le_bytes());
        assert_eq!(&root[2..4], &1_u16.to_le_bytes());
        assert_eq!(&root[4..6], &9_u16.to_le_bytes());
        assert_eq!(&root[14..16], &3_u16.to_le_bytes());
        assert_eq!(&root[16..20], &42_u32.to_le_bytes());

        let (header, parsed) = parse_extent_node(&root).unwrap();
        assert_eq!(header.entries, 1);
        assert_eq!(header.depth, 0);
        assert_eq!(parsed, node);
    }

    #[test]
    fn index_block_roundtrip() {
        let mut block = vec![0_u8; BLOCK_SIZE_BYTES];
        let node = ExtentNode::Index(vec![
            ExtentIndex {
                logical_block: 0,
                child_block: 100,
            },
            ExtentIndex {
                logical_block: 500,
                child_block: 101,
            },
        ]);
        write_extent_node(&mut block, EXTENT_NODE_MAX_ENTRIES, 2, &node).unwrap();
        let (header, parsed) = parse_extent_node(&block).unwrap();
        assert_eq!(header.depth, 2);
        assert_eq!(header.max_entries, EXTENT_NODE_MAX_ENTRIES);
        assert_eq!(parsed, node);
        assert_eq!(parsed.first_logical(), Some(0));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let root = [0_u8; EXTENT_ROOT_BYTES];
        assert!(matches!(
            parse_extent_node(&root),
            Err(ParseError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn capacity_must_fit_buffer() {
        let mut root = [0_u8; EXTENT_ROOT_BYTES];
        write_extent_node(&mut root, EXTENT_ROOT_MAX_ENTRIES, 0, &ExtentNode::Leaf(vec![]))
            .unwrap();
        root[4..6].copy_from_slice(&408_u16.to_le_bytes());
        assert!(matches!(
            parse_extent_header(&root),
            Err(ParseError::InvalidField { field: "eh_max", .. })
        ));
    }

    #[test]
    fn kind_and_depth_must_agree() {
        let mut root = [0_u8; EXTENT_ROOT_BYTES];
        assert!(
            write_extent_node(&mut root, EXTENT_ROOT_MAX_ENTRIES, 1, &ExtentNode::Leaf(vec![]))
                .is_err()
        );
        let too_many = ExtentNode::Leaf(vec![
            ExtentLeaf {
                logical_block: 0,
                len: 1,
                physical_start: 1,
            };
            10
        ]);
        assert!(write_extent_node(&mut root, EXTENT_ROOT_MAX_ENTRIES, 0, &too_many).is_err());
    }

    #[test]
    fn leaf_range_helpers() {
        let leaf = ExtentLeaf {
            logical_block: 10,
            len: 5,
            physical_start: 200,
        };
        assert!(leaf.contains(10));
        assert!(leaf.contains(14));
        assert!(!leaf.contains(15));
        assert!(!leaf.contains(9));
        assert_eq!(leaf.logical_end(), 15);
        assert_eq!(leaf.physical_end(), 205);
    }

    proptest::proptest! {
        #[test]
        fn arbitrary_bytes_never_panic(bytes in proptest::collection::vec(proptest::num::u8::ANY, 0..200)) {
            let _ = parse_extent_node(&bytes);
        }
    }
}
