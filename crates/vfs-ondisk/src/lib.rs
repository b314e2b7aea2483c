#![forbid(unsafe_code)]
//! On-disk format codecs for VaultFS.
//!
//! Pure parsing crate with no I/O. Decodes byte slices into typed records
//! (superblock, group descriptors, inodes, extent nodes, directory records)
//! and encodes them back. Every decoder is bounds-checked and reports
//! failures as [`vfs_types::ParseError`].

pub mod dir;
pub mod extent;
pub mod inode;
pub mod superblock;

pub use dir::{
    DirRecord, clear_dir_record, dir_record_offset, parse_dir_record, read_dir_record_ino,
    write_dir_record,
};
pub use extent::{
    ExtentHeader, ExtentIndex, ExtentLeaf, ExtentNode, parse_extent_header, parse_extent_node,
    write_extent_node,
};
pub use inode::{FileType, InodeRecord, ProtectionMode, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG};
pub use superblock::{GroupDesc, Superblock, parse_gdt, serialize_gdt};
