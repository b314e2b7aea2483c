#![forbid(unsafe_code)]
//! Error types for VaultFS.
//!
//! # Error Taxonomy
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `vfs-types` | Byte-level decode failures in on-disk records |
//! | Runtime | `VfsError` | `vfs-error` (this crate) | Errors returned by every storage-engine operation |
//!
//! `vfs-error` does not depend on `vfs-types`. Crates that decode on-disk
//! records convert `ParseError` themselves: live metadata failures become
//! `Corruption` with the offending block, mount-time failures become
//! `Format`.
//!
//! ## errno Mapping
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error, else `EIO` |
//! | `Corruption` | `EIO` |
//! | `Format`, `InvalidGeometry`, `InvalidArgument` | `EINVAL` |
//! | `NoSpace`, `DirectoryFull` | `ENOSPC` |
//! | `NotFound` | `ENOENT` |
//! | `NameTooLong` | `ENAMETOOLONG` |
//! | `Exists` | `EEXIST` |
//! | `NotDirectory` | `ENOTDIR` |
//! | `IsDirectory` | `EISDIR` |
//! | `NotEmpty` | `ENOTEMPTY` |
//! | `PermissionDenied` | `EACCES` |

use thiserror::Error;

/// Unified error type for all VaultFS operations.
#[derive(Debug, Error)]
pub enum VfsError {
    /// Block read/write failure, propagated verbatim.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Unrecoverable metadata damage at a known block.
    ///
    /// Raised for extent-node magic mismatches, depth mismatches, bitmap
    /// state that contradicts the group descriptor counts, and double frees.
    /// Callers abort the enclosing operation; no repair is attempted.
    #[error("corrupt metadata at block {block}: {detail}")]
    Corruption { block: u64, detail: String },

    /// The image is not a VaultFS filesystem or is structurally invalid.
    #[error("invalid on-disk format: {0}")]
    Format(String),

    /// Geometry parameters are out of the supported range.
    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    /// No free blocks or inodes available.
    #[error("no space left on device")]
    NoSpace,

    /// A directory reached its maximum record count.
    #[error("directory is full")]
    DirectoryFull,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("name too long")]
    NameTooLong,

    /// Unsupported mode bits, bad protection string, or a malformed name.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("file exists")]
    Exists,

    #[error("not a directory")]
    NotDirectory,

    #[error("is a directory")]
    IsDirectory,

    #[error("directory not empty")]
    NotEmpty,

    /// The protection mode or commit state forbids the write.
    #[error("permission denied")]
    PermissionDenied,
}

impl VfsError {
    /// Convert this error into a POSIX errno.
    ///
    /// The match is exhaustive; a new variant fails to compile until it has
    /// an errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Corruption { .. } => libc::EIO,
            Self::Format(_) | Self::InvalidGeometry(_) | Self::InvalidArgument(_) => libc::EINVAL,
            Self::NoSpace | Self::DirectoryFull => libc::ENOSPC,
            Self::NotFound(_) => libc::ENOENT,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::Exists => libc::EEXIST,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::PermissionDenied => libc::EACCES,
        }
    }

    /// Shorthand for a corruption error at `block`.
    pub fn corruption(block: u64, detail: impl Into<String>) -> Self {
        Self::Corruption {
            block,
            detail: detail.into(),
        }
    }

    /// Whether the error signals on-disk damage rather than a caller mistake
    /// or resource exhaustion.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::Corruption { .. })
    }
}

/// Result alias using `VfsError`.
pub type Result<T> = std::result::Result<T, VfsError>;
