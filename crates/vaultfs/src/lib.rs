#![forbid(unsafe_code)]
//! VaultFS public API facade.
//!
//! Re-exports the mounted-filesystem API from `vfs-core`. Downstream
//! consumers (the CLI, host adapters) depend on this crate only.

pub use vfs_core::*;
