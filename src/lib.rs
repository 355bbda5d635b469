//! Flash-oriented metadata storage engine.
//!
//! Metadata lives in special files: a free-space bitmap, an inode-id bitmap,
//! and three B-trees (catalog, extents, xattr). Every modified block is
//! relocated copy-on-write and published atomically through translation
//! tables at the next sync.
//!
//! The layers, leaves first: [`types`], [`primitives`], [`storage`]
//! (free-space manager, snapshot manager, bnode cache, B-tree), [`volume`]
//! (format, mount, sync) and [`admin`] (offline inspection).

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod admin;
pub mod primitives;
pub mod storage;
pub mod types;
pub mod volume;

pub use types::{Result, SpecialFile, VdfsError, Version};
pub use volume::{FormatOptions, MountOptions, SyncOutcome, Volume};
