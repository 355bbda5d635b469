#![forbid(unsafe_code)]

//! Identifiers, version stamps, and the crate-wide error type.

pub mod checksum;

use std::fmt;
use std::io;

pub use checksum::{crc32, seal_crc32, verify_crc32};

/// Physical block number on the backing device.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct BlockNo(pub u64);

/// Identifier of a bnode inside one tree. Id 0 is the head node.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct NodeId(pub u32);

impl NodeId {
    /// The head (metadata) node of every tree.
    pub const HEAD: NodeId = NodeId(0);

    /// Returns true for the head node.
    pub const fn is_head(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generation stamp written into metadata pages and translation tables.
///
/// Ordering is lexicographic on `(mount_count, sync_count)`.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default, serde::Serialize)]
pub struct Version {
    /// Number of read-write mounts of the volume.
    pub mount_count: u32,
    /// Number of translation-table commits within the mount.
    pub sync_count: u32,
}

impl Version {
    /// Creates a version stamp.
    pub const fn new(mount_count: u32, sync_count: u32) -> Self {
        Self {
            mount_count,
            sync_count,
        }
    }

    /// Returns true when `self` is the generation published directly after `prev`.
    ///
    /// Within a mount the sync count advances by one; a later mount restarts at zero.
    pub fn follows(self, prev: Version) -> bool {
        (self.mount_count == prev.mount_count
            && prev.sync_count.checked_add(1) == Some(self.sync_count))
            || (self.mount_count > prev.mount_count && self.sync_count == 0)
    }

    /// The generation after this one within the same mount.
    pub fn next_sync(self) -> Self {
        Self::new(self.mount_count, self.sync_count.wrapping_add(1))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.mount_count, self.sync_count)
    }
}

/// Number of special files tracked by the translation table.
pub const SPECIAL_FILE_COUNT: usize = 5;

/// Internal metadata objects whose pages are remapped through the translation table.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd, serde::Serialize)]
pub enum SpecialFile {
    /// Free-space bitmap (`"fsmb"` pages).
    #[serde(rename = "fsm_bitmap")]
    FreeSpaceBitmap = 0,
    /// Inode-id bitmap (`"inob"` pages).
    #[serde(rename = "inode_bitmap")]
    InodeBitmap = 1,
    /// Catalog B-tree.
    #[serde(rename = "catalog")]
    CatalogTree = 2,
    /// Extents-overflow B-tree.
    #[serde(rename = "extents")]
    ExtentsTree = 3,
    /// Extended-attribute B-tree.
    #[serde(rename = "xattr")]
    XattrTree = 4,
}

impl SpecialFile {
    /// Every special file in translation-table order.
    pub const ALL: [SpecialFile; SPECIAL_FILE_COUNT] = [
        SpecialFile::FreeSpaceBitmap,
        SpecialFile::InodeBitmap,
        SpecialFile::CatalogTree,
        SpecialFile::ExtentsTree,
        SpecialFile::XattrTree,
    ];

    /// Position in per-object arrays.
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Decodes an on-disk object id.
    pub fn from_raw(value: u64) -> Result<Self> {
        match value {
            0 => Ok(SpecialFile::FreeSpaceBitmap),
            1 => Ok(SpecialFile::InodeBitmap),
            2 => Ok(SpecialFile::CatalogTree),
            3 => Ok(SpecialFile::ExtentsTree),
            4 => Ok(SpecialFile::XattrTree),
            _ => Err(VdfsError::Corruption("unknown special file id")),
        }
    }

    /// Returns true for objects stored as B-trees of multi-block bnodes.
    pub const fn is_tree(self) -> bool {
        matches!(
            self,
            SpecialFile::CatalogTree | SpecialFile::ExtentsTree | SpecialFile::XattrTree
        )
    }

    /// Short stable name used in logs and reports.
    pub const fn name(self) -> &'static str {
        match self {
            SpecialFile::FreeSpaceBitmap => "fsm_bitmap",
            SpecialFile::InodeBitmap => "inode_bitmap",
            SpecialFile::CatalogTree => "catalog",
            SpecialFile::ExtentsTree => "extents",
            SpecialFile::XattrTree => "xattr",
        }
    }
}

impl fmt::Display for SpecialFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for SpecialFile {
    type Err = VdfsError;

    fn from_str(s: &str) -> Result<Self> {
        SpecialFile::ALL
            .into_iter()
            .find(|obj| obj.name() == s)
            .ok_or(VdfsError::Invalid("unknown special file name"))
    }
}

/// Errors surfaced by the storage engine.
#[derive(thiserror::Error, Debug)]
pub enum VdfsError {
    /// Device read or write failure.
    #[error("IO: {0}")]
    Io(#[from] io::Error),
    /// On-disk data failed validation (magic, checksum, version stamp).
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// A caller broke an engine invariant (ref-count misuse, double free, missing lock).
    #[error("invariant violated: {0}")]
    Bug(&'static str),
    /// Bad argument or configuration.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// The requested id or key does not exist.
    #[error("not found")]
    NotFound,
    /// The key being inserted already exists.
    #[error("already exists")]
    Exists,
    /// Free blocks or free node ids are exhausted.
    #[error("no space left")]
    NoSpace,
    /// The volume is read-only (mounted `ro` or flipped after a fatal error).
    #[error("read-only volume")]
    ReadOnly,
}

impl VdfsError {
    /// Integrity and logic errors escalate to the fatal-error handler.
    pub fn is_fatal(&self) -> bool {
        matches!(self, VdfsError::Corruption(_) | VdfsError::Bug(_))
    }

    /// Produces an equivalent error for a second observer of the same failure.
    pub fn duplicate(&self) -> VdfsError {
        match self {
            VdfsError::Io(err) => VdfsError::Io(io::Error::new(err.kind(), err.to_string())),
            VdfsError::Corruption(msg) => VdfsError::Corruption(msg),
            VdfsError::Bug(msg) => VdfsError::Bug(msg),
            VdfsError::Invalid(msg) => VdfsError::Invalid(msg),
            VdfsError::NotFound => VdfsError::NotFound,
            VdfsError::Exists => VdfsError::Exists,
            VdfsError::NoSpace => VdfsError::NoSpace,
            VdfsError::ReadOnly => VdfsError::ReadOnly,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, VdfsError>;
