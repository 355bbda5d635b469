//! Metadata storage engine.
//!
//! Free-space management, copy-on-write translation tables, the bnode cache,
//! and the B-trees built on top of it.

use std::sync::Arc;

use crate::primitives::io::BlockDevice;

/// Bnode cache: ref-counted handles over per-tree chunk caches.
pub mod bnode;

/// B-tree operations over bnodes.
pub mod btree;

/// Fatal-error handling policy.
pub mod fatal;

/// Free-space manager and paged bitmaps.
pub mod fsm;

/// Copy-on-write translation tables and the volume locks.
pub mod snapshot;

pub use fatal::{ErrorHandler, FatalPolicy};

use snapshot::SnapshotManager;

/// Shared services every tree's bnode store needs.
pub struct MetaContext {
    pub device: Arc<dyn BlockDevice>,
    pub snapshot: Arc<SnapshotManager>,
    pub errors: Arc<ErrorHandler>,
    /// Extra read attempts after a validation failure.
    pub validation_retries: u32,
    /// Clean chunks kept per tree.
    pub cache_chunks: usize,
}
