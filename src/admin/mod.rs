#![forbid(unsafe_code)]

//! Offline maintenance of volume images.
//!
//! Everything here except [`mkfs`] works on a read-only mount.

mod error;
mod format;
mod info;
mod util;
mod verify;

/// Error types for administrative operations.
pub use error::{AdminError, Result};

/// Image creation.
pub use format::{mkfs, FormatReport};

/// Geometry, counters and raw dumps.
pub use info::{dump_node, dump_table, info, InfoReport, NodeDump, TableDump, TableRow};

/// Metadata integrity verification.
pub use verify::{
    verify, verify_volume, TreeSummary, VerifyCounts, VerifyFinding, VerifyLevel, VerifyReport,
    VerifySeverity,
};

pub use util::{open_device, open_volume};
