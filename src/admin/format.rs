use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::primitives::io::FileDevice;
use crate::volume::{FormatOptions, Superblock, Volume};

use crate::admin::util::ensure_parent_dir;
use crate::admin::Result;

/// Summary of a freshly formatted image.
#[derive(Clone, Debug, Serialize)]
pub struct FormatReport {
    pub path: String,
    pub size_bytes: u64,
    /// First block available for data.
    pub first_data_block: u64,
    pub superblock: Superblock,
}

/// Creates (or truncates) an image file and formats it.
pub fn mkfs(path: impl AsRef<Path>, opts: &FormatOptions) -> Result<FormatReport> {
    let path = path.as_ref();
    ensure_parent_dir(path)?;
    let device = Arc::new(FileDevice::create(path, opts.block_size, opts.total_blocks)?);
    let superblock = Volume::format(device, opts)?;
    info!(target: "vdfs::admin", path = %path.display(), "admin.mkfs");
    Ok(FormatReport {
        path: path.display().to_string(),
        size_bytes: opts.total_blocks * opts.block_size as u64,
        first_data_block: superblock.first_data_block(),
        superblock,
    })
}
