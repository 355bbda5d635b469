use std::fs;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use crate::primitives::io::FileDevice;
use crate::storage::FatalPolicy;
use crate::volume::{MountOptions, Superblock, Volume};

use crate::admin::error::{AdminError, Result};

/// Opens an existing image, sizing blocks from its superblock.
///
/// # Errors
///
/// Returns an error if the image does not exist or its first block does not
/// carry a plausible block size.
pub fn open_device(path: &Path, writable: bool) -> Result<Arc<FileDevice>> {
    if !path.exists() {
        return Err(AdminError::missing_image(path));
    }
    let mut prefix = [0u8; 16];
    fs::File::open(path)?.read_exact(&mut prefix)?;
    let block_size = Superblock::peek_block_size(&prefix)?;
    Ok(Arc::new(FileDevice::open(path, block_size, writable)?))
}

/// Mounts an image read-only for inspection.
///
/// Fatal errors never panic here; they are reported through the results of
/// the individual checks.
pub fn open_volume(path: &Path, opts: &MountOptions) -> Result<Volume> {
    let device = open_device(path, false)?;
    let mut opts = opts.clone();
    opts.read_only = true;
    opts.inject_errors = 0;
    opts.fatal_policy = FatalPolicy::ReadOnly;
    Ok(Volume::mount(device, opts)?)
}

pub(crate) fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}
