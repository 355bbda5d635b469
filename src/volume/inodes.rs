use parking_lot::Mutex;
use tracing::debug;

use crate::storage::fsm::BitmapFile;
use crate::types::{Result, VdfsError, Version};

/// Inode numbers below this are never handed out.
pub const FIRST_USER_INO: u64 = 16;

/// Allocator over the inode-id bitmap special file.
pub struct InodeBitmap {
    bitmap: Mutex<BitmapFile>,
}

impl InodeBitmap {
    pub fn new(bitmap: BitmapFile) -> Self {
        Self {
            bitmap: Mutex::new(bitmap),
        }
    }

    /// Takes the lowest free inode number.
    pub fn alloc_ino(&self) -> Result<u64> {
        let mut bitmap = self.bitmap.lock();
        let ino = bitmap.first_zero(FIRST_USER_INO).ok_or(VdfsError::NoSpace)?;
        bitmap.set_range(ino, 1)?;
        debug!(target: "vdfs::inodes", ino, "inode.alloc");
        Ok(ino)
    }

    /// Releases `ino`; freeing a free or reserved number is a bug.
    pub fn free_ino(&self, ino: u64) -> Result<()> {
        let mut bitmap = self.bitmap.lock();
        if ino < FIRST_USER_INO || ino >= bitmap.bit_count() {
            return Err(VdfsError::Bug("inode number outside allocatable range"));
        }
        bitmap.clear_range(ino, 1)?;
        debug!(target: "vdfs::inodes", ino, "inode.free");
        Ok(())
    }

    pub fn is_allocated(&self, ino: u64) -> bool {
        self.bitmap.lock().test(ino)
    }

    pub fn free_count(&self) -> u64 {
        self.bitmap.lock().count_zeros()
    }

    pub fn dirty_pages(&self) -> Vec<u64> {
        self.bitmap.lock().dirty_pages()
    }

    pub fn seal_page(&self, idx: u64, version: Version) -> Result<Vec<u8>> {
        self.bitmap.lock().seal_page(idx, version)
    }

    pub fn clear_dirty(&self, written: &[u64]) {
        self.bitmap.lock().clear_dirty(written);
    }
}
