use std::sync::atomic::Ordering;

use tracing::{debug, info};

use super::Volume;
use crate::storage::snapshot::{ChunkMove, CommitKind};
use crate::types::{Result, SpecialFile, VdfsError, Version};

/// Result of one sync pass.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub enum SyncOutcome {
    /// Nothing was dirty.
    Clean,
    /// A new generation was published.
    Committed {
        kind: CommitKind,
        /// Tree chunks written.
        chunks: usize,
        /// Bitmap pages written.
        bitmap_pages: usize,
    },
}

impl Volume {
    /// Writes every dirty chunk and bitmap page at its relocated address,
    /// then publishes the translation tables and opens the next epoch.
    ///
    /// Runs with the transaction lock held exclusively. A failed pass leaves
    /// the dirty state in place so the next sync can retry it.
    pub fn sync(&self) -> Result<SyncOutcome> {
        self.errors.check_writable()?;
        let _sync = self.snapshot.lock_for_sync()?;
        let outcome = self.sync_locked();
        self.errors.check(outcome)
    }

    fn sync_locked(&self) -> Result<SyncOutcome> {
        let snap = &self.snapshot;
        let version = snap.epoch();

        // Relocating a bitmap page allocates blocks, which dirties bitmap
        // pages again; a page moves at most once per epoch.
        loop {
            let mut moved = false;
            for (object, pages) in self.dirty_bitmap_pages() {
                for idx in pages {
                    if let ChunkMove::Relocated { .. } = snap.add_chunk(object, idx)? {
                        moved = true;
                    }
                }
            }
            if !moved {
                break;
            }
        }

        let bitmap_pages = self.dirty_bitmap_pages();
        let chunks: Vec<_> = self.trees.iter().map(|t| t.store().dirty_chunks()).collect();
        let chunk_count: usize = chunks.iter().map(Vec::len).sum();
        let page_count: usize = bitmap_pages.iter().map(|(_, p)| p.len()).sum();
        if chunk_count == 0 && page_count == 0 && !snap.has_pending_changes() {
            debug!(target: "vdfs::volume", "volume.sync_clean");
            return Ok(SyncOutcome::Clean);
        }

        {
            let _writeback = snap.writeback_exclusive();
            for (tree, dirty) in self.trees.iter().zip(&chunks) {
                for chunk in dirty {
                    tree.store().write_chunk(chunk, version)?;
                }
            }
            for (object, pages) in &bitmap_pages {
                for &idx in pages {
                    self.write_bitmap_page(*object, idx, version)?;
                }
            }
        }
        self.device.flush()?;

        let kind = snap.update_translation_tables()?;
        self.fsm.commit_free_space()?;

        for (object, pages) in &bitmap_pages {
            match object {
                SpecialFile::FreeSpaceBitmap => self.fsm.with_bitmap(|b| b.clear_dirty(pages)),
                _ => self.inodes.clear_dirty(pages),
            }
        }
        for (tree, dirty) in self.trees.iter().zip(chunks) {
            tree.store().clear_dirty(dirty);
        }
        self.syncs.fetch_add(1, Ordering::Relaxed);
        info!(
            target: "vdfs::volume",
            version = %version,
            chunks = chunk_count,
            bitmap_pages = page_count,
            "volume.sync"
        );
        Ok(SyncOutcome::Committed {
            kind,
            chunks: chunk_count,
            bitmap_pages: page_count,
        })
    }

    fn dirty_bitmap_pages(&self) -> [(SpecialFile, Vec<u64>); 2] {
        [
            (
                SpecialFile::FreeSpaceBitmap,
                self.fsm.with_bitmap(|b| b.dirty_pages()),
            ),
            (SpecialFile::InodeBitmap, self.inodes.dirty_pages()),
        ]
    }

    fn write_bitmap_page(&self, object: SpecialFile, idx: u64, version: Version) -> Result<()> {
        let entry = self
            .snapshot
            .chunk_location(object, idx)?
            .ok_or(VdfsError::Bug("dirty bitmap page has no mapping"))?;
        if entry.version != version {
            return Err(VdfsError::Bug("dirty bitmap page was not relocated this epoch"));
        }
        let image = match object {
            SpecialFile::FreeSpaceBitmap => self.fsm.with_bitmap(|b| b.seal_page(idx, version))?,
            _ => self.inodes.seal_page(idx, version)?,
        };
        self.device.write_blocks(entry.phys, &image)
    }
}
