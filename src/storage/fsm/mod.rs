#![forbid(unsafe_code)]

//! Free-space manager.
//!
//! Owns the free-space bitmap and two extent trees: `free_area` (reusable
//! now) and `next_free_area` (freed this epoch, reusable after the next
//! commit). Blocks that do not fit the trees' node cap are counted as
//! untracked and recovered by a rebuild from the bitmap.

mod bitmap;
mod extent;

use std::collections::BTreeSet;
use std::ops::BitOr;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::primitives::io::BlockDevice;
use crate::types::{Result, VdfsError};

pub use bitmap::{
    bits_per_page, pages_needed, validate_page, BitmapFile, FSM_BITMAP_MAGIC, INODE_BITMAP_MAGIC,
};
pub use extent::{ExtentTree, FreeExtent, MAX_ORDER};

/// Allocation flags for [`FreeSpaceManager::get_free_block`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct AllocFlags(u8);

impl AllocFlags {
    pub const NONE: AllocFlags = AllocFlags(0);
    /// Start the extent on a multiple of the bnode chunk size.
    pub const ALIGNED: AllocFlags = AllocFlags(1);
    /// Draw from blocks previously reserved with `reserve_blocks`.
    pub const DELAYED: AllocFlags = AllocFlags(1 << 1);
    /// Accept a shorter extent when no run is long enough.
    pub const PARTIAL: AllocFlags = AllocFlags(1 << 2);

    pub fn contains(self, other: AllocFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for AllocFlags {
    type Output = AllocFlags;
    fn bitor(self, rhs: Self) -> Self {
        AllocFlags(self.0 | rhs.0)
    }
}

/// Flags for [`FreeSpaceManager::put_free_block`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FreeFlags(u8);

impl FreeFlags {
    /// Deferred free: reusable after the next commit.
    pub const NONE: FreeFlags = FreeFlags(0);
    /// Return blocks to the reservation budget immediately.
    pub const RESERVED: FreeFlags = FreeFlags(1);
    /// Blocks were never referenced by durable metadata; reusable immediately.
    pub const UNUSED: FreeFlags = FreeFlags(1 << 1);

    pub fn contains(self, other: FreeFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for FreeFlags {
    type Output = FreeFlags;
    fn bitor(self, rhs: Self) -> Self {
        FreeFlags(self.0 | rhs.0)
    }
}

/// Static parameters of the managed region.
#[derive(Clone, Debug)]
pub struct FsmConfig {
    /// Blocks on the volume; the bitmap has one bit per block.
    pub total_blocks: u64,
    /// First block the allocator may hand out.
    pub first_data_block: u64,
    /// Blocks per erase block, for discard bookkeeping.
    pub erase_block_blocks: u64,
    /// Alignment for `ALIGNED` requests.
    pub align_blocks: u64,
    /// Node cap for each extent tree.
    pub max_extents: usize,
}

/// Counter snapshot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct FsmStats {
    /// Free blocks not promised to a reservation.
    pub free_blocks: u64,
    /// Free blocks promised to delayed allocations.
    pub reserved_blocks: u64,
    /// Free blocks outside `free_area`.
    pub untracked_blocks: u64,
    /// Blocks freed this epoch.
    pub next_free_blocks: u64,
    /// Blocks freed this epoch outside `next_free_area`.
    pub untracked_next_free: u64,
    /// Extents in `free_area`.
    pub tracked_extents: usize,
    /// Extents in `next_free_area`.
    pub pending_extents: usize,
    /// Set bits in the data area.
    pub allocated_blocks: u64,
    /// Completed rebuilds from the bitmap.
    pub rebuilds: u64,
}

struct FsmState {
    free_area: ExtentTree,
    next_free_area: ExtentTree,
    free_blocks: u64,
    reserved_blocks: u64,
    untracked_blocks: u64,
    next_free_blocks: u64,
    untracked_next_free: u64,
    bitmap: BitmapFile,
    erase_live: Vec<u32>,
    pending_discard: BTreeSet<u64>,
    rebuilds: u64,
}

/// Block allocator over the volume's data area.
pub struct FreeSpaceManager {
    config: FsmConfig,
    device: Arc<dyn BlockDevice>,
    state: Mutex<FsmState>,
}

impl FreeSpaceManager {
    /// Builds the allocator from a loaded bitmap.
    ///
    /// Blocks below `first_data_block` must already be set.
    pub fn new(config: FsmConfig, device: Arc<dyn BlockDevice>, bitmap: BitmapFile) -> Result<Self> {
        if config.align_blocks == 0 || config.erase_block_blocks == 0 {
            return Err(VdfsError::Invalid("fsm geometry must be non-zero"));
        }
        if bitmap.bit_count() != config.total_blocks {
            return Err(VdfsError::Corruption("fsm bitmap size does not match volume"));
        }
        if (0..config.first_data_block).any(|b| !bitmap.test(b)) {
            return Err(VdfsError::Corruption("system area marked free in fsm bitmap"));
        }
        let erase_blocks = config.total_blocks.div_ceil(config.erase_block_blocks) as usize;
        let mut erase_live = vec![0u32; erase_blocks];
        for block in config.first_data_block..config.total_blocks {
            if bitmap.test(block) {
                erase_live[(block / config.erase_block_blocks) as usize] += 1;
            }
        }
        let free_blocks = bitmap.count_zeros();
        let state = FsmState {
            free_area: ExtentTree::new(config.max_extents),
            next_free_area: ExtentTree::new(config.max_extents),
            free_blocks,
            reserved_blocks: 0,
            untracked_blocks: 0,
            next_free_blocks: 0,
            untracked_next_free: 0,
            bitmap,
            erase_live,
            pending_discard: BTreeSet::new(),
            rebuilds: 0,
        };
        let fsm = Self {
            config,
            device,
            state: Mutex::new(state),
        };
        {
            let mut st = fsm.state.lock();
            fsm.rebuild_locked(&mut st)?;
        }
        info!(
            target: "vdfs::fsm",
            free_blocks,
            total_blocks = fsm.config.total_blocks,
            "fsm.init"
        );
        Ok(fsm)
    }

    pub fn config(&self) -> &FsmConfig {
        &self.config
    }

    /// Allocates a contiguous extent.
    ///
    /// Tries the extent holding `hint`, then size-class buckets, then a
    /// rebuild when untracked blocks may be recoverable.
    pub fn get_free_block(&self, hint: u64, len: u64, flags: AllocFlags) -> Result<FreeExtent> {
        if len == 0 {
            return Err(VdfsError::Invalid("zero-length allocation"));
        }
        let delayed = flags.contains(AllocFlags::DELAYED);
        let aligned = flags.contains(AllocFlags::ALIGNED) && self.config.align_blocks > 1;
        let partial = flags.contains(AllocFlags::PARTIAL) && !aligned;
        let mut st = self.state.lock();
        let budget = if delayed {
            st.reserved_blocks
        } else {
            st.free_blocks
        };
        if budget == 0 || (!partial && budget < len) {
            return Err(VdfsError::NoSpace);
        }
        let want = if partial { len.min(budget) } else { len };
        let need = if aligned {
            want + self.config.align_blocks - 1
        } else {
            want
        };
        let mut rebuilt = false;
        let (start, take) = loop {
            if let Some(found) = Self::pick(&st, hint, need, partial) {
                break found;
            }
            if rebuilt || st.untracked_blocks == 0 || st.untracked_next_free > 0 {
                return Err(VdfsError::NoSpace);
            }
            self.rebuild_locked(&mut st)?;
            rebuilt = true;
        };
        let dropped = st.free_area.carve(start, take)?;
        st.untracked_blocks += dropped;
        let result = if aligned {
            let first = start.next_multiple_of(self.config.align_blocks);
            // the padding on both sides stays free but leaves the tree
            st.untracked_blocks += take - want;
            FreeExtent::new(first, want)
        } else {
            FreeExtent::new(start, take.min(want))
        };
        st.bitmap.set_range(result.start, result.len)?;
        for block in result.start..result.end() {
            let eb = (block / self.config.erase_block_blocks) as usize;
            st.erase_live[eb] += 1;
            st.pending_discard.remove(&(eb as u64));
        }
        if delayed {
            st.reserved_blocks -= result.len;
        } else {
            st.free_blocks -= result.len;
        }
        debug!(
            target: "vdfs::fsm",
            start = result.start,
            len = result.len,
            hint,
            "fsm.alloc"
        );
        Ok(result)
    }

    fn pick(st: &FsmState, hint: u64, need: u64, partial: bool) -> Option<(u64, u64)> {
        if let Some(ext) = st.free_area.containing(hint) {
            if ext.end() - hint >= need {
                return Some((hint, need));
            }
            if ext.len >= need {
                return Some((ext.start, need));
            }
        }
        st.free_area
            .find(need, partial)
            .map(|ext| (ext.start, ext.len.min(need)))
    }

    /// Releases blocks.
    ///
    /// Default frees are deferred to the next commit; `UNUSED` and `RESERVED`
    /// frees are reusable at once.
    pub fn put_free_block(&self, start: u64, len: u64, flags: FreeFlags) -> Result<()> {
        if len == 0 {
            return Ok(());
        }
        if start < self.config.first_data_block || start + len > self.config.total_blocks {
            return Err(VdfsError::Bug("free of block outside data area"));
        }
        let mut st = self.state.lock();
        let ebb = self.config.erase_block_blocks;
        let end = start + len;
        let spans: Vec<(usize, u32)> = (start / ebb..end.div_ceil(ebb))
            .map(|eb| {
                let covered = end.min((eb + 1) * ebb) - start.max(eb * ebb);
                (eb as usize, covered as u32)
            })
            .collect();
        if spans.iter().any(|&(eb, covered)| st.erase_live[eb] < covered) {
            return Err(VdfsError::Bug("erase block live count below freed blocks"));
        }
        st.bitmap.clear_range(start, len)?;
        for (eb, covered) in spans {
            st.erase_live[eb] -= covered;
            if st.erase_live[eb] == 0 {
                st.pending_discard.insert(eb as u64);
            }
        }
        if flags.contains(FreeFlags::RESERVED) || flags.contains(FreeFlags::UNUSED) {
            if !st.free_area.insert(start, len)? {
                st.untracked_blocks += len;
            }
            if flags.contains(FreeFlags::RESERVED) {
                st.reserved_blocks += len;
            } else {
                st.free_blocks += len;
            }
        } else {
            if !st.next_free_area.insert(start, len)? {
                st.untracked_next_free += len;
            }
            st.next_free_blocks += len;
        }
        debug!(target: "vdfs::fsm", start, len, flags = flags.0, "fsm.free");
        Ok(())
    }

    /// Moves blocks promised to delayed allocation out of the free budget.
    pub fn reserve_blocks(&self, count: u64) -> Result<()> {
        let mut st = self.state.lock();
        if st.free_blocks < count {
            return Err(VdfsError::NoSpace);
        }
        st.free_blocks -= count;
        st.reserved_blocks += count;
        Ok(())
    }

    /// Returns unused reservation to the free budget.
    pub fn release_reservation(&self, count: u64) -> Result<()> {
        let mut st = self.state.lock();
        if st.reserved_blocks < count {
            return Err(VdfsError::Bug("releasing more blocks than reserved"));
        }
        st.reserved_blocks -= count;
        st.free_blocks += count;
        Ok(())
    }

    /// Folds this epoch's frees into the reusable pool.
    ///
    /// Called after the translation tables are durable.
    pub fn commit_free_space(&self) -> Result<()> {
        let discards = {
            let mut st = self.state.lock();
            for ext in st.next_free_area.drain() {
                if !st.free_area.insert(ext.start, ext.len)? {
                    st.untracked_blocks += ext.len;
                }
            }
            st.free_blocks += st.next_free_blocks;
            st.untracked_blocks += st.untracked_next_free;
            st.next_free_blocks = 0;
            st.untracked_next_free = 0;
            let ready: Vec<u64> = st
                .pending_discard
                .iter()
                .copied()
                .filter(|&eb| st.erase_live[eb as usize] == 0)
                .collect();
            st.pending_discard.clear();
            ready
        };
        let eb_len = self.config.erase_block_blocks;
        for eb in discards {
            let start = (eb * eb_len).max(self.config.first_data_block);
            let end = ((eb + 1) * eb_len).min(self.config.total_blocks);
            if start >= end {
                continue;
            }
            if let Err(err) = self.device.discard(start, end - start) {
                warn!(target: "vdfs::fsm", erase_block = eb, error = %err, "fsm.discard_failed");
            }
        }
        debug!(target: "vdfs::fsm", "fsm.commit");
        Ok(())
    }

    /// Regenerates `free_area` from the bitmap.
    ///
    /// Refused while blocks freed this epoch are untracked, since they cannot
    /// be told apart from reusable zero bits.
    pub fn rebuild_tree(&self) -> Result<()> {
        let mut st = self.state.lock();
        self.rebuild_locked(&mut st)
    }

    fn rebuild_locked(&self, st: &mut FsmState) -> Result<()> {
        if st.untracked_next_free > 0 {
            return Err(VdfsError::NoSpace);
        }
        st.free_area.clear();
        let mut reusable = 0u64;
        let mut untracked = 0u64;
        for (start, len) in st.bitmap.zero_runs() {
            for piece in st.next_free_area.uncovered(start, len) {
                reusable += piece.len;
                if !st.free_area.insert(piece.start, piece.len)? {
                    untracked += piece.len;
                }
            }
        }
        if reusable != st.free_blocks + st.reserved_blocks {
            warn!(
                target: "vdfs::fsm",
                reusable,
                free = st.free_blocks,
                reserved = st.reserved_blocks,
                "fsm.rebuild_mismatch"
            );
            return Err(VdfsError::Bug("fsm counters disagree with bitmap"));
        }
        st.untracked_blocks = untracked;
        st.rebuilds += 1;
        debug!(
            target: "vdfs::fsm",
            extents = st.free_area.len(),
            untracked,
            "fsm.rebuild"
        );
        Ok(())
    }

    /// Returns true if `block` is marked in use.
    pub fn is_allocated(&self, block: u64) -> bool {
        self.state.lock().bitmap.test(block)
    }

    /// Free blocks not reserved.
    pub fn free_blocks(&self) -> u64 {
        self.state.lock().free_blocks
    }

    pub fn reserved_blocks(&self) -> u64 {
        self.state.lock().reserved_blocks
    }

    pub fn stats(&self) -> FsmStats {
        let st = self.state.lock();
        let data_blocks = self.config.total_blocks - self.config.first_data_block;
        let zeros = st.bitmap.count_zeros();
        FsmStats {
            free_blocks: st.free_blocks,
            reserved_blocks: st.reserved_blocks,
            untracked_blocks: st.untracked_blocks,
            next_free_blocks: st.next_free_blocks,
            untracked_next_free: st.untracked_next_free,
            tracked_extents: st.free_area.len(),
            pending_extents: st.next_free_area.len(),
            allocated_blocks: data_blocks - zeros,
            rebuilds: st.rebuilds,
        }
    }

    /// Runs `f` against the bitmap under the manager lock.
    pub fn with_bitmap<R>(&self, f: impl FnOnce(&mut BitmapFile) -> R) -> R {
        f(&mut self.state.lock().bitmap)
    }

    /// Cross-checks counters, trees, and bitmap.
    pub fn check_consistency(&self) -> Result<()> {
        let st = self.state.lock();
        let data_blocks = self.config.total_blocks - self.config.first_data_block;
        let allocated = data_blocks - st.bitmap.count_zeros();
        if st.free_blocks + st.reserved_blocks + st.next_free_blocks + allocated != data_blocks {
            return Err(VdfsError::Bug("fsm block conservation violated"));
        }
        if st.free_area.total_blocks() + st.untracked_blocks != st.free_blocks + st.reserved_blocks {
            return Err(VdfsError::Bug("free_area does not cover free blocks"));
        }
        if st.next_free_area.total_blocks() + st.untracked_next_free != st.next_free_blocks {
            return Err(VdfsError::Bug("next_free_area does not cover pending frees"));
        }
        for ext in st.free_area.iter().chain(st.next_free_area.iter()) {
            if (ext.start..ext.end()).any(|b| st.bitmap.test(b)) {
                return Err(VdfsError::Bug("tracked free extent marked allocated"));
            }
        }
        for ext in st.next_free_area.iter() {
            if st.free_area.uncovered(ext.start, ext.len) != vec![ext] {
                return Err(VdfsError::Bug("free areas overlap"));
            }
        }
        Ok(())
    }
}
