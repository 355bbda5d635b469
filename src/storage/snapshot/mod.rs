#![forbid(unsafe_code)]

//! Copy-on-write snapshot manager.
//!
//! Every special-file block that is dirtied in an epoch is first relocated to
//! a freshly allocated physical block, so the previous translation table keeps
//! pointing at intact data until the next one is durable. Each sync publishes
//! either a one-block extended table or a full base table into the other half
//! of the table region.

mod table;

use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info, warn};

use crate::primitives::bytes::BitVec;
use crate::primitives::concurrency::{ExclusiveGuard, LockSnapshot, TransactionGuard, TransactionLock};
use crate::primitives::io::BlockDevice;
use crate::storage::fsm::{AllocFlags, FreeFlags, FreeSpaceManager};
use crate::types::{Result, SpecialFile, VdfsError, Version, SPECIAL_FILE_COUNT};

pub use table::{BaseTable, ExtRecord, ExtTable, TableEntry, BASE_TABLE_MAGIC, EXT_TABLE_MAGIC};

/// Placement of the two table halves, each `[base table][extended slots]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub struct TableLayout {
    /// First block of half 0.
    pub region_start: u64,
    /// Blocks taken by one base table.
    pub base_blocks: u64,
    /// Extended-table slots per half.
    pub max_ext_tables: u32,
}

impl TableLayout {
    pub fn half_blocks(&self) -> u64 {
        self.base_blocks + u64::from(self.max_ext_tables)
    }

    pub fn half_start(&self, half: u8) -> u64 {
        self.region_start + u64::from(half) * self.half_blocks()
    }

    pub fn ext_slot(&self, half: u8, slot: u32) -> u64 {
        self.half_start(half) + self.base_blocks + u64::from(slot)
    }

    pub fn region_blocks(&self) -> u64 {
        2 * self.half_blocks()
    }
}

/// Static parameters of the snapshot manager.
#[derive(Clone, Debug)]
pub struct SnapshotConfig {
    pub layout: TableLayout,
    /// Logical blocks per special file.
    pub capacities: [u64; SPECIAL_FILE_COUNT],
    /// Blocks relocated together (one bnode for trees, one page for bitmaps).
    pub chunk_blocks: [u64; SPECIAL_FILE_COUNT],
    pub block_size: usize,
    pub total_blocks: u64,
    /// Reject tables without the expected magic.
    pub check_signature: bool,
}

impl SnapshotConfig {
    pub fn chunk_blocks(&self, object: SpecialFile) -> u64 {
        self.chunk_blocks[object.index()]
    }
}

/// Translation state recovered from the table region at mount.
#[derive(Debug, Clone)]
pub struct LoadedTables {
    base: BaseTable,
    active_half: u8,
    ext_written: u32,
    last: Version,
}

impl LoadedTables {
    /// Picks the newer valid base table and replays the contiguous run of
    /// extended tables after it.
    pub fn load(config: &SnapshotConfig, device: &dyn BlockDevice) -> Result<Self> {
        let layout = config.layout;
        let bs = config.block_size;
        let mut best: Option<(u8, BaseTable)> = None;
        for half in 0..2u8 {
            let mut buf = vec![0u8; layout.base_blocks as usize * bs];
            device.read_blocks(layout.half_start(half), &mut buf)?;
            match BaseTable::decode(&buf, config.capacities, config.check_signature) {
                Ok(table) => {
                    if best.as_ref().map_or(true, |(_, b)| table.version > b.version) {
                        best = Some((half, table));
                    }
                }
                Err(err) => debug!(target: "vdfs::snapshot", half, error = %err, "snapshot.base_invalid"),
            }
        }
        let (active_half, mut base) =
            best.ok_or(VdfsError::Corruption("no valid base translation table"))?;
        let mut last = base.version;
        let mut ext_written = 0;
        let mut buf = vec![0u8; bs];
        for slot in 0..layout.max_ext_tables {
            device.read_blocks(layout.ext_slot(active_half, slot), &mut buf)?;
            let Ok(ext) = ExtTable::decode(&buf, config.check_signature) else {
                break;
            };
            if !ext.version.follows(last) {
                if ext.version > last {
                    warn!(
                        target: "vdfs::snapshot",
                        slot,
                        last = %last,
                        found = %ext.version,
                        "snapshot.stale_ext_table"
                    );
                }
                break;
            }
            apply_records(&mut base, config, &ext.records, ext.version)?;
            last = ext.version;
            ext_written = slot + 1;
        }
        info!(
            target: "vdfs::snapshot",
            active_half,
            base = %base.version,
            last = %last,
            ext_tables = ext_written,
            "snapshot.load"
        );
        Ok(Self {
            base,
            active_half,
            ext_written,
            last,
        })
    }

    /// Newest durable generation.
    pub fn last_version(&self) -> Version {
        self.last
    }

    pub fn entry(&self, object: SpecialFile, index: u64) -> Option<TableEntry> {
        self.base.entry(object, index).copied()
    }

    pub fn active_half(&self) -> u8 {
        self.active_half
    }

    pub fn ext_tables(&self) -> u32 {
        self.ext_written
    }

    pub fn base(&self) -> &BaseTable {
        &self.base
    }
}

fn apply_records(
    base: &mut BaseTable,
    config: &SnapshotConfig,
    records: &[ExtRecord],
    version: Version,
) -> Result<()> {
    for rec in records {
        let chunk = config.chunk_blocks(rec.object);
        for off in 0..chunk {
            let entry = base
                .entry_mut(rec.object, rec.index + off)
                .ok_or(VdfsError::Corruption("extended record beyond object capacity"))?;
            entry.phys = rec.phys + off;
            entry.version = version;
        }
    }
    Ok(())
}

/// Result of [`SnapshotManager::add_chunk`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChunkMove {
    /// The chunk was already relocated this epoch.
    AlreadyMoved { phys: u64 },
    /// The chunk now lives at `new`; `old` is freed at the next commit.
    Relocated { old: Option<u64>, new: u64 },
}

/// What a commit wrote.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommitKind {
    /// Full table folded into `half`.
    Base { half: u8, version: Version },
    /// Delta appended at `slot` of the active half.
    Extended { slot: u32, version: Version },
}

/// Counter snapshot.
#[derive(Clone, Copy, Debug, serde::Serialize)]
pub struct SnapshotStats {
    pub epoch: Version,
    pub active_half: u8,
    pub ext_tables_written: u32,
    pub pending_records: usize,
    pub moved_blocks: u64,
    /// Blocks referenced by the last committed map.
    pub durable_blocks: u64,
    pub relocations: u64,
    pub commits: u64,
    pub folds: u64,
    pub locks: LockSnapshot,
}

struct TablesState {
    base: BaseTable,
    pending: Vec<ExtRecord>,
    use_base_table: bool,
    ext_written: u32,
    active_half: u8,
    epoch: Version,
    moved: BitVec,
    current: BitVec,
    next: BitVec,
    last_alloc: u64,
    relocations: u64,
    commits: u64,
    folds: u64,
}

/// Owner of the translation tables and the three volume-level locks.
///
/// Lock order: transaction, writeback, tables, then the allocator.
pub struct SnapshotManager {
    config: SnapshotConfig,
    device: Arc<dyn BlockDevice>,
    fsm: Arc<FreeSpaceManager>,
    transaction: TransactionLock,
    writeback: RwLock<()>,
    tables: RwLock<TablesState>,
}

impl SnapshotManager {
    /// Starts with an empty map; the first commit writes a base table.
    pub fn format(
        config: SnapshotConfig,
        device: Arc<dyn BlockDevice>,
        fsm: Arc<FreeSpaceManager>,
        epoch: Version,
    ) -> Self {
        let base = BaseTable::new(config.capacities);
        let total = config.total_blocks;
        let state = TablesState {
            base,
            pending: Vec::new(),
            use_base_table: true,
            ext_written: 0,
            active_half: 1,
            epoch,
            moved: BitVec::new(total),
            current: BitVec::new(total),
            next: BitVec::new(total),
            last_alloc: 0,
            relocations: 0,
            commits: 0,
            folds: 0,
        };
        Self::with_state(config, device, fsm, state)
    }

    /// Resumes from tables read at mount; `epoch` must be newer than any of them.
    pub fn from_loaded(
        config: SnapshotConfig,
        device: Arc<dyn BlockDevice>,
        fsm: Arc<FreeSpaceManager>,
        loaded: LoadedTables,
        epoch: Version,
    ) -> Result<Self> {
        if epoch <= loaded.last {
            return Err(VdfsError::Invalid("mount epoch does not advance past tables"));
        }
        let total = config.total_blocks;
        let mut current = BitVec::new(total);
        for (_, _, entry) in loaded.base.mapped() {
            if entry.phys >= total {
                return Err(VdfsError::Corruption("translation entry beyond volume end"));
            }
            current.set_range(entry.phys, 1);
        }
        let state = TablesState {
            base: loaded.base,
            pending: Vec::new(),
            use_base_table: false,
            ext_written: loaded.ext_written,
            active_half: loaded.active_half,
            epoch,
            moved: BitVec::new(total),
            next: current.clone(),
            current,
            last_alloc: 0,
            relocations: 0,
            commits: 0,
            folds: 0,
        };
        Ok(Self::with_state(config, device, fsm, state))
    }

    fn with_state(
        config: SnapshotConfig,
        device: Arc<dyn BlockDevice>,
        fsm: Arc<FreeSpaceManager>,
        state: TablesState,
    ) -> Self {
        Self {
            config,
            device,
            fsm,
            transaction: TransactionLock::new(),
            writeback: RwLock::new(()),
            tables: RwLock::new(state),
        }
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    /// Enters a metadata transaction (re-entrant per thread).
    pub fn start_transaction(&self) -> Result<TransactionGuard<'_>> {
        self.transaction.begin()
    }

    /// Waits for open transactions to finish and blocks new ones.
    pub fn lock_for_sync(&self) -> Result<ExclusiveGuard<'_>> {
        self.transaction.lock_exclusive()
    }

    /// Returns true if the calling thread is inside a transaction.
    pub fn in_transaction(&self) -> bool {
        self.transaction.held_by_current_thread()
    }

    pub fn writeback_shared(&self) -> RwLockReadGuard<'_, ()> {
        self.writeback.read()
    }

    pub fn writeback_exclusive(&self) -> RwLockWriteGuard<'_, ()> {
        self.writeback.write()
    }

    /// Current (uncommitted) generation.
    pub fn epoch(&self) -> Version {
        self.tables.read().epoch
    }

    /// Physical block of one logical block, `None` if never written.
    pub fn get_meta_iblock(&self, object: SpecialFile, index: u64) -> Result<Option<u64>> {
        Ok(self
            .chunk_location(object, index)?
            .filter(TableEntry::is_mapped)
            .map(|e| e.phys))
    }

    /// Table entry of one logical block, `None` if never written.
    pub fn chunk_location(&self, object: SpecialFile, index: u64) -> Result<Option<TableEntry>> {
        let st = self.tables.read();
        let entry = st
            .base
            .entry(object, index)
            .ok_or(VdfsError::Invalid("logical block beyond special file capacity"))?;
        Ok(Some(*entry).filter(TableEntry::is_mapped))
    }

    /// Returns true if `phys` was allocated by a relocation this epoch.
    pub fn is_moved(&self, phys: u64) -> bool {
        self.tables.read().moved.get(phys)
    }

    /// Returns true when the next commit has something to publish.
    pub fn has_pending_changes(&self) -> bool {
        let st = self.tables.read();
        st.use_base_table || !st.pending.is_empty()
    }

    /// Relocates the chunk starting at `index` unless it already moved this epoch.
    pub fn add_chunk(&self, object: SpecialFile, index: u64) -> Result<ChunkMove> {
        let chunk = self.config.chunk_blocks(object);
        if index % chunk != 0 {
            return Err(VdfsError::Bug("chunk index is not chunk aligned"));
        }
        let mut st = self.tables.write();
        let cur = st
            .base
            .entry(object, index)
            .ok_or(VdfsError::Invalid("logical block beyond special file capacity"))?
            .phys;
        if cur != 0 && st.moved.get(cur) {
            return Ok(ChunkMove::AlreadyMoved { phys: cur });
        }
        let flags = if chunk > 1 {
            AllocFlags::ALIGNED
        } else {
            AllocFlags::NONE
        };
        let hint = if cur != 0 { cur + chunk } else { st.last_alloc };
        let new = self.fsm.get_free_block(hint, chunk, flags)?;
        if cur != 0 {
            if let Err(err) = self.fsm.put_free_block(cur, chunk, FreeFlags::NONE) {
                self.fsm.put_free_block(new.start, new.len, FreeFlags::UNUSED)?;
                return Err(err);
            }
            st.next.clear_range(cur, chunk);
        }
        st.next.set_range(new.start, chunk);
        st.moved.set_range(new.start, chunk);
        st.last_alloc = new.end();
        let epoch = st.epoch;
        apply_records(
            &mut st.base,
            &self.config,
            &[ExtRecord {
                object,
                index,
                phys: new.start,
            }],
            epoch,
        )?;
        if st.pending.len() < ExtTable::capacity(self.config.block_size) {
            st.pending.push(ExtRecord {
                object,
                index,
                phys: new.start,
            });
        } else {
            st.use_base_table = true;
        }
        st.relocations += 1;
        debug!(
            target: "vdfs::snapshot",
            object = object.name(),
            index,
            old = cur,
            new = new.start,
            "snapshot.relocate"
        );
        Ok(ChunkMove::Relocated {
            old: (cur != 0).then_some(cur),
            new: new.start,
        })
    }

    /// Publishes this epoch's remappings and opens the next epoch.
    ///
    /// Must run under the sync lock after every relocated page is on disk.
    pub fn update_translation_tables(&self) -> Result<CommitKind> {
        if !self.transaction.held_exclusive_by_current_thread() {
            return Err(VdfsError::Bug("translation tables committed outside sync"));
        }
        let _writeback = self.writeback.write();
        let mut st = self.tables.write();
        let layout = self.config.layout;
        let bs = self.config.block_size;
        let version = st.epoch;
        let fold = st.use_base_table
            || st.ext_written >= layout.max_ext_tables
            || st.pending.len() > ExtTable::capacity(bs);
        let kind = if fold {
            let half = st.active_half ^ 1;
            st.base.version = version;
            let image = st.base.encode(bs);
            self.device.write_blocks(layout.half_start(half), &image)?;
            self.device.flush()?;
            st.active_half = half;
            st.ext_written = 0;
            st.folds += 1;
            CommitKind::Base { half, version }
        } else {
            let slot = st.ext_written;
            let ext = ExtTable {
                version,
                records: st.pending.clone(),
            };
            let image = ext.encode(bs)?;
            self.device.write_blocks(layout.ext_slot(st.active_half, slot), &image)?;
            self.device.flush()?;
            st.ext_written += 1;
            CommitKind::Extended { slot, version }
        };
        st.pending.clear();
        st.use_base_table = false;
        st.epoch = version.next_sync();
        st.moved.clear_all();
        st.current = st.next.clone();
        st.commits += 1;
        info!(target: "vdfs::snapshot", ?kind, "snapshot.commit");
        Ok(kind)
    }

    /// Every block referenced by the map must be allocated in the free-space bitmap.
    pub fn verify_against_fsm(&self) -> Result<()> {
        let st = self.tables.read();
        for block in st.next.iter_ones() {
            if !self.fsm.is_allocated(block) {
                return Err(VdfsError::Bug("mapped block marked free"));
            }
        }
        Ok(())
    }

    /// Mapped logical blocks as `(object, index, entry)`.
    pub fn mapped_blocks(&self) -> Vec<(SpecialFile, u64, TableEntry)> {
        self.tables.read().base.mapped().collect()
    }

    pub fn stats(&self) -> SnapshotStats {
        let st = self.tables.read();
        SnapshotStats {
            epoch: st.epoch,
            active_half: st.active_half,
            ext_tables_written: st.ext_written,
            pending_records: st.pending.len(),
            moved_blocks: st.moved.count_ones(),
            durable_blocks: st.current.count_ones(),
            relocations: st.relocations,
            commits: st.commits,
            folds: st.folds,
            locks: self.transaction.snapshot(),
        }
    }
}
