//! Mounted volume: owns every engine component and wires them together.
//!
//! A volume is created by [`Volume::format`] and opened by [`Volume::mount`].
//! All metadata changes happen inside transactions and become durable at the
//! next [`Volume::sync`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::primitives::concurrency::TransactionGuard;
use crate::primitives::io::{BlockDevice, FaultyDevice};
use crate::storage::bnode::{BnodeStats, NodeStore};
use crate::storage::btree::{bytewise, BTree, BTreeStatsSnapshot};
use crate::storage::fsm::{
    pages_needed, AllocFlags, BitmapFile, FreeExtent, FreeFlags, FreeSpaceManager, FsmConfig,
    FsmStats, FSM_BITMAP_MAGIC, INODE_BITMAP_MAGIC,
};
use crate::storage::snapshot::{BaseTable, LoadedTables, SnapshotManager, SnapshotStats, TableEntry};
use crate::storage::{ErrorHandler, MetaContext};
use crate::types::{Result, SpecialFile, VdfsError, Version, SPECIAL_FILE_COUNT};

mod inodes;
mod options;
mod superblock;
mod sync;

pub use inodes::{InodeBitmap, FIRST_USER_INO};
pub use options::{FormatOptions, MountOptions};
pub use superblock::{
    Superblock, FORMAT_VERSION, MIN_BLOCK_SIZE, SUPERBLOCK_COPIES, SUPERBLOCK_MAGIC,
};
pub use sync::SyncOutcome;

/// Tree special files in the order the volume holds them.
pub const TREES: [SpecialFile; 3] = [
    SpecialFile::CatalogTree,
    SpecialFile::ExtentsTree,
    SpecialFile::XattrTree,
];

/// Per-tree counters.
#[derive(Clone, Debug, serde::Serialize)]
pub struct TreeStats {
    pub name: &'static str,
    pub height: u16,
    pub bnode: BnodeStats,
    pub btree: BTreeStatsSnapshot,
}

/// Point-in-time view of the whole volume.
#[derive(Clone, Debug, serde::Serialize)]
pub struct VolumeStats {
    pub superblock: Superblock,
    pub read_only: bool,
    pub fatal_errors: u64,
    pub syncs: u64,
    pub free_inodes: u64,
    pub fsm: FsmStats,
    pub snapshot: SnapshotStats,
    pub trees: Vec<TreeStats>,
}

/// A formatted volume with its metadata engine running.
pub struct Volume {
    sb: Superblock,
    options: MountOptions,
    faulty: Arc<FaultyDevice>,
    device: Arc<dyn BlockDevice>,
    fsm: Arc<FreeSpaceManager>,
    snapshot: Arc<SnapshotManager>,
    errors: Arc<ErrorHandler>,
    ctx: Arc<MetaContext>,
    inodes: InodeBitmap,
    trees: [BTree; 3],
    syncs: AtomicU64,
}

impl Volume {
    /// Lays out an empty volume on `device` and commits it with a first sync.
    pub fn format(device: Arc<dyn BlockDevice>, opts: &FormatOptions) -> Result<Superblock> {
        let sb = geometry(device.as_ref(), opts)?;
        let bs = sb.block_size as usize;
        let zero = vec![0u8; bs];
        for block in sb.tables_start..sb.first_data_block() {
            device.write_blocks(block, &zero)?;
        }
        sb.write(device.as_ref())?;

        let mut fsm_bitmap = BitmapFile::create(FSM_BITMAP_MAGIC, bs, sb.total_blocks);
        fsm_bitmap.set_range(0, sb.first_data_block())?;
        let mut ino_bitmap = BitmapFile::create(INODE_BITMAP_MAGIC, bs, sb.inode_count);
        ino_bitmap.set_range(0, FIRST_USER_INO)?;

        let options = MountOptions::default();
        let faulty = Arc::new(FaultyDevice::new(device));
        let dev: Arc<dyn BlockDevice> = faulty.clone();
        let fsm = Arc::new(FreeSpaceManager::new(
            fsm_config(&sb, &options),
            Arc::clone(&dev),
            fsm_bitmap,
        )?);
        let snapshot = Arc::new(SnapshotManager::format(
            sb.snapshot_config(true),
            Arc::clone(&dev),
            Arc::clone(&fsm),
            Version::new(sb.mount_count, 0),
        ));
        let errors = Arc::new(ErrorHandler::new(options.fatal_policy, false));
        let ctx = context(&dev, &snapshot, &errors, &options);
        let max_record_len = sb.max_record_len;
        let trees = build_trees(&ctx, |store| BTree::create(store, max_record_len, bytewise))?;

        let volume = Self {
            sb,
            options,
            faulty,
            device: dev,
            fsm,
            snapshot,
            errors,
            ctx,
            inodes: InodeBitmap::new(ino_bitmap),
            trees,
            syncs: AtomicU64::new(0),
        };
        volume.sync()?;
        info!(
            target: "vdfs::volume",
            block_size = volume.sb.block_size,
            total_blocks = volume.sb.total_blocks,
            first_data_block = volume.sb.first_data_block(),
            "volume.format"
        );
        Ok(volume.sb.clone())
    }

    /// Opens a formatted volume.
    ///
    /// A read-write mount bumps the superblock mount count, which becomes the
    /// mount component of every version written in this session.
    pub fn mount(device: Arc<dyn BlockDevice>, options: MountOptions) -> Result<Self> {
        options.validate()?;
        let check = !options.skip_signature_check;
        let faulty = Arc::new(FaultyDevice::new(device));
        let dev: Arc<dyn BlockDevice> = faulty.clone();

        let mut sb = Superblock::read(dev.as_ref(), check)?;
        if sb.block_size as usize != dev.block_size() || sb.total_blocks > dev.block_count() {
            return Err(VdfsError::Corruption("superblock geometry does not match device"));
        }
        if !options.read_only {
            sb.mount_count = sb
                .mount_count
                .checked_add(1)
                .ok_or(VdfsError::Corruption("mount count overflow"))?;
            sb.write(dev.as_ref())?;
        }

        let config = sb.snapshot_config(check);
        let loaded = LoadedTables::load(&config, dev.as_ref())?;
        let bs = sb.block_size as usize;
        let fsm_bitmap = read_bitmap(
            dev.as_ref(),
            &loaded,
            SpecialFile::FreeSpaceBitmap,
            FSM_BITMAP_MAGIC,
            bs,
            sb.total_blocks,
        )?;
        let ino_bitmap = read_bitmap(
            dev.as_ref(),
            &loaded,
            SpecialFile::InodeBitmap,
            INODE_BITMAP_MAGIC,
            bs,
            sb.inode_count,
        )?;
        let fsm = Arc::new(FreeSpaceManager::new(
            fsm_config(&sb, &options),
            Arc::clone(&dev),
            fsm_bitmap,
        )?);

        let last = loaded.last_version();
        let epoch = Version::new(sb.mount_count.max(last.mount_count.saturating_add(1)), 0);
        let snapshot = Arc::new(SnapshotManager::from_loaded(
            config,
            Arc::clone(&dev),
            Arc::clone(&fsm),
            loaded,
            epoch,
        )?);
        snapshot
            .verify_against_fsm()
            .map_err(|_| VdfsError::Corruption("translation table references a free block"))?;

        let errors = Arc::new(ErrorHandler::new(options.fatal_policy, options.read_only));
        let ctx = context(&dev, &snapshot, &errors, &options);
        let trees = build_trees(&ctx, |store| BTree::open(store, bytewise))?;

        let volume = Self {
            sb,
            options,
            faulty,
            device: dev,
            fsm,
            snapshot,
            errors,
            ctx,
            inodes: InodeBitmap::new(ino_bitmap),
            trees,
            syncs: AtomicU64::new(0),
        };
        volume.errors.mark_mounted();
        volume.faulty.arm(volume.options.inject_errors);
        info!(
            target: "vdfs::volume",
            mount_count = volume.sb.mount_count,
            epoch = %epoch,
            read_only = volume.options.read_only,
            "volume.mount"
        );
        Ok(volume)
    }

    /// Syncs outstanding changes and releases the volume.
    pub fn unmount(self) -> Result<()> {
        if !self.errors.is_read_only() {
            self.sync()?;
        } else if self.trees.iter().any(|t| !t.store().dirty_chunks().is_empty()) {
            warn!(target: "vdfs::volume", "volume.unmount_discards_changes");
        }
        info!(
            target: "vdfs::volume",
            syncs = self.syncs.load(Ordering::Relaxed),
            fatal_errors = self.errors.fatal_count(),
            "volume.unmount"
        );
        Ok(())
    }

    /// Opens a metadata transaction; refused on a read-only volume.
    pub fn start_transaction(&self) -> Result<TransactionGuard<'_>> {
        self.errors.check_writable()?;
        self.snapshot.start_transaction()
    }

    pub fn superblock(&self) -> &Superblock {
        &self.sb
    }

    pub fn options(&self) -> &MountOptions {
        &self.options
    }

    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }

    pub fn fsm(&self) -> &Arc<FreeSpaceManager> {
        &self.fsm
    }

    pub fn snapshot(&self) -> &Arc<SnapshotManager> {
        &self.snapshot
    }

    pub fn errors(&self) -> &Arc<ErrorHandler> {
        &self.errors
    }

    pub fn context(&self) -> &Arc<MetaContext> {
        &self.ctx
    }

    pub fn is_read_only(&self) -> bool {
        self.errors.is_read_only()
    }

    /// Arms `count` failing device operations.
    pub fn inject_errors(&self, count: u32) {
        self.faulty.arm(count);
    }

    pub fn catalog(&self) -> &BTree {
        &self.trees[0]
    }

    pub fn extents(&self) -> &BTree {
        &self.trees[1]
    }

    pub fn xattr(&self) -> &BTree {
        &self.trees[2]
    }

    pub fn trees(&self) -> &[BTree] {
        &self.trees
    }

    /// Tree backing `object`.
    pub fn tree(&self, object: SpecialFile) -> Result<&BTree> {
        self.trees
            .iter()
            .find(|t| t.object() == object)
            .ok_or(VdfsError::Invalid("special file is not a tree"))
    }

    /// Physical block currently backing one logical metadata block.
    pub fn get_meta_iblock(&self, object: SpecialFile, index: u64) -> Result<Option<u64>> {
        self.snapshot.get_meta_iblock(object, index)
    }

    /// Allocates data blocks; the bitmap change is persisted by the next sync.
    pub fn alloc_data_blocks(&self, hint: u64, len: u64, flags: AllocFlags) -> Result<FreeExtent> {
        let _tx = self.start_transaction()?;
        self.errors.check(self.fsm.get_free_block(hint, len, flags))
    }

    /// Frees data blocks; they become reusable after the next sync.
    pub fn free_data_blocks(&self, start: u64, len: u64) -> Result<()> {
        if start < self.sb.first_data_block() {
            return Err(self
                .errors
                .escalate(VdfsError::Bug("free of a block in the system area")));
        }
        let _tx = self.start_transaction()?;
        self.errors.check(self.fsm.put_free_block(start, len, FreeFlags::NONE))
    }

    /// Sets aside `count` free blocks for delayed allocation.
    pub fn reserve_blocks(&self, count: u64) -> Result<()> {
        let _tx = self.start_transaction()?;
        self.fsm.reserve_blocks(count)
    }

    pub fn release_reservation(&self, count: u64) -> Result<()> {
        let _tx = self.start_transaction()?;
        self.errors.check(self.fsm.release_reservation(count))
    }

    pub fn alloc_ino(&self) -> Result<u64> {
        let _tx = self.start_transaction()?;
        self.errors.check(self.inodes.alloc_ino())
    }

    pub fn free_ino(&self, ino: u64) -> Result<()> {
        let _tx = self.start_transaction()?;
        self.errors.check(self.inodes.free_ino(ino))
    }

    pub fn is_ino_allocated(&self, ino: u64) -> bool {
        self.inodes.is_allocated(ino)
    }

    pub fn stats(&self) -> VolumeStats {
        let trees = self
            .trees
            .iter()
            .map(|t| TreeStats {
                name: t.object().name(),
                height: t.height().unwrap_or(0),
                bnode: t.store().stats(),
                btree: t.stats(),
            })
            .collect();
        VolumeStats {
            superblock: self.sb.clone(),
            read_only: self.errors.is_read_only(),
            fatal_errors: self.errors.fatal_count(),
            syncs: self.syncs.load(Ordering::Relaxed),
            free_inodes: self.inodes.free_count(),
            fsm: self.fsm.stats(),
            snapshot: self.snapshot.stats(),
            trees,
        }
    }
}

fn geometry(device: &dyn BlockDevice, opts: &FormatOptions) -> Result<Superblock> {
    let bs = opts.block_size;
    if bs != device.block_size() {
        return Err(VdfsError::Invalid("block size does not match the device"));
    }
    if opts.total_blocks > device.block_count() {
        return Err(VdfsError::Invalid("volume larger than the device"));
    }
    if opts.inode_count <= FIRST_USER_INO {
        return Err(VdfsError::Invalid("inode count leaves no allocatable inodes"));
    }
    if opts.max_ext_tables == 0 {
        return Err(VdfsError::Invalid("at least one extended table slot is required"));
    }
    let bpn = u64::from(opts.blocks_per_node);
    let mut capacities = [0u64; SPECIAL_FILE_COUNT];
    capacities[SpecialFile::FreeSpaceBitmap.index()] = pages_needed(bs, opts.total_blocks);
    capacities[SpecialFile::InodeBitmap.index()] = pages_needed(bs, opts.inode_count);
    capacities[SpecialFile::CatalogTree.index()] = opts.catalog_nodes * bpn;
    capacities[SpecialFile::ExtentsTree.index()] = opts.extents_nodes * bpn;
    capacities[SpecialFile::XattrTree.index()] = opts.xattr_nodes * bpn;

    let node_size = bs * opts.blocks_per_node as usize;
    let record_limit = BTree::max_record_len_for(node_size);
    let max_record_len = match opts.max_record_len {
        0 => record_limit,
        n if n <= record_limit => n,
        _ => return Err(VdfsError::Invalid("max record length does not fit the node size")),
    };
    let sb = Superblock {
        format_version: FORMAT_VERSION,
        block_size: u32::try_from(bs).map_err(|_| VdfsError::Invalid("block size too large"))?,
        blocks_per_node: opts.blocks_per_node,
        total_blocks: opts.total_blocks,
        erase_block_blocks: opts.erase_block_blocks,
        mount_count: 1,
        max_ext_tables: opts.max_ext_tables,
        tables_start: SUPERBLOCK_COPIES,
        base_blocks: BaseTable::encoded_blocks(&capacities, bs),
        max_record_len,
        inode_count: opts.inode_count,
        capacities,
    };
    sb.validate()
        .map_err(|_| VdfsError::Invalid("format geometry does not fit the volume"))?;
    Ok(sb)
}

fn fsm_config(sb: &Superblock, options: &MountOptions) -> FsmConfig {
    FsmConfig {
        total_blocks: sb.total_blocks,
        first_data_block: sb.first_data_block(),
        erase_block_blocks: sb.erase_block_blocks,
        align_blocks: u64::from(sb.blocks_per_node),
        max_extents: options.fsm_max_extents,
    }
}

fn context(
    device: &Arc<dyn BlockDevice>,
    snapshot: &Arc<SnapshotManager>,
    errors: &Arc<ErrorHandler>,
    options: &MountOptions,
) -> Arc<MetaContext> {
    Arc::new(MetaContext {
        device: Arc::clone(device),
        snapshot: Arc::clone(snapshot),
        errors: Arc::clone(errors),
        validation_retries: options.validation_retries,
        cache_chunks: options.cache_chunks,
    })
}

fn build_trees(
    ctx: &Arc<MetaContext>,
    mut make: impl FnMut(Arc<NodeStore>) -> Result<BTree>,
) -> Result<[BTree; 3]> {
    let [catalog, extents, xattr] = TREES;
    Ok([
        make(NodeStore::new(catalog, Arc::clone(ctx))?)?,
        make(NodeStore::new(extents, Arc::clone(ctx))?)?,
        make(NodeStore::new(xattr, Arc::clone(ctx))?)?,
    ])
}

fn read_bitmap(
    device: &dyn BlockDevice,
    loaded: &LoadedTables,
    object: SpecialFile,
    magic: [u8; 4],
    block_size: usize,
    bits: u64,
) -> Result<BitmapFile> {
    let pages = pages_needed(block_size, bits);
    let mut images = Vec::with_capacity(pages as usize);
    for idx in 0..pages {
        let entry = loaded
            .entry(object, idx)
            .filter(TableEntry::is_mapped)
            .ok_or(VdfsError::Corruption("bitmap page has no mapping"))?;
        let mut buf = vec![0u8; block_size];
        device.read_blocks(entry.phys, &mut buf)?;
        images.push((buf, entry.version));
    }
    BitmapFile::from_pages(magic, block_size, bits, images)
}
