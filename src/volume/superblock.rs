use std::ops::Range;

use tracing::{debug, warn};

use crate::primitives::bytes::le;
use crate::primitives::io::BlockDevice;
use crate::storage::fsm::pages_needed;
use crate::storage::snapshot::{BaseTable, SnapshotConfig, TableLayout};
use crate::types::checksum::{seal_crc32, verify_crc32};
use crate::types::{Result, SpecialFile, VdfsError, SPECIAL_FILE_COUNT};

/// Superblock signature.
pub const SUPERBLOCK_MAGIC: [u8; 4] = *b"VDFS";
/// On-disk format revision written by this crate.
pub const FORMAT_VERSION: u16 = 1;
/// Blocks holding superblock copies.
pub const SUPERBLOCK_COPIES: u64 = 2;
/// Smallest supported block size.
pub const MIN_BLOCK_SIZE: usize = 512;

const SB_MAGIC: Range<usize> = 0..4;
const SB_FORMAT_VERSION: Range<usize> = 4..6;
const SB_BLOCK_SIZE: Range<usize> = 8..12;
const SB_BLOCKS_PER_NODE: Range<usize> = 12..16;
const SB_TOTAL_BLOCKS: Range<usize> = 16..24;
const SB_ERASE_BLOCK: Range<usize> = 24..32;
const SB_MOUNT_COUNT: Range<usize> = 32..36;
const SB_MAX_EXT_TABLES: Range<usize> = 36..40;
const SB_TABLES_START: Range<usize> = 40..48;
const SB_BASE_BLOCKS: Range<usize> = 48..56;
const SB_MAX_RECORD: Range<usize> = 56..58;
const SB_INODE_COUNT: Range<usize> = 64..72;
const SB_CAPACITIES: usize = 72;

/// Volume geometry persisted in blocks 0 and 1.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct Superblock {
    pub format_version: u16,
    pub block_size: u32,
    /// Blocks per bnode of every tree.
    pub blocks_per_node: u32,
    pub total_blocks: u64,
    pub erase_block_blocks: u64,
    /// Incremented by every read-write mount.
    pub mount_count: u32,
    pub max_ext_tables: u32,
    /// First block of the translation-table region.
    pub tables_start: u64,
    /// Blocks taken by one base table.
    pub base_blocks: u64,
    /// Record limit shared by the trees.
    pub max_record_len: u16,
    /// Inode numbers tracked by the inode bitmap.
    pub inode_count: u64,
    /// Logical blocks per special file.
    pub capacities: [u64; SPECIAL_FILE_COUNT],
}

impl Superblock {
    /// Reads the block size from the first bytes of a superblock without
    /// knowing the device geometry.
    pub fn peek_block_size(prefix: &[u8]) -> Result<usize> {
        if prefix.len() < SB_BLOCK_SIZE.end {
            return Err(VdfsError::Corruption("superblock prefix too short"));
        }
        let bs = le::get_u32(prefix, SB_BLOCK_SIZE.start) as usize;
        if bs < MIN_BLOCK_SIZE || !bs.is_power_of_two() {
            return Err(VdfsError::Corruption("superblock block size is not valid"));
        }
        Ok(bs)
    }

    pub fn layout(&self) -> TableLayout {
        TableLayout {
            region_start: self.tables_start,
            base_blocks: self.base_blocks,
            max_ext_tables: self.max_ext_tables,
        }
    }

    /// First block the allocator may hand out.
    pub fn first_data_block(&self) -> u64 {
        self.tables_start + self.layout().region_blocks()
    }

    /// Relocation unit per special file: one page for bitmaps, one node for trees.
    pub fn chunk_blocks(&self) -> [u64; SPECIAL_FILE_COUNT] {
        let mut out = [1; SPECIAL_FILE_COUNT];
        for object in SpecialFile::ALL {
            if object.is_tree() {
                out[object.index()] = u64::from(self.blocks_per_node);
            }
        }
        out
    }

    pub fn node_size(&self) -> usize {
        self.blocks_per_node as usize * self.block_size as usize
    }

    pub fn snapshot_config(&self, check_signature: bool) -> SnapshotConfig {
        SnapshotConfig {
            layout: self.layout(),
            capacities: self.capacities,
            chunk_blocks: self.chunk_blocks(),
            block_size: self.block_size as usize,
            total_blocks: self.total_blocks,
            check_signature,
        }
    }

    /// Checks internal consistency of the geometry.
    pub fn validate(&self) -> Result<()> {
        let bs = self.block_size as usize;
        if bs < MIN_BLOCK_SIZE || !bs.is_power_of_two() {
            return Err(VdfsError::Corruption("superblock block size is not valid"));
        }
        if self.blocks_per_node == 0 || !self.blocks_per_node.is_power_of_two() {
            return Err(VdfsError::Corruption("blocks per node must be a power of two"));
        }
        if self.erase_block_blocks == 0 {
            return Err(VdfsError::Corruption("erase block size is zero"));
        }
        if self.base_blocks != BaseTable::encoded_blocks(&self.capacities, bs) {
            return Err(VdfsError::Corruption("base table size does not match capacities"));
        }
        if self.tables_start < SUPERBLOCK_COPIES || self.first_data_block() >= self.total_blocks {
            return Err(VdfsError::Corruption("table region does not fit the volume"));
        }
        let bitmap_pages = pages_needed(bs, self.total_blocks);
        if self.capacities[SpecialFile::FreeSpaceBitmap.index()] != bitmap_pages {
            return Err(VdfsError::Corruption("free-space bitmap capacity mismatch"));
        }
        if self.capacities[SpecialFile::InodeBitmap.index()] != pages_needed(bs, self.inode_count) {
            return Err(VdfsError::Corruption("inode bitmap capacity mismatch"));
        }
        let bpn = u64::from(self.blocks_per_node);
        for object in SpecialFile::ALL.into_iter().filter(|o| o.is_tree()) {
            if self.capacities[object.index()] % bpn != 0 {
                return Err(VdfsError::Corruption("tree capacity is not node aligned"));
            }
        }
        Ok(())
    }

    /// One sealed superblock block.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.block_size as usize];
        buf[SB_MAGIC].copy_from_slice(&SUPERBLOCK_MAGIC);
        le::put_u16(&mut buf, SB_FORMAT_VERSION.start, self.format_version);
        le::put_u32(&mut buf, SB_BLOCK_SIZE.start, self.block_size);
        le::put_u32(&mut buf, SB_BLOCKS_PER_NODE.start, self.blocks_per_node);
        le::put_u64(&mut buf, SB_TOTAL_BLOCKS.start, self.total_blocks);
        le::put_u64(&mut buf, SB_ERASE_BLOCK.start, self.erase_block_blocks);
        le::put_u32(&mut buf, SB_MOUNT_COUNT.start, self.mount_count);
        le::put_u32(&mut buf, SB_MAX_EXT_TABLES.start, self.max_ext_tables);
        le::put_u64(&mut buf, SB_TABLES_START.start, self.tables_start);
        le::put_u64(&mut buf, SB_BASE_BLOCKS.start, self.base_blocks);
        le::put_u16(&mut buf, SB_MAX_RECORD.start, self.max_record_len);
        le::put_u64(&mut buf, SB_INODE_COUNT.start, self.inode_count);
        for (i, cap) in self.capacities.iter().enumerate() {
            le::put_u64(&mut buf, SB_CAPACITIES + i * 8, *cap);
        }
        seal_crc32(&mut buf);
        buf
    }

    pub fn decode(buf: &[u8], check_signature: bool) -> Result<Self> {
        if buf.len() < MIN_BLOCK_SIZE || !verify_crc32(buf) {
            return Err(VdfsError::Corruption("superblock crc mismatch"));
        }
        if check_signature && buf[SB_MAGIC] != SUPERBLOCK_MAGIC {
            return Err(VdfsError::Corruption("superblock signature mismatch"));
        }
        let format_version = le::get_u16(buf, SB_FORMAT_VERSION.start);
        if format_version != FORMAT_VERSION {
            return Err(VdfsError::Corruption("unsupported format version"));
        }
        let mut capacities = [0u64; SPECIAL_FILE_COUNT];
        for (i, cap) in capacities.iter_mut().enumerate() {
            *cap = le::get_u64(buf, SB_CAPACITIES + i * 8);
        }
        let sb = Self {
            format_version,
            block_size: le::get_u32(buf, SB_BLOCK_SIZE.start),
            blocks_per_node: le::get_u32(buf, SB_BLOCKS_PER_NODE.start),
            total_blocks: le::get_u64(buf, SB_TOTAL_BLOCKS.start),
            erase_block_blocks: le::get_u64(buf, SB_ERASE_BLOCK.start),
            mount_count: le::get_u32(buf, SB_MOUNT_COUNT.start),
            max_ext_tables: le::get_u32(buf, SB_MAX_EXT_TABLES.start),
            tables_start: le::get_u64(buf, SB_TABLES_START.start),
            base_blocks: le::get_u64(buf, SB_BASE_BLOCKS.start),
            max_record_len: le::get_u16(buf, SB_MAX_RECORD.start),
            inode_count: le::get_u64(buf, SB_INODE_COUNT.start),
            capacities,
        };
        if sb.block_size as usize != buf.len() {
            return Err(VdfsError::Corruption("superblock block size mismatch"));
        }
        sb.validate()?;
        Ok(sb)
    }

    /// Loads the valid copy with the higher mount count.
    pub fn read(device: &dyn BlockDevice, check_signature: bool) -> Result<Self> {
        let mut best: Option<Superblock> = None;
        let mut buf = vec![0u8; device.block_size()];
        for copy in 0..SUPERBLOCK_COPIES {
            device.read_blocks(copy, &mut buf)?;
            match Self::decode(&buf, check_signature) {
                Ok(sb) => {
                    if best.as_ref().map_or(true, |b| sb.mount_count > b.mount_count) {
                        best = Some(sb);
                    }
                }
                Err(err) => warn!(target: "vdfs::volume", copy, error = %err, "superblock.invalid_copy"),
            }
        }
        let sb = best.ok_or(VdfsError::Corruption("no valid superblock"))?;
        debug!(target: "vdfs::volume", mount_count = sb.mount_count, "superblock.read");
        Ok(sb)
    }

    /// Writes both copies and flushes.
    pub fn write(&self, device: &dyn BlockDevice) -> Result<()> {
        let image = self.encode();
        for copy in 0..SUPERBLOCK_COPIES {
            device.write_blocks(copy, &image)?;
        }
        device.flush()?;
        Ok(())
    }
}
