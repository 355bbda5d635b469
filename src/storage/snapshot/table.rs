//! On-disk translation tables.
//!
//! A base table (`"CoWB"`) maps every logical block of every special file to
//! a physical block and the version that last wrote it. Extended tables
//! (`"CoWE"`) are one-block deltas appended after it.

use std::ops::Range;

use crate::primitives::bytes::le;
use crate::types::checksum::{seal_crc32, verify_crc32, CRC_LEN};
use crate::types::{Result, SpecialFile, VdfsError, Version, SPECIAL_FILE_COUNT};

pub const BASE_TABLE_MAGIC: [u8; 4] = *b"CoWB";
pub const EXT_TABLE_MAGIC: [u8; 4] = *b"CoWE";

mod base {
    use super::Range;
    pub const MAGIC: Range<usize> = 0..4;
    pub const MOUNT: Range<usize> = 4..8;
    pub const SYNC: Range<usize> = 8..12;
    pub const OBJECTS: Range<usize> = 12..16;
    pub const DIRECTORY: usize = 16;
    pub const DIR_ENTRY_LEN: usize = 16;
    pub const ENTRY_LEN: usize = 16;
}

mod ext {
    use super::Range;
    pub const MAGIC: Range<usize> = 0..4;
    pub const MOUNT: Range<usize> = 4..8;
    pub const SYNC: Range<usize> = 8..12;
    pub const COUNT: Range<usize> = 12..16;
    pub const RECORDS: usize = 20;
    pub const RECORD_LEN: usize = 24;
}

/// Physical location and write version of one logical block.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct TableEntry {
    /// Physical block, or 0 when never written.
    pub phys: u64,
    pub version: Version,
}

impl TableEntry {
    pub fn is_mapped(&self) -> bool {
        self.phys != 0
    }
}

/// Full logical-to-physical map.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BaseTable {
    /// Generation at which this table was written.
    pub version: Version,
    offsets: [usize; SPECIAL_FILE_COUNT],
    capacities: [u64; SPECIAL_FILE_COUNT],
    entries: Vec<TableEntry>,
}

impl BaseTable {
    /// Creates an all-unmapped table for the given per-object capacities.
    pub fn new(capacities: [u64; SPECIAL_FILE_COUNT]) -> Self {
        let mut offsets = [0usize; SPECIAL_FILE_COUNT];
        let mut total = 0usize;
        for (idx, cap) in capacities.iter().enumerate() {
            offsets[idx] = total;
            total += *cap as usize;
        }
        Self {
            version: Version::default(),
            offsets,
            capacities,
            entries: vec![TableEntry::default(); total],
        }
    }

    /// Blocks needed to store a table with these capacities.
    pub fn encoded_blocks(capacities: &[u64; SPECIAL_FILE_COUNT], block_size: usize) -> u64 {
        let entries: u64 = capacities.iter().sum();
        let bytes = base::DIRECTORY as u64
            + (SPECIAL_FILE_COUNT * base::DIR_ENTRY_LEN) as u64
            + entries * base::ENTRY_LEN as u64
            + CRC_LEN as u64;
        bytes.div_ceil(block_size as u64)
    }

    pub fn capacity(&self, object: SpecialFile) -> u64 {
        self.capacities[object.index()]
    }

    pub fn capacities(&self) -> [u64; SPECIAL_FILE_COUNT] {
        self.capacities
    }

    pub fn entry(&self, object: SpecialFile, index: u64) -> Option<&TableEntry> {
        if index >= self.capacity(object) {
            return None;
        }
        self.entries.get(self.offsets[object.index()] + index as usize)
    }

    pub fn entry_mut(&mut self, object: SpecialFile, index: u64) -> Option<&mut TableEntry> {
        if index >= self.capacity(object) {
            return None;
        }
        let at = self.offsets[object.index()] + index as usize;
        self.entries.get_mut(at)
    }

    /// Mapped entries as `(object, logical index, entry)`.
    pub fn mapped(&self) -> impl Iterator<Item = (SpecialFile, u64, TableEntry)> + '_ {
        SpecialFile::ALL.into_iter().flat_map(move |object| {
            let start = self.offsets[object.index()];
            let cap = self.capacity(object) as usize;
            self.entries[start..start + cap]
                .iter()
                .enumerate()
                .filter(|(_, e)| e.is_mapped())
                .map(move |(idx, e)| (object, idx as u64, *e))
        })
    }

    pub fn encode(&self, block_size: usize) -> Vec<u8> {
        let blocks = Self::encoded_blocks(&self.capacities, block_size) as usize;
        let mut buf = vec![0u8; blocks * block_size];
        buf[base::MAGIC].copy_from_slice(&BASE_TABLE_MAGIC);
        le::put_u32(&mut buf, base::MOUNT.start, self.version.mount_count);
        le::put_u32(&mut buf, base::SYNC.start, self.version.sync_count);
        le::put_u32(&mut buf, base::OBJECTS.start, SPECIAL_FILE_COUNT as u32);
        for idx in 0..SPECIAL_FILE_COUNT {
            let at = base::DIRECTORY + idx * base::DIR_ENTRY_LEN;
            le::put_u64(&mut buf, at, self.offsets[idx] as u64);
            le::put_u64(&mut buf, at + 8, self.capacities[idx]);
        }
        let mut at = base::DIRECTORY + SPECIAL_FILE_COUNT * base::DIR_ENTRY_LEN;
        for entry in &self.entries {
            le::put_u64(&mut buf, at, entry.phys);
            le::put_u32(&mut buf, at + 8, entry.version.mount_count);
            le::put_u32(&mut buf, at + 12, entry.version.sync_count);
            at += base::ENTRY_LEN;
        }
        seal_crc32(&mut buf);
        buf
    }

    /// Decodes and validates a table image.
    pub fn decode(
        buf: &[u8],
        capacities: [u64; SPECIAL_FILE_COUNT],
        check_signature: bool,
    ) -> Result<Self> {
        if check_signature && buf[base::MAGIC] != BASE_TABLE_MAGIC {
            return Err(VdfsError::Corruption("base table signature mismatch"));
        }
        if !verify_crc32(buf) {
            return Err(VdfsError::Corruption("base table crc mismatch"));
        }
        if le::get_u32(buf, base::OBJECTS.start) as usize != SPECIAL_FILE_COUNT {
            return Err(VdfsError::Corruption("base table object count mismatch"));
        }
        let mut table = Self::new(capacities);
        table.version = Version::new(
            le::get_u32(buf, base::MOUNT.start),
            le::get_u32(buf, base::SYNC.start),
        );
        for idx in 0..SPECIAL_FILE_COUNT {
            let at = base::DIRECTORY + idx * base::DIR_ENTRY_LEN;
            if le::get_u64(buf, at) != table.offsets[idx] as u64
                || le::get_u64(buf, at + 8) != capacities[idx]
            {
                return Err(VdfsError::Corruption("base table directory mismatch"));
            }
        }
        let mut at = base::DIRECTORY + SPECIAL_FILE_COUNT * base::DIR_ENTRY_LEN;
        for entry in &mut table.entries {
            entry.phys = le::get_u64(buf, at);
            entry.version = Version::new(le::get_u32(buf, at + 8), le::get_u32(buf, at + 12));
            at += base::ENTRY_LEN;
        }
        Ok(table)
    }
}

/// One remapping recorded in an extended table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
pub struct ExtRecord {
    pub object: SpecialFile,
    /// First logical block of the relocated chunk.
    pub index: u64,
    /// First physical block of the new location.
    pub phys: u64,
}

/// Incremental delta over the base table.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExtTable {
    pub version: Version,
    pub records: Vec<ExtRecord>,
}

impl ExtTable {
    /// Records that fit in one block.
    pub fn capacity(block_size: usize) -> usize {
        (block_size - ext::RECORDS - CRC_LEN) / ext::RECORD_LEN
    }

    pub fn encode(&self, block_size: usize) -> Result<Vec<u8>> {
        if self.records.len() > Self::capacity(block_size) {
            return Err(VdfsError::Bug("extended table overflow"));
        }
        let mut buf = vec![0u8; block_size];
        buf[ext::MAGIC].copy_from_slice(&EXT_TABLE_MAGIC);
        le::put_u32(&mut buf, ext::MOUNT.start, self.version.mount_count);
        le::put_u32(&mut buf, ext::SYNC.start, self.version.sync_count);
        le::put_u32(&mut buf, ext::COUNT.start, self.records.len() as u32);
        let mut at = ext::RECORDS;
        for rec in &self.records {
            le::put_u64(&mut buf, at, rec.object as u64);
            le::put_u64(&mut buf, at + 8, rec.index);
            le::put_u64(&mut buf, at + 16, rec.phys);
            at += ext::RECORD_LEN;
        }
        seal_crc32(&mut buf);
        Ok(buf)
    }

    pub fn decode(buf: &[u8], check_signature: bool) -> Result<Self> {
        if check_signature && buf[ext::MAGIC] != EXT_TABLE_MAGIC {
            return Err(VdfsError::Corruption("extended table signature mismatch"));
        }
        if !verify_crc32(buf) {
            return Err(VdfsError::Corruption("extended table crc mismatch"));
        }
        let count = le::get_u32(buf, ext::COUNT.start) as usize;
        if count > Self::capacity(buf.len()) {
            return Err(VdfsError::Corruption("extended table record count too large"));
        }
        let mut records = Vec::with_capacity(count);
        let mut at = ext::RECORDS;
        for _ in 0..count {
            records.push(ExtRecord {
                object: SpecialFile::from_raw(le::get_u64(buf, at))?,
                index: le::get_u64(buf, at + 8),
                phys: le::get_u64(buf, at + 16),
            });
            at += ext::RECORD_LEN;
        }
        Ok(Self {
            version: Version::new(
                le::get_u32(buf, ext::MOUNT.start),
                le::get_u32(buf, ext::SYNC.start),
            ),
            records,
        })
    }
}
