//! Paged on-disk bitmaps (`"fsmb"` free space, `"inob"` inode ids).
//!
//! Page layout: magic, version stamp, page index, bit payload, trailing CRC32.

use std::collections::BTreeSet;
use std::ops::Range;

use crate::primitives::bytes::{bits, le};
use crate::types::checksum::{seal_crc32, verify_crc32, CRC_LEN};
use crate::types::{Result, VdfsError, Version};

/// Magic of free-space bitmap pages.
pub const FSM_BITMAP_MAGIC: [u8; 4] = *b"fsmb";
/// Magic of inode bitmap pages.
pub const INODE_BITMAP_MAGIC: [u8; 4] = *b"inob";

mod page {
    use super::Range;
    pub const MAGIC: Range<usize> = 0..4;
    pub const MOUNT: Range<usize> = 4..8;
    pub const SYNC: Range<usize> = 8..12;
    pub const INDEX: Range<usize> = 12..16;
    pub const BITS_START: usize = 16;
}

/// Number of bits carried by one page of `block_size` bytes.
pub fn bits_per_page(block_size: usize) -> u64 {
    ((block_size - page::BITS_START - CRC_LEN) * 8) as u64
}

/// Pages needed to hold `bit_count` bits.
pub fn pages_needed(block_size: usize, bit_count: u64) -> u64 {
    bit_count.div_ceil(bits_per_page(block_size)).max(1)
}

/// In-memory image of a paged bitmap plus its dirty-page set.
///
/// Bits past `bit_count` are permanently set so they never read as free.
#[derive(Debug, Clone)]
pub struct BitmapFile {
    magic: [u8; 4],
    block_size: usize,
    bit_count: u64,
    pages: Vec<Box<[u8]>>,
    dirty: BTreeSet<u64>,
}

impl BitmapFile {
    /// Creates an all-clear bitmap with every page dirty.
    pub fn create(magic: [u8; 4], block_size: usize, bit_count: u64) -> Self {
        let count = pages_needed(block_size, bit_count);
        let pages = (0..count)
            .map(|idx| blank_page(magic, block_size, idx))
            .collect();
        let mut bitmap = Self {
            magic,
            block_size,
            bit_count,
            pages,
            dirty: (0..count).collect(),
        };
        bitmap.fill_tail();
        bitmap
    }

    /// Rebuilds a bitmap from page images read off disk.
    ///
    /// Each page is checked for magic, CRC and the version recorded in the
    /// translation table.
    pub fn from_pages(
        magic: [u8; 4],
        block_size: usize,
        bit_count: u64,
        images: Vec<(Vec<u8>, Version)>,
    ) -> Result<Self> {
        if images.len() as u64 != pages_needed(block_size, bit_count) {
            return Err(VdfsError::Corruption("bitmap page count mismatch"));
        }
        let mut pages = Vec::with_capacity(images.len());
        for (idx, (image, expected)) in images.into_iter().enumerate() {
            validate_page(magic, &image, idx as u64, expected)?;
            pages.push(image.into_boxed_slice());
        }
        let mut bitmap = Self {
            magic,
            block_size,
            bit_count,
            pages,
            dirty: BTreeSet::new(),
        };
        bitmap.fill_tail();
        Ok(bitmap)
    }

    fn fill_tail(&mut self) {
        let capacity = self.pages.len() as u64 * bits_per_page(self.block_size);
        for bit in self.bit_count..capacity {
            let (page, off) = self.locate(bit);
            bits::set(&mut self.pages[page][page::BITS_START..], off);
        }
    }

    fn locate(&self, bit: u64) -> (usize, usize) {
        let per = bits_per_page(self.block_size);
        ((bit / per) as usize, (bit % per) as usize)
    }

    /// Number of meaningful bits.
    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    pub fn page_count(&self) -> u64 {
        self.pages.len() as u64
    }

    pub fn test(&self, bit: u64) -> bool {
        if bit >= self.bit_count {
            return true;
        }
        let (page, off) = self.locate(bit);
        bits::test(&self.pages[page][page::BITS_START..], off)
    }

    fn check_range(&self, start: u64, len: u64) -> Result<()> {
        match start.checked_add(len) {
            Some(end) if end <= self.bit_count => Ok(()),
            _ => Err(VdfsError::Invalid("bitmap range out of bounds")),
        }
    }

    /// Sets a range that must be entirely clear.
    pub fn set_range(&mut self, start: u64, len: u64) -> Result<()> {
        self.check_range(start, len)?;
        if (start..start + len).any(|b| self.test(b)) {
            return Err(VdfsError::Bug("bitmap bit already set"));
        }
        self.write_range(start, len, true);
        Ok(())
    }

    /// Clears a range that must be entirely set.
    pub fn clear_range(&mut self, start: u64, len: u64) -> Result<()> {
        self.check_range(start, len)?;
        if (start..start + len).any(|b| !self.test(b)) {
            return Err(VdfsError::Bug("bitmap bit already clear"));
        }
        self.write_range(start, len, false);
        Ok(())
    }

    fn write_range(&mut self, start: u64, len: u64, value: bool) {
        for bit in start..start + len {
            let (page, off) = self.locate(bit);
            let payload = &mut self.pages[page][page::BITS_START..];
            if value {
                bits::set(payload, off);
            } else {
                bits::clear(payload, off);
            }
            self.dirty.insert(page as u64);
        }
    }

    /// Number of clear bits.
    pub fn count_zeros(&self) -> u64 {
        self.zero_runs().iter().map(|&(_, len)| len).sum()
    }

    /// Maximal runs of clear bits in ascending order.
    pub fn zero_runs(&self) -> Vec<(u64, u64)> {
        let mut runs = Vec::new();
        let mut run_start: Option<u64> = None;
        let mut bit = 0;
        while bit < self.bit_count {
            let (page, off) = self.locate(bit);
            let payload = &self.pages[page][page::BITS_START..];
            if run_start.is_none() && off % 8 == 0 && payload[off / 8] == 0xFF {
                bit += 8;
                continue;
            }
            let set = bits::test(payload, off);
            match (set, run_start) {
                (false, None) => run_start = Some(bit),
                (true, Some(s)) => {
                    runs.push((s, bit - s));
                    run_start = None;
                }
                _ => {}
            }
            bit += 1;
        }
        if let Some(s) = run_start {
            runs.push((s, self.bit_count - s));
        }
        runs
    }

    /// First clear bit at or after `from`.
    pub fn first_zero(&self, from: u64) -> Option<u64> {
        let per = bits_per_page(self.block_size);
        let mut bit = from;
        while bit < self.bit_count {
            let (page, off) = self.locate(bit);
            let limit = per.min(self.bit_count - (bit - off as u64)) as usize;
            if let Some(hit) = bits::first_zero(&self.pages[page][page::BITS_START..], off, limit) {
                return Some(bit - off as u64 + hit as u64);
            }
            bit = (page as u64 + 1) * per;
        }
        None
    }

    /// Page indices modified since they were last written.
    pub fn dirty_pages(&self) -> Vec<u64> {
        self.dirty.iter().copied().collect()
    }

    pub fn has_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Stamps `version`, seals the CRC, and returns the page image.
    pub fn seal_page(&mut self, idx: u64, version: Version) -> Result<Vec<u8>> {
        let magic = self.magic;
        let page = self
            .pages
            .get_mut(idx as usize)
            .ok_or(VdfsError::Invalid("bitmap page index out of range"))?;
        page[page::MAGIC].copy_from_slice(&magic);
        le::put_u32(page, page::MOUNT.start, version.mount_count);
        le::put_u32(page, page::SYNC.start, version.sync_count);
        le::put_u32(page, page::INDEX.start, idx as u32);
        seal_crc32(page);
        Ok(page.to_vec())
    }

    /// Forgets the dirty state of pages after a completed write.
    pub fn clear_dirty(&mut self, written: &[u64]) {
        for idx in written {
            self.dirty.remove(idx);
        }
    }
}

fn blank_page(magic: [u8; 4], block_size: usize, idx: u64) -> Box<[u8]> {
    let mut page = vec![0u8; block_size];
    page[page::MAGIC].copy_from_slice(&magic);
    le::put_u32(&mut page, page::INDEX.start, idx as u32);
    page.into_boxed_slice()
}

/// Checks one bitmap page image.
pub fn validate_page(magic: [u8; 4], image: &[u8], idx: u64, expected: Version) -> Result<()> {
    if image[page::MAGIC] != magic {
        return Err(VdfsError::Corruption("bitmap page magic mismatch"));
    }
    if !verify_crc32(image) {
        return Err(VdfsError::Corruption("bitmap page crc mismatch"));
    }
    if le::get_u32(image, page::INDEX.start) as u64 != idx {
        return Err(VdfsError::Corruption("bitmap page index mismatch"));
    }
    let version = Version::new(
        le::get_u32(image, page::MOUNT.start),
        le::get_u32(image, page::SYNC.start),
    );
    if version != expected {
        return Err(VdfsError::Corruption("bitmap page version mismatch"));
    }
    Ok(())
}
