#![forbid(unsafe_code)]
//! Little-endian field codecs and bit-level helpers shared by the on-disk formats.

pub mod le {
    //! Fixed-offset little-endian accessors. Callers size-check buffers up front.

    use core::convert::TryInto;
    use core::ops::Range;

    #[inline]
    fn field<const N: usize>(src: &[u8], at: usize) -> [u8; N] {
        src[at..at + N]
            .try_into()
            .unwrap_or_else(|_| panic!("field at {at} shorter than {N} bytes"))
    }

    /// Reads a u16 at `at`.
    pub fn get_u16(src: &[u8], at: usize) -> u16 {
        u16::from_le_bytes(field(src, at))
    }

    /// Reads a u32 at `at`.
    pub fn get_u32(src: &[u8], at: usize) -> u32 {
        u32::from_le_bytes(field(src, at))
    }

    /// Reads a u64 at `at`.
    pub fn get_u64(src: &[u8], at: usize) -> u64 {
        u64::from_le_bytes(field(src, at))
    }

    /// Writes a u16 at `at`.
    pub fn put_u16(dst: &mut [u8], at: usize, v: u16) {
        dst[at..at + 2].copy_from_slice(&v.to_le_bytes());
    }

    /// Writes a u32 at `at`.
    pub fn put_u32(dst: &mut [u8], at: usize, v: u32) {
        dst[at..at + 4].copy_from_slice(&v.to_le_bytes());
    }

    /// Writes a u64 at `at`.
    pub fn put_u64(dst: &mut [u8], at: usize, v: u64) {
        dst[at..at + 8].copy_from_slice(&v.to_le_bytes());
    }

    /// Reads a u32 from a header range constant.
    pub fn get_u32_at(src: &[u8], range: Range<usize>) -> u32 {
        debug_assert_eq!(range.len(), 4);
        get_u32(src, range.start)
    }

    /// Reads a u64 from a header range constant.
    pub fn get_u64_at(src: &[u8], range: Range<usize>) -> u64 {
        debug_assert_eq!(range.len(), 8);
        get_u64(src, range.start)
    }
}

pub mod bits {
    //! LSB-first bit addressing over raw byte slices.

    /// Returns the bit at `idx`.
    #[inline]
    pub fn test(bytes: &[u8], idx: usize) -> bool {
        bytes[idx / 8] & (1 << (idx % 8)) != 0
    }

    /// Sets the bit at `idx`, returning its previous value.
    #[inline]
    pub fn set(bytes: &mut [u8], idx: usize) -> bool {
        let mask = 1 << (idx % 8);
        let prev = bytes[idx / 8] & mask != 0;
        bytes[idx / 8] |= mask;
        prev
    }

    /// Clears the bit at `idx`, returning its previous value.
    #[inline]
    pub fn clear(bytes: &mut [u8], idx: usize) -> bool {
        let mask = 1 << (idx % 8);
        let prev = bytes[idx / 8] & mask != 0;
        bytes[idx / 8] &= !mask;
        prev
    }

    /// Index of the first clear bit in `[from, limit)`.
    pub fn first_zero(bytes: &[u8], from: usize, limit: usize) -> Option<usize> {
        let mut idx = from;
        while idx < limit {
            if idx % 8 == 0 && idx + 8 <= limit && bytes[idx / 8] == 0xFF {
                idx += 8;
                continue;
            }
            if !test(bytes, idx) {
                return Some(idx);
            }
            idx += 1;
        }
        None
    }
}

/// Growable-at-construction bit vector used for per-epoch block sets.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BitVec {
    words: Vec<u64>,
    len: u64,
}

impl BitVec {
    /// Creates an all-clear vector of `len` bits.
    pub fn new(len: u64) -> Self {
        let words = len.div_ceil(64) as usize;
        Self {
            words: vec![0; words],
            len,
        }
    }

    /// Number of addressable bits.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns true when the vector addresses no bits.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the bit at `idx`; out-of-range reads are clear.
    pub fn get(&self, idx: u64) -> bool {
        if idx >= self.len {
            return false;
        }
        self.words[(idx / 64) as usize] & (1 << (idx % 64)) != 0
    }

    /// Sets `len` bits starting at `start`.
    pub fn set_range(&mut self, start: u64, len: u64) {
        for idx in start..start.saturating_add(len).min(self.len) {
            self.words[(idx / 64) as usize] |= 1 << (idx % 64);
        }
    }

    /// Clears `len` bits starting at `start`.
    pub fn clear_range(&mut self, start: u64, len: u64) {
        for idx in start..start.saturating_add(len).min(self.len) {
            self.words[(idx / 64) as usize] &= !(1 << (idx % 64));
        }
    }

    /// Clears every bit.
    pub fn clear_all(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }

    /// Number of set bits.
    pub fn count_ones(&self) -> u64 {
        self.words.iter().map(|w| u64::from(w.count_ones())).sum()
    }

    /// Iterates the indices of set bits in ascending order.
    pub fn iter_ones(&self) -> impl Iterator<Item = u64> + '_ {
        self.words.iter().enumerate().flat_map(|(wi, &word)| {
            let base = wi as u64 * 64;
            (0..64u64)
                .filter(move |bit| word & (1 << bit) != 0)
                .map(move |bit| base + bit)
        })
    }
}
