use crate::primitives::bytes::bits;
use crate::types::checksum::CRC_LEN;
use crate::types::{NodeId, Result, VdfsError};

use super::header::HEAD_BITMAP_OFFSET;

/// Allocation map of bnode ids, persisted inside the head node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FreeIdBitmap {
    bits: Vec<u8>,
    limit: u32,
    first_free: u32,
    used: u32,
}

impl FreeIdBitmap {
    /// Largest id count a head node of `node_size` bytes can describe.
    pub fn capacity_for(node_size: usize) -> u32 {
        ((node_size - HEAD_BITMAP_OFFSET - CRC_LEN) * 8) as u32
    }

    /// All ids free.
    pub fn new(limit: u32) -> Self {
        Self {
            bits: vec![0; (limit as usize).div_ceil(8)],
            limit,
            first_free: 0,
            used: 0,
        }
    }

    /// Loads from the head node's bitmap area.
    pub fn from_bytes(src: &[u8], limit: u32) -> Result<Self> {
        let len = (limit as usize).div_ceil(8);
        let bytes = src
            .get(..len)
            .ok_or(VdfsError::Corruption("id bitmap truncated"))?;
        let mut map = Self {
            bits: bytes.to_vec(),
            limit,
            first_free: 0,
            used: 0,
        };
        map.used = (0..limit).filter(|&id| map.test(id)).count() as u32;
        map.first_free = map.scan(0).unwrap_or(limit);
        Ok(map)
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn free_count(&self) -> u32 {
        self.limit - self.used
    }

    fn test(&self, id: u32) -> bool {
        bits::test(&self.bits, id as usize)
    }

    fn scan(&self, from: u32) -> Option<u32> {
        bits::first_zero(&self.bits, from as usize, self.limit as usize).map(|i| i as u32)
    }

    pub fn is_allocated(&self, id: NodeId) -> bool {
        id.0 < self.limit && self.test(id.0)
    }

    /// Marks a specific id in use (format-time head node).
    pub fn mark(&mut self, id: NodeId) -> Result<()> {
        if id.0 >= self.limit {
            return Err(VdfsError::Invalid("node id beyond id bitmap"));
        }
        if bits::set(&mut self.bits, id.0 as usize) {
            return Err(VdfsError::Bug("node id already allocated"));
        }
        self.used += 1;
        Ok(())
    }

    /// Takes the lowest free id.
    pub fn reserve_first_free(&mut self) -> Result<NodeId> {
        let id = self
            .scan(self.first_free)
            .or_else(|| self.scan(0))
            .ok_or(VdfsError::NoSpace)?;
        if bits::set(&mut self.bits, id as usize) {
            return Err(VdfsError::Bug("free id bitmap raced"));
        }
        self.used += 1;
        self.first_free = id + 1;
        Ok(NodeId(id))
    }

    /// Returns an id to the pool.
    pub fn release(&mut self, id: NodeId) -> Result<()> {
        if id.0 >= self.limit || !bits::clear(&mut self.bits, id.0 as usize) {
            return Err(VdfsError::Bug("releasing a free node id"));
        }
        self.used -= 1;
        self.first_free = self.first_free.min(id.0);
        Ok(())
    }

    /// Copies the map into the head node's bitmap area.
    pub fn write_into(&self, head: &mut [u8]) {
        head[HEAD_BITMAP_OFFSET..HEAD_BITMAP_OFFSET + self.bits.len()].copy_from_slice(&self.bits);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_prefers_lowest_free() -> Result<()> {
        let mut map = FreeIdBitmap::new(10);
        map.mark(NodeId(0))?;
        assert_eq!(map.reserve_first_free()?, NodeId(1));
        assert_eq!(map.reserve_first_free()?, NodeId(2));
        map.release(NodeId(1))?;
        assert_eq!(map.reserve_first_free()?, NodeId(1));
        assert_eq!(map.reserve_first_free()?, NodeId(3));
        assert_eq!(map.free_count(), 6);
        Ok(())
    }

    #[test]
    fn exhaustion_is_no_space_and_leaves_map_intact() -> Result<()> {
        let mut map = FreeIdBitmap::new(3);
        for _ in 0..3 {
            map.reserve_first_free()?;
        }
        let before = map.clone();
        assert!(matches!(map.reserve_first_free(), Err(VdfsError::NoSpace)));
        assert_eq!(map, before);
        Ok(())
    }

    #[test]
    fn double_release_is_a_bug() -> Result<()> {
        let mut map = FreeIdBitmap::new(8);
        let id = map.reserve_first_free()?;
        map.release(id)?;
        assert!(matches!(map.release(id), Err(VdfsError::Bug(_))));
        Ok(())
    }

    #[test]
    fn persists_through_head_bytes() -> Result<()> {
        let mut map = FreeIdBitmap::new(20);
        map.mark(NodeId(0))?;
        map.mark(NodeId(13))?;
        let mut head = vec![0u8; 64];
        map.write_into(&mut head);
        let loaded = FreeIdBitmap::from_bytes(&head[HEAD_BITMAP_OFFSET..], 20)?;
        assert!(loaded.is_allocated(NodeId(13)));
        assert!(!loaded.is_allocated(NodeId(12)));
        assert_eq!(loaded.free_count(), 18);
        Ok(())
    }
}
