//! In-place record layout of a regular bnode.
//!
//! Records `[key_len u16][val_len u16][key][val]` are packed upward from the
//! node header. A table of `u16` record offsets grows downward from the CRC
//! trailer, slot 0 nearest the trailer, kept in key order. The record area
//! is always compact, so the header's `free_space` fully describes the gap.

use std::cmp::Ordering;

use crate::primitives::bytes::le;
use crate::storage::bnode::{NodeHeader, NodeKind, NODE_HDR_LEN};
use crate::types::checksum::CRC_LEN;
use crate::types::{NodeId, Result, VdfsError};

/// Per-record framing bytes in the record area.
pub const RECORD_HDR_LEN: usize = 4;
/// Offset-table bytes per record.
pub const SLOT_LEN: usize = 2;

/// Space one record takes, framing and slot included.
pub fn footprint(key_len: usize, val_len: usize) -> usize {
    RECORD_HDR_LEN + key_len + val_len + SLOT_LEN
}

/// Bytes available for records in an empty node.
pub fn usable(node_size: usize) -> usize {
    node_size - NODE_HDR_LEN - CRC_LEN
}

fn slot_pos(node_size: usize, idx: usize) -> usize {
    node_size - CRC_LEN - SLOT_LEN * (idx + 1)
}

/// Validated read view of a regular node.
pub struct NodeView<'a> {
    buf: &'a [u8],
    hdr: NodeHeader,
}

impl<'a> NodeView<'a> {
    pub fn parse(buf: &'a [u8]) -> Result<Self> {
        let hdr = NodeHeader::decode(buf)?;
        let n = hdr.recs_count as usize;
        let size = buf.len();
        let table = SLOT_LEN * n;
        let fixed = NODE_HDR_LEN + CRC_LEN + table;
        if fixed + hdr.free_space as usize > size {
            return Err(VdfsError::Corruption("bnode free space exceeds node"));
        }
        let data_end = size - CRC_LEN - table - hdr.free_space as usize;
        let view = Self { buf, hdr };
        let mut used = 0usize;
        for idx in 0..n {
            let off = view.offset(idx);
            if off < NODE_HDR_LEN || off + RECORD_HDR_LEN > data_end {
                return Err(VdfsError::Corruption("bnode record offset out of range"));
            }
            let len = view.record_len(off);
            if off + len > data_end {
                return Err(VdfsError::Corruption("bnode record overruns data area"));
            }
            used += len;
        }
        if NODE_HDR_LEN + used != data_end {
            return Err(VdfsError::Corruption("bnode record area is not compact"));
        }
        Ok(view)
    }

    pub fn header(&self) -> &NodeHeader {
        &self.hdr
    }

    pub fn kind(&self) -> NodeKind {
        self.hdr.kind
    }

    pub fn len(&self) -> usize {
        self.hdr.recs_count as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn free_space(&self) -> usize {
        self.hdr.free_space as usize
    }

    fn offset(&self, idx: usize) -> usize {
        le::get_u16(self.buf, slot_pos(self.buf.len(), idx)) as usize
    }

    fn record_len(&self, off: usize) -> usize {
        RECORD_HDR_LEN
            + le::get_u16(self.buf, off) as usize
            + le::get_u16(self.buf, off + 2) as usize
    }

    pub fn key(&self, idx: usize) -> &'a [u8] {
        let off = self.offset(idx);
        let klen = le::get_u16(self.buf, off) as usize;
        &self.buf[off + RECORD_HDR_LEN..off + RECORD_HDR_LEN + klen]
    }

    pub fn value(&self, idx: usize) -> &'a [u8] {
        let off = self.offset(idx);
        let klen = le::get_u16(self.buf, off) as usize;
        let vlen = le::get_u16(self.buf, off + 2) as usize;
        let start = off + RECORD_HDR_LEN + klen;
        &self.buf[start..start + vlen]
    }

    /// Child pointer stored in an index record.
    pub fn child(&self, idx: usize) -> Result<NodeId> {
        let val = self.value(idx);
        if val.len() != 4 {
            return Err(VdfsError::Corruption("index record value is not a node id"));
        }
        Ok(NodeId(le::get_u32(val, 0)))
    }

    /// Binary search: `Ok(idx)` on an exact match, `Err(insert_at)` otherwise.
    pub fn search(
        &self,
        key: &[u8],
        compare: fn(&[u8], &[u8]) -> Ordering,
    ) -> std::result::Result<usize, usize> {
        let (mut lo, mut hi) = (0, self.len());
        while lo < hi {
            let mid = (lo + hi) / 2;
            match compare(self.key(mid), key) {
                Ordering::Less => lo = mid + 1,
                Ordering::Greater => hi = mid,
                Ordering::Equal => return Ok(mid),
            }
        }
        Err(lo)
    }

    /// Index slot to descend into: the last key not above `key`, else 0.
    pub fn child_slot(&self, key: &[u8], compare: fn(&[u8], &[u8]) -> Ordering) -> usize {
        match self.search(key, compare) {
            Ok(idx) => idx,
            Err(0) => 0,
            Err(idx) => idx - 1,
        }
    }

    /// Owned copies of every record, in order.
    pub fn records(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        (0..self.len())
            .map(|i| (self.key(i).to_vec(), self.value(i).to_vec()))
            .collect()
    }
}

/// Formats `buf` as an empty node.
pub fn init(buf: &mut [u8], id: NodeId, kind: NodeKind) {
    let size = buf.len();
    buf[..size - CRC_LEN].fill(0);
    NodeHeader::empty(id, kind, size).encode(buf);
}

fn update_header(buf: &mut [u8], f: impl FnOnce(&mut NodeHeader)) -> Result<()> {
    let mut hdr = NodeHeader::decode(buf)?;
    f(&mut hdr);
    hdr.encode(buf);
    Ok(())
}

/// Rewrites sibling links.
pub fn set_links(buf: &mut [u8], prev: NodeId, next: NodeId) -> Result<()> {
    update_header(buf, |hdr| {
        hdr.prev = prev;
        hdr.next = next;
    })
}

pub fn set_prev(buf: &mut [u8], prev: NodeId) -> Result<()> {
    update_header(buf, |hdr| hdr.prev = prev)
}

pub fn set_next(buf: &mut [u8], next: NodeId) -> Result<()> {
    update_header(buf, |hdr| hdr.next = next)
}

/// Inserts a record at slot `idx`; the caller checks the space.
pub fn insert_at(buf: &mut [u8], idx: usize, key: &[u8], val: &[u8]) -> Result<()> {
    let mut hdr = NodeHeader::decode(buf)?;
    let n = hdr.recs_count as usize;
    let need = footprint(key.len(), val.len());
    if idx > n {
        return Err(VdfsError::Bug("record slot beyond record count"));
    }
    if need > hdr.free_space as usize {
        return Err(VdfsError::Bug("record does not fit in bnode"));
    }
    let size = buf.len();
    let data_end = size - CRC_LEN - SLOT_LEN * n - hdr.free_space as usize;
    le::put_u16(buf, data_end, key.len() as u16);
    le::put_u16(buf, data_end + 2, val.len() as u16);
    let kstart = data_end + RECORD_HDR_LEN;
    buf[kstart..kstart + key.len()].copy_from_slice(key);
    buf[kstart + key.len()..kstart + key.len() + val.len()].copy_from_slice(val);
    for i in (idx..n).rev() {
        let off = le::get_u16(buf, slot_pos(size, i));
        le::put_u16(buf, slot_pos(size, i + 1), off);
    }
    le::put_u16(buf, slot_pos(size, idx), data_end as u16);
    hdr.recs_count += 1;
    hdr.free_space -= need as u32;
    hdr.encode(buf);
    Ok(())
}

/// Removes slot `idx`, compacting the record area.
pub fn remove_at(buf: &mut [u8], idx: usize) -> Result<()> {
    let mut hdr = NodeHeader::decode(buf)?;
    let n = hdr.recs_count as usize;
    if idx >= n {
        return Err(VdfsError::Bug("removing a missing record slot"));
    }
    let size = buf.len();
    let data_end = size - CRC_LEN - SLOT_LEN * n - hdr.free_space as usize;
    let off = le::get_u16(buf, slot_pos(size, idx)) as usize;
    let len = RECORD_HDR_LEN + le::get_u16(buf, off) as usize + le::get_u16(buf, off + 2) as usize;
    buf.copy_within(off + len..data_end, off);
    buf[data_end - len..data_end].fill(0);
    for i in 0..n {
        if i == idx {
            continue;
        }
        let pos = slot_pos(size, i);
        let other = le::get_u16(buf, pos) as usize;
        if other > off {
            le::put_u16(buf, pos, (other - len) as u16);
        }
    }
    for i in idx..n - 1 {
        let next = le::get_u16(buf, slot_pos(size, i + 1));
        le::put_u16(buf, slot_pos(size, i), next);
    }
    le::put_u16(buf, slot_pos(size, n - 1), 0);
    hdr.recs_count -= 1;
    hdr.free_space += (len + SLOT_LEN) as u32;
    hdr.encode(buf);
    Ok(())
}

/// Replaces the whole record set, keeping identity and links.
pub fn rewrite(buf: &mut [u8], records: &[(Vec<u8>, Vec<u8>)]) -> Result<()> {
    let hdr = NodeHeader::decode(buf)?;
    init(buf, hdr.node_id, hdr.kind);
    update_header(buf, |fresh| {
        fresh.version = hdr.version;
        fresh.prev = hdr.prev;
        fresh.next = hdr.next;
    })?;
    for (idx, (key, val)) in records.iter().enumerate() {
        insert_at(buf, idx, key, val)?;
    }
    Ok(())
}

/// Split point for `records` such that each half fits in `usable` bytes.
pub fn split_point(records: &[(Vec<u8>, Vec<u8>)]) -> usize {
    let total: usize = records.iter().map(|(k, v)| footprint(k.len(), v.len())).sum();
    let mut acc = 0;
    for (idx, (k, v)) in records.iter().enumerate() {
        acc += footprint(k.len(), v.len());
        if acc * 2 >= total {
            return (idx + 1).clamp(1, records.len().saturating_sub(1).max(1));
        }
    }
    records.len() / 2
}

/// Encodes a child pointer for an index record.
pub fn child_value(id: NodeId) -> [u8; 4] {
    id.0.to_le_bytes()
}
