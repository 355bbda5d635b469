//! Bnode header codecs.
//!
//! Regular nodes start with a 32-byte header; the head node (id 0) carries
//! tree metadata followed by the inline free-id bitmap. Both end with a
//! CRC32 over the rest of the node.

use std::convert::TryFrom;
use std::ops::Range;

use crate::primitives::bytes::le;
use crate::types::checksum::CRC_LEN;
use crate::types::{NodeId, Result, SpecialFile, VdfsError, Version};

/// Magic of regular bnodes.
pub const BNODE_MAGIC: u16 = 0x644E;
/// Magic of the head node.
pub const HEAD_MAGIC: [u8; 4] = *b"eHND";
/// Length of the regular node header.
pub const NODE_HDR_LEN: usize = 32;
/// Offset of the free-id bitmap in the head node.
pub const HEAD_BITMAP_OFFSET: usize = 32;

mod node {
    use super::Range;
    pub const MAGIC: Range<usize> = 0..2;
    pub const MOUNT: Range<usize> = 2..6;
    pub const SYNC: Range<usize> = 6..10;
    pub const FREE_SPACE: Range<usize> = 10..14;
    pub const RECS: Range<usize> = 14..16;
    pub const NODE_ID: Range<usize> = 16..20;
    pub const PREV: Range<usize> = 20..24;
    pub const NEXT: Range<usize> = 24..28;
    pub const KIND: Range<usize> = 28..30;
}

mod head {
    use super::Range;
    pub const MAGIC: Range<usize> = 0..4;
    pub const MOUNT: Range<usize> = 4..8;
    pub const SYNC: Range<usize> = 8..12;
    pub const ROOT: Range<usize> = 12..16;
    pub const HEIGHT: Range<usize> = 16..18;
    pub const OBJECT: Range<usize> = 18..20;
    pub const NODE_SIZE: Range<usize> = 20..24;
    pub const MAX_RECORD: Range<usize> = 24..26;
    pub const ID_LIMIT: Range<usize> = 28..32;
}

/// Role of a regular node.
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Index = 1,
    Leaf = 2,
}

impl TryFrom<u16> for NodeKind {
    type Error = VdfsError;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            1 => Ok(NodeKind::Index),
            2 => Ok(NodeKind::Leaf),
            _ => Err(VdfsError::Corruption("unknown bnode kind")),
        }
    }
}

/// Decoded regular node header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeHeader {
    pub version: Version,
    /// Unused bytes between the record area and the offset table.
    pub free_space: u32,
    pub recs_count: u16,
    pub node_id: NodeId,
    /// Left sibling, `NodeId(0)` when none.
    pub prev: NodeId,
    /// Right sibling, `NodeId(0)` when none.
    pub next: NodeId,
    pub kind: NodeKind,
}

impl NodeHeader {
    /// Header of an empty node of `node_size` bytes.
    pub fn empty(node_id: NodeId, kind: NodeKind, node_size: usize) -> Self {
        Self {
            version: Version::default(),
            free_space: (node_size - NODE_HDR_LEN - CRC_LEN) as u32,
            recs_count: 0,
            node_id,
            prev: NodeId(0),
            next: NodeId(0),
            kind,
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < NODE_HDR_LEN + CRC_LEN {
            return Err(VdfsError::Corruption("bnode shorter than header"));
        }
        if le::get_u16(buf, node::MAGIC.start) != BNODE_MAGIC {
            return Err(VdfsError::Corruption("bnode magic mismatch"));
        }
        Ok(Self {
            version: Version::new(
                le::get_u32(buf, node::MOUNT.start),
                le::get_u32(buf, node::SYNC.start),
            ),
            free_space: le::get_u32(buf, node::FREE_SPACE.start),
            recs_count: le::get_u16(buf, node::RECS.start),
            node_id: NodeId(le::get_u32(buf, node::NODE_ID.start)),
            prev: NodeId(le::get_u32(buf, node::PREV.start)),
            next: NodeId(le::get_u32(buf, node::NEXT.start)),
            kind: NodeKind::try_from(le::get_u16(buf, node::KIND.start))?,
        })
    }

    pub fn encode(&self, buf: &mut [u8]) {
        le::put_u16(buf, node::MAGIC.start, BNODE_MAGIC);
        le::put_u32(buf, node::MOUNT.start, self.version.mount_count);
        le::put_u32(buf, node::SYNC.start, self.version.sync_count);
        le::put_u32(buf, node::FREE_SPACE.start, self.free_space);
        le::put_u16(buf, node::RECS.start, self.recs_count);
        le::put_u32(buf, node::NODE_ID.start, self.node_id.0);
        le::put_u32(buf, node::PREV.start, self.prev.0);
        le::put_u32(buf, node::NEXT.start, self.next.0);
        le::put_u16(buf, node::KIND.start, self.kind as u16);
    }
}

/// Decoded head-node metadata.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeadHeader {
    pub version: Version,
    pub root: NodeId,
    /// Levels in the tree; 1 when the root is a leaf.
    pub height: u16,
    pub object: SpecialFile,
    pub node_size: u32,
    pub max_record_len: u16,
    /// Node ids below this bound are addressable.
    pub id_limit: u32,
}

impl HeadHeader {
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf[head::MAGIC] != HEAD_MAGIC {
            return Err(VdfsError::Corruption("head node magic mismatch"));
        }
        let parsed = Self {
            version: Version::new(
                le::get_u32(buf, head::MOUNT.start),
                le::get_u32(buf, head::SYNC.start),
            ),
            root: NodeId(le::get_u32(buf, head::ROOT.start)),
            height: le::get_u16(buf, head::HEIGHT.start),
            object: SpecialFile::from_raw(u64::from(le::get_u16(buf, head::OBJECT.start)))?,
            node_size: le::get_u32(buf, head::NODE_SIZE.start),
            max_record_len: le::get_u16(buf, head::MAX_RECORD.start),
            id_limit: le::get_u32(buf, head::ID_LIMIT.start),
        };
        if parsed.node_size as usize != buf.len() {
            return Err(VdfsError::Corruption("head node size mismatch"));
        }
        if HEAD_BITMAP_OFFSET + (parsed.id_limit as usize).div_ceil(8) > buf.len() - CRC_LEN {
            return Err(VdfsError::Corruption("head id bitmap overflows node"));
        }
        Ok(parsed)
    }

    pub fn encode(&self, buf: &mut [u8]) {
        buf[head::MAGIC].copy_from_slice(&HEAD_MAGIC);
        le::put_u32(buf, head::MOUNT.start, self.version.mount_count);
        le::put_u32(buf, head::SYNC.start, self.version.sync_count);
        le::put_u32(buf, head::ROOT.start, self.root.0);
        le::put_u16(buf, head::HEIGHT.start, self.height);
        le::put_u16(buf, head::OBJECT.start, self.object as u16);
        le::put_u32(buf, head::NODE_SIZE.start, self.node_size);
        le::put_u16(buf, head::MAX_RECORD.start, self.max_record_len);
        le::put_u32(buf, head::ID_LIMIT.start, self.id_limit);
    }

    /// Updates root and height in place.
    pub fn set_root(buf: &mut [u8], root: NodeId, height: u16) {
        le::put_u32(buf, head::ROOT.start, root.0);
        le::put_u16(buf, head::HEIGHT.start, height);
    }
}

fn version_range(is_head: bool) -> (usize, usize) {
    if is_head {
        (head::MOUNT.start, head::SYNC.start)
    } else {
        (node::MOUNT.start, node::SYNC.start)
    }
}

/// Reads the version stamp of a node image.
pub fn version_of(buf: &[u8], is_head: bool) -> Version {
    let (mount, sync) = version_range(is_head);
    Version::new(le::get_u32(buf, mount), le::get_u32(buf, sync))
}

/// Writes the version stamp of a node image.
pub fn stamp_version(buf: &mut [u8], is_head: bool, version: Version) {
    let (mount, sync) = version_range(is_head);
    le::put_u32(buf, mount, version.mount_count);
    le::put_u32(buf, sync, version.sync_count);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_header_roundtrip_and_magic_check() -> Result<()> {
        let mut buf = vec![0u8; 512];
        let mut hdr = NodeHeader::empty(NodeId(7), NodeKind::Leaf, 512);
        hdr.next = NodeId(9);
        hdr.encode(&mut buf);
        assert_eq!(NodeHeader::decode(&buf)?, hdr);
        assert_eq!(hdr.free_space, 512 - 36);
        buf[0] ^= 1;
        assert!(matches!(
            NodeHeader::decode(&buf),
            Err(VdfsError::Corruption(_))
        ));
        Ok(())
    }

    #[test]
    fn version_stamp_lands_in_the_right_place() {
        let mut node = vec![0u8; 64];
        let mut headbuf = vec![0u8; 64];
        stamp_version(&mut node, false, Version::new(4, 2));
        stamp_version(&mut headbuf, true, Version::new(4, 2));
        assert_eq!(version_of(&node, false), Version::new(4, 2));
        assert_eq!(version_of(&headbuf, true), Version::new(4, 2));
        assert_eq!(&node[2..6], &4u32.to_le_bytes());
        assert_eq!(&headbuf[4..8], &4u32.to_le_bytes());
    }

    #[test]
    fn head_header_validates_geometry() -> Result<()> {
        let mut buf = vec![0u8; 256];
        let hdr = HeadHeader {
            version: Version::new(1, 0),
            root: NodeId(1),
            height: 1,
            object: SpecialFile::CatalogTree,
            node_size: 256,
            max_record_len: 100,
            id_limit: 64,
        };
        hdr.encode(&mut buf);
        assert_eq!(HeadHeader::decode(&buf)?, hdr);
        HeadHeader::set_root(&mut buf, NodeId(5), 2);
        let moved = HeadHeader::decode(&buf)?;
        assert_eq!((moved.root, moved.height), (NodeId(5), 2));
        assert!(HeadHeader::decode(&buf[..128]).is_err());
        Ok(())
    }
}
