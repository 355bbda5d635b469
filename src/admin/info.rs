use std::path::Path;

use serde::Serialize;

use crate::primitives::io::BlockDevice;
use crate::types::{SpecialFile, VdfsError, Version};
use crate::volume::{MountOptions, VolumeStats};

use crate::admin::util::open_volume;
use crate::admin::Result;

/// Geometry and counters of a mounted image.
#[derive(Clone, Debug, Serialize)]
pub struct InfoReport {
    pub path: String,
    pub stats: VolumeStats,
}

/// One mapped logical block of the translation table.
#[derive(Clone, Debug, Serialize)]
pub struct TableRow {
    pub object: SpecialFile,
    pub index: u64,
    pub phys: u64,
    pub version: Version,
}

/// Translation table as loaded at mount.
#[derive(Clone, Debug, Serialize)]
pub struct TableDump {
    pub active_half: u8,
    pub ext_tables: u32,
    pub rows: Vec<TableRow>,
}

/// Raw image of one bnode.
#[derive(Clone, Debug, Serialize)]
pub struct NodeDump {
    pub object: SpecialFile,
    pub node: u32,
    pub phys: u64,
    pub hex: String,
}

pub fn info(path: impl AsRef<Path>, opts: &MountOptions) -> Result<InfoReport> {
    let path = path.as_ref();
    let volume = open_volume(path, opts)?;
    Ok(InfoReport {
        path: path.display().to_string(),
        stats: volume.stats(),
    })
}

pub fn dump_table(path: impl AsRef<Path>, opts: &MountOptions) -> Result<TableDump> {
    let volume = open_volume(path.as_ref(), opts)?;
    let snapshot = volume.snapshot();
    let stats = snapshot.stats();
    let rows = snapshot
        .mapped_blocks()
        .into_iter()
        .map(|(object, index, entry)| TableRow {
            object,
            index,
            phys: entry.phys,
            version: entry.version,
        })
        .collect();
    Ok(TableDump {
        active_half: stats.active_half,
        ext_tables: stats.ext_tables_written,
        rows,
    })
}

/// Reads one node straight from the device, bypassing validation.
pub fn dump_node(
    path: impl AsRef<Path>,
    opts: &MountOptions,
    object: SpecialFile,
    node: u32,
) -> Result<NodeDump> {
    let volume = open_volume(path.as_ref(), opts)?;
    if !object.is_tree() {
        return Err(VdfsError::Invalid("special file is not a tree").into());
    }
    let sb = volume.superblock();
    let index = u64::from(node) * u64::from(sb.blocks_per_node);
    let phys = volume
        .get_meta_iblock(object, index)?
        .ok_or(VdfsError::NotFound)?;
    let mut buf = vec![0u8; sb.node_size()];
    volume.device().read_blocks(phys, &mut buf)?;
    Ok(NodeDump {
        object,
        node,
        phys,
        hex: hex::encode(&buf),
    })
}
