#![allow(missing_docs)]

use std::sync::Arc;

use vdfs::admin::{verify_volume, VerifyLevel, VerifySeverity};
use vdfs::primitives::io::MemDevice;
use vdfs::storage::fsm::AllocFlags;
use vdfs::{FormatOptions, MountOptions, Result, SpecialFile, SyncOutcome, VdfsError, Volume};

const BS: usize = 512;
const BLOCKS: u64 = 2048;

fn format_options() -> FormatOptions {
    FormatOptions {
        block_size: BS,
        total_blocks: BLOCKS,
        blocks_per_node: 2,
        erase_block_blocks: 16,
        max_ext_tables: 4,
        catalog_nodes: 64,
        extents_nodes: 32,
        xattr_nodes: 16,
        inode_count: 1024,
        max_record_len: 0,
    }
}

/// Formats a volume with a few catalog records and returns the device and
/// the physical block of the catalog root.
fn volume_with_catalog() -> Result<(Arc<MemDevice>, u64)> {
    let mem = Arc::new(MemDevice::new(BS, BLOCKS));
    Volume::format(mem.clone(), &format_options())?;
    let vol = Volume::mount(mem.clone(), MountOptions::default())?;
    for n in 0..20u32 {
        vol.catalog().insert(&n.to_be_bytes(), b"record")?;
    }
    vol.sync()?;
    let root = u64::from(vol.catalog().root_id()?.0) * 2;
    let phys = vol
        .get_meta_iblock(SpecialFile::CatalogTree, root)?
        .ok_or(VdfsError::NotFound)?;
    vol.unmount()?;
    Ok((mem, phys))
}

#[test]
fn corrupted_node_flips_volume_read_only() -> Result<()> {
    let (mem, root) = volume_with_catalog()?;
    mem.corrupt_byte(root * BS as u64 + 300, 0x80);

    let vol = Volume::mount(mem, MountOptions::parse("retries=2")?)?;
    vol.xattr().insert(b"user.before", b"ok")?;
    assert!(matches!(
        vol.catalog().find(&3u32.to_be_bytes()),
        Err(VdfsError::Corruption(_))
    ));
    assert!(vol.is_read_only());
    assert_eq!(vol.errors().fatal_count(), 1);

    let stats = vol.catalog().store().stats();
    assert_eq!(stats.validation_failures, 1);
    // head at mount, then the first read and two retries of the root
    assert_eq!(stats.disk_reads, 4);

    assert!(matches!(vol.xattr().insert(b"user.after", b"no"), Err(VdfsError::ReadOnly)));
    assert!(matches!(vol.sync(), Err(VdfsError::ReadOnly)));
    assert!(matches!(vol.alloc_ino(), Err(VdfsError::ReadOnly)));
    // reads of healthy trees keep working
    assert_eq!(vol.xattr().find(b"user.before")?, Some(b"ok".to_vec()));
    vol.unmount()
}

#[test]
#[should_panic(expected = "vdfs fatal error")]
fn panic_policy_aborts_on_corruption() {
    let (mem, root) = volume_with_catalog().expect("volume");
    mem.corrupt_byte(root * BS as u64 + 300, 0x80);
    let vol = Volume::mount(mem, MountOptions::parse("fatal=panic").expect("options"))
        .expect("mount succeeds before any node is read");
    let _ = vol.catalog().find(b"any");
}

#[test]
fn injected_read_error_is_not_fatal() -> Result<()> {
    let (mem, _) = volume_with_catalog()?;
    let vol = Volume::mount(mem, MountOptions::parse("count=1")?)?;
    assert!(matches!(
        vol.catalog().find(&1u32.to_be_bytes()),
        Err(VdfsError::Io(_))
    ));
    assert!(!vol.is_read_only());
    assert_eq!(vol.errors().fatal_count(), 0);
    assert_eq!(vol.catalog().find(&1u32.to_be_bytes())?, Some(b"record".to_vec()));
    vol.unmount()
}

#[test]
fn failed_sync_can_be_retried() -> Result<()> {
    let (mem, _) = volume_with_catalog()?;
    let vol = Volume::mount(mem.clone(), MountOptions::default())?;
    vol.catalog().insert(b"pending", b"write")?;
    vol.inject_errors(1);
    assert!(matches!(vol.sync(), Err(VdfsError::Io(_))));
    assert!(!vol.is_read_only());

    match vol.sync()? {
        SyncOutcome::Committed { chunks, .. } => assert!(chunks >= 1),
        SyncOutcome::Clean => panic!("retry must commit the pending change"),
    }
    vol.unmount()?;

    let vol = Volume::mount(mem, MountOptions::parse("ro")?)?;
    assert_eq!(vol.catalog().find(b"pending")?, Some(b"write".to_vec()));
    let report = verify_volume(&vol, VerifyLevel::Full);
    assert!(report.success, "{:?}", report.findings);
    Ok(())
}

#[test]
fn double_frees_are_bugs() -> Result<()> {
    let (mem, _) = volume_with_catalog()?;
    let vol = Volume::mount(mem.clone(), MountOptions::default())?;
    let ext = vol.alloc_data_blocks(0, 4, AllocFlags::NONE)?;
    vol.free_data_blocks(ext.start, ext.len)?;
    assert!(matches!(
        vol.free_data_blocks(ext.start, ext.len),
        Err(VdfsError::Bug(_))
    ));
    assert!(vol.is_read_only());
    drop(vol);

    let vol = Volume::mount(mem, MountOptions::default())?;
    let ino = vol.alloc_ino()?;
    vol.free_ino(ino)?;
    assert!(matches!(vol.free_ino(ino), Err(VdfsError::Bug(_))));
    assert!(vol.is_read_only());
    assert_eq!(vol.errors().fatal_count(), 1);
    Ok(())
}

#[test]
fn verify_reports_corruption_without_panicking() -> Result<()> {
    let (mem, root) = volume_with_catalog()?;
    mem.corrupt_byte(root * BS as u64 + 300, 0x80);
    let vol = Volume::mount(mem, MountOptions::parse("ro,fatal=ro")?)?;

    let fast = verify_volume(&vol, VerifyLevel::Fast);
    assert!(fast.success, "{:?}", fast.findings);

    let full = verify_volume(&vol, VerifyLevel::Full);
    assert!(!full.success);
    assert!(full
        .findings
        .iter()
        .any(|f| f.severity == VerifySeverity::Error && f.message.contains("catalog")));
    assert_eq!(full.counts.trees.len(), 2);
    Ok(())
}
