#![allow(missing_docs)]

use std::sync::Arc;

use vdfs::admin::{verify_volume, VerifyLevel};
use vdfs::primitives::io::MemDevice;
use vdfs::storage::snapshot::CommitKind;
use vdfs::{FormatOptions, MountOptions, Result, SyncOutcome, Version, Volume};

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

fn formatted() -> Result<Arc<MemDevice>> {
    let mem = Arc::new(MemDevice::new(BS, BLOCKS));
    Volume::format(mem.clone(), &format_options())?;
    Ok(mem)
}

fn commit_kind(outcome: SyncOutcome) -> CommitKind {
    match outcome {
        SyncOutcome::Committed { kind, .. } => kind,
        SyncOutcome::Clean => panic!("expected a commit"),
    }
}

fn key(n: u32) -> [u8; 4] {
    n.to_be_bytes()
}

#[test]
fn extended_tables_fill_then_fold() -> Result<()> {
    let mem = formatted()?;
    let vol = Volume::mount(mem.clone(), MountOptions::default())?;
    assert_eq!(vol.snapshot().stats().active_half, 0);

    let mut kinds = Vec::new();
    for n in 0..6u32 {
        vol.catalog().insert(&key(n), b"v")?;
        kinds.push(commit_kind(vol.sync()?));
    }
    assert_eq!(
        kinds,
        vec![
            CommitKind::Extended { slot: 0, version: Version::new(2, 0) },
            CommitKind::Extended { slot: 1, version: Version::new(2, 1) },
            CommitKind::Extended { slot: 2, version: Version::new(2, 2) },
            CommitKind::Extended { slot: 3, version: Version::new(2, 3) },
            CommitKind::Base { half: 1, version: Version::new(2, 4) },
            CommitKind::Extended { slot: 0, version: Version::new(2, 5) },
        ]
    );
    assert_eq!(vol.snapshot().epoch(), Version::new(2, 6));
    assert_eq!(vol.snapshot().stats().folds, 1);
    vol.snapshot().verify_against_fsm()?;
    vol.unmount()?;

    let vol = Volume::mount(mem, MountOptions::default())?;
    let stats = vol.snapshot().stats();
    assert_eq!(stats.active_half, 1);
    assert_eq!(stats.ext_tables_written, 1);
    assert_eq!(vol.snapshot().epoch(), Version::new(3, 0));
    assert_eq!(vol.catalog().check()?.records, 6);
    vol.unmount()
}

#[test]
fn stale_extended_tables_are_ignored_after_folding_back() -> Result<()> {
    let mem = formatted()?;
    let mut expected = 0u32;
    // every remount replays a different mix of base and extended tables
    for round in 0..4 {
        let vol = Volume::mount(mem.clone(), MountOptions::default())?;
        assert_eq!(vol.catalog().check()?.records as u32, expected, "round {round}");
        for _ in 0..5 {
            vol.catalog().insert(&key(expected), &[round as u8; 24])?;
            expected += 1;
            vol.sync()?;
        }
        let report = verify_volume(&vol, VerifyLevel::Full);
        assert!(report.success, "{:?}", report.findings);
        vol.unmount()?;
    }

    let vol = Volume::mount(mem, MountOptions::parse("ro")?)?;
    let records = vol.catalog().collect()?;
    assert_eq!(records.len() as u32, expected);
    for (n, (k, _)) in records.iter().enumerate() {
        assert_eq!(k.as_slice(), key(n as u32));
    }
    Ok(())
}

#[test]
fn relocated_blocks_wait_for_commit() -> Result<()> {
    let vol = Volume::mount(formatted()?, MountOptions::default())?;
    let root = u64::from(vol.catalog().root_id()?.0) * 2;
    let before = vol.get_meta_iblock(vdfs::SpecialFile::CatalogTree, root)?;

    vol.catalog().insert(b"alpha", b"1")?;
    let after = vol.get_meta_iblock(vdfs::SpecialFile::CatalogTree, root)?;
    assert_ne!(before, after);
    let old = before.expect("root is mapped");
    assert!(!vol.fsm().is_allocated(old));
    assert!(vol.fsm().stats().next_free_blocks >= 2);

    // a second change in the same epoch does not move the root again
    vol.catalog().insert(b"beta", b"2")?;
    assert_eq!(vol.get_meta_iblock(vdfs::SpecialFile::CatalogTree, root)?, after);

    vol.sync()?;
    let stats = vol.fsm().stats();
    assert_eq!(stats.next_free_blocks, 0);
    assert_eq!(stats.pending_extents, 0);
    vol.fsm().check_consistency()?;
    vol.unmount()
}

#[test]
fn crash_before_table_commit_keeps_previous_generation() -> Result<()> {
    let mem = formatted()?;
    let vol = Volume::mount(mem.clone(), MountOptions::default())?;
    for n in 0..40u32 {
        vol.catalog().insert(&key(n), b"durable")?;
    }
    vol.sync()?;
    for n in 40..80u32 {
        vol.catalog().insert(&key(n), b"lost")?;
    }
    vol.xattr().insert(b"user.lost", b"1")?;
    let before_sync = mem.snapshot();
    vol.sync()?;

    // chunks reached their new homes but the tables never did
    let sb = vol.superblock().clone();
    let tables = (sb.tables_start as usize * BS)..(sb.first_data_block() as usize * BS);
    let mut crashed = mem.snapshot();
    crashed[tables.clone()].copy_from_slice(&before_sync[tables]);
    drop(vol);
    mem.restore(&crashed);

    let vol = Volume::mount(mem, MountOptions::default())?;
    assert_eq!(vol.catalog().check()?.records, 40);
    assert_eq!(vol.catalog().find(&key(39))?, Some(b"durable".to_vec()));
    assert_eq!(vol.catalog().find(&key(40))?, None);
    assert_eq!(vol.xattr().find(b"user.lost")?, None);
    let report = verify_volume(&vol, VerifyLevel::Full);
    assert!(report.success, "{:?}", report.findings);

    // the recovered volume keeps working
    vol.catalog().insert(&key(40), b"again")?;
    vol.sync()?;
    vol.unmount()
}

#[test]
fn read_only_mount_leaves_the_image_untouched() -> Result<()> {
    let mem = formatted()?;
    let vol = Volume::mount(mem.clone(), MountOptions::default())?;
    vol.catalog().insert(b"k", b"v")?;
    vol.unmount()?;

    let image = mem.snapshot();
    let vol = Volume::mount(mem.clone(), MountOptions::parse("ro")?)?;
    assert_eq!(vol.superblock().mount_count, 2);
    assert_eq!(vol.catalog().find(b"k")?, Some(b"v".to_vec()));
    assert!(matches!(vol.sync(), Err(vdfs::VdfsError::ReadOnly)));
    vol.unmount()?;
    assert!(mem.snapshot() == image);

    let vol = Volume::mount(mem, MountOptions::default())?;
    assert_eq!(vol.superblock().mount_count, 3);
    assert_eq!(vol.snapshot().epoch(), Version::new(3, 0));
    vol.unmount()
}
