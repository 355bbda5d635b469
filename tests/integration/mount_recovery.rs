#![allow(missing_docs)]
#![cfg(unix)]

use std::fs::OpenOptions;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use tempfile::tempdir;
use vdfs::admin::{mkfs, open_device, verify, AdminError, Result, VerifyLevel};
use vdfs::primitives::io::MemDevice;
use vdfs::types::seal_crc32;
use vdfs::{FormatOptions, MountOptions, SpecialFile, VdfsError, Volume};

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

fn mount_file(path: &Path, opts: &str) -> Result<Volume> {
    let device = open_device(path, true)?;
    Ok(Volume::mount(device, MountOptions::parse(opts)?)?)
}

fn flip_byte(path: &Path, offset: u64) -> std::io::Result<()> {
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    let mut byte = [0u8; 1];
    file.read_exact_at(&mut byte, offset)?;
    byte[0] ^= 0x5a;
    file.write_all_at(&byte, offset)
}

fn image_with_records(dir: &Path, count: u32) -> Result<std::path::PathBuf> {
    let path = dir.join("vol.img");
    mkfs(&path, &format_options())?;
    let vol = mount_file(&path, "")?;
    for n in 0..count {
        vol.catalog().insert(&n.to_be_bytes(), b"payload")?;
    }
    vol.unmount()?;
    Ok(path)
}

#[test]
fn file_image_survives_remounts() -> Result<()> {
    let dir = tempdir()?;
    let path = image_with_records(dir.path(), 50)?;
    for expected_mount in 3..6u32 {
        let vol = mount_file(&path, "")?;
        assert_eq!(vol.superblock().mount_count, expected_mount);
        assert_eq!(vol.catalog().check()?.records, 50);
        vol.unmount()?;
    }
    Ok(())
}

#[test]
fn damaged_superblock_copy_falls_back_to_the_other() -> Result<()> {
    let dir = tempdir()?;
    let path = image_with_records(dir.path(), 10)?;

    flip_byte(&path, 200)?;
    let vol = mount_file(&path, "")?;
    assert_eq!(vol.superblock().mount_count, 3);
    assert_eq!(vol.catalog().check()?.records, 10);
    vol.unmount()?;

    // the read-write mount rewrote both copies
    flip_byte(&path, BS as u64 + 200)?;
    let vol = mount_file(&path, "ro")?;
    assert_eq!(vol.superblock().mount_count, 3);
    drop(vol);

    flip_byte(&path, 200)?;
    assert!(matches!(
        mount_file(&path, "ro"),
        Err(AdminError::Core(VdfsError::Corruption(_)))
    ));
    Ok(())
}

#[test]
fn signature_check_can_be_skipped() -> Result<()> {
    let dir = tempdir()?;
    let path = image_with_records(dir.path(), 5)?;
    {
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        for copy in 0..2u64 {
            let mut block = vec![0u8; BS];
            file.read_exact_at(&mut block, copy * BS as u64)?;
            block[..4].copy_from_slice(b"XXXX");
            seal_crc32(&mut block);
            file.write_all_at(&block, copy * BS as u64)?;
        }
    }

    assert!(matches!(
        mount_file(&path, "ro"),
        Err(AdminError::Core(VdfsError::Corruption(_)))
    ));
    let vol = mount_file(&path, "ro,dncs")?;
    assert_eq!(vol.catalog().check()?.records, 5);
    drop(vol);

    // a read-write mount writes a fresh superblock with the right signature
    let vol = mount_file(&path, "dncs")?;
    vol.unmount()?;
    let vol = mount_file(&path, "ro")?;
    assert_eq!(vol.catalog().check()?.records, 5);
    Ok(())
}

#[test]
fn torn_extended_table_rolls_back_one_sync() -> Result<()> {
    let mem = Arc::new(MemDevice::new(BS, BLOCKS));
    Volume::format(mem.clone(), &format_options())?;
    let vol = Volume::mount(mem.clone(), MountOptions::default())?;
    vol.catalog().insert(b"first", b"1")?;
    vol.sync()?;
    vol.catalog().insert(b"second", b"2")?;
    vol.sync()?;
    let layout = vol.superblock().layout();
    assert_eq!(vol.snapshot().stats().active_half, 0);
    drop(vol);

    let slot = layout.ext_slot(0, 1);
    mem.corrupt_byte(slot * BS as u64 + 40, 0xff);

    let vol = Volume::mount(mem.clone(), MountOptions::default())?;
    assert_eq!(vol.catalog().find(b"first")?, Some(b"1".to_vec()));
    assert_eq!(vol.catalog().find(b"second")?, None);
    assert_eq!(vol.snapshot().stats().ext_tables_written, 1);
    vol.snapshot().verify_against_fsm()?;

    vol.catalog().insert(b"third", b"3")?;
    vol.unmount()?;
    let vol = Volume::mount(mem, MountOptions::parse("ro")?)?;
    assert_eq!(vol.catalog().find(b"third")?, Some(b"3".to_vec()));
    assert_eq!(vol.catalog().check()?.records, 2);
    Ok(())
}

#[test]
fn missing_base_table_refuses_mount() -> Result<()> {
    let mem = Arc::new(MemDevice::new(BS, BLOCKS));
    let sb = Volume::format(mem.clone(), &format_options())?;
    let start = sb.layout().half_start(0);
    mem.corrupt_byte(start * BS as u64 + 100, 0x01);
    assert!(matches!(
        Volume::mount(mem, MountOptions::default()),
        Err(VdfsError::Corruption(_))
    ));
    Ok(())
}

#[test]
fn damaged_bitmap_page_refuses_mount() -> Result<()> {
    let mem = Arc::new(MemDevice::new(BS, BLOCKS));
    Volume::format(mem.clone(), &format_options())?;
    let vol = Volume::mount(mem.clone(), MountOptions::parse("ro")?)?;
    let phys = vol
        .get_meta_iblock(SpecialFile::FreeSpaceBitmap, 0)?
        .expect("bitmap page is mapped");
    drop(vol);

    mem.corrupt_byte(phys * BS as u64 + 64, 0x10);
    // mount-time failures are reported, never escalated
    let result = Volume::mount(mem, MountOptions::parse("fatal=panic")?);
    assert!(matches!(result, Err(VdfsError::Corruption(_))));
    Ok(())
}

#[test]
fn mount_options_from_toml() -> Result<()> {
    let mem = Arc::new(MemDevice::new(BS, BLOCKS));
    Volume::format(mem.clone(), &format_options())?;
    let opts = MountOptions::from_toml_str("read_only = true\ncache_chunks = 8\nfmask = 0o077\n")?;
    assert_eq!(opts.fmask, 0o077);
    let vol = Volume::mount(mem, opts)?;
    assert!(vol.is_read_only());
    assert_eq!(vol.options().cache_chunks, 8);
    assert!(matches!(
        MountOptions::from_toml_str("bogus = 1"),
        Err(VdfsError::Invalid(_))
    ));
    Ok(())
}

#[test]
fn offline_verify_reads_without_writing() -> Result<()> {
    let dir = tempdir()?;
    let path = image_with_records(dir.path(), 30)?;
    let before = std::fs::read(&path)?;
    let report = verify(&path, &MountOptions::default(), VerifyLevel::Full)?;
    assert!(report.success, "{:?}", report.findings);
    assert_eq!(report.counts.trees[0].check.records, 30);
    assert_eq!(std::fs::read(&path)?, before);
    Ok(())
}
