#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};

use tracing_subscriber::EnvFilter;
use vdfs::admin::{verify_volume, VerifyLevel};
use vdfs::primitives::io::MemDevice;
use vdfs::{FormatOptions, MountOptions, Result, Volume};

const BS: usize = 512;
const BLOCKS: u64 = 4096;
const KEYS: u32 = 240;

fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("vdfs::bnode=debug,vdfs::volume=info"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .with_ansi(false)
            .try_init();
    });
}

fn format_options() -> FormatOptions {
    FormatOptions {
        block_size: BS,
        total_blocks: BLOCKS,
        blocks_per_node: 2,
        erase_block_blocks: 16,
        max_ext_tables: 4,
        catalog_nodes: 256,
        extents_nodes: 64,
        xattr_nodes: 64,
        inode_count: 1024,
        max_record_len: 0,
    }
}

fn key(n: u32) -> [u8; 4] {
    n.to_be_bytes()
}

fn value(n: u32) -> Vec<u8> {
    vec![(n % 251) as u8; 40]
}

fn populated() -> Result<Arc<MemDevice>> {
    let mem = Arc::new(MemDevice::new(BS, BLOCKS));
    Volume::format(mem.clone(), &format_options())?;
    let vol = Volume::mount(mem.clone(), MountOptions::default())?;
    for n in 0..KEYS {
        vol.catalog().insert(&key(n), &value(n))?;
    }
    vol.unmount()?;
    Ok(mem)
}

#[test]
fn small_cache_evicts_and_refaults() -> Result<()> {
    init_tracing();
    let mem = populated()?;
    let vol = Volume::mount(mem, MountOptions::parse("ro,cache=4")?)?;
    let check = vol.catalog().check()?;
    assert!(check.leaves > 8, "tree too small to exercise eviction: {check:?}");

    for n in 0..KEYS {
        assert_eq!(vol.catalog().find(&key(n))?, Some(value(n)));
    }
    let first = vol.catalog().store().stats();
    for n in 0..KEYS {
        assert_eq!(vol.catalog().find(&key(n))?, Some(value(n)));
    }
    let second = vol.catalog().store().stats();

    assert!(second.disk_reads > first.disk_reads);
    assert!(second.cache_hits > 0);
    // the head stays referenced; everything else is evictable
    assert!(second.cached_chunks <= 4 + 1, "{second:?}");
    assert_eq!(second.live_nodes, 1);
    assert_eq!(second.validation_failures, 0);
    Ok(())
}

#[test]
fn large_cache_serves_repeat_lookups() -> Result<()> {
    let mem = populated()?;
    let vol = Volume::mount(mem, MountOptions::parse("ro")?)?;
    for n in 0..KEYS {
        vol.catalog().find(&key(n))?;
    }
    let warm = vol.catalog().store().stats();
    for n in 0..KEYS {
        vol.catalog().find(&key(n))?;
    }
    let hot = vol.catalog().store().stats();
    assert_eq!(hot.disk_reads, warm.disk_reads);
    assert_eq!(hot.cached_chunks, warm.cached_chunks);
    Ok(())
}

#[test]
fn concurrent_readers_writer_and_sync() -> Result<()> {
    init_tracing();
    let mem = populated()?;
    let vol = Volume::mount(mem.clone(), MountOptions::parse("cache=16")?)?;
    let done = AtomicBool::new(false);

    std::thread::scope(|scope| -> Result<()> {
        let readers: Vec<_> = (0..4u32)
            .map(|r| {
                let vol = &vol;
                let done = &done;
                scope.spawn(move || -> Result<u64> {
                    let mut hits = 0u64;
                    let mut n = r;
                    while !done.load(Ordering::Acquire) || hits < u64::from(KEYS) {
                        let k = n % KEYS;
                        assert_eq!(vol.catalog().find(&key(k))?, Some(value(k)));
                        hits += 1;
                        n = n.wrapping_add(7);
                    }
                    Ok(hits)
                })
            })
            .collect();

        let writer = scope.spawn(|| -> Result<()> {
            for n in 0..120u32 {
                vol.catalog().insert(&key(KEYS + n), &value(n))?;
                vol.xattr().insert(format!("user.{n}").as_bytes(), b"x")?;
                if n % 20 == 19 {
                    vol.sync()?;
                }
            }
            Ok(())
        });

        let syncer = scope.spawn(|| -> Result<()> {
            for _ in 0..10 {
                vol.sync()?;
                std::thread::yield_now();
            }
            Ok(())
        });

        let wrote = writer.join().expect("writer panicked");
        let synced = syncer.join().expect("syncer panicked");
        done.store(true, Ordering::Release);
        for reader in readers {
            let hits = reader.join().expect("reader panicked")?;
            assert!(hits >= u64::from(KEYS));
        }
        wrote?;
        synced
    })?;

    vol.sync()?;
    assert_eq!(vol.catalog().check()?.records, u64::from(KEYS) + 120);
    assert_eq!(vol.xattr().check()?.records, 120);
    for tree in vol.trees() {
        let stats = tree.store().stats();
        assert_eq!(stats.live_nodes, 1, "{}", tree.object());
        assert_eq!(stats.dirty_chunks, 0);
    }
    let report = verify_volume(&vol, VerifyLevel::Full);
    assert!(report.success, "{:?}", report.findings);
    vol.unmount()?;

    let vol = Volume::mount(mem, MountOptions::parse("ro")?)?;
    assert_eq!(vol.catalog().find(&key(KEYS + 119))?, Some(value(119)));
    Ok(())
}

#[test]
fn bnode_handles_are_released_after_each_operation() -> Result<()> {
    let mem = populated()?;
    let vol = Volume::mount(mem, MountOptions::default())?;
    for n in (0..KEYS).step_by(3) {
        vol.catalog().remove(&key(n))?;
    }
    vol.catalog().replace(&key(1), b"short")?;
    let stats = vol.catalog().store().stats();
    assert_eq!(stats.live_nodes, 1);
    assert_eq!(stats.reentrant_gets, 0);
    assert!(stats.dirty_chunks > 0);
    vol.sync()?;
    assert_eq!(vol.catalog().store().stats().dirty_chunks, 0);
    assert_eq!(vol.catalog().find(&key(1))?, Some(b"short".to_vec()));
    assert_eq!(vol.catalog().find(&key(0))?, None);
    vol.unmount()
}
