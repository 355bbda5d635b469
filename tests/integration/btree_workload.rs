#![allow(missing_docs)]

use std::collections::BTreeMap;
use std::sync::Arc;

use rand::prelude::*;
use rand_chacha::ChaCha8Rng;
use vdfs::admin::{verify_volume, VerifyLevel};
use vdfs::primitives::io::MemDevice;
use vdfs::{FormatOptions, MountOptions, Result, VdfsError, Volume};

const BS: usize = 512;
const BLOCKS: u64 = 8192;
const KEY_SPACE: u32 = 600;
const OPS: usize = 4_000;
const SYNC_EVERY: usize = 97;
const REMOUNT_EVERY: usize = 1_000;
const SEED: u64 = 0x0b7e_e5ed;

type Model = [BTreeMap<Vec<u8>, Vec<u8>>; 3];

fn format_options() -> FormatOptions {
    FormatOptions {
        block_size: BS,
        total_blocks: BLOCKS,
        blocks_per_node: 2,
        erase_block_blocks: 32,
        max_ext_tables: 6,
        catalog_nodes: 512,
        extents_nodes: 512,
        xattr_nodes: 256,
        inode_count: 4096,
        max_record_len: 0,
    }
}

fn random_key(rng: &mut ChaCha8Rng, tree: usize) -> Vec<u8> {
    let n = rng.gen_range(0..KEY_SPACE);
    match tree {
        0 => n.to_be_bytes().to_vec(),
        1 => {
            // inode number then logical offset
            let mut k = (u64::from(n / 8) + 16).to_be_bytes().to_vec();
            k.extend_from_slice(&u64::from(n % 8 * 64).to_be_bytes());
            k
        }
        _ => format!("user.attr.{n:04}").into_bytes(),
    }
}

fn random_value(rng: &mut ChaCha8Rng) -> Vec<u8> {
    let len = rng.gen_range(0..64);
    (0..len).map(|_| rng.gen()).collect()
}

fn assert_matches(vol: &Volume, model: &Model) -> Result<()> {
    for (tree, expected) in vol.trees().iter().zip(model.iter()) {
        let actual = tree.collect()?;
        let expected: Vec<_> = expected.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        assert_eq!(actual.len(), expected.len(), "{}", tree.object());
        assert!(actual == expected, "{} contents diverged", tree.object());
        assert_eq!(tree.check()?.records, expected.len() as u64);
    }
    Ok(())
}

fn step(vol: &Volume, model: &mut Model, rng: &mut ChaCha8Rng) -> Result<()> {
    let t = rng.gen_range(0..3);
    let tree = &vol.trees()[t];
    let key = random_key(rng, t);
    let present = model[t].contains_key(&key);
    match rng.gen_range(0..10) {
        0..=4 => {
            let value = random_value(rng);
            match tree.insert(&key, &value) {
                Ok(()) => {
                    assert!(!present);
                    model[t].insert(key, value);
                }
                Err(VdfsError::Exists) => assert!(present),
                Err(err) => return Err(err),
            }
        }
        5 | 6 => {
            let value = random_value(rng);
            match tree.replace(&key, &value) {
                Ok(()) => {
                    assert!(present);
                    model[t].insert(key, value);
                }
                Err(VdfsError::NotFound) => assert!(!present),
                Err(err) => return Err(err),
            }
        }
        7 | 8 => match tree.remove(&key) {
            Ok(()) => {
                assert!(model[t].remove(&key).is_some());
            }
            Err(VdfsError::NotFound) => assert!(!present),
            Err(err) => return Err(err),
        },
        _ => {
            assert_eq!(tree.find(&key)?.as_ref(), model[t].get(&key));
        }
    }
    Ok(())
}

#[test]
fn randomized_workload_matches_model_across_remounts() -> Result<()> {
    let mem = Arc::new(MemDevice::new(BS, BLOCKS));
    Volume::format(mem.clone(), &format_options())?;
    let mut rng = ChaCha8Rng::seed_from_u64(SEED);
    let mut model: Model = Default::default();

    let mut vol = Volume::mount(mem.clone(), MountOptions::default())?;
    for op in 1..=OPS {
        step(&vol, &mut model, &mut rng)?;
        if op % SYNC_EVERY == 0 {
            vol.sync()?;
            vol.fsm().check_consistency()?;
        }
        if op % REMOUNT_EVERY == 0 {
            vol.unmount()?;
            vol = Volume::mount(mem.clone(), MountOptions::default())?;
            assert_matches(&vol, &model)?;
        }
    }
    assert_matches(&vol, &model)?;
    let report = verify_volume(&vol, VerifyLevel::Full);
    assert!(report.success, "{:?}", report.findings);
    vol.unmount()?;

    let vol = Volume::mount(mem, MountOptions::parse("ro")?)?;
    assert_matches(&vol, &model)
}

#[test]
fn scan_from_key_visits_suffix_in_order() -> Result<()> {
    let mem = Arc::new(MemDevice::new(BS, BLOCKS));
    Volume::format(mem.clone(), &format_options())?;
    let vol = Volume::mount(mem, MountOptions::default())?;
    let mut rng = ChaCha8Rng::seed_from_u64(SEED ^ 1);
    let mut keys: Vec<u32> = (0..KEY_SPACE).collect();
    keys.shuffle(&mut rng);
    for k in &keys {
        vol.catalog().insert(&k.to_be_bytes(), &k.to_le_bytes())?;
    }

    let start = 250u32;
    let mut seen = Vec::new();
    vol.catalog().scan(Some(&start.to_be_bytes()), |k, v| {
        let n = u32::from_be_bytes(k.try_into().expect("4-byte key"));
        assert_eq!(v, n.to_le_bytes());
        seen.push(n);
        seen.len() < 100
    })?;
    let expected: Vec<u32> = (start..start + 100).collect();
    assert_eq!(seen, expected);

    // drain the tree back to a single empty leaf
    for k in &keys {
        vol.catalog().remove(&k.to_be_bytes())?;
    }
    let check = vol.catalog().check()?;
    assert_eq!(check.records, 0);
    assert_eq!(check.leaves, 1);
    vol.sync()?;
    vol.unmount()
}

#[test]
fn oversized_and_empty_keys_are_rejected() -> Result<()> {
    let mem = Arc::new(MemDevice::new(BS, BLOCKS));
    Volume::format(mem.clone(), &format_options())?;
    let vol = Volume::mount(mem, MountOptions::default())?;
    let max = vol.catalog().max_record_len();
    assert!(matches!(
        vol.catalog().insert(b"", b"v"),
        Err(VdfsError::Invalid(_))
    ));
    assert!(matches!(
        vol.catalog().insert(b"k", &vec![0u8; max]),
        Err(VdfsError::Invalid(_))
    ));
    vol.catalog().insert(b"k", &vec![7u8; max - 1])?;
    assert!(!vol.is_read_only());
    vol.unmount()
}
