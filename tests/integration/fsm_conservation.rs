#![allow(missing_docs)]

use std::sync::Arc;

use proptest::prelude::*;
use vdfs::primitives::io::MemDevice;
use vdfs::storage::fsm::{
    AllocFlags, BitmapFile, FreeExtent, FreeFlags, FreeSpaceManager, FsmConfig, FSM_BITMAP_MAGIC,
};
use vdfs::{Result, VdfsError};

const BS: usize = 512;
const TOTAL: u64 = 512;
const FIRST: u64 = 16;
const ALIGN: u64 = 4;
const ERASE: u64 = 8;

fn manager(max_extents: usize) -> Result<(FreeSpaceManager, Arc<MemDevice>)> {
    let mem = Arc::new(MemDevice::new(BS, TOTAL));
    let mut bitmap = BitmapFile::create(FSM_BITMAP_MAGIC, BS, TOTAL);
    bitmap.set_range(0, FIRST)?;
    let config = FsmConfig {
        total_blocks: TOTAL,
        first_data_block: FIRST,
        erase_block_blocks: ERASE,
        align_blocks: ALIGN,
        max_extents,
    };
    let fsm = FreeSpaceManager::new(config, mem.clone(), bitmap)?;
    Ok((fsm, mem))
}

#[derive(Clone, Debug)]
enum Op {
    Alloc { hint: u64, len: u64, mode: u8 },
    Free { pick: usize, unused: bool },
    Reserve(u64),
    Release,
    Commit,
    Rebuild,
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        5 => (0..TOTAL, 1u64..24, 0u8..4).prop_map(|(hint, len, mode)| Op::Alloc { hint, len, mode }),
        4 => (any::<usize>(), any::<bool>()).prop_map(|(pick, unused)| Op::Free { pick, unused }),
        1 => (1u64..32).prop_map(Op::Reserve),
        1 => Just(Op::Release),
        2 => Just(Op::Commit),
        1 => Just(Op::Rebuild),
    ]
}

struct Model {
    held: Vec<FreeExtent>,
    reserved: u64,
}

fn check_invariants(fsm: &FreeSpaceManager, model: &Model) -> std::result::Result<(), TestCaseError> {
    fsm.check_consistency()
        .map_err(|err| TestCaseError::fail(format!("consistency: {err}")))?;
    let stats = fsm.stats();
    let held: u64 = model.held.iter().map(|e| e.len).sum();
    prop_assert_eq!(stats.allocated_blocks, held);
    prop_assert_eq!(stats.reserved_blocks, model.reserved);
    prop_assert_eq!(
        stats.free_blocks + stats.reserved_blocks + stats.next_free_blocks + stats.allocated_blocks,
        TOTAL - FIRST
    );

    let mut sorted = model.held.clone();
    sorted.sort_by_key(|e| e.start);
    for pair in sorted.windows(2) {
        prop_assert!(pair[0].end() <= pair[1].start, "overlap: {:?}", pair);
    }
    for ext in &sorted {
        prop_assert!(ext.start >= FIRST && ext.end() <= TOTAL);
        for block in ext.start..ext.end() {
            prop_assert!(fsm.is_allocated(block));
        }
    }
    Ok(())
}

fn apply(fsm: &FreeSpaceManager, model: &mut Model, op: Op) -> std::result::Result<(), TestCaseError> {
    match op {
        Op::Alloc { hint, len, mode } => {
            let flags = match mode {
                0 => AllocFlags::NONE,
                1 => AllocFlags::ALIGNED,
                2 => AllocFlags::PARTIAL,
                _ => AllocFlags::DELAYED,
            };
            match fsm.get_free_block(hint, len, flags) {
                Ok(ext) => {
                    match mode {
                        1 => {
                            prop_assert_eq!(ext.start % ALIGN, 0);
                            prop_assert_eq!(ext.len, len);
                        }
                        2 => prop_assert!(ext.len >= 1 && ext.len <= len),
                        3 => {
                            prop_assert_eq!(ext.len, len);
                            model.reserved -= ext.len;
                        }
                        _ => prop_assert_eq!(ext.len, len),
                    }
                    model.held.push(ext);
                }
                Err(VdfsError::NoSpace) => {}
                Err(err) => return Err(TestCaseError::fail(format!("alloc: {err}"))),
            }
        }
        Op::Free { pick, unused } => {
            if model.held.is_empty() {
                return Ok(());
            }
            let ext = model.held.swap_remove(pick % model.held.len());
            let flags = if unused {
                FreeFlags::UNUSED
            } else {
                FreeFlags::NONE
            };
            fsm.put_free_block(ext.start, ext.len, flags)
                .map_err(|err| TestCaseError::fail(format!("free: {err}")))?;
        }
        Op::Reserve(count) => match fsm.reserve_blocks(count) {
            Ok(()) => model.reserved += count,
            Err(VdfsError::NoSpace) => {}
            Err(err) => return Err(TestCaseError::fail(format!("reserve: {err}"))),
        },
        Op::Release => {
            fsm.release_reservation(model.reserved)
                .map_err(|err| TestCaseError::fail(format!("release: {err}")))?;
            model.reserved = 0;
        }
        Op::Commit => fsm
            .commit_free_space()
            .map_err(|err| TestCaseError::fail(format!("commit: {err}")))?,
        Op::Rebuild => match fsm.rebuild_tree() {
            // refused while this epoch's frees are untracked
            Ok(()) | Err(VdfsError::NoSpace) => {}
            Err(err) => return Err(TestCaseError::fail(format!("rebuild: {err}"))),
        },
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(96))]

    #[test]
    fn blocks_are_conserved(
        ops in prop::collection::vec(op_strategy(), 1..160),
        capped in any::<bool>(),
    ) {
        let max_extents = if capped { 4 } else { 256 };
        let (fsm, _mem) = manager(max_extents).map_err(|e| TestCaseError::fail(e.to_string()))?;
        let mut model = Model { held: Vec::new(), reserved: 0 };
        for op in ops {
            apply(&fsm, &mut model, op)?;
            check_invariants(&fsm, &model)?;
        }

        for ext in model.held.drain(..) {
            fsm.put_free_block(ext.start, ext.len, FreeFlags::NONE)
                .map_err(|e| TestCaseError::fail(e.to_string()))?;
        }
        fsm.release_reservation(model.reserved)
            .map_err(|e| TestCaseError::fail(e.to_string()))?;
        model.reserved = 0;
        fsm.commit_free_space().map_err(|e| TestCaseError::fail(e.to_string()))?;
        check_invariants(&fsm, &model)?;
        prop_assert_eq!(fsm.free_blocks(), TOTAL - FIRST);

        fsm.rebuild_tree().map_err(|e| TestCaseError::fail(e.to_string()))?;
        let stats = fsm.stats();
        prop_assert_eq!(stats.tracked_extents, 1);
        prop_assert_eq!(stats.untracked_blocks, 0);
    }

    #[test]
    fn deferred_frees_are_not_reused_before_commit(lens in prop::collection::vec(1u64..16, 1..12)) {
        let (fsm, _mem) = manager(256).map_err(|e| TestCaseError::fail(e.to_string()))?;
        let mut freed = Vec::new();
        for len in lens {
            let ext = fsm.get_free_block(FIRST, len, AllocFlags::NONE)
                .map_err(|e| TestCaseError::fail(e.to_string()))?;
            fsm.put_free_block(ext.start, ext.len, FreeFlags::NONE)
                .map_err(|e| TestCaseError::fail(e.to_string()))?;
            freed.push(ext);
        }
        // each allocation must land outside everything freed so far
        let mut sorted = freed.clone();
        sorted.sort_by_key(|e| e.start);
        for pair in sorted.windows(2) {
            prop_assert!(pair[0].end() <= pair[1].start);
        }
        let pending: u64 = freed.iter().map(|e| e.len).sum();
        prop_assert_eq!(fsm.stats().next_free_blocks, pending);
        fsm.commit_free_space().map_err(|e| TestCaseError::fail(e.to_string()))?;
        prop_assert_eq!(fsm.free_blocks(), TOTAL - FIRST);
    }
}

#[test]
fn emptied_erase_blocks_are_discarded_on_commit() -> Result<()> {
    let (fsm, mem) = manager(256)?;
    let ext = fsm.get_free_block(FIRST, 64, AllocFlags::NONE)?;
    assert_eq!(ext.start, FIRST);

    // half of one erase block stays live
    fsm.put_free_block(FIRST, 2 * ERASE + ERASE / 2, FreeFlags::NONE)?;
    assert_eq!(mem.discarded_blocks(), 0);
    fsm.commit_free_space()?;
    assert_eq!(mem.discarded_blocks(), 2 * ERASE);

    fsm.put_free_block(FIRST + 2 * ERASE + ERASE / 2, 64 - 2 * ERASE - ERASE / 2, FreeFlags::UNUSED)?;
    fsm.commit_free_space()?;
    assert_eq!(mem.discarded_blocks(), 64);
    fsm.check_consistency()
}

#[test]
fn double_free_is_a_bug() -> Result<()> {
    let (fsm, _mem) = manager(256)?;
    let ext = fsm.get_free_block(FIRST, 4, AllocFlags::NONE)?;
    fsm.put_free_block(ext.start, ext.len, FreeFlags::NONE)?;
    let again = fsm.put_free_block(ext.start, ext.len, FreeFlags::NONE);
    assert!(matches!(again, Err(VdfsError::Bug(_))));
    Ok(())
}
