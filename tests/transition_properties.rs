//! Property-based tests for the reconciliation table and the accumulator
//!
//! Uses proptest to check the two-stage freeing rules over random bitmaps
//! and random extent sets

use hammer2_bulkfree::layout::{BMAP_BLOCKS, FREEMAP_BLOCK_SIZE, SEGSIZE};
use hammer2_bulkfree::{
    sync_adjust, BlockState, BmapAccumulator, BmapData, Bref, BrefType, SyncStats, VolumeGeometry,
};
use proptest::prelude::*;

const MB: u64 = 1024 * 1024;
const GB: u64 = 1024 * MB;

fn any_state() -> impl Strategy<Value = BlockState> {
    (0u64..4).prop_map(BlockState::from_bits)
}

fn bmap_from(states: &[BlockState], linear: u32) -> BmapData {
    let mut bmap = BmapData::free_segment();
    for (block, state) in states.iter().enumerate() {
        bmap.set_state(block, *state);
    }
    bmap.avail = bmap.free_bytes() as u32;
    bmap.linear = linear;
    bmap
}

/// Accumulated records only ever hold 00 and 11
fn accumulated_states() -> impl Strategy<Value = Vec<BlockState>> {
    prop::collection::vec(
        prop::bool::weighted(0.3).prop_map(|seen| {
            if seen {
                BlockState::Allocated
            } else {
                BlockState::Free
            }
        }),
        BMAP_BLOCKS,
    )
}

proptest! {
    #[test]
    fn prop_reconcile_follows_table(
        acc in accumulated_states(),
        live in prop::collection::vec(any_state(), BMAP_BLOCKS),
        linear in 0u32..SEGSIZE as u32,
    ) {
        let bmap = bmap_from(&acc, linear);
        let mut after = bmap_from(&live, 0);
        let mut stats = SyncStats::default();
        sync_adjust(&mut after, &bmap, 64 * MB, &mut stats);

        let mut staged = 0;
        let mut freed = 0;
        let mut repaired = 0;
        for block in 0..BMAP_BLOCKS {
            let expected = match (acc[block], live[block]) {
                (BlockState::Allocated, _) => BlockState::Allocated,
                (_, BlockState::Allocated) => BlockState::Staged,
                (_, BlockState::Staged) => BlockState::Free,
                (_, other) => other,
            };
            prop_assert_eq!(after.state(block), expected, "block {}", block);

            // A referenced block never loses its allocation
            if acc[block] == BlockState::Allocated {
                prop_assert_eq!(after.state(block), BlockState::Allocated);
            }
            // Nothing goes straight from 11 to 00
            if live[block] == BlockState::Allocated {
                prop_assert_ne!(after.state(block), BlockState::Free);
            }
            // 01 is never produced, only left alone
            if after.state(block) == BlockState::Invalid {
                prop_assert_eq!(live[block], BlockState::Invalid);
            }

            match (acc[block], live[block]) {
                (BlockState::Free, BlockState::Allocated) => staged += 1,
                (BlockState::Free, BlockState::Staged) => freed += 1,
                (BlockState::Allocated, BlockState::Free | BlockState::Invalid) => repaired += 1,
                _ => {}
            }
        }

        prop_assert_eq!(stats.transitions.allocated_to_staged, staged);
        prop_assert_eq!(stats.transitions.staged_to_free, freed);
        prop_assert_eq!(stats.transitions.inconsistencies(), repaired);
        prop_assert_eq!(stats.bytes_freed, freed * FREEMAP_BLOCK_SIZE);
        prop_assert_eq!(after.avail as u64, after.free_bytes());
        if !after.is_empty() {
            prop_assert!(after.linear >= bmap.linear);
        }
    }

    #[test]
    fn prop_unreferenced_blocks_free_after_two_rounds(
        live in prop::collection::vec(any_state(), BMAP_BLOCKS),
    ) {
        let empty = BmapData::free_segment();
        let mut after = bmap_from(&live, 0);
        let mut stats = SyncStats::default();
        sync_adjust(&mut after, &empty, 64 * MB, &mut stats);
        sync_adjust(&mut after, &empty, 64 * MB, &mut stats);

        for block in 0..BMAP_BLOCKS {
            let expected = if live[block] == BlockState::Invalid {
                BlockState::Invalid
            } else {
                BlockState::Free
            };
            prop_assert_eq!(after.state(block), expected);
        }
        if !live.contains(&BlockState::Invalid) {
            prop_assert!(after.is_empty());
            prop_assert_eq!(after.avail as u64, SEGSIZE);
            prop_assert_eq!(after.class, 0);
        }
    }

    #[test]
    fn prop_accumulator_bitmap_order_independent(
        extents in prop::collection::vec((0u64..1024, 10u8..=16), 1..64),
        seed in any::<u64>(),
    ) {
        let geometry = VolumeGeometry::new(8 * MB, GB);
        let brefs: Vec<Bref> = extents
            .iter()
            .map(|&(block, radix)| {
                let offset = 8 * MB + block * FREEMAP_BLOCK_SIZE;
                Bref::new(BrefType::Data, 0, offset, radix)
            })
            .collect();

        let mut forward = BmapAccumulator::new(32768, geometry);
        forward.reset(0);
        for bref in &brefs {
            forward.record(bref);
        }

        // Reverse, rotate and replay everything twice
        let mut shuffled = brefs.clone();
        shuffled.reverse();
        let rotate = (seed as usize) % shuffled.len();
        shuffled.rotate_left(rotate);
        let mut replay = BmapAccumulator::new(32768, geometry);
        replay.reset(0);
        for bref in shuffled.iter().chain(shuffled.iter()) {
            replay.record(bref);
        }

        let a: Vec<_> = forward.segments().map(|(_, b)| b.bitmapq).collect();
        let b: Vec<_> = replay.segments().map(|(_, b)| b.bitmapq).collect();
        prop_assert_eq!(a, b);

        // Every recorded block is marked allocated
        for bref in &brefs {
            let bmap = forward.segment(bref.offset()).unwrap();
            let seg_off = bref.offset() % SEGSIZE;
            prop_assert_eq!(bmap.state_at(seg_off), BlockState::Allocated);
        }
    }
}
