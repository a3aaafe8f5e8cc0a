#![no_main]
use arbitrary::Arbitrary;
use hammer2_bulkfree::{sync_adjust, BlockState, BmapData, SyncStats};
use libfuzzer_sys::fuzz_target;

#[derive(Arbitrary, Debug)]
struct Input {
    accumulated: [u64; 8],
    live: [u64; 8],
    linear: u32,
    live_linear: u32,
}

fuzz_target!(|input: Input| {
    // Accumulated records only hold 00 and 11
    let mut bmap = BmapData::free_segment();
    bmap.bitmapq = input.accumulated.map(|w| {
        let seen = w & 0x5555_5555_5555_5555;
        seen | (seen << 1)
    });
    bmap.linear = input.linear % (4 << 20);

    let mut live = BmapData::free_segment();
    live.bitmapq = input.live;
    live.linear = input.live_linear % (4 << 20);
    let before = live;

    let mut stats = SyncStats::default();
    sync_adjust(&mut live, &bmap, 0, &mut stats);

    for block in 0..256 {
        let acc = bmap.state(block);
        let after = live.state(block);
        if acc == BlockState::Allocated {
            assert_eq!(after, BlockState::Allocated);
        }
        if before.state(block) == BlockState::Allocated {
            assert_ne!(after, BlockState::Free);
        }
    }
    assert_eq!(live.avail as u64, live.free_bytes());
});
