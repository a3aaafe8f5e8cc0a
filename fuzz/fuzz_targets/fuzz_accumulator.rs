#![no_main]
use hammer2_bulkfree::{BmapAccumulator, Bref, BrefType, RecordOutcome, VolumeGeometry};
use libfuzzer_sys::fuzz_target;

const MB: u64 = 1024 * 1024;

fuzz_target!(|extents: Vec<(u64, u8)>| {
    let geometry = VolumeGeometry::new(8 * MB, 2048 * MB);
    let mut acc = BmapAccumulator::new(32768, geometry);
    let sstop = acc.reset(1024 * MB);

    for (offset, radix) in extents {
        let bref = Bref::new(BrefType::Data, 0, offset, radix);
        if let RecordOutcome::Recorded { .. } = acc.record(&bref) {
            assert!(bref.offset() >= 1024 * MB && bref.offset() < sstop);
        }
    }
    // Zone header segments stay pinned whatever was recorded
    let header = acc.segment(1024 * MB).unwrap();
    assert!(header.bitmapq.iter().all(|&w| w == u64::MAX));
});
