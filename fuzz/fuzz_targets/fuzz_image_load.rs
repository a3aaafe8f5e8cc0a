#![no_main]
use hammer2_bulkfree::{MemStore, VolumeImage};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(image) = serde_json::from_slice::<VolumeImage>(data) else {
        return;
    };
    // Malformed images must be rejected, never panic
    if let Ok(store) = MemStore::from_image(image) {
        let _ = store.freemap_summary();
    }
});
