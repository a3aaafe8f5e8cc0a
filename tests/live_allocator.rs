//! Passes running alongside a live allocator never free referenced data

mod common;

use common::*;
use hammer2_bulkfree::{BlockState, Bref};
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

const WRITERS: u64 = 4;
const OPS_PER_WRITER: usize = 300;

#[test]
fn test_concurrent_writers_never_lose_data() {
    let store = volume(2);
    let pfs = store.add_pfs("busy").unwrap();
    let inodes: Vec<_> = (0..WRITERS)
        .map(|key| store.add_inode(pfs, key).unwrap())
        .collect();
    let engine = Arc::new(engine(Arc::clone(&store), test_config()));

    // Writers allocate and link under the read side; a pass only starts
    // once every extent allocated so far is reachable.
    let gate = Arc::new(RwLock::new(()));
    let live: Arc<Mutex<Vec<Bref>>> = Arc::new(Mutex::new(Vec::new()));
    let done = Arc::new(AtomicBool::new(false));

    let passer = {
        let engine = Arc::clone(&engine);
        let gate = Arc::clone(&gate);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut reports = Vec::new();
            while !done.load(Ordering::SeqCst) {
                drop(gate.write());
                reports.push(engine.run_one_pass(0, 0).unwrap());
            }
            reports
        })
    };

    let writers: Vec<_> = inodes
        .iter()
        .enumerate()
        .map(|(n, &inode)| {
            let store = Arc::clone(&store);
            let gate = Arc::clone(&gate);
            let live = Arc::clone(&live);
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(n as u64);
                let mut mine: Vec<(u64, Bref)> = Vec::new();
                for key in 0..OPS_PER_WRITER as u64 {
                    let open = gate.read();
                    if !mine.is_empty() && rng.gen_bool(0.3) {
                        let (key, bref) = mine.swap_remove(rng.gen_range(0..mine.len()));
                        store.unlink(inode, key).unwrap();
                        live.lock().retain(|b| *b != bref);
                    } else {
                        let radix = rng.gen_range(12..=16);
                        let bref = store.add_data(inode, key, radix).unwrap();
                        mine.push((key, bref));
                        live.lock().push(bref);
                    }
                    drop(open);
                    if key % 32 == 0 {
                        thread::yield_now();
                    }
                }
            })
        })
        .collect();

    for writer in writers {
        writer.join().unwrap();
    }
    done.store(true, Ordering::SeqCst);
    let reports = passer.join().unwrap();

    for report in &reports {
        assert!(!report.aborted);
        assert_eq!(report.transitions.inconsistencies(), 0);
    }

    let quiet = engine.run_one_pass(0, 0).unwrap();
    assert_eq!(quiet.transitions.inconsistencies(), 0);

    let live = live.lock();
    assert!(!live.is_empty());
    for bref in live.iter() {
        let states = extent_states(&store, bref);
        assert!(
            states.iter().all(|s| *s == BlockState::Allocated),
            "live extent {:#x} has states {:?}",
            bref.data_off,
            states
        );
    }
    assert_eq!(store.outstanding_refs(), 0);
    assert_eq!(store.outstanding_locks(), 0);
}

#[test]
fn test_unlinked_extents_eventually_reclaimed() {
    let store = volume(2);
    let pfs = store.add_pfs("churn").unwrap();
    let inode = store.add_inode(pfs, 1).unwrap();
    let engine = engine(Arc::clone(&store), test_config());
    let before = store.freemap_summary();

    let mut removed = Vec::new();
    for round in 0..4u64 {
        for key in 0..16 {
            let key = round * 16 + key;
            let bref = store.add_data(inode, key, 14).unwrap();
            if key % 2 == 0 {
                store.unlink(inode, key).unwrap();
                removed.push(bref);
            }
        }
        engine.run_one_pass(0, 0).unwrap();
    }
    engine.run_one_pass(0, 0).unwrap();
    engine.run_one_pass(0, 0).unwrap();

    let summary = store.freemap_summary();
    assert_eq!(summary.staged_blocks, 0);
    assert_eq!(summary.allocated_blocks, before.allocated_blocks + 32);
    // Earlier orphans were freed and reused; the last round's stay free
    for bref in removed.iter().rev().take(8) {
        assert_eq!(extent_states(&store, bref), vec![BlockState::Free]);
    }
}
