//! Background worker frees garbage and resumes interrupted passes

mod common;

use common::*;
use crossbeam::channel;
use hammer2_bulkfree::{BlockState, BulkfreeWorker};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(30);

#[test]
fn test_orphan_freed_by_two_triggered_passes() {
    let store = volume(2);
    let pfs = store.add_pfs("root").unwrap();
    let inode = store.add_inode(pfs, 1).unwrap();
    let kept = store.add_data(inode, 0, 14).unwrap();
    let orphan = store.add_data(inode, 1, 14).unwrap();
    store.unlink(inode, 1).unwrap();

    let engine = Arc::new(engine(Arc::clone(&store), test_config()));
    let mut worker = BulkfreeWorker::start(engine, None).unwrap();

    worker.trigger().unwrap();
    assert!(worker.wait_for_passes(1, WAIT));
    assert_eq!(extent_states(&store, &orphan), vec![BlockState::Staged]);

    worker.trigger().unwrap();
    assert!(worker.wait_for_passes(2, WAIT));
    assert_eq!(extent_states(&store, &orphan), vec![BlockState::Free]);
    assert_eq!(extent_states(&store, &kept), vec![BlockState::Allocated]);

    let report = worker.last_report().unwrap();
    assert_eq!(report.bytes_freed, 16384);
    assert!(worker.last_error().is_none());
    worker.stop();
}

#[test]
fn test_interrupted_pass_resumes_next_time() {
    let per_window = {
        let probe = volume(3);
        let wrapper = Arc::new(Interposer::new(probe));
        let engine = engine(Arc::clone(&wrapper), test_config());
        engine.run_one_pass(2 * GB, 32768).unwrap();
        wrapper.calls()
    };

    let store = volume(3);
    let orphans: Vec<_> = (0..3).map(|zone| place(&store, zone * GB + 64 * MB, 14)).collect();
    let wrapper = Arc::new(Interposer::new(Arc::clone(&store)));
    let engine = Arc::new(engine(
        Arc::clone(&wrapper),
        test_config().with_buffer_bytes(32768),
    ));

    // Cancel once, partway into the second window of the first pass
    let token = engine.cancel_token();
    wrapper.set_hook(move |count| {
        if count == per_window + 1 {
            token.cancel();
        }
    });

    let worker = BulkfreeWorker::start(Arc::clone(&engine), None).unwrap();
    worker.trigger().unwrap();
    assert!(worker.wait_for_passes(1, WAIT));
    wrapper.clear_hook();

    let first = worker.last_report().unwrap();
    assert!(first.aborted);
    assert_eq!(first.windows, 1);
    assert_eq!(worker.resume_offset(), GB);
    assert_eq!(extent_states(&store, &orphans[0]), vec![BlockState::Staged]);
    assert_eq!(extent_states(&store, &orphans[1]), vec![BlockState::Allocated]);

    // The worker re-arms the token and picks up at the failed zone
    worker.trigger().unwrap();
    assert!(worker.wait_for_passes(2, WAIT));
    let second = worker.last_report().unwrap();
    assert_eq!(second.start_offset, GB);
    assert!(second.complete());
    assert_eq!(worker.resume_offset(), 0);
    assert_eq!(extent_states(&store, &orphans[1]), vec![BlockState::Staged]);
    assert_eq!(extent_states(&store, &orphans[2]), vec![BlockState::Staged]);
}

#[test]
fn test_interval_worker_keeps_running() {
    let store = volume(1);
    let engine = Arc::new(engine(Arc::clone(&store), test_config()));
    let worker = BulkfreeWorker::start(engine, Some(Duration::from_millis(5))).unwrap();
    assert!(worker.wait_for_passes(3, WAIT));
    assert!(worker.passes() >= 3);
    drop(worker);
    assert_eq!(store.outstanding_locks(), 0);
}

#[test]
fn test_stop_discards_queued_trigger() {
    let store = volume(2);
    let orphan = place(&store, 64 * MB, 14);
    let wrapper = Arc::new(Interposer::new(Arc::clone(&store)));
    let engine = Arc::new(engine(Arc::clone(&wrapper), test_config()));

    // Hold the first pass inside its scan until shutdown has cancelled it
    let (entered_tx, entered_rx) = channel::bounded::<()>(1);
    let (release_tx, release_rx) = channel::bounded::<()>(1);
    let mut blocked = false;
    wrapper.set_hook(move |_| {
        if !blocked {
            blocked = true;
            entered_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        }
    });

    let mut worker = BulkfreeWorker::start(Arc::clone(&engine), None).unwrap();
    worker.trigger().unwrap();
    entered_rx.recv().unwrap();
    // Queued behind the running pass, ahead of the stop request
    worker.trigger().unwrap();

    let token = engine.cancel_token();
    let releaser = thread::spawn(move || {
        while !token.is_cancelled() {
            thread::sleep(Duration::from_millis(1));
        }
        release_tx.send(()).unwrap();
    });
    worker.stop();
    releaser.join().unwrap();

    assert_eq!(worker.passes(), 1);
    assert!(worker.last_report().unwrap().aborted);
    assert_eq!(extent_states(&store, &orphan), vec![BlockState::Allocated]);
    assert_eq!(store.outstanding_refs(), 0);
    assert_eq!(store.outstanding_locks(), 0);
}
