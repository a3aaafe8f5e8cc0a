//! Background bulkfree service
//!
//! Runs passes on a dedicated thread, either on a fixed interval or when
//! triggered. Each pass resumes where the previous one stopped, so a pass
//! interrupted by a stop request or a hard scan error picks up at the same
//! zone next time.

use crate::chain::ChainStore;
use crate::error::{BulkfreeError, Result};
use crate::pass::{Bulkfree, PassReport};
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

enum Command {
    Trigger,
    Stop,
}

#[derive(Debug, Default)]
struct WorkerState {
    passes: u64,
    resume_offset: u64,
    last_report: Option<PassReport>,
    last_error: Option<String>,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<WorkerState>,
    pass_done: Condvar,
    stopping: AtomicBool,
}

/// Periodic bulkfree thread
pub struct BulkfreeWorker<S: ChainStore + ?Sized + 'static> {
    engine: Arc<Bulkfree<S>>,
    shared: Arc<Shared>,
    commands: Option<Sender<Command>>,
    thread: Option<JoinHandle<()>>,
}

impl<S: ChainStore + ?Sized + 'static> BulkfreeWorker<S> {
    /// Start the worker thread.
    ///
    /// A pass runs every `interval`, or only on [`trigger`](Self::trigger)
    /// when `interval` is `None`.
    pub fn start(engine: Arc<Bulkfree<S>>, interval: Option<Duration>) -> Result<Self> {
        let (tx, rx) = channel::unbounded();
        let shared = Arc::new(Shared::default());

        let thread_engine = Arc::clone(&engine);
        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("h2bulkfree".to_string())
            .spawn(move || {
                tracing::debug!("Bulkfree worker started");
                loop {
                    let command = match interval {
                        Some(period) => match rx.recv_timeout(period) {
                            Ok(command) => command,
                            Err(RecvTimeoutError::Timeout) => Command::Trigger,
                            Err(RecvTimeoutError::Disconnected) => break,
                        },
                        None => match rx.recv() {
                            Ok(command) => command,
                            Err(_) => break,
                        },
                    };
                    match command {
                        Command::Trigger => run_pass(&thread_engine, &thread_shared),
                        Command::Stop => break,
                    }
                }
                tracing::debug!("Bulkfree worker stopped");
            })?;

        Ok(BulkfreeWorker {
            engine,
            shared,
            commands: Some(tx),
            thread: Some(thread),
        })
    }

    /// Queue a pass
    pub fn trigger(&self) -> Result<()> {
        self.commands
            .as_ref()
            .ok_or(BulkfreeError::WorkerStopped)?
            .send(Command::Trigger)
            .map_err(|_| BulkfreeError::WorkerStopped)
    }

    /// Report of the most recent finished pass
    pub fn last_report(&self) -> Option<PassReport> {
        self.shared.state.lock().last_report.clone()
    }

    /// Error returned by the most recent pass that failed to start
    pub fn last_error(&self) -> Option<String> {
        self.shared.state.lock().last_error.clone()
    }

    /// Passes finished so far
    pub fn passes(&self) -> u64 {
        self.shared.state.lock().passes
    }

    /// Offset the next pass starts at
    pub fn resume_offset(&self) -> u64 {
        self.shared.state.lock().resume_offset
    }

    /// Block until at least `count` passes have finished or `timeout` expires
    pub fn wait_for_passes(&self, count: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while state.passes < count {
            if self.shared.pass_done.wait_until(&mut state, deadline).timed_out() {
                return state.passes >= count;
            }
        }
        true
    }

    /// Abort any running pass and join the thread
    pub fn stop(&mut self) {
        if let Some(tx) = self.commands.take() {
            self.shared.stopping.store(true, Ordering::SeqCst);
            self.engine.cancel_token().cancel();
            let _ = tx.send(Command::Stop);
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl<S: ChainStore + ?Sized + 'static> Drop for BulkfreeWorker<S> {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_pass<S: ChainStore + ?Sized>(engine: &Bulkfree<S>, shared: &Shared) {
    // Stop raises the flag before cancelling, so a reset that races with it
    // is caught by the second check.
    if shared.stopping.load(Ordering::SeqCst) {
        return;
    }
    engine.cancel_token().reset();
    if shared.stopping.load(Ordering::SeqCst) {
        tracing::debug!("Bulkfree pass skipped, worker stopping");
        return;
    }
    let resume = shared.state.lock().resume_offset;

    let outcome = engine.run_one_pass(resume, 0);
    let mut state = shared.state.lock();
    match outcome {
        Ok(report) => {
            state.resume_offset = if report.complete() {
                0
            } else {
                report.next_resume_offset
            };
            state.passes += 1;
            state.last_report = Some(report);
            state.last_error = None;
        }
        Err(err) => {
            tracing::warn!("Bulkfree pass failed to start: {}", err);
            state.last_error = Some(err.to_string());
        }
    }
    shared.pass_done.notify_all();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BulkfreeConfig;
    use crate::layout::{VolumeGeometry, FREEMAP_LEVEL1_SIZE};
    use crate::memstore::MemStore;

    fn engine() -> Arc<Bulkfree<MemStore>> {
        let store = MemStore::format(VolumeGeometry::new(0, 2 * FREEMAP_LEVEL1_SIZE)).unwrap();
        Arc::new(Bulkfree::new(Arc::new(store), BulkfreeConfig::default()).unwrap())
    }

    #[test]
    fn test_triggered_passes() {
        let mut worker = BulkfreeWorker::start(engine(), None).unwrap();
        worker.trigger().unwrap();
        worker.trigger().unwrap();
        assert!(worker.wait_for_passes(2, Duration::from_secs(30)));

        let report = worker.last_report().unwrap();
        assert!(report.complete());
        assert_eq!(worker.resume_offset(), 0);

        worker.stop();
        assert!(matches!(worker.trigger(), Err(BulkfreeError::WorkerStopped)));
    }

    #[test]
    fn test_interval_passes() {
        let worker = BulkfreeWorker::start(engine(), Some(Duration::from_millis(10))).unwrap();
        assert!(worker.wait_for_passes(2, Duration::from_secs(30)));
    }
}
