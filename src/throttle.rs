//! Scan rate limiting
//!
//! Bounds the number of non-leaf extents processed per second so a pass on
//! a busy volume does not starve foreground I/O. Data and dirent records
//! cost no I/O during the scan and are never counted.

use crate::layout::BrefType;
use std::time::{Duration, Instant};

const TICK: Duration = Duration::from_secs(1);

/// Per-pass rate limiter
#[derive(Debug)]
pub struct RateLimiter {
    tps: u32,
    calls: u32,
    window_start: Instant,
    slept: Duration,
}

impl RateLimiter {
    /// Limit to `tps` counted extents per second, 0 disables
    pub fn new(tps: u32) -> Self {
        RateLimiter {
            tps,
            calls: 0,
            window_start: Instant::now(),
            slept: Duration::ZERO,
        }
    }

    /// Count one extent and return how long the caller should pause
    pub fn admit(&mut self, btype: BrefType, now: Instant) -> Option<Duration> {
        if self.tps == 0 || btype.is_leaf_record() {
            return None;
        }
        self.calls += 1;
        if self.calls <= self.tps {
            return None;
        }

        let elapsed = now.saturating_duration_since(self.window_start);
        self.calls = 0;
        if elapsed < TICK {
            let delay = TICK - elapsed;
            self.window_start = now + delay;
            Some(delay)
        } else {
            self.window_start = now;
            None
        }
    }

    /// Count one extent, sleeping when over budget
    pub fn throttle(&mut self, btype: BrefType) {
        if let Some(delay) = self.admit(btype, Instant::now()) {
            tracing::trace!("Bulkfree throttled for {:?}", delay);
            self.slept += delay;
            std::thread::sleep(delay);
        }
    }

    /// Total time spent sleeping
    pub fn slept(&self) -> Duration {
        self.slept
    }
}
