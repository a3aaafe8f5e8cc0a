//! Windowed pass driver
//!
//! A pass walks the whole topology once per storage window. Each window is
//! as large as the accumulator buffer can describe (32KB of records per 1GB
//! of storage). A window is reconciled only when its scan completed without
//! a hard error; an aborted window is discarded and the pass stops there so
//! a later pass can resume from the reported offset.

use crate::cancel::CancelToken;
use crate::chain::{ChainRef, ChainStore};
use crate::config::BulkfreeConfig;
use crate::error::{BulkfreeError, Result, ScanError};
use crate::layout::{FREEMAP_LEVEL1_MASK, FREEMAP_LEVEL1_SIZE, FREEMAP_LEVELN_PSIZE};
use crate::scan::{ScanContext, ScanStats};
use crate::sync::{reconcile, SyncStats, TransitionCounters};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

const MB: u64 = 1024 * 1024;
const GB: u64 = 1024 * MB;

/// Outcome of one bulkfree pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PassReport {
    /// Zone-aligned offset the pass started at
    pub start_offset: u64,
    /// First offset not yet reconciled; pass back in to resume
    pub next_resume_offset: u64,
    pub total_size: u64,
    /// Accumulator size used for each window
    pub buffer_bytes: u64,
    /// Windows scanned and reconciled
    pub windows: u32,
    /// A hard error or cancellation stopped the pass
    pub aborted: bool,
    /// Cumulative scan flags
    pub error: ScanError,
    /// Share of the device covered by completed windows
    pub percent_processed: f64,
    pub bytes_freed: u64,
    pub free_delta: i64,
    pub transitions: TransitionCounters,
    pub scan: ScanStats,
    pub sync: SyncStats,
    pub elapsed: Duration,
}

impl PassReport {
    fn new(start_offset: u64, total_size: u64, buffer_bytes: u64) -> Self {
        PassReport {
            start_offset,
            next_resume_offset: start_offset,
            total_size,
            buffer_bytes,
            windows: 0,
            aborted: false,
            error: ScanError::empty(),
            percent_processed: 0.0,
            bytes_freed: 0,
            free_delta: 0,
            transitions: TransitionCounters::default(),
            scan: ScanStats::default(),
            sync: SyncStats::default(),
            elapsed: Duration::ZERO,
        }
    }

    /// Whether any node failed its integrity check
    pub fn check_errors(&self) -> bool {
        self.error.contains(ScanError::CHECK)
    }

    /// Whether the pass reached the end of the device
    pub fn complete(&self) -> bool {
        !self.aborted && self.next_resume_offset >= self.total_size
    }

    fn finish(&mut self, next_resume_offset: u64, started: Instant) {
        self.next_resume_offset = next_resume_offset;
        self.bytes_freed = self.sync.bytes_freed;
        self.free_delta = self.sync.free_delta;
        self.transitions = self.sync.transitions;
        self.percent_processed = processed_basis_points(next_resume_offset, self.total_size) as f64 / 100.0;
        self.elapsed = started.elapsed();
    }
}

impl fmt::Display for PassReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "bulkfree pass statistics ({:.2}% storage processed):",
            self.percent_processed
        )?;
        if self.aborted {
            writeln!(f, "    bulkfree was aborted ({})", self.error)?;
        } else if self.check_errors() {
            writeln!(f, "    WARNING: bulkfree encountered CRC errors")?;
        }
        let t = &self.transitions;
        writeln!(f, "    transition->free   {}", t.staged_to_free)?;
        writeln!(f, "    transition->staged {}", t.allocated_to_staged)?;
        writeln!(f, "    ERR(00)->allocated {}", t.free_to_allocated)?;
        writeln!(f, "    ERR(01)->allocated {}", t.invalid_to_allocated)?;
        writeln!(f, "    staged->allocated  {}", t.staged_to_allocated)?;
        writeln!(f, "    ~4MB segs cleaned  {}", self.sync.segments_cleaned)?;
        writeln!(f, "    linear adjusts     {}", self.sync.linear_adjusts)?;
        writeln!(f, "    dedup factor       {}", self.scan.dedup_factor)?;
        writeln!(
            f,
            "    cache hits         {} ({:.1}%, {} evicted)",
            self.scan.cache_hits,
            self.scan.cache_hit_rate(),
            self.scan.cache_evictions
        )?;
        writeln!(f, "    extents clipped    {}", self.scan.extents_clipped)?;
        writeln!(f, "    extents invalid    {}", self.scan.extents_invalid)?;
        writeln!(f, "    max saved chains   {}", self.scan.max_saved)?;
        writeln!(f, "    throttled          {:.3}s", self.scan.throttled.as_secs_f64())?;
        writeln!(f, "    bytes freed        {}", self.bytes_freed)?;
        write!(f, "    next resume offset {:#018x}", self.next_resume_offset)
    }
}

/// `offset / total` in hundredths of a percent, capped at 100%
fn processed_basis_points(offset: u64, total: u64) -> u64 {
    if total == 0 {
        return 10000;
    }
    ((offset as u128 * 10000) / total as u128).min(10000) as u64
}

/// Bulkfree engine bound to one chain store
///
/// Only one pass runs at a time; a second caller gets
/// [`BulkfreeError::PassInProgress`].
pub struct Bulkfree<S: ChainStore + ?Sized> {
    store: Arc<S>,
    config: BulkfreeConfig,
    pass_lock: Mutex<()>,
    cancel: CancelToken,
}

impl<S: ChainStore + ?Sized> Bulkfree<S> {
    pub fn new(store: Arc<S>, config: BulkfreeConfig) -> Result<Self> {
        config.check()?;
        Ok(Bulkfree {
            store,
            config,
            pass_lock: Mutex::new(()),
            cancel: CancelToken::new(),
        })
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &BulkfreeConfig {
        &self.config
    }

    /// Token that aborts the running pass when cancelled
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn is_running(&self) -> bool {
        self.pass_lock.is_locked()
    }

    /// Run one full pass starting at `resume_offset`.
    ///
    /// `buffer_budget` is the accumulator size in bytes, 0 selects the
    /// configured default.
    pub fn run_one_pass(&self, resume_offset: u64, buffer_budget: u64) -> Result<PassReport> {
        let _pass = self.pass_lock.try_lock().ok_or(BulkfreeError::PassInProgress)?;
        let started = Instant::now();
        let store: &S = &self.store;
        let geometry = store.geometry();
        let total = geometry.total_size;

        let size = self.config.buffer_size(buffer_budget, total);
        tracing::info!("Bulkfree buf={}M", size / MB);

        let mut sbase = resume_offset.min(total) & !FREEMAP_LEVEL1_MASK;
        let mut report = PassReport::new(sbase, total, size);
        let mut ctx = ScanContext::new(store, &self.config, size, self.cancel.clone());
        let incr = size / FREEMAP_LEVELN_PSIZE as u64 * FREEMAP_LEVEL1_SIZE;

        while sbase < total {
            let sstop = ctx.begin_window(sbase);
            if sstop == total && sbase == 0 {
                tracing::info!("Bulkfree window {:#018x}-{:#018x} (all media)", sbase, sstop);
            } else if sstop == total {
                tracing::info!("Bulkfree window {:#018x}-{:#018x} (remaining media)", sbase, sstop);
            } else {
                tracing::info!(
                    "Bulkfree window {:#018x}-{:#018x} ({}GB of media)",
                    sbase,
                    sstop,
                    incr / GB
                );
            }

            let mut error = ScanError::empty();
            match store.topology_roots() {
                Ok(ids) => {
                    let roots: Vec<ChainRef<'_, S>> =
                        ids.into_iter().map(|id| ChainRef::adopt(store, id)).collect();
                    for root in &roots {
                        error |= ctx.scan_root(root);
                        if error.is_hard() {
                            break;
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!("Cannot resolve topology roots: {}", err);
                    error |= ScanError::IO;
                }
            }
            error = ctx.drain(error);
            ctx.finish_window();

            report.scan.merge(&ctx.stats());
            report.error |= error;

            // A partially scanned window must never be merged
            if error.is_hard() {
                tracing::warn!(
                    "Bulkfree window {:#018x}-{:#018x} aborted, error={}",
                    sbase,
                    sstop,
                    error
                );
                report.aborted = true;
                break;
            }
            if error.contains(ScanError::CHECK) {
                tracing::warn!("Bulkfree window scanned with check errors");
            }

            let sync = reconcile(store, ctx.accumulator());
            report.sync.merge(&sync);
            report.windows += 1;
            sbase = sstop;
        }

        report.finish(sbase, started);
        log_summary(&report);
        Ok(report)
    }
}

fn log_summary(report: &PassReport) {
    tracing::info!(
        "Bulkfree pass statistics ({:.2}% storage processed)",
        report.percent_processed
    );
    if report.aborted {
        tracing::warn!("Bulkfree was aborted ({})", report.error);
        return;
    }
    if report.check_errors() {
        tracing::warn!("Bulkfree encountered CRC errors");
    }
    let t = &report.transitions;
    tracing::info!(
        staged_to_free = t.staged_to_free,
        allocated_to_staged = t.allocated_to_staged,
        free_to_allocated = t.free_to_allocated,
        invalid_to_allocated = t.invalid_to_allocated,
        staged_to_allocated = t.staged_to_allocated,
        segments_cleaned = report.sync.segments_cleaned,
        linear_adjusts = report.sync.linear_adjusts,
        bytes_freed = report.bytes_freed,
        "Bulkfree transitions"
    );
    let scan = &report.scan;
    tracing::info!(
        chains = scan.chains_scanned,
        extents = scan.extents_recorded,
        extents_clipped = scan.extents_clipped,
        extents_invalid = scan.extents_invalid,
        dedup_factor = scan.dedup_factor,
        cache_hits = scan.cache_hits,
        cache_hit_rate = scan.cache_hit_rate(),
        cache_evictions = scan.cache_evictions,
        max_saved = scan.max_saved,
        throttled_ms = scan.throttled.as_millis() as u64,
        "Bulkfree scan"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processed_basis_points() {
        assert_eq!(processed_basis_points(0, 100), 0);
        assert_eq!(processed_basis_points(50, 100), 5000);
        assert_eq!(processed_basis_points(200, 100), 10000);
        assert_eq!(processed_basis_points(0, 0), 10000);
    }

    #[test]
    fn test_scan_stats_merge_and_hit_rate() {
        let window = ScanStats {
            cache_hits: 3,
            cache_misses: 1,
            extents_clipped: 1,
            max_saved: 4,
            throttled: Duration::from_millis(5),
            ..ScanStats::default()
        };
        let mut total = ScanStats::default();
        assert_eq!(total.cache_hit_rate(), 0.0);
        total.merge(&window);
        total.merge(&ScanStats {
            max_saved: 2,
            ..window
        });
        assert_eq!(total.cache_hits, 6);
        assert_eq!(total.extents_clipped, 2);
        assert_eq!(total.max_saved, 4);
        assert_eq!(total.throttled, Duration::from_millis(10));
        assert!((total.cache_hit_rate() - 75.0).abs() < 0.01);
    }

    #[test]
    fn test_report_display() {
        let mut report = PassReport::new(0, 4 * GB, 32768);
        report.sync.bytes_freed = 16384;
        report.sync.transitions.staged_to_free = 1;
        report.finish(4 * GB, Instant::now());
        let text = report.to_string();
        assert!(text.contains("100.00% storage processed"));
        assert!(text.contains("transition->free   1"));
        assert!(text.contains("cache hits         0 (0.0%, 0 evicted)"));
        assert!(text.contains("throttled          0.000s"));
        assert!(report.complete());
    }
}
