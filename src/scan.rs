//! Topology scanner
//!
//! Walks the block reference tree for one storage window and feeds every
//! reachable extent into the [`BmapAccumulator`]. Recursion is bounded by a
//! [`DeferralPolicy`]: subtrees that would go too deep, or that arrive while
//! too many subtrees are already parked, are pushed onto a [`SaveQueue`]
//! and drained later in approximately depth-first order.
//!
//! Visitation priorities grow with the amount of work beneath a node so
//! that the [`VisitCache`] keeps large subtrees longest.

use crate::accumulator::BmapAccumulator;
use crate::cancel::CancelToken;
use crate::chain::{ChainRef, ChainStore, LockMode, ScanCursor};
use crate::config::BulkfreeConfig;
use crate::dedup::VisitCache;
use crate::error::ScanError;
use crate::layout::{Bref, BrefType};
use crate::throttle::RateLimiter;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

/// Chains scanned between progress lines below one million
const PROGRESS_SMALL: u64 = 100_000;
const PROGRESS_LARGE: u64 = 1_000_000;

/// Priority bump applied when a subtree is deferred
const DEFER_PRIORITY: u32 = 10;

/// Thresholds deciding when a recursable child is deferred
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferralPolicy {
    /// Depth beyond which every subtree is deferred
    pub max_depth: u32,
    /// Depth above which the deferred-count ceiling applies
    pub saved_depth: u32,
    /// Soft ceiling on queued subtrees; deferral starts at a quarter of it
    pub max_deferred: usize,
}

impl Default for DeferralPolicy {
    fn default() -> Self {
        BulkfreeConfig::default().deferral_policy()
    }
}

impl DeferralPolicy {
    /// Whether a child at `depth` must be queued rather than recursed into
    pub fn should_defer(&self, depth: u32, deferred: usize, backing_out: bool) -> bool {
        depth > self.max_depth
            || backing_out
            || (depth > self.saved_depth && deferred >= self.max_deferred >> 2)
    }

    /// Queue grew past its ceiling
    pub fn overflowed(&self, deferred: usize) -> bool {
        deferred > self.max_deferred
    }
}

/// A deferred subtree and the depth it was found at
pub struct SaveEntry<'s, S: ChainStore + ?Sized> {
    pub chain: ChainRef<'s, S>,
    pub depth: u32,
}

/// Deferred subtrees awaiting traversal
///
/// Entries own their chain reference, so popping, clearing or dropping the
/// queue releases every reference exactly once.
pub struct SaveQueue<'s, S: ChainStore + ?Sized> {
    entries: VecDeque<SaveEntry<'s, S>>,
    max_len: usize,
}

impl<'s, S: ChainStore + ?Sized> Default for SaveQueue<'s, S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'s, S: ChainStore + ?Sized> SaveQueue<'s, S> {
    pub fn new() -> Self {
        SaveQueue {
            entries: VecDeque::new(),
            max_len: 0,
        }
    }

    /// Insert at the head, or right after the entry at `after`.
    ///
    /// Returns the index of the new entry, which becomes the next
    /// insertion point while backing out.
    pub fn insert(&mut self, after: Option<usize>, entry: SaveEntry<'s, S>) -> usize {
        let at = match after {
            Some(index) => (index + 1).min(self.entries.len()),
            None => 0,
        };
        self.entries.insert(at, entry);
        self.max_len = self.max_len.max(self.entries.len());
        at
    }

    pub fn pop_front(&mut self) -> Option<SaveEntry<'s, S>> {
        self.entries.pop_front()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Largest length seen since creation
    pub fn max_len(&self) -> usize {
        self.max_len
    }

    /// Drop every entry, releasing its reference
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Queued chain ids, head first
    pub fn ids(&self) -> Vec<crate::chain::ChainId> {
        self.entries.iter().map(|e| e.chain.id()).collect()
    }
}

/// Per-window scan counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanStats {
    pub chains_scanned: u64,
    pub inodes_scanned: u64,
    pub dirents_scanned: u64,
    pub bytes_scanned: u64,
    /// Extents that landed in the window
    pub extents_recorded: u64,
    /// Blocks that went from free to allocated in the accumulator
    pub blocks_marked: u64,
    /// Extents truncated at a window or segment boundary
    pub extents_clipped: u64,
    /// Extents ignored for a bad size radix
    pub extents_invalid: u64,
    /// Subtrees pushed onto the save queue
    pub subtrees_deferred: u64,
    /// Nodes whose integrity check failed
    pub check_failures: u64,
    /// Visitation cache lookups that found the extent already visited
    pub cache_hits: u64,
    pub cache_misses: u64,
    /// Cache inserts that displaced a live entry
    pub cache_evictions: u64,
    /// Sum of cache hit priorities
    pub dedup_factor: u64,
    /// Largest save queue length
    pub max_saved: u64,
    /// Time spent sleeping in the rate limiter
    pub throttled: Duration,
}

impl ScanStats {
    /// Fold another window's counters into this one
    pub fn merge(&mut self, other: &ScanStats) {
        self.chains_scanned += other.chains_scanned;
        self.inodes_scanned += other.inodes_scanned;
        self.dirents_scanned += other.dirents_scanned;
        self.bytes_scanned += other.bytes_scanned;
        self.extents_recorded += other.extents_recorded;
        self.blocks_marked += other.blocks_marked;
        self.extents_clipped += other.extents_clipped;
        self.extents_invalid += other.extents_invalid;
        self.subtrees_deferred += other.subtrees_deferred;
        self.check_failures += other.check_failures;
        self.cache_hits += other.cache_hits;
        self.cache_misses += other.cache_misses;
        self.cache_evictions += other.cache_evictions;
        self.dedup_factor += other.dedup_factor;
        self.max_saved = self.max_saved.max(other.max_saved);
        self.throttled += other.throttled;
    }

    /// Visitation cache hit rate as a percentage
    pub fn cache_hit_rate(&self) -> f64 {
        let total = self.cache_hits + self.cache_misses;
        if total == 0 {
            0.0
        } else {
            (self.cache_hits as f64 / total as f64) * 100.0
        }
    }
}

/// Mutable state of one pass threaded through the recursive scan
pub struct ScanContext<'s, S: ChainStore + ?Sized> {
    store: &'s S,
    accumulator: BmapAccumulator,
    cache: VisitCache,
    queue: SaveQueue<'s, S>,
    limiter: RateLimiter,
    cancel: CancelToken,
    policy: DeferralPolicy,
    progress: bool,
    stats: ScanStats,
    slept_before_window: Duration,
    chains_reported: u64,
    depth: u32,
    pri: u32,
    backout: Option<usize>,
    list_alert: bool,
}

impl<'s, S: ChainStore + ?Sized> ScanContext<'s, S> {
    pub fn new(
        store: &'s S,
        config: &BulkfreeConfig,
        buffer_bytes: u64,
        cancel: CancelToken,
    ) -> Self {
        ScanContext {
            store,
            accumulator: BmapAccumulator::new(buffer_bytes, store.geometry()),
            cache: VisitCache::new(config.visit_cache_entries),
            queue: SaveQueue::new(),
            limiter: RateLimiter::new(config.rate_limit_tps),
            cancel,
            policy: config.deferral_policy(),
            progress: config.progress,
            stats: ScanStats::default(),
            slept_before_window: Duration::ZERO,
            chains_reported: 0,
            depth: 0,
            pri: 0,
            backout: None,
            list_alert: false,
        }
    }

    pub fn accumulator(&self) -> &BmapAccumulator {
        &self.accumulator
    }

    pub fn queue(&self) -> &SaveQueue<'s, S> {
        &self.queue
    }

    /// Counters for the current window
    pub fn stats(&self) -> ScanStats {
        let cache = self.cache.stats();
        let acc = self.accumulator.stats();
        ScanStats {
            extents_recorded: acc.extents_recorded,
            blocks_marked: acc.blocks_marked,
            extents_clipped: acc.extents_clipped,
            extents_invalid: acc.extents_invalid,
            cache_hits: cache.hits,
            cache_misses: cache.misses,
            cache_evictions: cache.evictions,
            dedup_factor: cache.dedup_factor,
            max_saved: self.queue.max_len() as u64,
            throttled: self.limiter.slept().saturating_sub(self.slept_before_window),
            ..self.stats
        }
    }

    /// Reset accumulator, cache and counters for the window at `sbase`,
    /// returning the window end
    pub fn begin_window(&mut self, sbase: u64) -> u64 {
        let sstop = self.accumulator.reset(sbase);
        self.cache.clear();
        self.queue.clear();
        self.stats = ScanStats::default();
        self.slept_before_window = self.limiter.slept();
        self.chains_reported = 0;
        self.depth = 0;
        self.pri = 0;
        self.backout = None;
        sstop
    }

    /// Scan one top-level root
    pub fn scan_root(&mut self, root: &ChainRef<'s, S>) -> ScanError {
        self.pri = 0;
        self.scan(root)
    }

    /// Work through deferred subtrees while no hard error occurred
    pub fn drain(&mut self, mut error: ScanError) -> ScanError {
        while !error.is_hard() {
            let Some(entry) = self.queue.pop_front() else {
                break;
            };
            self.pri = 0;
            self.backout = None;
            tracing::trace!("Resuming deferred {} from depth {}", entry.chain.id(), entry.depth);
            error |= self.scan(&entry.chain);
        }
        error
    }

    /// Release whatever is still queued
    pub fn finish_window(&mut self) {
        self.queue.clear();
        self.backout = None;
    }

    /// Check for abort, throttle, then fold the extent into the window
    fn visit(&mut self, bref: &Bref) -> ScanError {
        if self.cancel.is_cancelled() {
            return ScanError::ABORTED;
        }
        self.limiter.throttle(bref.btype);
        self.accumulator.record(bref);
        ScanError::empty()
    }

    fn report_progress(&mut self) {
        let chains = self.stats.chains_scanned;
        if chains >= self.chains_reported + PROGRESS_LARGE
            || (chains < PROGRESS_LARGE && chains >= self.chains_reported + PROGRESS_SMALL)
        {
            if self.progress {
                tracing::info!(
                    "chains {:<7} inodes {:<7} dirents {:<7} bytes {:>5}MB",
                    chains,
                    self.stats.inodes_scanned,
                    self.stats.dirents_scanned,
                    self.stats.bytes_scanned / 1_000_000
                );
            }
            self.chains_reported = chains;
        }
    }

    /// Scan a referenced, unlocked chain and everything reachable from it.
    ///
    /// The chain is returned in the same state. The cumulative error of the
    /// subtree is recorded in the visitation cache under the chain's own
    /// extent.
    pub fn scan(&mut self, parent: &ChainRef<'s, S>) -> ScanError {
        self.pri += 1;

        let parent_bref = match self.store.bref(parent.id()) {
            Ok(bref) => bref,
            Err(err) => {
                tracing::warn!("Cannot resolve {}: {}", parent.id(), err);
                return ScanError::IO;
            }
        };
        let mut guard = match parent.lock(LockMode::Shared) {
            Ok(guard) => Some(guard),
            Err(err) => {
                tracing::warn!("Cannot lock {}: {}", parent.id(), err);
                return ScanError::IO;
            }
        };
        let base_len = self.queue.len();

        // Never traverse a block table that failed its check.
        if self.store.check_failed(parent.id()) {
            self.stats.check_failures += 1;
            self.cache.settle(parent_bref.data_off, self.pri + 1, ScanError::CHECK);
            return ScanError::CHECK;
        }

        let is_pfs_root = parent_bref.is_pfs_root();
        if is_pfs_root {
            tracing::info!("Scanning PFS root {:#018x}", parent_bref.key);
        }

        let mut error = ScanError::empty();
        let mut rup_error = ScanError::empty();
        let mut cursor = ScanCursor::new();

        loop {
            let entry = match self.store.scan_child(parent.id(), &mut cursor) {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!("Scan of {} failed: {}", parent.id(), err);
                    error |= ScanError::IO;
                    break;
                }
            };
            let child = entry.chain.map(|id| ChainRef::adopt(self.store, id));
            let bref = entry.bref;

            // Most dirents carry no data reference
            if bref.btype == BrefType::Dirent {
                self.stats.dirents_scanned += 1;
            }
            if !bref.has_data() {
                continue;
            }

            self.pri += 1;
            if let Some(saved) = self.cache.test_and_record(bref.data_off, 1) {
                error |= saved;
                continue;
            }

            if bref.btype == BrefType::Inode {
                self.stats.inodes_scanned += 1;
            }

            error |= self.visit(&bref);
            if error.is_hard() {
                break;
            }

            let Some(child) = child else {
                continue;
            };

            self.stats.bytes_scanned += bref.bytes();
            self.stats.chains_scanned += 1;
            self.report_progress();

            if !bref.btype.is_recursable() {
                continue;
            }

            self.depth += 1;
            let mut relock_failed = false;
            if self.store.check_failed(child.id()) {
                tracing::warn!(
                    "Skipping {:?} {:#018x} with failed check",
                    bref.btype,
                    bref.data_off
                );
                self.stats.check_failures += 1;
                error |= ScanError::CHECK;
                self.cache.settle(bref.data_off, self.pri, ScanError::CHECK);
            } else if self
                .policy
                .should_defer(self.depth, self.queue.len(), self.backout.is_some())
            {
                if self.policy.overflowed(self.queue.len()) && !self.list_alert {
                    tracing::warn!(
                        "Saved chains exceeded {} at depth {}, backing off to less-efficient operation",
                        self.policy.max_deferred,
                        self.depth
                    );
                    self.list_alert = true;
                }
                let at = self.queue.insert(
                    self.backout,
                    SaveEntry {
                        chain: child,
                        depth: self.depth,
                    },
                );
                self.backout = Some(at);
                self.stats.subtrees_deferred += 1;
                self.pri += DEFER_PRIORITY;
            } else {
                let savepri = self.pri;
                drop(guard.take());
                self.pri = 0;
                rup_error |= self.scan(&child);
                self.pri += savepri;
                match parent.lock(LockMode::Shared) {
                    Ok(relocked) => guard = Some(relocked),
                    Err(err) => {
                        tracing::warn!("Cannot relock {}: {}", parent.id(), err);
                        error |= ScanError::IO;
                        relock_failed = true;
                    }
                }
            }
            self.depth -= 1;

            if relock_failed || rup_error.is_hard() {
                break;
            }
        }
        drop(guard);

        // Exhaust subtrees deferred beneath this PFS so its cumulative
        // error is known before it is settled.
        if is_pfs_root {
            while self.queue.len() > base_len && !(error | rup_error).is_hard() {
                let Some(entry) = self.queue.pop_front() else {
                    break;
                };
                self.backout = None;
                let opri = self.pri;
                self.pri = 0;
                rup_error |= self.scan(&entry.chain);
                self.pri = opri;
            }
        }

        error |= rup_error;

        if is_pfs_root && !error.is_empty() {
            tracing::warn!(
                "Encountered errors ({}) while scanning PFS root {:#018x}",
                error,
                parent_bref.key
            );
        }

        self.cache.settle(parent_bref.data_off, self.pri + 1, error);
        error
    }
}
