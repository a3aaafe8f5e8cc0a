//! Live reconciliation
//!
//! Merges a window's accumulated (snapshot) bitmap into the live freemap.
//! This is not a copy. Blocks the scan did not see are moved one stage
//! toward free per pass:
//!
//! ```text
//!  accumulated   live before   live after
//!      00            11            10      staged
//!      00            10            00      freed
//!      11            10            11      reallocated during the pass
//!      11          00 / 01         11      corruption, forced allocated
//! ```
//!
//! A block therefore only reaches `00` after two consecutive passes that did
//! not observe it, which bounds races with the live allocator to one pass.

use crate::accumulator::BmapAccumulator;
use crate::chain::{ChainRef, ChainStore, LockMode};
use crate::error::{BulkfreeError, Result};
use crate::freemap::BmapData;
use crate::layout::{
    bmap_index, level1_base, BlockState, BMAP_BLOCKS, BMAP_ELEMENTS, FREEMAP_BLOCK_MASK,
    FREEMAP_BLOCK_SIZE, SEGSIZE,
};
use serde::{Deserialize, Serialize};

/// Effect of one table lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Unchanged,
    /// 11 -> 10
    Stage,
    /// 10 -> 00
    Free,
    /// 10 -> 11
    RaceRecovered,
    /// 00 -> 11
    RepairFree,
    /// 01 -> 11
    RepairInvalid,
    /// 01 left alone, the scan saw nothing there
    InvalidStuck,
}

/// Apply the reconciliation table to one block
pub fn transition(accumulated: BlockState, live: BlockState) -> (BlockState, Transition) {
    use crate::layout::BlockState::*;
    match (accumulated, live) {
        (Free, Allocated) => (Staged, Transition::Stage),
        (Free, Staged) => (Free, Transition::Free),
        (Free, Invalid) => (Invalid, Transition::InvalidStuck),
        (Allocated, Staged) => (Allocated, Transition::RaceRecovered),
        (Allocated, Free) => (Allocated, Transition::RepairFree),
        (Allocated, Invalid) => (Allocated, Transition::RepairInvalid),
        // The accumulator only ever produces 00 and 11
        (_, state) => (state, Transition::Unchanged),
    }
}

/// Per-state transition counts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionCounters {
    /// 10 -> 00
    pub staged_to_free: u64,
    /// 11 -> 10
    pub allocated_to_staged: u64,
    /// 00 -> 11 (should not happen)
    pub free_to_allocated: u64,
    /// 01 -> 11 (should not happen)
    pub invalid_to_allocated: u64,
    /// 10 -> 11
    pub staged_to_allocated: u64,
    /// 01 seen where the scan found nothing
    pub invalid_stuck: u64,
}

impl TransitionCounters {
    pub fn merge(&mut self, other: &TransitionCounters) {
        self.staged_to_free += other.staged_to_free;
        self.allocated_to_staged += other.allocated_to_staged;
        self.free_to_allocated += other.free_to_allocated;
        self.invalid_to_allocated += other.invalid_to_allocated;
        self.staged_to_allocated += other.staged_to_allocated;
        self.invalid_stuck += other.invalid_stuck;
    }

    /// Inconsistencies repaired by forcing blocks allocated
    pub fn inconsistencies(&self) -> u64 {
        self.free_to_allocated + self.invalid_to_allocated
    }

    fn count(&mut self, transition: Transition) {
        match transition {
            Transition::Unchanged => {}
            Transition::Stage => self.allocated_to_staged += 1,
            Transition::Free => self.staged_to_free += 1,
            Transition::RaceRecovered => self.staged_to_allocated += 1,
            Transition::RepairFree => self.free_to_allocated += 1,
            Transition::RepairInvalid => self.invalid_to_allocated += 1,
            Transition::InvalidStuck => self.invalid_stuck += 1,
        }
    }
}

/// Reconciliation results for one or more windows
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub transitions: TransitionCounters,
    /// Segments reset to the empty template
    pub segments_cleaned: u64,
    pub linear_adjusts: u64,
    /// Segments skipped by the bit-for-bit fast path
    pub segments_in_sync: u64,
    pub segments_modified: u64,
    /// Segments with no live leaf
    pub missing_leaves: u64,
    /// Missing leaves whose segment the scan found in use
    pub missing_allocated: u64,
    /// Leaves that could not be locked or read
    pub leaf_errors: u64,
    pub lookup_failures: u64,
    pub modify_failures: u64,
    /// Segments skipped because of a failed leaf lookup
    pub segments_skipped: u64,
    /// Bytes moved from staged to free
    pub bytes_freed: u64,
    /// Net change in free space, negative when repairs reclaimed space
    pub free_delta: i64,
}

impl SyncStats {
    pub fn merge(&mut self, other: &SyncStats) {
        self.transitions.merge(&other.transitions);
        self.segments_cleaned += other.segments_cleaned;
        self.linear_adjusts += other.linear_adjusts;
        self.segments_in_sync += other.segments_in_sync;
        self.segments_modified += other.segments_modified;
        self.missing_leaves += other.missing_leaves;
        self.missing_allocated += other.missing_allocated;
        self.leaf_errors += other.leaf_errors;
        self.lookup_failures += other.lookup_failures;
        self.modify_failures += other.modify_failures;
        self.segments_skipped += other.segments_skipped;
        self.bytes_freed += other.bytes_freed;
        self.free_delta += other.free_delta;
    }

    /// Storage-collaborator failures that left segments unreconciled
    pub fn failures(&self) -> u64 {
        self.leaf_errors + self.lookup_failures + self.modify_failures + self.missing_allocated
    }
}

/// Merge one accumulated segment into its live record.
///
/// `seg_base` is the device offset of the segment, used for diagnostics.
pub fn sync_adjust(live: &mut BmapData, bmap: &BmapData, seg_base: u64, stats: &mut SyncStats) {
    for bindex in 0..BMAP_ELEMENTS {
        if live.bitmapq[bindex] == bmap.bitmapq[bindex] {
            continue;
        }
        for slot in 0..BMAP_BLOCKS / BMAP_ELEMENTS {
            let block = bindex * (BMAP_BLOCKS / BMAP_ELEMENTS) + slot;
            let before = live.state(block);
            let (after, change) = transition(bmap.state(block), before);
            let block_off = seg_base + block as u64 * FREEMAP_BLOCK_SIZE;
            match change {
                Transition::Free => {
                    stats.bytes_freed += FREEMAP_BLOCK_SIZE;
                    stats.free_delta += FREEMAP_BLOCK_SIZE as i64;
                }
                Transition::RepairFree => {
                    tracing::error!(
                        "00->11 critical freemap transition for data block {:#018x}",
                        block_off
                    );
                    stats.free_delta -= FREEMAP_BLOCK_SIZE as i64;
                }
                Transition::RepairInvalid => {
                    tracing::error!(
                        "01->11 freemap transition for data block {:#018x}",
                        block_off
                    );
                }
                Transition::InvalidStuck => {
                    tracing::warn!("Cannot transition m=00/l=01 at {:#018x}", block_off);
                }
                _ => {}
            }
            stats.transitions.count(change);
            if after != before {
                live.set_state(block, after);
            }
        }
    }

    live.avail = live.free_bytes() as u32;

    match live.highest_used_word() {
        None => {
            // Completely empty, reset the whole segment
            live.avail = SEGSIZE as u32;
            live.class = 0;
            live.linear = 0;
            stats.segments_cleaned += 1;
        }
        Some(bindex) if bindex < BMAP_ELEMENTS - 1 => {
            let block_mask = FREEMAP_BLOCK_MASK as u32;
            if live.linear < bmap.linear && (live.linear ^ bmap.linear) & !block_mask == 0 {
                // Still within the same 16KB block, fragments may continue
                live.linear = bmap.linear;
            } else {
                live.linear = (bmap.linear + block_mask) & !block_mask;
            }
            stats.linear_adjusts += 1;
        }
        Some(_) => {
            // Tail word in use, disable the linear iterator
            live.linear = SEGSIZE as u32;
        }
    }
}

enum SegmentSync {
    InSync,
    Modified,
    ModifyFailed,
}

fn sync_segment<S: ChainStore + ?Sized>(
    leaf: &ChainRef<'_, S>,
    index: usize,
    seg_base: u64,
    bmap: &BmapData,
    stats: &mut SyncStats,
) -> Result<SegmentSync> {
    let store = leaf.store();

    // Fast compare without write-locking the leaf
    {
        let _shared = leaf.lock(LockMode::Shared)?;
        let live = store.read_bmap(leaf.id(), index)?;
        let bigmask = store.leaf_bigmask(leaf.id())?;
        if live.bitmapq == bmap.bitmapq && live.linear >= bmap.linear && bmap.bigmask_good(bigmask) {
            return Ok(SegmentSync::InSync);
        }
    }

    let _exclusive = leaf.lock(LockMode::Exclusive)?;
    if let Err(err) = store.modify(leaf.id()) {
        tracing::warn!(
            "Unable to modify freemap {} for data block {:#018x}: {}",
            leaf.id(),
            seg_base,
            err
        );
        return Ok(SegmentSync::ModifyFailed);
    }

    // The live record may have moved since the shared compare
    let mut live = store.read_bmap(leaf.id(), index)?;
    let before = live;
    sync_adjust(&mut live, bmap, seg_base, stats);
    let bigmask = store.leaf_bigmask(leaf.id())? | live.bigmask();
    store.write_bmap(leaf.id(), index, &live, bigmask)?;

    tracing::debug!(
        "live {:#018x} {:04}.{:04x} (avail={}->{}) linear {}->{}",
        seg_base,
        index,
        live.class,
        before.avail,
        live.avail,
        before.linear,
        live.linear
    );
    Ok(SegmentSync::Modified)
}

/// Reconcile the accumulator's window against the live freemap
pub fn reconcile<S: ChainStore + ?Sized>(store: &S, accumulator: &BmapAccumulator) -> SyncStats {
    let geometry = accumulator.geometry();
    let mut stats = SyncStats::default();

    tracing::info!(
        "Bulkfree reconciling range {:#018x}-{:#018x}",
        accumulator.sbase().max(geometry.allocator_beg),
        accumulator.sstop().min(geometry.total_size)
    );

    let mut leaf_key: Option<u64> = None;
    let mut leaf: Option<ChainRef<'_, S>> = None;
    let mut failed_key: Option<u64> = None;

    for (data_off, bmap) in accumulator.segments() {
        // The freemap is not used below allocator_beg or beyond the device
        if data_off < geometry.allocator_beg || data_off >= geometry.total_size {
            continue;
        }

        let key = level1_base(data_off);
        if failed_key == Some(key) {
            stats.segments_skipped += 1;
            continue;
        }
        if leaf_key != Some(key) {
            leaf = None;
            leaf_key = Some(key);
            match store.lookup_freemap_leaf(key) {
                Ok(found) => leaf = found.map(|id| ChainRef::adopt(store, id)),
                Err(err) => {
                    tracing::warn!("Freemap lookup error near {:#018x}: {}", data_off, err);
                    stats.lookup_failures += 1;
                    stats.segments_skipped += 1;
                    failed_key = Some(key);
                    continue;
                }
            }
        }

        let Some(live_leaf) = leaf.as_ref() else {
            stats.missing_leaves += 1;
            if bmap.class != 0 && bmap.has_allocated() {
                tracing::warn!(
                    "Cannot locate live leaf for allocated data near {:#018x}",
                    data_off
                );
                stats.missing_allocated += 1;
            }
            continue;
        };

        if store.check_failed(live_leaf.id()) {
            tracing::warn!("Unable to access freemap near {:#018x}", data_off);
            stats.leaf_errors += 1;
            stats.segments_skipped += 1;
            failed_key = Some(key);
            leaf = None;
            continue;
        }

        match sync_segment(live_leaf, bmap_index(data_off), data_off, bmap, &mut stats) {
            Ok(SegmentSync::InSync) => stats.segments_in_sync += 1,
            Ok(SegmentSync::Modified) => stats.segments_modified += 1,
            Ok(SegmentSync::ModifyFailed) => stats.modify_failures += 1,
            Err(err @ BulkfreeError::ModifyFailed { .. }) => {
                tracing::warn!("Freemap update near {:#018x} failed: {}", data_off, err);
                stats.modify_failures += 1;
            }
            Err(err) => {
                tracing::warn!("Freemap access near {:#018x} failed: {}", data_off, err);
                stats.leaf_errors += 1;
            }
        }
    }

    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::BlockState::*;

    fn segment(states: &[(usize, BlockState)]) -> BmapData {
        let mut bmap = BmapData::free_segment();
        for &(block, state) in states {
            bmap.set_state(block, state);
        }
        bmap.avail = bmap.free_bytes() as u32;
        bmap
    }

    #[test]
    fn test_transition_table() {
        assert_eq!(transition(Free, Allocated), (Staged, Transition::Stage));
        assert_eq!(transition(Free, Staged), (Free, Transition::Free));
        assert_eq!(transition(Free, Free), (Free, Transition::Unchanged));
        assert_eq!(transition(Free, Invalid), (Invalid, Transition::InvalidStuck));
        assert_eq!(transition(Allocated, Staged), (Allocated, Transition::RaceRecovered));
        assert_eq!(transition(Allocated, Free), (Allocated, Transition::RepairFree));
        assert_eq!(transition(Allocated, Invalid), (Allocated, Transition::RepairInvalid));
        assert_eq!(transition(Allocated, Allocated), (Allocated, Transition::Unchanged));
    }

    #[test]
    fn test_staged_block_is_freed() {
        let mut live = segment(&[(3, Staged), (4, Allocated)]);
        let bmap = segment(&[(4, Allocated)]);
        let avail = live.avail;
        let mut stats = SyncStats::default();

        sync_adjust(&mut live, &bmap, 0, &mut stats);
        assert_eq!(live.state(3), Free);
        assert_eq!(live.avail, avail + FREEMAP_BLOCK_SIZE as u32);
        assert_eq!(stats.transitions.staged_to_free, 1);
        assert_eq!(stats.bytes_freed, FREEMAP_BLOCK_SIZE);
        assert_eq!(stats.free_delta, FREEMAP_BLOCK_SIZE as i64);
    }

    #[test]
    fn test_race_recovered_block() {
        let mut live = segment(&[(10, Staged)]);
        let bmap = segment(&[(10, Allocated)]);
        let avail = live.avail;
        let mut stats = SyncStats::default();

        sync_adjust(&mut live, &bmap, 0, &mut stats);
        assert_eq!(live.state(10), Allocated);
        assert_eq!(live.avail, avail);
        assert_eq!(stats.transitions.staged_to_allocated, 1);
    }

    #[test]
    fn test_empty_segment_is_cleaned() {
        let mut live = segment(&[(0, Staged), (200, Staged)]);
        live.class = (3 << 8) | 16;
        live.linear = 12345;
        let mut stats = SyncStats::default();

        sync_adjust(&mut live, &BmapData::free_segment(), 0, &mut stats);
        assert_eq!(live, BmapData::free_segment());
        assert_eq!(stats.segments_cleaned, 1);
    }

    #[test]
    fn test_linear_same_block_upgrade() {
        let mut live = segment(&[(0, Allocated)]);
        live.linear = 1024;
        let mut bmap = segment(&[(0, Allocated)]);
        bmap.linear = 4096;
        // Force a difference so the segment is walked
        live.set_state(5, Allocated);
        let mut stats = SyncStats::default();

        sync_adjust(&mut live, &bmap, 0, &mut stats);
        assert_eq!(live.linear, 4096);
        assert_eq!(stats.linear_adjusts, 1);
        assert_eq!(live.state(5), Staged);
    }

    #[test]
    fn test_linear_rounds_up_to_block() {
        let mut live = segment(&[(1, Allocated)]);
        live.linear = 40000;
        let mut bmap = segment(&[(1, Allocated)]);
        bmap.linear = 17000;
        let mut stats = SyncStats::default();

        sync_adjust(&mut live, &bmap, 0, &mut stats);
        assert_eq!(live.linear, 32768);
    }

    #[test]
    fn test_full_tail_disables_linear() {
        let mut live = segment(&[(255, Allocated)]);
        let bmap = segment(&[(255, Allocated)]);
        let mut stats = SyncStats::default();

        sync_adjust(&mut live, &bmap, 0, &mut stats);
        assert_eq!(live.linear, SEGSIZE as u32);
        assert_eq!(stats.linear_adjusts, 0);
    }

    #[test]
    fn test_repair_free_block() {
        let mut live = segment(&[]);
        let bmap = segment(&[(7, Allocated)]);
        let mut stats = SyncStats::default();

        sync_adjust(&mut live, &bmap, 0, &mut stats);
        assert_eq!(live.state(7), Allocated);
        assert_eq!(live.avail as u64, SEGSIZE - FREEMAP_BLOCK_SIZE);
        assert_eq!(stats.transitions.free_to_allocated, 1);
        assert_eq!(stats.free_delta, -(FREEMAP_BLOCK_SIZE as i64));
        assert_eq!(stats.transitions.inconsistencies(), 1);
    }

    #[test]
    fn test_merge_stats() {
        let mut total = SyncStats::default();
        let mut one = SyncStats::default();
        one.bytes_freed = 10;
        one.free_delta = -5;
        one.transitions.staged_to_free = 2;
        total.merge(&one);
        total.merge(&one);
        assert_eq!(total.bytes_freed, 20);
        assert_eq!(total.free_delta, -10);
        assert_eq!(total.transitions.staged_to_free, 4);
    }
}
