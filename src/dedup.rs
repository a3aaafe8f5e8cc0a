//! Visitation cache
//!
//! A small 8-way set-associative table keyed by extent `data_off`. The tree
//! may reference one physical extent from many logical paths; the cache
//! keeps the scan proportional to distinct extents rather than references.
//! Collisions evict the slot with the lowest priority, so the priority a
//! node settles at (roughly the size of the subtree beneath it) decides how
//! long it survives.

use crate::error::ScanError;

/// Slots per bucket
pub const VISIT_WAYS: usize = 8;

#[derive(Debug, Clone, Copy, Default)]
struct VisitSlot {
    data_off: u64,
    ticks: u32,
    saved_error: ScanError,
}

/// Visitation cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VisitCacheStats {
    /// Lookups that found the extent already visited
    pub hits: u64,
    /// Lookups that inserted a new entry
    pub misses: u64,
    /// Misses that displaced a live entry
    pub evictions: u64,
    /// Sum of the stored priority of every leaf-priority hit
    pub dedup_factor: u64,
}

/// Per-window extent visitation cache
pub struct VisitCache {
    slots: Vec<VisitSlot>,
    mask: usize,
    stats: VisitCacheStats,
}

impl VisitCache {
    /// Create a cache with `entries` slots (rounded up to a power of two,
    /// at least one bucket)
    pub fn new(entries: usize) -> Self {
        let entries = entries.max(VISIT_WAYS).next_power_of_two();
        VisitCache {
            slots: vec![VisitSlot::default(); entries],
            mask: entries - 1,
            stats: VisitCacheStats::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn bucket(&self, data_off: u64) -> usize {
        let n = crc32fast::hash(&data_off.to_le_bytes()) as usize;
        n & self.mask & !(VISIT_WAYS - 1)
    }

    /// Look up an extent, recording it on a miss.
    ///
    /// On a hit the stored priority is raised to `pri` and the cumulative
    /// error of the earlier visit is returned. On a miss the lowest-priority
    /// slot in the bucket is replaced and `None` is returned.
    pub fn test_and_record(&mut self, data_off: u64, pri: u32) -> Option<ScanError> {
        let base = self.bucket(data_off);
        let mut best = base;
        for i in base..base + VISIT_WAYS {
            let slot = &mut self.slots[i];
            if slot.ticks != 0 && slot.data_off == data_off {
                if slot.ticks < pri {
                    slot.ticks = pri;
                }
                self.stats.hits += 1;
                if pri == 1 {
                    self.stats.dedup_factor += slot.ticks as u64;
                }
                return Some(slot.saved_error);
            }
            let ticks = slot.ticks;
            if ticks < self.slots[best].ticks {
                best = i;
            }
        }

        self.stats.misses += 1;
        if self.slots[best].ticks != 0 {
            self.stats.evictions += 1;
        }
        self.slots[best] = VisitSlot {
            data_off,
            ticks: pri.max(1),
            saved_error: ScanError::empty(),
        };
        None
    }

    /// Store the final priority and cumulative error of a finished node.
    ///
    /// Errors are OR-ed into an existing entry so later hits report every
    /// problem seen beneath the extent.
    pub fn settle(&mut self, data_off: u64, pri: u32, error: ScanError) {
        if data_off == 0 {
            return;
        }
        let base = self.bucket(data_off);
        let mut best = base;
        for i in base..base + VISIT_WAYS {
            let slot = &mut self.slots[i];
            if slot.ticks != 0 && slot.data_off == data_off {
                if slot.ticks < pri {
                    slot.ticks = pri;
                }
                slot.saved_error |= error;
                return;
            }
            let ticks = slot.ticks;
            if ticks < self.slots[best].ticks {
                best = i;
            }
        }
        if self.slots[best].ticks != 0 {
            self.stats.evictions += 1;
        }
        self.slots[best] = VisitSlot {
            data_off,
            ticks: pri.max(1),
            saved_error: error,
        };
    }

    /// Forget every entry and reset statistics
    pub fn clear(&mut self) {
        self.slots.fill(VisitSlot::default());
        self.stats = VisitCacheStats::default();
    }

    pub fn stats(&self) -> VisitCacheStats {
        self.stats
    }
}
