//! Bitmap accumulator
//!
//! Rebuilds the level-0 freemap records for one storage window from the
//! extents the topology scan reports. Every block touched by a live extent
//! is marked `11`; everything else stays `00` and becomes a candidate for
//! staging when the window is reconciled against the live freemap.

use crate::freemap::BmapData;
use crate::layout::{
    bitmap_position, Bref, VolumeGeometry, BMAP_RECORD_BYTES, FREEMAP_BLOCK_MASK,
    FREEMAP_BLOCK_SIZE, FREEMAP_LEVEL0_MASK, FREEMAP_LEVEL0_RADIX, SEGSIZE,
};

/// What `record` did with an extent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Extent lies outside `[sbase, sstop)`
    OutsideWindow,
    /// Extent lies below `allocator_beg` or beyond the device
    OutsideAllocator,
    /// Size radix is zero or larger than a segment
    InvalidRadix,
    /// Extent was folded into the window
    Recorded {
        /// Blocks that went from `00` to `11`
        newly_marked: u32,
        /// Extent crossed a window or segment boundary and was truncated
        clipped: bool,
    },
}

/// Accumulator counters for one window
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccumulatorStats {
    pub extents_recorded: u64,
    pub blocks_marked: u64,
    pub extents_clipped: u64,
    pub extents_invalid: u64,
}

/// In-memory level-0 records for the active window
pub struct BmapAccumulator {
    records: Vec<BmapData>,
    geometry: VolumeGeometry,
    sbase: u64,
    sstop: u64,
    stats: AccumulatorStats,
}

impl BmapAccumulator {
    /// Accumulator backed by `buffer_bytes` of records (128 bytes per 4MB)
    pub fn new(buffer_bytes: u64, geometry: VolumeGeometry) -> Self {
        let count = (buffer_bytes / BMAP_RECORD_BYTES as u64).max(1) as usize;
        BmapAccumulator {
            records: vec![BmapData::free_segment(); count],
            geometry,
            sbase: 0,
            sstop: 0,
            stats: AccumulatorStats::default(),
        }
    }

    /// Storage bytes one window can describe
    pub fn window_span(&self) -> u64 {
        self.records.len() as u64 * SEGSIZE
    }

    pub fn sbase(&self) -> u64 {
        self.sbase
    }

    pub fn sstop(&self) -> u64 {
        self.sstop
    }

    pub fn stats(&self) -> AccumulatorStats {
        self.stats
    }

    pub fn geometry(&self) -> VolumeGeometry {
        self.geometry
    }

    /// Start a new window at `sbase`, returning its end.
    ///
    /// Segments the allocator never hands out (below `allocator_beg`, zone
    /// headers, the partial tail) are preset to the fully allocated
    /// sentinel so reconciliation can never free them.
    pub fn reset(&mut self, sbase: u64) -> u64 {
        let total = self.geometry.total_size;
        self.sbase = sbase;
        self.sstop = if total.saturating_sub(sbase) <= self.window_span() {
            total
        } else {
            sbase + self.window_span()
        };

        for (i, bmap) in self.records.iter_mut().enumerate() {
            let key = sbase + i as u64 * SEGSIZE;
            *bmap = if self.geometry.segment_reserved(key) {
                BmapData::reserved()
            } else {
                BmapData::free_segment()
            };
        }
        self.stats = AccumulatorStats::default();
        self.sstop
    }

    /// Accumulated record for the segment at `offset`, if it is in the window
    pub fn segment(&self, offset: u64) -> Option<&BmapData> {
        if offset < self.sbase || offset >= self.sstop {
            return None;
        }
        self.records
            .get(((offset - self.sbase) >> FREEMAP_LEVEL0_RADIX) as usize)
    }

    /// Segment base offsets and records covering the window, in order
    pub fn segments(&self) -> impl Iterator<Item = (u64, &BmapData)> + '_ {
        let count = (self.sstop.saturating_sub(self.sbase)).div_ceil(SEGSIZE) as usize;
        self.records
            .iter()
            .take(count)
            .enumerate()
            .map(move |(i, bmap)| (self.sbase + i as u64 * SEGSIZE, bmap))
    }

    /// Fold one extent into the window
    pub fn record(&mut self, bref: &Bref) -> RecordOutcome {
        let mut data_off = bref.offset();
        if data_off < self.sbase || data_off >= self.sstop {
            return RecordOutcome::OutsideWindow;
        }
        if !self.geometry.in_allocator_range(data_off) {
            return RecordOutcome::OutsideAllocator;
        }

        let radix = bref.radix() as u32;
        if radix == 0 || radix > FREEMAP_LEVEL0_RADIX {
            tracing::warn!(
                "Ignoring extent with invalid radix {:#018x} key {:#018x}/{}",
                bref.data_off,
                bref.key,
                bref.keybits
            );
            self.stats.extents_invalid += 1;
            return RecordOutcome::InvalidRadix;
        }
        let mut bytes = 1u64 << radix;
        let mut clipped = false;

        if data_off + bytes > self.sstop {
            tracing::warn!(
                "Extent crosses window boundary {:#018x} key {:#018x}/{}",
                bref.data_off,
                bref.key,
                bref.keybits
            );
            bytes = self.sstop - data_off;
            clipped = true;
        }

        data_off -= self.sbase;
        let index = (data_off >> FREEMAP_LEVEL0_RADIX) as usize;
        let bmap = &mut self.records[index];

        let mut seg_off = data_off & FREEMAP_LEVEL0_MASK;
        if seg_off + bytes > SEGSIZE {
            tracing::warn!(
                "Extent crosses 4MB segment boundary {:#018x} key {:#018x}/{}",
                bref.data_off,
                bref.key,
                bref.keybits
            );
            bytes = SEGSIZE - seg_off;
            clipped = true;
        }

        if bmap.class == 0 {
            bmap.class = bref.class();
            bmap.avail = SEGSIZE as u32;
        }

        // Sub-block extents push linear past their end; block multiples
        // only move it when it currently points inside them.
        let end = (seg_off + bytes) as u32;
        if bytes & FREEMAP_BLOCK_MASK != 0 {
            if bmap.linear < end {
                bmap.linear = end;
            }
        } else if bmap.linear >= seg_off as u32 && bmap.linear < end {
            bmap.linear = end;
        }

        let mut newly_marked = 0u32;
        let mut remaining = bytes;
        while remaining > 0 {
            let (bindex, shift) = bitmap_position(seg_off);
            let bmask = 3u64 << shift;
            if bmap.bitmapq[bindex] & bmask == 0 {
                bmap.avail = bmap.avail.saturating_sub(FREEMAP_BLOCK_SIZE as u32);
                newly_marked += 1;
            }
            bmap.bitmapq[bindex] |= bmask;

            // Next block boundary; unaligned extents may touch one extra block
            let next = (seg_off & !FREEMAP_BLOCK_MASK) + FREEMAP_BLOCK_SIZE;
            let step = next - seg_off;
            seg_off = next;
            remaining = remaining.saturating_sub(step);
            if seg_off >= SEGSIZE {
                break;
            }
        }

        self.stats.extents_recorded += 1;
        self.stats.blocks_marked += newly_marked as u64;
        if clipped {
            self.stats.extents_clipped += 1;
        }
        RecordOutcome::Recorded {
            newly_marked,
            clipped,
        }
    }
}
