//! Level-0 freemap records and the bigmask size-class summary
//!
//! A [`BmapData`] describes one 4MB segment with 2 bits per 16KB block.
//! The same record layout is used for the accumulator's snapshot and the
//! live leaf the allocator mutates.

use crate::layout::{
    bitmap_position, BlockState, BMAP_BITS_PER_ELEMENT, BMAP_BLOCKS, BMAP_BLOCKS_PER_ELEMENT,
    BMAP_ELEMENTS, FREEMAP_BLOCK_RADIX, FREEMAP_BLOCK_SIZE, SEGSIZE,
};
use serde::{Deserialize, Serialize};

/// Level-0 bitmap record (one 4MB segment)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BmapData {
    /// `(bref_type << 8) | pbufradix`, 0 while unclassified
    pub class: u16,

    /// Bytes believed available in the segment
    pub avail: u32,

    /// Segment-relative offset below which space is known used
    pub linear: u32,

    /// 2 bits per 16KB block, 32 blocks per word
    pub bitmapq: [u64; BMAP_ELEMENTS],
}

impl BmapData {
    /// Unclassified, fully free segment
    pub fn free_segment() -> Self {
        BmapData {
            class: 0,
            avail: SEGSIZE as u32,
            linear: 0,
            bitmapq: [0; BMAP_ELEMENTS],
        }
    }

    /// Fully allocated sentinel for segments the allocator never manages
    pub fn reserved() -> Self {
        BmapData {
            class: 0,
            avail: 0,
            linear: SEGSIZE as u32,
            bitmapq: [u64::MAX; BMAP_ELEMENTS],
        }
    }

    /// State of block `block` (0..256)
    pub fn state(&self, block: usize) -> BlockState {
        let word = self.bitmapq[block / BMAP_BLOCKS_PER_ELEMENT];
        let shift = (block % BMAP_BLOCKS_PER_ELEMENT) * 2;
        BlockState::from_bits(word >> shift)
    }

    pub fn set_state(&mut self, block: usize, state: BlockState) {
        let word = &mut self.bitmapq[block / BMAP_BLOCKS_PER_ELEMENT];
        let shift = (block % BMAP_BLOCKS_PER_ELEMENT) * 2;
        *word = (*word & !(3u64 << shift)) | (state.bits() << shift);
    }

    /// State of the block covering a segment-relative byte offset
    pub fn state_at(&self, seg_off: u64) -> BlockState {
        let (bindex, shift) = bitmap_position(seg_off);
        BlockState::from_bits(self.bitmapq[bindex] >> shift)
    }

    /// Number of blocks in the given state
    pub fn count(&self, state: BlockState) -> usize {
        (0..BMAP_BLOCKS).filter(|&b| self.state(b) == state).count()
    }

    /// Bytes in fully free (00) blocks
    pub fn free_bytes(&self) -> u64 {
        self.count(BlockState::Free) as u64 * FREEMAP_BLOCK_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.bitmapq.iter().all(|&w| w == 0)
    }

    /// Index of the highest non-zero bitmap word
    pub fn highest_used_word(&self) -> Option<usize> {
        self.bitmapq.iter().rposition(|&w| w != 0)
    }

    /// Whether the bitmap records any 11 block
    pub fn has_allocated(&self) -> bool {
        self.bitmapq.iter().any(|&w| w & (w >> 1) & 0x5555_5555_5555_5555 != 0)
    }

    /// Size classes that may still be satisfied from this segment.
    ///
    /// Bit `r` is set when an aligned run of free blocks at least `1 << r`
    /// bytes long exists. Radixes below the block size are implied by any
    /// free block.
    pub fn bigmask(&self) -> u32 {
        let mut bigmask = 0u32;
        for &mask in &self.bitmapq {
            let mut radix_mask = (1u32 << FREEMAP_BLOCK_RADIX) | ((1u32 << FREEMAP_BLOCK_RADIX) - 1);
            let mut iter = 2u32;
            while iter <= BMAP_BITS_PER_ELEMENT {
                let mut scan = if iter == BMAP_BITS_PER_ELEMENT {
                    u64::MAX
                } else {
                    (1u64 << iter) - 1
                };
                let mut j = 0;
                while j < BMAP_BITS_PER_ELEMENT {
                    if scan & mask == 0 {
                        bigmask |= radix_mask;
                    }
                    scan = scan.checked_shl(iter).unwrap_or(0);
                    j += iter;
                }
                iter <<= 1;
                radix_mask = (radix_mask << 1) | 1;
            }
        }
        bigmask
    }

    /// Whether a live leaf bigmask advertises every class this record can
    /// satisfy.
    pub fn bigmask_good(&self, live_bigmask: u32) -> bool {
        let expected = self.bigmask();
        live_bigmask & expected == expected
    }
}
