//! Freemap geometry, block references and volume layout
//!
//! The freemap describes storage with 2 bits per 16KB block. One level-0
//! record covers a 4MB segment, 256 records fill a 32KB level-1 leaf that
//! covers a 1GB zone. The first segment of every zone is reserved for
//! volume headers and freemap blocks and is never handed to the allocator.

use serde::{Deserialize, Serialize};

/// Physical buffer radix, folded into segment classes
pub const PBUFRADIX: u16 = 16;

/// Smallest extent radix the allocator hands out (1KB)
pub const RADIX_MIN: u8 = 10;

/// Low bits of `data_off` carrying the size radix
pub const OFF_MASK_RADIX: u64 = 0x3F;

pub const FREEMAP_LEVEL0_RADIX: u32 = 22; // 4MB segment
pub const FREEMAP_LEVEL1_RADIX: u32 = 30; // 1GB (256 records per leaf)

pub const FREEMAP_LEVEL0_SIZE: u64 = 1 << FREEMAP_LEVEL0_RADIX;
pub const FREEMAP_LEVEL1_SIZE: u64 = 1 << FREEMAP_LEVEL1_RADIX;
pub const FREEMAP_LEVEL0_MASK: u64 = FREEMAP_LEVEL0_SIZE - 1;
pub const FREEMAP_LEVEL1_MASK: u64 = FREEMAP_LEVEL1_SIZE - 1;

/// Physical size of a level-1 leaf
pub const FREEMAP_LEVELN_PSIZE: usize = 32768;

/// Granularity of one 2-bit bitmap entry (16KB)
pub const FREEMAP_BLOCK_RADIX: u32 = 14;
pub const FREEMAP_BLOCK_SIZE: u64 = 1 << FREEMAP_BLOCK_RADIX;
pub const FREEMAP_BLOCK_MASK: u64 = FREEMAP_BLOCK_SIZE - 1;

/// Bitmap words per level-0 record
pub const BMAP_ELEMENTS: usize = 8;
pub const BMAP_BITS_PER_ELEMENT: u32 = 64;
/// Blocks tracked by one bitmap word (64 bits / 2)
pub const BMAP_BLOCKS_PER_ELEMENT: usize = 32;
pub const BMAP_INDEX_RADIX: u32 = 5;
/// Storage tracked by one bitmap word (512KB)
pub const BMAP_INDEX_SIZE: u64 = FREEMAP_BLOCK_SIZE * BMAP_BLOCKS_PER_ELEMENT as u64;
pub const BMAP_INDEX_MASK: u64 = BMAP_INDEX_SIZE - 1;
/// Blocks per level-0 record (256)
pub const BMAP_BLOCKS: usize = BMAP_ELEMENTS * BMAP_BLOCKS_PER_ELEMENT;

/// On-media size of one level-0 record
pub const BMAP_RECORD_BYTES: usize = 128;

/// Level-0 records per level-1 leaf
pub const FREEMAP_COUNT: usize = FREEMAP_LEVELN_PSIZE / BMAP_RECORD_BYTES;

pub const SEGSIZE: u64 = FREEMAP_LEVEL0_SIZE;
pub const SEGMASK: u64 = SEGSIZE - 1;

/// Zone granularity used for reserved header areas
pub const ZONE_BYTES: u64 = FREEMAP_LEVEL1_SIZE;
pub const ZONE_MASK: u64 = ZONE_BYTES - 1;
/// Reserved area at the base of every zone
pub const ZONE_SEG: u64 = 4 * 1024 * 1024;

/// Bytes of storage represented by one byte of accumulator buffer
pub const FREEMAP_SIZEDIV: u64 = FREEMAP_LEVEL1_SIZE / FREEMAP_LEVELN_PSIZE as u64;

/// Block reference flag: inode is the root of a PFS
pub const BREF_FLAG_PFSROOT: u8 = 0x01;

/// Block reference types
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrefType {
    Empty = 0,
    Inode = 1,
    Indirect = 2,
    Data = 3,
    Dirent = 4,
    FreemapNode = 5,
    FreemapLeaf = 6,
    Freemap = 254,
    Volume = 255,
}

impl BrefType {
    /// Types whose blocks hold further block references
    pub fn is_recursable(self) -> bool {
        matches!(
            self,
            Self::Inode | Self::Indirect | Self::FreemapNode | Self::Freemap | Self::Volume
        )
    }

    /// Leaf records carry no per-record I/O during the scan
    pub fn is_leaf_record(self) -> bool {
        matches!(self, Self::Data | Self::Dirent)
    }
}

/// Block reference
///
/// `data_off` packs the byte offset with the size radix in its low 6 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Bref {
    /// Media offset | size radix
    pub data_off: u64,
    /// Logical key within the parent
    pub key: u64,
    /// Key range covered (log2)
    pub keybits: u8,
    /// Reference type
    #[serde(rename = "type")]
    pub btype: BrefType,
    /// `BREF_FLAG_*`
    #[serde(default)]
    pub flags: u8,
}

impl Bref {
    /// Build a reference to `bytes = 1 << radix` bytes at `offset`
    pub fn new(btype: BrefType, key: u64, offset: u64, radix: u8) -> Self {
        Bref {
            data_off: (offset & !OFF_MASK_RADIX) | (radix as u64 & OFF_MASK_RADIX),
            key,
            keybits: 0,
            btype,
            flags: 0,
        }
    }

    /// Reference without media storage (embedded dirents, pseudo roots)
    pub fn without_data(btype: BrefType, key: u64) -> Self {
        Bref {
            data_off: 0,
            key,
            keybits: 0,
            btype,
            flags: 0,
        }
    }

    pub fn with_flags(mut self, flags: u8) -> Self {
        self.flags = flags;
        self
    }

    /// Byte offset with the radix stripped
    pub fn offset(&self) -> u64 {
        self.data_off & !OFF_MASK_RADIX
    }

    pub fn radix(&self) -> u8 {
        (self.data_off & OFF_MASK_RADIX) as u8
    }

    /// Extent length in bytes (0 when no radix is encoded)
    pub fn bytes(&self) -> u64 {
        match self.radix() {
            0 => 0,
            r => 1u64 << r,
        }
    }

    pub fn has_data(&self) -> bool {
        self.offset() != 0
    }

    pub fn is_pfs_root(&self) -> bool {
        self.btype == BrefType::Inode && self.flags & BREF_FLAG_PFSROOT != 0
    }

    /// Segment class recorded in level-0 records
    pub fn class(&self) -> u16 {
        ((self.btype as u16) << 8) | PBUFRADIX
    }
}

/// 2-bit block state in a level-0 bitmap
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockState {
    /// 00
    Free = 0,
    /// 01, never produced by bulkfree
    Invalid = 1,
    /// 10, unused in one pass, not yet provably free
    Staged = 2,
    /// 11
    Allocated = 3,
}

impl BlockState {
    pub fn from_bits(bits: u64) -> Self {
        match bits & 3 {
            0 => Self::Free,
            1 => Self::Invalid,
            2 => Self::Staged,
            _ => Self::Allocated,
        }
    }

    pub fn bits(self) -> u64 {
        self as u64
    }

    pub const ALL: [BlockState; 4] = [
        BlockState::Free,
        BlockState::Invalid,
        BlockState::Staged,
        BlockState::Allocated,
    ];
}

/// Volume geometry the engine works against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeGeometry {
    /// First byte the allocator may hand out
    pub allocator_beg: u64,
    /// Device size in bytes
    pub total_size: u64,
}

impl VolumeGeometry {
    pub fn new(allocator_beg: u64, total_size: u64) -> Self {
        VolumeGeometry {
            allocator_beg,
            total_size,
        }
    }

    /// Whether the segment starting at `key` is outside the allocatable
    /// range or inside a zone's reserved header area.
    pub fn segment_reserved(&self, key: u64) -> bool {
        let lokey = (self.allocator_beg + SEGMASK) & !SEGMASK;
        let hikey = self.total_size & !SEGMASK;
        key < lokey || key - zone_base(key) < ZONE_SEG || key >= hikey
    }

    /// Whether an extent offset may carry allocator-managed data
    pub fn in_allocator_range(&self, offset: u64) -> bool {
        offset >= self.allocator_beg && offset < self.total_size
    }

    /// Number of level-1 leaves needed to describe the device
    pub fn leaf_count(&self) -> u64 {
        self.total_size.div_ceil(FREEMAP_LEVEL1_SIZE)
    }
}

/// Base of the 1GB leaf covering `offset`
pub fn level1_base(offset: u64) -> u64 {
    offset & !FREEMAP_LEVEL1_MASK
}

/// Base of the zone covering `offset`
pub fn zone_base(offset: u64) -> u64 {
    offset & !ZONE_MASK
}

/// Index of the level-0 record for `offset` within its leaf
pub fn bmap_index(offset: u64) -> usize {
    ((offset & FREEMAP_LEVEL1_MASK) >> FREEMAP_LEVEL0_RADIX) as usize
}

/// Bitmap word and shift for the block covering a segment-relative offset
pub fn bitmap_position(seg_off: u64) -> (usize, u32) {
    let bindex = (seg_off >> (FREEMAP_BLOCK_RADIX + BMAP_INDEX_RADIX)) as usize;
    let shift = (((seg_off & BMAP_INDEX_MASK) >> FREEMAP_BLOCK_RADIX) << 1) as u32;
    (bindex, shift)
}
