//! In-memory chain store
//!
//! A complete [`ChainStore`] that keeps the block reference tree and the
//! live freemap in memory. It formats volumes, builds trees, runs a simple
//! first-fit allocator that is safe to call while a bulkfree pass is
//! running, injects storage failures, and round-trips through a JSON image.
//! Tests, benches, the fuzz targets and the `h2bulkfree` tool all run the
//! engine against it.

use crate::chain::{ChainId, ChainStore, LockMode, ScanCursor, ScannedChild};
use crate::error::{BulkfreeError, Result};
use crate::freemap::BmapData;
use crate::layout::{
    bmap_index, level1_base, BlockState, Bref, BrefType, VolumeGeometry, BMAP_BLOCKS,
    BREF_FLAG_PFSROOT, FREEMAP_BLOCK_SIZE, FREEMAP_COUNT, FREEMAP_LEVEL0_MASK,
    FREEMAP_LEVEL0_RADIX, FREEMAP_LEVEL1_SIZE, PBUFRADIX, RADIX_MIN, SEGSIZE,
};
use ahash::{AHashMap, AHashSet};
use parking_lot::{Condvar, Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Inode block radix (1KB)
pub const INODE_RADIX: u8 = 10;

/// Indirect block radix (16KB)
pub const INDIRECT_RADIX: u8 = 14;

/// Freemap leaf radix (32KB)
const LEAF_RADIX: u8 = 15;

#[derive(Debug, Default)]
struct LockState {
    shared: usize,
    exclusive: bool,
}

/// Shared/exclusive chain lock that can be held across calls
#[derive(Debug, Default)]
struct NodeLock {
    state: Mutex<LockState>,
    cond: Condvar,
}

impl NodeLock {
    fn acquire(&self, mode: LockMode) {
        let mut state = self.state.lock();
        match mode {
            LockMode::Shared => {
                while state.exclusive {
                    self.cond.wait(&mut state);
                }
                state.shared += 1;
            }
            LockMode::Exclusive => {
                while state.exclusive || state.shared > 0 {
                    self.cond.wait(&mut state);
                }
                state.exclusive = true;
            }
        }
    }

    fn release(&self, mode: LockMode) -> bool {
        let mut state = self.state.lock();
        match mode {
            LockMode::Shared if state.shared > 0 => state.shared -= 1,
            LockMode::Exclusive if state.exclusive => state.exclusive = false,
            _ => return false,
        }
        self.cond.notify_all();
        true
    }

    fn held_exclusive(&self) -> bool {
        self.state.lock().exclusive
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Entry {
    bref: Bref,
    child: Option<ChainId>,
}

#[derive(Debug, Clone)]
struct LeafData {
    bigmask: u32,
    bmdata: Vec<BmapData>,
}

#[derive(Debug)]
enum NodeBody {
    Index(BTreeMap<u64, Entry>),
    Leaf(LeafData),
}

#[derive(Debug)]
struct MemNode {
    bref: Bref,
    label: Option<String>,
    check_failed: AtomicBool,
    refs: AtomicUsize,
    lock: NodeLock,
    body: RwLock<NodeBody>,
}

impl MemNode {
    fn new(bref: Bref, label: Option<String>, body: NodeBody) -> Self {
        MemNode {
            bref,
            label,
            check_failed: AtomicBool::new(false),
            refs: AtomicUsize::new(0),
            lock: NodeLock::default(),
            body: RwLock::new(body),
        }
    }
}

#[derive(Debug, Default)]
struct Injection {
    lookup_failures: AHashSet<u64>,
    modify_failures: AHashSet<u64>,
}

/// Serialized tree entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryImage {
    pub key: u64,
    pub bref: Bref,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child: Option<ChainId>,
}

/// Serialized node contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BodyImage {
    Index { entries: Vec<EntryImage> },
    Leaf { bigmask: u32, bmdata: Vec<BmapData> },
}

/// Serialized chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeImage {
    pub id: ChainId,
    pub bref: Bref,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub check_failed: bool,
    pub body: BodyImage,
}

/// JSON volume image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeImage {
    pub geometry: VolumeGeometry,
    pub volume_root: ChainId,
    pub super_root: ChainId,
    pub nodes: Vec<NodeImage>,
}

/// Block state totals over the allocatable part of the live freemap
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreemapSummary {
    pub segments: u64,
    pub free_blocks: u64,
    pub invalid_blocks: u64,
    pub staged_blocks: u64,
    pub allocated_blocks: u64,
    /// Sum of per-segment `avail`
    pub avail_bytes: u64,
}

/// Shape of a randomly generated tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeShape {
    pub pfs_count: usize,
    pub inodes_per_pfs: usize,
    /// Inodes hung under each indirect block
    pub indirect_fanout: usize,
    pub max_extents_per_inode: usize,
    pub dirents_per_pfs: usize,
    /// Probability that an extent reuses one created earlier
    pub shared_ratio: f64,
    /// Probability that a freshly written extent is unlinked again
    pub orphan_ratio: f64,
}

impl Default for TreeShape {
    fn default() -> Self {
        TreeShape {
            pfs_count: 2,
            inodes_per_pfs: 64,
            indirect_fanout: 16,
            max_extents_per_inode: 4,
            dirents_per_pfs: 16,
            shared_ratio: 0.1,
            orphan_ratio: 0.2,
        }
    }
}

/// What `populate` created
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopulateStats {
    pub inodes: u64,
    pub indirects: u64,
    pub extents: u64,
    pub shared_links: u64,
    pub orphaned: u64,
    pub orphaned_bytes: u64,
}

/// In-memory volume
pub struct MemStore {
    geometry: VolumeGeometry,
    nodes: RwLock<AHashMap<ChainId, Arc<MemNode>>>,
    leaves: RwLock<BTreeMap<u64, ChainId>>,
    volume_root: ChainId,
    super_root: ChainId,
    next_id: AtomicU64,
    outstanding_refs: AtomicI64,
    outstanding_locks: AtomicI64,
    modify_count: AtomicU64,
    injection: Mutex<Injection>,
}

impl MemStore {
    fn validate_geometry(geometry: &VolumeGeometry) -> Result<()> {
        if geometry.total_size < 2 * SEGSIZE {
            return Err(BulkfreeError::InvalidImage(format!(
                "volume of {} bytes is smaller than two segments",
                geometry.total_size
            )));
        }
        if geometry.allocator_beg >= geometry.total_size {
            return Err(BulkfreeError::InvalidImage(format!(
                "allocator_beg {:#x} beyond volume end {:#x}",
                geometry.allocator_beg, geometry.total_size
            )));
        }
        Ok(())
    }

    fn empty(geometry: VolumeGeometry) -> Self {
        MemStore {
            geometry,
            nodes: RwLock::new(AHashMap::new()),
            leaves: RwLock::new(BTreeMap::new()),
            volume_root: ChainId(0),
            super_root: ChainId(0),
            next_id: AtomicU64::new(1),
            outstanding_refs: AtomicI64::new(0),
            outstanding_locks: AtomicI64::new(0),
            modify_count: AtomicU64::new(0),
            injection: Mutex::new(Injection::default()),
        }
    }

    fn insert_node(&self, node: MemNode) -> ChainId {
        let id = ChainId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.nodes.write().insert(id, Arc::new(node));
        id
    }

    fn node(&self, id: ChainId) -> Result<Arc<MemNode>> {
        self.nodes
            .read()
            .get(&id)
            .cloned()
            .ok_or(BulkfreeError::InvalidChain(id.0))
    }

    /// Format an empty volume.
    ///
    /// Creates one freemap leaf per 1GB zone with every reserved segment
    /// preset to allocated, the volume root and the super-root inode.
    pub fn format(geometry: VolumeGeometry) -> Result<Self> {
        Self::validate_geometry(&geometry)?;
        let mut store = Self::empty(geometry);

        for leaf in 0..geometry.leaf_count() {
            let key = leaf * FREEMAP_LEVEL1_SIZE;
            let mut bmdata = Vec::with_capacity(FREEMAP_COUNT);
            let mut bigmask = 0;
            for index in 0..FREEMAP_COUNT {
                let bmap = if geometry.segment_reserved(key + index as u64 * SEGSIZE) {
                    BmapData::reserved()
                } else {
                    BmapData::free_segment()
                };
                bigmask |= bmap.bigmask();
                bmdata.push(bmap);
            }
            let bref = Bref::new(BrefType::FreemapLeaf, key, key + (1 << LEAF_RADIX), LEAF_RADIX);
            let id = store.insert_node(MemNode::new(
                bref,
                None,
                NodeBody::Leaf(LeafData { bigmask, bmdata }),
            ));
            store.leaves.write().insert(key, id);
        }

        store.volume_root = store.insert_node(MemNode::new(
            Bref::without_data(BrefType::Volume, 0),
            Some("volume".to_string()),
            NodeBody::Index(BTreeMap::new()),
        ));
        let sroot = store.allocate(BrefType::Inode, INODE_RADIX)?;
        store.super_root = store.insert_node(MemNode::new(
            sroot,
            Some("super-root".to_string()),
            NodeBody::Index(BTreeMap::new()),
        ));
        store.link_entry(store.volume_root, 0, sroot, Some(store.super_root))?;
        Ok(store)
    }

    pub fn geometry(&self) -> VolumeGeometry {
        self.geometry
    }

    pub fn volume_root(&self) -> ChainId {
        self.volume_root
    }

    pub fn super_root(&self) -> ChainId {
        self.super_root
    }

    fn link_entry(&self, parent: ChainId, key: u64, bref: Bref, child: Option<ChainId>) -> Result<()> {
        let node = self.node(parent)?;
        let mut body = node.body.write();
        match &mut *body {
            NodeBody::Index(entries) => {
                entries.insert(key, Entry { bref, child });
                Ok(())
            }
            NodeBody::Leaf(_) => Err(BulkfreeError::WrongChainKind {
                id: parent.0,
                expected: "index node",
            }),
        }
    }

    fn add_node(
        &self,
        parent: ChainId,
        key: u64,
        btype: BrefType,
        radix: u8,
        flags: u8,
        label: Option<String>,
    ) -> Result<ChainId> {
        let mut bref = self.allocate(btype, radix)?;
        bref.key = key;
        bref.flags = flags;
        let id = self.insert_node(MemNode::new(bref, label, NodeBody::Index(BTreeMap::new())));
        self.link_entry(parent, key, bref, Some(id))?;
        Ok(id)
    }

    fn next_key(&self, parent: ChainId) -> Result<u64> {
        let node = self.node(parent)?;
        let body = node.body.read();
        match &*body {
            NodeBody::Index(entries) => Ok(entries.keys().next_back().map_or(1, |k| k + 1)),
            NodeBody::Leaf(_) => Err(BulkfreeError::WrongChainKind {
                id: parent.0,
                expected: "index node",
            }),
        }
    }

    /// Create a PFS root inode under the super-root
    pub fn add_pfs(&self, name: &str) -> Result<ChainId> {
        let key = self.next_key(self.super_root)?;
        self.add_node(
            self.super_root,
            key,
            BrefType::Inode,
            INODE_RADIX,
            BREF_FLAG_PFSROOT,
            Some(name.to_string()),
        )
    }

    /// PFS roots with their names
    pub fn pfs_roots(&self) -> Vec<(ChainId, String)> {
        let Ok(sroot) = self.node(self.super_root) else {
            return Vec::new();
        };
        let body = sroot.body.read();
        let NodeBody::Index(entries) = &*body else {
            return Vec::new();
        };
        entries
            .values()
            .filter(|e| e.bref.is_pfs_root())
            .filter_map(|e| {
                let id = e.child?;
                let label = self.node(id).ok()?.label.clone().unwrap_or_default();
                Some((id, label))
            })
            .collect()
    }

    pub fn add_inode(&self, parent: ChainId, key: u64) -> Result<ChainId> {
        self.add_node(parent, key, BrefType::Inode, INODE_RADIX, 0, None)
    }

    pub fn add_indirect(&self, parent: ChainId, key: u64) -> Result<ChainId> {
        self.add_node(parent, key, BrefType::Indirect, INDIRECT_RADIX, 0, None)
    }

    /// Allocate a data extent of `1 << radix` bytes and link it
    pub fn add_data(&self, parent: ChainId, key: u64, radix: u8) -> Result<Bref> {
        let mut bref = self.allocate(BrefType::Data, radix)?;
        bref.key = key;
        self.link_entry(parent, key, bref, None)?;
        Ok(bref)
    }

    /// Directory entry embedded in its parent, no media storage
    pub fn add_dirent(&self, parent: ChainId, key: u64) -> Result<()> {
        self.link_entry(parent, key, Bref::without_data(BrefType::Dirent, key), None)
    }

    /// Link an already allocated data extent a second time
    pub fn link_data(&self, parent: ChainId, key: u64, bref: Bref) -> Result<()> {
        self.link_entry(parent, key, Bref { key, ..bref }, None)
    }

    /// Link an existing chain under another parent
    pub fn link_chain(&self, parent: ChainId, key: u64, child: ChainId) -> Result<()> {
        let bref = self.node(child)?.bref;
        self.link_entry(parent, key, Bref { key, ..bref }, Some(child))
    }

    /// Remove an entry. The freemap is left alone; bulkfree reclaims it.
    pub fn unlink(&self, parent: ChainId, key: u64) -> Result<Option<Bref>> {
        let node = self.node(parent)?;
        let mut body = node.body.write();
        match &mut *body {
            NodeBody::Index(entries) => Ok(entries.remove(&key).map(|e| e.bref)),
            NodeBody::Leaf(_) => Err(BulkfreeError::WrongChainKind {
                id: parent.0,
                expected: "index node",
            }),
        }
    }

    /// Live first-fit allocator.
    ///
    /// Only `00` blocks are handed out; staged blocks stay reserved until a
    /// later pass frees them. Extents smaller than a block take a whole
    /// block. Safe to call while a pass is running.
    pub fn allocate(&self, btype: BrefType, radix: u8) -> Result<Bref> {
        if !(RADIX_MIN..=FREEMAP_LEVEL0_RADIX as u8).contains(&radix) {
            return Err(BulkfreeError::InvalidExtent {
                data_off: radix as u64,
                reason: format!("radix {} out of range", radix),
            });
        }
        let bytes = 1u64 << radix;
        let blocks = (bytes / FREEMAP_BLOCK_SIZE).max(1) as usize;
        let class = ((btype as u16) << 8) | PBUFRADIX;

        let leaves: Vec<(u64, ChainId)> = self.leaves.read().iter().map(|(k, v)| (*k, *v)).collect();
        for (key, id) in leaves {
            let node = self.node(id)?;
            node.lock.acquire(LockMode::Exclusive);
            let found = {
                let mut body = node.body.write();
                match &mut *body {
                    NodeBody::Leaf(leaf) => self.claim_run(leaf, key, blocks, class),
                    NodeBody::Index(_) => None,
                }
            };
            node.lock.release(LockMode::Exclusive);
            if let Some(offset) = found {
                return Ok(Bref::new(btype, 0, offset, radix));
            }
        }
        Err(BulkfreeError::OutOfSpace { bytes })
    }

    fn claim_run(&self, leaf: &mut LeafData, key: u64, blocks: usize, class: u16) -> Option<u64> {
        for (index, bmap) in leaf.bmdata.iter_mut().enumerate() {
            let seg_base = key + index as u64 * SEGSIZE;
            if self.geometry.segment_reserved(seg_base)
                || (bmap.avail as u64) < blocks as u64 * FREEMAP_BLOCK_SIZE
            {
                continue;
            }
            let Some(start) = (0..BMAP_BLOCKS)
                .step_by(blocks)
                .find(|&s| (s..s + blocks).all(|b| bmap.state(b) == BlockState::Free))
            else {
                continue;
            };
            for block in start..start + blocks {
                bmap.set_state(block, BlockState::Allocated);
            }
            bmap.avail -= (blocks as u64 * FREEMAP_BLOCK_SIZE) as u32;
            if bmap.class == 0 {
                bmap.class = class;
            }
            let end = ((start + blocks) as u64 * FREEMAP_BLOCK_SIZE) as u32;
            if bmap.linear < end {
                bmap.linear = end;
            }
            return Some(seg_base + start as u64 * FREEMAP_BLOCK_SIZE);
        }
        None
    }

    fn leaf_for(&self, offset: u64) -> Option<Arc<MemNode>> {
        let id = *self.leaves.read().get(&level1_base(offset))?;
        self.node(id).ok()
    }

    /// Live record for the segment covering `offset`
    pub fn live_bmap(&self, offset: u64) -> Option<BmapData> {
        let node = self.leaf_for(offset)?;
        let body = node.body.read();
        match &*body {
            NodeBody::Leaf(leaf) => leaf.bmdata.get(bmap_index(offset)).copied(),
            NodeBody::Index(_) => None,
        }
    }

    /// Live state of the block covering `offset`
    pub fn live_state(&self, offset: u64) -> Option<BlockState> {
        self.live_bmap(offset)
            .map(|bmap| bmap.state_at(offset & FREEMAP_LEVEL0_MASK))
    }

    /// Overwrite one live block state, keeping `avail` consistent
    pub fn set_live_state(&self, offset: u64, state: BlockState) -> Result<()> {
        let node = self
            .leaf_for(offset)
            .ok_or(BulkfreeError::LookupFailed {
                key: level1_base(offset),
                reason: "no freemap leaf".to_string(),
            })?;
        let mut body = node.body.write();
        if let NodeBody::Leaf(leaf) = &mut *body {
            let bmap = &mut leaf.bmdata[bmap_index(offset)];
            let block = ((offset & FREEMAP_LEVEL0_MASK) / FREEMAP_BLOCK_SIZE) as usize;
            bmap.set_state(block, state);
            bmap.avail = bmap.free_bytes() as u32;
        }
        Ok(())
    }

    /// Bigmask of the leaf covering `offset`
    pub fn leaf_bigmask_at(&self, offset: u64) -> Option<u32> {
        let node = self.leaf_for(offset)?;
        let body = node.body.read();
        match &*body {
            NodeBody::Leaf(leaf) => Some(leaf.bigmask),
            NodeBody::Index(_) => None,
        }
    }

    pub fn set_leaf_bigmask(&self, offset: u64, bigmask: u32) {
        if let Some(node) = self.leaf_for(offset) {
            if let NodeBody::Leaf(leaf) = &mut *node.body.write() {
                leaf.bigmask = bigmask;
            }
        }
    }

    /// Block totals across every allocatable segment
    pub fn freemap_summary(&self) -> FreemapSummary {
        let mut summary = FreemapSummary::default();
        let leaves: Vec<(u64, ChainId)> = self.leaves.read().iter().map(|(k, v)| (*k, *v)).collect();
        for (key, id) in leaves {
            let Ok(node) = self.node(id) else { continue };
            let body = node.body.read();
            let NodeBody::Leaf(leaf) = &*body else { continue };
            for (index, bmap) in leaf.bmdata.iter().enumerate() {
                if self.geometry.segment_reserved(key + index as u64 * SEGSIZE) {
                    continue;
                }
                summary.segments += 1;
                summary.free_blocks += bmap.count(BlockState::Free) as u64;
                summary.invalid_blocks += bmap.count(BlockState::Invalid) as u64;
                summary.staged_blocks += bmap.count(BlockState::Staged) as u64;
                summary.allocated_blocks += bmap.count(BlockState::Allocated) as u64;
                summary.avail_bytes += bmap.avail as u64;
            }
        }
        summary
    }

    /// Flag a chain as having failed its integrity check
    pub fn mark_check_failed(&self, id: ChainId) -> Result<()> {
        self.node(id)?.check_failed.store(true, Ordering::Release);
        Ok(())
    }

    /// Make lookups of the leaf covering `offset` fail
    pub fn fail_lookup(&self, offset: u64) {
        self.injection.lock().lookup_failures.insert(level1_base(offset));
    }

    /// Make modify calls on the leaf covering `offset` fail
    pub fn fail_modify(&self, offset: u64) {
        self.injection.lock().modify_failures.insert(level1_base(offset));
    }

    pub fn clear_injections(&self) {
        let mut injection = self.injection.lock();
        injection.lookup_failures.clear();
        injection.modify_failures.clear();
    }

    /// Drop the live leaf covering `offset`
    pub fn remove_freemap_leaf(&self, offset: u64) -> bool {
        let removed = self.leaves.write().remove(&level1_base(offset));
        match removed {
            Some(id) => {
                self.nodes.write().remove(&id);
                true
            }
            None => false,
        }
    }

    /// References handed out and not yet dropped
    pub fn outstanding_refs(&self) -> i64 {
        self.outstanding_refs.load(Ordering::Acquire)
    }

    /// Locks taken through the store interface and not yet released
    pub fn outstanding_locks(&self) -> i64 {
        self.outstanding_locks.load(Ordering::Acquire)
    }

    /// Successful `modify` calls
    pub fn modify_count(&self) -> u64 {
        self.modify_count.load(Ordering::Relaxed)
    }

    /// Fill the volume with a random tree
    pub fn populate(&self, shape: &TreeShape, seed: u64) -> Result<PopulateStats> {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut stats = PopulateStats::default();
        let mut written: Vec<Bref> = Vec::new();

        for p in 0..shape.pfs_count {
            let pfs = self.add_pfs(&format!("pfs{}", p))?;
            let fanout = shape.indirect_fanout.max(1);
            let mut indirect = None;

            for i in 0..shape.inodes_per_pfs {
                if i % fanout == 0 {
                    indirect = Some(self.add_indirect(pfs, (i / fanout) as u64 + 1)?);
                    stats.indirects += 1;
                }
                let parent = indirect.unwrap_or(pfs);
                let inode = self.add_inode(parent, i as u64 + 1)?;
                stats.inodes += 1;

                let extents = rng.gen_range(1..=shape.max_extents_per_inode.max(1));
                for e in 0..extents {
                    let key = e as u64;
                    if !written.is_empty() && rng.gen_bool(shape.shared_ratio.clamp(0.0, 1.0)) {
                        let bref = written[rng.gen_range(0..written.len())];
                        self.link_data(inode, key, bref)?;
                        stats.shared_links += 1;
                        continue;
                    }
                    let radix = rng.gen_range(RADIX_MIN..=16);
                    let bref = self.add_data(inode, key, radix)?;
                    stats.extents += 1;
                    if rng.gen_bool(shape.orphan_ratio.clamp(0.0, 1.0)) {
                        self.unlink(inode, key)?;
                        stats.orphaned += 1;
                        stats.orphaned_bytes += bref.bytes().max(FREEMAP_BLOCK_SIZE);
                    } else {
                        written.push(bref);
                    }
                }
            }

            for d in 0..shape.dirents_per_pfs {
                self.add_dirent(pfs, (1 << 32) + d as u64)?;
            }
        }
        Ok(stats)
    }

    /// Snapshot the whole volume
    pub fn to_image(&self) -> VolumeImage {
        let nodes = self.nodes.read();
        let mut images: Vec<NodeImage> = nodes
            .iter()
            .map(|(id, node)| {
                let body = match &*node.body.read() {
                    NodeBody::Index(entries) => BodyImage::Index {
                        entries: entries
                            .iter()
                            .map(|(key, e)| EntryImage {
                                key: *key,
                                bref: e.bref,
                                child: e.child,
                            })
                            .collect(),
                    },
                    NodeBody::Leaf(leaf) => BodyImage::Leaf {
                        bigmask: leaf.bigmask,
                        bmdata: leaf.bmdata.clone(),
                    },
                };
                NodeImage {
                    id: *id,
                    bref: node.bref,
                    label: node.label.clone(),
                    check_failed: node.check_failed.load(Ordering::Acquire),
                    body,
                }
            })
            .collect();
        images.sort_by_key(|n| n.id);
        VolumeImage {
            geometry: self.geometry,
            volume_root: self.volume_root,
            super_root: self.super_root,
            nodes: images,
        }
    }

    /// Rebuild a volume from an image
    pub fn from_image(image: VolumeImage) -> Result<Self> {
        Self::validate_geometry(&image.geometry)?;
        let mut store = Self::empty(image.geometry);
        let mut max_id = 0;

        for node in image.nodes {
            max_id = max_id.max(node.id.0);
            let body = match node.body {
                BodyImage::Index { entries } => NodeBody::Index(
                    entries
                        .into_iter()
                        .map(|e| {
                            (
                                e.key,
                                Entry {
                                    bref: e.bref,
                                    child: e.child,
                                },
                            )
                        })
                        .collect(),
                ),
                BodyImage::Leaf { bigmask, bmdata } => {
                    if bmdata.len() != FREEMAP_COUNT {
                        return Err(BulkfreeError::InvalidImage(format!(
                            "leaf {} has {} records",
                            node.id, bmdata.len()
                        )));
                    }
                    let key = node.bref.key;
                    if level1_base(key) != key
                        || key >= image.geometry.total_size
                        || key.checked_add(FREEMAP_LEVEL1_SIZE).is_none()
                    {
                        return Err(BulkfreeError::InvalidImage(format!(
                            "leaf {} has bad key {:#x}",
                            node.id, key
                        )));
                    }
                    store.leaves.write().insert(key, node.id);
                    NodeBody::Leaf(LeafData { bigmask, bmdata })
                }
            };
            let mem = MemNode::new(node.bref, node.label, body);
            mem.check_failed.store(node.check_failed, Ordering::Release);
            store.nodes.write().insert(node.id, Arc::new(mem));
        }

        for id in [image.volume_root, image.super_root] {
            if !store.nodes.read().contains_key(&id) {
                return Err(BulkfreeError::InvalidImage(format!("missing root {}", id)));
            }
        }
        store.volume_root = image.volume_root;
        store.super_root = image.super_root;
        store.next_id = AtomicU64::new(max_id + 1);
        Ok(store)
    }

    /// Write the volume as JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let file = std::fs::File::create(path)?;
        serde_json::to_writer(std::io::BufWriter::new(file), &self.to_image())?;
        Ok(())
    }

    /// Read a JSON volume
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let image: VolumeImage = serde_json::from_reader(std::io::BufReader::new(file))?;
        Self::from_image(image)
    }

    fn acquire_ref(&self, node: &MemNode) {
        node.refs.fetch_add(1, Ordering::AcqRel);
        self.outstanding_refs.fetch_add(1, Ordering::AcqRel);
    }
}

impl ChainStore for MemStore {
    fn geometry(&self) -> VolumeGeometry {
        self.geometry
    }

    fn topology_roots(&self) -> Result<Vec<ChainId>> {
        let root = self.node(self.volume_root)?;
        self.acquire_ref(&root);
        Ok(vec![self.volume_root])
    }

    fn chain_ref(&self, id: ChainId) -> Result<()> {
        let node = self.node(id)?;
        self.acquire_ref(&node);
        Ok(())
    }

    fn chain_drop(&self, id: ChainId) {
        // Leaves may have been removed while referenced
        if let Ok(node) = self.node(id) {
            let prev = node.refs.fetch_sub(1, Ordering::AcqRel);
            if prev == 0 {
                node.refs.store(0, Ordering::Release);
                tracing::warn!("Dropping unreferenced {}", id);
                return;
            }
        }
        self.outstanding_refs.fetch_sub(1, Ordering::AcqRel);
    }

    fn lock(&self, id: ChainId, mode: LockMode) -> Result<()> {
        let node = self.node(id)?;
        node.lock.acquire(mode);
        self.outstanding_locks.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn unlock(&self, id: ChainId, mode: LockMode) {
        match self.node(id) {
            Ok(node) if node.lock.release(mode) => {
                self.outstanding_locks.fetch_sub(1, Ordering::AcqRel);
            }
            _ => tracing::warn!("Unbalanced {:?} unlock of {}", mode, id),
        }
    }

    fn bref(&self, id: ChainId) -> Result<Bref> {
        Ok(self.node(id)?.bref)
    }

    fn check_failed(&self, id: ChainId) -> bool {
        self.node(id)
            .map(|node| node.check_failed.load(Ordering::Acquire))
            .unwrap_or(true)
    }

    fn scan_child(&self, parent: ChainId, cursor: &mut ScanCursor) -> Result<Option<ScannedChild>> {
        let Some(from) = cursor.next_key() else {
            return Ok(None);
        };
        let node = self.node(parent)?;
        let entry = {
            let body = node.body.read();
            match &*body {
                NodeBody::Index(entries) => entries.range(from..).next().map(|(k, e)| (*k, *e)),
                NodeBody::Leaf(_) => None,
            }
        };
        let Some((key, entry)) = entry else {
            cursor.finish();
            return Ok(None);
        };
        cursor.advance_past(key);

        let chain = match entry.child {
            Some(id) => {
                let child = self.node(id)?;
                self.acquire_ref(&child);
                Some(id)
            }
            None => None,
        };
        Ok(Some(ScannedChild {
            bref: entry.bref,
            chain,
        }))
    }

    fn lookup_freemap_leaf(&self, key: u64) -> Result<Option<ChainId>> {
        if self.injection.lock().lookup_failures.contains(&key) {
            return Err(BulkfreeError::LookupFailed {
                key,
                reason: "injected lookup failure".to_string(),
            });
        }
        let Some(id) = self.leaves.read().get(&key).copied() else {
            return Ok(None);
        };
        self.chain_ref(id)?;
        Ok(Some(id))
    }

    fn modify(&self, id: ChainId) -> Result<()> {
        let node = self.node(id)?;
        if self.injection.lock().modify_failures.contains(&node.bref.key) {
            return Err(BulkfreeError::ModifyFailed {
                id: id.0,
                reason: "injected modify failure".to_string(),
            });
        }
        if !node.lock.held_exclusive() {
            return Err(BulkfreeError::NotLockedExclusive(id.0));
        }
        self.modify_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn read_bmap(&self, leaf: ChainId, index: usize) -> Result<BmapData> {
        let node = self.node(leaf)?;
        let body = node.body.read();
        match &*body {
            NodeBody::Leaf(data) => data
                .bmdata
                .get(index)
                .copied()
                .ok_or(BulkfreeError::BmapIndexOutOfRange { index }),
            NodeBody::Index(_) => Err(BulkfreeError::WrongChainKind {
                id: leaf.0,
                expected: "freemap leaf",
            }),
        }
    }

    fn leaf_bigmask(&self, leaf: ChainId) -> Result<u32> {
        let node = self.node(leaf)?;
        let body = node.body.read();
        match &*body {
            NodeBody::Leaf(data) => Ok(data.bigmask),
            NodeBody::Index(_) => Err(BulkfreeError::WrongChainKind {
                id: leaf.0,
                expected: "freemap leaf",
            }),
        }
    }

    fn write_bmap(&self, leaf: ChainId, index: usize, bmap: &BmapData, bigmask: u32) -> Result<()> {
        let node = self.node(leaf)?;
        if !node.lock.held_exclusive() {
            return Err(BulkfreeError::NotLockedExclusive(leaf.0));
        }
        let mut body = node.body.write();
        match &mut *body {
            NodeBody::Leaf(data) => {
                let slot = data
                    .bmdata
                    .get_mut(index)
                    .ok_or(BulkfreeError::BmapIndexOutOfRange { index })?;
                *slot = *bmap;
                data.bigmask = bigmask;
                Ok(())
            }
            NodeBody::Index(_) => Err(BulkfreeError::WrongChainKind {
                id: leaf.0,
                expected: "freemap leaf",
            }),
        }
    }
}
