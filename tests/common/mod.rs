//! Shared fixtures for integration tests

#![allow(dead_code)]

use hammer2_bulkfree::chain::{ChainId, ChainStore, LockMode, ScanCursor, ScannedChild};
use hammer2_bulkfree::layout::FREEMAP_BLOCK_SIZE;
use hammer2_bulkfree::memstore::BodyImage;
use hammer2_bulkfree::{
    BlockState, BmapData, Bref, BrefType, Bulkfree, BulkfreeConfig, MemStore, Result,
    VolumeGeometry,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const MB: u64 = 1024 * 1024;
pub const GB: u64 = 1024 * MB;

/// Config with throttling and progress output off and one-leaf windows allowed
pub fn test_config() -> BulkfreeConfig {
    BulkfreeConfig::default()
        .with_rate_limit(0)
        .with_progress(false)
        .with_min_buffer_bytes(32768)
}

/// Freshly formatted volume of `gb` gigabytes, allocator starting at 8MB
pub fn volume(gb: u64) -> Arc<MemStore> {
    Arc::new(MemStore::format(VolumeGeometry::new(8 * MB, gb * GB)).unwrap())
}

pub fn engine<S: ChainStore + ?Sized>(store: Arc<S>, config: BulkfreeConfig) -> Bulkfree<S> {
    Bulkfree::new(store, config).unwrap()
}

type Hook = Box<dyn FnMut(u64) + Send>;

/// Store wrapper that runs a hook on every `scan_child` call
pub struct Interposer {
    pub inner: Arc<MemStore>,
    calls: AtomicU64,
    hook: Mutex<Option<Hook>>,
}

impl Interposer {
    pub fn new(inner: Arc<MemStore>) -> Self {
        Interposer {
            inner,
            calls: AtomicU64::new(0),
            hook: Mutex::new(None),
        }
    }

    /// Install a hook called with the running `scan_child` count
    pub fn set_hook(&self, hook: impl FnMut(u64) + Send + 'static) {
        *self.hook.lock() = Some(Box::new(hook));
    }

    pub fn clear_hook(&self) {
        *self.hook.lock() = None;
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn reset_calls(&self) {
        self.calls.store(0, Ordering::SeqCst);
    }
}

impl ChainStore for Interposer {
    fn geometry(&self) -> VolumeGeometry {
        self.inner.geometry()
    }

    fn topology_roots(&self) -> Result<Vec<ChainId>> {
        self.inner.topology_roots()
    }

    fn chain_ref(&self, id: ChainId) -> Result<()> {
        self.inner.chain_ref(id)
    }

    fn chain_drop(&self, id: ChainId) {
        self.inner.chain_drop(id)
    }

    fn lock(&self, id: ChainId, mode: LockMode) -> Result<()> {
        self.inner.lock(id, mode)
    }

    fn unlock(&self, id: ChainId, mode: LockMode) {
        self.inner.unlock(id, mode)
    }

    fn bref(&self, id: ChainId) -> Result<Bref> {
        self.inner.bref(id)
    }

    fn check_failed(&self, id: ChainId) -> bool {
        self.inner.check_failed(id)
    }

    fn scan_child(&self, parent: ChainId, cursor: &mut ScanCursor) -> Result<Option<ScannedChild>> {
        let count = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(hook) = self.hook.lock().as_mut() {
            hook(count);
        }
        self.inner.scan_child(parent, cursor)
    }

    fn lookup_freemap_leaf(&self, key: u64) -> Result<Option<ChainId>> {
        self.inner.lookup_freemap_leaf(key)
    }

    fn modify(&self, id: ChainId) -> Result<()> {
        self.inner.modify(id)
    }

    fn read_bmap(&self, leaf: ChainId, index: usize) -> Result<BmapData> {
        self.inner.read_bmap(leaf, index)
    }

    fn leaf_bigmask(&self, leaf: ChainId) -> Result<u32> {
        self.inner.leaf_bigmask(leaf)
    }

    fn write_bmap(&self, leaf: ChainId, index: usize, bmap: &BmapData, bigmask: u32) -> Result<()> {
        self.inner.write_bmap(leaf, index, bmap, bigmask)
    }
}

/// Mark the blocks of an extent allocated in the live freemap without going
/// through the allocator, for placing data in a specific zone
pub fn place(store: &MemStore, offset: u64, radix: u8) -> Bref {
    let bytes = (1u64 << radix).max(FREEMAP_BLOCK_SIZE);
    for off in (offset..offset + bytes).step_by(FREEMAP_BLOCK_SIZE as usize) {
        store.set_live_state(off, BlockState::Allocated).unwrap();
    }
    Bref::new(BrefType::Data, 0, offset, radix)
}

/// Live state of every block an extent covers
pub fn extent_states(store: &MemStore, bref: &Bref) -> Vec<BlockState> {
    let bytes = bref.bytes().max(FREEMAP_BLOCK_SIZE);
    (bref.offset()..bref.offset() + bytes)
        .step_by(FREEMAP_BLOCK_SIZE as usize)
        .map(|off| store.live_state(off).unwrap())
        .collect()
}

/// Live bitmaps of every segment, in leaf order
pub fn bitmaps(store: &MemStore) -> Vec<[u64; 8]> {
    store
        .to_image()
        .nodes
        .into_iter()
        .filter_map(|node| match node.body {
            BodyImage::Leaf { bmdata, .. } => Some(bmdata),
            BodyImage::Index { .. } => None,
        })
        .flatten()
        .map(|bmap| bmap.bitmapq)
        .collect()
}
