//! Chain store collaborator contract and RAII handles
//!
//! The engine never owns tree nodes. It borrows them from a [`ChainStore`]
//! through reference-counted handles, and every reference or lock it takes
//! is wrapped in a guard that gives it back on drop. Error paths and aborts
//! therefore release exactly what they acquired.

use crate::error::Result;
use crate::freemap::BmapData;
use crate::layout::{Bref, VolumeGeometry};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque handle naming one in-memory chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChainId(pub u64);

impl fmt::Display for ChainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "chain#{}", self.0)
    }
}

/// Lock acquisition mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Key-ordered position within a parent's entries.
///
/// Stores advance the cursor past each returned entry, so a scan can drop
/// the parent lock, recurse, relock and continue where it left off even if
/// the parent changed in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanCursor {
    next_key: u64,
    done: bool,
}

impl Default for ScanCursor {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanCursor {
    pub fn new() -> Self {
        ScanCursor {
            next_key: 0,
            done: false,
        }
    }

    /// Lowest key still to be returned, `None` once the key space is exhausted
    pub fn next_key(&self) -> Option<u64> {
        if self.done {
            None
        } else {
            Some(self.next_key)
        }
    }

    /// Move past an entry with key `key`
    pub fn advance_past(&mut self, key: u64) {
        match key.checked_add(1) {
            Some(next) => self.next_key = next,
            None => self.done = true,
        }
    }

    pub fn finish(&mut self) {
        self.done = true;
    }
}

/// One entry returned by [`ChainStore::scan_child`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScannedChild {
    /// Block reference as stored in the parent
    pub bref: Bref,
    /// Referenced child chain, always present for recursable entries
    pub chain: Option<ChainId>,
}

/// Storage collaborator the bulkfree engine runs against
///
/// Handles returned by `topology_roots`, `scan_child` and
/// `lookup_freemap_leaf` carry one reference owned by the caller.
pub trait ChainStore: Send + Sync {
    /// Volume size and first allocatable offset
    fn geometry(&self) -> VolumeGeometry;

    /// Referenced top-level roots to scan (normally the volume root)
    fn topology_roots(&self) -> Result<Vec<ChainId>>;

    fn chain_ref(&self, id: ChainId) -> Result<()>;

    fn chain_drop(&self, id: ChainId);

    fn lock(&self, id: ChainId, mode: LockMode) -> Result<()>;

    fn unlock(&self, id: ChainId, mode: LockMode);

    /// Block reference describing the chain itself
    fn bref(&self, id: ChainId) -> Result<Bref>;

    /// Whether the chain's integrity check failed
    fn check_failed(&self, id: ChainId) -> bool;

    /// Next entry of `parent` at or after the cursor, advancing it
    fn scan_child(&self, parent: ChainId, cursor: &mut ScanCursor) -> Result<Option<ScannedChild>>;

    /// Live freemap leaf covering the 1GB range starting at `key`
    fn lookup_freemap_leaf(&self, key: u64) -> Result<Option<ChainId>>;

    /// Mark a chain dirty ahead of an in-place update
    fn modify(&self, id: ChainId) -> Result<()>;

    /// Level-0 record `index` of a freemap leaf
    fn read_bmap(&self, leaf: ChainId, index: usize) -> Result<BmapData>;

    /// Size-class summary advertised by a freemap leaf
    fn leaf_bigmask(&self, leaf: ChainId) -> Result<u32>;

    /// Replace record `index` and the leaf's bigmask; requires the
    /// exclusive lock
    fn write_bmap(&self, leaf: ChainId, index: usize, bmap: &BmapData, bigmask: u32) -> Result<()>;
}

/// Owned reference to a chain, dropped with the handle
pub struct ChainRef<'s, S: ChainStore + ?Sized> {
    store: &'s S,
    id: ChainId,
}

impl<'s, S: ChainStore + ?Sized> ChainRef<'s, S> {
    /// Take ownership of a reference the store already handed out
    pub fn adopt(store: &'s S, id: ChainId) -> Self {
        ChainRef { store, id }
    }

    /// Acquire a new reference
    pub fn acquire(store: &'s S, id: ChainId) -> Result<Self> {
        store.chain_ref(id)?;
        Ok(ChainRef { store, id })
    }

    pub fn id(&self) -> ChainId {
        self.id
    }

    pub fn store(&self) -> &'s S {
        self.store
    }

    /// Second reference to the same chain
    pub fn clone_ref(&self) -> Result<Self> {
        Self::acquire(self.store, self.id)
    }

    pub fn lock(&self, mode: LockMode) -> Result<ChainLock<'s, S>> {
        self.store.lock(self.id, mode)?;
        Ok(ChainLock {
            store: self.store,
            id: self.id,
            mode,
        })
    }
}

impl<S: ChainStore + ?Sized> Drop for ChainRef<'_, S> {
    fn drop(&mut self) {
        self.store.chain_drop(self.id);
    }
}

impl<S: ChainStore + ?Sized> fmt::Debug for ChainRef<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ChainRef").field(&self.id).finish()
    }
}

/// Held lock on a chain, released on drop
pub struct ChainLock<'s, S: ChainStore + ?Sized> {
    store: &'s S,
    id: ChainId,
    mode: LockMode,
}

impl<S: ChainStore + ?Sized> ChainLock<'_, S> {
    pub fn id(&self) -> ChainId {
        self.id
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl<S: ChainStore + ?Sized> Drop for ChainLock<'_, S> {
    fn drop(&mut self) {
        self.store.unlock(self.id, self.mode);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{BrefType, VolumeGeometry, FREEMAP_LEVEL1_SIZE};
    use crate::memstore::MemStore;

    #[test]
    fn test_cursor_advances_and_finishes() {
        let mut cursor = ScanCursor::new();
        assert_eq!(cursor.next_key(), Some(0));
        cursor.advance_past(41);
        assert_eq!(cursor.next_key(), Some(42));
        cursor.advance_past(u64::MAX);
        assert_eq!(cursor.next_key(), None);
    }

    #[test]
    fn test_guards_release_on_drop() {
        let store = MemStore::format(VolumeGeometry::new(0, 2 * FREEMAP_LEVEL1_SIZE)).unwrap();
        let pfs = store.add_pfs("data").unwrap();
        let inode = store.add_inode(pfs, 1).unwrap();
        let base_refs = store.outstanding_refs();

        {
            let chain = ChainRef::acquire(&store, inode).unwrap();
            let second = chain.clone_ref().unwrap();
            assert_eq!(store.outstanding_refs(), base_refs + 2);
            let _guard = second.lock(LockMode::Shared).unwrap();
            assert_eq!(store.outstanding_locks(), 1);
            assert_eq!(chain.store().bref(chain.id()).unwrap().btype, BrefType::Inode);
        }

        assert_eq!(store.outstanding_refs(), base_refs);
        assert_eq!(store.outstanding_locks(), 0);
    }
}
