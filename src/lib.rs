//! # hammer2-bulkfree - Bulk Free-Space Reclamation
//!
//! `hammer2-bulkfree` scans the live block-reference tree of a mounted
//! copy-on-write filesystem and returns unreferenced blocks to the freemap
//! while other threads keep allocating. It features:
//!
//! - **Windowed scanning** bounded by a fixed accumulator buffer
//! - **Deduplicated traversal** through a set-associative visitation cache
//! - **Bounded recursion** with a depth-first ordered deferral queue
//! - **Two-stage reconciliation**: blocks are staged by one pass and only
//!   freed by a later pass that still finds them unreferenced
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use hammer2_bulkfree::{Bulkfree, BulkfreeConfig, MemStore, Result, VolumeGeometry};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<()> {
//! // Format an in-memory 4GB volume
//! let store = Arc::new(MemStore::format(VolumeGeometry::new(0, 4 << 30))?);
//! let pfs = store.add_pfs("root")?;
//! let inode = store.add_inode(pfs, 1)?;
//! store.add_data(inode, 0, 16)?;
//!
//! let engine = Bulkfree::new(store, BulkfreeConfig::default())?;
//!
//! // The first pass stages unreferenced blocks, the second frees them
//! engine.run_one_pass(0, 0)?;
//! let report = engine.run_one_pass(0, 0)?;
//! println!("{}", report);
//! # Ok(())
//! # }
//! ```
//!
//! ## Custom Stores
//!
//! The engine runs against any [`ChainStore`]. Locks and references taken
//! through the trait are always released, including on abort.

pub mod accumulator;
pub mod cancel;
pub mod chain;
pub mod config;
pub mod dedup;
pub mod error;
pub mod freemap;
pub mod layout;
pub mod memstore;
pub mod pass;
pub mod scan;
pub mod sync;
pub mod throttle;
pub mod worker;

pub use accumulator::{AccumulatorStats, BmapAccumulator, RecordOutcome};
pub use cancel::CancelToken;
pub use chain::{ChainId, ChainLock, ChainRef, ChainStore, LockMode, ScanCursor, ScannedChild};
pub use config::BulkfreeConfig;
pub use dedup::{VisitCache, VisitCacheStats};
pub use error::{BulkfreeError, Result, ScanError};
pub use freemap::BmapData;
pub use layout::{BlockState, Bref, BrefType, VolumeGeometry};
pub use memstore::{FreemapSummary, MemStore, PopulateStats, TreeShape, VolumeImage};
pub use pass::{Bulkfree, PassReport};
pub use scan::{DeferralPolicy, ScanContext, ScanStats};
pub use sync::{reconcile, sync_adjust, SyncStats, Transition, TransitionCounters};
pub use worker::BulkfreeWorker;
