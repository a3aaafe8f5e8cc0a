//! Error types for bulkfree operations

use std::fmt;
use std::ops::{BitOr, BitOrAssign};
use thiserror::Error;

/// Bulkfree operation result type
pub type Result<T> = std::result::Result<T, BulkfreeError>;

/// Hard errors surfaced by the engine, the configuration layer and the
/// chain store collaborators.
#[derive(Error, Debug)]
pub enum BulkfreeError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON image (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML configuration could not be parsed
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Configuration failed validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] validator::ValidationErrors),

    /// Handle does not name a live chain
    #[error("Invalid chain handle: {0}")]
    InvalidChain(u64),

    /// Operation needs a different kind of node
    #[error("Chain {id} is not a {expected}")]
    WrongChainKind { id: u64, expected: &'static str },

    /// Freemap mutation attempted without the exclusive lock
    #[error("Chain {0} is not locked exclusively")]
    NotLockedExclusive(u64),

    /// Unlock without a matching lock
    #[error("Chain {0} is not locked")]
    NotLocked(u64),

    /// Freemap leaf lookup failed
    #[error("Freemap lookup failed near {key:#018x}: {reason}")]
    LookupFailed { key: u64, reason: String },

    /// Marking a node dirty failed
    #[error("Modify failed for chain {id}: {reason}")]
    ModifyFailed { id: u64, reason: String },

    /// Bitmap record index outside of the leaf
    #[error("Bitmap record index {index} out of range")]
    BmapIndexOutOfRange { index: usize },

    /// Extent does not fit the volume
    #[error("Invalid extent {data_off:#018x}: {reason}")]
    InvalidExtent { data_off: u64, reason: String },

    /// Allocator found no free run large enough
    #[error("Out of space allocating {bytes} bytes")]
    OutOfSpace { bytes: u64 },

    /// Volume image is malformed
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    /// Another pass holds the bulkfree lock
    #[error("Bulkfree pass already in progress")]
    PassInProgress,

    /// Background worker is gone
    #[error("Bulkfree worker has stopped")]
    WorkerStopped,
}

/// Cumulative scan outcome flags.
///
/// Flags are OR-ed up the recursion so a caller can tell whether any part
/// of a window ran into trouble even though traversal keeps going.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct ScanError(u32);

impl ScanError {
    /// Integrity check failed on a node; its subtree was not traversed
    pub const CHECK: ScanError = ScanError(0x0001);
    /// External cancellation
    pub const ABORTED: ScanError = ScanError(0x0002);
    /// Storage collaborator failed while enumerating or locking
    pub const IO: ScanError = ScanError(0x0004);

    /// No error
    pub const fn empty() -> Self {
        ScanError(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        ScanError(bits & 0x0007)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: ScanError) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    /// Anything besides a check failure stops the window.
    pub const fn is_hard(self) -> bool {
        self.0 & !Self::CHECK.0 != 0
    }
}

impl BitOr for ScanError {
    type Output = ScanError;

    fn bitor(self, rhs: ScanError) -> ScanError {
        ScanError(self.0 | rhs.0)
    }
}

impl BitOrAssign for ScanError {
    fn bitor_assign(&mut self, rhs: ScanError) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "ok");
        }
        let mut names = Vec::new();
        if self.contains(Self::CHECK) {
            names.push("check");
        }
        if self.contains(Self::ABORTED) {
            names.push("aborted");
        }
        if self.contains(Self::IO) {
            names.push("io");
        }
        write!(f, "{} ({:#06x})", names.join("|"), self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_error_accumulates() {
        let mut err = ScanError::empty();
        assert!(err.is_empty());
        assert!(!err.is_hard());

        err |= ScanError::CHECK;
        assert!(err.contains(ScanError::CHECK));
        assert!(!err.is_hard());

        err |= ScanError::ABORTED;
        assert!(err.is_hard());
        assert!(err.contains(ScanError::CHECK));
        assert_eq!(err.bits(), 0x3);
    }

    #[test]
    fn test_scan_error_display() {
        assert_eq!(ScanError::empty().to_string(), "ok");
        assert_eq!(
            (ScanError::CHECK | ScanError::IO).to_string(),
            "check|io (0x0005)"
        );
    }

    #[test]
    fn test_from_bits_masks_unknown() {
        assert_eq!(ScanError::from_bits(0xFF01), ScanError::CHECK);
    }
}
