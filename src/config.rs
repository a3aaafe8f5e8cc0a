//! Bulkfree tuning knobs
//!
//! Loaded from TOML or built in code. Every limit the scanner and the
//! pass driver consult lives here so nothing is process-global.

use crate::error::Result;
use crate::layout::{FREEMAP_LEVELN_PSIZE, FREEMAP_SIZEDIV};
use crate::scan::DeferralPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use validator::{Validate, ValidationError, ValidationErrors};

/// Default accumulator budget (8MB, roughly 256GB of storage per window)
pub const DEFAULT_BUFFER_BYTES: u64 = 8 * 1024 * 1024;

/// Minimum accumulator size before alignment
pub const DEFAULT_MIN_BUFFER_BYTES: u64 = 1024 * 1024;

pub const DEFAULT_MAX_DEPTH: u32 = 16;
pub const DEFAULT_SAVED_DEPTH: u32 = 0;
pub const DEFAULT_MAX_DEFERRED: usize = 40960;
pub const DEFAULT_RATE_LIMIT_TPS: u32 = 5000;
pub const DEFAULT_VISIT_CACHE_ENTRIES: usize = 262_144;

/// Bulkfree configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BulkfreeConfig {
    /// Accumulator budget used when a pass is started with a zero budget
    #[validate(range(min = 1))]
    pub buffer_bytes: u64,

    /// Floor applied to the accumulator budget
    #[validate(range(min = 32768))]
    pub min_buffer_bytes: u64,

    /// Physical memory available; the buffer is capped at a quarter of it
    pub memory_limit_bytes: Option<u64>,

    /// Recursion depth beyond which subtrees are deferred
    #[validate(range(min = 1, max = 4096))]
    pub max_depth: u32,

    /// Depth above which the deferred-count ceiling starts to apply
    pub saved_depth: u32,

    /// Soft ceiling on queued deferred subtrees
    #[validate(range(min = 4))]
    pub max_deferred: usize,

    /// Non-leaf extents scanned per second, 0 disables throttling
    pub rate_limit_tps: u32,

    /// Visitation cache entries (power of two, at least one bucket)
    #[validate(range(min = 8))]
    pub visit_cache_entries: usize,

    /// Emit periodic progress lines while scanning
    pub progress: bool,
}

impl Default for BulkfreeConfig {
    fn default() -> Self {
        BulkfreeConfig {
            buffer_bytes: DEFAULT_BUFFER_BYTES,
            min_buffer_bytes: DEFAULT_MIN_BUFFER_BYTES,
            memory_limit_bytes: None,
            max_depth: DEFAULT_MAX_DEPTH,
            saved_depth: DEFAULT_SAVED_DEPTH,
            max_deferred: DEFAULT_MAX_DEFERRED,
            rate_limit_tps: DEFAULT_RATE_LIMIT_TPS,
            visit_cache_entries: DEFAULT_VISIT_CACHE_ENTRIES,
            progress: true,
        }
    }
}

impl BulkfreeConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: BulkfreeConfig = toml::from_str(text)?;
        config.check()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Field ranges plus the constraints that span fields
    pub fn check(&self) -> Result<()> {
        self.validate()?;

        let mut errors = ValidationErrors::new();
        if !self.visit_cache_entries.is_power_of_two() {
            errors.add("visit_cache_entries", ValidationError::new("power_of_two"));
        }
        if self.saved_depth > self.max_depth {
            errors.add("saved_depth", ValidationError::new("exceeds_max_depth"));
        }
        if let Some(limit) = self.memory_limit_bytes {
            if limit / 4 < FREEMAP_LEVELN_PSIZE as u64 {
                errors.add("memory_limit_bytes", ValidationError::new("below_one_leaf"));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.into())
        }
    }

    /// Deferral thresholds for the topology scanner
    pub fn deferral_policy(&self) -> DeferralPolicy {
        DeferralPolicy {
            max_depth: self.max_depth,
            saved_depth: self.saved_depth,
            max_deferred: self.max_deferred,
        }
    }

    /// Accumulator size in bytes for a pass over `total_size` bytes.
    ///
    /// A zero `budget` selects `buffer_bytes`. The result is always a
    /// multiple of one leaf (32KB, describing 1GB of storage). The memory
    /// cap wins over `min_buffer_bytes`.
    pub fn buffer_size(&self, budget: u64, total_size: u64) -> u64 {
        let align = FREEMAP_LEVELN_PSIZE as u64;
        let requested = if budget == 0 { self.buffer_bytes } else { budget };
        let mut size = requested.div_ceil(align) * align;

        if size > total_size / FREEMAP_SIZEDIV {
            size = total_size.div_ceil(FREEMAP_SIZEDIV);
        }
        if size < self.min_buffer_bytes {
            size = self.min_buffer_bytes;
        }
        size = size.div_ceil(align) * align;

        if let Some(limit) = self.memory_limit_bytes {
            let cap = (limit / 4 / align * align).max(align);
            if size > cap {
                size = cap;
                tracing::warn!("Capping bulkfree buffer at {}K", size / 1024);
            }
        }
        size
    }

    pub fn with_buffer_bytes(mut self, bytes: u64) -> Self {
        self.buffer_bytes = bytes;
        self
    }

    pub fn with_min_buffer_bytes(mut self, bytes: u64) -> Self {
        self.min_buffer_bytes = bytes;
        self
    }

    pub fn with_memory_limit(mut self, bytes: u64) -> Self {
        self.memory_limit_bytes = Some(bytes);
        self
    }

    pub fn with_max_depth(mut self, depth: u32) -> Self {
        self.max_depth = depth;
        self
    }

    pub fn with_max_deferred(mut self, count: usize) -> Self {
        self.max_deferred = count;
        self
    }

    pub fn with_rate_limit(mut self, tps: u32) -> Self {
        self.rate_limit_tps = tps;
        self
    }

    pub fn with_visit_cache_entries(mut self, entries: usize) -> Self {
        self.visit_cache_entries = entries;
        self
    }

    pub fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }
}
