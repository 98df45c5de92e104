//! Allocator configuration
//!
//! Format-time parameters (block size, header blocks) are persisted in the
//! space header; the rest are load-time tunables. All of them can be read
//! from a TOML file:
//!
//! ```toml
//! block_size = 4096
//! header_blocks = 1
//! large_threshold_mb = 64
//! size_classes = 6
//! aggregation_interval_secs = 10
//! max_vector_extents = 0
//! ```

use crate::error::{Result, VeaError};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Default block size in bytes
pub const DEFAULT_BLOCK_SIZE: u32 = 4096;

/// Large extent threshold in MiB
pub const LARGE_EXT_MB: u32 = 64;

/// Seconds a freed extent sits in the aggregation buffer before migration
pub const MIGRATE_INTERVAL_SECS: u64 = 10;

/// Number of size-classed LRUs for small extents
pub const DEFAULT_SIZE_CLASSES: u32 = 6;

/// No cap on the pieces of an extent vector
pub const DEFAULT_MAX_VECTOR_EXTENTS: u32 = 0;

const MAX_BLOCK_SIZE: u32 = 1 << 20;
const MAX_SIZE_CLASSES: u32 = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VeaConfig {
    /// Block size in bytes, a multiple of 4KB
    pub block_size: u32,

    /// Blocks reserved at the start of the space for the caller's header
    pub header_blocks: u32,

    /// Extents at or above this size (in MiB) are tracked in the max-heap
    pub large_threshold_mb: u32,

    /// Number of size classes for small extents
    pub size_classes: u32,

    /// Minimum age before an aggregated extent is migrated
    pub aggregation_interval_secs: u64,

    /// Upper bound on pieces in one extent vector, 0 for none
    pub max_vector_extents: u32,
}

impl Default for VeaConfig {
    fn default() -> Self {
        VeaConfig {
            block_size: DEFAULT_BLOCK_SIZE,
            header_blocks: 1,
            large_threshold_mb: LARGE_EXT_MB,
            size_classes: DEFAULT_SIZE_CLASSES,
            aggregation_interval_secs: MIGRATE_INTERVAL_SECS,
            max_vector_extents: DEFAULT_MAX_VECTOR_EXTENTS,
        }
    }
}

impl VeaConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: VeaConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML config file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0
            || self.block_size % DEFAULT_BLOCK_SIZE != 0
            || self.block_size > MAX_BLOCK_SIZE
        {
            return Err(VeaError::Config(format!(
                "block_size {} must be a non-zero multiple of {} and at most {}",
                self.block_size, DEFAULT_BLOCK_SIZE, MAX_BLOCK_SIZE
            )));
        }

        if self.header_blocks == 0 {
            return Err(VeaError::Config("header_blocks must be at least 1".into()));
        }

        if self.size_classes == 0 || self.size_classes > MAX_SIZE_CLASSES {
            return Err(VeaError::Config(format!(
                "size_classes must be within 1..={}",
                MAX_SIZE_CLASSES
            )));
        }

        if self.large_threshold_mb == 0 {
            return Err(VeaError::Config(
                "large_threshold_mb must be at least 1".into(),
            ));
        }

        if self.large_threshold_blocks(self.block_size) < 2 {
            return Err(VeaError::Config(format!(
                "large threshold of {}MB is smaller than two {} byte blocks",
                self.large_threshold_mb, self.block_size
            )));
        }

        if self.max_vector_extents == 1 {
            return Err(VeaError::Config(
                "max_vector_extents must be 0 or at least 2".into(),
            ));
        }

        Ok(())
    }

    /// Large extent threshold converted to blocks of `block_size` bytes
    pub fn large_threshold_blocks(&self, block_size: u32) -> u32 {
        let bytes = u64::from(self.large_threshold_mb) << 20;
        let blocks = bytes / u64::from(block_size.max(1));
        blocks.min(u64::from(u32::MAX)) as u32
    }
}
