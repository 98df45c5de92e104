//! # vea-rs - Versioned Extent Allocator
//!
//! Free-space management for a block-addressable persistent pool:
//!
//! - **Persistent free-extent table** updated only inside transactions, so a
//!   crash never loses or double-grants space
//! - **Size-aware in-memory indices**: a max-heap of large extents and
//!   size-classed LRUs of small ones
//! - **Reserve / publish / cancel**: reservations are held in memory until
//!   a transaction makes them durable
//! - **Locality hints** per I/O stream
//! - **Delayed coalescing** of freed ranges on a timer
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use vea_rs::{Result, VeaBuilder};
//!
//! # fn main() -> Result<()> {
//! // Format a 1 GiB space (4 KiB blocks) in a pool image file
//! let mut vea = VeaBuilder::new()
//!     .path("/data/pool.img")
//!     .format(262_144)
//!     .build()?;
//!
//! // Reserve near stream 1's previous allocation, then make it durable
//! let mut resrv = [vea.reserve(256, Some(1))?];
//! vea.publish(&mut resrv)?;
//!
//! // Give it back later
//! vea.free(resrv[0].offset(), 256)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Transactions
//!
//! ```rust,no_run
//! use vea_rs::{Result, VeaBuilder};
//!
//! # fn main() -> Result<()> {
//! let mut vea = VeaBuilder::new().format(4096).build()?;
//!
//! let mut a = [vea.reserve(16, None)?];
//! vea.transaction(|vea| {
//!     vea.tx_publish(&mut a)?;
//!     vea.tx_free(2000, 8)
//! })?;
//! # Ok(())
//! # }
//! ```

pub mod core;

// Re-export core modules internally so crate:: paths in core still work
#[allow(unused_imports)]
pub(crate) use crate::core::{clock, config, error, extent, format, pool, space};

pub use crate::core::{
    clock::{Clock, ManualClock, MonotonicClock},
    config::VeaConfig,
    error::{Result, VeaError},
    extent::{ExtentVector, FreeExtent, AGE_IDLE},
    format::{SpaceDf, VEA_MAGIC},
    pool::{HintRecord, Pool},
    space::{
        hint::{HintContext, HINT_OFF_INVALID},
        query::{Attributes, Stats},
        reserve::{Grant, Reservation, ReservationState},
        SpaceInfo, UnmapFn, FREE_GEN_AGE, FREE_NO_MERGE,
    },
};

use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Allocator shared between threads
///
/// The allocator itself is single-writer; callers serialize through the lock.
pub type SharedVea = Arc<Mutex<SpaceInfo>>;

/// Builder for opening or formatting an allocator space
///
/// # Examples
///
/// ```rust,no_run
/// use vea_rs::VeaBuilder;
///
/// # fn main() -> vea_rs::Result<()> {
/// let vea = VeaBuilder::new()
///     .path("/data/pool.img")      // Optional: memory-only without it
///     .format(1 << 20)             // Format if the pool is new
///     .aggregation_interval_secs(30)
///     .build_shared()?;
/// # Ok(())
/// # }
/// ```
pub struct VeaBuilder {
    config: VeaConfig,
    path: Option<PathBuf>,
    total_blocks: Option<u64>,
    force_format: bool,
    clock: Option<Arc<dyn Clock>>,
    unmap: Option<UnmapFn>,
}

impl VeaBuilder {
    /// Create a new VeaBuilder with default settings
    pub fn new() -> Self {
        VeaBuilder {
            config: VeaConfig::default(),
            path: None,
            total_blocks: None,
            force_format: false,
            clock: None,
            unmap: None,
        }
    }

    /// Replace the whole configuration
    pub fn config(mut self, config: VeaConfig) -> Self {
        self.config = config;
        self
    }

    /// Back the space with a pool image file
    pub fn path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Format the pool with `total_blocks` blocks unless it already is
    pub fn format(mut self, total_blocks: u64) -> Self {
        self.total_blocks = Some(total_blocks);
        self
    }

    /// Format even if the pool already holds a space
    pub fn force_format(mut self) -> Self {
        self.force_format = true;
        self
    }

    pub fn block_size(mut self, block_size: u32) -> Self {
        self.config.block_size = block_size;
        self
    }

    pub fn header_blocks(mut self, header_blocks: u32) -> Self {
        self.config.header_blocks = header_blocks;
        self
    }

    pub fn large_threshold_mb(mut self, mb: u32) -> Self {
        self.config.large_threshold_mb = mb;
        self
    }

    pub fn aggregation_interval_secs(mut self, secs: u64) -> Self {
        self.config.aggregation_interval_secs = secs;
        self
    }

    pub fn max_vector_extents(mut self, max: u32) -> Self {
        self.config.max_vector_extents = max;
        self
    }

    /// Use a custom time source for extent aging
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Callback told about ranges leaving the aggregation buffer
    pub fn unmap(mut self, unmap: UnmapFn) -> Self {
        self.unmap = Some(unmap);
        self
    }

    /// Build the allocator
    pub fn build(self) -> Result<SpaceInfo> {
        self.config.validate()?;

        let mut pool = match &self.path {
            Some(path) if path.exists() => Pool::open(path)?,
            Some(path) => Pool::create(path)?,
            None => Pool::memory(),
        };

        if let Some(total_blocks) = self.total_blocks {
            if !pool.df().is_formatted() || self.force_format {
                SpaceInfo::format(&mut pool, &self.config, total_blocks, self.force_format)?;
            } else {
                debug!("Pool already formatted, skipping format");
            }
        }

        let clock = self
            .clock
            .unwrap_or_else(|| Arc::new(MonotonicClock::new()));
        let mut space = SpaceInfo::load_with_clock(pool, self.config, clock)?;
        if let Some(unmap) = self.unmap {
            space.set_unmap(unmap);
        }

        info!(
            "Built allocator over {}",
            self.path
                .as_ref()
                .map_or_else(|| "memory pool".to_string(), |p| p.display().to_string())
        );
        Ok(space)
    }

    /// Build the allocator behind a lock
    pub fn build_shared(self) -> Result<SharedVea> {
        Ok(Arc::new(Mutex::new(self.build()?)))
    }
}

impl Default for VeaBuilder {
    fn default() -> Self {
        Self::new()
    }
}
