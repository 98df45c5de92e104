//! Extent types shared by the in-memory indices and the persistent tables
//!
//! A free extent is a maximal run of free blocks, addressed by block offset.
//! Extents fresh from a free carry the time they were freed; settled extents
//! carry [`AGE_IDLE`].

use crate::error::{Result, VeaError};
use serde::{Deserialize, Serialize};

/// Age of an extent that is not waiting for aggregation
pub const AGE_IDLE: u64 = u64::MAX;

/// A contiguous run of free blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FreeExtent {
    /// Starting block offset
    pub offset: u64,
    /// Number of contiguous blocks
    pub block_count: u32,
    /// Freed timestamp in seconds, or [`AGE_IDLE`]
    pub age: u64,
}

impl FreeExtent {
    pub fn new(offset: u64, block_count: u32) -> Self {
        FreeExtent {
            offset,
            block_count,
            age: AGE_IDLE,
        }
    }

    pub fn with_age(offset: u64, block_count: u32, age: u64) -> Self {
        FreeExtent {
            offset,
            block_count,
            age,
        }
    }

    /// First block past the extent
    pub fn end(&self) -> u64 {
        self.offset + u64::from(self.block_count)
    }

    pub fn is_idle(&self) -> bool {
        self.age == AGE_IDLE
    }

    /// Check if this extent contains a block
    pub fn contains(&self, block: u64) -> bool {
        block >= self.offset && block < self.end()
    }

    /// Check if `[offset, offset + count)` shares any block with this extent
    pub fn overlaps(&self, offset: u64, count: u64) -> bool {
        offset < self.end() && self.offset < offset + count
    }

    /// True when `next` starts exactly where this extent ends
    pub fn is_followed_by(&self, next: &FreeExtent) -> bool {
        self.end() == next.offset
    }

    /// Check if this extent is adjacent to another (can be coalesced)
    pub fn is_adjacent(&self, other: &FreeExtent) -> bool {
        self.is_followed_by(other) || other.is_followed_by(self)
    }

    /// Coalesce two adjacent extents
    ///
    /// Returns `None` when the extents do not touch or the merged length
    /// would not fit a block count.
    pub fn coalesce(&self, other: &FreeExtent) -> Option<FreeExtent> {
        if !self.is_adjacent(other) {
            return None;
        }

        let count = u64::from(self.block_count) + u64::from(other.block_count);
        let count = u32::try_from(count).ok()?;

        Some(FreeExtent {
            offset: self.offset.min(other.offset),
            block_count: count,
            age: self.age.min(other.age),
        })
    }

    /// Split off the leading `count` blocks
    ///
    /// Returns the carved extent and the remainder, if any.
    pub fn carve(&self, count: u32) -> (FreeExtent, Option<FreeExtent>) {
        debug_assert!(count > 0 && count <= self.block_count);
        let head = FreeExtent {
            offset: self.offset,
            block_count: count,
            age: self.age,
        };
        let rest = (count < self.block_count).then(|| FreeExtent {
            offset: self.offset + u64::from(count),
            block_count: self.block_count - count,
            age: self.age,
        });
        (head, rest)
    }
}

/// Extents jointly serving one allocation that no single extent could
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExtentVector {
    pub extents: Vec<FreeExtent>,
}

impl ExtentVector {
    pub fn new() -> Self {
        ExtentVector {
            extents: Vec::new(),
        }
    }

    pub fn push(&mut self, extent: FreeExtent) {
        self.extents.push(extent);
    }

    pub fn block_count(&self) -> u64 {
        self.extents.iter().map(|e| u64::from(e.block_count)).sum()
    }

    pub fn len(&self) -> usize {
        self.extents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }
}

/// Check a free extent against the key it is stored under
pub fn verify_free_entry(key: Option<u64>, extent: &FreeExtent) -> Result<()> {
    if extent.block_count == 0 {
        return Err(VeaError::integrity(format!(
            "zero length free extent at {}",
            extent.offset
        )));
    }

    if let Some(key) = key {
        if key != extent.offset {
            return Err(VeaError::integrity(format!(
                "free extent {} stored under key {}",
                extent.offset, key
            )));
        }
    }

    Ok(())
}

/// Check an extent vector: non-empty pieces that do not overlap each other
pub fn verify_vec_entry(vector: &ExtentVector) -> Result<()> {
    if vector.is_empty() {
        return Err(VeaError::integrity("empty extent vector"));
    }

    let mut sorted = vector.extents.clone();
    sorted.sort_by_key(|e| e.offset);
    for pair in sorted.windows(2) {
        verify_free_entry(None, &pair[0])?;
        if pair[0].end() > pair[1].offset {
            return Err(VeaError::integrity(format!(
                "overlapping vector pieces at {} and {}",
                pair[0].offset, pair[1].offset
            )));
        }
    }
    verify_free_entry(None, &sorted[sorted.len() - 1])
}
