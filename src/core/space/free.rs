//! Free paths
//!
//! A free is persisted in the caller's transaction and only reaches the
//! in-memory indices once that transaction commits, staged in the
//! aggregation buffer. Freed blocks are not reusable until migrated.

use super::{SpaceInfo, FREE_GEN_AGE};
use crate::error::{Result, VeaError};
use crate::extent::{ExtentVector, FreeExtent};
use tracing::debug;

impl SpaceInfo {
    /// Free `[offset, offset + block_count)` in the open transaction
    pub fn tx_free(&mut self, offset: u64, block_count: u32) -> Result<()> {
        self.tx_free_flags(offset, block_count, FREE_GEN_AGE)
    }

    /// Free a range in the open transaction, indexing it on commit as
    /// `flags` say
    ///
    /// Without [`FREE_GEN_AGE`] the range skips the aggregation buffer and
    /// is reservable as soon as the transaction commits.
    pub fn tx_free_flags(&mut self, offset: u64, block_count: u32, flags: u32) -> Result<()> {
        if !self.pool.in_tx() {
            return Err(VeaError::NoTransaction);
        }
        if block_count == 0 {
            return Err(VeaError::invalid("cannot free zero blocks"));
        }

        let df = *self.pool.df();
        let end = offset.checked_add(u64::from(block_count));
        if offset < u64::from(df.header_blocks) || end.map_or(true, |end| end > df.total_blocks) {
            return Err(VeaError::invalid(format!(
                "range {}+{} is outside the space [{}, {})",
                offset, block_count, df.header_blocks, df.total_blocks
            )));
        }

        self.persistent_free(offset, block_count)?;
        self.pending
            .frees
            .push((FreeExtent::new(offset, block_count), flags));
        debug!("Freed {} blocks at {}", block_count, offset);
        Ok(())
    }

    /// Free a range in a transaction of its own
    pub fn free(&mut self, offset: u64, block_count: u32) -> Result<()> {
        self.transaction(|space| space.tx_free(offset, block_count))
    }

    pub fn free_flags(&mut self, offset: u64, block_count: u32, flags: u32) -> Result<()> {
        self.transaction(|space| space.tx_free_flags(offset, block_count, flags))
    }

    /// Published extent vector by id
    pub fn vector(&self, id: u64) -> Result<Option<ExtentVector>> {
        self.pool.vector_table().search(id)
    }

    /// Free every piece of a published vector and drop its record, in the
    /// open transaction
    pub fn tx_free_vector(&mut self, id: u64) -> Result<()> {
        let vector = self
            .pool
            .vector_table_mut()?
            .delete(id)?
            .ok_or_else(|| VeaError::invalid(format!("no extent vector with id {}", id)))?;

        for piece in &vector.extents {
            self.tx_free(piece.offset, piece.block_count)?;
        }
        Ok(())
    }

    /// Free a published vector in a transaction of its own
    pub fn free_vector(&mut self, id: u64) -> Result<()> {
        self.transaction(|space| space.tx_free_vector(id))
    }
}
