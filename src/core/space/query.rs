//! Attributes, statistics and consistency checks

use super::entry::Membership;
use super::SpaceInfo;
use crate::error::{Result, VeaError};
use crate::extent::FreeExtent;
use serde::Serialize;

/// Reservation counters by path taken
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Counters {
    pub resrv_hint: u64,
    pub resrv_large: u64,
    pub resrv_small: u64,
    pub resrv_vector: u64,
}

/// Static geometry and free space totals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Attributes {
    pub block_size: u32,
    pub header_blocks: u32,
    /// Large extent threshold in blocks
    pub large_threshold: u32,
    pub total_blocks: u64,
    /// Free blocks recorded in the persistent free table
    pub free_persistent: u64,
    /// Free blocks in the in-memory indices, aggregating ones included
    pub free_transient: u64,
    pub reserved: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Stats {
    pub resrv_hint: u64,
    pub resrv_large: u64,
    pub resrv_small: u64,
    pub resrv_vector: u64,
    /// Free extents in the large heap
    pub free_large: u64,
    /// Free extents in the size classes
    pub free_small: u64,
    pub aggregating: u64,
}

impl SpaceInfo {
    pub fn query(&self) -> Result<(Attributes, Stats)> {
        let df = self.pool.df();
        let free_persistent = self
            .pool
            .free_table()
            .entries()?
            .iter()
            .map(|(_, e)| u64::from(e.block_count))
            .sum();

        let attrs = Attributes {
            block_size: df.block_size,
            header_blocks: df.header_blocks,
            large_threshold: self.class.large_thresh(),
            total_blocks: df.total_blocks,
            free_persistent,
            free_transient: self.class.free_blocks() + self.agg.blocks(),
            reserved: self.total_reserved,
        };

        let stats = Stats {
            resrv_hint: self.counters.resrv_hint,
            resrv_large: self.counters.resrv_large,
            resrv_small: self.counters.resrv_small,
            resrv_vector: self.counters.resrv_vector,
            free_large: self.class.heap_len() as u64,
            free_small: self.class.small_len() as u64,
            aggregating: self.agg.len() as u64,
        };

        Ok((attrs, stats))
    }

    /// Free extents in offset order, from memory or from the persistent table
    pub fn dump(&self, transient: bool) -> Result<Vec<FreeExtent>> {
        if !transient {
            return Ok(self
                .pool
                .free_table()
                .entries()?
                .into_iter()
                .map(|(_, e)| e)
                .collect());
        }

        self.free_tree
            .values()
            .map(|&id| self.arena.get(id).map(|e| e.ext))
            .collect()
    }

    /// True when no block of the range is free
    pub fn verify_alloc(&self, transient: bool, offset: u64, block_count: u32) -> Result<bool> {
        if block_count == 0 {
            return Err(VeaError::invalid("empty range"));
        }
        let last = offset
            .checked_add(u64::from(block_count) - 1)
            .ok_or_else(|| VeaError::invalid("range overflows"))?;

        let candidate = if transient {
            match self.free_tree.range(..=last).next_back() {
                Some((_, &id)) => Some(self.arena.get(id)?.ext),
                None => None,
            }
        } else {
            self.pool.free_table().floor(last)?.map(|(_, e)| e)
        };

        Ok(candidate.map_or(true, |free| free.end() <= offset))
    }

    /// Check the in-memory indices against each other
    ///
    /// Every entry must sit in exactly the structure its tag names, be
    /// indexed by offset under its own start, and not overlap its
    /// neighbours.
    pub fn check_integrity(&self) -> Result<()> {
        let mut settled = 0usize;
        let mut aggregating = 0usize;

        for (id, entry) in self.arena.iter() {
            match entry.member {
                Membership::Heap | Membership::SizeClass(_) => {
                    self.class.verify_member(&self.arena, id)?;
                    if !entry.ext.is_idle() {
                        return Err(VeaError::integrity(format!(
                            "settled extent at {} carries age {}",
                            entry.ext.offset, entry.ext.age
                        )));
                    }
                    settled += 1;
                }
                Membership::Aggregating => {
                    if !self.agg.contains(&self.arena, id) {
                        return Err(VeaError::integrity(format!(
                            "extent at {} missing from aggregation buffer",
                            entry.ext.offset
                        )));
                    }
                    aggregating += 1;
                }
                Membership::Detached => {
                    return Err(VeaError::integrity(format!(
                        "free extent at {} is in neither heap nor an LRU",
                        entry.ext.offset
                    )));
                }
            }

            if self.free_tree.get(&entry.ext.offset) != Some(&id) {
                return Err(VeaError::integrity(format!(
                    "free extent at {} missing from offset tree",
                    entry.ext.offset
                )));
            }
        }

        if self.free_tree.len() != self.arena.len()
            || self.class.heap_len() + self.class.small_len() != settled
            || self.agg.len() != aggregating
        {
            return Err(VeaError::integrity(format!(
                "index sizes disagree: tree {}, arena {}, classified {}/{}, aggregating {}/{}",
                self.free_tree.len(),
                self.arena.len(),
                self.class.heap_len() + self.class.small_len(),
                settled,
                self.agg.len(),
                aggregating
            )));
        }

        let mut prev_end = 0u64;
        for &id in self.free_tree.values() {
            let ext = self.arena.get(id)?.ext;
            if ext.offset < prev_end {
                return Err(VeaError::integrity(format!(
                    "free extent at {} overlaps its predecessor",
                    ext.offset
                )));
            }
            prev_end = ext.end();
        }

        Ok(())
    }
}
