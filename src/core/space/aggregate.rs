//! Aggregation buffer and migration
//!
//! Freed ranges are staged here, stamped with the time they were freed,
//! instead of being merged on the spot. Migration later moves every range
//! that has aged past the interval into the free class index, merging it
//! with settled neighbours, and reports it to the unmap callback.

use super::entry::{EntryArena, EntryId, Membership};
use super::SpaceInfo;
use crate::error::{Result, VeaError};
use crate::extent::FreeExtent;
use lru::LruCache;
use std::collections::BTreeMap;
use tracing::{debug, warn};

pub struct AggregationBuffer {
    /// Newest at the front
    lru: LruCache<EntryId, ()>,
    tree: BTreeMap<u64, EntryId>,
    blocks: u64,
}

impl AggregationBuffer {
    pub fn new() -> Self {
        AggregationBuffer {
            lru: LruCache::unbounded(),
            tree: BTreeMap::new(),
            blocks: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.lru.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lru.is_empty()
    }

    /// Blocks waiting for migration
    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    pub fn contains(&self, arena: &EntryArena, id: EntryId) -> bool {
        self.lru.contains(&id)
            && arena
                .get(id)
                .map(|e| self.tree.get(&e.ext.offset) == Some(&id))
                .unwrap_or(false)
    }

    pub fn insert(&mut self, arena: &mut EntryArena, id: EntryId) -> Result<()> {
        let entry = arena.get_mut(id)?;
        if entry.member != Membership::Detached {
            return Err(VeaError::integrity(format!(
                "aggregating extent at {} already held by {:?}",
                entry.ext.offset, entry.member
            )));
        }

        self.lru.push(id, ());
        self.tree.insert(entry.ext.offset, id);
        self.blocks += u64::from(entry.ext.block_count);
        entry.member = Membership::Aggregating;
        Ok(())
    }

    pub fn remove(&mut self, arena: &mut EntryArena, id: EntryId) -> Result<()> {
        let entry = arena.get_mut(id)?;
        if entry.member != Membership::Aggregating
            || self.lru.pop(&id).is_none()
            || self.tree.remove(&entry.ext.offset) != Some(id)
        {
            return Err(VeaError::integrity(format!(
                "extent at {} missing from aggregation buffer",
                entry.ext.offset
            )));
        }

        self.blocks -= u64::from(entry.ext.block_count);
        entry.member = Membership::Detached;
        Ok(())
    }

    /// Entry freed longest ago
    pub fn oldest(&self) -> Option<EntryId> {
        self.lru.peek_lru().map(|(id, _)| *id)
    }

    /// Aggregating entries in offset order
    pub fn iter(&self) -> impl Iterator<Item = EntryId> + '_ {
        self.tree.values().copied()
    }

    pub fn clear(&mut self) {
        self.lru.clear();
        self.tree.clear();
        self.blocks = 0;
    }
}

impl Default for AggregationBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl SpaceInfo {
    /// Move aged extents out of the aggregation buffer
    ///
    /// Runs at most once per aggregation interval unless `force` is set;
    /// forced runs migrate every staged extent regardless of age. Returns
    /// the number of extents migrated.
    pub fn migrate_free_exts(&mut self, force: bool) -> Result<usize> {
        let now = self.now();
        let interval = self.config.aggregation_interval_secs;
        if !force && now < self.last_aggregation.saturating_add(interval) {
            return Ok(0);
        }
        self.last_aggregation = now;

        let mut migrated = 0;
        let mut blocks = 0u64;
        while let Some(id) = self.agg.oldest() {
            let ext = self.arena.get(id)?.ext;
            if !force && ext.age.saturating_add(interval) > now {
                break;
            }

            self.agg.remove(&mut self.arena, id)?;
            if self.free_tree.remove(&ext.offset) != Some(id) {
                return Err(VeaError::integrity(format!(
                    "aggregating extent at {} missing from offset tree",
                    ext.offset
                )));
            }
            self.arena.release(id)?;

            if let Some(unmap) = self.unmap.as_mut() {
                if let Err(err) = unmap(ext.offset, ext.block_count) {
                    warn!(
                        "Unmap of {} blocks at {} failed: {}",
                        ext.block_count, ext.offset, err
                    );
                }
            }

            self.compound_free(FreeExtent::new(ext.offset, ext.block_count), 0)?;
            migrated += 1;
            blocks += u64::from(ext.block_count);
        }

        if migrated > 0 {
            debug!(
                "Migrated {} extents ({} blocks), {} still aggregating",
                migrated,
                blocks,
                self.agg.len()
            );
        }
        Ok(migrated)
    }

    /// Opportunistic, time-gated migration
    pub fn migrate(&mut self) -> Result<usize> {
        self.migrate_free_exts(false)
    }

    /// Migrate every staged extent now
    pub fn flush(&mut self) -> Result<usize> {
        self.migrate_free_exts(true)
    }
}
