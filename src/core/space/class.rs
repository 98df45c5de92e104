//! Free class index
//!
//! Settled free extents are classified by size:
//! - Large (>= threshold): max-heap ordered by block count, lowest offset
//!   first among equals
//! - Small: one LRU per size class, newest at the front
//!
//! Size classes are bounded by `sizes[0] > sizes[1] > ... > sizes[K-1]`,
//! each a quarter of the previous; class `i` holds extents with
//! `sizes[i+1] < block_count <= sizes[i]` where `sizes[K] = 0`.

use super::entry::{EntryArena, EntryId, Membership};
use crate::error::{Result, VeaError};
use lru::LruCache;
use std::cmp::Reverse;
use std::collections::BTreeSet;

/// Heap ordering key: block count, then lowest offset, then id
type HeapKey = (u32, Reverse<u64>, EntryId);

/// Reusable buffer of entries picked by a multi-extent scan
#[derive(Debug, Default)]
pub struct FreeExtCursor {
    pub entries: Vec<EntryId>,
}

impl FreeExtCursor {
    pub fn reset(&mut self) {
        self.entries.clear();
    }
}

pub struct FreeClass {
    large_thresh: u32,
    heap: BTreeSet<HeapKey>,
    sizes: Vec<u32>,
    lrus: Vec<LruCache<EntryId, ()>>,
    /// Blocks held by the heap and the LRUs
    free_blocks: u64,
    pub cursor: FreeExtCursor,
}

impl std::fmt::Debug for FreeClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreeClass")
            .field("large_thresh", &self.large_thresh)
            .field("heap", &self.heap.len())
            .field("sizes", &self.sizes)
            .field(
                "lrus",
                &self.lrus.iter().map(|l| l.len()).collect::<Vec<_>>(),
            )
            .field("free_blocks", &self.free_blocks)
            .finish()
    }
}

impl FreeClass {
    /// Build the index for a large threshold (in blocks) and up to
    /// `classes` size classes
    pub fn new(large_thresh: u32, classes: u32) -> Self {
        let mut sizes = Vec::new();
        let mut bound = large_thresh.saturating_sub(1);
        while bound > 0 && sizes.len() < classes as usize {
            sizes.push(bound);
            bound /= 4;
        }

        let lrus = sizes.iter().map(|_| LruCache::unbounded()).collect();

        FreeClass {
            large_thresh,
            heap: BTreeSet::new(),
            sizes,
            lrus,
            free_blocks: 0,
            cursor: FreeExtCursor::default(),
        }
    }

    pub fn large_thresh(&self) -> u32 {
        self.large_thresh
    }

    pub fn sizes(&self) -> &[u32] {
        &self.sizes
    }

    pub fn free_blocks(&self) -> u64 {
        self.free_blocks
    }

    pub fn heap_len(&self) -> usize {
        self.heap.len()
    }

    pub fn small_len(&self) -> usize {
        self.lrus.iter().map(|l| l.len()).sum()
    }

    /// Size class holding `block_count`, or `None` for large extents
    pub fn bucket(&self, block_count: u32) -> Option<usize> {
        if block_count >= self.large_thresh {
            return None;
        }
        // Counts above the first bound still land in class 0
        Some(
            self.sizes
                .iter()
                .rposition(|&bound| block_count <= bound)
                .unwrap_or(0),
        )
    }

    /// Place a detached entry in the heap or its size class LRU
    pub fn classify(&mut self, arena: &mut EntryArena, id: EntryId) -> Result<()> {
        let entry = arena.get_mut(id)?;
        if entry.member != Membership::Detached {
            return Err(VeaError::integrity(format!(
                "classifying entry at {} already held by {:?}",
                entry.ext.offset, entry.member
            )));
        }

        let count = entry.ext.block_count;
        match self.bucket(count) {
            None => {
                self.heap.insert((count, Reverse(entry.ext.offset), id));
                entry.member = Membership::Heap;
            }
            Some(class) => {
                self.lrus[class].push(id, ());
                entry.member = Membership::SizeClass(class);
            }
        }
        self.free_blocks += u64::from(count);
        Ok(())
    }

    /// Detach an entry from the heap or its LRU
    pub fn remove(&mut self, arena: &mut EntryArena, id: EntryId) -> Result<()> {
        let entry = arena.get_mut(id)?;
        let removed = match entry.member {
            Membership::Heap => self
                .heap
                .remove(&(entry.ext.block_count, Reverse(entry.ext.offset), id)),
            Membership::SizeClass(class) => self
                .lrus
                .get_mut(class)
                .and_then(|lru| lru.pop(&id))
                .is_some(),
            _ => false,
        };

        if !removed {
            return Err(VeaError::integrity(format!(
                "free extent at {} is in neither heap nor size class ({:?})",
                entry.ext.offset, entry.member
            )));
        }

        entry.member = Membership::Detached;
        self.free_blocks -= u64::from(entry.ext.block_count);
        Ok(())
    }

    /// Largest extent, if it holds at least `block_count` blocks
    pub fn pick_large(&self, block_count: u32) -> Option<EntryId> {
        self.heap
            .last()
            .filter(|(count, _, _)| *count >= block_count)
            .map(|(_, _, id)| *id)
    }

    /// Oldest small extent able to hold `block_count` blocks
    ///
    /// The class containing `block_count` is searched oldest-first for an
    /// adequate entry; every entry in a larger class is adequate, so those
    /// yield their oldest.
    pub fn pick_small(&self, arena: &EntryArena, block_count: u32) -> Result<Option<EntryId>> {
        let start = match self.bucket(block_count) {
            Some(class) => class,
            None => return Ok(None),
        };

        for (id, _) in self.lrus[start].iter().rev() {
            if arena.get(*id)?.ext.block_count >= block_count {
                return Ok(Some(*id));
            }
        }

        for class in (0..start).rev() {
            if let Some((id, _)) = self.lrus[class].peek_lru() {
                return Ok(Some(*id));
            }
        }

        Ok(None)
    }

    /// Fill the cursor with entries jointly covering `block_count` blocks
    ///
    /// Walks the heap largest first, then the size classes from the largest
    /// class down, each oldest first. Returns false if the free total is
    /// short, or if `max_pieces` entries cannot cover the request.
    pub fn pick_vector(
        &mut self,
        arena: &EntryArena,
        block_count: u64,
        max_pieces: usize,
    ) -> Result<bool> {
        self.cursor.reset();
        if self.free_blocks < block_count {
            return Ok(false);
        }

        let mut covered = 0u64;
        let heap_ids = self.heap.iter().rev().map(|(_, _, id)| *id);
        let lru_ids = self
            .lrus
            .iter()
            .flat_map(|lru| lru.iter().rev().map(|(id, _)| *id));

        for id in heap_ids.chain(lru_ids) {
            if covered >= block_count || self.cursor.entries.len() >= max_pieces {
                break;
            }
            covered += u64::from(arena.get(id)?.ext.block_count);
            self.cursor.entries.push(id);
        }

        Ok(covered >= block_count)
    }

    /// Check that an entry sits where its membership tag says
    pub fn verify_member(&self, arena: &EntryArena, id: EntryId) -> Result<()> {
        let entry = arena.get(id)?;
        let ok = match entry.member {
            Membership::Heap => {
                entry.ext.block_count >= self.large_thresh
                    && self
                        .heap
                        .contains(&(entry.ext.block_count, Reverse(entry.ext.offset), id))
            }
            Membership::SizeClass(class) => {
                self.bucket(entry.ext.block_count) == Some(class)
                    && self.lrus.get(class).map_or(false, |lru| lru.contains(&id))
            }
            _ => false,
        };

        if !ok {
            return Err(VeaError::integrity(format!(
                "free extent at {} ({} blocks) misclassified as {:?}",
                entry.ext.offset, entry.ext.block_count, entry.member
            )));
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.heap.clear();
        for lru in &mut self.lrus {
            lru.clear();
        }
        self.free_blocks = 0;
        self.cursor.reset();
    }
}
