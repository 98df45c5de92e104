//! Compound index: free space ordered by offset
//!
//! In memory this is the offset tree over every free entry; on media it is
//! the free-extent table. Both merge adjacent ranges, but the in-memory side
//! only merges settled entries so staged frees keep their age.

use super::entry::EntryId;
use super::{SpaceInfo, FREE_GEN_AGE, FREE_NO_MERGE};
use crate::error::{Result, VeaError};
use crate::extent::{verify_free_entry, verify_vec_entry, ExtentVector, FreeExtent};
use tracing::error;

impl SpaceInfo {
    /// Free entries ending exactly at `offset` and starting exactly at
    /// `offset + count`
    pub(crate) fn find_adjacent(
        &self,
        offset: u64,
        count: u32,
    ) -> Result<(Option<EntryId>, Option<EntryId>)> {
        let end = offset + u64::from(count);

        let prev = match self.free_tree.range(..offset).next_back() {
            Some((_, &id)) if self.arena.get(id)?.ext.end() == offset => Some(id),
            _ => None,
        };
        let next = self.free_tree.get(&end).copied();

        Ok((prev, next))
    }

    /// First in-memory free extent sharing a block with the range
    fn overlapping_entry(&self, offset: u64, count: u64) -> Result<Option<FreeExtent>> {
        let end = offset.saturating_add(count);
        if let Some((_, &id)) = self.free_tree.range(..end).next_back() {
            let ext = self.arena.get(id)?.ext;
            if ext.end() > offset {
                return Ok(Some(ext));
            }
        }
        Ok(None)
    }

    /// Return a range to the in-memory indices
    ///
    /// Without [`FREE_GEN_AGE`] the range is merged with settled neighbours
    /// (unless [`FREE_NO_MERGE`]) and classified at once. With it, the
    /// range is stamped with the current time and staged in the
    /// aggregation buffer.
    pub(crate) fn compound_free(&mut self, ext: FreeExtent, flags: u32) -> Result<()> {
        if ext.block_count == 0 {
            return Err(VeaError::invalid("freeing zero blocks"));
        }
        if let Some(free) = self.overlapping_entry(ext.offset, u64::from(ext.block_count))? {
            return Err(VeaError::integrity(format!(
                "range {}+{} overlaps free extent {}+{}",
                ext.offset, ext.block_count, free.offset, free.block_count
            )));
        }

        if flags & FREE_GEN_AGE != 0 {
            let staged = FreeExtent::with_age(ext.offset, ext.block_count, self.now());
            let id = self.arena.alloc(staged);
            self.free_tree.insert(staged.offset, id);
            return self.agg.insert(&mut self.arena, id);
        }

        let mut merged = FreeExtent::new(ext.offset, ext.block_count);
        if flags & FREE_NO_MERGE == 0 {
            let (prev, next) = self.find_adjacent(merged.offset, merged.block_count)?;

            for neighbour in [prev, next].into_iter().flatten() {
                let entry = *self.arena.get(neighbour)?;
                if !entry.member.is_settled() {
                    continue;
                }
                if let Some(joined) = merged.coalesce(&entry.ext) {
                    self.remove_settled(neighbour)?;
                    merged = FreeExtent::new(joined.offset, joined.block_count);
                }
            }
        }

        self.insert_settled(merged)?;
        Ok(())
    }

    /// Remove `[offset, offset + count)` from the persistent free table
    ///
    /// The range may span several back-to-back records, since records are
    /// capped at `u32::MAX` blocks while in-memory merges are not aligned
    /// to the same boundaries.
    pub(crate) fn persistent_alloc(&mut self, offset: u64, count: u32) -> Result<()> {
        let end = offset + u64::from(count);
        let table = self.pool.free_table_mut()?;

        let (mut key, mut record) = match table.floor(offset)? {
            Some((key, record)) if record.end() > offset => (key, record),
            _ => {
                return Err(VeaError::integrity(format!(
                    "no free record holds {}+{}",
                    offset, count
                )))
            }
        };

        loop {
            table.delete(key)?;
            if key < offset {
                table.insert(key, FreeExtent::new(key, (offset - key) as u32))?;
            }
            if record.end() > end {
                table.insert(end, FreeExtent::new(end, (record.end() - end) as u32))?;
            }
            if record.end() >= end {
                return Ok(());
            }

            key = record.end();
            record = table.search(key)?.ok_or_else(|| {
                VeaError::integrity(format!(
                    "{}+{} is not free past block {}",
                    offset, count, key
                ))
            })?;
        }
    }

    /// Insert a freed range into the persistent free table, merging with
    /// the records on either side
    pub(crate) fn persistent_free(&mut self, offset: u64, count: u32) -> Result<()> {
        let end = offset + u64::from(count);
        let table = self.pool.free_table_mut()?;

        let prev = table.floor(offset)?;
        let next = table.ceiling(offset)?;
        let overlap = prev.as_ref().filter(|(_, p)| p.end() > offset).or(next
            .as_ref()
            .filter(|(_, n)| n.offset < end));
        if let Some((_, free)) = overlap {
            return Err(VeaError::invalid(format!(
                "double free: {}+{} overlaps free extent {}+{}",
                offset, count, free.offset, free.block_count
            )));
        }

        let mut merged = FreeExtent::new(offset, count);
        if let Some((key, p)) = prev.filter(|(_, p)| p.end() == offset) {
            if let Some(joined) = p.coalesce(&merged) {
                table.delete(key)?;
                merged = joined;
            }
        }
        if let Some((key, n)) = next.filter(|(_, n)| n.offset == end) {
            if let Some(joined) = merged.coalesce(&n) {
                table.delete(key)?;
                merged = joined;
            }
        }

        table.insert(merged.offset, FreeExtent::new(merged.offset, merged.block_count))?;
        Ok(())
    }

    /// Persist a vector grant: allocate every piece and record the vector
    pub(crate) fn compound_vec_alloc(&mut self, vector: &ExtentVector) -> Result<u64> {
        verify_vec_entry(vector)?;
        for piece in &vector.extents {
            self.persistent_alloc(piece.offset, piece.block_count)?;
        }

        let mut df = *self.pool.df();
        let id = df.next_vector_id;
        df.next_vector_id += 1;
        self.pool.set_df(df)?;

        let record = ExtentVector {
            extents: vector
                .extents
                .iter()
                .map(|e| FreeExtent::new(e.offset, e.block_count))
                .collect(),
        };
        self.pool.vector_table_mut()?.insert(id, record)?;
        Ok(id)
    }

    /// Rebuild the in-memory indices from the persistent tables
    pub(crate) fn load_free_extents(&mut self) -> Result<()> {
        self.scan_tables().map_err(|err| {
            error!("Space metadata is corrupt: {}", err);
            err
        })
    }

    fn scan_tables(&mut self) -> Result<()> {
        let df = *self.pool.df();
        let mut prev_end = u64::from(df.header_blocks);

        for (key, record) in self.pool.free_table().entries()? {
            verify_free_entry(Some(key), &record)?;
            if record.offset < prev_end {
                return Err(VeaError::integrity(format!(
                    "free record {}+{} overlaps the header or its predecessor",
                    record.offset, record.block_count
                )));
            }
            if record.end() > df.total_blocks {
                return Err(VeaError::integrity(format!(
                    "free record {}+{} runs past capacity {}",
                    record.offset, record.block_count, df.total_blocks
                )));
            }
            prev_end = record.end();
            self.compound_free(record, FREE_NO_MERGE)?;
        }

        for (id, vector) in self.pool.vector_table().entries()? {
            verify_vec_entry(&vector)?;
            if id >= df.next_vector_id {
                return Err(VeaError::integrity(format!(
                    "vector id {} not below next id {}",
                    id, df.next_vector_id
                )));
            }
            for piece in &vector.extents {
                if self
                    .overlapping_entry(piece.offset, u64::from(piece.block_count))?
                    .is_some()
                {
                    return Err(VeaError::integrity(format!(
                        "vector {} piece {}+{} is also free",
                        id, piece.offset, piece.block_count
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::entry::Membership;
    use super::super::tests::space;
    use super::*;

    /// Space with everything allocated durably
    fn full_space() -> SpaceInfo {
        let (mut space, _) = space(1001);
        let mut resrv = [space.reserve(1000, None).unwrap()];
        space.publish(&mut resrv).unwrap();
        space
    }

    #[test]
    fn test_merge_in_either_order() {
        for order in [[0u64, 10], [10, 0]] {
            let mut space = full_space();
            for start in order {
                space.compound_free(FreeExtent::new(start + 1, 10), 0).unwrap();
            }
            assert_eq!(space.dump(true).unwrap(), vec![FreeExtent::new(1, 20)]);
            space.check_integrity().unwrap();
        }
    }

    #[test]
    fn test_merge_both_sides() {
        let mut space = full_space();
        space.compound_free(FreeExtent::new(100, 10), 0).unwrap();
        space.compound_free(FreeExtent::new(120, 10), 0).unwrap();
        space.compound_free(FreeExtent::new(110, 10), 0).unwrap();

        assert_eq!(space.dump(true).unwrap(), vec![FreeExtent::new(100, 30)]);
        let id = space.free_tree[&100];
        assert_eq!(space.arena.get(id).unwrap().member, Membership::SizeClass(4));
    }

    #[test]
    fn test_find_adjacent_requires_contact() {
        let mut space = full_space();
        space.compound_free(FreeExtent::new(100, 10), 0).unwrap();
        space.compound_free(FreeExtent::new(121, 10), 0).unwrap();

        let (prev, next) = space.find_adjacent(110, 10).unwrap();
        assert_eq!(prev, Some(space.free_tree[&100]));
        assert_eq!(next, None);
    }

    #[test]
    fn test_overlapping_free_is_integrity_error() {
        let mut space = full_space();
        space.compound_free(FreeExtent::new(100, 10), 0).unwrap();
        assert!(matches!(
            space.compound_free(FreeExtent::new(105, 10), 0),
            Err(VeaError::Integrity(_))
        ));
    }

    #[test]
    fn test_persistent_alloc_splits_record() {
        let (mut space, _) = space(1000);
        space.pool.tx_begin().unwrap();
        space.persistent_alloc(100, 50).unwrap();
        space.pool.tx_commit().unwrap();

        assert_eq!(
            space.dump(false).unwrap(),
            vec![FreeExtent::new(1, 99), FreeExtent::new(150, 850)]
        );
    }

    #[test]
    fn test_persistent_alloc_of_allocated_range() {
        let (mut space, _) = space(1000);
        space.pool.tx_begin().unwrap();
        space.persistent_alloc(100, 50).unwrap();
        assert!(matches!(
            space.persistent_alloc(120, 10),
            Err(VeaError::Integrity(_))
        ));
        assert!(matches!(
            space.persistent_alloc(140, 20),
            Err(VeaError::Integrity(_))
        ));
    }

    #[test]
    fn test_persistent_alloc_spans_adjacent_records() {
        let (mut space, _) = space(1000);

        // Records that touch but were never merged
        space.pool.tx_begin().unwrap();
        let table = space.pool.free_table_mut().unwrap();
        table.delete(1).unwrap();
        table.insert(1, FreeExtent::new(1, 99)).unwrap();
        table.insert(100, FreeExtent::new(100, 100)).unwrap();
        table.insert(200, FreeExtent::new(200, 800)).unwrap();
        space.persistent_alloc(50, 200).unwrap();
        space.pool.tx_commit().unwrap();

        assert_eq!(
            space.dump(false).unwrap(),
            vec![FreeExtent::new(1, 49), FreeExtent::new(250, 750)]
        );
    }

    #[test]
    fn test_persistent_alloc_stops_at_gap() {
        let (mut space, _) = space(1000);
        space.pool.tx_begin().unwrap();
        space.persistent_alloc(100, 50).unwrap();
        assert!(matches!(
            space.persistent_alloc(90, 20),
            Err(VeaError::Integrity(_))
        ));
    }

    #[test]
    fn test_publish_extent_merged_across_record_limit() {
        let total = u64::from(u32::MAX) + 101;
        let (mut space, _) = space(total);
        assert_eq!(space.pool.free_table().len(), 2);

        let mut head = [space.reserve(200, None).unwrap()];
        space.publish(&mut head).unwrap();

        // Merging the 100-block record back in memory spans two records
        let tail = space.reserve(100, None).unwrap();
        assert_eq!(tail.offset(), u64::from(u32::MAX) + 1);
        space.cancel(&mut [tail]).unwrap();
        assert_eq!(space.free_tree.len(), 1);
        assert_eq!(space.pool.free_table().len(), 2);

        let mut rest = [space.reserve(u32::MAX - 100, None).unwrap()];
        assert_eq!(rest[0].offset(), 201);
        space.publish(&mut rest).unwrap();

        assert!(space.dump(false).unwrap().is_empty());
        assert!(space.verify_alloc(false, 201, u32::MAX - 100).unwrap());
        space.check_integrity().unwrap();
    }

    #[test]
    fn test_persistent_free_merges_and_rejects_double_free() {
        let (mut space, _) = space(1000);
        space.pool.tx_begin().unwrap();
        space.persistent_alloc(100, 50).unwrap();
        space.persistent_free(100, 20).unwrap();
        assert!(matches!(
            space.persistent_free(110, 5),
            Err(VeaError::InvalidArgument(_))
        ));
        assert!(matches!(
            space.persistent_free(140, 20),
            Err(VeaError::InvalidArgument(_))
        ));
        space.persistent_free(120, 30).unwrap();
        space.pool.tx_commit().unwrap();

        assert_eq!(space.dump(false).unwrap(), vec![FreeExtent::new(1, 999)]);
    }

    #[test]
    fn test_persistent_ops_need_transaction() {
        let (mut space, _) = space(1000);
        assert!(matches!(
            space.persistent_alloc(1, 1),
            Err(VeaError::NoTransaction)
        ));
    }
}
