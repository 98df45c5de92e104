//! Space info: the allocator over one formatted pool
//!
//! Owns the in-memory indices of free space, the aggregation buffer, the
//! hint contexts and the pool holding the persistent tables:
//!
//! ```text
//!                reserve                       free (on commit)
//!                   │                                 │
//!          hint ──► free class ──► vector        aggregation buffer
//!                (heap │ size LRUs)                   │ migrate
//!                   │                                 ▼
//!                   └──────── compound offset tree ◄──┘
//! ```

pub mod aggregate;
pub mod class;
pub mod compound;
pub mod entry;
pub mod free;
pub mod hint;
pub mod query;
pub mod reserve;

use crate::clock::{Clock, MonotonicClock};
use crate::config::VeaConfig;
use crate::error::{Result, VeaError};
use crate::extent::FreeExtent;
use crate::format::SpaceDf;
use crate::pool::Pool;
use aggregate::AggregationBuffer;
use class::FreeClass;
use entry::{EntryArena, EntryId};
use hint::HintContext;
use query::Counters;
use reserve::Reservation;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Insert the extent as is, without looking for neighbours
pub const FREE_NO_MERGE: u32 = 1 << 0;
/// Stage the extent in the aggregation buffer
pub const FREE_GEN_AGE: u32 = 1 << 1;

/// Device notification that a range is truly free
pub type UnmapFn = Box<dyn FnMut(u64, u32) -> std::io::Result<()> + Send>;

/// Work deferred until the open transaction resolves
#[derive(Debug, Default)]
struct PendingTx {
    /// Reservations published in the transaction
    published: Vec<Reservation>,
    /// Ranges freed in the transaction
    frees: Vec<(FreeExtent, u32)>,
}

pub struct SpaceInfo {
    pool: Pool,
    config: VeaConfig,
    arena: EntryArena,
    /// Every free entry, settled or aggregating, by offset
    free_tree: BTreeMap<u64, EntryId>,
    class: FreeClass,
    agg: AggregationBuffer,
    /// Loaded stream hints; entries live until `hint_unload`
    hints: BTreeMap<u64, HintContext>,
    last_aggregation: u64,
    total_reserved: u64,
    clock: Arc<dyn Clock>,
    unmap: Option<UnmapFn>,
    pending: PendingTx,
    counters: Counters,
}

impl std::fmt::Debug for SpaceInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpaceInfo")
            .field("df", self.pool.df())
            .field("free_entries", &self.free_tree.len())
            .field("class", &self.class)
            .field("aggregating", &self.agg.len())
            .field("total_reserved", &self.total_reserved)
            .finish()
    }
}

impl SpaceInfo {
    /// Format `pool` as an allocator space of `total_blocks` blocks
    ///
    /// The first `config.header_blocks` blocks are reserved for the caller;
    /// everything after them becomes free space. An already formatted pool
    /// is only reformatted when `force` is set.
    pub fn format(pool: &mut Pool, config: &VeaConfig, total_blocks: u64, force: bool) -> Result<()> {
        config.validate()?;

        if pool.df().is_formatted() && !force {
            return Err(VeaError::AlreadyFormatted);
        }

        let header_blocks = u64::from(config.header_blocks);
        if total_blocks <= header_blocks {
            return Err(VeaError::invalid(format!(
                "capacity of {} blocks leaves no room after {} header blocks",
                total_blocks, header_blocks
            )));
        }

        let df = SpaceDf::new(config.block_size, config.header_blocks, total_blocks);
        pool.transaction(|pool| {
            pool.clear()?;
            pool.set_df(df)?;

            // One record per u32-sized run
            let table = pool.free_table_mut()?;
            let mut offset = header_blocks;
            while offset < total_blocks {
                let count = (total_blocks - offset).min(u64::from(u32::MAX)) as u32;
                table.insert(offset, FreeExtent::new(offset, count))?;
                offset += u64::from(count);
            }
            Ok(())
        })?;

        info!(
            "Formatted space: {} blocks of {} bytes, {} header blocks",
            total_blocks, config.block_size, config.header_blocks
        );
        Ok(())
    }

    /// Load the allocator from a formatted pool
    pub fn load(pool: Pool, config: VeaConfig) -> Result<Self> {
        Self::load_with_clock(pool, config, Arc::new(MonotonicClock::new()))
    }

    /// Load the allocator, aging extents by `clock`
    pub fn load_with_clock(pool: Pool, config: VeaConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        if pool.in_tx() {
            return Err(VeaError::TransactionActive);
        }

        let df = *pool.df();
        df.validate()?;
        if df.block_size != config.block_size {
            warn!(
                "Configured block size {} differs from formatted block size {}, using the latter",
                config.block_size, df.block_size
            );
        }

        let class = FreeClass::new(
            config.large_threshold_blocks(df.block_size),
            config.size_classes,
        );
        let now = clock.now_secs();

        let mut space = SpaceInfo {
            pool,
            config,
            arena: EntryArena::new(),
            free_tree: BTreeMap::new(),
            class,
            agg: AggregationBuffer::new(),
            hints: BTreeMap::new(),
            last_aggregation: now,
            total_reserved: 0,
            clock,
            unmap: None,
            pending: PendingTx::default(),
            counters: Counters::default(),
        };
        space.load_free_extents()?;

        info!(
            "Loaded space: {} free extents, {} free blocks of {}",
            space.free_tree.len(),
            space.class.free_blocks(),
            df.usable_blocks()
        );
        Ok(space)
    }

    /// Release the in-memory indices and hand the pool back
    ///
    /// Aggregating extents are migrated first so the unmap callback sees
    /// them. An open transaction is aborted.
    pub fn unload(mut self) -> Result<Pool> {
        if self.pool.in_tx() {
            warn!("Unloading space with an open transaction, aborting it");
            self.tx_abort()?;
        }
        if self.total_reserved > 0 {
            warn!(
                "Unloading space with {} blocks still reserved",
                self.total_reserved
            );
        }

        self.flush()?;
        self.class.clear();
        self.free_tree.clear();
        self.arena.clear();
        self.hints.clear();

        info!("Unloaded space");
        Ok(self.pool)
    }

    /// Install the callback told about ranges leaving the aggregation buffer
    pub fn set_unmap(&mut self, unmap: UnmapFn) {
        self.unmap = Some(unmap);
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub fn config(&self) -> &VeaConfig {
        &self.config
    }

    pub fn df(&self) -> &SpaceDf {
        self.pool.df()
    }

    /// Blocks granted but neither published nor cancelled
    pub fn total_reserved(&self) -> u64 {
        self.total_reserved
    }

    fn now(&self) -> u64 {
        self.clock.now_secs()
    }

    pub fn in_tx(&self) -> bool {
        self.pool.in_tx()
    }

    pub fn tx_begin(&mut self) -> Result<()> {
        self.pool.tx_begin()
    }

    /// Commit the open transaction
    ///
    /// Published reservations stop counting as reserved and freed ranges
    /// enter the aggregation buffer. If the commit fails, the reservations
    /// published in it are cancelled and `TransactionAborted` is returned.
    pub fn tx_commit(&mut self) -> Result<()> {
        if !self.pool.in_tx() {
            return Err(VeaError::NoTransaction);
        }
        if let Err(err) = self.pool.tx_commit() {
            warn!("Transaction commit failed, cancelling its reservations: {}", err);
            self.abort_pending()?;
            return Err(VeaError::TransactionAborted(err.to_string()));
        }

        let pending = std::mem::take(&mut self.pending);
        for resrv in &pending.published {
            self.unreserve(resrv.block_count())?;
        }
        for (ext, flags) in pending.frees {
            self.compound_free(ext, flags)?;
        }
        debug!(
            "Committed {} reservations, {} blocks still reserved",
            pending.published.len(),
            self.total_reserved
        );
        Ok(())
    }

    /// Abort the open transaction, cancelling the reservations published in it
    pub fn tx_abort(&mut self) -> Result<()> {
        self.pool.tx_abort()?;
        self.abort_pending()
    }

    /// Run `f` in a transaction, committing on success and aborting on error
    pub fn transaction<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut SpaceInfo) -> Result<T>,
    {
        self.tx_begin()?;
        match f(self) {
            Ok(value) => {
                self.tx_commit()?;
                Ok(value)
            }
            Err(err) => {
                self.tx_abort()?;
                Err(err)
            }
        }
    }

    fn abort_pending(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        if !pending.published.is_empty() {
            debug!(
                "Returning {} reservations of an aborted transaction",
                pending.published.len()
            );
            self.release_grants(&pending.published)?;
        }
        Ok(())
    }

    /// Index a settled extent without merging
    fn insert_settled(&mut self, ext: FreeExtent) -> Result<EntryId> {
        let id = self.arena.alloc(FreeExtent::new(ext.offset, ext.block_count));
        if self.free_tree.insert(ext.offset, id).is_some() {
            return Err(VeaError::integrity(format!(
                "duplicate free extent at {}",
                ext.offset
            )));
        }
        self.class.classify(&mut self.arena, id)?;
        Ok(id)
    }

    /// Drop a settled entry from every index
    fn remove_settled(&mut self, id: EntryId) -> Result<FreeExtent> {
        self.class.remove(&mut self.arena, id)?;
        let ext = self.arena.get(id)?.ext;
        if self.free_tree.remove(&ext.offset) != Some(id) {
            return Err(VeaError::integrity(format!(
                "free extent at {} missing from offset tree",
                ext.offset
            )));
        }
        Ok(self.arena.release(id)?.ext)
    }

    /// Take the leading `count` blocks of a settled entry
    fn carve(&mut self, id: EntryId, count: u32) -> Result<FreeExtent> {
        let ext = self.arena.get(id)?.ext;
        if count == 0 || count > ext.block_count {
            return Err(VeaError::integrity(format!(
                "carving {} blocks from extent of {}",
                count, ext.block_count
            )));
        }

        self.class.remove(&mut self.arena, id)?;
        self.free_tree.remove(&ext.offset);

        let (head, rest) = ext.carve(count);
        match rest {
            Some(rest) => {
                self.arena.get_mut(id)?.ext = rest;
                self.free_tree.insert(rest.offset, id);
                self.class.classify(&mut self.arena, id)?;
            }
            None => {
                self.arena.release(id)?;
            }
        }
        Ok(head)
    }
}
