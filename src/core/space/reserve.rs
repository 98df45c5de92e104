//! Reservation paths
//!
//! A reservation takes blocks out of the in-memory indices only. It stays
//! exclusively held by the caller until it is published in a transaction,
//! which makes the allocation durable, or cancelled, which returns the
//! blocks and rolls the hint back.

use super::hint::HINT_OFF_INVALID;
use super::SpaceInfo;
use crate::error::{Result, VeaError};
use crate::extent::{ExtentVector, FreeExtent};
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationState {
    Granted,
    Published,
    Cancelled,
}

/// Blocks backing a reservation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Grant {
    Single(FreeExtent),
    Vector(ExtentVector),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    grant: Grant,
    /// Stream whose hint served or was moved by the reservation
    hint: Option<u64>,
    /// Hint offset before the reservation
    hint_off: u64,
    hint_seq: u64,
    vector_id: Option<u64>,
    state: ReservationState,
}

impl Reservation {
    pub fn grant(&self) -> &Grant {
        &self.grant
    }

    pub fn extents(&self) -> &[FreeExtent] {
        match &self.grant {
            Grant::Single(ext) => std::slice::from_ref(ext),
            Grant::Vector(vector) => &vector.extents,
        }
    }

    /// Offset of the first block granted
    pub fn offset(&self) -> u64 {
        self.extents().first().map_or(0, |e| e.offset)
    }

    pub fn block_count(&self) -> u64 {
        self.extents()
            .iter()
            .map(|e| u64::from(e.block_count))
            .sum()
    }

    pub fn is_vector(&self) -> bool {
        matches!(self.grant, Grant::Vector(_))
    }

    pub fn state(&self) -> ReservationState {
        self.state
    }

    pub fn hint(&self) -> Option<u64> {
        self.hint
    }

    pub fn hint_seq(&self) -> u64 {
        self.hint_seq
    }

    /// Id of the published vector record
    pub fn vector_id(&self) -> Option<u64> {
        self.vector_id
    }

    /// First block past the last extent
    fn frontier(&self) -> u64 {
        self.extents().last().map_or(HINT_OFF_INVALID, |e| e.end())
    }
}

fn ensure_granted(resrvs: &[Reservation]) -> Result<()> {
    match resrvs
        .iter()
        .find(|r| r.state != ReservationState::Granted)
    {
        Some(r) => Err(VeaError::invalid(format!(
            "reservation at {} is {:?}, not granted",
            r.offset(),
            r.state
        ))),
        None => Ok(()),
    }
}

fn mark(resrvs: &mut [Reservation], state: ReservationState) {
    for resrv in resrvs {
        resrv.state = state;
    }
}

/// Per-stream hint window of a batch: the reservations holding the lowest
/// and the highest sequence
fn hint_windows(resrvs: &[Reservation]) -> BTreeMap<u64, (&Reservation, &Reservation)> {
    let mut windows: BTreeMap<u64, (&Reservation, &Reservation)> = BTreeMap::new();
    for resrv in resrvs {
        let stream = match resrv.hint {
            Some(stream) => stream,
            None => continue,
        };
        let window = windows.entry(stream).or_insert((resrv, resrv));
        if resrv.hint_seq < window.0.hint_seq {
            window.0 = resrv;
        }
        if resrv.hint_seq > window.1.hint_seq {
            window.1 = resrv;
        }
    }
    windows
}

impl SpaceInfo {
    /// Reserve `block_count` blocks, near the stream's hint when one is given
    ///
    /// Tries the hint, then the large heap or the small size classes, then
    /// an extent vector. The blocks are held until the reservation is
    /// published or cancelled.
    pub fn reserve(&mut self, block_count: u32, hint: Option<u64>) -> Result<Reservation> {
        if block_count == 0 {
            return Err(VeaError::invalid("cannot reserve zero blocks"));
        }

        self.migrate_free_exts(false)?;

        let hint_off = match hint {
            Some(stream) => self.hint_context(stream)?.offset,
            None => HINT_OFF_INVALID,
        };

        let grant = match self.reserve_single(block_count, hint_off)? {
            Some(ext) => Grant::Single(ext),
            None => match self.reserve_vector(block_count)? {
                Some(vector) => {
                    self.counters.resrv_vector += 1;
                    Grant::Vector(vector)
                }
                None => {
                    debug!(
                        "Cannot reserve {} blocks, {} free in the index",
                        block_count,
                        self.class.free_blocks()
                    );
                    return Err(VeaError::OutOfSpace {
                        requested: u64::from(block_count),
                    });
                }
            },
        };

        let mut resrv = Reservation {
            grant,
            hint,
            hint_off,
            hint_seq: 0,
            vector_id: None,
            state: ReservationState::Granted,
        };
        if let Some(stream) = hint {
            resrv.hint_seq = self.hint_update(stream, resrv.frontier())?;
        }
        self.total_reserved += u64::from(block_count);

        debug!(
            "Reserved {} blocks at {} ({} extents)",
            block_count,
            resrv.offset(),
            resrv.extents().len()
        );
        Ok(resrv)
    }

    fn reserve_single(&mut self, block_count: u32, hint_off: u64) -> Result<Option<FreeExtent>> {
        if hint_off != HINT_OFF_INVALID {
            if let Some(ext) = self.reserve_hint(hint_off, block_count)? {
                self.counters.resrv_hint += 1;
                return Ok(Some(ext));
            }
        }

        if block_count < self.class.large_thresh() {
            if let Some(ext) = self.reserve_small(block_count)? {
                self.counters.resrv_small += 1;
                return Ok(Some(ext));
            }
        }

        let ext = self.reserve_large(block_count)?;
        if ext.is_some() {
            self.counters.resrv_large += 1;
        }
        Ok(ext)
    }

    /// Carve from the settled extent starting exactly at `offset`
    pub(crate) fn reserve_hint(&mut self, offset: u64, block_count: u32) -> Result<Option<FreeExtent>> {
        let id = match self.free_tree.get(&offset) {
            Some(&id) => id,
            None => return Ok(None),
        };

        let entry = self.arena.get(id)?;
        if !entry.member.is_settled() || entry.ext.block_count < block_count {
            return Ok(None);
        }
        self.carve(id, block_count).map(Some)
    }

    /// Carve from the largest extent
    pub(crate) fn reserve_large(&mut self, block_count: u32) -> Result<Option<FreeExtent>> {
        match self.class.pick_large(block_count) {
            Some(id) => self.carve(id, block_count).map(Some),
            None => Ok(None),
        }
    }

    /// Carve from the oldest adequate small extent
    pub(crate) fn reserve_small(&mut self, block_count: u32) -> Result<Option<FreeExtent>> {
        match self.class.pick_small(&self.arena, block_count)? {
            Some(id) => self.carve(id, block_count).map(Some),
            None => Ok(None),
        }
    }

    /// Gather several extents adding up to `block_count`
    pub(crate) fn reserve_vector(&mut self, block_count: u32) -> Result<Option<ExtentVector>> {
        let max_pieces = match self.config.max_vector_extents {
            0 => usize::MAX,
            max => max as usize,
        };
        if !self
            .class
            .pick_vector(&self.arena, u64::from(block_count), max_pieces)?
        {
            return Ok(None);
        }

        let picked = std::mem::take(&mut self.class.cursor.entries);
        let mut vector = ExtentVector::new();
        let mut remaining = block_count;
        for &id in &picked {
            let count = self.arena.get(id)?.ext.block_count.min(remaining);
            vector.push(self.carve(id, count)?);
            remaining -= count;
        }
        self.class.cursor.entries = picked;
        self.class.cursor.reset();

        Ok(Some(vector))
    }

    /// Return granted reservations to the free indices
    ///
    /// Every reservation must still be granted. Hints are rolled back per
    /// stream to where the earliest reservation of the batch found them.
    pub fn cancel(&mut self, resrvs: &mut [Reservation]) -> Result<()> {
        ensure_granted(resrvs)?;
        self.release_grants(resrvs)?;
        mark(resrvs, ReservationState::Cancelled);
        Ok(())
    }

    pub(crate) fn release_grants(&mut self, resrvs: &[Reservation]) -> Result<()> {
        for resrv in resrvs {
            for ext in resrv.extents() {
                self.compound_free(FreeExtent::new(ext.offset, ext.block_count), 0)?;
            }
            self.unreserve(resrv.block_count())?;
        }

        for (stream, (first, last)) in hint_windows(resrvs) {
            self.hint_cancel(stream, first.hint_off, first.hint_seq, last.hint_seq)?;
        }
        Ok(())
    }

    pub(crate) fn unreserve(&mut self, block_count: u64) -> Result<()> {
        self.total_reserved = self.total_reserved.checked_sub(block_count).ok_or_else(|| {
            VeaError::integrity(format!(
                "releasing {} blocks with only {} reserved",
                block_count, self.total_reserved
            ))
        })?;
        Ok(())
    }

    /// Make reservations durable in the open transaction
    ///
    /// Blocks leave the persistent free table, vectors get a record and the
    /// hints are persisted. If the transaction aborts, the reservations are
    /// returned to free space by the abort.
    pub fn tx_publish(&mut self, resrvs: &mut [Reservation]) -> Result<()> {
        if !self.pool.in_tx() {
            return Err(VeaError::NoTransaction);
        }
        ensure_granted(resrvs)?;

        mark(resrvs, ReservationState::Published);
        self.pending.published.extend(resrvs.iter().cloned());

        for resrv in resrvs.iter_mut() {
            match &resrv.grant {
                Grant::Single(ext) => self.persistent_alloc(ext.offset, ext.block_count)?,
                Grant::Vector(vector) => {
                    let id = self.compound_vec_alloc(vector)?;
                    resrv.vector_id = Some(id);
                }
            }
        }

        for (stream, (first, last)) in hint_windows(resrvs) {
            self.hint_tx_publish(stream, last.frontier(), first.hint_seq, last.hint_seq)?;
        }
        Ok(())
    }

    /// Publish reservations in a transaction of their own
    ///
    /// On failure the reservations end up cancelled; a failed commit is
    /// reported as `TransactionAborted`.
    pub fn publish(&mut self, resrvs: &mut [Reservation]) -> Result<()> {
        ensure_granted(resrvs)?;
        self.tx_begin()?;

        if let Err(err) = self.tx_publish(resrvs) {
            self.tx_abort()?;
            mark(resrvs, ReservationState::Cancelled);
            return Err(err);
        }

        if let Err(err) = self.tx_commit() {
            mark(resrvs, ReservationState::Cancelled);
            return Err(err);
        }
        Ok(())
    }
}
