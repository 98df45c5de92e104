//! Allocation hints
//!
//! A hint remembers where the last reservation of an I/O stream ended so
//! the next one can continue right after it. Every reservation through a
//! hint bumps its sequence number; cancel only rolls the hint back while
//! no later reservation has moved it on.

use super::SpaceInfo;
use crate::error::{Result, VeaError};
use crate::pool::HintRecord;
use tracing::debug;

/// Hint offset meaning "no locality known"
pub const HINT_OFF_INVALID: u64 = 0;

/// In-memory state of one stream's hint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HintContext {
    pub stream: u64,
    pub offset: u64,
    pub seq: u64,
}

impl SpaceInfo {
    /// Load a stream's hint from its persistent record
    ///
    /// Streams without a record start at [`HINT_OFF_INVALID`], sequence 0.
    /// The context stays resident until [`SpaceInfo::hint_unload`].
    pub fn hint_load(&mut self, stream: u64) -> Result<HintContext> {
        let record = self.pool.hint_table().search(stream)?.unwrap_or_default();
        let ctx = HintContext {
            stream,
            offset: record.offset,
            seq: record.seq,
        };
        self.hints.insert(stream, ctx);
        Ok(ctx)
    }

    /// Drop a stream's in-memory hint
    ///
    /// Contexts are never evicted on their own, so callers must unload
    /// streams they stop using. The persistent record is kept and a later
    /// reservation on the stream reloads it.
    pub fn hint_unload(&mut self, stream: u64) -> Option<HintContext> {
        self.hints.remove(&stream)
    }

    pub(crate) fn hint_context(&mut self, stream: u64) -> Result<HintContext> {
        match self.hints.get(&stream) {
            Some(ctx) => Ok(*ctx),
            None => self.hint_load(stream),
        }
    }

    /// Offset the stream's next reservation should start at
    pub fn hint_get(&self, stream: u64) -> u64 {
        self.hints
            .get(&stream)
            .map_or(HINT_OFF_INVALID, |ctx| ctx.offset)
    }

    pub fn hint_seq(&self, stream: u64) -> Option<u64> {
        self.hints.get(&stream).map(|ctx| ctx.seq)
    }

    /// Move the hint to `offset`, returning the new sequence number
    pub fn hint_update(&mut self, stream: u64, offset: u64) -> Result<u64> {
        self.hint_context(stream)?;
        let ctx = self
            .hints
            .get_mut(&stream)
            .ok_or_else(|| VeaError::integrity(format!("hint {} vanished", stream)))?;
        ctx.offset = offset;
        ctx.seq += 1;
        Ok(ctx.seq)
    }

    /// Roll the hint back to `offset` if its sequence is within
    /// `[seq_min, seq_max]`
    ///
    /// Outside the window a later reservation owns the hint and the call
    /// does nothing.
    pub fn hint_cancel(&mut self, stream: u64, offset: u64, seq_min: u64, seq_max: u64) -> Result<()> {
        if seq_min > seq_max {
            return Err(VeaError::invalid(format!(
                "hint sequence window {}..={} is empty",
                seq_min, seq_max
            )));
        }

        let ctx = match self.hints.get_mut(&stream) {
            Some(ctx) => ctx,
            None => return Ok(()),
        };

        if (seq_min..=seq_max).contains(&ctx.seq) {
            ctx.offset = offset;
            ctx.seq = seq_min.saturating_sub(1);
        } else {
            debug!(
                "Hint {} at seq {} moved past cancel window {}..={}",
                stream, ctx.seq, seq_min, seq_max
            );
        }
        Ok(())
    }

    /// Persist the hint in the open transaction
    ///
    /// A record already holding `seq_max` or later is left alone.
    pub fn hint_tx_publish(&mut self, stream: u64, offset: u64, seq_min: u64, seq_max: u64) -> Result<()> {
        if seq_min > seq_max {
            return Err(VeaError::invalid(format!(
                "hint sequence window {}..={} is empty",
                seq_min, seq_max
            )));
        }

        let table = self.pool.hint_table_mut()?;
        if let Some(current) = table.search(stream)? {
            if current.seq >= seq_max {
                return Ok(());
            }
        }
        table.insert(
            stream,
            HintRecord {
                offset,
                seq: seq_max,
            },
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::space;
    use super::*;

    #[test]
    fn test_unknown_stream_is_invalid() {
        let (mut space, _) = space(100);
        assert_eq!(space.hint_get(7), HINT_OFF_INVALID);
        let ctx = space.hint_load(7).unwrap();
        assert_eq!(ctx.offset, HINT_OFF_INVALID);
        assert_eq!(ctx.seq, 0);
    }

    #[test]
    fn test_update_bumps_sequence() {
        let (mut space, _) = space(100);
        assert_eq!(space.hint_update(1, 10).unwrap(), 1);
        assert_eq!(space.hint_update(1, 20).unwrap(), 2);
        assert_eq!(space.hint_get(1), 20);
    }

    #[test]
    fn test_cancel_window() {
        let (mut space, _) = space(100);
        for i in 1..=5 {
            space.hint_update(3, i * 10).unwrap();
        }
        assert_eq!(space.hint_seq(3), Some(5));

        space.hint_cancel(3, 1, 1, 4).unwrap();
        assert_eq!(space.hint_get(3), 50);
        assert_eq!(space.hint_seq(3), Some(5));

        space.hint_cancel(3, 1, 1, 5).unwrap();
        assert_eq!(space.hint_get(3), 1);
        assert_eq!(space.hint_seq(3), Some(0));
    }

    #[test]
    fn test_cancel_rejects_inverted_window() {
        let (mut space, _) = space(100);
        assert!(matches!(
            space.hint_cancel(3, 1, 5, 4),
            Err(VeaError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_tx_publish_keeps_newer_record() {
        let (mut space, _) = space(100);
        space.tx_begin().unwrap();
        space.hint_tx_publish(9, 40, 3, 4).unwrap();
        space.hint_tx_publish(9, 20, 1, 2).unwrap();
        space.tx_commit().unwrap();

        space.hint_unload(9);
        let ctx = space.hint_load(9).unwrap();
        assert_eq!((ctx.offset, ctx.seq), (40, 4));
    }

    #[test]
    fn test_unload_drops_context_but_keeps_record() {
        let (mut space, _) = space(100);
        let mut resrv = [space.reserve(10, Some(4)).unwrap()];
        space.publish(&mut resrv).unwrap();
        let frontier = resrv[0].offset() + 10;

        let ctx = space.hint_unload(4).unwrap();
        assert_eq!((ctx.offset, ctx.seq), (frontier, 1));
        assert_eq!(space.hint_get(4), HINT_OFF_INVALID);
        assert_eq!(space.hint_seq(4), None);
        assert_eq!(space.hint_unload(4), None);

        // Reserving on the stream brings the record back
        let next = space.reserve(5, Some(4)).unwrap();
        assert_eq!(next.offset(), frontier);
        assert_eq!(space.hint_seq(4), Some(2));
    }

    #[test]
    fn test_tx_publish_needs_transaction() {
        let (mut space, _) = space(100);
        assert!(matches!(
            space.hint_tx_publish(1, 1, 1, 1),
            Err(VeaError::NoTransaction)
        ));
    }

    #[test]
    fn test_aborted_publish_leaves_record() {
        let (mut space, _) = space(100);
        space.tx_begin().unwrap();
        space.hint_tx_publish(2, 30, 1, 1).unwrap();
        space.tx_abort().unwrap();
        assert_eq!(space.pool().hint_table().search(2).unwrap(), None);
    }
}
