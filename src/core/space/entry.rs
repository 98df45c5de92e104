//! Arena of free-extent entries
//!
//! Every in-memory index refers to entries by [`EntryId`]; the arena owns
//! the extents themselves.

use crate::error::{Result, VeaError};
use crate::extent::FreeExtent;

/// Stable handle of an arena slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(u32);

impl EntryId {
    fn index(self) -> usize {
        self.0 as usize
    }
}

/// Which structure currently holds an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Membership {
    /// Allocated in the arena but not yet classified
    Detached,
    /// Large-extent max-heap
    Heap,
    /// Small-extent LRU of the given size class
    SizeClass(usize),
    /// Aggregation buffer, waiting to be merged
    Aggregating,
}

impl Membership {
    /// Settled entries may be carved and merged with
    pub fn is_settled(&self) -> bool {
        matches!(self, Membership::Heap | Membership::SizeClass(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub ext: FreeExtent,
    pub member: Membership,
}

#[derive(Debug, Default)]
pub struct EntryArena {
    slots: Vec<Option<Entry>>,
    free_slots: Vec<u32>,
    live: usize,
}

impl EntryArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, ext: FreeExtent) -> EntryId {
        let entry = Entry {
            ext,
            member: Membership::Detached,
        };
        self.live += 1;

        if let Some(slot) = self.free_slots.pop() {
            self.slots[slot as usize] = Some(entry);
            return EntryId(slot);
        }

        self.slots.push(Some(entry));
        EntryId((self.slots.len() - 1) as u32)
    }

    /// Return a detached entry's slot to the arena
    pub fn release(&mut self, id: EntryId) -> Result<Entry> {
        let slot = self
            .slots
            .get_mut(id.index())
            .ok_or_else(|| VeaError::integrity(format!("entry {:?} out of range", id)))?;

        let member = match slot {
            Some(entry) => entry.member,
            None => {
                return Err(VeaError::integrity(format!(
                    "entry {:?} already released",
                    id
                )))
            }
        };
        if member != Membership::Detached {
            return Err(VeaError::integrity(format!(
                "releasing entry {:?} still held by {:?}",
                id, member
            )));
        }

        let entry = slot
            .take()
            .ok_or_else(|| VeaError::integrity("slot vanished"))?;
        self.free_slots.push(id.0);
        self.live -= 1;
        Ok(entry)
    }

    pub fn get(&self, id: EntryId) -> Result<&Entry> {
        self.slots
            .get(id.index())
            .and_then(|slot| slot.as_ref())
            .ok_or_else(|| VeaError::integrity(format!("dangling entry {:?}", id)))
    }

    pub fn get_mut(&mut self, id: EntryId) -> Result<&mut Entry> {
        self.slots
            .get_mut(id.index())
            .and_then(|slot| slot.as_mut())
            .ok_or_else(|| VeaError::integrity(format!("dangling entry {:?}", id)))
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (EntryId, &Entry)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| slot.as_ref().map(|e| (EntryId(i as u32), e)))
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.free_slots.clear();
        self.live = 0;
    }
}
