//! Transactional table: a B+ tree plus an undo log
//!
//! Every mutation made while a transaction is open records how to reverse
//! it. Commit forgets the log; abort replays it backwards.

use super::btree::BTree;
use crate::error::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
enum Undo<V> {
    /// Key was inserted, replacing `prev` if it existed
    Inserted(u64, Option<V>),
    /// Key was deleted, holding `value`
    Deleted(u64, V),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound(serialize = "V: Serialize", deserialize = "V: Deserialize<'de>"))]
pub struct TxTable<V> {
    tree: BTree<V>,
    #[serde(skip)]
    undo: Vec<Undo<V>>,
}

impl<V: Clone> TxTable<V> {
    pub fn new() -> Self {
        TxTable {
            tree: BTree::new(1),
            undo: Vec::new(),
        }
    }

    pub fn insert(&mut self, key: u64, value: V) -> Result<Option<V>> {
        let prev = self.tree.insert(key, value)?;
        self.undo.push(Undo::Inserted(key, prev.clone()));
        Ok(prev)
    }

    pub fn delete(&mut self, key: u64) -> Result<Option<V>> {
        let removed = self.tree.delete(key)?;
        if let Some(value) = &removed {
            self.undo.push(Undo::Deleted(key, value.clone()));
        }
        Ok(removed)
    }

    pub fn search(&self, key: u64) -> Result<Option<V>> {
        self.tree.search(key)
    }

    pub fn floor(&self, key: u64) -> Result<Option<(u64, V)>> {
        self.tree.floor(key)
    }

    pub fn ceiling(&self, key: u64) -> Result<Option<(u64, V)>> {
        self.tree.ceiling(key)
    }

    pub fn range<R: std::ops::RangeBounds<u64>>(&self, range: R) -> Result<Vec<(u64, V)>> {
        self.tree.range(range)
    }

    pub fn entries(&self) -> Result<Vec<(u64, V)>> {
        self.tree.entries()
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn has_pending(&self) -> bool {
        !self.undo.is_empty()
    }

    pub(crate) fn commit(&mut self) {
        self.undo.clear();
    }

    /// Revert every mutation since the last commit
    pub(crate) fn rollback(&mut self) -> Result<()> {
        while let Some(undo) = self.undo.pop() {
            match undo {
                Undo::Inserted(key, Some(prev)) => {
                    self.tree.insert(key, prev)?;
                }
                Undo::Inserted(key, None) => {
                    self.tree.delete(key)?;
                }
                Undo::Deleted(key, value) => {
                    self.tree.insert(key, value)?;
                }
            }
        }
        Ok(())
    }
}

impl<V: Clone> Default for TxTable<V> {
    fn default() -> Self {
        Self::new()
    }
}
