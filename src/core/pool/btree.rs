//! B+ tree keyed by block offset or record id
//!
//! Full B+ tree with:
//! - Node splitting on overflow
//! - Multi-level tree traversal
//! - All values in leaf nodes
//! - Doubly linked leaf nodes for ordered range scans and floor lookups

use crate::error::{Result, VeaError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::ops::{Bound, RangeBounds};

/// B-tree order (max entries per node)
pub const BTREE_ORDER: usize = 15;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum NodeType {
    Internal,
    Leaf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BTreeEntry<V> {
    pub key: u64,
    pub value: Option<V>,
    pub child_page: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BTreeNode<V> {
    pub node_type: NodeType,
    pub page_id: u64,
    pub entries: Vec<BTreeEntry<V>>,
    pub next_leaf: Option<u64>,
    pub prev_leaf: Option<u64>,
    pub parent: Option<u64>,
    /// For internal nodes: leftmost child pointer
    pub leftmost_child: Option<u64>,
}

impl<V: Clone> BTreeNode<V> {
    pub fn new_leaf(page_id: u64) -> Self {
        BTreeNode {
            node_type: NodeType::Leaf,
            page_id,
            entries: Vec::new(),
            next_leaf: None,
            prev_leaf: None,
            parent: None,
            leftmost_child: None,
        }
    }

    pub fn new_internal(page_id: u64) -> Self {
        BTreeNode {
            node_type: NodeType::Internal,
            ..Self::new_leaf(page_id)
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.node_type == NodeType::Leaf
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= BTREE_ORDER
    }

    pub fn find_key_index(&self, key: u64) -> std::result::Result<usize, usize> {
        self.entries.binary_search_by(|entry| entry.key.cmp(&key))
    }

    /// Child pages of an internal node, leftmost first
    pub fn children(&self) -> Vec<u64> {
        self.leftmost_child
            .into_iter()
            .chain(self.entries.iter().filter_map(|e| e.child_page))
            .collect()
    }

    /// Child to descend into for `key`
    fn route(&self, key: u64) -> Option<u64> {
        let idx = self.entries.partition_point(|e| e.key <= key);
        if idx == 0 {
            self.leftmost_child
        } else {
            self.entries[idx - 1].child_page
        }
    }

    /// Split this node into two, returning (median_key, new_right_node)
    pub fn split(&mut self, new_page_id: u64) -> (u64, BTreeNode<V>) {
        let mid = self.entries.len() / 2;
        let right_entries = self.entries.split_off(mid);
        let median_key = right_entries[0].key;

        let right_node = if self.is_leaf() {
            // Leaf split: median stays as the first key of the right leaf
            let mut node = BTreeNode::new_leaf(new_page_id);
            node.entries = right_entries;
            node.next_leaf = self.next_leaf;
            node.prev_leaf = Some(self.page_id);
            node.parent = self.parent;
            self.next_leaf = Some(new_page_id);
            node
        } else {
            // Internal split: promote median, don't duplicate
            let mut node = BTreeNode::new_internal(new_page_id);
            node.leftmost_child = right_entries[0].child_page;
            node.entries = right_entries[1..].to_vec();
            node.parent = self.parent;
            node
        };

        (median_key, right_node)
    }
}

/// B-tree structure with full operations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BTree<V> {
    root_page: u64,
    nodes: BTreeMap<u64, BTreeNode<V>>,
    next_page_id: u64,
    len: usize,
}

impl<V: Clone> BTree<V> {
    pub fn new(root_page: u64) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(root_page, BTreeNode::new_leaf(root_page));

        BTree {
            root_page,
            nodes,
            next_page_id: root_page + 1,
            len: 0,
        }
    }

    fn allocate_page(&mut self) -> u64 {
        let page_id = self.next_page_id;
        self.next_page_id += 1;
        page_id
    }

    fn get_node(&self, page_id: u64) -> Result<&BTreeNode<V>> {
        self.nodes
            .get(&page_id)
            .ok_or_else(|| VeaError::integrity(format!("B+ tree node {} not found", page_id)))
    }

    fn get_node_mut(&mut self, page_id: u64) -> Result<&mut BTreeNode<V>> {
        self.nodes
            .get_mut(&page_id)
            .ok_or_else(|| VeaError::integrity(format!("B+ tree node {} not found", page_id)))
    }

    /// Find the leaf node that should contain a key
    fn find_leaf(&self, key: u64) -> Result<u64> {
        let mut current_page = self.root_page;

        loop {
            let node = self.get_node(current_page)?;

            if node.is_leaf() {
                return Ok(current_page);
            }

            current_page = node.route(key).ok_or_else(|| {
                VeaError::integrity("Internal node missing child pointer")
            })?;
        }
    }

    /// Insert or replace, returning the previous value
    pub fn insert(&mut self, key: u64, value: V) -> Result<Option<V>> {
        let leaf_page = self.find_leaf(key)?;
        let leaf = self.get_node_mut(leaf_page)?;

        let idx = match leaf.find_key_index(key) {
            Ok(idx) => {
                return Ok(leaf.entries[idx].value.replace(value));
            }
            Err(idx) => idx,
        };

        leaf.entries.insert(
            idx,
            BTreeEntry {
                key,
                value: Some(value),
                child_page: None,
            },
        );
        let overflow = leaf.entries.len() > BTREE_ORDER;
        self.len += 1;

        if overflow {
            self.split_node(leaf_page)?;
        }

        Ok(None)
    }

    /// Split a node and propagate up the tree
    fn split_node(&mut self, page_id: u64) -> Result<()> {
        let new_page_id = self.allocate_page();

        let mut left_node = self.get_node(page_id)?.clone();
        let parent_page = left_node.parent;
        let (median_key, right_node) = left_node.split(new_page_id);

        if right_node.is_leaf() {
            if let Some(next) = right_node.next_leaf {
                self.get_node_mut(next)?.prev_leaf = Some(new_page_id);
            }
        } else {
            for child in right_node.children() {
                self.get_node_mut(child)?.parent = Some(new_page_id);
            }
        }

        self.nodes.insert(page_id, left_node);
        self.nodes.insert(new_page_id, right_node);

        match parent_page {
            Some(parent_id) => self.insert_into_parent(parent_id, median_key, new_page_id),
            None => self.create_new_root(page_id, median_key, new_page_id),
        }
    }

    /// Insert a separator into an internal node
    fn insert_into_parent(&mut self, parent_id: u64, key: u64, right_child: u64) -> Result<()> {
        let should_split = {
            let parent = self.get_node_mut(parent_id)?;
            let idx = match parent.find_key_index(key) {
                Ok(idx) | Err(idx) => idx,
            };
            parent.entries.insert(
                idx,
                BTreeEntry {
                    key,
                    value: None,
                    child_page: Some(right_child),
                },
            );
            parent.entries.len() > BTREE_ORDER
        };

        self.get_node_mut(right_child)?.parent = Some(parent_id);

        if should_split {
            self.split_node(parent_id)?;
        }

        Ok(())
    }

    /// Create new root when root splits
    fn create_new_root(&mut self, left_child: u64, median_key: u64, right_child: u64) -> Result<()> {
        let new_root_id = self.allocate_page();
        let mut new_root = BTreeNode::new_internal(new_root_id);

        new_root.leftmost_child = Some(left_child);
        new_root.entries.push(BTreeEntry {
            key: median_key,
            value: None,
            child_page: Some(right_child),
        });

        self.get_node_mut(left_child)?.parent = Some(new_root_id);
        self.get_node_mut(right_child)?.parent = Some(new_root_id);

        self.nodes.insert(new_root_id, new_root);
        self.root_page = new_root_id;

        Ok(())
    }

    /// Look up a key
    pub fn search(&self, key: u64) -> Result<Option<V>> {
        let leaf = self.get_node(self.find_leaf(key)?)?;
        Ok(match leaf.find_key_index(key) {
            Ok(idx) => leaf.entries[idx].value.clone(),
            Err(_) => None,
        })
    }

    /// Delete a key, returning its value
    pub fn delete(&mut self, key: u64) -> Result<Option<V>> {
        let leaf_page = self.find_leaf(key)?;
        let leaf = self.get_node_mut(leaf_page)?;

        match leaf.find_key_index(key) {
            Ok(idx) => {
                let entry = leaf.entries.remove(idx);
                self.len -= 1;
                Ok(entry.value)
            }
            Err(_) => Ok(None),
        }
    }

    /// Greatest entry with a key less than or equal to `key`
    pub fn floor(&self, key: u64) -> Result<Option<(u64, V)>> {
        let mut current = Some(self.find_leaf(key)?);
        let mut first = true;

        while let Some(page) = current {
            let leaf = self.get_node(page)?;
            let candidate = if first {
                let idx = leaf.entries.partition_point(|e| e.key <= key);
                idx.checked_sub(1).map(|i| &leaf.entries[i])
            } else {
                leaf.entries.last()
            };

            if let Some(entry) = candidate {
                if let Some(value) = &entry.value {
                    return Ok(Some((entry.key, value.clone())));
                }
            }

            first = false;
            current = leaf.prev_leaf;
        }

        Ok(None)
    }

    /// Smallest entry with a key greater than or equal to `key`
    pub fn ceiling(&self, key: u64) -> Result<Option<(u64, V)>> {
        Ok(self.range_limit(key.., 1)?.into_iter().next())
    }

    /// Ordered scan over a key range
    pub fn range<R: RangeBounds<u64>>(&self, range: R) -> Result<Vec<(u64, V)>> {
        self.range_limit(range, usize::MAX)
    }

    fn range_limit<R: RangeBounds<u64>>(&self, range: R, limit: usize) -> Result<Vec<(u64, V)>> {
        let start = match range.start_bound() {
            Bound::Included(&s) => s,
            Bound::Excluded(&s) => match s.checked_add(1) {
                Some(s) => s,
                None => return Ok(Vec::new()),
            },
            Bound::Unbounded => 0,
        };

        let mut results = Vec::new();
        let mut current = Some(self.find_leaf(start)?);

        while let Some(page) = current {
            let leaf = self.get_node(page)?;

            for entry in &leaf.entries {
                if entry.key < start {
                    continue;
                }
                let past_end = match range.end_bound() {
                    Bound::Included(&e) => entry.key > e,
                    Bound::Excluded(&e) => entry.key >= e,
                    Bound::Unbounded => false,
                };
                if past_end || results.len() >= limit {
                    return Ok(results);
                }
                if let Some(value) = &entry.value {
                    results.push((entry.key, value.clone()));
                }
            }

            current = leaf.next_leaf;
        }

        Ok(results)
    }

    /// All entries in key order
    pub fn entries(&self) -> Result<Vec<(u64, V)>> {
        self.range(..)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn root_page(&self) -> u64 {
        self.root_page
    }

    /// Get tree height (for testing/debugging)
    pub fn height(&self) -> usize {
        let mut current = self.root_page;
        let mut height = 1;

        while let Ok(node) = self.get_node(current) {
            if node.is_leaf() {
                break;
            }
            height += 1;
            current = node.leftmost_child.unwrap_or(self.root_page);
        }

        height
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_split() {
        let mut node: BTreeNode<u32> = BTreeNode::new_leaf(1);

        for i in 0..16u64 {
            node.entries.push(BTreeEntry {
                key: i * 10,
                value: Some(i as u32),
                child_page: None,
            });
        }

        let (median, right) = node.split(2);

        assert!(node.entries.len() < 16);
        assert!(!right.entries.is_empty());
        assert_eq!(median, right.entries[0].key);
        assert_eq!(right.page_id, 2);
        assert_eq!(right.prev_leaf, Some(1));
        assert_eq!(node.next_leaf, Some(2));
    }

    #[test]
    fn test_btree_insert_many() {
        let mut btree = BTree::new(1);

        for i in 0..500u64 {
            assert!(btree.insert(i * 8, i).unwrap().is_none());
        }
        assert_eq!(btree.len(), 500);

        for i in 0..500u64 {
            assert_eq!(btree.search(i * 8).unwrap(), Some(i));
        }
        assert_eq!(btree.search(3).unwrap(), None);
    }

    #[test]
    fn test_insert_replaces_existing() {
        let mut btree = BTree::new(1);
        btree.insert(7, "a").unwrap();
        assert_eq!(btree.insert(7, "b").unwrap(), Some("a"));
        assert_eq!(btree.len(), 1);
        assert_eq!(btree.search(7).unwrap(), Some("b"));
    }

    #[test]
    fn test_btree_height_growth() {
        let mut btree = BTree::new(1);
        assert_eq!(btree.height(), 1);

        for i in 0..300u64 {
            btree.insert(i, ()).unwrap();
        }

        assert!(btree.height() >= 3);
    }

    #[test]
    fn test_reverse_insert_order_keeps_parents_consistent() {
        let mut btree = BTree::new(1);
        for i in (0..1000u64).rev() {
            btree.insert(i, i).unwrap();
        }
        let keys: Vec<u64> = btree.entries().unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, (0..1000).collect::<Vec<_>>());
        for i in 0..1000u64 {
            assert_eq!(btree.search(i).unwrap(), Some(i));
        }
    }

    #[test]
    fn test_btree_delete_many() {
        let mut btree = BTree::new(1);

        for i in 0..50u64 {
            btree.insert(i, i).unwrap();
        }

        for i in (0..50u64).step_by(2) {
            assert_eq!(btree.delete(i).unwrap(), Some(i));
        }
        assert_eq!(btree.delete(0).unwrap(), None);
        assert_eq!(btree.len(), 25);

        for i in 0..50u64 {
            let result = btree.search(i).unwrap();
            assert_eq!(result.is_some(), i % 2 == 1);
        }
    }

    #[test]
    fn test_range_across_leaves() {
        let mut btree = BTree::new(1);
        for i in 0..100u64 {
            btree.insert(i * 2, i).unwrap();
        }

        let results = btree.range(10..20).unwrap();
        let keys: Vec<u64> = results.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![10, 12, 14, 16, 18]);

        let results = btree.range(190..=198).unwrap();
        assert_eq!(results.len(), 5);

        assert!(btree.range(1000..).unwrap().is_empty());
    }

    #[test]
    fn test_floor_and_ceiling() {
        let mut btree = BTree::new(1);
        for i in 1..=200u64 {
            btree.insert(i * 10, i).unwrap();
        }

        assert_eq!(btree.floor(5).unwrap(), None);
        assert_eq!(btree.floor(10).unwrap(), Some((10, 1)));
        assert_eq!(btree.floor(1234).unwrap(), Some((1230, 123)));
        assert_eq!(btree.floor(u64::MAX).unwrap(), Some((2000, 200)));

        assert_eq!(btree.ceiling(0).unwrap(), Some((10, 1)));
        assert_eq!(btree.ceiling(1231).unwrap(), Some((1240, 124)));
        assert_eq!(btree.ceiling(2001).unwrap(), None);
    }

    #[test]
    fn test_floor_skips_emptied_leaves() {
        let mut btree = BTree::new(1);
        for i in 0..200u64 {
            btree.insert(i, i).unwrap();
        }
        for i in 50..150u64 {
            btree.delete(i).unwrap();
        }

        assert_eq!(btree.floor(120).unwrap(), Some((49, 49)));
        assert_eq!(btree.ceiling(60).unwrap(), Some((150, 150)));
    }
}
