//! Secondary indexes
//!
//! One ordered map per user column, mapping column value to the rids of
//! every record holding that value. All non-key columns are indexed
//! automatically on insert; the key column is served by the table's rid
//! map directly and never carries an index here.

use crate::table::Rid;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Per-table secondary index set.
pub struct Index {
    /// One optional ordered map per user column. `None` = not indexed.
    indices: RwLock<Vec<Option<BTreeMap<u64, Vec<Rid>>>>>,
    /// Key column index; never indexed.
    key: usize,
}

impl Index {
    pub fn new(num_columns: usize, key: usize) -> Self {
        Self {
            indices: RwLock::new((0..num_columns).map(|_| None).collect()),
            key,
        }
    }

    /// Whether the column currently carries an index.
    pub fn is_indexed(&self, column: usize) -> bool {
        self.indices.read()[column].is_some()
    }

    /// Create an index on the column if absent.
    pub fn create_index(&self, column: usize) {
        let mut indices = self.indices.write();
        if indices[column].is_none() {
            indices[column] = Some(BTreeMap::new());
        }
    }

    /// Drop the column's index.
    pub fn drop_index(&self, column: usize) {
        self.indices.write()[column] = None;
    }

    /// Rids of every record with `value` in `column`. Empty when the
    /// column is unindexed or no record matches.
    pub fn locate(&self, column: usize, value: u64) -> Vec<Rid> {
        let indices = self.indices.read();
        match &indices[column] {
            Some(tree) => tree.get(&value).cloned().unwrap_or_default(),
            None => Vec::new(),
        }
    }

    /// Rids of every record whose `column` value lies in
    /// `[begin, end]`, inclusive. Concatenation order is unspecified.
    pub fn locate_range(&self, column: usize, begin: u64, end: u64) -> Vec<Rid> {
        let indices = self.indices.read();
        match &indices[column] {
            Some(tree) => tree.range(begin..=end).flat_map(|(_, rids)| rids.clone()).collect(),
            None => Vec::new(),
        }
    }

    /// Register a freshly inserted record. Every non-key column is
    /// indexed unconditionally, creating missing indexes on first touch
    /// and appending to multi-valued buckets.
    pub fn insert(&self, user_columns: &[u64], rid: Rid) {
        let mut indices = self.indices.write();
        for (column, &value) in user_columns.iter().enumerate() {
            if column == self.key {
                continue;
            }
            let tree = indices[column].get_or_insert_with(BTreeMap::new);
            tree.entry(value).or_default().push(rid);
        }
    }

    /// Unregister a deleted record from every indexed column, dropping
    /// buckets that empty out.
    pub fn remove(&self, user_columns: &[u64], rid: Rid) {
        let mut indices = self.indices.write();
        for (column, &value) in user_columns.iter().enumerate() {
            if column == self.key {
                continue;
            }
            if let Some(tree) = indices[column].as_mut() {
                if let Some(bucket) = tree.get_mut(&value) {
                    bucket.retain(|&r| r != rid);
                    if bucket.is_empty() {
                        tree.remove(&value);
                    }
                }
            }
        }
    }
}
