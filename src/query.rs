//! Query layer: insert, versioned reads, updates, aggregation
//!
//! Thin compositions over the table's read/update primitives. Expected
//! failures (unknown key, duplicate insert, rejected key change) return
//! `Ok(false)` or an empty list; `Err` is reserved for I/O and
//! corruption faults.

use crate::config::{
    INDIRECTION_COLUMN, INDIRECTION_UNSET, METADATA_COLUMNS, SCHEMA_ENCODING_COLUMN,
};
use crate::table::{decode_schema, encode_schema, indirection_of, Rid, Table};
use crate::Result;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// A reconstructed logical record. Unprojected columns are `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub rid: Rid,
    pub key: u64,
    pub columns: Vec<Option<u64>>,
}

pub struct Query {
    table: Arc<Table>,
}

impl Query {
    pub fn new(table: Arc<Table>) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &Arc<Table> {
        &self.table
    }

    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    /// Insert a record. Rejects duplicate keys and malformed rows.
    pub fn insert(&self, columns: &[u64]) -> Result<bool> {
        if columns.len() != self.table.num_columns() {
            return Ok(false);
        }
        let key = columns[self.table.key()];

        let _guard = self.table.insert_guard();
        if self.table.contains_key(key) {
            return Ok(false);
        }

        let (rid, seq) = self.table.allocate_base();
        let mut row = vec![INDIRECTION_UNSET, rid, Self::now(), 0, rid];
        row.extend_from_slice(columns);
        self.table.insert_base_record(seq, &row)?;
        Ok(true)
    }

    /// Rids matching `search_key` in `search_column`: the rid map for
    /// the key column, the secondary index where one exists, and a full
    /// scan otherwise.
    fn resolve_rids(&self, search_key: u64, search_column: usize) -> Result<Vec<Rid>> {
        if search_column == self.table.key() {
            Ok(self.table.rid_for_key(search_key).into_iter().collect())
        } else if self.table.index().is_indexed(search_column) {
            Ok(self.table.index().locate(search_column, search_key))
        } else {
            self.table.rid_lookup(search_column, search_key)
        }
    }

    /// Current logical user-column values for a base row: base values
    /// with the newest tail's values substituted wherever the merged
    /// schema mask marks a column modified.
    fn current_values(&self, base_row: &[u64]) -> Result<Vec<u64>> {
        let num_columns = self.table.num_columns();
        let mut values = base_row[METADATA_COLUMNS..].to_vec();

        if let Some(tail_rid) = indirection_of(base_row) {
            let tail = self.table.find_record(tail_rid)?;
            // The mask comes from the tail row itself: tail rows are
            // immutable once linked, so mask and values never tear.
            let schema = decode_schema(tail[SCHEMA_ENCODING_COLUMN], num_columns);
            for (column, modified) in schema.into_iter().enumerate() {
                if modified {
                    values[column] = tail[METADATA_COLUMNS + column];
                }
            }
        }
        Ok(values)
    }

    /// Walk the indirection chain to the row holding the requested
    /// relative version: 0 is the newest version, each step toward
    /// negative offsets moves one version older. The walk stops at the
    /// base row when the chain ends before the requested depth.
    fn version_row(
        &self,
        base_rid: Rid,
        base_row: &[u64],
        relative_version: i64,
    ) -> Result<(Rid, Vec<u64>)> {
        let newest = match indirection_of(base_row) {
            Some(rid) => rid,
            None => return Ok((base_rid, base_row.to_vec())),
        };

        let mut cursor = newest;
        let mut row = self.table.find_record(newest)?;
        let mut remaining = relative_version;
        while remaining < 0 {
            if cursor == base_rid {
                break;
            }
            match indirection_of(&row) {
                Some(older) => {
                    cursor = older;
                    row = self.table.find_record(older)?;
                    remaining += 1;
                }
                None => break,
            }
        }
        Ok((cursor, row))
    }

    /// User-column values of one version: base values with the version
    /// row's schema-masked columns substituted.
    fn version_values(&self, base_rid: Rid, base_row: &[u64], version_rid: Rid, version_row: &[u64]) -> Vec<u64> {
        let num_columns = self.table.num_columns();
        let mut values = base_row[METADATA_COLUMNS..].to_vec();
        if version_rid != base_rid {
            let schema = decode_schema(version_row[SCHEMA_ENCODING_COLUMN], num_columns);
            for (column, modified) in schema.into_iter().enumerate() {
                if modified {
                    values[column] = version_row[METADATA_COLUMNS + column];
                }
            }
        }
        values
    }

    fn project(values: Vec<u64>, projection: &[bool]) -> Vec<Option<u64>> {
        values
            .into_iter()
            .zip(projection)
            .map(|(value, &keep)| keep.then_some(value))
            .collect()
    }

    /// Read the current version of every record matching the search
    /// key. Returns an empty list when nothing matches.
    pub fn select(
        &self,
        search_key: u64,
        search_column: usize,
        projection: &[bool],
    ) -> Result<Vec<Record>> {
        let mut results = Vec::new();
        for rid in self.resolve_rids(search_key, search_column)? {
            let base_row = self.table.find_record(rid)?;
            let values = self.current_values(&base_row)?;
            results.push(Record {
                rid,
                key: search_key,
                columns: Self::project(values, projection),
            });
        }
        Ok(results)
    }

    /// Read a past version of every matching record. `relative_version`
    /// is 0 for the newest version, -1 for the one before, and so on;
    /// offsets deeper than the chain resolve to the base version.
    pub fn select_version(
        &self,
        search_key: u64,
        search_column: usize,
        projection: &[bool],
        relative_version: i64,
    ) -> Result<Vec<Record>> {
        let mut results = Vec::new();
        for rid in self.resolve_rids(search_key, search_column)? {
            let base_row = self.table.find_record(rid)?;
            let (version_rid, version_row) = self.version_row(rid, &base_row, relative_version)?;
            let values = self.version_values(rid, &base_row, version_rid, &version_row);
            results.push(Record {
                rid: version_rid,
                key: search_key,
                columns: Self::project(values, projection),
            });
        }
        Ok(results)
    }

    /// Append a new version for the keyed record. `None` columns keep
    /// their prior value. Any explicit value for the key column is
    /// rejected: key changes are forbidden whether or not the new value
    /// collides with an existing key.
    pub fn update(&self, primary_key: u64, columns: &[Option<u64>]) -> Result<bool> {
        if columns.len() != self.table.num_columns() {
            return Ok(false);
        }
        if columns[self.table.key()].is_some() {
            return Ok(false);
        }

        let _guard = self.table.update_guard();
        let base_rid = match self.table.rid_for_key(primary_key) {
            Some(rid) => rid,
            None => return Ok(false),
        };
        let base_addr = match self.table.address_of(base_rid) {
            Some(addr) => addr,
            None => return Ok(false),
        };
        let base_row = self.table.find_record(base_rid)?;

        let num_columns = self.table.num_columns();
        let mut schema = vec![false; num_columns];
        let mut values = vec![0u64; num_columns];
        let chain_rid;

        match indirection_of(&base_row) {
            None => {
                // First update: explicit values only; untouched columns
                // carry the unset marker and a zero schema bit.
                chain_rid = base_rid;
                for column in 0..num_columns {
                    match columns[column] {
                        Some(value) => {
                            schema[column] = true;
                            values[column] = value;
                        }
                        None => values[column] = INDIRECTION_UNSET,
                    }
                }
            }
            Some(prev_rid) => {
                // Chained update: inherit from the newest tail row and
                // keep its modification bits for inherited columns.
                let last_tail = self.table.find_record(prev_rid)?;
                chain_rid = prev_rid;
                for column in 0..num_columns {
                    match columns[column] {
                        Some(value) => {
                            schema[column] = true;
                            values[column] = value;
                        }
                        None => {
                            let inherited = last_tail[METADATA_COLUMNS + column];
                            values[column] = inherited;
                            schema[column] = inherited != INDIRECTION_UNSET;
                        }
                    }
                }
            }
        }

        let encoded = encode_schema(&schema);
        let (tail_rid, seq) = self.table.allocate_tail();
        let mut tail_row = vec![chain_rid, tail_rid, Self::now(), encoded, base_rid];
        tail_row.extend_from_slice(&values);
        self.table.tail_write(seq, &tail_row)?;

        // Patch the base row last, so no reader chases a tail row that
        // is not fully written yet. The base mask is a mirror kept for
        // the on-disk format; reads take the mask from the tail row.
        self.table.update_value(INDIRECTION_COLUMN, &base_addr, tail_rid)?;
        self.table.update_value(SCHEMA_ENCODING_COLUMN, &base_addr, encoded)?;
        Ok(true)
    }

    /// Invalidate a key: its rid-map, directory, and secondary-index
    /// entries disappear.
    pub fn delete(&self, primary_key: u64) -> Result<bool> {
        self.table.delete_key(primary_key)
    }

    /// Sum the current logical value of `column` over every existing
    /// key in `[start, end]`. Missing keys contribute nothing; `None`
    /// when no key in the range exists.
    pub fn sum(&self, start: u64, end: u64, column: usize) -> Result<Option<u64>> {
        let mut total = 0u64;
        let mut matched = false;
        for key in start..=end {
            if let Some(rid) = self.table.rid_for_key(key) {
                matched = true;
                let base_row = self.table.find_record(rid)?;
                total += self.current_values(&base_row)?[column];
            }
        }
        Ok(matched.then_some(total))
    }

    /// Version-relative analogue of `sum`: aggregates each record at
    /// the requested relative version.
    pub fn sum_version(
        &self,
        start: u64,
        end: u64,
        column: usize,
        relative_version: i64,
    ) -> Result<Option<u64>> {
        let mut total = 0u64;
        let mut matched = false;
        for key in start..=end {
            if let Some(rid) = self.table.rid_for_key(key) {
                matched = true;
                let base_row = self.table.find_record(rid)?;
                let (version_rid, version_row) =
                    self.version_row(rid, &base_row, relative_version)?;
                total += self.version_values(rid, &base_row, version_rid, &version_row)[column];
            }
        }
        Ok(matched.then_some(total))
    }

    /// Add one to a single column of the keyed record.
    pub fn increment(&self, key: u64, column: usize) -> Result<bool> {
        let projection = vec![true; self.table.num_columns()];
        let records = self.select(key, self.table.key(), &projection)?;
        let record = match records.first() {
            Some(record) => record,
            None => return Ok(false),
        };
        let current = record.columns[column].unwrap_or_default();

        let mut updated = vec![None; self.table.num_columns()];
        updated[column] = Some(current + 1);
        self.update(key, &updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::BufferPool;

    fn grades_query(dir: &std::path::Path) -> Query {
        let pool = Arc::new(BufferPool::new(dir));
        Query::new(Arc::new(Table::new("grades", 5, 0, pool)))
    }

    fn all(n: usize) -> Vec<bool> {
        vec![true; n]
    }

    #[test]
    fn test_insert_select_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let query = grades_query(dir.path());

        assert!(query.insert(&[906659671, 93, 0, 0, 0]).unwrap());

        let records = query.select(906659671, 0, &all(5)).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].columns,
            vec![Some(906659671), Some(93), Some(0), Some(0), Some(0)]
        );
    }

    #[test]
    fn test_duplicate_key_insert_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let query = grades_query(dir.path());

        assert!(query.insert(&[1, 2, 3, 4, 5]).unwrap());
        assert!(!query.insert(&[1, 9, 9, 9, 9]).unwrap());

        let records = query.select(1, 0, &all(5)).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].columns[1], Some(2));
    }

    #[test]
    fn test_update_visibility_with_null_inheritance() {
        let dir = tempfile::tempdir().unwrap();
        let query = grades_query(dir.path());

        query.insert(&[10, 1, 2, 3, 4]).unwrap();
        assert!(query
            .update(10, &[None, Some(91), None, Some(93), None])
            .unwrap());

        let records = query.select(10, 0, &all(5)).unwrap();
        assert_eq!(
            records[0].columns,
            vec![Some(10), Some(91), Some(2), Some(93), Some(4)]
        );
    }

    #[test]
    fn test_chained_updates_carry_inherited_columns() {
        let dir = tempfile::tempdir().unwrap();
        let query = grades_query(dir.path());

        query.insert(&[10, 1, 2, 3, 4]).unwrap();
        query.update(10, &[None, Some(91), None, None, None]).unwrap();
        query.update(10, &[None, None, Some(92), None, None]).unwrap();
        query.update(10, &[None, None, None, Some(93), None]).unwrap();

        let records = query.select(10, 0, &all(5)).unwrap();
        assert_eq!(
            records[0].columns,
            vec![Some(10), Some(91), Some(92), Some(93), Some(4)]
        );
    }

    #[test]
    fn test_version_chain_depth() {
        let dir = tempfile::tempdir().unwrap();
        let query = grades_query(dir.path());

        query.insert(&[10, 100, 200, 300, 400]).unwrap();
        for round in 1..=3u64 {
            query
                .update(10, &[None, Some(100 + round), None, None, None])
                .unwrap();
        }

        let latest = query.select_version(10, 0, &all(5), 0).unwrap();
        assert_eq!(latest[0].columns[1], Some(103));

        let one_back = query.select_version(10, 0, &all(5), -1).unwrap();
        assert_eq!(one_back[0].columns[1], Some(102));

        let base = query.select_version(10, 0, &all(5), -3).unwrap();
        assert_eq!(
            base[0].columns,
            vec![Some(10), Some(100), Some(200), Some(300), Some(400)]
        );

        // Deeper than the chain: still the base values.
        let past_base = query.select_version(10, 0, &all(5), -10).unwrap();
        assert_eq!(past_base[0].columns[1], Some(100));
    }

    #[test]
    fn test_select_version_without_updates() {
        let dir = tempfile::tempdir().unwrap();
        let query = grades_query(dir.path());

        query.insert(&[7, 70, 71, 72, 73]).unwrap();
        let records = query.select_version(7, 0, &all(5), -2).unwrap();
        assert_eq!(records[0].columns[1], Some(70));
    }

    #[test]
    fn test_projection_masks_columns() {
        let dir = tempfile::tempdir().unwrap();
        let query = grades_query(dir.path());

        query.insert(&[1, 11, 22, 33, 44]).unwrap();
        let records = query
            .select(1, 0, &[false, true, false, true, false])
            .unwrap();
        assert_eq!(
            records[0].columns,
            vec![None, Some(11), None, Some(33), None]
        );
    }

    #[test]
    fn test_select_on_secondary_indexed_column() {
        let dir = tempfile::tempdir().unwrap();
        let query = grades_query(dir.path());

        query.insert(&[1, 55, 0, 0, 0]).unwrap();
        query.insert(&[2, 55, 0, 0, 0]).unwrap();
        query.insert(&[3, 56, 0, 0, 0]).unwrap();

        let records = query.select(55, 1, &all(5)).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_select_missing_key_returns_empty() {
        let dir = tempfile::tempdir().unwrap();
        let query = grades_query(dir.path());
        assert!(query.select(404, 0, &all(5)).unwrap().is_empty());
    }

    #[test]
    fn test_update_rejects_any_key_column_value() {
        let dir = tempfile::tempdir().unwrap();
        let query = grades_query(dir.path());

        query.insert(&[1, 10, 0, 0, 0]).unwrap();
        query.insert(&[2, 20, 0, 0, 0]).unwrap();

        // Collision with another key.
        assert!(!query.update(1, &[Some(2), None, None, None, None]).unwrap());
        // Same-value rewrite of the record's own key is rejected too,
        // stricter than a pure collision check.
        assert!(!query.update(1, &[Some(1), None, None, None, None]).unwrap());
        // Unknown key.
        assert!(!query.update(404, &[None, Some(1), None, None, None]).unwrap());
    }

    #[test]
    fn test_delete_then_select_and_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let query = grades_query(dir.path());

        query.insert(&[1, 10, 0, 0, 0]).unwrap();
        assert!(query.delete(1).unwrap());
        assert!(query.select(1, 0, &all(5)).unwrap().is_empty());
        assert!(!query.delete(1).unwrap());
    }

    #[test]
    fn test_delete_purges_secondary_index_entries() {
        let dir = tempfile::tempdir().unwrap();
        let query = grades_query(dir.path());

        query.insert(&[1, 50, 0, 0, 0]).unwrap();
        query.insert(&[2, 50, 0, 0, 0]).unwrap();
        assert!(query.delete(1).unwrap());

        // The surviving record with the same indexed value stays
        // reachable; the deleted one resolves to nothing instead of a
        // raised fault.
        let records = query.select(50, 1, &all(5)).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].columns[0], Some(2));

        assert!(query.delete(2).unwrap());
        assert!(query.select(50, 1, &all(5)).unwrap().is_empty());
    }

    #[test]
    fn test_overlay_mask_comes_from_newest_tail_row() {
        let dir = tempfile::tempdir().unwrap();
        let query = grades_query(dir.path());

        query.insert(&[1, 10, 20, 30, 40]).unwrap();
        query.update(1, &[None, Some(11), None, None, None]).unwrap();

        // Zero out the base row's mirror of the mask; the overlay must
        // still apply, driven by the tail row's own mask.
        let table = query.table();
        let addr = table.address_of(table.rid_for_key(1).unwrap()).unwrap();
        table.update_value(SCHEMA_ENCODING_COLUMN, &addr, 0).unwrap();

        let records = query.select(1, 0, &all(5)).unwrap();
        assert_eq!(
            records[0].columns,
            vec![Some(1), Some(11), Some(20), Some(30), Some(40)]
        );
    }

    #[test]
    fn test_sum_over_current_values() {
        let dir = tempfile::tempdir().unwrap();
        let query = grades_query(dir.path());

        for key in 1..=5u64 {
            query.insert(&[key, key * 10, 0, 0, 0]).unwrap();
        }
        query.update(3, &[None, Some(35), None, None, None]).unwrap();

        // Keys 2..=4 exist with current column-1 values 20, 35, 40.
        assert_eq!(query.sum(2, 4, 1).unwrap(), Some(95));
        // Missing keys contribute nothing.
        assert_eq!(query.sum(4, 9, 1).unwrap(), Some(90));
        // No key in range at all.
        assert_eq!(query.sum(100, 110, 1).unwrap(), None);
    }

    #[test]
    fn test_sum_version_historical() {
        let dir = tempfile::tempdir().unwrap();
        let query = grades_query(dir.path());

        query.insert(&[1, 10, 0, 0, 0]).unwrap();
        query.insert(&[2, 20, 0, 0, 0]).unwrap();
        query.update(1, &[None, Some(11), None, None, None]).unwrap();
        query.update(2, &[None, Some(21), None, None, None]).unwrap();

        assert_eq!(query.sum_version(1, 2, 1, 0).unwrap(), Some(32));
        assert_eq!(query.sum_version(1, 2, 1, -1).unwrap(), Some(30));
    }

    #[test]
    fn test_randomized_insert_batch_spans_pages() {
        use rand::seq::SliceRandom;

        let dir = tempfile::tempdir().unwrap();
        let query = grades_query(dir.path());

        let mut keys: Vec<u64> = (0..600).collect();
        keys.shuffle(&mut rand::thread_rng());
        for &key in &keys {
            assert!(query.insert(&[key, key * 2, 0, 0, 0]).unwrap());
        }

        // 600 rows overflow the first 512-slot page; every key must stay
        // reachable across the page boundary.
        for key in [0u64, 277, 511, 512, 599] {
            let records = query.select(key, 0, &all(5)).unwrap();
            assert_eq!(records[0].columns[1], Some(key * 2));
        }
        assert_eq!(query.sum(0, 599, 0).unwrap(), Some((0u64..600).sum()));
    }

    #[test]
    fn test_increment() {
        let dir = tempfile::tempdir().unwrap();
        let query = grades_query(dir.path());

        query.insert(&[1, 10, 0, 0, 0]).unwrap();
        assert!(query.increment(1, 1).unwrap());
        assert!(query.increment(1, 1).unwrap());

        let records = query.select(1, 0, &all(5)).unwrap();
        assert_eq!(records[0].columns[1], Some(12));
        assert!(!query.increment(404, 1).unwrap());
    }
}
