//! Table: base/tail record storage with copy-on-update versioning
//!
//! A table owns column-per-page storage split into a base half (one row
//! per insert) and a tail half (one row per update). Base records are
//! never rewritten in place except for their indirection and schema
//! metadata; every update appends a full tail row and links it into a
//! most-recent-first version chain rooted at the base row.

use crate::config::{
    INDIRECTION_COLUMN, INDIRECTION_UNSET, MAX_PAGES_PER_RANGE, METADATA_COLUMNS, RID_COLUMN,
    TUPLES_PER_PAGE,
};
use crate::index::Index;
use crate::storage::{BufferPool, PageId, PageKind};
use crate::txn::LockTable;
use crate::{debug_log, Result, StorageError};
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Record identifier. Monotonically increasing, equal to the table's
/// total insert+update count at the moment of creation; never reused.
pub type Rid = u64;

/// Physical location of one row: every column of the row sits at the
/// same (range, page, slot) coordinates in its own column page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordAddress {
    pub kind: PageKind,
    pub range: usize,
    pub page: usize,
    pub slot: usize,
}

/// Compaction hook. The engine calls `merge` opportunistically; a policy
/// folds tail chains back into base pages.
///
/// Contract: a policy must preserve every version still reachable by a
/// currently-valid relative-version offset. The default policy does
/// nothing.
pub trait MergePolicy: Send + Sync {
    fn merge(&self, table: &Table) -> Result<()>;
}

/// Default merge policy: keeps all tail chains as written.
pub struct NoopMerge;

impl MergePolicy for NoopMerge {
    fn merge(&self, table: &Table) -> Result<()> {
        debug_log!("[merge] no-op merge on table '{}'", table.name());
        Ok(())
    }
}

/// Insert/update counters, guarded together so rid assignment stays
/// collision-free across concurrent inserts and updates.
#[derive(Debug, Default)]
struct Counters {
    /// Base rows ever inserted.
    records: u64,
    /// Tail rows ever written.
    updates: u64,
}

pub struct Table {
    name: String,
    num_columns: usize,
    key: usize,
    pool: Arc<BufferPool>,

    /// rid -> physical address, for every base and tail row.
    directory: RwLock<HashMap<Rid, RecordAddress>>,
    /// primary key -> rid of the base record. Set on insert, removed on
    /// delete, never repointed on update.
    rid_map: RwLock<HashMap<u64, Rid>>,
    counters: Mutex<Counters>,

    index: Index,
    lock_table: LockTable,
    merge_policy: Box<dyn MergePolicy>,

    /// Coarse write guards: inserts serialize table-wide, as do updates.
    insert_guard: Mutex<()>,
    update_guard: Mutex<()>,
}

impl Table {
    pub fn new(name: &str, num_columns: usize, key: usize, pool: Arc<BufferPool>) -> Self {
        Self {
            name: name.to_string(),
            num_columns,
            key,
            pool,
            directory: RwLock::new(HashMap::new()),
            rid_map: RwLock::new(HashMap::new()),
            counters: Mutex::new(Counters::default()),
            index: Index::new(num_columns, key),
            lock_table: LockTable::new(),
            merge_policy: Box::new(NoopMerge),
            insert_guard: Mutex::new(()),
            update_guard: Mutex::new(()),
        }
    }

    /// Swap in a merge policy. The hook is opportunistic; nothing in
    /// the engine depends on it running.
    pub fn with_merge_policy(mut self, policy: Box<dyn MergePolicy>) -> Self {
        self.merge_policy = policy;
        self
    }

    /// Rebuild a table from its persisted catalog fields.
    pub fn restore(
        name: &str,
        num_columns: usize,
        key: usize,
        directory: HashMap<Rid, RecordAddress>,
        records: u64,
        updates: u64,
        rid_map: HashMap<u64, Rid>,
        pool: Arc<BufferPool>,
    ) -> Self {
        let table = Self::new(name, num_columns, key, pool);
        *table.directory.write() = directory;
        *table.rid_map.write() = rid_map;
        *table.counters.lock() = Counters { records, updates };
        table
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_columns(&self) -> usize {
        self.num_columns
    }

    pub fn key(&self) -> usize {
        self.key
    }

    /// Metadata plus user column count.
    pub fn total_columns(&self) -> usize {
        self.num_columns + METADATA_COLUMNS
    }

    pub fn records(&self) -> u64 {
        self.counters.lock().records
    }

    pub fn updates(&self) -> u64 {
        self.counters.lock().updates
    }

    pub fn lock_table(&self) -> &LockTable {
        &self.lock_table
    }

    pub fn index(&self) -> &Index {
        &self.index
    }

    pub fn rid_for_key(&self, key: u64) -> Option<Rid> {
        self.rid_map.read().get(&key).copied()
    }

    pub fn contains_key(&self, key: u64) -> bool {
        self.rid_map.read().contains_key(&key)
    }

    /// Drop a key's rid-map, directory, and secondary-index entries,
    /// invalidating the key. The physical row stays in place until a
    /// merge reclaims it.
    pub fn delete_key(&self, key: u64) -> Result<bool> {
        let rid = match self.rid_map.write().remove(&key) {
            Some(rid) => rid,
            None => return Ok(false),
        };
        // Purge the base row's index entries while its address is still
        // resolvable; a stale index rid would turn later selects into
        // raised faults.
        let row = self.find_record(rid)?;
        self.index.remove(&row[METADATA_COLUMNS..], rid);
        self.directory.write().remove(&rid);
        Ok(true)
    }

    /// Serialize inserts table-wide. Held by the query layer across the
    /// whole insert.
    pub fn insert_guard(&self) -> MutexGuard<'_, ()> {
        self.insert_guard.lock()
    }

    /// Serialize updates table-wide.
    pub fn update_guard(&self) -> MutexGuard<'_, ()> {
        self.update_guard.lock()
    }

    /// Claim the next base row: returns (rid, base sequence number).
    /// Rid is `records + updates` at claim time, so rids are globally
    /// unique and creation-ordered across both row kinds.
    pub fn allocate_base(&self) -> (Rid, u64) {
        let mut counters = self.counters.lock();
        let rid = counters.records + counters.updates;
        let seq = counters.records;
        counters.records += 1;
        (rid, seq)
    }

    /// Claim the next tail row: returns (rid, tail sequence number).
    pub fn allocate_tail(&self) -> (Rid, u64) {
        let mut counters = self.counters.lock();
        let rid = counters.records + counters.updates;
        let seq = counters.updates;
        counters.updates += 1;
        (rid, seq)
    }

    /// Current writable address for the next row of `kind`.
    pub fn find_page_address(&self, kind: PageKind) -> RecordAddress {
        let counters = self.counters.lock();
        let seq = match kind {
            PageKind::Base => counters.records,
            PageKind::Tail => counters.updates,
        };
        Self::address_for(kind, seq)
    }

    /// Physical address of the `seq`-th row of `kind`. Rows fill pages
    /// left to right, pages fill ranges left to right.
    fn address_for(kind: PageKind, seq: u64) -> RecordAddress {
        let page_seq = seq as usize / TUPLES_PER_PAGE;
        RecordAddress {
            kind,
            range: page_seq / MAX_PAGES_PER_RANGE,
            page: page_seq % MAX_PAGES_PER_RANGE,
            slot: seq as usize % TUPLES_PER_PAGE,
        }
    }

    fn page_id(&self, addr: &RecordAddress, column: usize) -> PageId {
        PageId::new(&self.name, addr.kind, column, addr.range, addr.page)
    }

    /// Append one full row (metadata plus user columns) as a row group:
    /// a single rollover decision, probed on column 0's page, is shared
    /// by every column so all columns land at identical coordinates.
    fn write_row_group(&self, kind: PageKind, seq: u64, row: &[u64]) -> Result<RecordAddress> {
        let mut addr = Self::address_for(kind, seq);

        let probe = self.pool.get(&self.page_id(&addr, 0))?;
        if !probe.has_capacity() {
            addr = Self::next_page(addr);
        }

        let mut slot = addr.slot;
        for (column, &value) in row.iter().enumerate() {
            let id = self.page_id(&addr, column);
            slot = self.pool.with_page_mut(&id, |page| {
                page.write(value);
                page.num_records - 1
            })?;
        }

        Ok(RecordAddress { slot, ..addr })
    }

    /// Roll over to the next page, opening a new range after the last
    /// page of the current one.
    fn next_page(addr: RecordAddress) -> RecordAddress {
        if addr.page == MAX_PAGES_PER_RANGE - 1 {
            RecordAddress {
                range: addr.range + 1,
                page: 0,
                slot: 0,
                ..addr
            }
        } else {
            RecordAddress {
                page: addr.page + 1,
                slot: 0,
                ..addr
            }
        }
    }

    /// Write a base row at the claimed sequence position, then register
    /// it in the page directory, the rid map, and the secondary index.
    pub fn insert_base_record(&self, seq: u64, row: &[u64]) -> Result<()> {
        debug_assert_eq!(row.len(), self.total_columns());
        let addr = self.write_row_group(PageKind::Base, seq, row)?;

        let rid = row[RID_COLUMN];
        let user_columns = &row[METADATA_COLUMNS..];
        self.directory.write().insert(rid, addr);
        self.rid_map.write().insert(user_columns[self.key], rid);
        self.index.insert(user_columns, rid);
        Ok(())
    }

    /// Write a tail row at the claimed sequence position and register it
    /// in the page directory. The rid map is not touched: update chains
    /// are reached through indirection, never by remapping the key.
    pub fn tail_write(&self, seq: u64, row: &[u64]) -> Result<()> {
        debug_assert_eq!(row.len(), self.total_columns());
        let addr = self.write_row_group(PageKind::Tail, seq, row)?;
        self.directory.write().insert(row[RID_COLUMN], addr);
        Ok(())
    }

    /// Physical address of a row.
    pub fn address_of(&self, rid: Rid) -> Option<RecordAddress> {
        self.directory.read().get(&rid).copied()
    }

    /// Read one column of the row at `addr`.
    pub fn find_value(&self, column: usize, addr: &RecordAddress) -> Result<u64> {
        let page = self.pool.get(&self.page_id(addr, column))?;
        Ok(page.get_value(addr.slot))
    }

    /// Patch one column of the row at `addr` in place. Only used for the
    /// indirection and schema metadata of existing rows.
    pub fn update_value(&self, column: usize, addr: &RecordAddress, value: u64) -> Result<()> {
        self.pool
            .with_page_mut(&self.page_id(addr, column), |page| {
                page.update(addr.slot, value)
            })
    }

    /// Reassemble the full metadata+column row for a rid. Rows are never
    /// cached assembled; every call reads one page per column.
    pub fn find_record(&self, rid: Rid) -> Result<Vec<u64>> {
        let addr = self
            .address_of(rid)
            .ok_or(StorageError::RecordNotFound(rid))?;
        (0..self.total_columns())
            .map(|column| self.find_value(column, &addr))
            .collect()
    }

    /// Full-scan fallback for lookups on an unindexed, non-key column.
    pub fn rid_lookup(&self, column: usize, value: u64) -> Result<Vec<Rid>> {
        let rids: Vec<Rid> = self.directory.read().keys().copied().collect();
        let mut matches = Vec::new();
        for rid in rids {
            let row = self.find_record(rid)?;
            if row[METADATA_COLUMNS + column] == value {
                matches.push(rid);
            }
        }
        Ok(matches)
    }

    /// Run the configured merge policy.
    pub fn merge(&self) -> Result<()> {
        self.merge_policy.merge(self)
    }

    /// Catalog snapshot: exactly the fields the table is reconstructible
    /// from.
    pub(crate) fn snapshot(&self) -> TableSnapshot {
        let counters = self.counters.lock();
        TableSnapshot {
            name: self.name.clone(),
            num_columns: self.num_columns,
            key: self.key,
            directory: self.directory.read().clone(),
            records: counters.records,
            updates: counters.updates,
            rid_map: self.rid_map.read().clone(),
        }
    }
}

/// Persisted table metadata: name, column count, key column index, page
/// directory, insert count, update count, and the rid map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct TableSnapshot {
    pub name: String,
    pub num_columns: usize,
    pub key: usize,
    pub directory: HashMap<Rid, RecordAddress>,
    pub records: u64,
    pub updates: u64,
    pub rid_map: HashMap<u64, Rid>,
}

/// Decode an on-disk indirection slot to a tagged option.
pub fn indirection_of(row: &[u64]) -> Option<Rid> {
    match row[INDIRECTION_COLUMN] {
        INDIRECTION_UNSET => None,
        rid => Some(rid),
    }
}

/// Encode a modified-column vector as a decimal-digit-per-column bitmap
/// (column 0 in the most significant digit).
pub fn encode_schema(modified: &[bool]) -> u64 {
    modified.iter().fold(0, |acc, &bit| acc * 10 + u64::from(bit))
}

/// Decode a decimal-digit bitmap back to a modified-column vector.
pub fn decode_schema(schema: u64, num_columns: usize) -> Vec<bool> {
    let mut flags = vec![false; num_columns];
    let mut rest = schema;
    let mut column = num_columns;
    while rest > 0 && column > 0 {
        column -= 1;
        flags[column] = rest % 10 == 1;
        rest /= 10;
    }
    flags
}
