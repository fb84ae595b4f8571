//! Transactions: two-phase locking over fail-fast key locks
//!
//! `run` is a pre-pass over the queued queries that acquires every write
//! lock before any store mutation happens. A single denied acquisition
//! aborts the whole transaction; only after every lock is held does
//! `commit` execute the queries in order. Aborts therefore never need to
//! roll back store state, only locks.

use crate::query::Query;
use crate::txn::lock::LockAttempt;
use crate::{debug_log, Result};
use std::collections::HashSet;

/// One queued operation. The first field of each variant (the key
/// column value for inserts) is the key whose lock the transaction must
/// hold before committing.
#[derive(Debug, Clone)]
pub enum QueryOp {
    /// Insert a full row of user columns.
    Insert(Vec<u64>),
    /// Update by primary key; `None` = column unchanged.
    Update(u64, Vec<Option<u64>>),
    /// Delete by primary key.
    Delete(u64),
    /// Add one to a single column of the keyed record.
    Increment(u64, usize),
}

impl QueryOp {
    /// The record key this operation targets.
    fn target_key(&self, key_column: usize) -> u64 {
        match self {
            QueryOp::Insert(columns) => columns[key_column],
            QueryOp::Update(key, _) | QueryOp::Delete(key) | QueryOp::Increment(key, _) => *key,
        }
    }
}

pub struct Transaction {
    queries: Vec<QueryOp>,
    read_locks: HashSet<u64>,
    write_locks: HashSet<u64>,
    /// Keys whose lock-table entry this transaction created. First
    /// touch grants ownership without an explicit acquisition; an abort
    /// deletes these entries outright.
    insert_locks: HashSet<u64>,
}

impl Transaction {
    pub fn new() -> Self {
        Self {
            queries: Vec::new(),
            read_locks: HashSet::new(),
            write_locks: HashSet::new(),
            insert_locks: HashSet::new(),
        }
    }

    /// Queue an operation for execution at commit.
    pub fn add_query(&mut self, op: QueryOp) {
        self.queries.push(op);
    }

    /// Acquire all locks, then commit; abort on the first denial.
    /// Returns whether the transaction committed.
    pub fn run(&mut self, query: &Query) -> Result<bool> {
        let key_column = query.table().key();
        let keys: Vec<u64> = self
            .queries
            .iter()
            .map(|op| op.target_key(key_column))
            .collect();

        for key in keys {
            let (lock, created) = query.table().lock_table().get_or_create(key);
            if created {
                self.insert_locks.insert(key);
                continue;
            }
            if self.write_locks.contains(&key) || self.insert_locks.contains(&key) {
                continue;
            }
            match lock.try_write() {
                LockAttempt::Acquired => {
                    self.write_locks.insert(key);
                }
                LockAttempt::Denied => {
                    debug_log!("[txn] write lock denied for key {}, aborting", key);
                    self.abort(query);
                    return Ok(false);
                }
            }
        }
        self.commit(query)?;
        Ok(true)
    }

    /// Release every acquired lock and delete every lock-table entry
    /// this transaction originated. No store state needs undoing: abort
    /// is only reachable before the first mutation.
    fn abort(&mut self, query: &Query) {
        let locks = query.table().lock_table();
        for key in self.read_locks.drain() {
            if let Some(lock) = locks.get(key) {
                lock.release_read();
            }
        }
        for key in self.write_locks.drain() {
            if let Some(lock) = locks.get(key) {
                lock.release_write();
            }
        }
        for key in self.insert_locks.drain() {
            locks.remove(key);
        }
    }

    /// Execute every queued query in original order, then release all
    /// held locks. Insert-origin locks release through the write path.
    fn commit(&mut self, query: &Query) -> Result<()> {
        let locks = query.table().lock_table();
        for op in std::mem::take(&mut self.queries) {
            let key = op.target_key(query.table().key());
            let deleted = matches!(op, QueryOp::Delete(_));
            match op {
                QueryOp::Insert(columns) => {
                    query.insert(&columns)?;
                }
                QueryOp::Update(key, columns) => {
                    query.update(key, &columns)?;
                }
                QueryOp::Delete(key) => {
                    query.delete(key)?;
                }
                QueryOp::Increment(key, column) => {
                    query.increment(key, column)?;
                }
            }
            if deleted {
                // The key is gone; its lock entry goes with it.
                locks.remove(key);
                self.write_locks.remove(&key);
                self.insert_locks.remove(&key);
            }
        }

        for key in self.read_locks.drain() {
            if let Some(lock) = locks.get(key) {
                lock.release_read();
            }
        }
        for key in self.write_locks.drain() {
            if let Some(lock) = locks.get(key) {
                lock.release_write();
            }
        }
        for key in self.insert_locks.drain() {
            if let Some(lock) = locks.get(key) {
                lock.release_write();
            }
        }
        Ok(())
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::BufferPool;
    use crate::table::Table;
    use std::sync::Arc;

    fn test_query(dir: &std::path::Path) -> Query {
        let pool = Arc::new(BufferPool::new(dir));
        Query::new(Arc::new(Table::new("txn_test", 3, 0, pool)))
    }

    #[test]
    fn test_commit_applies_all_queries() {
        let dir = tempfile::tempdir().unwrap();
        let query = test_query(dir.path());

        let mut txn = Transaction::new();
        txn.add_query(QueryOp::Insert(vec![1, 10, 100]));
        txn.add_query(QueryOp::Insert(vec![2, 20, 200]));
        txn.add_query(QueryOp::Update(1, vec![None, Some(11), None]));

        assert!(txn.run(&query).unwrap());

        let records = query.select(1, 0, &[true, true, true]).unwrap();
        assert_eq!(records[0].columns, vec![Some(1), Some(11), Some(100)]);
        assert_eq!(query.select(2, 0, &[true, true, true]).unwrap().len(), 1);
    }

    #[test]
    fn test_commit_releases_all_locks() {
        let dir = tempfile::tempdir().unwrap();
        let query = test_query(dir.path());

        let mut txn = Transaction::new();
        txn.add_query(QueryOp::Insert(vec![5, 50, 500]));
        assert!(txn.run(&query).unwrap());

        // The entry survives commit but its write lock must be free.
        let locks = query.table().lock_table();
        let (lock, created) = locks.get_or_create(5);
        assert!(!created);
        assert!(lock.try_write().is_acquired());
    }

    #[test]
    fn test_abort_on_held_lock_and_full_rollback() {
        let dir = tempfile::tempdir().unwrap();
        let query = test_query(dir.path());

        query.insert(&[1, 10, 100]).unwrap();
        query.insert(&[2, 20, 200]).unwrap();

        let locks = query.table().lock_table();
        let (contended, _) = locks.get_or_create(2);
        assert!(contended.try_write().is_acquired());

        let mut txn = Transaction::new();
        txn.add_query(QueryOp::Update(1, vec![None, Some(99), None]));
        txn.add_query(QueryOp::Update(2, vec![None, Some(99), None]));
        txn.add_query(QueryOp::Insert(vec![3, 30, 300]));

        assert!(!txn.run(&query).unwrap(), "contended key must abort");

        // Nothing was applied: abort happens before any mutation.
        let records = query.select(1, 0, &[true, true, true]).unwrap();
        assert_eq!(records[0].columns[1], Some(10));
        assert!(query.select(3, 0, &[true, true, true]).unwrap().is_empty());

        // Key 1's entry was originated by the aborted transaction and
        // discarded with it; key 3 was never reached.
        assert!(!locks.contains(1));
        assert!(!locks.contains(3));
        // The contended lock stays with its external holder.
        assert!(!contended.try_write().is_acquired());
    }

    #[test]
    fn test_abort_after_external_release_allows_retry() {
        let dir = tempfile::tempdir().unwrap();
        let query = test_query(dir.path());
        query.insert(&[1, 10, 100]).unwrap();

        let (lock, _) = query.table().lock_table().get_or_create(1);
        assert!(lock.try_write().is_acquired());

        let mut txn = Transaction::new();
        txn.add_query(QueryOp::Increment(1, 1));
        assert!(!txn.run(&query).unwrap());

        lock.release_write();

        let mut retry = Transaction::new();
        retry.add_query(QueryOp::Increment(1, 1));
        assert!(retry.run(&query).unwrap());

        let records = query.select(1, 0, &[true, true, true]).unwrap();
        assert_eq!(records[0].columns[1], Some(11));
    }

    #[test]
    fn test_delete_discards_lock_entry() {
        let dir = tempfile::tempdir().unwrap();
        let query = test_query(dir.path());
        query.insert(&[7, 70, 700]).unwrap();

        let mut txn = Transaction::new();
        txn.add_query(QueryOp::Delete(7));
        assert!(txn.run(&query).unwrap());

        assert!(!query.table().lock_table().contains(7));
        assert!(query.select(7, 0, &[true, true, true]).unwrap().is_empty());
    }

    #[test]
    fn test_concurrent_transactions_on_same_key() {
        use std::thread;

        let dir = tempfile::tempdir().unwrap();
        let query = Arc::new(test_query(dir.path()));
        query.insert(&[1, 0, 0]).unwrap();
        // Touch the key once so both transactions contend on acquisition
        // instead of racing on first-touch ownership.
        query.table().lock_table().get_or_create(1);

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let query = Arc::clone(&query);
                thread::spawn(move || {
                    let mut txn = Transaction::new();
                    txn.add_query(QueryOp::Increment(1, 1));
                    txn.run(&query).unwrap()
                })
            })
            .collect();

        let committed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&ok| ok)
            .count();
        assert!(committed >= 1, "at least one transaction must commit");

        let records = query.select(1, 0, &[true, true, true]).unwrap();
        assert_eq!(records[0].columns[1], Some(committed as u64));
    }
}
