//! Per-key reader-writer locks with fail-fast acquisition
//!
//! Acquisition never suspends the caller: an attempt inspects the lock
//! state under a short mutex and reports `Acquired` or `Denied`
//! immediately. There is no queue and no retry; the transaction layer
//! treats a denial as grounds for abort. Because no caller ever holds
//! one lock while waiting on another, deadlock is impossible by
//! construction.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;

/// Outcome of a lock attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockAttempt {
    Acquired,
    Denied,
}

impl LockAttempt {
    pub fn is_acquired(&self) -> bool {
        matches!(self, LockAttempt::Acquired)
    }
}

#[derive(Debug, Default)]
struct LockState {
    readers: usize,
    writer: bool,
}

/// Reader-writer lock over a single record key: any number of readers
/// or one writer, never both.
#[derive(Debug, Default)]
pub struct KeyLock {
    state: Mutex<LockState>,
}

impl KeyLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attempt a shared read lock. Denied while a writer is active.
    pub fn try_read(&self) -> LockAttempt {
        let mut state = self.state.lock();
        if state.writer {
            LockAttempt::Denied
        } else {
            state.readers += 1;
            LockAttempt::Acquired
        }
    }

    /// Attempt an exclusive write lock. Denied while any reader or a
    /// writer is active.
    pub fn try_write(&self) -> LockAttempt {
        let mut state = self.state.lock();
        if state.readers != 0 || state.writer {
            LockAttempt::Denied
        } else {
            state.writer = true;
            LockAttempt::Acquired
        }
    }

    pub fn release_read(&self) {
        let mut state = self.state.lock();
        state.readers = state.readers.saturating_sub(1);
    }

    pub fn release_write(&self) {
        self.state.lock().writer = false;
    }
}

/// Per-table lock table: key -> lock, created lazily on first touch.
///
/// Creation goes through the map's entry API, so two threads racing on
/// the same key's first touch resolve to a single lock.
pub struct LockTable {
    locks: DashMap<u64, Arc<KeyLock>>,
}

impl LockTable {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Fetch the lock for `key`, creating it on first touch. Returns
    /// the lock and whether this call created it.
    pub fn get_or_create(&self, key: u64) -> (Arc<KeyLock>, bool) {
        match self.locks.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let lock = Arc::new(KeyLock::new());
                entry.insert(Arc::clone(&lock));
                (lock, true)
            }
        }
    }

    pub fn get(&self, key: u64) -> Option<Arc<KeyLock>> {
        self.locks.get(&key).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, key: u64) -> bool {
        self.locks.contains_key(&key)
    }

    /// Discard the lock entry for `key`.
    pub fn remove(&self, key: u64) {
        self.locks.remove(&key);
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_write_excludes_write() {
        let lock = KeyLock::new();
        assert_eq!(lock.try_write(), LockAttempt::Acquired);
        assert_eq!(lock.try_write(), LockAttempt::Denied);

        lock.release_write();
        assert_eq!(lock.try_write(), LockAttempt::Acquired);
    }

    #[test]
    fn test_readers_share_and_block_writer() {
        let lock = KeyLock::new();
        assert_eq!(lock.try_read(), LockAttempt::Acquired);
        assert_eq!(lock.try_read(), LockAttempt::Acquired);
        assert_eq!(lock.try_write(), LockAttempt::Denied);

        lock.release_read();
        assert_eq!(lock.try_write(), LockAttempt::Denied, "one reader still active");

        lock.release_read();
        assert_eq!(lock.try_write(), LockAttempt::Acquired);
    }

    #[test]
    fn test_writer_blocks_reader() {
        let lock = KeyLock::new();
        assert_eq!(lock.try_write(), LockAttempt::Acquired);
        assert_eq!(lock.try_read(), LockAttempt::Denied);
    }

    #[test]
    fn test_concurrent_write_attempts_exactly_one_wins() {
        let lock = Arc::new(KeyLock::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let lock = Arc::clone(&lock);
                thread::spawn(move || lock.try_write().is_acquired())
            })
            .collect();

        let wins: usize = handles
            .into_iter()
            .map(|h| usize::from(h.join().unwrap()))
            .sum();
        assert_eq!(wins, 1, "exactly one concurrent writer may win");
    }

    #[test]
    fn test_lock_table_first_touch() {
        let table = LockTable::new();

        let (_, created) = table.get_or_create(9);
        assert!(created);
        let (_, created) = table.get_or_create(9);
        assert!(!created);
        assert_eq!(table.len(), 1);

        table.remove(9);
        assert!(!table.contains(9));
    }

    #[test]
    fn test_lock_table_concurrent_first_touch_single_lock() {
        let table = Arc::new(LockTable::new());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                thread::spawn(move || table.get_or_create(1).0.try_write().is_acquired())
            })
            .collect();

        let wins: usize = handles
            .into_iter()
            .map(|h| usize::from(h.join().unwrap()))
            .sum();
        // All threads must have resolved to the same lock.
        assert_eq!(wins, 1);
        assert_eq!(table.len(), 1);
    }
}
