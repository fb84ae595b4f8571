//! lstore Storage Engine
//!
//! A lineage-based columnar record store. Records live as fixed-width
//! binary slots in column-per-page files; updates never rewrite base
//! records but append tail versions linked through indirection pointers.
//!
//! ## Architecture
//! - Storage layer: 4 KiB slotted pages grouped into page ranges, cached
//!   by a process-wide buffer pool with flush-on-shutdown persistence
//! - Table layer: base/tail record mechanism with copy-on-update
//!   versioning and a pluggable (default no-op) merge hook
//! - Index layer: ordered secondary indexes over non-key columns
//! - Transaction layer: two-phase locking over fail-fast per-key locks

pub mod config;
pub mod database;
pub mod index;
pub mod query;
pub mod storage;
pub mod table;
pub mod txn;

mod error;

pub use config::StoreConfig;
pub use database::Database;
pub use error::{Result, StorageError};
pub use query::{Query, Record};
pub use storage::BufferPool;
pub use table::{MergePolicy, NoopMerge, Rid, Table};
pub use txn::{QueryOp, Transaction};

/// Debug logging, enabled at runtime through `LSTORE_DEBUG=1`.
#[macro_export]
macro_rules! debug_log {
    ($($arg:tt)*) => {
        if std::env::var("LSTORE_DEBUG").is_ok() {
            eprintln!($($arg)*);
        }
    };
}
