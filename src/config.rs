//! Storage layout constants and store configuration
//!
//! The physical layout is fixed at compile time: 4 KiB pages holding
//! 512 big-endian 8-byte slots, 16 base pages per range.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Page size in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Width of one record slot in bytes.
pub const SLOT_SIZE: usize = 8;

/// Number of record slots per page.
pub const TUPLES_PER_PAGE: usize = PAGE_SIZE / SLOT_SIZE;

/// Number of base pages in one page range.
pub const MAX_PAGES_PER_RANGE: usize = 16;

/// Number of record slots per page range.
pub const TUPLES_PER_RANGE: usize = TUPLES_PER_PAGE * MAX_PAGES_PER_RANGE;

/// Number of metadata columns prepended to every physical row.
pub const METADATA_COLUMNS: usize = 5;

/// Metadata column: rid of the newest tail version (unset = no update yet).
pub const INDIRECTION_COLUMN: usize = 0;

/// Metadata column: the row's own rid.
pub const RID_COLUMN: usize = 1;

/// Metadata column: creation/update time as integer seconds.
pub const TIMESTAMP_COLUMN: usize = 2;

/// Metadata column: decimal-digit-per-column modification bitmap.
pub const SCHEMA_ENCODING_COLUMN: usize = 3;

/// Metadata column: rid of the base record this version belongs to.
pub const BASE_RID_COLUMN: usize = 4;

/// On-disk encoding of an unset indirection pointer. Never exposed through
/// the API; the table layer converts to and from `Option<Rid>`.
pub const INDIRECTION_UNSET: u64 = u64::MAX;

/// Default soft capacity of the buffer pool, in resident pages.
pub const DEFAULT_POOL_CAPACITY: usize = 2000;

/// Store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root directory for page files and the catalog.
    pub data_dir: PathBuf,

    /// Soft capacity of the buffer pool in resident pages. The pool tracks
    /// occupancy against this bound but implements no eviction policy.
    pub pool_capacity: usize,
}

impl StoreConfig {
    pub fn new<P: Into<PathBuf>>(data_dir: P) -> Self {
        Self {
            data_dir: data_dir.into(),
            pool_capacity: DEFAULT_POOL_CAPACITY,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new("lstore_data")
    }
}
