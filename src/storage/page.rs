//! Slotted page and page range
//!
//! A page is a fixed 4 KiB buffer of 512 big-endian 8-byte integer slots.
//! Pages never roll over internally; callers check `has_capacity` before
//! appending and move to the next page themselves.

use crate::config::{MAX_PAGES_PER_RANGE, PAGE_SIZE, SLOT_SIZE, TUPLES_PER_PAGE};
use crate::{Result, StorageError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Which half of a table's storage a page belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PageKind {
    /// Original insert storage, bounded per range.
    Base,
    /// Append-only update storage.
    Tail,
}

impl PageKind {
    fn as_str(&self) -> &'static str {
        match self {
            PageKind::Base => "base",
            PageKind::Tail => "tail",
        }
    }
}

/// Composite page identifier: uniquely addresses one physical page and
/// doubles as the buffer pool cache key and the disk path source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageId {
    /// Owning table name.
    pub table: String,
    /// Base or tail storage.
    pub kind: PageKind,
    /// Column index (metadata columns included).
    pub column: usize,
    /// Page range index.
    pub range: usize,
    /// Page index within the range.
    pub page: usize,
}

impl PageId {
    pub fn new(table: &str, kind: PageKind, column: usize, range: usize, page: usize) -> Self {
        Self {
            table: table.to_string(),
            kind,
            column,
            range,
            page,
        }
    }

    /// Derive the on-disk file path for this page. Component order is
    /// fixed: root, range, page, table, then a file named by column.
    pub fn file_path(&self, root: &Path) -> PathBuf {
        root.join(self.range.to_string())
            .join(self.page.to_string())
            .join(format!("{}_{}", self.table, self.kind.as_str()))
            .join(format!("{}.page", self.column))
    }
}

/// A fixed-capacity array of 8-byte record slots.
#[derive(Debug, Clone)]
pub struct Page {
    /// Next free slot; always `<= TUPLES_PER_PAGE`.
    pub num_records: usize,
    /// True once written since load or flush.
    pub dirty: bool,
    /// Pin count, reserved for a future eviction policy.
    pub pinned: usize,
    /// Tail-page-sequence marker, reserved for merge bookkeeping.
    pub tail_sequence: u64,
    /// Raw slot buffer.
    data: Vec<u8>,
}

impl Page {
    pub fn new() -> Self {
        Self {
            num_records: 0,
            dirty: false,
            pinned: 0,
            tail_sequence: 0,
            data: vec![0u8; PAGE_SIZE],
        }
    }

    /// Whether at least one free slot remains.
    pub fn has_capacity(&self) -> bool {
        self.num_records < TUPLES_PER_PAGE
    }

    /// Append a value at the next free slot. Callers must check
    /// `has_capacity` first.
    pub fn write(&mut self, value: u64) {
        let start = self.num_records * SLOT_SIZE;
        self.data[start..start + SLOT_SIZE].copy_from_slice(&value.to_be_bytes());
        self.num_records += 1;
        self.dirty = true;
    }

    /// Read the slot at `index` as a big-endian integer.
    pub fn get_value(&self, index: usize) -> u64 {
        let start = index * SLOT_SIZE;
        let mut bytes = [0u8; SLOT_SIZE];
        bytes.copy_from_slice(&self.data[start..start + SLOT_SIZE]);
        u64::from_be_bytes(bytes)
    }

    /// Overwrite the slot at `index` in place. Does not change
    /// `num_records`.
    pub fn update(&mut self, index: usize, value: u64) {
        let start = index * SLOT_SIZE;
        self.data[start..start + SLOT_SIZE].copy_from_slice(&value.to_be_bytes());
        self.dirty = true;
    }

    /// Linear scan for every slot holding `target`. Fallback path for
    /// lookups on columns without a secondary index.
    pub fn find_value(&self, target: u64) -> Vec<usize> {
        (0..TUPLES_PER_PAGE)
            .filter(|&i| self.get_value(i) == target)
            .collect()
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Rebuild a page around a slot buffer loaded from disk.
    pub(crate) fn from_parts(data: Vec<u8>) -> Result<Self> {
        if data.len() != PAGE_SIZE {
            return Err(StorageError::Corruption(format!(
                "page buffer is {} bytes, expected {}",
                data.len(),
                PAGE_SIZE
            )));
        }
        Ok(Self {
            num_records: 0,
            dirty: false,
            pinned: 0,
            tail_sequence: 0,
            data,
        })
    }

    /// Raw slot buffer, for serialization.
    pub(crate) fn data(&self) -> &Vec<u8> {
        &self.data
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

/// A bounded sequence of base pages plus an unbounded sequence of tail
/// pages. Base pages fill left to right; once the last base page is full
/// the range is closed to further base inserts and the caller must open
/// a new range.
#[derive(Debug)]
pub struct PageRange {
    base_pages: [Option<Page>; MAX_PAGES_PER_RANGE],
    tail_pages: Vec<Page>,
    base_cursor: usize,
    tail_cursor: usize,
}

impl PageRange {
    pub fn new() -> Self {
        Self {
            base_pages: std::array::from_fn(|_| None),
            tail_pages: vec![Page::new()],
            base_cursor: 0,
            tail_cursor: 0,
        }
    }

    pub fn base_cursor(&self) -> usize {
        self.base_cursor
    }

    pub fn tail_cursor(&self) -> usize {
        self.tail_cursor
    }

    /// Whether a page has been allocated at `index`.
    pub fn has_base_page(&self, index: usize) -> bool {
        self.base_pages[index].is_some()
    }

    /// Allocate (or adopt) the base page at `index`.
    pub fn create_base_page(&mut self, index: usize, page: Option<Page>) {
        self.base_pages[index] = Some(page.unwrap_or_default());
    }

    /// The currently-writable base page, if allocated.
    pub fn current_base_page(&mut self) -> Option<&mut Page> {
        self.base_pages[self.base_cursor].as_mut()
    }

    /// The currently-writable tail page.
    pub fn current_tail_page(&mut self) -> &mut Page {
        &mut self.tail_pages[self.tail_cursor]
    }

    /// Advance the base cursor to the next page slot. Returns false when
    /// the range is already at its last base page.
    pub fn advance_base_page(&mut self) -> bool {
        if self.is_last_base_page() {
            return false;
        }
        self.base_cursor += 1;
        true
    }

    /// Append a fresh tail page and advance the tail cursor.
    pub fn append_tail_page(&mut self) {
        self.tail_pages.push(Page::new());
        self.tail_cursor += 1;
    }

    /// Whether the base cursor sits on the final base page of the range.
    pub fn is_last_base_page(&self) -> bool {
        self.base_cursor == MAX_PAGES_PER_RANGE - 1
    }

    /// Closed to base inserts: last base page reached and full.
    pub fn base_is_full(&self) -> bool {
        self.is_last_base_page()
            && self.base_pages[self.base_cursor]
                .as_ref()
                .map(|p| !p.has_capacity())
                .unwrap_or(false)
    }
}

impl Default for PageRange {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_and_read_slots() {
        let mut page = Page::new();
        page.write(42);
        page.write(7);
        page.write(u64::MAX);

        assert_eq!(page.num_records, 3);
        assert_eq!(page.get_value(0), 42);
        assert_eq!(page.get_value(1), 7);
        assert_eq!(page.get_value(2), u64::MAX);
        assert!(page.dirty);
    }

    #[test]
    fn test_capacity_bound() {
        let mut page = Page::new();
        for i in 0..TUPLES_PER_PAGE {
            assert!(page.has_capacity());
            page.write(i as u64);
        }
        assert!(!page.has_capacity());
        assert_eq!(page.num_records, TUPLES_PER_PAGE);
    }

    #[test]
    fn test_update_in_place() {
        let mut page = Page::new();
        page.write(1);
        page.write(2);

        page.update(0, 99);
        assert_eq!(page.get_value(0), 99);
        assert_eq!(page.get_value(1), 2);
        assert_eq!(page.num_records, 2, "update must not change the record count");
    }

    #[test]
    fn test_find_value_offsets() {
        let mut page = Page::new();
        page.write(5);
        page.write(3);
        page.write(5);

        let offsets = page.find_value(5);
        assert_eq!(offsets, vec![0, 2]);
        // Empty slots read as zero, so zero matches every unwritten slot.
        assert_eq!(page.find_value(3), vec![1]);
    }

    #[test]
    fn test_page_range_base_fill() {
        let mut range = PageRange::new();
        assert!(!range.has_base_page(0));

        range.create_base_page(0, None);
        assert!(range.has_base_page(0));
        assert_eq!(range.base_cursor(), 0);

        for _ in 0..MAX_PAGES_PER_RANGE - 1 {
            assert!(range.advance_base_page());
        }
        assert!(range.is_last_base_page());
        assert!(!range.advance_base_page());
    }

    #[test]
    fn test_page_range_closes_when_last_base_page_full() {
        let mut range = PageRange::new();
        for i in 0..MAX_PAGES_PER_RANGE {
            range.create_base_page(i, None);
            if i < MAX_PAGES_PER_RANGE - 1 {
                range.advance_base_page();
            }
        }
        assert!(!range.base_is_full());

        let last = range.current_base_page().unwrap();
        for i in 0..TUPLES_PER_PAGE {
            last.write(i as u64);
        }
        assert!(range.base_is_full());
    }

    #[test]
    fn test_page_range_tail_growth() {
        let mut range = PageRange::new();
        assert_eq!(range.tail_cursor(), 0);

        range.current_tail_page().write(1);
        range.append_tail_page();
        assert_eq!(range.tail_cursor(), 1);
        assert_eq!(range.current_tail_page().num_records, 0);
    }

    #[test]
    fn test_page_id_path_component_order() {
        let id = PageId::new("grades", PageKind::Base, 3, 1, 2);
        let path = id.file_path(Path::new("/data"));
        assert_eq!(path, PathBuf::from("/data/1/2/grades_base/3.page"));
    }
}
