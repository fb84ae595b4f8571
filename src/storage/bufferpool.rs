//! Buffer pool
//!
//! Process-wide page cache keyed by `PageId`. Writers mutate the
//! resident page in place through `with_page_mut`, which holds the
//! page's map entry for the whole mutation so concurrent writers cannot
//! erase each other. `get` hands out read copies; `put` publishes an
//! externally built page. Persistence happens only at `flush_all`,
//! called once at shutdown. The pool tracks a soft capacity but
//! implements no eviction policy.

use crate::config::DEFAULT_POOL_CAPACITY;
use crate::storage::page::{Page, PageId};
use crate::{debug_log, Result, StorageError};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

/// On-disk page header, written back-to-back with the slot buffer.
#[derive(serde::Serialize, serde::Deserialize)]
struct PageHeader {
    num_records: usize,
    dirty: bool,
    pinned: usize,
    tail_sequence: u64,
}

/// Shared page cache with disk spill and load.
///
/// An explicit context object: one pool is created per store and handed
/// to every table as an `Arc`, never held in a static.
pub struct BufferPool {
    root: PathBuf,
    capacity: usize,
    frames: DashMap<PageId, Page>,
}

impl BufferPool {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self::with_capacity(root, DEFAULT_POOL_CAPACITY)
    }

    pub fn with_capacity<P: Into<PathBuf>>(root: P, capacity: usize) -> Self {
        Self {
            root: root.into(),
            capacity,
            frames: DashMap::new(),
        }
    }

    /// Storage root for page files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of resident pages.
    pub fn resident(&self) -> usize {
        self.frames.len()
    }

    /// Whether the pool has reached its soft capacity. Nothing acts on
    /// this yet; there is no eviction policy.
    pub fn is_full(&self) -> bool {
        self.frames.len() >= self.capacity
    }

    /// Fetch a page, loading it from disk or materializing a fresh one.
    ///
    /// After `get` returns, the identifier is resident in the cache. The
    /// returned page is a read copy; mutations go through
    /// `with_page_mut`.
    pub fn get(&self, id: &PageId) -> Result<Page> {
        if let Some(page) = self.frames.get(id) {
            return Ok(page.clone());
        }

        let page = self.load_page(id)?;
        self.frames.insert(id.clone(), page.clone());
        Ok(page)
    }

    /// Mutate the resident page in place, materializing it first if
    /// needed. The page stays under its map entry for the whole closure,
    /// so interleaved mutations of one page never lose writes. The
    /// closure must not reenter the pool.
    pub fn with_page_mut<R>(&self, id: &PageId, f: impl FnOnce(&mut Page) -> R) -> Result<R> {
        let mut entry = match self.frames.entry(id.clone()) {
            Entry::Occupied(entry) => entry.into_ref(),
            Entry::Vacant(entry) => entry.insert(self.load_page(id)?),
        };
        let page = entry.value_mut();
        let result = f(page);
        page.mark_dirty();
        Ok(result)
    }

    fn load_page(&self, id: &PageId) -> Result<Page> {
        let path = id.file_path(&self.root);
        if path.is_file() {
            Self::read_page(&path)
        } else {
            // No file on disk: materialize a fresh page, dirty so the
            // next flush creates the file.
            let mut page = Page::new();
            page.mark_dirty();
            Ok(page)
        }
    }

    /// Publish an externally built page into the cache, marking it
    /// dirty. Resident pages are mutated through `with_page_mut`
    /// instead.
    pub fn put(&self, id: PageId, mut page: Page) {
        page.mark_dirty();
        self.frames.insert(id, page);
    }

    /// Drop every resident page without writing. Test hook for
    /// persistence round-trips.
    pub fn clear(&self) {
        self.frames.clear();
    }

    /// Serialize every resident page to its derived file path, creating
    /// parent directories as needed. Called once at shutdown.
    pub fn flush_all(&self) -> Result<()> {
        debug_log!("[bufferpool] flushing {} resident pages", self.frames.len());
        for entry in self.frames.iter() {
            Self::write_page(&entry.key().file_path(&self.root), entry.value())?;
        }
        Ok(())
    }

    fn read_page(path: &Path) -> Result<Page> {
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let header: PageHeader = bincode::deserialize_from(&mut reader)
            .map_err(|e| StorageError::Corruption(format!("{}: {}", path.display(), e)))?;
        let data: Vec<u8> = bincode::deserialize_from(&mut reader)
            .map_err(|e| StorageError::Corruption(format!("{}: {}", path.display(), e)))?;

        let mut page = Page::from_parts(data)?;
        page.num_records = header.num_records;
        page.dirty = header.dirty;
        page.pinned = header.pinned;
        page.tail_sequence = header.tail_sequence;
        Ok(page)
    }

    fn write_page(path: &Path, page: &Page) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);

        let header = PageHeader {
            num_records: page.num_records,
            dirty: page.dirty,
            pinned: page.pinned,
            tail_sequence: page.tail_sequence,
        };
        bincode::serialize_into(&mut writer, &header)?;
        bincode::serialize_into(&mut writer, page.data())?;
        Ok(())
    }
}
