//! Database: table registry with catalog persistence
//!
//! Owns the shared buffer pool and the set of open tables. The catalog
//! file holds, per table, exactly the fields a table is reconstructible
//! from: name, column count, key column index, page directory, insert
//! count, update count, and the rid map. `close` persists the catalog
//! and flushes the pool; there is no other durability point.

use crate::config::StoreConfig;
use crate::storage::BufferPool;
use crate::table::{Table, TableSnapshot};
use crate::{debug_log, Result, StorageError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const CATALOG_FILE: &str = "catalog.bin";

pub struct Database {
    data_dir: PathBuf,
    pool: Arc<BufferPool>,
    tables: RwLock<HashMap<String, Arc<Table>>>,
}

impl Database {
    /// Open a store at `data_dir`, creating the directory on first use
    /// and reconstructing every cataloged table otherwise.
    pub fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        Self::open_with_config(&StoreConfig::new(data_dir.as_ref()))
    }

    /// Open a store with an explicit configuration.
    pub fn open_with_config(config: &StoreConfig) -> Result<Self> {
        let data_dir = config.data_dir.clone();
        fs::create_dir_all(&data_dir)?;

        let pool = Arc::new(BufferPool::with_capacity(&data_dir, config.pool_capacity));
        let mut tables = HashMap::new();

        let catalog_path = data_dir.join(CATALOG_FILE);
        if catalog_path.is_file() {
            let data = fs::read(&catalog_path)?;
            let snapshots: HashMap<String, TableSnapshot> = bincode::deserialize(&data)
                .map_err(|e| {
                    StorageError::Corruption(format!("{}: {}", catalog_path.display(), e))
                })?;

            debug_log!("[database] restoring {} tables from catalog", snapshots.len());
            for (name, snap) in snapshots {
                let table = Table::restore(
                    &snap.name,
                    snap.num_columns,
                    snap.key,
                    snap.directory,
                    snap.records,
                    snap.updates,
                    snap.rid_map,
                    Arc::clone(&pool),
                );
                tables.insert(name, Arc::new(table));
            }
        }

        Ok(Self {
            data_dir,
            pool,
            tables: RwLock::new(tables),
        })
    }

    /// The shared page cache.
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Register a new table. Fails if the name is taken.
    pub fn create_table(&self, name: &str, num_columns: usize, key: usize) -> Result<Arc<Table>> {
        let mut tables = self.tables.write();
        if tables.contains_key(name) {
            return Err(StorageError::InvalidData(format!(
                "table '{}' already exists",
                name
            )));
        }
        let table = Arc::new(Table::new(name, num_columns, key, Arc::clone(&self.pool)));
        tables.insert(name.to_string(), Arc::clone(&table));
        Ok(table)
    }

    /// Remove a table from the registry. Its pages stay on disk.
    pub fn drop_table(&self, name: &str) -> Result<()> {
        self.tables
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| StorageError::TableNotFound(name.to_string()))
    }

    pub fn get_table(&self, name: &str) -> Result<Arc<Table>> {
        self.tables
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::TableNotFound(name.to_string()))
    }

    pub fn list_tables(&self) -> Vec<String> {
        self.tables.read().keys().cloned().collect()
    }

    /// Persist the catalog and flush every resident page. The only
    /// durability point: unflushed writes are lost on a crash before
    /// `close`.
    pub fn close(&self) -> Result<()> {
        let snapshots: HashMap<String, TableSnapshot> = self
            .tables
            .read()
            .iter()
            .map(|(name, table)| (name.clone(), table.snapshot()))
            .collect();

        let data = bincode::serialize(&snapshots)?;
        fs::write(self.data_dir.join(CATALOG_FILE), data)?;

        self.pool.flush_all()
    }
}
