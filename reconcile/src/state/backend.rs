//! Key-value backends for the state store
//!
//! A backend only needs point reads, full-table scans and an atomic batch
//! write; transactions are layered on top by [`super::store::Transaction`].

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use super::schema::Table;
use super::store::{StoreError, StoreResult};

/// One buffered write of a transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Put {
        table: Table,
        key: String,
        value: Vec<u8>,
    },
    Delete {
        table: Table,
        key: String,
    },
}

pub trait KvBackend: Send + Sync {
    fn get(&self, table: Table, key: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Every `(key, value)` in `table`, ordered by key.
    fn scan(&self, table: Table) -> StoreResult<Vec<(String, Vec<u8>)>>;

    /// Apply all writes or none.
    fn commit(&self, writes: Vec<WriteOp>) -> StoreResult<()>;
}

/// Volatile backend kept in process memory.
#[derive(Default)]
pub struct MemoryBackend {
    tables: RwLock<HashMap<Table, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvBackend for MemoryBackend {
    fn get(&self, table: Table, key: &str) -> StoreResult<Option<Vec<u8>>> {
        let tables = self.tables.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(tables.get(&table).and_then(|rows| rows.get(key)).cloned())
    }

    fn scan(&self, table: Table) -> StoreResult<Vec<(String, Vec<u8>)>> {
        let tables = self.tables.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(tables
            .get(&table)
            .map(|rows| rows.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    fn commit(&self, writes: Vec<WriteOp>) -> StoreResult<()> {
        let mut tables = self.tables.write().map_err(|_| StoreError::LockPoisoned)?;
        for op in writes {
            match op {
                WriteOp::Put { table, key, value } => {
                    tables.entry(table).or_default().insert(key, value);
                }
                WriteOp::Delete { table, key } => {
                    if let Some(rows) = tables.get_mut(&table) {
                        rows.remove(&key);
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(feature = "rocksdb")]
pub use rocks::RocksBackend;

#[cfg(feature = "rocksdb")]
mod rocks {
    use std::path::{Path, PathBuf};

    use rocksdb::{ColumnFamilyDescriptor, IteratorMode, Options, WriteBatch, DB};

    use super::{KvBackend, WriteOp};
    use crate::state::schema::{Table, ALL_TABLES};
    use crate::state::store::{StoreError, StoreResult};

    /// Persistent backend with one column family per table.
    pub struct RocksBackend {
        db: DB,
        path: PathBuf,
    }

    impl RocksBackend {
        /// Open or create the database at `path`.
        pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
            let path = path.as_ref().to_path_buf();

            let mut opts = Options::default();
            opts.create_if_missing(true);
            opts.create_missing_column_families(true);

            let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_TABLES
                .iter()
                .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
                .collect();

            let db = DB::open_cf_descriptors(&opts, &path, cf_descriptors)?;
            Ok(Self { db, path })
        }

        pub fn path(&self) -> &Path {
            &self.path
        }

        fn cf(&self, table: Table) -> StoreResult<&rocksdb::ColumnFamily> {
            self.db
                .cf_handle(table.name())
                .ok_or_else(|| StoreError::TableNotFound(table.name().to_string()))
        }
    }

    impl KvBackend for RocksBackend {
        fn get(&self, table: Table, key: &str) -> StoreResult<Option<Vec<u8>>> {
            let cf = self.cf(table)?;
            Ok(self.db.get_cf(cf, key.as_bytes())?)
        }

        fn scan(&self, table: Table) -> StoreResult<Vec<(String, Vec<u8>)>> {
            let cf = self.cf(table)?;
            let mut rows = Vec::new();
            for item in self.db.iterator_cf(cf, IteratorMode::Start) {
                let (key, value) = item?;
                let key = String::from_utf8(key.to_vec())
                    .map_err(|e| StoreError::Deserialization(e.to_string()))?;
                rows.push((key, value.to_vec()));
            }
            Ok(rows)
        }

        fn commit(&self, writes: Vec<WriteOp>) -> StoreResult<()> {
            let mut batch = WriteBatch::default();
            for op in writes {
                match op {
                    WriteOp::Put { table, key, value } => {
                        batch.put_cf(self.cf(table)?, key.as_bytes(), value);
                    }
                    WriteOp::Delete { table, key } => {
                        batch.delete_cf(self.cf(table)?, key.as_bytes());
                    }
                }
            }
            self.db.write(batch)?;
            Ok(())
        }
    }
}
