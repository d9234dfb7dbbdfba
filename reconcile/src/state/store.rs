//! Transactional state store
//!
//! Reconcilers open a [`Transaction`] with [`Store::begin`], read and write
//! through it, and call [`Transaction::commit`]. Writes are buffered in the
//! transaction and applied as one atomic batch; dropping a transaction
//! without committing discards them. Transactions are serialized, so a
//! read-then-write inside one can never lose an update to a concurrent one.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use super::backend::{KvBackend, MemoryBackend, WriteOp};
use super::schema::Table;
use super::types::*;

/// Error type for state store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[cfg(feature = "rocksdb")]
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Row not found: {table}/{id}")]
    NotFound { table: Table, id: String },

    #[error("Row already exists: {table}/{id}")]
    Duplicate { table: Table, id: String },

    #[error("{table}/{id} references missing {target}/{target_id}")]
    DanglingReference {
        table: Table,
        id: String,
        target: Table,
        target_id: String,
    },

    #[error("Lock poisoned")]
    LockPoisoned,

    #[error("Table not found: {0}")]
    TableNotFound(String),
}

/// Result type for state store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Shared reference to Store
pub type SharedStore = Arc<Store>;

pub struct Store {
    backend: Arc<dyn KvBackend>,
    tx_lock: Arc<Mutex<()>>,
}

impl Store {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self {
            backend,
            tx_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Volatile store, used by tests and ephemeral deployments.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Open or create a RocksDB-backed store at `path`.
    #[cfg(feature = "rocksdb")]
    pub fn open(path: impl AsRef<std::path::Path>) -> StoreResult<Self> {
        Ok(Self::new(Arc::new(super::backend::RocksBackend::open(path)?)))
    }

    pub fn shared(self) -> SharedStore {
        Arc::new(self)
    }

    /// Start a transaction, waiting for any other one to finish.
    ///
    /// The lock is held until the transaction is committed or dropped, so
    /// slow awaits inside a transaction stall every other handler. Callers
    /// keep agent calls outside it, except the upstream query answer, which
    /// must roll back together with the child resolution that produced it.
    pub async fn begin(&self) -> Transaction {
        let guard = Arc::clone(&self.tx_lock).lock_owned().await;
        Transaction {
            backend: Arc::clone(&self.backend),
            overlay: HashMap::new(),
            writes: Vec::new(),
            _guard: guard,
        }
    }

    // =========================================================================
    // Single-statement helpers (each runs in its own transaction)
    // =========================================================================

    pub async fn get<R: Record>(&self, id: &str) -> StoreResult<Option<R>> {
        self.begin().await.get(id)
    }

    pub async fn find<R: Record>(&self, filter: impl Fn(&R) -> bool) -> StoreResult<Vec<R>> {
        self.begin().await.find(filter)
    }

    pub async fn insert<R: Record>(&self, record: R) -> StoreResult<R> {
        let mut tx = self.begin().await;
        let record = tx.insert(record)?;
        tx.commit()?;
        Ok(record)
    }
}

/// A unit of work against the store. Dropped without commit ⇒ rolled back.
pub struct Transaction {
    backend: Arc<dyn KvBackend>,
    overlay: HashMap<(Table, String), Option<Vec<u8>>>,
    writes: Vec<WriteOp>,
    _guard: OwnedMutexGuard<()>,
}

impl Transaction {
    // =========================================================================
    // Generic operations
    // =========================================================================

    fn read_raw(&self, table: Table, key: &str) -> StoreResult<Option<Vec<u8>>> {
        match self.overlay.get(&(table, key.to_string())) {
            Some(buffered) => Ok(buffered.clone()),
            None => self.backend.get(table, key),
        }
    }

    fn write_raw(&mut self, table: Table, key: &str, value: Option<Vec<u8>>) {
        let op = match value.clone() {
            Some(value) => WriteOp::Put {
                table,
                key: key.to_string(),
                value,
            },
            None => WriteOp::Delete {
                table,
                key: key.to_string(),
            },
        };
        self.overlay.insert((table, key.to_string()), value);
        self.writes.push(op);
    }

    fn exists(&self, table: Table, key: &str) -> StoreResult<bool> {
        Ok(self.read_raw(table, key)?.is_some())
    }

    pub fn get<R: Record>(&self, id: &str) -> StoreResult<Option<R>> {
        match self.read_raw(R::TABLE, id)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every row of `R`'s table matching `filter`, oldest first.
    pub fn find<R: Record>(&self, filter: impl Fn(&R) -> bool) -> StoreResult<Vec<R>> {
        let mut rows: HashMap<String, Vec<u8>> = self.backend.scan(R::TABLE)?.into_iter().collect();
        for ((table, key), buffered) in &self.overlay {
            if *table != R::TABLE {
                continue;
            }
            match buffered {
                Some(bytes) => {
                    rows.insert(key.clone(), bytes.clone());
                }
                None => {
                    rows.remove(key);
                }
            }
        }

        let mut matched = Vec::new();
        for bytes in rows.values() {
            let row: R = decode(bytes)?;
            if filter(&row) {
                matched.push(row);
            }
        }
        matched.sort_by(|a, b| {
            a.created_at()
                .cmp(&b.created_at())
                .then_with(|| a.id().cmp(b.id()))
        });
        Ok(matched)
    }

    pub fn find_one<R: Record>(&self, filter: impl Fn(&R) -> bool) -> StoreResult<Option<R>> {
        Ok(self.find(filter)?.into_iter().next())
    }

    /// Insert a new row. Fails on duplicate ids and dangling references.
    pub fn insert<R: Record>(&mut self, record: R) -> StoreResult<R> {
        if self.exists(R::TABLE, record.id())? {
            return Err(StoreError::Duplicate {
                table: R::TABLE,
                id: record.id().to_string(),
            });
        }
        for (target, target_id) in record.references() {
            if !self.exists(target, &target_id)? {
                return Err(StoreError::DanglingReference {
                    table: R::TABLE,
                    id: record.id().to_string(),
                    target,
                    target_id,
                });
            }
        }
        let bytes = encode(&record)?;
        self.write_raw(R::TABLE, record.id(), Some(bytes));
        Ok(record)
    }

    /// Apply `patch` to an existing row and stamp it as updated.
    pub fn update<R: Record>(&mut self, id: &str, patch: impl FnOnce(&mut R)) -> StoreResult<R> {
        let mut row: R = self.get(id)?.ok_or_else(|| StoreError::NotFound {
            table: R::TABLE,
            id: id.to_string(),
        })?;
        patch(&mut row);
        row.touch(Utc::now());
        let bytes = encode(&row)?;
        self.write_raw(R::TABLE, id, Some(bytes));
        Ok(row)
    }

    /// Remove a row. Returns whether it existed.
    pub fn delete<R: Record>(&mut self, id: &str) -> StoreResult<bool> {
        let existed = self.exists(R::TABLE, id)?;
        if existed {
            self.write_raw(R::TABLE, id, None);
        }
        Ok(existed)
    }

    /// Atomically apply every buffered write.
    pub fn commit(self) -> StoreResult<()> {
        let count = self.writes.len();
        if count > 0 {
            self.backend.commit(self.writes)?;
        }
        debug!(writes = count, "Transaction committed");
        Ok(())
    }

    /// Discard every buffered write.
    pub fn rollback(self) {
        debug!(writes = self.writes.len(), "Transaction rolled back");
    }

    // =========================================================================
    // Lookups used by the reconcilers
    // =========================================================================

    pub fn invite_by_oob_id(&self, oob_invite_id: &str) -> StoreResult<Option<ConnectionInvite>> {
        self.find_one(|invite: &ConnectionInvite| invite.oob_invite_id == oob_invite_id)
    }

    pub fn connection_by_agent_id(&self, agent_connection_id: &str) -> StoreResult<Option<Connection>> {
        self.find_one(|conn: &Connection| {
            conn.agent_connection_id.as_deref() == Some(agent_connection_id)
        })
    }

    pub fn query_children(&self, parent_id: &str) -> StoreResult<Vec<Query>> {
        self.find(|query: &Query| query.parent_id.as_deref() == Some(parent_id))
    }

    /// A query the counterparty on `connection_id` sent us with `remote_query_id`.
    pub fn query_by_remote_id(
        &self,
        connection_id: &str,
        remote_query_id: &str,
    ) -> StoreResult<Option<Query>> {
        self.find_one(|query: &Query| {
            query.connection_id == connection_id
                && query.remote_query_id.as_deref() == Some(remote_query_id)
        })
    }
}

fn encode<R: Record>(record: &R) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(record).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<R: Record>(bytes: &[u8]) -> StoreResult<R> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Deserialization(e.to_string()))
}
