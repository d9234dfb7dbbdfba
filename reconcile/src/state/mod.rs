//! Persisted portal state
//!
//! The store is the single source of truth for connection status, credential
//! progress and the query tree:
//!
//! - `connection`: one row per counterparty relationship
//! - `connection_invite`: out-of-band invitations linked to a connection
//! - `query`: nodes of query trees, children linked through `parent_id`
//!
//! # Usage
//!
//! ```ignore
//! use reconcile::state::{Connection, ConnectionStatus, Store};
//!
//! let store = Store::in_memory();
//! let mut tx = store.begin().await;
//! let conn = tx.insert(Connection::new("Acme Ltd", "07964699"))?;
//! tx.update::<Connection>(&conn.id, |c| {
//!     c.transition(ConnectionStatus::Unverified);
//! })?;
//! tx.commit()?;
//! ```

pub mod backend;
pub mod schema;
pub mod store;
pub mod types;

pub use backend::{KvBackend, MemoryBackend, WriteOp};
#[cfg(feature = "rocksdb")]
pub use backend::RocksBackend;
pub use schema::Table;
pub use store::{SharedStore, Store, StoreError, StoreResult, Transaction};
pub use types::{
    new_row_id, Connection, ConnectionInvite, ConnectionStatus, InviteValidity, Query, QueryRole,
    QueryStatus, QueryType, Record, RowId,
};
