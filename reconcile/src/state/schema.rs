//! Table definitions for the state store
//!
//! Each table maps to its own keyspace (a column family on the RocksDB
//! backend) keyed by row id.

use serde::{Deserialize, Serialize};

/// Table for counterparty connections
pub const TABLE_CONNECTIONS: &str = "connection";

/// Table for out-of-band invitations
pub const TABLE_CONNECTION_INVITES: &str = "connection_invite";

/// Table for query tree nodes
pub const TABLE_QUERIES: &str = "query";

/// All table names
pub const ALL_TABLES: &[&str] = &[TABLE_CONNECTIONS, TABLE_CONNECTION_INVITES, TABLE_QUERIES];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Table {
    Connections,
    ConnectionInvites,
    Queries,
}

impl Table {
    pub const ALL: [Table; 3] = [Table::Connections, Table::ConnectionInvites, Table::Queries];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Connections => TABLE_CONNECTIONS,
            Self::ConnectionInvites => TABLE_CONNECTION_INVITES,
            Self::Queries => TABLE_QUERIES,
        }
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
