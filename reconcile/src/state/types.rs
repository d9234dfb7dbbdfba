//! Persisted rows reconciled from agent events

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::schema::Table;

/// Unique identifier for rows
pub type RowId = String;

pub fn new_row_id() -> RowId {
    Uuid::new_v4().to_string()
}

/// A row type stored in one table.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const TABLE: Table;

    fn id(&self) -> &str;

    fn created_at(&self) -> DateTime<Utc>;

    /// Stamp the row as modified.
    fn touch(&mut self, now: DateTime<Utc>);

    /// Rows this row points at, which must exist when it is inserted.
    fn references(&self) -> Vec<(Table, String)> {
        Vec::new()
    }
}

// ============================================================================
// Connections
// ============================================================================

/// Verification status of a counterparty relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Invitation issued or received, agent connection not yet complete.
    Pending,
    /// Agent connection established, neither side verified.
    Unverified,
    /// We have verified them.
    VerifiedThem,
    /// They have verified us.
    VerifiedUs,
    VerifiedBoth,
    Disconnected,
}

impl ConnectionStatus {
    /// Whether moving from `self` to `next` is a forward step.
    pub fn can_transition_to(self, next: ConnectionStatus) -> bool {
        use ConnectionStatus::*;
        match (self, next) {
            (Disconnected, _) => false,
            (_, Disconnected) => true,
            (Pending, Unverified) => true,
            (Unverified, VerifiedThem | VerifiedUs | VerifiedBoth) => true,
            (VerifiedThem, VerifiedUs | VerifiedBoth) => true,
            (VerifiedUs, VerifiedBoth) => true,
            _ => false,
        }
    }

    /// Status after we verify the counterparty.
    pub fn with_them_verified(self) -> Option<ConnectionStatus> {
        match self {
            Self::Unverified => Some(Self::VerifiedThem),
            Self::VerifiedUs => Some(Self::VerifiedBoth),
            _ => None,
        }
    }

    /// Status after the counterparty verifies us.
    pub fn with_us_verified(self) -> Option<ConnectionStatus> {
        match self {
            Self::Unverified => Some(Self::VerifiedUs),
            Self::VerifiedThem => Some(Self::VerifiedBoth),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Unverified => "unverified",
            Self::VerifiedThem => "verified_them",
            Self::VerifiedUs => "verified_us",
            Self::VerifiedBoth => "verified_both",
            Self::Disconnected => "disconnected",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: RowId,
    pub company_name: String,
    pub company_number: String,
    pub status: ConnectionStatus,
    pub agent_connection_id: Option<String>,
    pub pin_attempt_count: Option<u32>,
    /// Credential exchange last counted in `pin_attempt_count`.
    #[serde(default)]
    pub pin_attempt_credential_id: Option<String>,
    pub pin_tries_remaining_count: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Connection {
    pub fn new(company_name: &str, company_number: &str) -> Self {
        let now = Utc::now();
        Self {
            id: new_row_id(),
            company_name: company_name.to_string(),
            company_number: company_number.to_string(),
            status: ConnectionStatus::Pending,
            agent_connection_id: None,
            pin_attempt_count: None,
            pin_attempt_credential_id: None,
            pin_tries_remaining_count: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Count one PIN attempt for credential exchange `credential_id`.
    ///
    /// The same exchange is counted once however often it is delivered.
    pub fn count_pin_attempt(&mut self, credential_id: &str) -> bool {
        if self.pin_attempt_credential_id.as_deref() == Some(credential_id) {
            return false;
        }
        self.pin_attempt_count = Some(self.pin_attempt_count.unwrap_or(0) + 1);
        self.pin_attempt_credential_id = Some(credential_id.to_string());
        true
    }

    /// Move to `next` if that is a forward step. Returns whether it moved.
    pub fn transition(&mut self, next: ConnectionStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }
}

impl Record for Connection {
    const TABLE: Table = Table::Connections;

    fn id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InviteValidity {
    Valid,
    Expired,
    TooManyAttempts,
    Used,
}

/// Out-of-band invitation issued by us or received from the counterparty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInvite {
    pub id: RowId,
    pub connection_id: RowId,
    pub oob_invite_id: String,
    /// Whether we issued the invitation.
    pub oob_is_ours: bool,
    pub validity: InviteValidity,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl ConnectionInvite {
    pub fn new(connection_id: &str, oob_invite_id: &str, oob_is_ours: bool) -> Self {
        let now = Utc::now();
        Self {
            id: new_row_id(),
            connection_id: connection_id.to_string(),
            oob_invite_id: oob_invite_id.to_string(),
            oob_is_ours,
            validity: InviteValidity::Valid,
            expires_at: now + chrono::Duration::days(7),
            created_at: now,
        }
    }
}

impl Record for ConnectionInvite {
    const TABLE: Table = Table::ConnectionInvites;

    fn id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn touch(&mut self, _now: DateTime<Utc>) {}

    fn references(&self) -> Vec<(Table, String)> {
        vec![(Table::Connections, self.connection_id.clone())]
    }
}

// ============================================================================
// Queries
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    TotalCarbonEmbodiment,
}

impl QueryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TotalCarbonEmbodiment => "total_carbon_embodiment",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    PendingYourInput,
    PendingTheirInput,
    Forwarded,
    Resolved,
    Errored,
}

impl std::fmt::Display for QueryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::PendingYourInput => "pending_your_input",
            Self::PendingTheirInput => "pending_their_input",
            Self::Forwarded => "forwarded",
            Self::Resolved => "resolved",
            Self::Errored => "errored",
        };
        f.write_str(s)
    }
}

/// Which side of the exchange this node is on for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryRole {
    /// We asked the counterparty.
    Requester,
    /// The counterparty asked us.
    Responder,
}

/// One node of a query tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub id: RowId,
    pub connection_id: RowId,
    pub query_type: QueryType,
    pub status: QueryStatus,
    pub role: QueryRole,
    /// Request payload: `subjectId` plus query-specific parameters.
    pub details: Value,
    pub response: Option<Value>,
    /// RPC message id that delivered the response.
    pub response_id: Option<String>,
    /// Set on children forwarded on behalf of a parent.
    pub parent_id: Option<RowId>,
    /// Identifier the counterparty uses for a query we are answering.
    pub remote_query_id: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Query {
    pub fn new(connection_id: &str, query_type: QueryType, role: QueryRole, details: Value) -> Self {
        let now = Utc::now();
        Self {
            id: new_row_id(),
            connection_id: connection_id.to_string(),
            query_type,
            status: QueryStatus::PendingYourInput,
            role,
            details,
            response: None,
            response_id: None,
            parent_id: None,
            remote_query_id: None,
            expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_parent(mut self, parent_id: &str) -> Self {
        self.parent_id = Some(parent_id.to_string());
        self
    }

    pub fn subject_id(&self) -> Option<&str> {
        self.details.get("subjectId").and_then(Value::as_str)
    }

    pub fn is_resolved(&self) -> bool {
        self.status == QueryStatus::Resolved
    }
}

impl Record for Query {
    const TABLE: Table = Table::Queries;

    fn id(&self) -> &str {
        &self.id
    }

    fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }

    fn references(&self) -> Vec<(Table, String)> {
        let mut refs = vec![(Table::Connections, self.connection_id.clone())];
        if let Some(ref parent) = self.parent_id {
            refs.push((Table::Queries, parent.clone()));
        }
        refs
    }
}
