//! Reconcilers: agent events applied to the state store
//!
//! | Reconciler | Event kinds | Index |
//! |---|---|---|
//! | [`ConnectionReconciler`] | `ConnectionStateChanged`, `ConnectionDidRotated` | agent connection id |
//! | [`CredentialReconciler`] | `CredentialStateChanged` | credential record id |
//! | [`QueryProtocolHandler`] | `DrpcRequestStateChanged` | RPC request id |
//!
//! Every reconciler does its reads and writes for one event inside one store
//! transaction. Errors returned from a handler are transient by contract: the
//! emitter retries them while the event is still current.

pub mod connection;
pub mod credential;
pub mod query;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use thiserror::Error;

use crate::agent::AgentError;
use crate::events::{AgentEmitter, EventKind};
use crate::state::StoreError;

pub use connection::{ConnectionOutcome, ConnectionReconciler};
pub use credential::{
    parse_error_report, CredentialHandler, CredentialReconciler, CredentialStage,
    IdentityCredentialHandler, PinFailureReport,
};
pub use query::{
    aggregate_responses, ForwardTarget, ForwardingPolicy, NoForwarding, QueryProtocolHandler,
    StaticForwarding, SUBMIT_QUERY_REQUEST, SUBMIT_QUERY_RESPONSE,
};

/// Error type for reconciler operations
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("No connection for {0}")]
    ConnectionNotFound(String),

    #[error("Connection {0} has no agent connection yet")]
    ConnectionNotEstablished(String),

    #[error("Query not found: {0}")]
    QueryNotFound(String),
}

/// Result type for reconciler operations
pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// The full set of reconcilers wired to one store and agent.
pub struct Reconcilers {
    pub connection: Arc<ConnectionReconciler>,
    pub credential: Arc<CredentialReconciler>,
    pub query: Arc<QueryProtocolHandler>,
}

impl Reconcilers {
    /// Subscribe every reconciler to the kinds it handles.
    pub fn register(&self, emitter: &AgentEmitter) {
        emitter.on(EventKind::ConnectionStateChanged, self.connection.clone());
        emitter.on(EventKind::ConnectionDidRotated, self.connection.clone());
        emitter.on(EventKind::CredentialStateChanged, self.credential.clone());
        emitter.on(EventKind::DrpcRequestStateChanged, self.query.clone());
    }
}
