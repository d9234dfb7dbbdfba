//! Event reconciliation core
//!
//! Consumes the unordered, at-least-once lifecycle events of an identity agent
//! and drives the locally persisted connection, credential and query state to
//! a consistent result.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   ┌───────────────────────┐   ┌───────────────────────┐
//! │ agent stream │──▶│ events::normalize     │──▶│ IndexedRetryEmitter   │
//! └──────────────┘   └───────────────────────┘   │  latest-wins retries  │
//!                                                └───────────┬───────────┘
//!                    ┌───────────────────────────────────────┼─────────────┐
//!                    ▼                                       ▼             ▼
//!          ConnectionReconciler                  CredentialReconciler  QueryProtocolHandler
//!                    │                                       │             │
//!                    └────────────────┬──────────────────────┘             │
//!                                     ▼                                    ▼
//!                              state::Store  ◀──────── one transaction per event
//!                                                                          │
//!                                                        AgentApi (DRPC) ◀─┘
//! ```
//!
//! # Modules
//!
//! - [`bijection`]: invertible map tracking the current event per resource
//! - [`events`]: event types, frame normalization and the retrying emitter
//! - [`state`]: rows, transactional store and storage backends
//! - [`agent`]: the RPC surface the reconcilers need from the agent
//! - [`reconcilers`]: connection, credential and query protocol handlers

pub mod agent;
pub mod bijection;
pub mod events;
pub mod reconcilers;
pub mod state;

pub use agent::{AgentApi, AgentError, AgentResult, JsonRpcRequest, JsonRpcResponse};
pub use bijection::KeyedBijection;
pub use events::{AgentEmitter, AgentEvent, EventKind, IndexedRetryEmitter, RetryConfig, TerminalBehavior};
pub use reconcilers::{
    ConnectionReconciler, CredentialReconciler, IdentityCredentialHandler, QueryProtocolHandler,
    ReconcileError, Reconcilers,
};
pub use state::{SharedStore, Store, StoreError};
