//! Agent event ingestion
//!
//! ```text
//! agent stream ──▶ normalize ──▶ IndexedRetryEmitter ──▶ reconcilers ──▶ store
//! ```
//!
//! 1. **Types** (`types.rs`): typed agent notifications and their kinds.
//! 2. **Normalize** (`normalize.rs`): `{type, payload}` frames to
//!    [`AgentEvent`], plus the replay filter used after reconnects.
//! 3. **Emitter** (`emitter.rs`): latest-wins retrying dispatch.

pub mod emitter;
pub mod normalize;
pub mod types;

pub use emitter::{
    Event, EventHandler, EventId, FatalError, IndexedRetryEmitter, RetryConfig, RetryEnvelope,
    TerminalBehavior,
};
pub use normalize::{
    normalize, normalize_envelope, NormalizeError, ReplayFilter, DEFAULT_REPLAY_CAPACITY,
};
pub use types::{
    AgentConnectionState, AgentEvent, ConnectionRecord, CredentialRecord, CredentialRole,
    CredentialState, DidChange, DidRotated, DrpcMessageRecord, DrpcRole, DrpcState, EventKind,
};

/// Emitter specialised to agent events.
pub type AgentEmitter = IndexedRetryEmitter<AgentEvent>;
