//! Agent lifecycle events
//!
//! Typed forms of the notifications the identity agent pushes over its event
//! stream. Every variant knows which resource it concerns so the emitter can
//! decide which in-flight event is authoritative.

use serde::{Deserialize, Serialize};

use crate::agent::JsonRpcRequest;

/// Discriminant of [`AgentEvent`], used for handler registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    ConnectionStateChanged,
    ConnectionDidRotated,
    CredentialStateChanged,
    DrpcRequestStateChanged,
}

impl EventKind {
    pub const ALL: [EventKind; 4] = [
        EventKind::ConnectionStateChanged,
        EventKind::ConnectionDidRotated,
        EventKind::CredentialStateChanged,
        EventKind::DrpcRequestStateChanged,
    ];

    /// Wire name used in the `type` field of the stream envelope.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Self::ConnectionStateChanged => "ConnectionStateChanged",
            Self::ConnectionDidRotated => "ConnectionDidRotated",
            Self::CredentialStateChanged => "CredentialStateChanged",
            Self::DrpcRequestStateChanged => "DrpcRequestStateChanged",
        }
    }

    pub fn from_wire_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.wire_name() == name)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Connection lifecycle state as reported by the agent (DID exchange).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentConnectionState {
    Start,
    InvitationSent,
    InvitationReceived,
    RequestSent,
    RequestReceived,
    ResponseSent,
    ResponseReceived,
    Abandoned,
    Completed,
    #[serde(other)]
    Unknown,
}

/// Connection record carried by connection events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRecord {
    pub id: String,
    pub state: AgentConnectionState,
    #[serde(default)]
    pub out_of_band_id: Option<String>,
    #[serde(default)]
    pub their_label: Option<String>,
}

/// A DID moving from one value to another. `to` is absent when cleared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DidChange {
    #[serde(default)]
    pub from: Option<String>,
    #[serde(default)]
    pub to: Option<String>,
}

/// Payload of `ConnectionDidRotated`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidRotated {
    pub connection_record: ConnectionRecord,
    #[serde(default)]
    pub their_did: Option<DidChange>,
    #[serde(default)]
    pub our_did: Option<DidChange>,
}

impl DidRotated {
    /// The counterparty rotated its DID to nothing, i.e. hung up.
    pub fn counterparty_hung_up(&self) -> bool {
        matches!(self.their_did, Some(DidChange { to: None, .. }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialState {
    ProposalSent,
    ProposalReceived,
    OfferSent,
    OfferReceived,
    Declined,
    RequestSent,
    RequestReceived,
    CredentialIssued,
    CredentialReceived,
    Done,
    Abandoned,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialRole {
    Issuer,
    Holder,
}

/// Credential exchange record carried by `CredentialStateChanged`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRecord {
    pub id: String,
    pub state: CredentialState,
    pub role: CredentialRole,
    pub protocol_version: String,
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrpcRole {
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DrpcState {
    RequestSent,
    RequestReceived,
    Completed,
    #[serde(other)]
    Unknown,
}

/// DRPC message record carried by `DrpcRequestStateChanged`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrpcMessageRecord {
    /// Agent-side record id. `submit_drpc_response` addresses the reply by
    /// it, so a record without one cannot be answered and fails to parse.
    pub id: String,
    pub request: JsonRpcRequest,
    pub connection_id: String,
    pub role: DrpcRole,
    pub state: DrpcState,
}

impl DrpcMessageRecord {
    /// An inbound request this node still has to answer.
    pub fn is_inbound_request(&self) -> bool {
        self.role == DrpcRole::Server && self.state == DrpcState::RequestReceived
    }
}

/// Normalized agent notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum AgentEvent {
    ConnectionStateChanged(ConnectionRecord),
    ConnectionDidRotated(DidRotated),
    CredentialStateChanged(CredentialRecord),
    DrpcRequestStateChanged(DrpcMessageRecord),
}

impl AgentEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::ConnectionStateChanged(_) => EventKind::ConnectionStateChanged,
            Self::ConnectionDidRotated(_) => EventKind::ConnectionDidRotated,
            Self::CredentialStateChanged(_) => EventKind::CredentialStateChanged,
            Self::DrpcRequestStateChanged(_) => EventKind::DrpcRequestStateChanged,
        }
    }

    /// Identifier of the resource this event concerns.
    ///
    /// RPC ids are chosen by the counterparty, so DRPC requests are keyed by
    /// connection and RPC id together.
    pub fn resource_index(&self) -> String {
        match self {
            Self::ConnectionStateChanged(record) => record.id.clone(),
            Self::ConnectionDidRotated(rotated) => rotated.connection_record.id.clone(),
            Self::CredentialStateChanged(record) => record.id.clone(),
            Self::DrpcRequestStateChanged(record) => {
                format!("{}:{}", record.connection_id, record.request.id)
            }
        }
    }
}

impl crate::events::emitter::Event for AgentEvent {
    type Kind = EventKind;

    fn kind(&self) -> EventKind {
        AgentEvent::kind(self)
    }

    fn index(&self) -> Option<String> {
        Some(self.resource_index())
    }
}
