//! Envelope normalization for the agent event stream
//!
//! Frames arrive as `{type, payload}` JSON. Recognized types become an
//! [`AgentEvent`]; unrecognized types are accepted and ignored; anything that
//! fails validation is rejected so the caller can log and discard it.

use std::collections::{HashMap, VecDeque};

use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use super::types::{AgentEvent, ConnectionRecord, CredentialRecord, EventKind};

#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("Frame is not a JSON envelope: {0}")]
    InvalidEnvelope(String),

    #[error("Invalid {kind} payload: {reason}")]
    InvalidPayload { kind: EventKind, reason: String },
}

#[derive(Debug, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    payload: Value,
}

/// Parse one text frame from the event stream.
///
/// Returns `Ok(None)` for well-formed envelopes of a type this core does not
/// consume.
pub fn normalize(frame: &str) -> Result<Option<AgentEvent>, NormalizeError> {
    let envelope: RawEnvelope =
        serde_json::from_str(frame).map_err(|e| NormalizeError::InvalidEnvelope(e.to_string()))?;
    normalize_envelope(&envelope.event_type, envelope.payload)
}

/// Typed conversion of an already-split envelope.
pub fn normalize_envelope(
    event_type: &str,
    payload: Value,
) -> Result<Option<AgentEvent>, NormalizeError> {
    let Some(kind) = EventKind::from_wire_name(event_type) else {
        return Ok(None);
    };

    let invalid = |e: serde_json::Error| NormalizeError::InvalidPayload {
        kind,
        reason: e.to_string(),
    };

    let event = match kind {
        EventKind::ConnectionStateChanged => {
            let payload: ConnectionPayload = serde_json::from_value(payload).map_err(invalid)?;
            AgentEvent::ConnectionStateChanged(payload.connection_record)
        }
        EventKind::ConnectionDidRotated => {
            AgentEvent::ConnectionDidRotated(serde_json::from_value(payload).map_err(invalid)?)
        }
        EventKind::CredentialStateChanged => {
            let payload: CredentialPayload = serde_json::from_value(payload).map_err(invalid)?;
            AgentEvent::CredentialStateChanged(payload.credential_record)
        }
        EventKind::DrpcRequestStateChanged => {
            let payload: DrpcPayload = serde_json::from_value(payload).map_err(invalid)?;
            AgentEvent::DrpcRequestStateChanged(payload.drpc_message_record)
        }
    };

    Ok(Some(event))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectionPayload {
    connection_record: ConnectionRecord,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CredentialPayload {
    credential_record: CredentialRecord,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DrpcPayload {
    drpc_message_record: super::types::DrpcMessageRecord,
}

/// Records tracked by a default [`ReplayFilter`].
pub const DEFAULT_REPLAY_CAPACITY: usize = 10_000;

type RecordKey = (EventKind, String);

/// Tracks the last state seen per record so a post-reconnect listing only
/// replays what the live stream has not already delivered.
///
/// Bounded: past `capacity` records the oldest is forgotten, which at worst
/// replays it once more.
#[derive(Debug)]
pub struct ReplayFilter {
    seen: HashMap<RecordKey, String>,
    order: VecDeque<RecordKey>,
    capacity: usize,
}

impl Default for ReplayFilter {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_REPLAY_CAPACITY)
    }
}

impl ReplayFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            seen: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record an event observed on the live stream.
    pub fn observe(&mut self, event: &AgentEvent) {
        if let Some(state) = state_label(event) {
            self.remember((event.kind(), event.resource_index()), state);
        }
    }

    /// Whether a listed record should be replayed. Marks it as seen.
    pub fn should_replay(&mut self, event: &AgentEvent) -> bool {
        let Some(state) = state_label(event) else {
            return true;
        };
        let key = (event.kind(), event.resource_index());
        match self.seen.get(&key) {
            Some(previous) if *previous == state => false,
            _ => {
                self.remember(key, state);
                true
            }
        }
    }

    fn remember(&mut self, key: RecordKey, state: String) {
        if self.seen.insert(key.clone(), state).is_none() {
            self.order.push_back(key);
        }
        while self.seen.len() > self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.seen.remove(&oldest);
                }
                None => break,
            }
        }
    }

    /// Convert listed connections into the events worth replaying.
    pub fn replay_connections(&mut self, records: Vec<ConnectionRecord>) -> Vec<AgentEvent> {
        records
            .into_iter()
            .map(AgentEvent::ConnectionStateChanged)
            .filter(|event| self.should_replay(event))
            .collect()
    }

    /// Convert listed credentials into the events worth replaying.
    pub fn replay_credentials(&mut self, records: Vec<CredentialRecord>) -> Vec<AgentEvent> {
        records
            .into_iter()
            .map(AgentEvent::CredentialStateChanged)
            .filter(|event| self.should_replay(event))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

fn state_label(event: &AgentEvent) -> Option<String> {
    let value = match event {
        AgentEvent::ConnectionStateChanged(record) => serde_json::to_value(record.state),
        AgentEvent::CredentialStateChanged(record) => serde_json::to_value(record.state),
        _ => return None,
    };
    value.ok().map(|v| v.as_str().unwrap_or_default().to_string())
}
