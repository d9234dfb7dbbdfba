//! Agent RPC interface
//!
//! The reconcilers never talk to the network directly: everything they need
//! from the identity agent goes through [`AgentApi`]. The production client
//! lives in the `portal-sync` crate; tests use recording fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::events::types::{ConnectionRecord, CredentialRecord};

/// JSON-RPC protocol version string.
pub const JSONRPC_VERSION: &str = "2.0";

/// Error type for agent calls
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Agent request failed: {0}")]
    RequestFailed(String),

    #[error("Agent returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Failed to decode agent response: {0}")]
    Decode(String),

    #[error("Agent not found: {0}")]
    NotFound(String),
}

/// Result type for agent calls
pub type AgentResult<T> = Result<T, AgentError>;

/// JSON-RPC request id: numbers and strings are both legal on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RpcId {
    Number(i64),
    String(String),
}

impl RpcId {
    pub fn new_random() -> Self {
        Self::String(uuid::Uuid::new_v4().to_string())
    }
}

impl std::fmt::Display for RpcId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::String(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    pub id: RpcId,
}

impl JsonRpcRequest {
    pub fn new(method: &str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: method.to_string(),
            params,
            id: RpcId::new_random(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcError {
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: RpcId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: RpcId, result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: RpcId, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// AnonCreds attributes of a proposal or offer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnonCredsFormat {
    #[serde(default)]
    pub schema_id: Option<String>,
    #[serde(default)]
    pub schema_name: Option<String>,
    #[serde(default)]
    pub schema_version: Option<String>,
    #[serde(default)]
    pub cred_def_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormatEntry {
    #[serde(default)]
    pub anoncreds: Option<AnonCredsFormat>,
}

/// Format data of a credential exchange (`get-credential-format-data`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialFormatData {
    #[serde(default)]
    pub proposal: Option<FormatEntry>,
    #[serde(default)]
    pub offer: Option<FormatEntry>,
}

impl CredentialFormatData {
    /// The offer's AnonCreds data, falling back to the proposal's.
    pub fn anoncreds(&self) -> Option<&AnonCredsFormat> {
        fn from(entry: &Option<FormatEntry>) -> Option<&AnonCredsFormat> {
            entry.as_ref().and_then(|e| e.anoncreds.as_ref())
        }
        from(&self.offer).or_else(|| from(&self.proposal))
    }
}

/// Schema metadata (`get-schema-by-id`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaInfo {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub issuer_id: Option<String>,
}

/// Calls the reconcilers make against the identity agent.
#[async_trait]
pub trait AgentApi: Send + Sync {
    /// `close-connection`
    async fn close_connection(&self, agent_connection_id: &str) -> AgentResult<()>;

    /// `get-credential-format-data`
    async fn get_credential_format_data(
        &self,
        credential_id: &str,
    ) -> AgentResult<CredentialFormatData>;

    /// `get-schema-by-id`
    async fn get_schema_by_id(&self, schema_id: &str) -> AgentResult<SchemaInfo>;

    /// Send a DRPC request to a counterparty over an established connection.
    async fn send_drpc_request(
        &self,
        agent_connection_id: &str,
        request: &JsonRpcRequest,
    ) -> AgentResult<Option<JsonRpcResponse>>;

    /// Answer an inbound DRPC request identified by its agent-side record id.
    async fn submit_drpc_response(
        &self,
        drpc_record_id: &str,
        response: &JsonRpcResponse,
    ) -> AgentResult<()>;

    /// Full current connection list, used to replay after a reconnect.
    async fn list_connections(&self) -> AgentResult<Vec<ConnectionRecord>>;

    /// Full current credential list, used to replay after a reconnect.
    async fn list_credentials(&self) -> AgentResult<Vec<CredentialRecord>>;

    async fn accept_proposal(&self, credential_id: &str) -> AgentResult<()>;

    async fn accept_request(&self, credential_id: &str) -> AgentResult<()>;

    async fn accept_offer(&self, credential_id: &str) -> AgentResult<()>;

    async fn accept_credential(&self, credential_id: &str) -> AgentResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rpc_id_accepts_numbers_and_strings() {
        let n: RpcId = serde_json::from_value(json!(7)).unwrap();
        let s: RpcId = serde_json::from_value(json!("abc")).unwrap();
        assert_eq!(n.to_string(), "7");
        assert_eq!(s.to_string(), "abc");
    }

    #[test]
    fn test_response_omits_absent_fields() {
        let resp = JsonRpcResponse::success(RpcId::Number(1), json!({}));
        let value = serde_json::to_value(&resp).unwrap();
        assert!(value.get("error").is_none());
        assert_eq!(value["jsonrpc"], "2.0");
    }

    #[test]
    fn test_format_data_prefers_offer() {
        let data: CredentialFormatData = serde_json::from_value(json!({
            "proposal": {"anoncreds": {"schema_name": "PROPOSED", "schema_version": "1.0"}},
            "offer": {"anoncreds": {"schema_id": "schema:1"}},
        }))
        .unwrap();
        assert_eq!(data.anoncreds().unwrap().schema_id.as_deref(), Some("schema:1"));

        let only_proposal: CredentialFormatData = serde_json::from_value(json!({
            "proposal": {"anoncreds": {"schema_name": "PROPOSED", "schema_version": "1.0"}},
        }))
        .unwrap();
        assert_eq!(
            only_proposal.anoncreds().unwrap().schema_name.as_deref(),
            Some("PROPOSED")
        );
    }
}
