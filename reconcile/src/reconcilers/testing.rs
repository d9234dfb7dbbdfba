//! Recording fake agent shared by the reconciler tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Semaphore;

use crate::agent::*;
use crate::events::types::{ConnectionRecord, CredentialRecord};

#[derive(Default)]
pub(crate) struct RecordingAgent {
    pub closed: Mutex<Vec<String>>,
    /// `(agent connection id, request)` for every DRPC request sent.
    pub sent: Mutex<Vec<(String, JsonRpcRequest)>>,
    /// `(drpc record id, response)` for every DRPC response submitted.
    pub submitted: Mutex<Vec<(String, JsonRpcResponse)>>,
    /// `(call, credential id)` for the accept-* calls.
    pub accepted: Mutex<Vec<(&'static str, String)>>,
    pub format_data: Mutex<HashMap<String, CredentialFormatData>>,
    pub schemas: Mutex<HashMap<String, SchemaInfo>>,
    /// Number of upcoming `send_drpc_request` calls that fail.
    pub failing_sends: AtomicUsize,
    /// Number of upcoming accept-* calls that fail.
    pub failing_accepts: AtomicUsize,
    /// When set, each `send_drpc_request` first takes one permit from it.
    pub send_gate: Mutex<Option<Arc<Semaphore>>>,
}

impl RecordingAgent {
    /// Credential `credential_id` offers schema `name`/`version` inline.
    pub fn with_inline_schema(self, credential_id: &str, name: &str, version: &str) -> Self {
        let data = CredentialFormatData {
            proposal: None,
            offer: Some(FormatEntry {
                anoncreds: Some(AnonCredsFormat {
                    schema_name: Some(name.to_string()),
                    schema_version: Some(version.to_string()),
                    ..Default::default()
                }),
            }),
        };
        self.format_data
            .lock()
            .unwrap()
            .insert(credential_id.to_string(), data);
        self
    }

    /// Credential `credential_id` references `schema_id`, resolvable to `name`/`version`.
    pub fn with_schema_ref(self, credential_id: &str, schema_id: &str, name: &str, version: &str) -> Self {
        let data = CredentialFormatData {
            proposal: Some(FormatEntry {
                anoncreds: Some(AnonCredsFormat {
                    schema_id: Some(schema_id.to_string()),
                    ..Default::default()
                }),
            }),
            offer: None,
        };
        self.format_data
            .lock()
            .unwrap()
            .insert(credential_id.to_string(), data);
        self.schemas.lock().unwrap().insert(
            schema_id.to_string(),
            SchemaInfo {
                name: name.to_string(),
                version: version.to_string(),
                issuer_id: None,
            },
        );
        self
    }

    pub fn fail_next_sends(&self, count: usize) {
        self.failing_sends.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_accepts(&self, count: usize) {
        self.failing_accepts.store(count, Ordering::SeqCst);
    }

    pub fn sent_requests(&self) -> Vec<(String, JsonRpcRequest)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_with_method(&self, method: &str) -> Vec<(String, JsonRpcRequest)> {
        self.sent_requests()
            .into_iter()
            .filter(|(_, req)| req.method == method)
            .collect()
    }

    pub fn submitted_responses(&self) -> Vec<(String, JsonRpcResponse)> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn accepted_calls(&self) -> Vec<(&'static str, String)> {
        self.accepted.lock().unwrap().clone()
    }

    fn record_accept(&self, call: &'static str, credential_id: &str) -> AgentResult<()> {
        if self
            .failing_accepts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(AgentError::Status {
                status: 503,
                body: format!("{} unavailable", call),
            });
        }
        self.accepted
            .lock()
            .unwrap()
            .push((call, credential_id.to_string()));
        Ok(())
    }
}

#[async_trait]
impl AgentApi for RecordingAgent {
    async fn close_connection(&self, agent_connection_id: &str) -> AgentResult<()> {
        self.closed
            .lock()
            .unwrap()
            .push(agent_connection_id.to_string());
        Ok(())
    }

    async fn get_credential_format_data(
        &self,
        credential_id: &str,
    ) -> AgentResult<CredentialFormatData> {
        self.format_data
            .lock()
            .unwrap()
            .get(credential_id)
            .cloned()
            .ok_or_else(|| AgentError::NotFound(credential_id.to_string()))
    }

    async fn get_schema_by_id(&self, schema_id: &str) -> AgentResult<SchemaInfo> {
        self.schemas
            .lock()
            .unwrap()
            .get(schema_id)
            .cloned()
            .ok_or_else(|| AgentError::NotFound(schema_id.to_string()))
    }

    async fn send_drpc_request(
        &self,
        agent_connection_id: &str,
        request: &JsonRpcRequest,
    ) -> AgentResult<Option<JsonRpcResponse>> {
        let gate = self.send_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.acquire().await.unwrap().forget();
        }
        let failing = self.failing_sends.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_sends.store(failing - 1, Ordering::SeqCst);
            return Err(AgentError::RequestFailed("connection refused".into()));
        }
        self.sent
            .lock()
            .unwrap()
            .push((agent_connection_id.to_string(), request.clone()));
        Ok(None)
    }

    async fn submit_drpc_response(
        &self,
        drpc_record_id: &str,
        response: &JsonRpcResponse,
    ) -> AgentResult<()> {
        self.submitted
            .lock()
            .unwrap()
            .push((drpc_record_id.to_string(), response.clone()));
        Ok(())
    }

    async fn list_connections(&self) -> AgentResult<Vec<ConnectionRecord>> {
        Ok(Vec::new())
    }

    async fn list_credentials(&self) -> AgentResult<Vec<CredentialRecord>> {
        Ok(Vec::new())
    }

    async fn accept_proposal(&self, credential_id: &str) -> AgentResult<()> {
        self.record_accept("accept_proposal", credential_id)
    }

    async fn accept_request(&self, credential_id: &str) -> AgentResult<()> {
        self.record_accept("accept_request", credential_id)
    }

    async fn accept_offer(&self, credential_id: &str) -> AgentResult<()> {
        self.record_accept("accept_offer", credential_id)
    }

    async fn accept_credential(&self, credential_id: &str) -> AgentResult<()> {
        self.record_accept("accept_credential", credential_id)
    }
}
