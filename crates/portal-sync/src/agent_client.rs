//! HTTP client for the identity agent's REST API
//!
//! Implements [`AgentApi`] over the agent's `/v1` routes. Path segments are
//! percent-encoded, so ledger-style ids (`did:…/anoncreds/v0/SCHEMA/…`) are
//! safe to pass through.

use std::time::Duration;

use async_trait::async_trait;
use reconcile::agent::{
    AgentApi, AgentError, AgentResult, CredentialFormatData, JsonRpcRequest, JsonRpcResponse,
    SchemaInfo,
};
use reconcile::events::{ConnectionRecord, CredentialRecord};
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

pub struct HttpAgentClient {
    base_url: Url,
    http: reqwest::Client,
}

impl HttpAgentClient {
    pub fn new(base_url: &str, timeout: Duration) -> AgentResult<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| AgentError::RequestFailed(format!("Invalid agent URL '{}': {}", base_url, e)))?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AgentError::RequestFailed(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { base_url, http })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, segments: &[&str]) -> AgentResult<Url> {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| AgentError::RequestFailed(format!("Agent URL cannot be a base: {}", self.base_url)))?;
            path.pop_if_empty();
            path.push("v1");
            path.extend(segments);
        }
        Ok(url)
    }

    /// Issue a request and decode the JSON body. `None` for empty responses.
    async fn call<B, T>(&self, method: Method, segments: &[&str], body: Option<&B>) -> AgentResult<Option<T>>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = self.url(segments)?;
        debug!(%method, %url, "Agent request");

        let mut request = self.http.request(method, url.clone());
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| AgentError::RequestFailed(format!("{} {}: {}", url.path(), url, e)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(AgentError::NotFound(url.path().to_string()));
        }
        let text = response
            .text()
            .await
            .map_err(|e| AgentError::RequestFailed(e.to_string()))?;
        if !status.is_success() {
            return Err(AgentError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        if status == StatusCode::NO_CONTENT || text.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| AgentError::Decode(e.to_string()))
    }

    async fn call_required<T: DeserializeOwned>(&self, segments: &[&str]) -> AgentResult<T> {
        self.call::<(), T>(Method::GET, segments, None)
            .await?
            .ok_or_else(|| AgentError::Decode(format!("Empty response from /v1/{}", segments.join("/"))))
    }

    async fn post_empty(&self, segments: &[&str]) -> AgentResult<()> {
        self.call::<(), serde_json::Value>(Method::POST, segments, None)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl AgentApi for HttpAgentClient {
    async fn close_connection(&self, agent_connection_id: &str) -> AgentResult<()> {
        self.call::<(), serde_json::Value>(Method::DELETE, &["connections", agent_connection_id], None)
            .await?;
        Ok(())
    }

    async fn get_credential_format_data(
        &self,
        credential_id: &str,
    ) -> AgentResult<CredentialFormatData> {
        self.call_required(&["credentials", credential_id, "format-data"])
            .await
    }

    async fn get_schema_by_id(&self, schema_id: &str) -> AgentResult<SchemaInfo> {
        self.call_required(&["schemas", schema_id]).await
    }

    async fn send_drpc_request(
        &self,
        agent_connection_id: &str,
        request: &JsonRpcRequest,
    ) -> AgentResult<Option<JsonRpcResponse>> {
        self.call(Method::POST, &["drpc", agent_connection_id, "request"], Some(request))
            .await
    }

    async fn submit_drpc_response(
        &self,
        drpc_record_id: &str,
        response: &JsonRpcResponse,
    ) -> AgentResult<()> {
        self.call::<_, serde_json::Value>(Method::POST, &["drpc", drpc_record_id, "response"], Some(response))
            .await?;
        Ok(())
    }

    async fn list_connections(&self) -> AgentResult<Vec<ConnectionRecord>> {
        Ok(self
            .call::<(), _>(Method::GET, &["connections"], None)
            .await?
            .unwrap_or_default())
    }

    async fn list_credentials(&self) -> AgentResult<Vec<CredentialRecord>> {
        Ok(self
            .call::<(), _>(Method::GET, &["credentials"], None)
            .await?
            .unwrap_or_default())
    }

    async fn accept_proposal(&self, credential_id: &str) -> AgentResult<()> {
        self.post_empty(&["credentials", credential_id, "accept-proposal"]).await
    }

    async fn accept_request(&self, credential_id: &str) -> AgentResult<()> {
        self.post_empty(&["credentials", credential_id, "accept-request"]).await
    }

    async fn accept_offer(&self, credential_id: &str) -> AgentResult<()> {
        self.post_empty(&["credentials", credential_id, "accept-offer"]).await
    }

    async fn accept_credential(&self, credential_id: &str) -> AgentResult<()> {
        self.post_empty(&["credentials", credential_id, "accept-credential"]).await
    }
}
