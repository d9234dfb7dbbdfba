//! Distributed query protocol
//!
//! Counterparties exchange queries over DRPC with two methods:
//!
//! - `submit_query_request` stores a responder [`Query`]. When the
//!   [`ForwardingPolicy`] names further counterparties the query becomes
//!   `forwarded` and one requester child per target is created and sent on.
//! - `submit_query_response` resolves the query it names. A resolved child
//!   triggers a re-read of all its siblings; once every one is resolved their
//!   responses are summed into the parent, which is answered upstream.
//!
//! ```text
//!   requester ──request──▶ Q1 (forwarded) ──request──▶ Q1a ─▶ supplier A
//!                                         └─request──▶ Q1b ─▶ supplier B
//!   requester ◀─response── Q1 = Σ(Q1a, Q1b) ◀──response── A, B
//! ```
//!
//! Fan-in is derived from persisted rows only, so duplicate or reordered
//! responses never double-count and never answer upstream twice.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::{ReconcileError, ReconcileResult};
use crate::agent::{AgentApi, JsonRpcError, JsonRpcRequest, JsonRpcResponse};
use crate::events::{AgentEvent, DrpcMessageRecord, EventHandler};
use crate::state::{Connection, Query, QueryRole, QueryStatus, QueryType, SharedStore, Transaction};

pub const SUBMIT_QUERY_REQUEST: &str = "submit_query_request";
pub const SUBMIT_QUERY_RESPONSE: &str = "submit_query_response";

// ============================================================================
// Wire format
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequestParams {
    /// Sender's identifier for the query; echoed back in the response.
    pub id: String,
    #[serde(rename = "type")]
    pub query_type: QueryType,
    #[serde(default)]
    pub created_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_time: Option<DateTime<Utc>>,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResponseParams {
    /// Identifier of the query being answered, as assigned by its requester.
    pub id: String,
    #[serde(rename = "type", default)]
    pub query_type: Option<QueryType>,
    pub data: Value,
}

/// Answer to a `total_carbon_embodiment` query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CarbonEmbodimentResponse {
    pub mass: f64,
    #[serde(default = "default_unit")]
    pub unit: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub partial_responses: Vec<Value>,
}

fn default_unit() -> String {
    "kg".to_string()
}

// ============================================================================
// Forwarding policy
// ============================================================================

/// A counterparty a query is forwarded to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardTarget {
    /// Local connection row id.
    pub connection_id: String,
    /// Subject the counterparty should answer for.
    pub subject_id: String,
}

/// Decides which counterparties a received query is forwarded to.
pub trait ForwardingPolicy: Send + Sync {
    fn targets(&self, query: &Query) -> Vec<ForwardTarget>;
}

/// Every query is answered locally.
pub struct NoForwarding;

impl ForwardingPolicy for NoForwarding {
    fn targets(&self, _query: &Query) -> Vec<ForwardTarget> {
        Vec::new()
    }
}

/// Fixed routing table from subject id to the suppliers of its parts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StaticForwarding {
    routes: HashMap<String, Vec<ForwardTarget>>,
}

impl StaticForwarding {
    pub fn new(routes: HashMap<String, Vec<ForwardTarget>>) -> Self {
        Self { routes }
    }

    pub fn route(mut self, subject_id: &str, target: ForwardTarget) -> Self {
        self.routes
            .entry(subject_id.to_string())
            .or_default()
            .push(target);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl ForwardingPolicy for StaticForwarding {
    fn targets(&self, query: &Query) -> Vec<ForwardTarget> {
        query
            .subject_id()
            .and_then(|subject| self.routes.get(subject))
            .cloned()
            .unwrap_or_default()
    }
}

// ============================================================================
// Aggregation
// ============================================================================

#[derive(Debug, Error, PartialEq)]
pub enum AggregateError {
    #[error("Child {0} has no response")]
    MissingResponse(String),

    #[error("Child {child} response is invalid: {reason}")]
    InvalidResponse { child: String, reason: String },

    #[error("Child {child} answered in {found}, expected {expected}")]
    MixedUnits {
        child: String,
        expected: String,
        found: String,
    },
}

/// Combine the resolved children of `parent` into the parent's response.
pub fn aggregate_responses(parent: &Query, children: &[Query]) -> Result<Value, AggregateError> {
    match parent.query_type {
        QueryType::TotalCarbonEmbodiment => {
            let mut total = 0.0;
            let mut unit: Option<String> = None;
            let mut partials = Vec::with_capacity(children.len());

            for child in children {
                let raw = child
                    .response
                    .clone()
                    .ok_or_else(|| AggregateError::MissingResponse(child.id.clone()))?;
                let answer: CarbonEmbodimentResponse = serde_json::from_value(raw.clone())
                    .map_err(|e| AggregateError::InvalidResponse {
                        child: child.id.clone(),
                        reason: e.to_string(),
                    })?;
                match &unit {
                    Some(expected) if *expected != answer.unit => {
                        return Err(AggregateError::MixedUnits {
                            child: child.id.clone(),
                            expected: expected.clone(),
                            found: answer.unit,
                        });
                    }
                    Some(_) => {}
                    None => unit = Some(answer.unit.clone()),
                }
                total += answer.mass;
                partials.push(raw);
            }

            let combined = CarbonEmbodimentResponse {
                mass: total,
                unit: unit.unwrap_or_else(default_unit),
                subject_id: parent.subject_id().map(String::from),
                partial_responses: partials,
            };
            serde_json::to_value(combined).map_err(|e| AggregateError::InvalidResponse {
                child: parent.id.clone(),
                reason: e.to_string(),
            })
        }
    }
}

// ============================================================================
// Handler
// ============================================================================

/// Outcome of an inbound request, returned to the sender as the DRPC reply.
#[derive(Debug, Clone, PartialEq)]
enum Reply {
    Ack(Value),
    Reject(JsonRpcError),
}

impl Reply {
    fn invalid_params(message: impl Into<String>) -> Self {
        Self::Reject(JsonRpcError::new(JsonRpcError::INVALID_PARAMS, message))
    }
}

/// The sender has no local connection row. Rejected rather than retried,
/// since no retry can make it known.
fn unknown_connection(record: &DrpcMessageRecord) -> Reply {
    Reply::invalid_params(format!("Unknown connection: {}", record.connection_id))
}

pub struct QueryProtocolHandler {
    store: SharedStore,
    agent: Arc<dyn AgentApi>,
    forwarding: Arc<dyn ForwardingPolicy>,
}

impl QueryProtocolHandler {
    pub fn new(store: SharedStore, agent: Arc<dyn AgentApi>) -> Self {
        Self {
            store,
            agent,
            forwarding: Arc::new(NoForwarding),
        }
    }

    pub fn with_forwarding(mut self, policy: Arc<dyn ForwardingPolicy>) -> Self {
        self.forwarding = policy;
        self
    }

    /// Handle one inbound DRPC request and submit the reply.
    pub async fn on_request(&self, record: &DrpcMessageRecord) -> ReconcileResult<()> {
        let reply = match record.request.method.as_str() {
            SUBMIT_QUERY_REQUEST => match serde_json::from_value(record.request.params.clone()) {
                Ok(params) => self.handle_query_request(record, params).await?,
                Err(e) => Reply::invalid_params(e.to_string()),
            },
            SUBMIT_QUERY_RESPONSE => match serde_json::from_value(record.request.params.clone()) {
                Ok(params) => self.handle_query_response(record, params).await?,
                Err(e) => Reply::invalid_params(e.to_string()),
            },
            other => Reply::Reject(JsonRpcError::new(
                JsonRpcError::METHOD_NOT_FOUND,
                format!("Unknown method: {}", other),
            )),
        };

        let response = match reply {
            Reply::Ack(result) => JsonRpcResponse::success(record.request.id.clone(), result),
            Reply::Reject(error) => {
                warn!(
                    rpc_id = %record.request.id,
                    method = %record.request.method,
                    code = error.code,
                    error = %error.message,
                    "Rejecting DRPC request"
                );
                JsonRpcResponse::failure(record.request.id.clone(), error)
            }
        };
        self.agent.submit_drpc_response(&record.id, &response).await?;
        Ok(())
    }

    async fn handle_query_request(
        &self,
        record: &DrpcMessageRecord,
        params: QueryRequestParams,
    ) -> ReconcileResult<Reply> {
        let parent = {
            let mut tx = self.store.begin().await;
            let Some(conn) = tx.connection_by_agent_id(&record.connection_id)? else {
                return Ok(unknown_connection(record));
            };

            if let Some(existing) = tx.query_by_remote_id(&conn.id, &params.id)? {
                debug!(query_id = %existing.id, remote_query_id = %params.id, "Duplicate query request");
                drop(tx);
                if existing.status == QueryStatus::Forwarded {
                    self.send_pending_children(&existing).await?;
                }
                return Ok(Reply::Ack(Value::Null));
            }

            let mut query = Query::new(&conn.id, params.query_type, QueryRole::Responder, params.data);
            query.remote_query_id = Some(params.id.clone());
            query.expires_at = params.expires_time;

            let targets = self.forwarding.targets(&query);
            if !targets.is_empty() {
                query.status = QueryStatus::Forwarded;
            }
            let query = tx.insert(query)?;

            for target in &targets {
                let mut details = query.details.clone();
                if let Some(obj) = details.as_object_mut() {
                    obj.insert("subjectId".into(), Value::String(target.subject_id.clone()));
                }
                let mut child = Query::new(
                    &target.connection_id,
                    query.query_type,
                    QueryRole::Requester,
                    details,
                )
                .with_parent(&query.id);
                child.expires_at = query.expires_at;
                tx.insert(child)?;
            }
            tx.commit()?;

            info!(
                query_id = %query.id,
                remote_query_id = %params.id,
                children = targets.len(),
                status = %query.status,
                "Query received"
            );
            query
        };

        if parent.status == QueryStatus::Forwarded {
            self.send_pending_children(&parent).await?;
        }
        Ok(Reply::Ack(Value::Null))
    }

    /// Send every child of `parent` not yet delivered to its counterparty.
    async fn send_pending_children(&self, parent: &Query) -> ReconcileResult<()> {
        let pending: Vec<Query> = {
            let tx = self.store.begin().await;
            tx.query_children(&parent.id)?
                .into_iter()
                .filter(|c| c.status == QueryStatus::PendingYourInput)
                .collect()
        };

        for child in pending {
            let agent_connection_id = {
                let tx = self.store.begin().await;
                let conn: Connection = tx
                    .get(&child.connection_id)?
                    .ok_or_else(|| ReconcileError::ConnectionNotFound(child.connection_id.clone()))?;
                conn.agent_connection_id
                    .ok_or_else(|| ReconcileError::ConnectionNotEstablished(conn.id.clone()))?
            };

            // Sent outside any transaction; a crash before the status update
            // below leaves the child pending and it is sent again on retry.
            let request = JsonRpcRequest::new(
                SUBMIT_QUERY_REQUEST,
                json!({
                    "id": child.id,
                    "type": child.query_type,
                    "createdTime": child.created_at,
                    "expiresTime": child.expires_at,
                    "data": child.details,
                }),
            );
            self.agent
                .send_drpc_request(&agent_connection_id, &request)
                .await?;

            let mut tx = self.store.begin().await;
            // The answer may already have arrived.
            tx.update::<Query>(&child.id, |q| {
                if q.status == QueryStatus::PendingYourInput {
                    q.status = QueryStatus::PendingTheirInput;
                }
            })?;
            tx.commit()?;
            debug!(query_id = %child.id, parent_id = %parent.id, "Forwarded child query");
        }
        Ok(())
    }

    async fn handle_query_response(
        &self,
        record: &DrpcMessageRecord,
        params: QueryResponseParams,
    ) -> ReconcileResult<Reply> {
        let mut tx = self.store.begin().await;
        let Some(conn) = tx.connection_by_agent_id(&record.connection_id)? else {
            return Ok(unknown_connection(record));
        };

        let query = match tx.get::<Query>(&params.id)? {
            Some(query) if query.connection_id == conn.id => query,
            _ => return Ok(Reply::invalid_params(format!("Unknown query: {}", params.id))),
        };
        if query.is_resolved() {
            debug!(query_id = %query.id, "Duplicate query response");
            return Ok(Reply::Ack(Value::Null));
        }

        let response_id = record.request.id.to_string();
        let query = tx.update::<Query>(&query.id, |q| {
            q.response = Some(params.data);
            q.response_id = Some(response_id);
            q.status = QueryStatus::Resolved;
        })?;
        info!(query_id = %query.id, "Query resolved");

        if let Some(parent_id) = query.parent_id.as_deref() {
            self.reevaluate_parent(&mut tx, parent_id).await?;
        }
        tx.commit()?;
        Ok(Reply::Ack(Value::Null))
    }

    /// Resolve `parent_id` and answer upstream once all its children are resolved.
    async fn reevaluate_parent(&self, tx: &mut Transaction, parent_id: &str) -> ReconcileResult<()> {
        let parent: Query = tx
            .get(parent_id)?
            .ok_or_else(|| ReconcileError::QueryNotFound(parent_id.to_string()))?;
        if parent.status != QueryStatus::Forwarded {
            debug!(query_id = %parent.id, status = %parent.status, "Parent no longer awaiting children");
            return Ok(());
        }

        let children = tx.query_children(parent_id)?;
        let outstanding = children.iter().filter(|c| !c.is_resolved()).count();
        if outstanding > 0 {
            debug!(query_id = %parent.id, outstanding, total = children.len(), "Awaiting children");
            return Ok(());
        }

        let combined = match aggregate_responses(&parent, &children) {
            Ok(combined) => combined,
            Err(e) => {
                warn!(query_id = %parent.id, error = %e, "Cannot aggregate child responses");
                tx.update::<Query>(parent_id, |q| q.status = QueryStatus::Errored)?;
                return Ok(());
            }
        };

        let response_id = match parent.remote_query_id.as_deref() {
            Some(remote_query_id) => {
                let conn: Connection = tx
                    .get(&parent.connection_id)?
                    .ok_or_else(|| ReconcileError::ConnectionNotFound(parent.connection_id.clone()))?;
                let agent_connection_id = conn
                    .agent_connection_id
                    .ok_or_else(|| ReconcileError::ConnectionNotEstablished(conn.id.clone()))?;
                let request = JsonRpcRequest::new(
                    SUBMIT_QUERY_RESPONSE,
                    json!({
                        "id": remote_query_id,
                        "type": parent.query_type,
                        "data": combined,
                    }),
                );
                self.agent
                    .send_drpc_request(&agent_connection_id, &request)
                    .await?;
                Some(request.id.to_string())
            }
            None => None,
        };

        tx.update::<Query>(parent_id, |q| {
            q.response = Some(combined);
            q.status = QueryStatus::Resolved;
            if response_id.is_some() {
                q.response_id = response_id;
            }
        })?;
        info!(query_id = %parent_id, children = children.len(), "Forwarded query resolved");
        Ok(())
    }
}

#[async_trait]
impl EventHandler<AgentEvent> for QueryProtocolHandler {
    fn name(&self) -> &str {
        "query-protocol"
    }

    async fn handle(&self, event: &AgentEvent) -> anyhow::Result<()> {
        match event {
            AgentEvent::DrpcRequestStateChanged(record) if record.is_inbound_request() => {
                self.on_request(record).await?;
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::RpcId;
    use crate::events::{DrpcRole, DrpcState};
    use crate::reconcilers::testing::RecordingAgent;
    use crate::state::{ConnectionStatus, Store};
    use std::time::Duration;

    struct Network {
        store: SharedStore,
        agent: Arc<RecordingAgent>,
        /// Connection to the downstream requester.
        buyer: Connection,
        supplier_a: Connection,
        supplier_b: Connection,
    }

    async fn connection(store: &SharedStore, name: &str, agent_id: &str) -> Connection {
        let mut conn = Connection::new(name, name);
        conn.status = ConnectionStatus::VerifiedBoth;
        conn.agent_connection_id = Some(agent_id.to_string());
        store.insert(conn).await.unwrap()
    }

    async fn network() -> Network {
        let store = Store::in_memory().shared();
        Network {
            buyer: connection(&store, "Buyer", "agent-buyer").await,
            supplier_a: connection(&store, "Supplier A", "agent-a").await,
            supplier_b: connection(&store, "Supplier B", "agent-b").await,
            agent: Arc::new(RecordingAgent::default()),
            store,
        }
    }

    fn forwarding(net: &Network) -> Arc<StaticForwarding> {
        Arc::new(
            StaticForwarding::default()
                .route(
                    "product-1",
                    ForwardTarget {
                        connection_id: net.supplier_a.id.clone(),
                        subject_id: "part-a".into(),
                    },
                )
                .route(
                    "product-1",
                    ForwardTarget {
                        connection_id: net.supplier_b.id.clone(),
                        subject_id: "part-b".into(),
                    },
                ),
        )
    }

    fn handler(net: &Network, forward: bool) -> QueryProtocolHandler {
        let handler = QueryProtocolHandler::new(net.store.clone(), net.agent.clone());
        if forward {
            handler.with_forwarding(forwarding(net))
        } else {
            handler
        }
    }

    fn inbound(agent_connection_id: &str, method: &str, params: Value, rpc_id: i64) -> DrpcMessageRecord {
        DrpcMessageRecord {
            id: format!("drpc-{}", rpc_id),
            request: JsonRpcRequest {
                jsonrpc: "2.0".into(),
                method: method.into(),
                params,
                id: RpcId::Number(rpc_id),
            },
            connection_id: agent_connection_id.into(),
            role: DrpcRole::Server,
            state: DrpcState::RequestReceived,
        }
    }

    fn query_request(rpc_id: i64) -> DrpcMessageRecord {
        inbound(
            "agent-buyer",
            SUBMIT_QUERY_REQUEST,
            json!({
                "id": "buyer-query-1",
                "type": "total_carbon_embodiment",
                "createdTime": "2026-10-01T00:00:00Z",
                "expiresTime": "2026-11-01T00:00:00Z",
                "data": {"subjectId": "product-1", "quantity": 3},
            }),
            rpc_id,
        )
    }

    fn query_response(agent_id: &str, query_id: &str, mass: f64, unit: &str, rpc_id: i64) -> DrpcMessageRecord {
        inbound(
            agent_id,
            SUBMIT_QUERY_RESPONSE,
            json!({
                "id": query_id,
                "type": "total_carbon_embodiment",
                "data": {"mass": mass, "unit": unit},
            }),
            rpc_id,
        )
    }

    async fn all_queries(net: &Network) -> Vec<Query> {
        net.store.find(|_: &Query| true).await.unwrap()
    }

    async fn root(net: &Network) -> Query {
        net.store
            .find(|q: &Query| q.parent_id.is_none())
            .await
            .unwrap()
            .remove(0)
    }

    async fn child_for(net: &Network, conn: &Connection) -> Query {
        net.store
            .find(|q: &Query| q.connection_id == conn.id && q.parent_id.is_some())
            .await
            .unwrap()
            .remove(0)
    }

    #[tokio::test]
    async fn test_request_without_forwarding_creates_leaf() {
        let net = network().await;
        handler(&net, false).on_request(&query_request(1)).await.unwrap();

        let queries = all_queries(&net).await;
        assert_eq!(queries.len(), 1);
        let q = &queries[0];
        assert_eq!(q.status, QueryStatus::PendingYourInput);
        assert_eq!(q.role, QueryRole::Responder);
        assert_eq!(q.connection_id, net.buyer.id);
        assert_eq!(q.remote_query_id.as_deref(), Some("buyer-query-1"));
        assert_eq!(q.subject_id(), Some("product-1"));
        assert!(q.expires_at.is_some());

        let submitted = net.agent.submitted_responses();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].0, "drpc-1");
        assert!(submitted[0].1.error.is_none());
        assert!(net.agent.sent_requests().is_empty());
    }

    #[tokio::test]
    async fn test_forwarded_request_fans_out() {
        let net = network().await;
        handler(&net, true).on_request(&query_request(1)).await.unwrap();

        let parent = root(&net).await;
        assert_eq!(parent.status, QueryStatus::Forwarded);

        let sent = net.agent.sent_with_method(SUBMIT_QUERY_REQUEST);
        assert_eq!(sent.len(), 2);
        let mut targets: Vec<&str> = sent.iter().map(|(agent, _)| agent.as_str()).collect();
        targets.sort();
        assert_eq!(targets, vec!["agent-a", "agent-b"]);

        for conn in [&net.supplier_a, &net.supplier_b] {
            let child = child_for(&net, conn).await;
            assert_eq!(child.parent_id.as_deref(), Some(parent.id.as_str()));
            assert_eq!(child.status, QueryStatus::PendingTheirInput);
            assert_eq!(child.role, QueryRole::Requester);
            assert_eq!(child.details["quantity"], 3);
            let (_, request) = sent
                .iter()
                .find(|(_, r)| r.params["id"] == child.id.as_str())
                .unwrap();
            assert_eq!(request.params["data"]["subjectId"], child.details["subjectId"]);
        }
    }

    #[tokio::test]
    async fn test_duplicate_request_creates_no_rows() {
        let net = network().await;
        let handler = handler(&net, true);
        handler.on_request(&query_request(1)).await.unwrap();
        handler.on_request(&query_request(2)).await.unwrap();

        assert_eq!(all_queries(&net).await.len(), 3);
        assert_eq!(net.agent.sent_with_method(SUBMIT_QUERY_REQUEST).len(), 2);
        assert_eq!(net.agent.submitted_responses().len(), 2);
    }

    #[tokio::test]
    async fn test_failed_forward_resumes_on_retry() {
        let net = network().await;
        let handler = handler(&net, true);
        net.agent.fail_next_sends(1);

        assert!(handler.on_request(&query_request(1)).await.is_err());
        assert!(net.agent.submitted_responses().is_empty());

        handler.on_request(&query_request(1)).await.unwrap();
        assert_eq!(all_queries(&net).await.len(), 3);
        assert_eq!(net.agent.sent_with_method(SUBMIT_QUERY_REQUEST).len(), 2);
        for conn in [&net.supplier_a, &net.supplier_b] {
            assert_eq!(child_for(&net, conn).await.status, QueryStatus::PendingTheirInput);
        }
    }

    #[tokio::test]
    async fn test_store_usable_while_forward_is_in_flight() {
        let net = network().await;
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        *net.agent.send_gate.lock().unwrap() = Some(gate.clone());
        let handler = handler(&net, true);
        let task = tokio::spawn(async move { handler.on_request(&query_request(1)).await });

        // The first send is parked; the store must not be locked meanwhile.
        let store = net.store.clone();
        let children = tokio::time::timeout(Duration::from_secs(1), async move {
            loop {
                let children = store
                    .find(|q: &Query| q.parent_id.is_some())
                    .await
                    .unwrap();
                if children.len() == 2 {
                    return children;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(children.iter().all(|c| c.status == QueryStatus::PendingYourInput));

        gate.add_permits(2);
        task.await.unwrap().unwrap();
        for conn in [&net.supplier_a, &net.supplier_b] {
            assert_eq!(child_for(&net, conn).await.status, QueryStatus::PendingTheirInput);
        }
    }

    #[tokio::test]
    async fn test_fan_in_aggregates_once_all_children_resolve() {
        let net = network().await;
        let handler = handler(&net, true);
        handler.on_request(&query_request(1)).await.unwrap();
        let child_a = child_for(&net, &net.supplier_a).await;
        let child_b = child_for(&net, &net.supplier_b).await;

        handler
            .on_request(&query_response("agent-a", &child_a.id, 200.0, "kg", 10))
            .await
            .unwrap();
        // N-1 resolved: parent waits, nothing goes upstream.
        assert_eq!(root(&net).await.status, QueryStatus::Forwarded);
        assert!(net.agent.sent_with_method(SUBMIT_QUERY_RESPONSE).is_empty());

        handler
            .on_request(&query_response("agent-b", &child_b.id, 58.0, "kg", 11))
            .await
            .unwrap();

        let parent = root(&net).await;
        assert_eq!(parent.status, QueryStatus::Resolved);
        let response = parent.response.clone().unwrap();
        assert_eq!(response["mass"], 258.0);
        assert_eq!(response["unit"], "kg");
        assert_eq!(response["subjectId"], "product-1");
        assert_eq!(response["partialResponses"].as_array().unwrap().len(), 2);

        let upstream = net.agent.sent_with_method(SUBMIT_QUERY_RESPONSE);
        assert_eq!(upstream.len(), 1);
        assert_eq!(upstream[0].0, "agent-buyer");
        assert_eq!(upstream[0].1.params["id"], "buyer-query-1");
        assert_eq!(upstream[0].1.params["data"]["mass"], 258.0);
        assert_eq!(parent.response_id, Some(upstream[0].1.id.to_string()));

        let child_a = child_for(&net, &net.supplier_a).await;
        assert_eq!(child_a.response_id.as_deref(), Some("10"));
    }

    #[tokio::test]
    async fn test_duplicate_child_response_is_idempotent() {
        let net = network().await;
        let handler = handler(&net, true);
        handler.on_request(&query_request(1)).await.unwrap();
        let child_a = child_for(&net, &net.supplier_a).await;
        let child_b = child_for(&net, &net.supplier_b).await;

        handler
            .on_request(&query_response("agent-a", &child_a.id, 200.0, "kg", 10))
            .await
            .unwrap();
        handler
            .on_request(&query_response("agent-b", &child_b.id, 58.0, "kg", 11))
            .await
            .unwrap();
        // Redelivered, with a different figure that must not be counted.
        handler
            .on_request(&query_response("agent-b", &child_b.id, 999.0, "kg", 12))
            .await
            .unwrap();
        handler
            .on_request(&query_response("agent-a", &child_a.id, 200.0, "kg", 10))
            .await
            .unwrap();

        assert_eq!(root(&net).await.response.unwrap()["mass"], 258.0);
        assert_eq!(net.agent.sent_with_method(SUBMIT_QUERY_RESPONSE).len(), 1);
        assert_eq!(net.agent.submitted_responses().len(), 5);
    }

    #[tokio::test]
    async fn test_mixed_units_error_the_parent() {
        let net = network().await;
        let handler = handler(&net, true);
        handler.on_request(&query_request(1)).await.unwrap();
        let child_a = child_for(&net, &net.supplier_a).await;
        let child_b = child_for(&net, &net.supplier_b).await;

        handler
            .on_request(&query_response("agent-a", &child_a.id, 200.0, "kg", 10))
            .await
            .unwrap();
        handler
            .on_request(&query_response("agent-b", &child_b.id, 0.058, "t", 11))
            .await
            .unwrap();

        assert_eq!(root(&net).await.status, QueryStatus::Errored);
        assert!(net.agent.sent_with_method(SUBMIT_QUERY_RESPONSE).is_empty());
    }

    #[tokio::test]
    async fn test_failed_upstream_send_rolls_back_child() {
        let net = network().await;
        let handler = handler(&net, true);
        handler.on_request(&query_request(1)).await.unwrap();
        let child_a = child_for(&net, &net.supplier_a).await;
        let child_b = child_for(&net, &net.supplier_b).await;
        handler
            .on_request(&query_response("agent-a", &child_a.id, 200.0, "kg", 10))
            .await
            .unwrap();

        net.agent.fail_next_sends(1);
        let last = query_response("agent-b", &child_b.id, 58.0, "kg", 11);
        assert!(handler.on_request(&last).await.is_err());
        assert_eq!(child_for(&net, &net.supplier_b).await.status, QueryStatus::PendingTheirInput);
        assert_eq!(root(&net).await.status, QueryStatus::Forwarded);

        handler.on_request(&last).await.unwrap();
        assert_eq!(root(&net).await.status, QueryStatus::Resolved);
        assert_eq!(net.agent.sent_with_method(SUBMIT_QUERY_RESPONSE).len(), 1);
    }

    #[tokio::test]
    async fn test_root_response_is_recorded() {
        let net = network().await;
        let mut asked = Query::new(
            &net.supplier_a.id,
            QueryType::TotalCarbonEmbodiment,
            QueryRole::Requester,
            json!({"subjectId": "part-a"}),
        );
        asked.status = QueryStatus::PendingTheirInput;
        let asked = net.store.insert(asked).await.unwrap();

        handler(&net, false)
            .on_request(&query_response("agent-a", &asked.id, 12.5, "kg", 7))
            .await
            .unwrap();

        let stored: Query = net.store.get(&asked.id).await.unwrap().unwrap();
        assert_eq!(stored.status, QueryStatus::Resolved);
        assert_eq!(stored.response.unwrap()["mass"], 12.5);
        assert_eq!(stored.response_id.as_deref(), Some("7"));
        assert!(net.agent.sent_requests().is_empty());
    }

    #[tokio::test]
    async fn test_response_from_wrong_connection_is_rejected() {
        let net = network().await;
        let handler = handler(&net, true);
        handler.on_request(&query_request(1)).await.unwrap();
        let child_a = child_for(&net, &net.supplier_a).await;

        handler
            .on_request(&query_response("agent-b", &child_a.id, 1.0, "kg", 10))
            .await
            .unwrap();
        let (_, reply) = net.agent.submitted_responses().pop().unwrap();
        assert_eq!(reply.error.unwrap().code, JsonRpcError::INVALID_PARAMS);
        assert_eq!(child_for(&net, &net.supplier_a).await.status, QueryStatus::PendingTheirInput);
    }

    #[tokio::test]
    async fn test_unknown_method_and_query_get_rpc_errors() {
        let net = network().await;
        let handler = handler(&net, false);

        handler
            .on_request(&inbound("agent-buyer", "delete_everything", json!({}), 1))
            .await
            .unwrap();
        handler
            .on_request(&query_response("agent-buyer", "no-such-query", 1.0, "kg", 2))
            .await
            .unwrap();
        handler
            .on_request(&inbound("agent-buyer", SUBMIT_QUERY_REQUEST, json!({"id": 5}), 3))
            .await
            .unwrap();

        let codes: Vec<i64> = net
            .agent
            .submitted_responses()
            .into_iter()
            .map(|(_, r)| r.error.unwrap().code)
            .collect();
        assert_eq!(
            codes,
            vec![
                JsonRpcError::METHOD_NOT_FOUND,
                JsonRpcError::INVALID_PARAMS,
                JsonRpcError::INVALID_PARAMS
            ]
        );
        assert!(all_queries(&net).await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_connection_is_rejected_not_failed() {
        let net = network().await;
        let handler = handler(&net, true);

        handler
            .on_request(&inbound(
                "agent-stranger",
                SUBMIT_QUERY_REQUEST,
                query_request(1).request.params,
                1,
            ))
            .await
            .unwrap();
        handler
            .on_request(&query_response("agent-stranger", "any-query", 1.0, "kg", 2))
            .await
            .unwrap();

        let replies = net.agent.submitted_responses();
        assert_eq!(replies.len(), 2);
        for (_, reply) in replies {
            let error = reply.error.unwrap();
            assert_eq!(error.code, JsonRpcError::INVALID_PARAMS);
            assert!(error.message.contains("agent-stranger"));
        }
        assert!(all_queries(&net).await.is_empty());
        assert!(net.agent.sent_requests().is_empty());
    }

    #[tokio::test]
    async fn test_outbound_drpc_states_are_ignored() {
        let net = network().await;
        let handler = handler(&net, false);
        let mut record = query_request(1);
        record.role = DrpcRole::Client;
        record.state = DrpcState::Completed;

        handler
            .handle(&AgentEvent::DrpcRequestStateChanged(record))
            .await
            .unwrap();
        assert!(all_queries(&net).await.is_empty());
        assert!(net.agent.submitted_responses().is_empty());
    }

    #[test]
    fn test_aggregate_requires_responses() {
        let parent = Query::new("c", QueryType::TotalCarbonEmbodiment, QueryRole::Responder, json!({}));
        let child = Query::new("c", QueryType::TotalCarbonEmbodiment, QueryRole::Requester, json!({}));
        assert_eq!(
            aggregate_responses(&parent, &[child.clone()]),
            Err(AggregateError::MissingResponse(child.id.clone()))
        );

        let mut bad = child;
        bad.response = Some(json!({"unit": "kg"}));
        assert!(matches!(
            aggregate_responses(&parent, &[bad]),
            Err(AggregateError::InvalidResponse { .. })
        ));
    }
}
