//! Credential reconciler
//!
//! Resolves the schema of each credential exchange, picks the registered
//! [`CredentialHandler`] for that schema and calls the hook for the exchange's
//! current stage. Exchanges abandoned with a PIN failure report update the
//! connection's remaining PIN tries before the handler is told.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{ReconcileError, ReconcileResult};
use crate::agent::AgentApi;
use crate::events::{AgentEvent, CredentialRecord, CredentialRole, CredentialState, EventHandler};
use crate::state::{Connection, SharedStore};

/// Stage of a credential exchange this node acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialStage {
    ProposalReceived,
    OfferReceived,
    RequestReceived,
    CredentialReceived,
    Done,
    Abandoned,
}

impl CredentialStage {
    /// Stage for `(role, state)`, or `None` when this node has nothing to do.
    pub fn of(role: CredentialRole, state: CredentialState) -> Option<Self> {
        use CredentialRole::*;
        use CredentialState as S;
        match (role, state) {
            (Issuer, S::ProposalReceived) => Some(Self::ProposalReceived),
            (Issuer, S::RequestReceived) => Some(Self::RequestReceived),
            (Holder, S::OfferReceived) => Some(Self::OfferReceived),
            (Holder, S::CredentialReceived) => Some(Self::CredentialReceived),
            (_, S::Done) => Some(Self::Done),
            (_, S::Abandoned) => Some(Self::Abandoned),
            _ => None,
        }
    }
}

/// Structured error a counterparty attaches when it abandons an exchange.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PinFailureReport {
    pub message: String,
    #[serde(default)]
    pub pin_tries: Option<u32>,
}

/// Extract the JSON report embedded in an agent error message.
///
/// The agent wraps the report in free text (`"abandoned: {\"message\": ...}"`),
/// so everything from the first `{` to the last `}` is parsed.
pub fn parse_error_report(error_message: &str) -> Option<PinFailureReport> {
    let start = error_message.find('{')?;
    let end = error_message.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str(&error_message[start..=end]).ok()
}

/// Schema-specific behaviour for one credential type.
#[async_trait]
pub trait CredentialHandler: Send + Sync {
    fn schema_name(&self) -> &str;

    fn schema_version(&self) -> &str;

    async fn on_proposal_received(&self, _record: &CredentialRecord) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_offer_received(&self, _record: &CredentialRecord) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_request_received(&self, _record: &CredentialRecord) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_credential_received(&self, _record: &CredentialRecord) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_done(&self, _record: &CredentialRecord) -> anyhow::Result<()> {
        Ok(())
    }

    async fn on_abandoned(
        &self,
        _record: &CredentialRecord,
        _report: Option<&PinFailureReport>,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

type SchemaKey = (String, String);

pub struct CredentialReconciler {
    store: SharedStore,
    agent: Arc<dyn AgentApi>,
    handlers: HashMap<SchemaKey, Arc<dyn CredentialHandler>>,
}

impl CredentialReconciler {
    pub fn new(store: SharedStore, agent: Arc<dyn AgentApi>) -> Self {
        Self {
            store,
            agent,
            handlers: HashMap::new(),
        }
    }

    /// Register `handler` for its schema, replacing any previous one.
    pub fn with_handler(mut self, handler: Arc<dyn CredentialHandler>) -> Self {
        let key = (
            handler.schema_name().to_string(),
            handler.schema_version().to_string(),
        );
        self.handlers.insert(key, handler);
        self
    }

    /// Schema `(name, version)` of an exchange, from its format data.
    pub async fn resolve_schema(&self, credential_id: &str) -> ReconcileResult<Option<SchemaKey>> {
        let format = self.agent.get_credential_format_data(credential_id).await?;
        let Some(anoncreds) = format.anoncreds() else {
            return Ok(None);
        };
        if let (Some(name), Some(version)) = (&anoncreds.schema_name, &anoncreds.schema_version) {
            return Ok(Some((name.clone(), version.clone())));
        }
        match &anoncreds.schema_id {
            Some(schema_id) => {
                let schema = self.agent.get_schema_by_id(schema_id).await?;
                Ok(Some((schema.name, schema.version)))
            }
            None => Ok(None),
        }
    }

    pub async fn on_state_changed(&self, record: &CredentialRecord) -> anyhow::Result<()> {
        let Some(stage) = CredentialStage::of(record.role, record.state) else {
            debug!(credential_id = %record.id, state = ?record.state, role = ?record.role, "Credential state ignored");
            return Ok(());
        };

        let Some(schema) = self.resolve_schema(&record.id).await? else {
            debug!(credential_id = %record.id, "Credential has no resolvable schema");
            return Ok(());
        };
        let Some(handler) = self.handlers.get(&schema) else {
            debug!(credential_id = %record.id, schema = ?schema, "No handler for credential schema");
            return Ok(());
        };

        debug!(credential_id = %record.id, stage = ?stage, schema = %schema.0, "Credential stage");
        match stage {
            CredentialStage::ProposalReceived => handler.on_proposal_received(record).await,
            CredentialStage::OfferReceived => handler.on_offer_received(record).await,
            CredentialStage::RequestReceived => handler.on_request_received(record).await,
            CredentialStage::CredentialReceived => handler.on_credential_received(record).await,
            CredentialStage::Done => handler.on_done(record).await,
            CredentialStage::Abandoned => {
                let report = self.record_abandonment(record).await?;
                handler.on_abandoned(record, report.as_ref()).await
            }
        }
    }

    /// Apply the PIN failure report of an abandoned exchange, if it has one.
    async fn record_abandonment(
        &self,
        record: &CredentialRecord,
    ) -> ReconcileResult<Option<PinFailureReport>> {
        let Some(message) = record.error_message.as_deref() else {
            return Ok(None);
        };
        let Some(report) = parse_error_report(message) else {
            warn!(credential_id = %record.id, error_message = %message, "Malformed credential error report");
            return Ok(None);
        };
        let (Some(pin_tries), Some(agent_connection_id)) = (report.pin_tries, record.connection_id.as_deref())
        else {
            return Ok(Some(report));
        };

        let mut tx = self.store.begin().await;
        match tx.connection_by_agent_id(agent_connection_id)? {
            Some(conn) => {
                tx.update::<Connection>(&conn.id, |c| c.pin_tries_remaining_count = Some(pin_tries))?;
                tx.commit()?;
                info!(connection_id = %conn.id, pin_tries, "Recorded remaining PIN tries");
            }
            None => {
                warn!(agent_connection_id, "PIN failure report for unknown connection");
            }
        }
        Ok(Some(report))
    }
}

#[async_trait]
impl EventHandler<AgentEvent> for CredentialReconciler {
    fn name(&self) -> &str {
        "credential-reconciler"
    }

    async fn handle(&self, event: &AgentEvent) -> anyhow::Result<()> {
        match event {
            AgentEvent::CredentialStateChanged(record) => self.on_state_changed(record).await,
            _ => Ok(()),
        }
    }
}

/// Identity credential that verifies a counterparty relationship.
///
/// Issuing it to a counterparty means we verified them; receiving it means
/// they verified us.
pub struct IdentityCredentialHandler {
    store: SharedStore,
    agent: Arc<dyn AgentApi>,
    schema_name: String,
    schema_version: String,
}

impl IdentityCredentialHandler {
    pub fn new(
        store: SharedStore,
        agent: Arc<dyn AgentApi>,
        schema_name: impl Into<String>,
        schema_version: impl Into<String>,
    ) -> Self {
        Self {
            store,
            agent,
            schema_name: schema_name.into(),
            schema_version: schema_version.into(),
        }
    }

    async fn update_connection(
        &self,
        record: &CredentialRecord,
        patch: impl FnOnce(&mut Connection),
    ) -> ReconcileResult<()> {
        let Some(agent_connection_id) = record.connection_id.as_deref() else {
            warn!(credential_id = %record.id, "Credential exchange has no connection");
            return Ok(());
        };
        let mut tx = self.store.begin().await;
        let conn = tx
            .connection_by_agent_id(agent_connection_id)?
            .ok_or_else(|| ReconcileError::ConnectionNotFound(agent_connection_id.to_string()))?;
        let updated = tx.update::<Connection>(&conn.id, patch)?;
        tx.commit()?;
        if updated.status != conn.status {
            info!(connection_id = %conn.id, from = %conn.status, to = %updated.status, "Connection verified");
        }
        Ok(())
    }
}

#[async_trait]
impl CredentialHandler for IdentityCredentialHandler {
    fn schema_name(&self) -> &str {
        &self.schema_name
    }

    fn schema_version(&self) -> &str {
        &self.schema_version
    }

    async fn on_proposal_received(&self, record: &CredentialRecord) -> anyhow::Result<()> {
        let credential_id = record.id.clone();
        self.update_connection(record, move |c| {
            if !c.count_pin_attempt(&credential_id) {
                debug!(credential_id = %credential_id, "PIN attempt already counted");
            }
        })
        .await?;
        self.agent.accept_proposal(&record.id).await?;
        Ok(())
    }

    async fn on_offer_received(&self, record: &CredentialRecord) -> anyhow::Result<()> {
        self.agent.accept_offer(&record.id).await?;
        Ok(())
    }

    async fn on_request_received(&self, record: &CredentialRecord) -> anyhow::Result<()> {
        self.agent.accept_request(&record.id).await?;
        Ok(())
    }

    async fn on_credential_received(&self, record: &CredentialRecord) -> anyhow::Result<()> {
        self.agent.accept_credential(&record.id).await?;
        Ok(())
    }

    async fn on_done(&self, record: &CredentialRecord) -> anyhow::Result<()> {
        let role = record.role;
        self.update_connection(record, move |c| {
            let next = match role {
                CredentialRole::Issuer => c.status.with_them_verified(),
                CredentialRole::Holder => c.status.with_us_verified(),
            };
            if let Some(next) = next {
                c.transition(next);
            }
        })
        .await?;
        Ok(())
    }

    async fn on_abandoned(
        &self,
        record: &CredentialRecord,
        report: Option<&PinFailureReport>,
    ) -> anyhow::Result<()> {
        if let Some(report) = report {
            info!(credential_id = %record.id, message = %report.message, "Identity credential abandoned");
        }
        Ok(())
    }
}
