//! Service wiring: store, agent client, emitter, reconcilers, event source.

use std::future::Future;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use reconcile::agent::AgentApi;
use reconcile::events::{AgentEmitter, EventKind, FatalError};
use reconcile::reconcilers::{
    ConnectionReconciler, CredentialReconciler, IdentityCredentialHandler, QueryProtocolHandler,
    Reconcilers,
};
use reconcile::state::{SharedStore, Store};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::agent_client::HttpAgentClient;
use crate::config::PortalConfig;
use crate::event_source::EventSource;

pub struct PortalService {
    config: PortalConfig,
    store: SharedStore,
    agent: Arc<dyn AgentApi>,
    emitter: AgentEmitter,
    fatal_rx: UnboundedReceiver<FatalError<EventKind>>,
}

impl PortalService {
    /// Wire everything against the HTTP agent client.
    pub fn build(config: PortalConfig) -> Result<Self> {
        let agent = HttpAgentClient::new(&config.agent_url, config.request_timeout())
            .context("Failed to create agent client")?;
        let store = open_store(&config)?;
        Self::with_parts(config, store, Arc::new(agent))
    }

    /// Wire against an existing store and agent.
    pub fn with_parts(config: PortalConfig, store: SharedStore, agent: Arc<dyn AgentApi>) -> Result<Self> {
        let emitter = AgentEmitter::new(config.retry.clone());
        let fatal_rx = emitter
            .take_fatal_receiver()
            .ok_or_else(|| anyhow!("Fatal error channel already taken"))?;

        let mut credential = CredentialReconciler::new(store.clone(), agent.clone());
        match &config.identity_schema {
            Some(schema) => {
                info!(name = %schema.name, version = %schema.version, "Identity credential handler enabled");
                credential = credential.with_handler(Arc::new(IdentityCredentialHandler::new(
                    store.clone(),
                    agent.clone(),
                    &schema.name,
                    &schema.version,
                )));
            }
            None => warn!("No identity schema configured; credential events are only logged"),
        }

        Reconcilers {
            connection: Arc::new(
                ConnectionReconciler::new(store.clone(), agent.clone())
                    .with_close_orphaned(config.close_orphaned_connections),
            ),
            credential: Arc::new(credential),
            query: Arc::new(
                QueryProtocolHandler::new(store.clone(), agent.clone())
                    .with_forwarding(Arc::new(config.forwarding.clone())),
            ),
        }
        .register(&emitter);

        Ok(Self {
            config,
            store,
            agent,
            emitter,
            fatal_rx,
        })
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub fn emitter(&self) -> &AgentEmitter {
        &self.emitter
    }

    /// Run until `shutdown` resolves or a handler escalates a fatal error.
    ///
    /// Either way the event source is cancelled and the emitter drained
    /// before this returns.
    pub async fn run(mut self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let cancel = CancellationToken::new();
        let source = EventSource::new(
            self.config.events_url.clone(),
            self.config.stream.clone(),
            self.emitter.clone(),
            self.agent.clone(),
        );
        let source_task = tokio::spawn(source.run(cancel.clone()));
        info!(
            agent_url = %self.config.agent_url,
            events_url = %self.config.events_url,
            "Portal sync running"
        );

        let outcome = tokio::select! {
            _ = shutdown => {
                info!("Shutdown requested");
                Ok(())
            }
            Some(fatal) = self.fatal_rx.recv() => {
                error!(
                    kind = %fatal.kind,
                    index = fatal.index.as_deref().unwrap_or("-"),
                    handler = %fatal.handler,
                    attempts = fatal.attempts,
                    "Unrecoverable event failure: {}",
                    fatal.error
                );
                Err(anyhow!("{}", fatal))
            }
        };

        cancel.cancel();
        if let Err(e) = source_task.await {
            warn!("Event source task failed: {}", e);
        }
        outcome
    }
}

fn open_store(config: &PortalConfig) -> Result<SharedStore> {
    #[cfg(feature = "rocksdb")]
    {
        if let Some(path) = &config.state_path {
            let store = Store::open(path)
                .context(format!("Failed to open state at {}", path.display()))?;
            info!(path = %path.display(), "Opened RocksDB state store");
            return Ok(store.shared());
        }
    }

    match &config.state_path {
        Some(path) => warn!(
            path = %path.display(),
            "Built without the rocksdb feature; state is kept in memory"
        ),
        None => info!("No state path configured; state is kept in memory"),
    }
    Ok(Store::in_memory().shared())
}
