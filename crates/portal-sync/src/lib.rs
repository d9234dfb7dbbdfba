//! Portal agent sync service
//!
//! Connects the [`reconcile`] core to a live identity agent: an HTTP client
//! for agent calls, a WebSocket event source with keepalive and replay on
//! reconnect, and layered configuration.

pub mod agent_client;
pub mod config;
pub mod event_source;
pub mod service;

pub use agent_client::HttpAgentClient;
pub use config::{ConfigError, PortalConfig, SchemaRef, StreamConfig};
pub use event_source::{EventSource, SessionEnd};
pub use service::PortalService;
