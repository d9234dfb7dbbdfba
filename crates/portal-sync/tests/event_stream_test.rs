//! Event source against a local WebSocket server.
//!
//! - Live frames and the post-connect replay both reach registered handlers.
//! - A peer that never answers pings is dropped and reconnected, and the
//!   replay filter keeps unchanged listed records from being dispatched twice.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use portal_sync::{EventSource, StreamConfig};
use reconcile::agent::*;
use reconcile::events::{
    AgentConnectionState, AgentEmitter, AgentEvent, ConnectionRecord, CredentialRecord,
    EventHandler, EventKind,
};
use reconcile::RetryConfig;

#[derive(Default)]
struct ListingAgent {
    connections: Vec<ConnectionRecord>,
    list_calls: AtomicUsize,
}

#[async_trait]
impl AgentApi for ListingAgent {
    async fn close_connection(&self, _id: &str) -> AgentResult<()> {
        Ok(())
    }

    async fn get_credential_format_data(&self, id: &str) -> AgentResult<CredentialFormatData> {
        Err(AgentError::NotFound(id.to_string()))
    }

    async fn get_schema_by_id(&self, id: &str) -> AgentResult<SchemaInfo> {
        Err(AgentError::NotFound(id.to_string()))
    }

    async fn send_drpc_request(
        &self,
        _agent_connection_id: &str,
        _request: &JsonRpcRequest,
    ) -> AgentResult<Option<JsonRpcResponse>> {
        Ok(None)
    }

    async fn submit_drpc_response(&self, _id: &str, _response: &JsonRpcResponse) -> AgentResult<()> {
        Ok(())
    }

    async fn list_connections(&self) -> AgentResult<Vec<ConnectionRecord>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.connections.clone())
    }

    async fn list_credentials(&self) -> AgentResult<Vec<CredentialRecord>> {
        Err(AgentError::RequestFailed("listing unavailable".into()))
    }

    async fn accept_proposal(&self, _id: &str) -> AgentResult<()> {
        Ok(())
    }

    async fn accept_request(&self, _id: &str) -> AgentResult<()> {
        Ok(())
    }

    async fn accept_offer(&self, _id: &str) -> AgentResult<()> {
        Ok(())
    }

    async fn accept_credential(&self, _id: &str) -> AgentResult<()> {
        Ok(())
    }
}

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<String>>,
}

impl Recorder {
    fn seen(&self) -> Vec<String> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventHandler<AgentEvent> for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn handle(&self, event: &AgentEvent) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(event.resource_index());
        Ok(())
    }
}

fn stream_config() -> StreamConfig {
    StreamConfig {
        ping_interval_ms: 50,
        pong_timeout_ms: 100,
        reconnect_initial_ms: 10,
        reconnect_max_ms: 50,
    }
}

fn listed(id: &str) -> ConnectionRecord {
    ConnectionRecord {
        id: id.to_string(),
        state: AgentConnectionState::Completed,
        out_of_band_id: Some(format!("oob-{}", id)),
        their_label: None,
    }
}

fn recording_emitter() -> (AgentEmitter, Arc<Recorder>) {
    let emitter = AgentEmitter::new(RetryConfig::default());
    let recorder = Arc::new(Recorder::default());
    emitter.on(EventKind::ConnectionStateChanged, recorder.clone());
    (emitter, recorder)
}

async fn eventually(check: impl Fn() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached");
}

#[tokio::test]
async fn test_live_frames_and_replay_reach_handlers() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());

    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
        let frames = [
            json!({"type": "ConnectionStateChanged", "payload": {"connectionRecord": {"id": "agent-live", "state": "completed"}}}).to_string(),
            json!({"type": "BasicMessageReceived", "payload": {}}).to_string(),
            "{not json".to_string(),
        ];
        for frame in frames {
            ws.send(Message::Text(frame)).await.unwrap();
        }
        // Keep reading so pings are answered.
        while let Some(Ok(_)) = ws.next().await {}
    });

    let agent = Arc::new(ListingAgent {
        connections: vec![listed("agent-listed")],
        ..Default::default()
    });
    let (emitter, recorder) = recording_emitter();
    let cancel = CancellationToken::new();
    let source = EventSource::new(url, stream_config(), emitter.clone(), agent.clone());
    let task = tokio::spawn(source.run(cancel.clone()));

    eventually(|| recorder.seen().len() == 2).await;
    let mut seen = recorder.seen();
    seen.sort();
    assert_eq!(seen, vec!["agent-listed".to_string(), "agent-live".to_string()]);

    // Outlive a few ping intervals without being dropped.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(agent.list_calls.load(Ordering::SeqCst), 1);

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
    assert!(emitter.is_stopped());
}

#[tokio::test]
async fn test_unanswered_ping_reconnects_without_duplicate_replay() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = accepted.clone();

    tokio::spawn(async move {
        // Never read: pings go unanswered.
        let mut held = Vec::new();
        loop {
            let (tcp, _) = listener.accept().await.unwrap();
            let ws = tokio_tungstenite::accept_async(tcp).await.unwrap();
            counter.fetch_add(1, Ordering::SeqCst);
            held.push(ws);
        }
    });

    let agent = Arc::new(ListingAgent {
        connections: vec![listed("agent-1")],
        ..Default::default()
    });
    let (emitter, recorder) = recording_emitter();
    let cancel = CancellationToken::new();
    let source = EventSource::new(url, stream_config(), emitter.clone(), agent.clone());
    let task = tokio::spawn(source.run(cancel.clone()));

    eventually(|| agent.list_calls.load(Ordering::SeqCst) >= 2).await;
    assert!(accepted.load(Ordering::SeqCst) >= 2);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(recorder.seen(), vec!["agent-1".to_string()]);

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
}
