//! Agent event stream client
//!
//! Holds one WebSocket session to the agent at a time and feeds every frame
//! through [`normalize`] into the emitter. A session ends when the agent
//! closes it, a read fails, or a ping goes unanswered for
//! `pong_timeout`; the source then reconnects with doubling backoff.
//!
//! Events emitted while disconnected are lost on the wire, so each new
//! session first lists connections and credentials from the agent and
//! replays the ones whose state the live stream has not delivered yet.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use reconcile::agent::AgentApi;
use reconcile::events::{normalize, AgentEmitter, ReplayFilter};
use tokio::net::TcpStream;
use tokio::time::{sleep, sleep_until, Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::StreamConfig;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Why a session stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    Cancelled,
    /// Close frame or end of stream.
    Closed,
    /// No pong within the timeout.
    Dead,
    Failed(String),
}

pub struct EventSource {
    url: String,
    config: StreamConfig,
    emitter: AgentEmitter,
    agent: Arc<dyn AgentApi>,
    replay: ReplayFilter,
}

impl EventSource {
    pub fn new(
        url: impl Into<String>,
        config: StreamConfig,
        emitter: AgentEmitter,
        agent: Arc<dyn AgentApi>,
    ) -> Self {
        Self {
            url: url.into(),
            config,
            emitter,
            agent,
            replay: ReplayFilter::new(),
        }
    }

    /// Connect and reconnect until `cancel` fires, then shut the emitter down.
    pub async fn run(mut self, cancel: CancellationToken) {
        let initial = self.config.reconnect_initial();
        let mut reconnect_delay = initial;

        loop {
            info!(url = %self.url, "Connecting to agent event stream");
            let connected = tokio::select! {
                _ = cancel.cancelled() => break,
                result = connect_async(self.url.as_str()) => result,
            };

            match connected {
                Ok((socket, _)) => {
                    reconnect_delay = initial;
                    info!(url = %self.url, "Connected to agent event stream");
                    match self.session(socket, &cancel).await {
                        SessionEnd::Cancelled => break,
                        end => warn!(?end, "Agent event stream ended"),
                    }
                }
                Err(e) => error!(url = %self.url, "Failed to connect to agent event stream: {}", e),
            }

            warn!("Reconnecting to agent event stream in {:?}...", reconnect_delay);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = sleep(reconnect_delay) => {}
            }
            reconnect_delay = next_delay(reconnect_delay, self.config.reconnect_max());
        }

        info!("Event source stopped");
        self.emitter.shutdown().await;
    }

    async fn session(&mut self, socket: Socket, cancel: &CancellationToken) -> SessionEnd {
        let (mut sink, mut stream) = socket.split();
        self.replay_current_state().await;

        let mut ping = tokio::time::interval(self.config.ping_interval());
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ping.tick().await;
        let mut pong_deadline: Option<Instant> = None;

        loop {
            let awaiting = pong_deadline;
            let deadline = async move {
                match awaiting {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return SessionEnd::Cancelled;
                }
                _ = ping.tick() => {
                    if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                        return SessionEnd::Failed(e.to_string());
                    }
                    if pong_deadline.is_none() {
                        pong_deadline = Some(Instant::now() + self.config.pong_timeout());
                    }
                }
                _ = deadline => {
                    warn!(timeout = ?self.config.pong_timeout(), "Agent did not answer ping");
                    return SessionEnd::Dead;
                }
                message = stream.next() => match message {
                    Some(Ok(Message::Text(text))) => self.handle_frame(&text),
                    Some(Ok(Message::Binary(data))) => match std::str::from_utf8(&data) {
                        Ok(text) => self.handle_frame(text),
                        Err(_) => warn!(len = data.len(), "Ignoring non-UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Pong(_))) => pong_deadline = None,
                    Some(Ok(Message::Ping(data))) => {
                        let _ = sink.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!("Agent closed event stream: {:?}", frame);
                        return SessionEnd::Closed;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SessionEnd::Failed(e.to_string()),
                    None => return SessionEnd::Closed,
                }
            }
        }
    }

    fn handle_frame(&mut self, frame: &str) {
        match normalize(frame) {
            Ok(Some(event)) => {
                self.replay.observe(&event);
                debug!(kind = %event.kind(), index = %event.resource_index(), "Agent event");
                self.emitter.dispatch(event);
            }
            Ok(None) => debug!("Ignoring unhandled agent event type"),
            Err(e) => warn!("Malformed agent frame: {}", e),
        }
    }

    /// Replay listed records the live stream has not already covered.
    async fn replay_current_state(&mut self) {
        let mut events = Vec::new();
        match self.agent.list_connections().await {
            Ok(records) => events.extend(self.replay.replay_connections(records)),
            Err(e) => warn!("Failed to list agent connections for replay: {}", e),
        }
        match self.agent.list_credentials().await {
            Ok(records) => events.extend(self.replay.replay_credentials(records)),
            Err(e) => warn!("Failed to list agent credentials for replay: {}", e),
        }

        if !events.is_empty() {
            info!(count = events.len(), "Replaying agent state after connect");
        }
        for event in events {
            self.emitter.dispatch(event);
        }
    }
}

fn next_delay(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}
