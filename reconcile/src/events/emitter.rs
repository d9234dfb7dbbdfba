//! Indexed retry emitter
//!
//! Dispatches events to asynchronous handlers and retries failed handlers with
//! exponential backoff, but only while the failing event is still the most
//! recent one for its resource. Each emission for `(kind, index)` gets a fresh
//! [`EventId`] recorded in a [`KeyedBijection`]; a newer emission replaces it,
//! and any retry still scheduled for the old id is dropped when it wakes.
//!
//! ```text
//! emit_indexed(idx, ev) ──▶ bijection[(kind, idx)] = id ──▶ spawn handler × N
//!                                                              │ Err
//!                              id still current? ──no──▶ drop (stale)
//!                                   │ yes
//!                     retries left? ──no──▶ terminal (escalate | abandon)
//!                                   │ yes
//!                       sleep(base × factor^n) ──▶ re-check ──▶ run handler
//! ```

use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::bijection::KeyedBijection;

/// Identifier assigned to each emission
pub type EventId = Uuid;

/// An event the emitter can route.
pub trait Event: Send + Sync + 'static {
    type Kind: Copy + Eq + Hash + Debug + Display + Send + Sync + 'static;

    fn kind(&self) -> Self::Kind;

    /// Resource the event concerns. `None` makes the emission fire-and-forget.
    fn index(&self) -> Option<String>;
}

/// Asynchronous consumer of one or more event kinds.
#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, event: &E) -> anyhow::Result<()>;
}

/// What happens once a handler has used up its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalBehavior {
    /// Report a [`FatalError`] on the fatal channel.
    #[default]
    Escalate,
    /// Log and give up on the event.
    Abandon,
}

/// Backoff and ceiling for handler retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Multiplier applied per subsequent retry.
    pub backoff_factor: f64,
    /// Retries allowed after the first attempt.
    pub max_retry_count: u32,
    pub terminal: TerminalBehavior,
}

impl RetryConfig {
    /// Delay before retry number `retry` (1-based): `base × factor^(retry-1)`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1) as i32;
        let millis = self.base_delay_ms as f64 * self.backoff_factor.powi(exponent);
        Duration::from_millis(millis.round() as u64)
    }
}

impl Default for RetryConfig {
    /// Default: 5 retries, 500ms base delay, 2x factor, escalate when exhausted.
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            backoff_factor: 2.0,
            max_retry_count: 5,
            terminal: TerminalBehavior::Escalate,
        }
    }
}

/// An event payload paired with its emission id and retry counter.
#[derive(Debug)]
pub struct RetryEnvelope<E> {
    pub payload: Arc<E>,
    pub event_id: EventId,
    pub retry_count: u32,
}

impl<E> Clone for RetryEnvelope<E> {
    fn clone(&self) -> Self {
        Self {
            payload: Arc::clone(&self.payload),
            event_id: self.event_id,
            retry_count: self.retry_count,
        }
    }
}

/// A handler that could not process an event, escalated past the emitter.
#[derive(Debug, Clone)]
pub struct FatalError<K> {
    pub kind: K,
    pub index: Option<String>,
    pub event_id: EventId,
    pub handler: String,
    /// Total attempts made, including the first.
    pub attempts: u32,
    pub error: String,
}

impl<K: Display> Display for FatalError<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "handler '{}' failed {} time(s) on {} [{}]: {}",
            self.handler,
            self.attempts,
            self.kind,
            self.index.as_deref().unwrap_or("-"),
            self.error
        )
    }
}

type ResourceKey<K> = (K, String);
type HandlerList<E> = Vec<Arc<dyn EventHandler<E>>>;

struct Inner<E: Event> {
    config: RetryConfig,
    handlers: RwLock<HashMap<E::Kind, HandlerList<E>>>,
    current: Mutex<KeyedBijection<ResourceKey<E::Kind>, EventId>>,
    fatal_tx: mpsc::UnboundedSender<FatalError<E::Kind>>,
    fatal_rx: Mutex<Option<mpsc::UnboundedReceiver<FatalError<E::Kind>>>>,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

/// Latest-wins retrying event dispatcher. Cheap to clone.
pub struct IndexedRetryEmitter<E: Event> {
    inner: Arc<Inner<E>>,
}

impl<E: Event> Clone for IndexedRetryEmitter<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Event> IndexedRetryEmitter<E> {
    pub fn new(config: RetryConfig) -> Self {
        let (fatal_tx, fatal_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                config,
                handlers: RwLock::new(HashMap::new()),
                current: Mutex::new(KeyedBijection::new()),
                fatal_tx,
                fatal_rx: Mutex::new(Some(fatal_rx)),
                cancel: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.inner.config
    }

    /// Register a handler for `kind`.
    pub fn on(&self, kind: E::Kind, handler: Arc<dyn EventHandler<E>>) {
        let mut handlers = self
            .inner
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        debug!(%kind, handler = handler.name(), "Handler registered");
        handlers.entry(kind).or_default().push(handler);
    }

    /// Channel of escalated failures. Can be taken once.
    pub fn take_fatal_receiver(&self) -> Option<mpsc::UnboundedReceiver<FatalError<E::Kind>>> {
        self.inner
            .fatal_rx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Emit using the event's own resource index, if it has one.
    pub fn dispatch(&self, event: E) -> Option<EventId> {
        match event.index() {
            Some(index) => self.emit_indexed(index, event),
            None => self.emit(event),
        }
    }

    /// Emit `event` as the authoritative event for `(kind, index)`.
    ///
    /// Any retry still pending for an earlier event with the same key becomes
    /// stale.
    pub fn emit_indexed(&self, index: impl Into<String>, event: E) -> Option<EventId> {
        if self.inner.cancel.is_cancelled() {
            warn!(kind = %event.kind(), "Emitter stopped, event ignored");
            return None;
        }

        let kind = event.kind();
        let key = (kind, index.into());
        let event_id = Uuid::new_v4();
        let handlers = self.handlers_for(kind);

        {
            let mut current = self.inner.lock_current();
            if handlers.is_empty() {
                current.remove_by_key(&key);
                debug!(%kind, index = %key.1, "No handlers registered");
                return Some(event_id);
            }
            if let Some(previous) = current.insert(key.clone(), event_id) {
                debug!(%kind, index = %key.1, %previous, %event_id, "Superseded in-flight event");
            }
        }

        self.spawn_all(Some(key), event, event_id, handlers);
        Some(event_id)
    }

    /// Fire-and-forget emission: failures go straight to the terminal behavior.
    pub fn emit(&self, event: E) -> Option<EventId> {
        if self.inner.cancel.is_cancelled() {
            warn!(kind = %event.kind(), "Emitter stopped, event ignored");
            return None;
        }
        let event_id = Uuid::new_v4();
        let handlers = self.handlers_for(event.kind());
        if !handlers.is_empty() {
            self.spawn_all(None, event, event_id, handlers);
        }
        Some(event_id)
    }

    /// Number of resources with an event still in flight.
    pub fn pending_count(&self) -> usize {
        self.inner.lock_current().len()
    }

    /// Whether `event_id` is still the authoritative event for its resource.
    pub fn is_current(&self, event_id: &EventId) -> bool {
        self.inner.lock_current().contains_value(event_id)
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Detach all handlers, cancel pending retry timers and wait for handler
    /// bodies already running to finish.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner
            .handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        self.inner.lock_current().clear();
        debug!("Emitter shut down");
    }

    fn handlers_for(&self, kind: E::Kind) -> HandlerList<E> {
        self.inner
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&kind)
            .cloned()
            .unwrap_or_default()
    }

    fn spawn_all(
        &self,
        key: Option<ResourceKey<E::Kind>>,
        event: E,
        event_id: EventId,
        handlers: HandlerList<E>,
    ) {
        let envelope = RetryEnvelope {
            payload: Arc::new(event),
            event_id,
            retry_count: 0,
        };
        let outstanding = Arc::new(AtomicUsize::new(handlers.len()));

        for handler in handlers {
            let inner = Arc::clone(&self.inner);
            let key = key.clone();
            let envelope = envelope.clone();
            let outstanding = Arc::clone(&outstanding);
            self.inner.tracker.spawn(async move {
                inner.run_handler(key.as_ref(), envelope, handler).await;
                if outstanding.fetch_sub(1, Ordering::AcqRel) == 1 && key.is_some() {
                    inner.lock_current().remove_by_value(&event_id);
                }
            });
        }
    }
}

impl<E: Event> Inner<E> {
    fn lock_current(&self) -> std::sync::MutexGuard<'_, KeyedBijection<ResourceKey<E::Kind>, EventId>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_stale(&self, key: &ResourceKey<E::Kind>, event_id: &EventId) -> bool {
        self.lock_current().get_by_value(event_id) != Some(key)
    }

    async fn run_handler(
        &self,
        key: Option<&ResourceKey<E::Kind>>,
        mut envelope: RetryEnvelope<E>,
        handler: Arc<dyn EventHandler<E>>,
    ) {
        let kind = envelope.payload.kind();
        let index = key.map(|(_, index)| index.as_str()).unwrap_or("-");

        loop {
            let attempt = AssertUnwindSafe(handler.handle(&envelope.payload))
                .catch_unwind()
                .await;
            let err = match attempt {
                Ok(Ok(())) => {
                    debug!(%kind, index, handler = handler.name(), retries = envelope.retry_count, "Handled");
                    return;
                }
                Ok(Err(err)) => format!("{:#}", err),
                Err(_) => "handler panicked".to_string(),
            };

            let Some(key) = key else {
                self.terminal(None, &envelope, handler.name(), err);
                return;
            };

            if self.is_stale(key, &envelope.event_id) {
                debug!(%kind, index, handler = handler.name(), error = %err, "Stale event failed, retry dropped");
                return;
            }

            if envelope.retry_count >= self.config.max_retry_count {
                self.terminal(Some(key), &envelope, handler.name(), err);
                return;
            }

            envelope.retry_count += 1;
            let delay = self.config.delay_for(envelope.retry_count);
            warn!(
                %kind,
                index,
                handler = handler.name(),
                retry = envelope.retry_count,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Handler failed, scheduling retry"
            );

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(%kind, index, handler = handler.name(), "Retry cancelled by shutdown");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            if self.is_stale(key, &envelope.event_id) {
                debug!(%kind, index, handler = handler.name(), "Superseded during backoff, retry dropped");
                return;
            }
        }
    }

    fn terminal(
        &self,
        key: Option<&ResourceKey<E::Kind>>,
        envelope: &RetryEnvelope<E>,
        handler: &str,
        error: String,
    ) {
        let fatal = FatalError {
            kind: envelope.payload.kind(),
            index: key.map(|(_, index)| index.clone()),
            event_id: envelope.event_id,
            handler: handler.to_string(),
            attempts: envelope.retry_count + 1,
            error,
        };

        match self.config.terminal {
            TerminalBehavior::Escalate => {
                error!(%fatal, "Retries exhausted, escalating");
                if self.fatal_tx.send(fatal).is_err() {
                    debug!("Fatal receiver dropped");
                }
            }
            TerminalBehavior::Abandon => {
                warn!(%fatal, "Retries exhausted, abandoning event");
            }
        }
    }
}
