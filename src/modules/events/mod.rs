//! Event system for the link lifecycle.
//!
//! Connections, the supervisor and the preflight publish [`LinkEvent`]s into a
//! bounded queue. A single dispatcher task drains the queue and hands every
//! event, in order, to the registered [`EventHandler`]s.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::metrics::LinkMetrics;
use crate::transport::error::LinkError;
use crate::transport::state::{AttemptKind, Termination};

/// Default capacity of the inbound event queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
pub struct PreflightEvent {
    pub origin: Url,
    pub success: bool,
    pub attempts: u32,
    /// Pattern of the last challenge seen, if any.
    pub challenge: Option<String>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct OpenedEvent {
    pub uri: Url,
    pub attempt: u32,
    pub kind: AttemptKind,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ClosedEvent {
    pub termination: Termination,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub error: Arc<LinkError>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RetryEvent {
    pub attempt: u32,
    pub reason: String,
    pub scheduled_after: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum LinkEvent {
    Preflight(PreflightEvent),
    Opened(OpenedEvent),
    Message(MessageEvent),
    Closed(ClosedEvent),
    Error(ErrorEvent),
    Retry(RetryEvent),
}

impl LinkEvent {
    pub fn message(text: impl Into<String>) -> Self {
        LinkEvent::Message(MessageEvent {
            text: text.into(),
            timestamp: Utc::now(),
        })
    }

    pub fn error(error: impl Into<LinkError>) -> Self {
        LinkEvent::Error(ErrorEvent {
            error: Arc::new(error.into()),
            timestamp: Utc::now(),
        })
    }
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &LinkEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: &LinkEvent) {
        for handler in &self.handlers {
            handler.handle(event);
        }
    }
}

/// Consumer-facing callbacks. Every method has a no-op default.
pub trait LinkObserver: Send + Sync {
    fn on_open(&self) {}

    fn on_message(&self, _text: &str) {}

    fn on_close(&self, _termination: &Termination) {}

    fn on_error(&self, _error: &LinkError) {}
}

/// Adapts a [`LinkObserver`] to the event stream.
pub struct ObserverHandler {
    observer: Arc<dyn LinkObserver>,
}

impl ObserverHandler {
    pub fn new(observer: Arc<dyn LinkObserver>) -> Self {
        Self { observer }
    }
}

impl EventHandler for ObserverHandler {
    fn handle(&self, event: &LinkEvent) {
        match event {
            LinkEvent::Opened(_) => self.observer.on_open(),
            LinkEvent::Message(message) => self.observer.on_message(&message.text),
            LinkEvent::Closed(closed) => self.observer.on_close(&closed.termination),
            LinkEvent::Error(error) => self.observer.on_error(&error.error),
            LinkEvent::Preflight(_) | LinkEvent::Retry(_) => {}
        }
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &LinkEvent) {
        match event {
            LinkEvent::Preflight(preflight) if preflight.success => {
                log::info!(
                    "preflight {} cleared after {} request(s)",
                    preflight.origin,
                    preflight.attempts
                );
            }
            LinkEvent::Preflight(preflight) => {
                log::warn!(
                    "preflight {} failed: {}",
                    preflight.origin,
                    preflight.error.as_deref().unwrap_or("unknown error")
                );
            }
            LinkEvent::Opened(opened) => {
                log::info!("opened {} ({:?} attempt {})", opened.uri, opened.kind, opened.attempt);
            }
            LinkEvent::Message(message) => {
                log::debug!("<- {} bytes", message.text.len());
            }
            LinkEvent::Closed(closed) => {
                log::info!(
                    "closed ({}) caller_initiated={}",
                    closed.termination.reason,
                    closed.termination.caller_initiated
                );
            }
            LinkEvent::Error(error) => {
                log::warn!("link error: {}", error.error);
            }
            LinkEvent::Retry(retry) => {
                log::info!(
                    "reconnect attempt {} after {:.2}s ({})",
                    retry.attempt,
                    retry.scheduled_after.as_secs_f64(),
                    retry.reason
                );
            }
        }
    }
}

/// Metrics handler that feeds the link metrics.
#[derive(Clone, Debug)]
pub struct MetricsHandler {
    metrics: LinkMetrics,
}

impl MetricsHandler {
    pub fn new(metrics: LinkMetrics) -> Self {
        Self { metrics }
    }
}

impl EventHandler for MetricsHandler {
    fn handle(&self, event: &LinkEvent) {
        match event {
            LinkEvent::Preflight(preflight) => self.metrics.record_preflight(preflight.success),
            LinkEvent::Opened(opened) => self.metrics.record_open(opened.kind),
            LinkEvent::Message(_) => self.metrics.record_message_in(),
            LinkEvent::Error(error) => self.metrics.record_error(&error.error.to_string()),
            LinkEvent::Closed(_) | LinkEvent::Retry(_) => {}
        }
    }
}

/// What to do with an inbound message when the event queue is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Wait for room, pausing the socket reader.
    #[default]
    Block,
    /// Drop the message, log it and count it.
    DropNewest,
}

/// Producer side of the event queue, cloned into every component.
#[derive(Clone, Debug)]
pub struct EventSender {
    tx: mpsc::Sender<LinkEvent>,
    policy: OverflowPolicy,
    metrics: Option<LinkMetrics>,
}

impl EventSender {
    pub fn with_metrics(mut self, metrics: LinkMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Publish an event. Only messages are subject to the overflow policy;
    /// lifecycle events always wait for room.
    pub async fn emit(&self, event: LinkEvent) {
        if self.policy == OverflowPolicy::DropNewest && matches!(event, LinkEvent::Message(_)) {
            match self.tx.try_send(event) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    log::warn!("event queue full, dropping inbound message");
                    if let Some(ref metrics) = self.metrics {
                        metrics.record_dropped();
                    }
                }
                Err(TrySendError::Closed(_)) => log::debug!("event queue closed"),
            }
            return;
        }

        if self.tx.send(event).await.is_err() {
            log::debug!("event queue closed");
        }
    }
}

/// Consumer side of the event queue.
#[derive(Debug)]
pub struct EventQueue {
    rx: mpsc::Receiver<LinkEvent>,
}

impl EventQueue {
    pub async fn recv(&mut self) -> Option<LinkEvent> {
        self.rx.recv().await
    }

    /// Dispatch events until `shutdown` fires, then flush what is already
    /// queued. Returns the queue so a later run can reuse it.
    pub async fn run(mut self, dispatcher: Arc<EventDispatcher>, shutdown: CancellationToken) -> Self {
        loop {
            tokio::select! {
                biased;
                event = self.rx.recv() => match event {
                    Some(event) => dispatcher.dispatch(&event),
                    None => break,
                },
                _ = shutdown.cancelled() => break,
            }
        }
        while let Ok(event) = self.rx.try_recv() {
            dispatcher.dispatch(&event);
        }
        self
    }
}

/// Create a bounded event queue.
pub fn event_queue(capacity: usize, policy: OverflowPolicy) -> (EventSender, EventQueue) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        EventSender {
            tx,
            policy,
            metrics: None,
        },
        EventQueue { rx },
    )
}
