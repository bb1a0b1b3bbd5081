//! Reconnect loop.
//!
//! The supervisor owns at most one [`TransportConnection`] at a time. Each
//! attempt gets a fresh credentials snapshot, a freshly decorated request and
//! a new connection; the previous connection is terminal and joined before
//! the next one is built.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::connection::{DEFAULT_HANDSHAKE_TIMEOUT, TransportConnection};
use super::connector::Connector;
use super::error::{HandshakeError, LinkError, SendError, UriError};
use super::state::{AttemptKind, ConnectionAttempt, ConnectionState, Termination};
use crate::modules::events::{EventSender, LinkEvent, RetryEvent};
use crate::modules::metrics::LinkMetrics;
use crate::session::bypass::CredentialSource;
use crate::session::credentials::CredentialStore;
use crate::session::decorator::{ConnectionContext, RequestDecorator, UpgradeRequest};

pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// Delay between attempts and an optional cap on consecutive failures.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub delay: Duration,
    /// Consecutive failed attempts tolerated before giving up.
    pub max_attempts: Option<u32>,
    /// Fraction of `delay` applied as random spread, `0.0..=1.0`.
    pub jitter: f64,
}

impl ReconnectPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            delay,
            max_attempts: None,
            jitter: 0.0,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = if jitter.is_finite() {
            jitter.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self
    }

    pub fn next_delay(&self) -> Duration {
        if !self.jitter.is_finite() || self.jitter <= 0.0 || self.delay.is_zero() {
            return self.delay;
        }
        let base = self.delay.as_secs_f64();
        let spread = base * self.jitter;
        let offset = rand::thread_rng().gen_range(-spread..=spread);
        Duration::from_secs_f64((base + offset).max(0.0))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::fixed(DEFAULT_RECONNECT_DELAY)
    }
}

/// Where each attempt connects to.
#[async_trait]
pub trait UriProvider: Send + Sync {
    /// Target of the first attempt.
    async fn connect_uri(&self) -> Result<Url, UriError>;

    /// Target of every later attempt.
    async fn reconnect_uri(&self) -> Result<Url, UriError>;

    /// Whether a server-side closure means the session is over.
    fn is_clean_disconnect(&self, _termination: &Termination) -> bool {
        false
    }
}

/// Fixed connect and reconnect targets.
#[derive(Debug, Clone)]
pub struct StaticUris {
    pub connect: Url,
    pub reconnect: Url,
}

impl StaticUris {
    pub fn new(connect: Url, reconnect: Url) -> Self {
        Self { connect, reconnect }
    }

    /// Same target for every attempt.
    pub fn single(uri: Url) -> Self {
        Self {
            reconnect: uri.clone(),
            connect: uri,
        }
    }
}

#[async_trait]
impl UriProvider for StaticUris {
    async fn connect_uri(&self) -> Result<Url, UriError> {
        Ok(self.connect.clone())
    }

    async fn reconnect_uri(&self) -> Result<Url, UriError> {
        Ok(self.reconnect.clone())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("gave up after {attempts} consecutive failed attempts: {last_error}")]
    AttemptsExhausted { attempts: u32, last_error: String },
    #[error("supervisor is already running")]
    AlreadyRunning,
}

/// Send side of the link, valid across reconnects.
#[derive(Clone, Default)]
pub struct LinkHandle {
    current: Arc<RwLock<Option<Arc<TransportConnection>>>>,
    metrics: Option<LinkMetrics>,
}

impl LinkHandle {
    /// Send a text frame on the current connection.
    pub async fn send(&self, text: impl Into<String>) -> Result<(), SendError> {
        let Some(connection) = self.current() else {
            return Err(SendError::NotConnected);
        };
        connection.send(text).await?;
        if let Some(ref metrics) = self.metrics {
            metrics.record_message_out();
        }
        Ok(())
    }

    pub fn state(&self) -> ConnectionState {
        self.current()
            .map(|connection| connection.state())
            .unwrap_or(ConnectionState::Idle)
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    fn current(&self) -> Option<Arc<TransportConnection>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn install(&self, connection: Arc<TransportConnection>) {
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(connection);
    }

    fn clear(&self) {
        self.current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

impl fmt::Debug for LinkHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinkHandle")
            .field("state", &self.state())
            .finish()
    }
}

enum AttemptOutcome {
    /// Cancelled by the caller.
    Stopped,
    /// The attempt could not be built or its handshake failed.
    Failed(String),
    /// The connection opened and later ended.
    Ended(Termination),
}

/// Drives connection attempts until cancelled.
pub struct ReconnectSupervisor {
    connector: Arc<dyn Connector>,
    source: Arc<dyn CredentialSource>,
    store: Arc<CredentialStore>,
    events: EventSender,
    decorator: RequestDecorator,
    context: ConnectionContext,
    policy: ReconnectPolicy,
    handshake_timeout: Duration,
    metrics: Option<LinkMetrics>,
    handle: LinkHandle,
    running: AtomicBool,
}

impl ReconnectSupervisor {
    pub fn new(
        connector: Arc<dyn Connector>,
        source: Arc<dyn CredentialSource>,
        store: Arc<CredentialStore>,
        events: EventSender,
    ) -> Self {
        Self {
            connector,
            source,
            store,
            events,
            decorator: RequestDecorator::new(),
            context: ConnectionContext::default(),
            policy: ReconnectPolicy::default(),
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            metrics: None,
            handle: LinkHandle::default(),
            running: AtomicBool::new(false),
        }
    }

    pub fn with_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_context(mut self, context: ConnectionContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: LinkMetrics) -> Self {
        self.handle.metrics = Some(metrics.clone());
        self.metrics = Some(metrics);
        self
    }

    pub fn handle(&self) -> LinkHandle {
        self.handle.clone()
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Connect, then reconnect after every unexpected closure until `cancel`
    /// fires. Only a configured attempt cap makes this return an error.
    pub async fn run(
        &self,
        uris: &dyn UriProvider,
        cancel: &CancellationToken,
    ) -> Result<(), SupervisorError> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(SupervisorError::AlreadyRunning);
        }
        let result = self.supervise(uris, cancel).await;
        self.handle.clear();
        self.running.store(false, Ordering::Release);
        result
    }

    async fn supervise(
        &self,
        uris: &dyn UriProvider,
        cancel: &CancellationToken,
    ) -> Result<(), SupervisorError> {
        let mut attempt = 0u32;
        let mut failures = 0u32;
        // Nothing to resume until a connection has opened.
        let mut opened_once = false;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            attempt += 1;
            let kind = if opened_once {
                AttemptKind::Reconnect
            } else {
                AttemptKind::Initial
            };

            let reason = match self.attempt(uris, cancel, attempt, kind).await {
                AttemptOutcome::Stopped => return Ok(()),
                AttemptOutcome::Ended(termination) => {
                    if termination.caller_initiated || cancel.is_cancelled() {
                        return Ok(());
                    }
                    if uris.is_clean_disconnect(&termination) {
                        log::info!("server ended the session ({}), not reconnecting", termination.reason);
                        return Ok(());
                    }
                    failures = 0;
                    opened_once = true;
                    termination.reason.to_string()
                }
                AttemptOutcome::Failed(reason) => {
                    if cancel.is_cancelled() {
                        return Ok(());
                    }
                    failures += 1;
                    reason
                }
            };

            if let Some(max_attempts) = self.policy.max_attempts
                && failures >= max_attempts
            {
                log::warn!("giving up after {failures} consecutive failed attempts");
                return Err(SupervisorError::AttemptsExhausted {
                    attempts: failures,
                    last_error: reason,
                });
            }

            let delay = self.policy.next_delay();
            log::info!("reconnecting in {delay:?} after: {reason}");
            self.events
                .emit(LinkEvent::Retry(RetryEvent {
                    attempt: attempt + 1,
                    reason,
                    scheduled_after: delay,
                    timestamp: Utc::now(),
                }))
                .await;

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn attempt(
        &self,
        uris: &dyn UriProvider,
        cancel: &CancellationToken,
        attempt: u32,
        kind: AttemptKind,
    ) -> AttemptOutcome {
        let prepared = tokio::select! {
            biased;
            _ = cancel.cancelled() => return AttemptOutcome::Stopped,
            prepared = self.prepare(uris, cancel, attempt, kind) => prepared,
        };
        let prepared = match prepared {
            Ok(prepared) => prepared,
            Err(_) if cancel.is_cancelled() => return AttemptOutcome::Stopped,
            Err(err) => {
                let reason = err.to_string();
                log::warn!("attempt {attempt} could not be prepared: {reason}");
                self.events.emit(LinkEvent::error(err)).await;
                return AttemptOutcome::Failed(reason);
            }
        };

        if let Some(ref metrics) = self.metrics {
            metrics.record_attempt();
        }
        log::debug!("attempt {attempt} ({kind:?}) to {}", prepared.uri);

        let connection = Arc::new(TransportConnection::new(
            self.connector.clone(),
            self.events.clone(),
            self.handshake_timeout,
            cancel,
        ));
        let handshake = connection.start(prepared);
        self.handle.install(connection.clone());

        let handshake = handshake.await;
        let termination = connection.terminated().await;
        self.handle.clear();
        connection.join().await;

        match handshake {
            Ok(()) => AttemptOutcome::Ended(termination),
            Err(HandshakeError::Cancelled) => AttemptOutcome::Stopped,
            Err(err) => {
                if err.is_gateway_rejection() {
                    log::warn!("gateway rejected the upgrade ({err}), clearance will be refreshed");
                    self.store.mark_stale();
                }
                AttemptOutcome::Failed(err.to_string())
            }
        }
    }

    async fn prepare(
        &self,
        uris: &dyn UriProvider,
        cancel: &CancellationToken,
        attempt: u32,
        kind: AttemptKind,
    ) -> Result<ConnectionAttempt, LinkError> {
        if self.store.needs_refresh(Utc::now()) {
            log::info!("running clearance preflight before attempt {attempt}");
            let credentials = self.source.acquire_credentials(cancel).await?;
            let generation = self.store.replace(credentials);
            log::debug!("published credentials generation {generation}");
        }

        let uri = match kind {
            AttemptKind::Initial => uris.connect_uri().await?,
            AttemptKind::Reconnect => uris.reconnect_uri().await?,
        };

        let mut request = UpgradeRequest::new(uri.clone())?;
        self.decorator
            .decorate(&mut request, &self.store.snapshot(), &self.context)?;

        Ok(ConnectionAttempt {
            attempt,
            kind,
            uri,
            request,
        })
    }
}

impl fmt::Debug for ReconnectSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectSupervisor")
            .field("policy", &self.policy)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("running", &self.running.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_policy_has_no_spread() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay, Duration::from_secs(2));
        assert_eq!(policy.max_attempts, None);
        assert_eq!(policy.next_delay(), Duration::from_secs(2));
    }

    #[test]
    fn jitter_stays_within_spread() {
        let policy = ReconnectPolicy::fixed(Duration::from_secs(2)).with_jitter(0.25);
        for _ in 0..100 {
            let delay = policy.next_delay();
            assert!(delay >= Duration::from_millis(1500));
            assert!(delay <= Duration::from_millis(2500));
        }
    }

    #[test]
    fn jitter_is_clamped() {
        assert_eq!(ReconnectPolicy::default().with_jitter(4.0).jitter, 1.0);
        assert_eq!(ReconnectPolicy::default().with_jitter(-1.0).jitter, 0.0);
    }

    #[test]
    fn non_finite_jitter_means_no_jitter() {
        for jitter in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let policy = ReconnectPolicy::fixed(Duration::from_secs(2)).with_jitter(jitter);
            assert_eq!(policy.jitter, 0.0);
            assert_eq!(policy.next_delay(), Duration::from_secs(2));
        }

        let mut policy = ReconnectPolicy::fixed(Duration::from_secs(2));
        policy.jitter = f64::NAN;
        assert_eq!(policy.next_delay(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn handle_without_connection_is_not_connected() {
        let handle = LinkHandle::default();
        assert_eq!(handle.send("x").await, Err(SendError::NotConnected));
        assert_eq!(handle.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn static_uris() {
        let connect = Url::parse("wss://socket.example.com/signalr/connect").unwrap();
        let reconnect = Url::parse("wss://socket.example.com/signalr/reconnect").unwrap();
        let uris = StaticUris::new(connect.clone(), reconnect.clone());
        assert_eq!(uris.connect_uri().await.unwrap(), connect);
        assert_eq!(uris.reconnect_uri().await.unwrap(), reconnect);
        assert!(!uris.is_clean_disconnect(&Termination::requested()));
    }
}
