//! A single physical connection and its lifecycle.
//!
//! A [`TransportConnection`] is started once, resolves its [`Handshake`]
//! exactly once, and publishes exactly one [`Termination`]. Reconnecting means
//! building a new connection.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::connector::{Connected, Connector, FrameSink, FrameStream};
use super::error::{HandshakeError, LinkError, ProtocolError, SendError, TransportError};
use super::frame::{CloseFrame, Frame};
use super::state::{CloseReason, ConnectionAttempt, ConnectionState, Termination};
use crate::modules::events::{ClosedEvent, EventSender, LinkEvent, OpenedEvent};

/// Connect timeout applied when none is configured.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Resolves once with the outcome of the upgrade handshake.
#[must_use = "the handshake outcome should be awaited"]
#[derive(Debug)]
pub struct Handshake {
    rx: oneshot::Receiver<Result<(), HandshakeError>>,
}

impl Handshake {
    fn resolved(result: Result<(), HandshakeError>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self { rx }
    }
}

impl Future for Handshake {
    type Output = Result<(), HandshakeError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|result| {
            result.unwrap_or_else(|_| {
                Err(HandshakeError::Connect("handshake task ended unexpectedly".into()))
            })
        })
    }
}

struct Shared {
    state: watch::Sender<ConnectionState>,
    termination: watch::Sender<Option<Termination>>,
    sink: tokio::sync::Mutex<Option<Box<dyn FrameSink>>>,
    cancel: CancellationToken,
    torn_down: AtomicBool,
    write_failure: Mutex<Option<TransportError>>,
}

impl Shared {
    fn new(cancel: CancellationToken) -> Self {
        Self {
            state: watch::channel(ConnectionState::Idle).0,
            termination: watch::channel(None).0,
            sink: tokio::sync::Mutex::new(None),
            cancel,
            torn_down: AtomicBool::new(false),
            write_failure: Mutex::new(None),
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    /// Runs at most once: cancels the connection token and closes the sink.
    async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();

        let sink = self.sink.lock().await.take();
        if let Some(mut sink) = sink {
            match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => log::debug!("close failed: {err}"),
                Err(_) => log::debug!("close timed out"),
            }
        }
    }

    fn finish(&self, termination: Termination) {
        self.set_state(termination.state);
        self.termination.send_replace(Some(termination));
    }

    fn fail_write(&self, err: TransportError) {
        self.write_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_or_insert(err);
        self.cancel.cancel();
    }

    fn take_write_failure(&self) -> Option<TransportError> {
        self.write_failure
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

enum Ending {
    Requested,
    Remote(Option<CloseFrame>),
    Eof,
    Failed(LinkError),
}

/// One WebSocket connection: handshake, read loop, serialised writes, and
/// idempotent teardown.
pub struct TransportConnection {
    connector: Arc<dyn Connector>,
    events: EventSender,
    handshake_timeout: Duration,
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TransportConnection {
    /// The connection observes a child of `parent`; cancelling `parent`
    /// stops it as if [`stop`](Self::stop) had been called.
    pub fn new(
        connector: Arc<dyn Connector>,
        events: EventSender,
        handshake_timeout: Duration,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            connector,
            events,
            handshake_timeout,
            shared: Arc::new(Shared::new(parent.child_token())),
            task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    /// Begin the handshake in a background task.
    pub fn start(&self, attempt: ConnectionAttempt) -> Handshake {
        if self.shared.state() != ConnectionState::Idle {
            return Handshake::resolved(Err(HandshakeError::InvalidRequest(
                "connection already started".into(),
            )));
        }
        self.shared.set_state(ConnectionState::Connecting);

        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(run_connection(
            self.shared.clone(),
            self.connector.clone(),
            self.events.clone(),
            self.handshake_timeout,
            attempt,
            tx,
        ));
        *self.task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
        Handshake { rx }
    }

    /// Send a text frame. Concurrent callers are serialised.
    pub async fn send(&self, text: impl Into<String>) -> Result<(), SendError> {
        if self.shared.state() != ConnectionState::Open {
            return Err(SendError::NotConnected);
        }

        let mut guard = self.shared.sink.lock().await;
        let Some(sink) = guard.as_mut() else {
            return Err(SendError::NotConnected);
        };
        if self.shared.state() != ConnectionState::Open {
            return Err(SendError::NotConnected);
        }

        let result = tokio::select! {
            biased;
            _ = self.shared.cancel.cancelled() => return Err(SendError::NotConnected),
            result = sink.send_text(text.into()) => result,
        };
        drop(guard);

        if let Err(err) = result {
            log::warn!("write failed, tearing connection down: {err}");
            self.shared.fail_write(err.clone());
            return Err(SendError::Transport(err));
        }
        Ok(())
    }

    /// Caller-initiated shutdown. Returns once the connection is terminal.
    pub async fn stop(&self) {
        match self.shared.state() {
            ConnectionState::Idle => {
                self.shared.teardown().await;
                self.shared.finish(Termination::requested());
                return;
            }
            ConnectionState::Open => self.shared.set_state(ConnectionState::Closing),
            _ => {}
        }
        self.shared.cancel.cancel();
        self.terminated().await;
        self.join().await;
    }

    /// Wait for the terminal record without polling.
    pub async fn terminated(&self) -> Termination {
        let mut rx = self.shared.termination.subscribe();
        if let Ok(slot) = rx.wait_for(Option::is_some).await
            && let Some(termination) = slot.as_ref()
        {
            return termination.clone();
        }
        Termination::requested()
    }

    /// Wait for the background task to exit.
    pub async fn join(&self) {
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task
            && let Err(err) = task.await
        {
            log::warn!("connection task failed: {err}");
        }
    }
}

impl Drop for TransportConnection {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

async fn run_connection(
    shared: Arc<Shared>,
    connector: Arc<dyn Connector>,
    events: EventSender,
    handshake_timeout: Duration,
    attempt: ConnectionAttempt,
    handshake: oneshot::Sender<Result<(), HandshakeError>>,
) {
    let ConnectionAttempt {
        attempt,
        kind,
        uri,
        request,
    } = attempt;

    let outcome = tokio::select! {
        biased;
        _ = shared.cancel.cancelled() => Err(HandshakeError::Cancelled),
        result = tokio::time::timeout(handshake_timeout, connector.connect(request)) => {
            result.unwrap_or_else(|_| Err(HandshakeError::Timeout(handshake_timeout)))
        }
    };

    let Connected { sink, frames } = match outcome {
        Ok(connected) => connected,
        Err(err) => {
            fail_handshake(&shared, &events, err, handshake).await;
            return;
        }
    };

    *shared.sink.lock().await = Some(sink);
    if shared.cancel.is_cancelled() {
        fail_handshake(&shared, &events, HandshakeError::Cancelled, handshake).await;
        return;
    }

    shared.set_state(ConnectionState::Open);
    events
        .emit(LinkEvent::Opened(OpenedEvent {
            uri,
            attempt,
            kind,
            timestamp: Utc::now(),
        }))
        .await;
    if handshake.send(Ok(())).is_err() {
        log::debug!("handshake outcome dropped by caller");
    }

    let ending = read_loop(&shared, frames, &events).await;
    close(&shared, &events, ending).await;
}

async fn fail_handshake(
    shared: &Shared,
    events: &EventSender,
    err: HandshakeError,
    handshake: oneshot::Sender<Result<(), HandshakeError>>,
) {
    shared.teardown().await;

    let termination = if err == HandshakeError::Cancelled {
        Termination {
            state: ConnectionState::Faulted,
            reason: CloseReason::Requested,
            caller_initiated: true,
        }
    } else {
        log::warn!("handshake failed: {err}");
        events.emit(LinkEvent::error(err.clone())).await;
        Termination::faulted(CloseReason::HandshakeFailed(err.to_string()))
    };

    shared.finish(termination);
    let _ = handshake.send(Err(err));
}

async fn read_loop(shared: &Shared, mut frames: FrameStream, events: &EventSender) -> Ending {
    loop {
        let next = tokio::select! {
            biased;
            _ = shared.cancel.cancelled() => return cancelled_ending(shared),
            next = frames.next() => next,
        };

        match next {
            Some(Ok(Frame::Text(text))) => {
                tokio::select! {
                    biased;
                    _ = shared.cancel.cancelled() => return cancelled_ending(shared),
                    _ = events.emit(LinkEvent::message(text)) => {}
                }
            }
            Some(Ok(Frame::Ping(_) | Frame::Pong(_))) => {}
            Some(Ok(Frame::Close(frame))) => return Ending::Remote(frame),
            Some(Ok(other)) => {
                return Ending::Failed(ProtocolError::UnexpectedFrame(other.kind()).into());
            }
            Some(Err(err)) => return Ending::Failed(err.into()),
            None => return Ending::Eof,
        }
    }
}

fn cancelled_ending(shared: &Shared) -> Ending {
    match shared.take_write_failure() {
        Some(err) => Ending::Failed(err.into()),
        None => Ending::Requested,
    }
}

/// A failed write also cancels the token, so it is checked before a
/// cancelled token is read as a caller stop.
fn settle(shared: &Shared, ending: Ending) -> Ending {
    match ending {
        Ending::Remote(_) | Ending::Eof if shared.cancel.is_cancelled() => {
            cancelled_ending(shared)
        }
        other => other,
    }
}

async fn close(shared: &Shared, events: &EventSender, ending: Ending) {
    let ending = settle(shared, ending);

    let termination = match ending {
        Ending::Requested => {
            shared.set_state(ConnectionState::Closing);
            Termination::requested()
        }
        Ending::Remote(frame) => Termination::faulted(CloseReason::Remote {
            code: frame.as_ref().map(|frame| frame.code),
            reason: frame.map(|frame| frame.reason).unwrap_or_default(),
        }),
        Ending::Eof => Termination::faulted(CloseReason::Eof),
        Ending::Failed(err) => {
            let reason = CloseReason::Error(err.to_string());
            events.emit(LinkEvent::error(err)).await;
            Termination::faulted(reason)
        }
    };

    shared.teardown().await;
    events
        .emit(LinkEvent::Closed(ClosedEvent {
            termination: termination.clone(),
            timestamp: Utc::now(),
        }))
        .await;
    shared.finish(termination);
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tokio::sync::mpsc;
    use url::Url;

    use super::*;
    use crate::modules::events::{EventQueue, OverflowPolicy, event_queue};
    use crate::session::decorator::UpgradeRequest;
    use crate::transport::memory::{HandshakeStep, MemoryConnector, MemoryPeer};
    use crate::transport::state::AttemptKind;

    struct Fixture {
        connector: Arc<MemoryConnector>,
        peers: mpsc::UnboundedReceiver<MemoryPeer>,
        events: EventSender,
        queue: EventQueue,
        cancel: CancellationToken,
    }

    impl Fixture {
        fn new(script: Vec<HandshakeStep>) -> Self {
            let (connector, peers) = MemoryConnector::new();
            let (events, queue) = event_queue(64, OverflowPolicy::Block);
            Self {
                connector: Arc::new(connector.with_script(script)),
                peers,
                events,
                queue,
                cancel: CancellationToken::new(),
            }
        }

        fn connection(&self, timeout: Duration) -> TransportConnection {
            TransportConnection::new(self.connector.clone(), self.events.clone(), timeout, &self.cancel)
        }

        fn start(&self, connection: &TransportConnection) -> Handshake {
            let uri = Url::parse("wss://socket.example.com/signalr/connect").unwrap();
            connection.start(ConnectionAttempt {
                attempt: 1,
                kind: AttemptKind::Initial,
                request: UpgradeRequest::new(uri.clone()).unwrap(),
                uri,
            })
        }

        async fn next_event(&mut self) -> LinkEvent {
            tokio::time::timeout(Duration::from_secs(5), self.queue.recv())
                .await
                .expect("event in time")
                .expect("queue open")
        }
    }

    #[tokio::test]
    async fn opens_delivers_in_order_and_sends() {
        let mut fx = Fixture::new(vec![]);
        let connection = fx.connection(DEFAULT_HANDSHAKE_TIMEOUT);
        fx.start(&connection).await.unwrap();
        assert_eq!(connection.state(), ConnectionState::Open);

        let mut peer = fx.peers.recv().await.unwrap();
        peer.push_text("one");
        peer.push(Frame::Ping(Bytes::from_static(b"p")));
        peer.push_text("two");

        assert!(matches!(fx.next_event().await, LinkEvent::Opened(_)));
        assert!(matches!(fx.next_event().await, LinkEvent::Message(m) if m.text == "one"));
        assert!(matches!(fx.next_event().await, LinkEvent::Message(m) if m.text == "two"));

        connection.send("hello").await.unwrap();
        assert_eq!(peer.sent.recv().await.as_deref(), Some("hello"));

        connection.stop().await;
    }

    #[tokio::test]
    async fn send_outside_open_is_not_connected() {
        let fx = Fixture::new(vec![]);
        let connection = fx.connection(DEFAULT_HANDSHAKE_TIMEOUT);
        assert_eq!(connection.send("early").await, Err(SendError::NotConnected));

        fx.start(&connection).await.unwrap();
        connection.stop().await;
        assert_eq!(connection.send("late").await, Err(SendError::NotConnected));
    }

    #[tokio::test]
    async fn send_while_connecting_is_not_connected() {
        let fx = Fixture::new(vec![HandshakeStep::Hang]);
        let connection = fx.connection(Duration::from_secs(60));
        let handshake = fx.start(&connection);
        assert_eq!(connection.state(), ConnectionState::Connecting);

        let sent = tokio::time::timeout(Duration::from_millis(100), connection.send("early"))
            .await
            .expect("send must not wait for the handshake");
        assert_eq!(sent, Err(SendError::NotConnected));

        fx.cancel.cancel();
        assert_eq!(handshake.await, Err(HandshakeError::Cancelled));
    }

    #[test]
    fn write_failure_is_not_read_as_a_stop() {
        let shared = Shared::new(CancellationToken::new());
        shared.fail_write(TransportError::Io("broken pipe".into()));
        assert!(shared.cancel.is_cancelled());

        match settle(&shared, Ending::Eof) {
            Ending::Failed(LinkError::Transport(TransportError::Io(err))) => {
                assert_eq!(err, "broken pipe")
            }
            _ => panic!("socket drop reported as a caller stop"),
        }
    }

    #[test]
    fn cancelled_drop_without_write_failure_is_a_stop() {
        let shared = Shared::new(CancellationToken::new());
        shared.cancel.cancel();
        assert!(matches!(settle(&shared, Ending::Eof), Ending::Requested));
        assert!(matches!(
            settle(&shared, Ending::Remote(None)),
            Ending::Requested
        ));
    }

    #[tokio::test]
    async fn stop_is_caller_initiated_and_releases_socket() {
        let mut fx = Fixture::new(vec![]);
        let connection = fx.connection(DEFAULT_HANDSHAKE_TIMEOUT);
        fx.start(&connection).await.unwrap();
        let _peer = fx.peers.recv().await.unwrap();
        assert_eq!(fx.connector.live_connections(), 1);

        connection.stop().await;
        let termination = connection.terminated().await;
        assert_eq!(termination.state, ConnectionState::Closed);
        assert!(termination.caller_initiated);
        assert_eq!(fx.connector.live_connections(), 0);

        // Teardown already happened; a second stop is a no-op.
        connection.stop().await;
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn remote_close_faults() {
        let mut fx = Fixture::new(vec![]);
        let connection = fx.connection(DEFAULT_HANDSHAKE_TIMEOUT);
        fx.start(&connection).await.unwrap();
        let peer = fx.peers.recv().await.unwrap();
        peer.push(Frame::Close(Some(CloseFrame {
            code: 1001,
            reason: "restart".into(),
        })));

        let termination = connection.terminated().await;
        assert_eq!(termination.state, ConnectionState::Faulted);
        assert!(!termination.caller_initiated);
        assert_eq!(
            termination.reason,
            CloseReason::Remote {
                code: Some(1001),
                reason: "restart".into()
            }
        );
    }

    #[tokio::test]
    async fn binary_frame_is_a_protocol_error() {
        let mut fx = Fixture::new(vec![]);
        let connection = fx.connection(DEFAULT_HANDSHAKE_TIMEOUT);
        fx.start(&connection).await.unwrap();
        let peer = fx.peers.recv().await.unwrap();
        peer.push(Frame::Binary(Bytes::from_static(&[0, 1])));

        let termination = connection.terminated().await;
        assert_eq!(termination.state, ConnectionState::Faulted);
        assert!(matches!(termination.reason, CloseReason::Error(_)));

        assert!(matches!(fx.next_event().await, LinkEvent::Opened(_)));
        match fx.next_event().await {
            LinkEvent::Error(event) => assert!(matches!(
                *event.error,
                LinkError::Protocol(ProtocolError::UnexpectedFrame("binary"))
            )),
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(fx.next_event().await, LinkEvent::Closed(_)));
    }

    #[tokio::test]
    async fn handshake_timeout() {
        let fx = Fixture::new(vec![HandshakeStep::Hang]);
        let connection = fx.connection(Duration::from_millis(50));
        let err = fx.start(&connection).await.unwrap_err();
        assert_eq!(err, HandshakeError::Timeout(Duration::from_millis(50)));
        assert_eq!(connection.state(), ConnectionState::Faulted);
    }

    #[tokio::test]
    async fn cancelling_parent_aborts_handshake() {
        let fx = Fixture::new(vec![HandshakeStep::Hang]);
        let connection = fx.connection(Duration::from_secs(60));
        let handshake = fx.start(&connection);
        fx.cancel.cancel();

        let err = tokio::time::timeout(Duration::from_secs(1), handshake)
            .await
            .expect("prompt cancellation")
            .unwrap_err();
        assert_eq!(err, HandshakeError::Cancelled);
        assert!(connection.terminated().await.caller_initiated);
    }

    #[tokio::test]
    async fn rejected_handshake_reports_status() {
        let mut fx = Fixture::new(vec![HandshakeStep::Reject(HandshakeError::Rejected {
            status: 403,
        })]);
        let connection = fx.connection(DEFAULT_HANDSHAKE_TIMEOUT);
        let err = fx.start(&connection).await.unwrap_err();
        assert!(err.is_gateway_rejection());
        assert!(matches!(fx.next_event().await, LinkEvent::Error(_)));
    }

    #[tokio::test]
    async fn concurrent_sends_do_not_interleave() {
        let mut fx = Fixture::new(vec![]);
        let connection = Arc::new(fx.connection(DEFAULT_HANDSHAKE_TIMEOUT));
        fx.start(&connection).await.unwrap();
        let mut peer = fx.peers.recv().await.unwrap();

        let sends: Vec<_> = (0..16)
            .map(|i| {
                let connection = connection.clone();
                tokio::spawn(async move { connection.send(format!("frame-{i}")).await })
            })
            .collect();
        for send in sends {
            send.await.unwrap().unwrap();
        }

        let mut received = Vec::new();
        for _ in 0..16 {
            received.push(peer.sent.recv().await.unwrap());
        }
        received.sort();
        let mut expected: Vec<_> = (0..16).map(|i| format!("frame-{i}")).collect();
        expected.sort();
        assert_eq!(received, expected);
        connection.stop().await;
    }

    #[tokio::test]
    async fn start_twice_is_rejected() {
        let fx = Fixture::new(vec![]);
        let connection = fx.connection(DEFAULT_HANDSHAKE_TIMEOUT);
        fx.start(&connection).await.unwrap();
        let err = fx.start(&connection).await.unwrap_err();
        assert!(matches!(err, HandshakeError::InvalidRequest(_)));
        connection.stop().await;
    }
}
