//! In-process connector for tests and offline runs.
//!
//! Each accepted handshake yields a [`MemoryPeer`] that plays the server: it
//! pushes frames to the client and reads what the client sent. Dropping the
//! peer's frame sender ends the client's stream without a close frame.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures_util::StreamExt;
use http::HeaderMap;
use tokio::sync::mpsc;
use url::Url;

use super::connector::{Connected, Connector, FrameSink};
use super::error::{HandshakeError, TransportError, TransportResult};
use super::frame::Frame;
use crate::session::decorator::UpgradeRequest;

/// Scripted outcome of one handshake.
#[derive(Debug, Clone)]
pub enum HandshakeStep {
    Accept,
    Reject(HandshakeError),
    /// Never answer.
    Hang,
}

/// Request as it reached the connector.
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub url: Url,
    pub headers: HeaderMap,
    pub proxied: bool,
}

/// Server side of an accepted in-memory connection.
#[derive(Debug)]
pub struct MemoryPeer {
    pub frames: mpsc::UnboundedSender<TransportResult<Frame>>,
    pub sent: mpsc::UnboundedReceiver<String>,
}

impl MemoryPeer {
    pub fn push_text(&self, text: impl Into<String>) -> bool {
        self.frames.send(Ok(Frame::text(text))).is_ok()
    }

    pub fn push(&self, frame: Frame) -> bool {
        self.frames.send(Ok(frame)).is_ok()
    }

    pub fn fail(&self, error: TransportError) -> bool {
        self.frames.send(Err(error)).is_ok()
    }
}

#[derive(Debug, Default)]
struct LiveCounter {
    live: AtomicUsize,
    max_live: AtomicUsize,
}

impl LiveCounter {
    fn enter(&self) {
        let now = self.live.fetch_add(1, Ordering::AcqRel) + 1;
        self.max_live.fetch_max(now, Ordering::AcqRel);
    }

    fn leave(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

struct MemorySink {
    sent: mpsc::UnboundedSender<String>,
    counter: Arc<LiveCounter>,
    closed: bool,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send_text(&mut self, text: String) -> TransportResult<()> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        self.sent.send(text).map_err(|_| TransportError::Closed)
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.closed = true;
        Ok(())
    }
}

impl Drop for MemorySink {
    fn drop(&mut self) {
        self.counter.leave();
    }
}

/// Connector that answers handshakes from a script (accepting by default).
#[derive(Debug)]
pub struct MemoryConnector {
    script: Mutex<VecDeque<HandshakeStep>>,
    requests: Mutex<Vec<RecordedRequest>>,
    peers: mpsc::UnboundedSender<MemoryPeer>,
    counter: Arc<LiveCounter>,
}

impl MemoryConnector {
    /// Returns the connector and the receiver of accepted peers.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let connector = Self {
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            peers,
            counter: Arc::new(LiveCounter::default()),
        };
        (connector, rx)
    }

    pub fn with_script(self, steps: impl IntoIterator<Item = HandshakeStep>) -> Self {
        self.script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(steps);
        self
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Connections whose write half is still alive.
    pub fn live_connections(&self) -> usize {
        self.counter.live.load(Ordering::Acquire)
    }

    /// Highest number of simultaneously live connections seen.
    pub fn max_live_connections(&self) -> usize {
        self.counter.max_live.load(Ordering::Acquire)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, request: UpgradeRequest) -> Result<Connected, HandshakeError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RecordedRequest {
                url: request.url().clone(),
                headers: request.headers().clone(),
                proxied: request.proxy().is_some(),
            });

        let step = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
            .unwrap_or(HandshakeStep::Accept);

        match step {
            HandshakeStep::Accept => {}
            HandshakeStep::Reject(err) => return Err(err),
            HandshakeStep::Hang => std::future::pending::<()>().await,
        }

        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        self.counter.enter();
        let sink = MemorySink {
            sent: sent_tx,
            counter: self.counter.clone(),
            closed: false,
        };

        if self
            .peers
            .send(MemoryPeer {
                frames: frames_tx,
                sent: sent_rx,
            })
            .is_err()
        {
            log::debug!("memory peer receiver dropped");
        }

        let frames = futures_util::stream::unfold(frames_rx, |mut rx| async move {
            rx.recv().await.map(|frame| (frame, rx))
        })
        .boxed();

        Ok(Connected {
            sink: Box::new(sink),
            frames,
        })
    }
}
