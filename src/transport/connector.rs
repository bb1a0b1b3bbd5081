//! Socket seam between the connection state machine and the network.
//!
//! A [`Connector`] turns a decorated [`UpgradeRequest`] into a [`FrameSink`]
//! and a [`FrameStream`]. [`TungsteniteConnector`] is the production
//! implementation; tests plug in [`MemoryConnector`](super::memory::MemoryConnector).

use async_trait::async_trait;
use futures_util::stream::{BoxStream, SplitSink};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, client_async_tls_with_config};

use super::error::{HandshakeError, TransportError, TransportResult};
use super::frame::Frame;
use super::tunnel::connect_via_proxy;
use crate::session::decorator::{ClientIdentity, UpgradeRequest};

/// Default cap on a single inbound message.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

pub type FrameStream = BoxStream<'static, TransportResult<Frame>>;

/// Write half of an open connection.
#[async_trait]
pub trait FrameSink: Send {
    async fn send_text(&mut self, text: String) -> TransportResult<()>;

    /// Send a close frame and flush.
    async fn close(&mut self) -> TransportResult<()>;
}

/// Both halves of a freshly upgraded connection.
pub struct Connected {
    pub sink: Box<dyn FrameSink>,
    pub frames: FrameStream,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, request: UpgradeRequest) -> Result<Connected, HandshakeError>;
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TungsteniteSink {
    inner: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for TungsteniteSink {
    async fn send_text(&mut self, text: String) -> TransportResult<()> {
        self.inner
            .send(Message::text(text))
            .await
            .map_err(TransportError::from)
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.inner.close().await.map_err(TransportError::from)
    }
}

/// WebSocket connector over `tokio-tungstenite` with native-tls.
#[derive(Debug, Clone)]
pub struct TungsteniteConnector {
    config: WebSocketConfig,
}

impl TungsteniteConnector {
    pub fn new() -> Self {
        Self::with_max_message_size(DEFAULT_MAX_MESSAGE_SIZE)
    }

    pub fn with_max_message_size(max_message_size: usize) -> Self {
        let config = WebSocketConfig::default()
            .max_message_size(Some(max_message_size))
            .max_frame_size(Some(max_message_size));
        Self { config }
    }
}

impl Default for TungsteniteConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, request: UpgradeRequest) -> Result<Connected, HandshakeError> {
        let url = request.url().clone();
        let host = url
            .host_str()
            .ok_or_else(|| HandshakeError::InvalidRequest("feed url has no host".into()))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| HandshakeError::InvalidRequest("feed url has no port".into()))?;
        let (request, identity, proxy) = request.into_parts();

        let stream = match proxy {
            Some(ref proxy) => connect_via_proxy(proxy, &host, port).await?,
            None => TcpStream::connect((host.as_str(), port))
                .await
                .map_err(|err| HandshakeError::Connect(format!("{host}:{port}: {err}")))?,
        };
        if let Err(err) = stream.set_nodelay(true) {
            log::debug!("set_nodelay failed: {err}");
        }

        let tls = match identity {
            Some(ref identity) if url.scheme() == "wss" => Some(tls_connector(identity)?),
            _ => None,
        };

        let (socket, response) =
            client_async_tls_with_config(request, stream, Some(self.config), tls).await?;
        log::debug!("upgrade of {url} answered {}", response.status());

        let (sink, stream) = socket.split();
        let frames = stream
            .map(|message| message.map(Frame::from).map_err(TransportError::from))
            .boxed();

        Ok(Connected {
            sink: Box::new(TungsteniteSink { inner: sink }),
            frames,
        })
    }
}

fn tls_connector(identity: &ClientIdentity) -> Result<tokio_tungstenite::Connector, HandshakeError> {
    let identity = identity
        .to_native()
        .map_err(|err| HandshakeError::Tls(format!("client identity: {err}")))?;
    let connector = native_tls::TlsConnector::builder()
        .identity(identity)
        .build()
        .map_err(|err| HandshakeError::Tls(err.to_string()))?;
    Ok(tokio_tungstenite::Connector::NativeTls(connector))
}
