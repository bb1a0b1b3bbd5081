//! WebSocket transport: one connection per attempt, and the supervisor that
//! replaces it after every unexpected closure.

pub mod connection;
pub mod connector;
pub mod error;
pub mod frame;
pub mod memory;
pub mod state;
pub mod supervisor;
pub mod tunnel;

pub use connection::{DEFAULT_HANDSHAKE_TIMEOUT, Handshake, TransportConnection};
pub use connector::{
    Connected, Connector, DEFAULT_MAX_MESSAGE_SIZE, FrameSink, FrameStream, TungsteniteConnector,
};
pub use error::{
    HandshakeError, LinkError, ProtocolError, SendError, TransportError, TransportResult, UriError,
};
pub use frame::{CloseFrame, Frame};
pub use memory::{HandshakeStep, MemoryConnector, MemoryPeer, RecordedRequest};
pub use state::{AttemptKind, CloseReason, ConnectionAttempt, ConnectionState, Termination};
pub use supervisor::{
    DEFAULT_RECONNECT_DELAY, LinkHandle, ReconnectPolicy, ReconnectSupervisor, StaticUris,
    SupervisorError, UriProvider,
};
