//! # clearance-link
//!
//! A resilient WebSocket client for real-time feeds that sit behind a
//! Cloudflare-style anti-bot gateway.
//!
//! The gateway only lets clients upgrade to WebSocket after they have passed
//! its challenge over plain HTTP. The crate runs that preflight, stores the
//! resulting cookies, presents them on every upgrade, and keeps the feed
//! connected across drops.
//!
//! ## Features
//!
//! - Clearance preflight with manual redirect following and challenge detection
//! - Optional external solver for managed and Turnstile challenges
//! - Atomic credential snapshots, refreshed on expiry or gateway rejection
//! - Request decoration: cookies, user-agent, headers, client identity, proxy
//! - Single-connection reconnect loop with fixed delay and optional jitter
//! - Ordered event delivery through a bounded queue with an overflow policy
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use clearance_link::{ClearanceLink, LinkObserver};
//! use tokio_util::sync::CancellationToken;
//!
//! struct Printer;
//!
//! impl LinkObserver for Printer {
//!     fn on_message(&self, text: &str) {
//!         println!("{text}");
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let link = ClearanceLink::builder()
//!         .with_origin("https://www.example.com/")
//!         .with_feed_url("wss://socket.example.com/signalr/connect")
//!         .with_observer(Arc::new(Printer))
//!         .build()?;
//!
//!     let uris = link.static_uris()?;
//!     let cancel = CancellationToken::new();
//!     link.run(&uris, &cancel).await?;
//!     Ok(())
//! }
//! ```

mod clearance_link;

pub mod challenges;
pub mod config;
pub mod modules;
pub mod session;
pub mod transport;

pub use crate::clearance_link::{
    ClearanceLink,
    ClearanceLinkBuilder,
    ClearanceLinkConfig,
    ClearanceLinkError,
    ClearanceLinkResult,
    DEFAULT_REQUEST_TIMEOUT,
    DEFAULT_USER_AGENT,
};

pub use crate::challenges::core::{
    ChallengeExecutionError,
    ChallengeHttpClient,
    ChallengeHttpClientError,
    ChallengeHttpResponse,
    ChallengeResponse,
    ChallengeSubmission,
    OriginalRequest,
    ReqwestChallengeHttpClient,
    SolvedChallenge,
    execute_challenge_submission,
};

pub use crate::challenges::detectors::{
    ChallengeDetection,
    ChallengeDetector,
    ChallengeType,
    ResponseStrategy,
};

pub use crate::challenges::pipeline::{
    ChallengePipelineResult,
    ClearancePipeline,
    PipelineError,
    UnsupportedReason,
};

pub use crate::challenges::solvers::{
    ChallengeContext,
    ChallengeSolver,
    MitigationPlan,
    SolverError,
};

pub use crate::config::{ConfigError, FileConfig};

pub use crate::modules::{
    ClosedEvent,
    ErrorEvent,
    EventDispatcher,
    EventHandler,
    LinkEvent,
    LinkMetrics,
    LinkObserver,
    LinkStats,
    LoggingHandler,
    MessageEvent,
    MetricsHandler,
    OpenedEvent,
    OverflowPolicy,
    PreflightEvent,
    RetryEvent,
};

pub use crate::session::{
    AccessToken,
    BypassError,
    BypassSettings,
    ChallengeBypassClient,
    ClientIdentity,
    ConnectionContext,
    Credential,
    CredentialFlags,
    CredentialSet,
    CredentialSource,
    CredentialStore,
    DecoratableRequest,
    DecorateError,
    GatewayCookies,
    ProxySettings,
    RequestDecorator,
    UpgradeRequest,
};

pub use crate::transport::{
    AttemptKind,
    CloseReason,
    ConnectionState,
    Connector,
    HandshakeError,
    LinkError,
    LinkHandle,
    MemoryConnector,
    ProtocolError,
    ReconnectPolicy,
    ReconnectSupervisor,
    SendError,
    StaticUris,
    SupervisorError,
    Termination,
    TransportConnection,
    TungsteniteConnector,
    UriError,
    UriProvider,
};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
