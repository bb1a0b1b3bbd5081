#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use clearance_link::{
    BypassError, ClearanceLink, ClearanceLinkBuilder, Credential, CredentialSet, CredentialSource,
    EventHandler, LinkError, LinkEvent, LinkObserver, MemoryConnector, ReconnectPolicy,
    StaticUris, Termination,
};
use clearance_link::transport::MemoryPeer;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use url::Url;

pub const CONNECT_URL: &str = "wss://socket.example.com/signalr/connect?transport=webSockets";
pub const RECONNECT_URL: &str = "wss://socket.example.com/signalr/reconnect?transport=webSockets";
pub const WAIT: Duration = Duration::from_secs(5);

pub fn cleared() -> CredentialSet {
    CredentialSet::new()
        .with_credential(Credential::new("__cfduid", "sid", ".example.com"))
        .with_credential(Credential::new("cf_clearance", "clr", ".example.com"))
}

pub fn uris() -> StaticUris {
    StaticUris::new(
        Url::parse(CONNECT_URL).unwrap(),
        Url::parse(RECONNECT_URL).unwrap(),
    )
}

/// Credential source that replays scripted outcomes, then keeps succeeding.
#[derive(Default)]
pub struct ScriptedSource {
    outcomes: Mutex<VecDeque<Result<CredentialSet, BypassError>>>,
    calls: AtomicUsize,
    hang: bool,
}

impl ScriptedSource {
    pub fn with_outcomes(outcomes: impl IntoIterator<Item = Result<CredentialSet, BypassError>>) -> Self {
        Self {
            outcomes: Mutex::new(outcomes.into_iter().collect()),
            ..Default::default()
        }
    }

    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialSource for ScriptedSource {
    async fn acquire_credentials(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<CredentialSet, BypassError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang {
            std::future::pending::<()>().await;
        }
        self.outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(cleared()))
    }
}

/// Records observer callbacks in order.
#[derive(Default)]
pub struct Recorder {
    pub log: Mutex<Vec<String>>,
}

impl Recorder {
    pub fn entries(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.entries().iter().filter(|entry| entry.starts_with(prefix)).count()
    }

    pub fn messages(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter_map(|entry| entry.strip_prefix("message:").map(str::to_string))
            .collect()
    }
}

impl LinkObserver for Recorder {
    fn on_open(&self) {
        self.log.lock().unwrap().push("open".into());
    }

    fn on_message(&self, text: &str) {
        self.log.lock().unwrap().push(format!("message:{text}"));
    }

    fn on_close(&self, termination: &Termination) {
        self.log.lock().unwrap().push(format!("close:{}", termination.reason));
    }

    fn on_error(&self, error: &LinkError) {
        self.log.lock().unwrap().push(format!("error:{error}"));
    }
}

/// Forwards every event to the test body.
pub struct ChannelHandler(pub mpsc::UnboundedSender<LinkEvent>);

impl EventHandler for ChannelHandler {
    fn handle(&self, event: &LinkEvent) {
        let _ = self.0.send(event.clone());
    }
}

pub struct Harness {
    pub link: Arc<ClearanceLink>,
    pub connector: Arc<MemoryConnector>,
    pub peers: mpsc::UnboundedReceiver<MemoryPeer>,
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
    pub recorder: Arc<Recorder>,
    pub cancel: CancellationToken,
}

impl Harness {
    pub fn new(source: Arc<dyn CredentialSource>, connector: MemoryConnector, peers: mpsc::UnboundedReceiver<MemoryPeer>) -> Self {
        Self::with(source, connector, peers, |builder| builder)
    }

    pub fn with(
        source: Arc<dyn CredentialSource>,
        connector: MemoryConnector,
        peers: mpsc::UnboundedReceiver<MemoryPeer>,
        customize: impl FnOnce(ClearanceLinkBuilder) -> ClearanceLinkBuilder,
    ) -> Self {
        let connector = Arc::new(connector);
        let recorder = Arc::new(Recorder::default());
        let (tx, events) = mpsc::unbounded_channel();
        let builder = ClearanceLink::builder()
            .with_credential_source(source)
            .with_connector(connector.clone())
            .with_reconnect_policy(ReconnectPolicy::fixed(Duration::from_millis(20)))
            .with_observer(recorder.clone())
            .with_event_handler(Arc::new(ChannelHandler(tx)));
        let link = customize(builder).build().unwrap();
        Self {
            link: Arc::new(link),
            connector,
            peers,
            events,
            recorder,
            cancel: CancellationToken::new(),
        }
    }

    pub fn spawn(&self) -> tokio::task::JoinHandle<clearance_link::ClearanceLinkResult<()>> {
        self.spawn_with(uris())
    }

    pub fn spawn_with<U>(&self, uris: U) -> tokio::task::JoinHandle<clearance_link::ClearanceLinkResult<()>>
    where
        U: clearance_link::UriProvider + 'static,
    {
        let link = self.link.clone();
        let cancel = self.cancel.clone();
        tokio::spawn(async move { link.run(&uris, &cancel).await })
    }

    pub async fn next_peer(&mut self) -> MemoryPeer {
        tokio::time::timeout(WAIT, self.peers.recv())
            .await
            .expect("connection attempt in time")
            .expect("connector alive")
    }

    /// Wait for the first event matching `predicate`, skipping others.
    pub async fn wait_for(&mut self, predicate: impl Fn(&LinkEvent) -> bool) -> LinkEvent {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let event = tokio::time::timeout_at(deadline, self.events.recv())
                .await
                .expect("event in time")
                .expect("dispatcher alive");
            if predicate(&event) {
                return event;
            }
        }
    }
}
