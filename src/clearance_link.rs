//! High level link orchestration.
//!
//! Wires the clearance preflight, credential store, request decoration,
//! reconnect supervisor and event dispatch into a single client for a
//! real-time feed that sits behind a challenge gateway.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::challenges::core::{
	ChallengeHttpClient, ChallengeHttpClientError, ReqwestChallengeHttpClient,
};
use crate::challenges::solvers::ChallengeSolver;
use crate::config::ConfigError;
use crate::modules::events::{
	DEFAULT_QUEUE_CAPACITY, EventDispatcher, EventHandler, EventQueue, LinkObserver,
	LoggingHandler, MetricsHandler, ObserverHandler, OverflowPolicy, event_queue,
};
use crate::modules::metrics::{LinkMetrics, LinkStats};
use crate::session::bypass::{
	AccessToken, BypassError, BypassSettings, ChallengeBypassClient, CredentialSource,
	DEFAULT_CHALLENGE_WAIT, DEFAULT_MAX_CHALLENGE_ATTEMPTS, GatewayCookies,
};
use crate::session::credentials::{CredentialSet, CredentialStore};
use crate::session::decorator::{ClientIdentity, ConnectionContext, DecorateError, ProxySettings};
use crate::transport::connection::DEFAULT_HANDSHAKE_TIMEOUT;
use crate::transport::connector::{Connector, DEFAULT_MAX_MESSAGE_SIZE, TungsteniteConnector};
use crate::transport::supervisor::{
	LinkHandle, ReconnectPolicy, ReconnectSupervisor, StaticUris, SupervisorError, UriProvider,
};

/// Browser user-agent presented when none is configured.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";

/// Timeout applied to each preflight HTTP request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Result alias used across the orchestration layer.
pub type ClearanceLinkResult<T> = Result<T, ClearanceLinkError>;

/// High-level error surfaced by the orchestrator.
#[derive(Debug, Error)]
pub enum ClearanceLinkError {
	#[error("an origin url is required unless a credential source is supplied")]
	MissingOrigin,
	#[error("no feed url configured")]
	MissingFeedUrl,
	#[error("url parse error: {0}")]
	Url(#[from] url::ParseError),
	#[error("http client construction failed: {0}")]
	HttpClient(#[from] ChallengeHttpClientError),
	#[error("invalid connection settings: {0}")]
	Decorate(#[from] DecorateError),
	#[error("preflight failed: {0}")]
	Bypass(#[from] BypassError),
	#[error(transparent)]
	Supervisor(#[from] SupervisorError),
	#[error("configuration error: {0}")]
	Config(#[from] ConfigError),
}

/// Link configuration used by the builder.
#[derive(Clone)]
pub struct ClearanceLinkConfig {
	/// Gateway-protected page the preflight requests.
	pub origin: Option<String>,
	/// First-attempt feed url, used by [`ClearanceLink::static_uris`].
	pub feed_url: Option<String>,
	/// Feed url for later attempts; defaults to `feed_url`.
	pub reconnect_url: Option<String>,
	pub user_agent: String,
	pub cookies: GatewayCookies,
	pub access_token: Option<AccessToken>,
	pub headers: Vec<(String, String)>,
	pub identity: Option<ClientIdentity>,
	pub proxy: Option<String>,
	pub reconnect: ReconnectPolicy,
	pub handshake_timeout: Duration,
	pub request_timeout: Duration,
	pub max_challenge_attempts: u32,
	pub challenge_wait: Duration,
	pub queue_capacity: usize,
	pub overflow_policy: OverflowPolicy,
	pub max_message_size: usize,
	pub solver: Option<Arc<dyn ChallengeSolver>>,
	pub enable_metrics: bool,
}

impl Default for ClearanceLinkConfig {
	fn default() -> Self {
		Self {
			origin: None,
			feed_url: None,
			reconnect_url: None,
			user_agent: DEFAULT_USER_AGENT.to_string(),
			cookies: GatewayCookies::default(),
			access_token: None,
			headers: Vec::new(),
			identity: None,
			proxy: None,
			reconnect: ReconnectPolicy::default(),
			handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
			request_timeout: DEFAULT_REQUEST_TIMEOUT,
			max_challenge_attempts: DEFAULT_MAX_CHALLENGE_ATTEMPTS,
			challenge_wait: DEFAULT_CHALLENGE_WAIT,
			queue_capacity: DEFAULT_QUEUE_CAPACITY,
			overflow_policy: OverflowPolicy::default(),
			max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
			solver: None,
			enable_metrics: true,
		}
	}
}

/// Fluent builder for [`ClearanceLink`].
pub struct ClearanceLinkBuilder {
	config: ClearanceLinkConfig,
	observers: Vec<Arc<dyn LinkObserver>>,
	handlers: Vec<Arc<dyn EventHandler>>,
	connector: Option<Arc<dyn Connector>>,
	credential_source: Option<Arc<dyn CredentialSource>>,
	http_client: Option<Arc<dyn ChallengeHttpClient>>,
}

impl ClearanceLinkBuilder {
	pub fn new() -> Self {
		Self::with_config(ClearanceLinkConfig::default())
	}

	pub fn with_config(config: ClearanceLinkConfig) -> Self {
		Self {
			config,
			observers: Vec::new(),
			handlers: Vec::new(),
			connector: None,
			credential_source: None,
			http_client: None,
		}
	}

	pub fn config(&self) -> &ClearanceLinkConfig {
		&self.config
	}

	pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
		self.config.origin = Some(origin.into());
		self
	}

	pub fn with_feed_url(mut self, url: impl Into<String>) -> Self {
		self.config.feed_url = Some(url.into());
		self
	}

	pub fn with_reconnect_url(mut self, url: impl Into<String>) -> Self {
		self.config.reconnect_url = Some(url.into());
		self
	}

	pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
		self.config.user_agent = user_agent.into();
		self
	}

	pub fn with_cookie_names(mut self, cookies: GatewayCookies) -> Self {
		self.config.cookies = cookies;
		self
	}

	/// Present `token` as the access-token cookie on `domain`.
	pub fn with_access_token(mut self, token: impl Into<String>, domain: impl Into<String>) -> Self {
		self.config.access_token = Some(AccessToken::new(token, domain));
		self
	}

	pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
		self.config.headers.push((name.into(), value.into()));
		self
	}

	pub fn with_identity(mut self, identity: ClientIdentity) -> Self {
		self.config.identity = Some(identity);
		self
	}

	pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
		self.config.proxy = Some(proxy.into());
		self
	}

	pub fn with_reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
		self.config.reconnect = policy;
		self
	}

	pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
		self.config.handshake_timeout = timeout;
		self
	}

	pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
		self.config.request_timeout = timeout;
		self
	}

	pub fn with_max_challenge_attempts(mut self, attempts: u32) -> Self {
		self.config.max_challenge_attempts = attempts.max(1);
		self
	}

	pub fn with_challenge_wait(mut self, wait: Duration) -> Self {
		self.config.challenge_wait = wait;
		self
	}

	pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
		self.config.queue_capacity = capacity.max(1);
		self
	}

	pub fn with_overflow_policy(mut self, policy: OverflowPolicy) -> Self {
		self.config.overflow_policy = policy;
		self
	}

	pub fn with_max_message_size(mut self, bytes: usize) -> Self {
		self.config.max_message_size = bytes;
		self
	}

	pub fn with_solver(mut self, solver: Arc<dyn ChallengeSolver>) -> Self {
		self.config.solver = Some(solver);
		self
	}

	pub fn disable_metrics(mut self) -> Self {
		self.config.enable_metrics = false;
		self
	}

	pub fn with_observer(mut self, observer: Arc<dyn LinkObserver>) -> Self {
		self.observers.push(observer);
		self
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.handlers.push(handler);
		self
	}

	/// Replace the WebSocket connector (tests, custom transports).
	pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
		self.connector = Some(connector);
		self
	}

	/// Skip the built-in preflight and take credentials from `source`.
	pub fn with_credential_source(mut self, source: Arc<dyn CredentialSource>) -> Self {
		self.credential_source = Some(source);
		self
	}

	/// Replace the HTTP client the preflight uses.
	pub fn with_http_client(mut self, client: Arc<dyn ChallengeHttpClient>) -> Self {
		self.http_client = Some(client);
		self
	}

	pub fn build(self) -> ClearanceLinkResult<ClearanceLink> {
		ClearanceLink::from_builder(self)
	}
}

impl Default for ClearanceLinkBuilder {
	fn default() -> Self {
		Self::new()
	}
}

/// Main link orchestrator.
pub struct ClearanceLink {
	config: ClearanceLinkConfig,
	supervisor: ReconnectSupervisor,
	source: Arc<dyn CredentialSource>,
	store: Arc<CredentialStore>,
	dispatcher: Arc<EventDispatcher>,
	queue: Mutex<Option<EventQueue>>,
	metrics: Option<LinkMetrics>,
}

impl ClearanceLink {
	/// Obtain a builder to customise the link.
	pub fn builder() -> ClearanceLinkBuilder {
		ClearanceLinkBuilder::new()
	}

	fn from_builder(builder: ClearanceLinkBuilder) -> ClearanceLinkResult<Self> {
		let ClearanceLinkBuilder {
			config,
			observers,
			handlers,
			connector,
			credential_source,
			http_client,
		} = builder;

		let metrics = config.enable_metrics.then(LinkMetrics::new);
		let (mut events, queue) = event_queue(config.queue_capacity, config.overflow_policy);

		let mut dispatcher = EventDispatcher::new();
		dispatcher.register_handler(Arc::new(LoggingHandler));
		if let Some(ref metrics) = metrics {
			events = events.with_metrics(metrics.clone());
			dispatcher.register_handler(Arc::new(MetricsHandler::new(metrics.clone())));
		}
		for observer in observers {
			dispatcher.register_handler(Arc::new(ObserverHandler::new(observer)));
		}
		for handler in handlers {
			dispatcher.register_handler(handler);
		}

		let proxy = config.proxy.as_deref().map(ProxySettings::parse).transpose()?;

		let mut context = ConnectionContext::new();
		if let Some(ref identity) = config.identity {
			context = context.with_identity(identity.clone());
		}
		if let Some(ref proxy) = proxy {
			context = context.with_proxy(proxy.clone());
		}
		for (name, value) in &config.headers {
			context = context.with_header(name.clone(), value.clone());
		}

		let source: Arc<dyn CredentialSource> = match credential_source {
			Some(source) => {
				// External sets may not carry a user-agent of their own.
				context = context.with_user_agent(config.user_agent.clone());
				source
			}
			None => {
				let origin = config.origin.as_deref().ok_or(ClearanceLinkError::MissingOrigin)?;
				let origin = Url::parse(origin)?;
				let http: Arc<dyn ChallengeHttpClient> = match http_client {
					Some(client) => client,
					None => Arc::new(ReqwestChallengeHttpClient::new(
						&config.user_agent,
						proxy.as_ref().map(ProxySettings::url),
						config.request_timeout,
					)?),
				};

				let mut settings = BypassSettings::new(origin, config.user_agent.clone())
					.with_cookies(config.cookies.clone())
					.with_max_challenge_attempts(config.max_challenge_attempts)
					.with_challenge_wait(config.challenge_wait);
				if let Some(ref token) = config.access_token {
					settings = settings.with_access_token(token.clone());
				}

				let mut bypass = ChallengeBypassClient::new(http, settings).with_events(events.clone());
				if let Some(ref solver) = config.solver {
					bypass = bypass.with_solver(solver.clone());
				}
				Arc::new(bypass)
			}
		};

		let connector: Arc<dyn Connector> = match connector {
			Some(connector) => connector,
			None => Arc::new(TungsteniteConnector::with_max_message_size(config.max_message_size)),
		};

		let store = Arc::new(CredentialStore::new());
		let mut supervisor = ReconnectSupervisor::new(connector, source.clone(), store.clone(), events)
			.with_policy(config.reconnect.clone())
			.with_context(context)
			.with_handshake_timeout(config.handshake_timeout);
		if let Some(ref metrics) = metrics {
			supervisor = supervisor.with_metrics(metrics.clone());
		}

		Ok(Self {
			config,
			supervisor,
			source,
			store,
			dispatcher: Arc::new(dispatcher),
			queue: Mutex::new(Some(queue)),
			metrics,
		})
	}

	/// Keep the feed connected until `cancel` fires.
	///
	/// Observers are invoked from a single dispatcher task, in order; the
	/// task is drained and joined before this returns.
	pub async fn run(&self, uris: &dyn UriProvider, cancel: &CancellationToken) -> ClearanceLinkResult<()> {
		let queue = self
			.queue
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.take()
			.ok_or(SupervisorError::AlreadyRunning)?;

		let shutdown = CancellationToken::new();
		let dispatch = tokio::spawn(queue.run(self.dispatcher.clone(), shutdown.clone()));

		let result = self.supervisor.run(uris, cancel).await;

		shutdown.cancel();
		match dispatch.await {
			Ok(queue) => {
				*self.queue.lock().unwrap_or_else(PoisonError::into_inner) = Some(queue);
			}
			Err(err) => log::warn!("event dispatcher task failed: {err}"),
		}

		result.map_err(ClearanceLinkError::from)
	}

	/// Connect and reconnect targets taken from the configuration.
	pub fn static_uris(&self) -> ClearanceLinkResult<StaticUris> {
		let connect = self.config.feed_url.as_deref().ok_or(ClearanceLinkError::MissingFeedUrl)?;
		let connect = Url::parse(connect)?;
		let reconnect = match self.config.reconnect_url.as_deref() {
			Some(url) => Url::parse(url)?,
			None => connect.clone(),
		};
		Ok(StaticUris::new(connect, reconnect))
	}

	/// Send side of the link, valid across reconnects.
	pub fn handle(&self) -> LinkHandle {
		self.supervisor.handle()
	}

	/// Current credentials snapshot.
	pub fn credentials(&self) -> Arc<CredentialSet> {
		self.store.snapshot()
	}

	pub fn store(&self) -> &Arc<CredentialStore> {
		&self.store
	}

	/// Run the preflight now and publish its result. Returns the new
	/// credentials generation.
	pub async fn refresh_credentials(&self, cancel: &CancellationToken) -> ClearanceLinkResult<u64> {
		let credentials = self.source.acquire_credentials(cancel).await?;
		Ok(self.store.replace(credentials))
	}

	/// Metrics snapshot, when metrics are enabled.
	pub fn metrics(&self) -> Option<LinkStats> {
		self.metrics.as_ref().map(LinkMetrics::snapshot)
	}

	pub fn config(&self) -> &ClearanceLinkConfig {
		&self.config
	}
}
