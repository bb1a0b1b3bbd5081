//! Clearance preflight.
//!
//! [`ChallengeBypassClient`] issues a GET against the gateway-protected
//! origin, walks any challenge through the [`ClearancePipeline`], and returns
//! the cookies the WebSocket upgrade must present. It never touches the
//! [`CredentialStore`](super::credentials::CredentialStore); the caller decides
//! when to publish the result.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use http::header::{HeaderMap, HeaderValue, USER_AGENT};
use http::Method;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use url::Url;

use super::credentials::{Credential, CredentialSet};
use crate::challenges::core::executor::{
    DEFAULT_MAX_REDIRECTS, OriginalRequest, execute_challenge_submission, fetch_following_redirects,
};
use crate::challenges::core::{ChallengeExecutionError, ChallengeHttpClient, ChallengeResponse};
use crate::challenges::pipeline::{ChallengePipelineResult, ClearancePipeline};
use crate::challenges::solvers::ChallengeSolver;
use crate::modules::events::{EventSender, LinkEvent, PreflightEvent};

pub const DEFAULT_MAX_CHALLENGE_ATTEMPTS: u32 = 3;
pub const DEFAULT_CHALLENGE_WAIT: Duration = Duration::from_secs(5);

/// Cookie names issued by the gateway and the application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayCookies {
    /// Session identifier set alongside the clearance.
    pub session: String,
    /// Clearance proving the challenge was passed.
    pub clearance: String,
    /// Name under which the caller's access token is presented.
    pub access_token: String,
}

impl Default for GatewayCookies {
    fn default() -> Self {
        Self {
            session: "__cfduid".into(),
            clearance: "cf_clearance".into(),
            access_token: ".AspNet.ApplicationCookie".into(),
        }
    }
}

/// Caller-supplied application token, scoped to the application domain.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub value: String,
    pub domain: String,
}

impl AccessToken {
    pub fn new(value: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            domain: domain.into(),
        }
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("value", &"<redacted>")
            .field("domain", &self.domain)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct BypassSettings {
    pub origin: Url,
    pub user_agent: String,
    pub cookies: GatewayCookies,
    pub access_token: Option<AccessToken>,
    pub max_challenge_attempts: u32,
    /// Delay before re-requesting after an interstitial or a rate limit
    /// without a hint.
    pub challenge_wait: Duration,
}

impl BypassSettings {
    pub fn new(origin: Url, user_agent: impl Into<String>) -> Self {
        Self {
            origin,
            user_agent: user_agent.into(),
            cookies: GatewayCookies::default(),
            access_token: None,
            max_challenge_attempts: DEFAULT_MAX_CHALLENGE_ATTEMPTS,
            challenge_wait: DEFAULT_CHALLENGE_WAIT,
        }
    }

    pub fn with_cookies(mut self, cookies: GatewayCookies) -> Self {
        self.cookies = cookies;
        self
    }

    pub fn with_access_token(mut self, token: AccessToken) -> Self {
        self.access_token = Some(token);
        self
    }

    pub fn with_max_challenge_attempts(mut self, attempts: u32) -> Self {
        self.max_challenge_attempts = attempts.max(1);
        self
    }

    pub fn with_challenge_wait(mut self, wait: Duration) -> Self {
        self.challenge_wait = wait;
        self
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BypassError {
    #[error("no clearance obtained, missing cookies: {missing}")]
    NoClearance { missing: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("access blocked by gateway: {0}")]
    Blocked(String),
    #[error("malformed gateway response: {0}")]
    MalformedResponse(String),
    #[error("invalid preflight configuration: {0}")]
    InvalidConfiguration(String),
    #[error("preflight cancelled")]
    Cancelled,
}

impl BypassError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BypassError::NoClearance { .. } | BypassError::Network(_) | BypassError::Blocked(_)
        )
    }
}

impl From<ChallengeExecutionError> for BypassError {
    fn from(err: ChallengeExecutionError) -> Self {
        match err {
            ChallengeExecutionError::InvalidAnswer => BypassError::Blocked(err.to_string()),
            ChallengeExecutionError::TooManyRedirects(_)
            | ChallengeExecutionError::InvalidRedirect(_) => {
                BypassError::MalformedResponse(err.to_string())
            }
            ChallengeExecutionError::InvalidHeader(_) => {
                BypassError::InvalidConfiguration(err.to_string())
            }
            ChallengeExecutionError::Client(err) => BypassError::Network(err.to_string()),
        }
    }
}

/// Produces the credentials a connection attempt presents.
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn acquire_credentials(
        &self,
        cancel: &CancellationToken,
    ) -> Result<CredentialSet, BypassError>;
}

/// A fixed set, for callers that obtained the clearance out of band.
#[async_trait]
impl CredentialSource for CredentialSet {
    async fn acquire_credentials(
        &self,
        _cancel: &CancellationToken,
    ) -> Result<CredentialSet, BypassError> {
        Ok(self.clone())
    }
}

#[derive(Debug, Default)]
struct Progress {
    attempts: u32,
    challenge: Option<String>,
}

/// Runs the clearance preflight against the gateway.
pub struct ChallengeBypassClient {
    http: Arc<dyn ChallengeHttpClient>,
    pipeline: Mutex<ClearancePipeline>,
    settings: BypassSettings,
    events: Option<EventSender>,
}

impl ChallengeBypassClient {
    pub fn new(http: Arc<dyn ChallengeHttpClient>, settings: BypassSettings) -> Self {
        let pipeline = ClearancePipeline::default().with_interstitial_wait(settings.challenge_wait);
        Self {
            http,
            pipeline: Mutex::new(pipeline),
            settings,
            events: None,
        }
    }

    /// Hand managed and Turnstile challenges to an external solver.
    pub fn with_solver(self, solver: Arc<dyn ChallengeSolver>) -> Self {
        let pipeline = self.pipeline.into_inner().with_solver(solver);
        Self {
            pipeline: Mutex::new(pipeline),
            ..self
        }
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    pub fn settings(&self) -> &BypassSettings {
        &self.settings
    }

    /// Obtain a clearance for `origin` while presenting `user_agent`.
    pub async fn acquire(
        &self,
        origin: &Url,
        user_agent: &str,
        cancel: &CancellationToken,
    ) -> Result<CredentialSet, BypassError> {
        validate(origin, user_agent)?;

        let mut progress = Progress::default();
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BypassError::Cancelled),
            result = self.preflight(origin, user_agent, &mut progress) => result,
        };

        match result {
            Ok(ref set) => log::info!(
                "clearance for {origin} obtained after {} request(s), {} credential(s)",
                progress.attempts,
                set.len()
            ),
            Err(BypassError::Cancelled) => log::debug!("preflight for {origin} cancelled"),
            Err(ref err) => log::warn!("preflight for {origin} failed: {err}"),
        }

        if let Some(ref events) = self.events
            && !matches!(result, Err(BypassError::Cancelled))
        {
            events
                .emit(LinkEvent::Preflight(PreflightEvent {
                    origin: origin.clone(),
                    success: result.is_ok(),
                    attempts: progress.attempts,
                    challenge: progress.challenge,
                    error: result.as_ref().err().map(ToString::to_string),
                    timestamp: Utc::now(),
                }))
                .await;
        }

        result
    }

    async fn preflight(
        &self,
        origin: &Url,
        user_agent: &str,
        progress: &mut Progress,
    ) -> Result<CredentialSet, BypassError> {
        let mut user_agent = user_agent.to_string();
        let mut collected: Vec<Credential> = Vec::new();
        let max_attempts = self.settings.max_challenge_attempts.max(1);

        while progress.attempts < max_attempts {
            progress.attempts += 1;

            let request = OriginalRequest::new(Method::GET, origin.clone())
                .with_headers(user_agent_headers(&user_agent)?);
            log::debug!("preflight request {} to {origin}", progress.attempts);
            let response =
                fetch_following_redirects(self.http.as_ref(), &request, DEFAULT_MAX_REDIRECTS)
                    .await?;
            collected.extend(response.cookies.iter().cloned());

            let body = response.body_text();
            let view = ChallengeResponse {
                url: &response.url,
                status: response.status,
                headers: &response.headers,
                body: &body,
                request_method: &request.method,
            };
            let verdict = self.pipeline.lock().await.evaluate(&view, &user_agent).await;

            match verdict {
                ChallengePipelineResult::NoChallenge => {
                    return self.finish(&collected, user_agent);
                }
                ChallengePipelineResult::Solved {
                    detection,
                    solution,
                } => {
                    log::info!("{} solved by external solver", detection.pattern_name);
                    progress.challenge = Some(detection.pattern_name.clone());

                    if let Some(solved_agent) = solution.user_agent {
                        user_agent = solved_agent;
                    }
                    self.http.inject_cookies(origin, &solution.cookies);
                    collected.extend(solution.cookies);

                    if let Some(submission) = solution.submission {
                        let replay = OriginalRequest::new(Method::GET, origin.clone())
                            .with_headers(user_agent_headers(&user_agent)?);
                        let outcome =
                            execute_challenge_submission(self.http.clone(), submission, replay).await;
                        self.pipeline
                            .lock()
                            .await
                            .record_outcome(&detection.pattern_id, outcome.is_ok());
                        collected.extend(outcome?.cookies);
                    }
                }
                ChallengePipelineResult::Mitigation { detection, plan } => {
                    progress.challenge = Some(detection.pattern_name.clone());
                    if !plan.should_retry {
                        return Err(BypassError::Blocked(format!(
                            "{} ({})",
                            detection.pattern_name, plan.reason
                        )));
                    }
                    let wait = plan.wait.unwrap_or(self.settings.challenge_wait);
                    log::info!(
                        "{} at {}, retrying in {wait:?}",
                        detection.pattern_name,
                        response.url
                    );
                    tokio::time::sleep(wait).await;
                }
                ChallengePipelineResult::Unsupported { detection, reason } => {
                    progress.challenge = Some(detection.pattern_name.clone());
                    return Err(BypassError::Blocked(format!(
                        "{}: {reason}",
                        detection.pattern_name
                    )));
                }
                ChallengePipelineResult::Failed { detection, error } => {
                    progress.challenge = Some(detection.pattern_name.clone());
                    return Err(BypassError::Blocked(format!(
                        "{}: {error}",
                        detection.pattern_name
                    )));
                }
            }
        }

        self.finish(&collected, user_agent)
    }

    fn finish(
        &self,
        collected: &[Credential],
        user_agent: String,
    ) -> Result<CredentialSet, BypassError> {
        let names = &self.settings.cookies;
        let latest = |name: &str| collected.iter().rev().find(|cookie| cookie.name == name);

        let session = latest(&names.session);
        let clearance = latest(&names.clearance);
        let (Some(session), Some(clearance)) = (session, clearance) else {
            let missing: Vec<&str> = [(&names.session, session), (&names.clearance, clearance)]
                .into_iter()
                .filter(|(_, cookie)| cookie.is_none())
                .map(|(name, _)| name.as_str())
                .collect();
            return Err(BypassError::NoClearance {
                missing: missing.join(", "),
            });
        };

        let mut set = CredentialSet::new().with_user_agent(user_agent);
        set.insert(session.clone());
        set.insert(clearance.clone());
        if let Some(ref token) = self.settings.access_token {
            set.insert(Credential::new(
                names.access_token.clone(),
                token.value.clone(),
                token.domain.clone(),
            ));
        }
        Ok(set)
    }
}

#[async_trait]
impl CredentialSource for ChallengeBypassClient {
    async fn acquire_credentials(
        &self,
        cancel: &CancellationToken,
    ) -> Result<CredentialSet, BypassError> {
        self.acquire(&self.settings.origin, &self.settings.user_agent, cancel)
            .await
    }
}

impl fmt::Debug for ChallengeBypassClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChallengeBypassClient")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

fn validate(origin: &Url, user_agent: &str) -> Result<(), BypassError> {
    if !matches!(origin.scheme(), "http" | "https") || !origin.has_host() {
        return Err(BypassError::InvalidConfiguration(format!(
            "origin must be an absolute http(s) url, got '{origin}'"
        )));
    }
    if user_agent.trim().is_empty() {
        return Err(BypassError::InvalidConfiguration(
            "user agent must not be empty".into(),
        ));
    }
    Ok(())
}

fn user_agent_headers(user_agent: &str) -> Result<HeaderMap, BypassError> {
    let value = HeaderValue::from_str(user_agent)
        .map_err(|_| BypassError::InvalidConfiguration("user agent is not a valid header".into()))?;
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, value);
    Ok(headers)
}
