//! Core data structures shared across challenge detection and clearance.

use http::{HeaderMap, Method};
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

use crate::session::credentials::Credential;

/// Borrowed view of a gateway response handed to the detector and solvers.
#[derive(Debug, Clone)]
pub struct ChallengeResponse<'a> {
    pub url: &'a Url,
    pub status: u16,
    pub headers: &'a HeaderMap,
    pub body: &'a str,
    pub request_method: &'a Method,
}

/// Form replay produced by an external solver (e.g. a Turnstile token
/// posted back to the challenge endpoint).
#[derive(Debug, Clone)]
pub struct ChallengeSubmission {
    pub method: Method,
    pub url: Url,
    pub form_fields: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub wait: Duration,
}

impl ChallengeSubmission {
    pub fn new(
        method: Method,
        url: Url,
        form_fields: HashMap<String, String>,
        headers: HashMap<String, String>,
        wait: Duration,
    ) -> Self {
        Self {
            method,
            url,
            form_fields,
            headers,
            wait,
        }
    }

    /// POST of `form_fields` to `url` with no delay.
    pub fn post(url: Url, form_fields: HashMap<String, String>) -> Self {
        Self::new(Method::POST, url, form_fields, HashMap::new(), Duration::ZERO)
    }
}

/// Session material returned by an external challenge solver.
#[derive(Debug, Clone, Default)]
pub struct SolvedChallenge {
    /// Cookies issued to the solver (typically `cf_clearance`).
    pub cookies: Vec<Credential>,
    /// User-agent the solver used; clearance cookies are bound to it.
    pub user_agent: Option<String>,
    /// Optional form to replay before re-requesting the origin.
    pub submission: Option<ChallengeSubmission>,
}

impl SolvedChallenge {
    pub fn with_cookie(mut self, cookie: Credential) -> Self {
        self.cookies.push(cookie);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_submission(mut self, submission: ChallengeSubmission) -> Self {
        self.submission = Some(submission);
        self
    }
}
