//! Challenge resolution strategies.
//!
//! The crate never executes challenge scripts. Pages that need real solving
//! are handed to an external [`ChallengeSolver`] (browser automation, a
//! solving service...) whose cookies are replayed; everything else is handled
//! by waiting and retrying.

pub mod rate_limit;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use url::Url;

use crate::challenges::core::SolvedChallenge;
use crate::challenges::detectors::ChallengeType;

/// Everything an external solver needs to clear a challenge page.
#[derive(Debug, Clone)]
pub struct ChallengeContext {
    pub url: Url,
    pub status: u16,
    pub challenge_type: ChallengeType,
    pub body: String,
    pub user_agent: String,
}

#[derive(Debug, Error)]
pub enum SolverError {
    #[error("solver does not handle {0:?} challenges")]
    Unsupported(ChallengeType),
    #[error("solver failed: {0}")]
    Failed(String),
}

/// External challenge solver.
#[async_trait]
pub trait ChallengeSolver: Send + Sync {
    fn name(&self) -> &'static str;

    async fn solve(&self, challenge: &ChallengeContext) -> Result<SolvedChallenge, SolverError>;
}

/// Retry instructions returned by handlers that do not solve anything.
#[derive(Debug, Clone, PartialEq)]
pub struct MitigationPlan {
    pub should_retry: bool,
    pub wait: Option<Duration>,
    pub reason: String,
    pub metadata: HashMap<String, String>,
}

impl MitigationPlan {
    pub fn retry_after(wait: Duration, reason: impl Into<String>) -> Self {
        Self {
            should_retry: true,
            wait: Some(wait),
            reason: reason.into(),
            metadata: HashMap::new(),
        }
    }

    pub fn abort(reason: impl Into<String>) -> Self {
        Self {
            should_retry: false,
            wait: None,
            reason: reason.into(),
            metadata: HashMap::new(),
        }
    }
}
