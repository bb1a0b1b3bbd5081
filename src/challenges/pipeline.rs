//! Challenge orchestration pipeline.
//!
//! Analyses a [`ChallengeResponse`] and tells the preflight what to do next:
//! nothing (the origin answered), replay material from an external solver,
//! wait and retry, or give up.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::challenges::core::{ChallengeResponse, SolvedChallenge};
use crate::challenges::detectors::{
    ChallengeDetection, ChallengeDetector, ChallengeType, ResponseStrategy,
};
use crate::challenges::solvers::{
    ChallengeContext, ChallengeSolver, MitigationPlan, SolverError, rate_limit::RateLimitHandler,
};

/// Wait applied before re-requesting an interstitial when no solver is set.
pub const DEFAULT_INTERSTITIAL_WAIT: Duration = Duration::from_secs(5);

/// High level result returned by the pipeline after analysing a response.
#[derive(Debug)]
pub enum ChallengePipelineResult {
    /// The response does not look like a gateway challenge.
    NoChallenge,
    /// The external solver returned session material to replay.
    Solved {
        detection: ChallengeDetection,
        solution: SolvedChallenge,
    },
    /// Wait (or abort) according to the plan.
    Mitigation {
        detection: ChallengeDetection,
        plan: MitigationPlan,
    },
    /// A challenge was detected but nothing configured can handle it.
    Unsupported {
        detection: ChallengeDetection,
        reason: UnsupportedReason,
    },
    /// The external solver failed.
    Failed {
        detection: ChallengeDetection,
        error: PipelineError,
    },
}

/// Reason why the pipeline could not act on a detected challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnsupportedReason {
    MissingSolver(ChallengeType),
    UnknownChallenge,
}

impl fmt::Display for UnsupportedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnsupportedReason::MissingSolver(kind) => {
                write!(f, "{kind:?} challenge requires an external solver")
            }
            UnsupportedReason::UnknownChallenge => write!(f, "unrecognised challenge"),
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("external solver '{name}' failed: {source}")]
    Solver {
        name: &'static str,
        #[source]
        source: SolverError,
    },
}

/// Coordinates challenge detection and resolution strategy.
pub struct ClearancePipeline {
    detector: ChallengeDetector,
    solver: Option<Arc<dyn ChallengeSolver>>,
    rate_limit: RateLimitHandler,
    interstitial_wait: Duration,
}

impl ClearancePipeline {
    pub fn new(detector: ChallengeDetector) -> Self {
        Self {
            detector,
            solver: None,
            rate_limit: RateLimitHandler::new(),
            interstitial_wait: DEFAULT_INTERSTITIAL_WAIT,
        }
    }

    /// Attach the external solver.
    pub fn with_solver(mut self, solver: Arc<dyn ChallengeSolver>) -> Self {
        self.solver = Some(solver);
        self
    }

    pub fn with_rate_limit(mut self, handler: RateLimitHandler) -> Self {
        self.rate_limit = handler;
        self
    }

    pub fn with_interstitial_wait(mut self, wait: Duration) -> Self {
        self.interstitial_wait = wait;
        self
    }

    pub fn detector(&self) -> &ChallengeDetector {
        &self.detector
    }

    /// Evaluate a response and decide how to proceed.
    pub async fn evaluate(
        &mut self,
        response: &ChallengeResponse<'_>,
        user_agent: &str,
    ) -> ChallengePipelineResult {
        let Some(detection) = self.detector.detect(response) else {
            return ChallengePipelineResult::NoChallenge;
        };

        match detection.response_strategy {
            ResponseStrategy::DelayRetry => {
                let plan = self.rate_limit.plan(response);
                ChallengePipelineResult::Mitigation { detection, plan }
            }
            ResponseStrategy::Abort => {
                let plan = MitigationPlan::abort(detection.pattern_id.clone());
                ChallengePipelineResult::Mitigation { detection, plan }
            }
            ResponseStrategy::SolveOrWait | ResponseStrategy::ExternalSolver => {
                match self.solver.clone() {
                    Some(solver) => self.solve(solver, detection, response, user_agent).await,
                    None if detection.response_strategy == ResponseStrategy::SolveOrWait => {
                        let plan = MitigationPlan::retry_after(self.interstitial_wait, "interstitial");
                        ChallengePipelineResult::Mitigation { detection, plan }
                    }
                    None => {
                        let reason = match detection.challenge_type {
                            ChallengeType::Unknown => UnsupportedReason::UnknownChallenge,
                            other => UnsupportedReason::MissingSolver(other),
                        };
                        ChallengePipelineResult::Unsupported { detection, reason }
                    }
                }
            }
        }
    }

    async fn solve(
        &self,
        solver: Arc<dyn ChallengeSolver>,
        detection: ChallengeDetection,
        response: &ChallengeResponse<'_>,
        user_agent: &str,
    ) -> ChallengePipelineResult {
        let context = ChallengeContext {
            url: response.url.clone(),
            status: response.status,
            challenge_type: detection.challenge_type,
            body: response.body.to_string(),
            user_agent: user_agent.to_string(),
        };

        log::debug!(
            "handing {} challenge at {} to solver '{}'",
            detection.pattern_name,
            context.url,
            solver.name()
        );

        match solver.solve(&context).await {
            Ok(solution) => ChallengePipelineResult::Solved {
                detection,
                solution,
            },
            Err(source) => ChallengePipelineResult::Failed {
                detection,
                error: PipelineError::Solver {
                    name: solver.name(),
                    source,
                },
            },
        }
    }

    /// Feed the detector with challenge outcome data.
    pub fn record_outcome(&mut self, pattern_id: &str, success: bool) {
        self.detector.learn_from_outcome(pattern_id, success);
    }
}

impl Default for ClearancePipeline {
    fn default() -> Self {
        Self::new(ChallengeDetector::new())
    }
}
