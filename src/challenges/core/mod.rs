//! Core utilities shared by the challenge detector, pipeline, and preflight.

pub mod executor;
pub mod reqwest_client;
pub mod types;

pub use executor::{
    ChallengeExecutionError, ChallengeHttpClient, ChallengeHttpClientError, ChallengeHttpResponse,
    DEFAULT_MAX_REDIRECTS, OriginalRequest, execute_challenge_submission,
    fetch_following_redirects,
};
pub use reqwest_client::ReqwestChallengeHttpClient;
pub use types::{ChallengeResponse, ChallengeSubmission, SolvedChallenge};
