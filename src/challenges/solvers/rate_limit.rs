//! Handler for gateway rate limiting responses (error 1015).
//!
//! Picks the back-off window from `Retry-After`, then from a duration quoted
//! in the page body, then from a random default range.

use std::time::Duration;

use chrono::{DateTime, Utc};
use http::header::RETRY_AFTER;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::{Regex, RegexBuilder};

use crate::challenges::core::ChallengeResponse;

use super::MitigationPlan;

const DEFAULT_DELAY_MIN_SECS: u64 = 60;
const DEFAULT_DELAY_MAX_SECS: u64 = 180;

/// Advises back-off windows for rate limited preflights.
#[derive(Debug, Clone)]
pub struct RateLimitHandler {
    delay_min: Duration,
    delay_max: Duration,
}

impl RateLimitHandler {
    pub fn new() -> Self {
        Self {
            delay_min: Duration::from_secs(DEFAULT_DELAY_MIN_SECS),
            delay_max: Duration::from_secs(DEFAULT_DELAY_MAX_SECS),
        }
    }

    pub fn with_delay_range(mut self, min: Duration, max: Duration) -> Self {
        self.delay_min = min;
        self.delay_max = max.max(min);
        self
    }

    pub fn plan(&self, response: &ChallengeResponse<'_>) -> MitigationPlan {
        let (delay, source) = self.determine_delay(response);
        let mut plan = MitigationPlan::retry_after(delay, "rate_limit");
        plan.metadata.insert("delay_source".into(), source.into());
        plan
    }

    fn determine_delay(&self, response: &ChallengeResponse<'_>) -> (Duration, &'static str) {
        if let Some(delay) = retry_after_header(response) {
            return (delay, "header");
        }
        if let Some(delay) = delay_from_body(response.body) {
            return (delay, "body");
        }
        (self.random_delay(), "default")
    }

    fn random_delay(&self) -> Duration {
        if self.delay_max <= self.delay_min {
            return self.delay_min;
        }
        let mut rng = rand::thread_rng();
        let millis = rng.gen_range(self.delay_min.as_millis()..self.delay_max.as_millis());
        Duration::from_millis(millis as u64)
    }
}

impl Default for RateLimitHandler {
    fn default() -> Self {
        Self::new()
    }
}

fn retry_after_header(response: &ChallengeResponse<'_>) -> Option<Duration> {
    let raw = response.headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = raw.parse::<f64>()
        && seconds.is_finite()
        && seconds >= 0.0
    {
        return Some(Duration::from_secs_f64(seconds));
    }

    let date = DateTime::parse_from_rfc2822(raw)
        .or_else(|_| DateTime::parse_from_rfc3339(raw))
        .ok()?;
    (date.with_timezone(&Utc) - Utc::now()).to_std().ok()
}

fn delay_from_body(body: &str) -> Option<Duration> {
    let caps = RATE_LIMIT_DELAY_RE.captures(body)?;
    let amount: u64 = caps.get(1)?.as_str().parse().ok()?;
    let multiplier = match caps.get(2)?.as_str().to_ascii_lowercase().as_str() {
        "minute" | "minutes" => 60,
        "hour" | "hours" => 3600,
        _ => 1,
    };
    Some(Duration::from_secs(amount.saturating_mul(multiplier)))
}

static RATE_LIMIT_DELAY_RE: Lazy<Regex> = Lazy::new(|| {
    RegexBuilder::new(r#"(\d+)\s*(second|seconds|minute|minutes|hour|hours)"#)
        .case_insensitive(true)
        .build()
        .expect("invalid delay regex")
});

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, HeaderValue, Method};
    use url::Url;

    fn plan_for(body: &str, retry_after: Option<&'static str>) -> MitigationPlan {
        let url = Url::parse("https://example.com/").unwrap();
        let mut headers = HeaderMap::new();
        if let Some(value) = retry_after {
            headers.insert(RETRY_AFTER, HeaderValue::from_static(value));
        }
        let method = Method::GET;
        let response = ChallengeResponse {
            url: &url,
            status: 429,
            headers: &headers,
            body,
            request_method: &method,
        };
        RateLimitHandler::new().plan(&response)
    }

    #[test]
    fn plan_uses_retry_after_header() {
        let plan = plan_for("You are being rate limited", Some("120"));
        assert!(plan.should_retry);
        assert_eq!(plan.wait, Some(Duration::from_secs(120)));
        assert_eq!(plan.metadata.get("delay_source").map(String::as_str), Some("header"));
    }

    #[test]
    fn plan_extracts_delay_from_body() {
        let plan = plan_for("Please wait 10 minutes before retrying", None);
        assert_eq!(plan.wait, Some(Duration::from_secs(600)));
        assert_eq!(plan.metadata.get("delay_source").map(String::as_str), Some("body"));
    }

    #[test]
    fn plan_falls_back_to_default_range() {
        let plan = plan_for("You are being rate limited", None);
        let wait = plan.wait.unwrap();
        assert!(wait >= Duration::from_secs(DEFAULT_DELAY_MIN_SECS));
        assert!(wait < Duration::from_secs(DEFAULT_DELAY_MAX_SECS));
    }
}
