//! Challenge detection module.
//!
//! Recognises gateway challenge pages by status code, gateway headers, and
//! body signatures, and keeps per-pattern outcome statistics that nudge
//! confidence for patterns that have been cleared before.

use http::header::SERVER;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, VecDeque};
use std::time::SystemTime;

use crate::challenges::core::ChallengeResponse;

/// Header set by the gateway when it served a challenge instead of the origin.
const MITIGATED_HEADER: &str = "cf-mitigated";

/// High level challenge categories supported by the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChallengeType {
    /// "Just a moment..." interstitial that clears itself after a delay.
    Interstitial,
    /// Managed challenge requiring a browser.
    Managed,
    Turnstile,
    RateLimit,
    AccessDenied,
    BotManagement,
    Unknown,
}

/// Recommended response strategy for a detected challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseStrategy {
    /// Hand the page to an external solver; fall back to waiting.
    SolveOrWait,
    /// Only an external solver can clear it.
    ExternalSolver,
    DelayRetry,
    Abort,
}

#[derive(Debug, Clone)]
struct ChallengePattern {
    id: &'static str,
    name: &'static str,
    challenge_type: ChallengeType,
    response_strategy: ResponseStrategy,
    base_confidence: f32,
    patterns: Vec<Regex>,
}

impl ChallengePattern {
    fn new(
        id: &'static str,
        name: &'static str,
        challenge_type: ChallengeType,
        response_strategy: ResponseStrategy,
        base_confidence: f32,
        raw_patterns: &[&str],
    ) -> Self {
        Self {
            id,
            name,
            challenge_type,
            response_strategy,
            base_confidence,
            patterns: raw_patterns.iter().map(|pattern| build_regex(pattern)).collect(),
        }
    }
}

static KNOWN_PATTERNS: Lazy<Vec<ChallengePattern>> = Lazy::new(|| {
    vec![
        ChallengePattern::new(
            "cf_interstitial",
            "Gateway interstitial",
            ChallengeType::Interstitial,
            ResponseStrategy::SolveOrWait,
            0.95,
            &[
                r#"<title>\s*Just a moment\.\.\.\s*</title>"#,
                r"window\._cf_chl_opt\s*=",
                r#"<form[^>]*id="challenge-form"[^>]*action="/[^"]*__cf_chl_(?:f|rt)_tk="#,
            ],
        ),
        ChallengePattern::new(
            "cf_managed",
            "Gateway managed challenge",
            ChallengeType::Managed,
            ResponseStrategy::ExternalSolver,
            0.92,
            &[
                r#"/cdn-cgi/challenge-platform/.*?orchestrate/(?:captcha|managed)/v1"#,
                r"window\._cf_chl_ctx\s*=",
                r#"<div[^>]*class="cf-browser-verification"#,
            ],
        ),
        ChallengePattern::new(
            "cf_turnstile",
            "Turnstile",
            ChallengeType::Turnstile,
            ResponseStrategy::ExternalSolver,
            0.98,
            &[
                r#"class="cf-turnstile""#,
                r#"src="https://challenges\.cloudflare\.com/turnstile/v0/api\.js"#,
                r"cf-turnstile-response",
            ],
        ),
        ChallengePattern::new(
            "cf_rate_limit",
            "Rate limit (1015)",
            ChallengeType::RateLimit,
            ResponseStrategy::DelayRetry,
            0.99,
            &[
                r#"<span[^>]*class=['"]cf-error-code['"]>1015<"#,
                r"You are being rate limited",
            ],
        ),
        ChallengePattern::new(
            "cf_access_denied",
            "Access denied (1020)",
            ChallengeType::AccessDenied,
            ResponseStrategy::Abort,
            0.99,
            &[
                r#"<span[^>]*class=['"]cf-error-code['"]>1020<"#,
                r"The owner of this website has banned your access",
            ],
        ),
        ChallengePattern::new(
            "cf_bot_management",
            "Bot management (1010)",
            ChallengeType::BotManagement,
            ResponseStrategy::ExternalSolver,
            0.95,
            &[
                r#"<span[^>]*class=['"]cf-error-code['"]>1010<"#,
                r"has banned you temporarily",
            ],
        ),
    ]
});

/// Detection output returned to the pipeline.
#[derive(Debug, Clone)]
pub struct ChallengeDetection {
    pub pattern_id: String,
    pub pattern_name: String,
    pub challenge_type: ChallengeType,
    pub response_strategy: ResponseStrategy,
    pub confidence: f32,
    pub status_code: u16,
    pub url: String,
    pub matched_indicators: Vec<String>,
}

#[derive(Debug, Clone, Default)]
struct PatternStats {
    attempts: u32,
    successes: u32,
}

impl PatternStats {
    fn record(&mut self, success: bool) {
        self.attempts = self.attempts.saturating_add(1);
        if success {
            self.successes = self.successes.saturating_add(1);
        }
    }

    fn success_rate(&self) -> f32 {
        if self.attempts == 0 {
            0.0
        } else {
            self.successes as f32 / self.attempts as f32
        }
    }
}

/// Public view of a recorded challenge detection.
#[derive(Debug, Clone)]
pub struct DetectionLogEntry {
    pub timestamp: SystemTime,
    pub pattern_id: String,
    pub confidence: f32,
    pub url: String,
}

/// Pattern-based challenge detector.
#[derive(Debug)]
pub struct ChallengeDetector {
    stats: HashMap<&'static str, PatternStats>,
    history: VecDeque<DetectionLogEntry>,
    max_history: usize,
}

impl Default for ChallengeDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl ChallengeDetector {
    pub fn new() -> Self {
        Self {
            stats: HashMap::new(),
            history: VecDeque::with_capacity(32),
            max_history: 256,
        }
    }

    /// Detect a challenge in the provided HTTP response.
    pub fn detect(&mut self, response: &ChallengeResponse<'_>) -> Option<ChallengeDetection> {
        if !is_challenge_status(response) || !is_gateway_response(response) {
            return None;
        }

        let mut best: Option<ChallengeDetection> = None;
        for pattern in KNOWN_PATTERNS.iter() {
            if let Some((confidence, matched)) = self.evaluate_pattern(pattern, response)
                && best.as_ref().is_none_or(|current| confidence > current.confidence)
            {
                best = Some(ChallengeDetection {
                    pattern_id: pattern.id.to_string(),
                    pattern_name: pattern.name.to_string(),
                    challenge_type: pattern.challenge_type,
                    response_strategy: pattern.response_strategy,
                    confidence,
                    status_code: response.status,
                    url: response.url.as_str().to_string(),
                    matched_indicators: matched,
                });
            }
        }

        // The gateway flagged the response but no body signature matched.
        if best.is_none() && has_mitigated_marker(response) {
            best = Some(ChallengeDetection {
                pattern_id: "cf_mitigated".into(),
                pattern_name: "Gateway challenge (header only)".into(),
                challenge_type: ChallengeType::Unknown,
                response_strategy: ResponseStrategy::ExternalSolver,
                confidence: 0.5,
                status_code: response.status,
                url: response.url.as_str().to_string(),
                matched_indicators: vec![MITIGATED_HEADER.into()],
            });
        }

        if let Some(ref detection) = best {
            self.record_detection(detection);
        }
        best
    }

    fn evaluate_pattern(
        &self,
        pattern: &ChallengePattern,
        response: &ChallengeResponse<'_>,
    ) -> Option<(f32, Vec<String>)> {
        let matches: Vec<_> = pattern
            .patterns
            .iter()
            .filter(|regex| regex.is_match(response.body))
            .map(|regex| regex.as_str().to_string())
            .collect();

        if matches.is_empty() {
            return None;
        }

        // A single matching signature is enough; extra matches add certainty.
        let total = pattern.patterns.len() as f32;
        let coverage = 0.5 + 0.5 * (matches.len() as f32 / total);
        let mut confidence = coverage * pattern.base_confidence;
        if let Some(stats) = self.stats.get(pattern.id) {
            confidence += stats.success_rate() * 0.1;
        }

        Some((confidence.min(1.0), matches))
    }

    fn record_detection(&mut self, detection: &ChallengeDetection) {
        if self.history.len() == self.max_history {
            self.history.pop_front();
        }
        self.history.push_back(DetectionLogEntry {
            timestamp: SystemTime::now(),
            pattern_id: detection.pattern_id.clone(),
            confidence: detection.confidence,
            url: detection.url.clone(),
        });
    }

    /// Iterate over historical detections (oldest -> newest).
    pub fn detection_history(&self) -> impl Iterator<Item = &DetectionLogEntry> + '_ {
        self.history.iter()
    }

    /// Record whether a detected pattern was eventually cleared.
    pub fn learn_from_outcome(&mut self, pattern_id: &str, success: bool) {
        if let Some(pattern) = KNOWN_PATTERNS.iter().find(|p| p.id == pattern_id) {
            self.stats.entry(pattern.id).or_default().record(success);
        }
    }
}

fn is_challenge_status(response: &ChallengeResponse<'_>) -> bool {
    matches!(response.status, 403 | 429 | 503)
}

/// Whether the response was served by the challenge gateway rather than the
/// origin.
pub fn is_gateway_response(response: &ChallengeResponse<'_>) -> bool {
    let served_by_gateway = response
        .headers
        .get(SERVER)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_ascii_lowercase().starts_with("cloudflare"))
        .unwrap_or(false);
    served_by_gateway || has_mitigated_marker(response)
}

fn has_mitigated_marker(response: &ChallengeResponse<'_>) -> bool {
    response
        .headers
        .get(MITIGATED_HEADER)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("challenge"))
}

fn build_regex(pattern: &str) -> Regex {
    regex::RegexBuilder::new(pattern)
        .case_insensitive(true)
        .multi_line(true)
        .dot_matches_new_line(true)
        .build()
        .unwrap_or_else(|err| panic!("invalid challenge detection regex `{}`: {}", pattern, err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::{HeaderMap, Method};
    use url::Url;

    struct ResponseFixture {
        url: Url,
        headers: HeaderMap,
        method: Method,
        body: String,
        status: u16,
    }

    impl ResponseFixture {
        fn new(body: &str, status: u16) -> Self {
            let mut headers = HeaderMap::new();
            headers.insert(SERVER, "cloudflare".parse().unwrap());
            Self {
                url: Url::parse("https://example.com/").unwrap(),
                headers,
                method: Method::GET,
                body: body.to_string(),
                status,
            }
        }

        fn response(&self) -> ChallengeResponse<'_> {
            ChallengeResponse {
                url: &self.url,
                status: self.status,
                headers: &self.headers,
                body: &self.body,
                request_method: &self.method,
            }
        }
    }

    #[test]
    fn detects_turnstile() {
        let html = r#"
            <html><head><title>Test</title></head>
            <body>
                <div class="cf-turnstile" data-sitekey="0x4AAAAAAA"></div>
                <script src="https://challenges.cloudflare.com/turnstile/v0/api.js"></script>
            </body>
            </html>
        "#;

        let mut detector = ChallengeDetector::new();
        let fixture = ResponseFixture::new(html, 403);
        let detection = detector.detect(&fixture.response()).expect("should detect");

        assert_eq!(detection.challenge_type, ChallengeType::Turnstile);
        assert_eq!(detection.response_strategy, ResponseStrategy::ExternalSolver);
        assert_eq!(detector.detection_history().count(), 1);
    }

    #[test]
    fn detects_interstitial() {
        let html = "<html><head><title>Just a moment...</title></head></html>";
        let mut detector = ChallengeDetector::new();
        let fixture = ResponseFixture::new(html, 503);
        let detection = detector.detect(&fixture.response()).expect("should detect");
        assert_eq!(detection.challenge_type, ChallengeType::Interstitial);
    }

    #[test]
    fn ignores_origin_responses() {
        let html = "<html><head><title>Just a moment...</title></head></html>";
        let mut detector = ChallengeDetector::new();

        let ok = ResponseFixture::new(html, 200);
        assert!(detector.detect(&ok.response()).is_none());

        let mut not_gateway = ResponseFixture::new(html, 503);
        not_gateway.headers.insert(SERVER, "nginx".parse().unwrap());
        assert!(detector.detect(&not_gateway.response()).is_none());
    }

    #[test]
    fn mitigated_header_without_signature() {
        let mut fixture = ResponseFixture::new("<html></html>", 403);
        fixture.headers.remove(SERVER);
        fixture
            .headers
            .insert(MITIGATED_HEADER, "challenge".parse().unwrap());

        let mut detector = ChallengeDetector::new();
        let detection = detector.detect(&fixture.response()).expect("should detect");
        assert_eq!(detection.challenge_type, ChallengeType::Unknown);
    }
}
