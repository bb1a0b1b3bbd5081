//! Request execution utilities for the clearance preflight.
//!
//! The HTTP client used during the preflight never follows redirects on its
//! own: gateways set cookies on intermediate 30x hops, so the executor walks
//! the chain itself and carries every `Set-Cookie` forward to the final
//! response.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http::Method;
use http::header::{HeaderMap, HeaderName, HeaderValue, LOCATION, REFERER};
use thiserror::Error;
use tokio::time::sleep;
use url::Url;

use super::types::ChallengeSubmission;
use crate::session::credentials::Credential;

/// Upper bound on redirect hops followed for a single logical request.
pub const DEFAULT_MAX_REDIRECTS: usize = 10;

/// Contract that abstracts the underlying HTTP transport used by the preflight.
///
/// Implementations must keep cookies between calls so that a clearance issued
/// on one hop is presented on the next.
#[async_trait]
pub trait ChallengeHttpClient: Send + Sync {
    async fn send_form(
        &self,
        method: &Method,
        url: &Url,
        headers: &HeaderMap,
        form_fields: &HashMap<String, String>,
    ) -> Result<ChallengeHttpResponse, ChallengeHttpClientError>;

    async fn send_with_body(
        &self,
        method: &Method,
        url: &Url,
        headers: &HeaderMap,
        body: Option<&[u8]>,
    ) -> Result<ChallengeHttpResponse, ChallengeHttpClientError>;

    /// Add cookies obtained outside this client (external solver) to its jar.
    fn inject_cookies(&self, url: &Url, cookies: &[Credential]);
}

/// Minimal response representation returned by the transport abstraction.
#[derive(Debug, Clone)]
pub struct ChallengeHttpResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    pub url: Url,
    pub is_redirect: bool,
    /// Cookies set by this response (and, after redirect following, by every
    /// earlier hop, oldest first).
    pub cookies: Vec<Credential>,
}

impl ChallengeHttpResponse {
    pub fn location(&self) -> Option<&str> {
        self.headers
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    fn carrying(mut self, mut earlier: Vec<Credential>) -> Self {
        earlier.append(&mut self.cookies);
        self.cookies = earlier;
        self
    }
}

#[derive(Debug, Error)]
pub enum ChallengeHttpClientError {
    #[error("http transport error: {0}")]
    Transport(String),
}

/// Failure states that can occur while executing preflight requests.
#[derive(Debug, Error)]
pub enum ChallengeExecutionError {
    #[error("failed to convert header '{0}'")]
    InvalidHeader(String),
    #[error("challenge answer rejected by the gateway")]
    InvalidAnswer,
    #[error("redirect chain exceeded {0} hops")]
    TooManyRedirects(usize),
    #[error("redirect target is not a valid url: {0}")]
    InvalidRedirect(String),
    #[error("http client error: {0}")]
    Client(#[from] ChallengeHttpClientError),
}

/// The request a preflight step is about to (re)issue.
#[derive(Debug, Clone)]
pub struct OriginalRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Vec<u8>>,
}

impl OriginalRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_body(mut self, body: Option<Vec<u8>>) -> Self {
        self.body = body;
        self
    }
}

/// Send `request` and follow any redirects manually.
pub async fn fetch_following_redirects(
    client: &dyn ChallengeHttpClient,
    request: &OriginalRequest,
    max_redirects: usize,
) -> Result<ChallengeHttpResponse, ChallengeExecutionError> {
    let first = client
        .send_with_body(
            &request.method,
            &request.url,
            &request.headers,
            request.body.as_deref(),
        )
        .await?;
    follow_redirects(client, first, request, max_redirects).await
}

async fn follow_redirects(
    client: &dyn ChallengeHttpClient,
    mut response: ChallengeHttpResponse,
    request: &OriginalRequest,
    max_redirects: usize,
) -> Result<ChallengeHttpResponse, ChallengeExecutionError> {
    let mut method = request.method.clone();
    let mut body = request.body.clone();
    let mut hops = 0usize;

    while response.is_redirect {
        if hops == max_redirects {
            return Err(ChallengeExecutionError::TooManyRedirects(max_redirects));
        }
        hops += 1;

        let target = resolve_redirect(&response)?;
        if matches!(response.status, 301..=303) {
            method = Method::GET;
            body = None;
        }

        let mut headers = request.headers.clone();
        headers.insert(
            REFERER,
            HeaderValue::from_str(response.url.as_str())
                .map_err(|_| ChallengeExecutionError::InvalidHeader("referer".into()))?,
        );

        log::debug!("following {} redirect to {}", response.status, target);
        let next = client
            .send_with_body(&method, &target, &headers, body.as_deref())
            .await?;
        response = next.carrying(response.cookies);
    }

    Ok(response)
}

/// Replay a solver-provided form submission.
///
/// 1. Wait the delay the solver asked for.
/// 2. Send the form.
/// 3. Follow redirects manually, replaying the original request's method.
/// 4. Return the final response with every cookie seen along the way.
pub async fn execute_challenge_submission(
    client: Arc<dyn ChallengeHttpClient>,
    submission: ChallengeSubmission,
    original_request: OriginalRequest,
) -> Result<ChallengeHttpResponse, ChallengeExecutionError> {
    if submission.wait > Duration::ZERO {
        sleep(submission.wait).await;
    }

    let submission_headers = convert_headers(&submission.headers)?;
    let first_response = client
        .send_form(
            &submission.method,
            &submission.url,
            &submission_headers,
            &submission.form_fields,
        )
        .await?;

    if first_response.status == 400 {
        return Err(ChallengeExecutionError::InvalidAnswer);
    }

    follow_redirects(
        client.as_ref(),
        first_response,
        &original_request,
        DEFAULT_MAX_REDIRECTS,
    )
    .await
}

fn convert_headers(
    headers: &HashMap<String, String>,
) -> Result<HeaderMap, ChallengeExecutionError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| ChallengeExecutionError::InvalidHeader(name.clone()))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|_| ChallengeExecutionError::InvalidHeader(name.clone()))?;
        map.insert(header_name, header_value);
    }
    Ok(map)
}

fn resolve_redirect(response: &ChallengeHttpResponse) -> Result<Url, ChallengeExecutionError> {
    let location = response
        .location()
        .ok_or_else(|| ChallengeExecutionError::InvalidRedirect("missing Location header".into()))?;

    if let Ok(absolute) = Url::parse(location)
        && absolute.has_host()
    {
        return Ok(absolute);
    }

    response
        .url
        .join(location)
        .map_err(|_| ChallengeExecutionError::InvalidRedirect(location.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct StubClient {
        responses: Mutex<Vec<ChallengeHttpResponse>>,
        requested: Mutex<Vec<(Method, Url)>>,
    }

    impl StubClient {
        fn new(responses: Vec<ChallengeHttpResponse>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().rev().collect()),
                requested: Mutex::new(Vec::new()),
            }
        }

        fn pop_response(&self, method: &Method, url: &Url) -> ChallengeHttpResponse {
            self.requested
                .lock()
                .unwrap()
                .push((method.clone(), url.clone()));
            self.responses
                .lock()
                .unwrap()
                .pop()
                .expect("no more stub responses")
        }
    }

    #[async_trait]
    impl ChallengeHttpClient for StubClient {
        async fn send_form(
            &self,
            method: &Method,
            url: &Url,
            _headers: &HeaderMap,
            _form_fields: &HashMap<String, String>,
        ) -> Result<ChallengeHttpResponse, ChallengeHttpClientError> {
            Ok(self.pop_response(method, url))
        }

        async fn send_with_body(
            &self,
            method: &Method,
            url: &Url,
            _headers: &HeaderMap,
            _body: Option<&[u8]>,
        ) -> Result<ChallengeHttpResponse, ChallengeHttpClientError> {
            Ok(self.pop_response(method, url))
        }

        fn inject_cookies(&self, _url: &Url, _cookies: &[Credential]) {}
    }

    fn make_response(
        status: u16,
        url: &str,
        headers: HeaderMap,
        cookies: Vec<Credential>,
    ) -> ChallengeHttpResponse {
        ChallengeHttpResponse {
            status,
            headers,
            body: vec![],
            url: Url::parse(url).unwrap(),
            is_redirect: (300..400).contains(&status),
            cookies,
        }
    }

    fn redirect_to(location: &'static str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(LOCATION, HeaderValue::from_static(location));
        headers
    }

    #[tokio::test]
    async fn returns_first_response_when_not_redirect() {
        let submission = ChallengeSubmission::post(
            Url::parse("https://example.com/submit").unwrap(),
            HashMap::from([(String::from("cf-turnstile-response"), String::from("token"))]),
        );
        let original = OriginalRequest::new(Method::GET, Url::parse("https://example.com").unwrap());
        let client = Arc::new(StubClient::new(vec![make_response(
            200,
            "https://example.com",
            HeaderMap::new(),
            vec![],
        )]));

        let response = execute_challenge_submission(client, submission, original)
            .await
            .unwrap();

        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn rejected_answer_is_reported() {
        let submission = ChallengeSubmission::post(
            Url::parse("https://example.com/submit").unwrap(),
            HashMap::new(),
        );
        let original = OriginalRequest::new(Method::GET, Url::parse("https://example.com").unwrap());
        let client = Arc::new(StubClient::new(vec![make_response(
            400,
            "https://example.com/submit",
            HeaderMap::new(),
            vec![],
        )]));

        let err = execute_challenge_submission(client, submission, original)
            .await
            .unwrap_err();
        assert!(matches!(err, ChallengeExecutionError::InvalidAnswer));
    }

    #[tokio::test]
    async fn submission_redirect_carries_cookies_forward() {
        let submission = ChallengeSubmission::post(
            Url::parse("https://example.com/submit").unwrap(),
            HashMap::new(),
        );
        let original = OriginalRequest::new(
            Method::GET,
            Url::parse("https://example.com/protected").unwrap(),
        );

        let client = Arc::new(StubClient::new(vec![
            make_response(
                302,
                "https://example.com/submit",
                redirect_to("/redirected"),
                vec![Credential::new("cf_clearance", "c", "example.com")],
            ),
            make_response(
                200,
                "https://example.com/redirected",
                HeaderMap::new(),
                vec![Credential::new("__cfduid", "s", "example.com")],
            ),
        ]));

        let response = execute_challenge_submission(client.clone(), submission, original)
            .await
            .unwrap();

        assert_eq!(response.url.as_str(), "https://example.com/redirected");
        let names: Vec<_> = response.cookies.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["cf_clearance", "__cfduid"]);
        let requested = client.requested.lock().unwrap();
        assert_eq!(requested[1].0, Method::GET);
    }

    #[tokio::test]
    async fn redirect_loops_are_bounded() {
        let client = StubClient::new(vec![
            make_response(302, "https://example.com/a", redirect_to("/b"), vec![]),
            make_response(302, "https://example.com/b", redirect_to("/a"), vec![]),
            make_response(302, "https://example.com/a", redirect_to("/b"), vec![]),
        ]);
        let request = OriginalRequest::new(Method::GET, Url::parse("https://example.com/a").unwrap());

        let err = fetch_following_redirects(&client, &request, 2).await.unwrap_err();
        assert!(matches!(err, ChallengeExecutionError::TooManyRedirects(2)));
    }
}
