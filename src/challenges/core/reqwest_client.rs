//! Reqwest-based implementation of the `ChallengeHttpClient` trait.
//!
//! Wraps a `reqwest::Client` with redirects disabled and a shared cookie jar,
//! and turns each response's `Set-Cookie` lines into [`Credential`]s.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use http::{HeaderMap, Method};
use reqwest::cookie::Jar;
use reqwest::{Client, redirect::Policy};
use url::Url;

use super::{ChallengeHttpClient, ChallengeHttpClientError, ChallengeHttpResponse};
use crate::session::credentials::{Credential, CredentialFlags};

/// Reqwest-backed HTTP client used by the clearance preflight.
pub struct ReqwestChallengeHttpClient {
    client: Client,
    jar: Arc<Jar>,
}

impl ReqwestChallengeHttpClient {
    /// Creates a client with redirects disabled so the executor observes
    /// every intermediate response.
    pub fn new(
        user_agent: &str,
        proxy: Option<&Url>,
        timeout: Duration,
    ) -> Result<Self, ChallengeHttpClientError> {
        let jar = Arc::new(Jar::default());
        let mut builder = Client::builder()
            .redirect(Policy::none())
            .cookie_provider(jar.clone())
            .user_agent(user_agent)
            .timeout(timeout);

        if let Some(proxy) = proxy {
            let proxy = reqwest::Proxy::all(proxy.as_str())
                .map_err(|err| ChallengeHttpClientError::Transport(err.to_string()))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|err| ChallengeHttpClientError::Transport(err.to_string()))?;

        Ok(Self { client, jar })
    }
}

#[async_trait]
impl ChallengeHttpClient for ReqwestChallengeHttpClient {
    async fn send_form(
        &self,
        method: &Method,
        url: &Url,
        headers: &HeaderMap,
        form_fields: &HashMap<String, String>,
    ) -> Result<ChallengeHttpResponse, ChallengeHttpClientError> {
        let response = self
            .client
            .request(method.clone(), url.as_str())
            .headers(headers.clone())
            .form(form_fields)
            .send()
            .await
            .map_err(|err| ChallengeHttpClientError::Transport(err.to_string()))?;

        to_challenge_response(response).await
    }

    async fn send_with_body(
        &self,
        method: &Method,
        url: &Url,
        headers: &HeaderMap,
        body: Option<&[u8]>,
    ) -> Result<ChallengeHttpResponse, ChallengeHttpClientError> {
        let mut builder = self
            .client
            .request(method.clone(), url.as_str())
            .headers(headers.clone());

        if let Some(data) = body {
            builder = builder.body(data.to_vec());
        }

        let response = builder
            .send()
            .await
            .map_err(|err| ChallengeHttpClientError::Transport(err.to_string()))?;

        to_challenge_response(response).await
    }

    fn inject_cookies(&self, url: &Url, cookies: &[Credential]) {
        for cookie in cookies {
            let mut line = format!("{}; Path={}", cookie.header_pair(), cookie.path);
            if !cookie.flags.host_only && !cookie.domain.is_empty() {
                line.push_str("; Domain=");
                line.push_str(cookie.domain.trim_start_matches('.'));
            }
            self.jar.add_cookie_str(&line, url);
        }
    }
}

async fn to_challenge_response(
    response: reqwest::Response,
) -> Result<ChallengeHttpResponse, ChallengeHttpClientError> {
    let status = response.status().as_u16();
    let headers = response.headers().clone();
    let url = response.url().clone();
    let is_redirect = response.status().is_redirection();
    let issuing_host = url.host_str().unwrap_or_default().to_string();
    let cookies = response
        .cookies()
        .map(|cookie| to_credential(&cookie, &issuing_host))
        .collect();
    let body = response
        .bytes()
        .await
        .map_err(|err| ChallengeHttpClientError::Transport(err.to_string()))?
        .to_vec();

    Ok(ChallengeHttpResponse {
        status,
        headers,
        body,
        url,
        is_redirect,
        cookies,
    })
}

fn to_credential(cookie: &reqwest::cookie::Cookie<'_>, issuing_host: &str) -> Credential {
    let (domain, host_only) = match cookie.domain() {
        Some(domain) if !domain.is_empty() => (domain.to_string(), false),
        _ => (issuing_host.to_string(), true),
    };

    // Max-Age wins over Expires.
    let expires = match cookie.max_age() {
        Some(max_age) => chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_add_signed(age)),
        None => cookie.expires().map(system_time_to_utc),
    };

    Credential::new(cookie.name(), cookie.value(), domain)
        .with_path(cookie.path().unwrap_or("/"))
        .with_flags(CredentialFlags {
            secure: cookie.secure(),
            http_only: cookie.http_only(),
            host_only,
        })
        .with_expires(expires)
}

fn system_time_to_utc(time: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(time)
}
