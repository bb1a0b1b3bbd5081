//! Per-attempt request decoration.
//!
//! Before every handshake the [`RequestDecorator`] stamps the upgrade request
//! with the current session material. Steps run in a fixed order and later
//! steps overwrite earlier ones:
//!
//! 1. client identity
//! 2. cookies scoped to the request host
//! 3. proxy
//! 4. `User-Agent`, then custom headers

use std::fmt;
use std::path::Path;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use http::header::{COOKIE, HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use thiserror::Error;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use url::Url;

use super::credentials::CredentialSet;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecorateError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl DecorateError {
    fn invalid(detail: impl Into<String>) -> Self {
        DecorateError::InvalidArgument(detail.into())
    }
}

/// PKCS#12 client certificate bundle presented during the TLS handshake.
#[derive(Clone)]
pub struct ClientIdentity {
    pkcs12: Vec<u8>,
    password: String,
}

impl ClientIdentity {
    pub fn from_pkcs12(der: Vec<u8>, password: impl Into<String>) -> Self {
        Self {
            pkcs12: der,
            password: password.into(),
        }
    }

    pub fn from_file(path: impl AsRef<Path>, password: impl Into<String>) -> std::io::Result<Self> {
        Ok(Self::from_pkcs12(std::fs::read(path)?, password))
    }

    pub fn to_native(&self) -> Result<native_tls::Identity, native_tls::Error> {
        native_tls::Identity::from_pkcs12(&self.pkcs12, &self.password)
    }
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("pkcs12_len", &self.pkcs12.len())
            .finish_non_exhaustive()
    }
}

/// HTTP proxy reached with a `CONNECT` tunnel.
#[derive(Clone, PartialEq, Eq)]
pub struct ProxySettings {
    url: Url,
    username: Option<String>,
    password: Option<String>,
}

impl ProxySettings {
    pub fn new(url: Url) -> Result<Self, DecorateError> {
        if url.scheme() != "http" {
            return Err(DecorateError::invalid(format!(
                "unsupported proxy scheme '{}'",
                url.scheme()
            )));
        }
        if url.host_str().is_none() {
            return Err(DecorateError::invalid("proxy url has no host"));
        }

        let username = match url.username() {
            "" => None,
            raw => Some(userinfo(raw, "username")?),
        };
        let password = url.password().map(|raw| userinfo(raw, "password")).transpose()?;
        Ok(Self {
            url,
            username,
            password,
        })
    }

    pub fn parse(raw: &str) -> Result<Self, DecorateError> {
        let url = Url::parse(raw).map_err(|err| DecorateError::invalid(format!("proxy url: {err}")))?;
        Self::new(url)
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    pub fn port(&self) -> u16 {
        self.url.port_or_known_default().unwrap_or(80)
    }

    /// `Proxy-Authorization` value, when credentials are configured.
    pub fn authorization(&self) -> Option<String> {
        let username = self.username.as_deref()?;
        let password = self.password.as_deref().unwrap_or_default();
        Some(format!("Basic {}", BASE64.encode(format!("{username}:{password}"))))
    }
}

/// URL userinfo arrives percent-encoded; basic auth needs the raw text.
fn userinfo(raw: &str, field: &str) -> Result<String, DecorateError> {
    urlencoding::decode(raw)
        .map(|decoded| decoded.into_owned())
        .map_err(|err| DecorateError::invalid(format!("proxy {field}: {err}")))
}

impl fmt::Debug for ProxySettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxySettings")
            .field("host", &self.host())
            .field("port", &self.port())
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

/// Connection-level settings that apply to every attempt.
#[derive(Debug, Clone, Default)]
pub struct ConnectionContext {
    pub identity: Option<ClientIdentity>,
    pub proxy: Option<ProxySettings>,
    /// Replaces the user-agent recorded in the credential set.
    pub user_agent: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl ConnectionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_identity(mut self, identity: ClientIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_proxy(mut self, proxy: ProxySettings) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// A raw connection request that can be decorated before it is sent.
pub trait DecoratableRequest {
    fn target(&self) -> &Url;

    /// Replace every value of `name` with `value`.
    fn set_header(&mut self, name: HeaderName, value: HeaderValue);

    fn set_client_identity(&mut self, identity: ClientIdentity);

    fn set_proxy(&mut self, proxy: ProxySettings);
}

/// WebSocket upgrade request plus the transport material it travels with.
#[derive(Debug)]
pub struct UpgradeRequest {
    url: Url,
    request: http::Request<()>,
    identity: Option<ClientIdentity>,
    proxy: Option<ProxySettings>,
}

impl UpgradeRequest {
    pub fn new(url: Url) -> Result<Self, DecorateError> {
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(DecorateError::invalid(format!(
                "unsupported feed scheme '{}'",
                url.scheme()
            )));
        }
        let request = url
            .as_str()
            .into_client_request()
            .map_err(|err| DecorateError::invalid(format!("upgrade request: {err}")))?;
        Ok(Self {
            url,
            request,
            identity: None,
            proxy: None,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        self.request.headers()
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        self.request.headers_mut()
    }

    pub fn identity(&self) -> Option<&ClientIdentity> {
        self.identity.as_ref()
    }

    pub fn proxy(&self) -> Option<&ProxySettings> {
        self.proxy.as_ref()
    }

    pub fn into_parts(self) -> (http::Request<()>, Option<ClientIdentity>, Option<ProxySettings>) {
        (self.request, self.identity, self.proxy)
    }
}

impl DecoratableRequest for UpgradeRequest {
    fn target(&self) -> &Url {
        &self.url
    }

    fn set_header(&mut self, name: HeaderName, value: HeaderValue) {
        self.request.headers_mut().insert(name, value);
    }

    fn set_client_identity(&mut self, identity: ClientIdentity) {
        self.identity = Some(identity);
    }

    fn set_proxy(&mut self, proxy: ProxySettings) {
        self.proxy = Some(proxy);
    }
}

/// Applies credentials and connection settings to a request.
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestDecorator;

impl RequestDecorator {
    pub fn new() -> Self {
        Self
    }

    pub fn decorate<R>(
        &self,
        request: &mut R,
        credentials: &CredentialSet,
        context: &ConnectionContext,
    ) -> Result<(), DecorateError>
    where
        R: DecoratableRequest + ?Sized,
    {
        if let Some(ref identity) = context.identity {
            request.set_client_identity(identity.clone());
        }

        if let Some(cookies) = credentials.cookie_header_for(request.target()) {
            request.set_header(COOKIE, header_value("cookie", &cookies)?);
        }

        if let Some(ref proxy) = context.proxy {
            request.set_proxy(proxy.clone());
        }

        let user_agent = context.user_agent.as_deref().or(credentials.user_agent());
        if let Some(user_agent) = user_agent {
            request.set_header(USER_AGENT, header_value("user-agent", user_agent)?);
        }

        for (name, value) in &context.headers {
            let header_name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| DecorateError::invalid(format!("header name '{name}'")))?;
            request.set_header(header_name, header_value(name, value)?);
        }

        Ok(())
    }
}

fn header_value(name: &str, value: &str) -> Result<HeaderValue, DecorateError> {
    HeaderValue::from_str(value).map_err(|_| DecorateError::invalid(format!("value of header '{name}'")))
}
