//! File-based configuration.
//!
//! [`FileConfig`] mirrors [`ClearanceLinkConfig`](crate::ClearanceLinkConfig)
//! in a serde-friendly shape (durations in milliseconds, the client identity
//! as a path) and converts into a [`ClearanceLinkBuilder`].

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clearance_link::ClearanceLinkBuilder;
use crate::modules::events::OverflowPolicy;
use crate::session::bypass::GatewayCookies;
use crate::session::decorator::ClientIdentity;
use crate::transport::supervisor::ReconnectPolicy;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("invalid json in {}: {source}", path.display())]
    InvalidJson {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// PKCS#12 bundle on disk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityFile {
    pub path: PathBuf,
    pub password: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectFile {
    pub delay_ms: Option<u64>,
    pub max_attempts: Option<u32>,
    pub jitter: Option<f64>,
}

impl ReconnectFile {
    fn to_policy(&self) -> ReconnectPolicy {
        let mut policy = ReconnectPolicy::default();
        if let Some(delay) = self.delay_ms {
            policy.delay = Duration::from_millis(delay);
        }
        if let Some(max_attempts) = self.max_attempts {
            policy = policy.with_max_attempts(max_attempts);
        }
        if let Some(jitter) = self.jitter {
            policy = policy.with_jitter(jitter);
        }
        policy
    }
}

/// Serde mirror of the link configuration. Absent fields keep the builder
/// defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub origin: Option<String>,
    pub feed_url: Option<String>,
    pub reconnect_url: Option<String>,
    pub user_agent: Option<String>,
    pub cookies: GatewayCookies,
    pub access_token: Option<String>,
    /// Domain the access-token cookie is scoped to.
    pub application_domain: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub proxy: Option<String>,
    pub identity: Option<IdentityFile>,
    pub reconnect: ReconnectFile,
    pub handshake_timeout_ms: Option<u64>,
    pub request_timeout_ms: Option<u64>,
    pub max_challenge_attempts: Option<u32>,
    pub challenge_wait_ms: Option<u64>,
    pub queue_capacity: Option<usize>,
    pub overflow_policy: Option<OverflowPolicy>,
    pub max_message_size: Option<usize>,
    pub enable_metrics: Option<bool>,
}

impl FileConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&contents).map_err(|source| ConfigError::InvalidJson {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Validate and convert into a builder. Reads the identity file, if any.
    pub fn into_builder(self) -> Result<ClearanceLinkBuilder, ConfigError> {
        let mut builder = ClearanceLinkBuilder::new()
            .with_cookie_names(self.cookies.clone())
            .with_reconnect_policy(self.reconnect.to_policy());

        if let Some(origin) = self.origin {
            builder = builder.with_origin(origin);
        }
        if let Some(feed_url) = self.feed_url {
            builder = builder.with_feed_url(feed_url);
        }
        if let Some(reconnect_url) = self.reconnect_url {
            builder = builder.with_reconnect_url(reconnect_url);
        }
        if let Some(user_agent) = self.user_agent {
            if user_agent.trim().is_empty() {
                return Err(ConfigError::Invalid("user_agent must not be empty".into()));
            }
            builder = builder.with_user_agent(user_agent);
        }

        match (self.access_token, self.application_domain) {
            (Some(token), Some(domain)) => builder = builder.with_access_token(token, domain),
            (Some(_), None) => {
                return Err(ConfigError::Invalid(
                    "access_token requires application_domain".into(),
                ));
            }
            (None, _) => {}
        }

        for (name, value) in self.headers {
            builder = builder.with_header(name, value);
        }
        if let Some(proxy) = self.proxy {
            builder = builder.with_proxy(proxy);
        }
        if let Some(identity) = self.identity {
            let loaded = ClientIdentity::from_file(&identity.path, identity.password).map_err(
                |source| ConfigError::Io {
                    path: identity.path.clone(),
                    source,
                },
            )?;
            builder = builder.with_identity(loaded);
        }

        if let Some(ms) = self.handshake_timeout_ms {
            builder = builder.with_handshake_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = self.request_timeout_ms {
            builder = builder.with_request_timeout(Duration::from_millis(ms));
        }
        if let Some(attempts) = self.max_challenge_attempts {
            builder = builder.with_max_challenge_attempts(attempts);
        }
        if let Some(ms) = self.challenge_wait_ms {
            builder = builder.with_challenge_wait(Duration::from_millis(ms));
        }
        if let Some(capacity) = self.queue_capacity {
            if capacity == 0 {
                return Err(ConfigError::Invalid("queue_capacity must be positive".into()));
            }
            builder = builder.with_queue_capacity(capacity);
        }
        if let Some(policy) = self.overflow_policy {
            builder = builder.with_overflow_policy(policy);
        }
        if let Some(bytes) = self.max_message_size {
            builder = builder.with_max_message_size(bytes);
        }
        if self.enable_metrics == Some(false) {
            builder = builder.disable_metrics();
        }

        Ok(builder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "origin": "https://www.example.com/",
        "feed_url": "wss://socket.example.com/signalr/connect",
        "reconnect_url": "wss://socket.example.com/signalr/reconnect",
        "cookies": { "session": "sid" },
        "access_token": "tok",
        "application_domain": ".example.com",
        "headers": { "X-Client": "feed" },
        "reconnect": { "delay_ms": 500, "max_attempts": 4 },
        "handshake_timeout_ms": 2500,
        "overflow_policy": "drop_newest",
        "enable_metrics": false
    }"#;

    #[test]
    fn sample_converts_into_builder() {
        let builder = FileConfig::from_json_str(SAMPLE).unwrap().into_builder().unwrap();
        let config = builder.config();

        assert_eq!(config.origin.as_deref(), Some("https://www.example.com/"));
        assert_eq!(config.cookies.session, "sid");
        assert_eq!(config.cookies.clearance, "cf_clearance");
        assert_eq!(config.access_token.as_ref().unwrap().domain, ".example.com");
        assert_eq!(config.headers, vec![("X-Client".to_string(), "feed".to_string())]);
        assert_eq!(config.reconnect.delay, Duration::from_millis(500));
        assert_eq!(config.reconnect.max_attempts, Some(4));
        assert_eq!(config.handshake_timeout, Duration::from_millis(2500));
        assert_eq!(config.overflow_policy, OverflowPolicy::DropNewest);
        assert!(!config.enable_metrics);
    }

    #[test]
    fn empty_document_keeps_defaults() {
        let builder = FileConfig::from_json_str("{}").unwrap().into_builder().unwrap();
        let config = builder.config();
        assert_eq!(config.reconnect, ReconnectPolicy::default());
        assert_eq!(config.handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.max_challenge_attempts, 3);
        assert!(config.enable_metrics);
    }

    #[test]
    fn access_token_needs_a_domain() {
        let err = FileConfig::from_json_str(r#"{"access_token": "tok"}"#)
            .unwrap()
            .into_builder()
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn missing_file_reports_path() {
        let err = FileConfig::from_path("/nonexistent/clearance-link.json").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/clearance-link.json"));
    }

    #[test]
    fn malformed_json_is_rejected() {
        assert!(matches!(
            FileConfig::from_json_str("{ not json").unwrap_err(),
            ConfigError::Json(_)
        ));
    }
}
