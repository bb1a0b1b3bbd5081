//! Gateway session material.
//!
//! A [`CredentialSet`] is the immutable outcome of one preflight run: the
//! session and clearance cookies plus the user-agent they were issued for.
//! [`CredentialStore`] publishes sets by atomic replacement so that every
//! connection attempt reads a snapshot produced by a single preflight.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

/// Cookie attributes preserved from the `Set-Cookie` line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialFlags {
    pub secure: bool,
    pub http_only: bool,
    /// Set when the cookie carried no `Domain` attribute and therefore only
    /// applies to the exact host that issued it.
    pub host_only: bool,
}

/// A single cookie captured from the gateway (or injected by the caller).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
    pub flags: CredentialFlags,
    pub expires: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn new(
        name: impl Into<String>,
        value: impl Into<String>,
        domain: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            domain: domain.into(),
            path: "/".into(),
            flags: CredentialFlags::default(),
            expires: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_flags(mut self, flags: CredentialFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_expires(mut self, expires: Option<DateTime<Utc>>) -> Self {
        self.expires = expires;
        self
    }

    /// RFC 6265 style domain match.
    pub fn matches_host(&self, host: &str) -> bool {
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        let domain = normalize_domain(&self.domain);
        if domain.is_empty() {
            return false;
        }
        if host == domain {
            return true;
        }
        !self.flags.host_only && host.ends_with(&format!(".{domain}"))
    }

    pub fn matches_path(&self, request_path: &str) -> bool {
        let cookie_path = if self.path.is_empty() { "/" } else { self.path.as_str() };
        if cookie_path == "/" || request_path == cookie_path {
            return true;
        }
        request_path.starts_with(cookie_path)
            && (cookie_path.ends_with('/')
                || request_path[cookie_path.len()..].starts_with('/'))
    }

    /// Whether the cookie may be sent to `url`.
    pub fn applies_to(&self, url: &Url) -> bool {
        let Some(host) = url.host_str() else {
            return false;
        };
        if self.flags.secure && !matches!(url.scheme(), "https" | "wss") {
            return false;
        }
        self.matches_host(host) && self.matches_path(url.path())
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }

    /// `name=value` fragment used in a `Cookie` header.
    pub fn header_pair(&self) -> String {
        format!("{}={}", self.name, self.value)
    }

    fn same_key(&self, other: &Credential) -> bool {
        self.name == other.name && normalize_domain(&self.domain) == normalize_domain(&other.domain)
    }
}

fn normalize_domain(domain: &str) -> String {
    domain.trim_start_matches('.').trim_end_matches('.').to_ascii_lowercase()
}

/// Complete session material from one preflight run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialSet {
    credentials: Vec<Credential>,
    user_agent: Option<String>,
}

impl CredentialSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn set_user_agent(&mut self, user_agent: impl Into<String>) {
        self.user_agent = Some(user_agent.into());
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }

    /// Insert a credential, replacing any existing one with the same
    /// `(domain, name)` pair in place.
    pub fn insert(&mut self, credential: Credential) {
        match self
            .credentials
            .iter_mut()
            .find(|existing| existing.same_key(&credential))
        {
            Some(existing) => *existing = credential,
            None => self.credentials.push(credential),
        }
    }

    pub fn with_credential(mut self, credential: Credential) -> Self {
        self.insert(credential);
        self
    }

    /// First credential with the given name, regardless of domain.
    pub fn get(&self, name: &str) -> Option<&Credential> {
        self.credentials.iter().find(|c| c.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Credential> {
        self.credentials.iter()
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// Credentials that may be sent to `url`, in insertion order.
    pub fn cookies_for<'a>(&'a self, url: &'a Url) -> impl Iterator<Item = &'a Credential> + 'a {
        self.credentials.iter().filter(move |c| c.applies_to(url))
    }

    /// Joined `Cookie` header value for `url`, or `None` if nothing applies.
    pub fn cookie_header_for(&self, url: &Url) -> Option<String> {
        let pairs: Vec<String> = self.cookies_for(url).map(Credential::header_pair).collect();
        if pairs.is_empty() {
            None
        } else {
            Some(pairs.join("; "))
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.credentials.iter().any(|c| c.is_expired_at(now))
    }
}

/// Shared, atomically replaced holder of the current [`CredentialSet`].
#[derive(Debug, Default)]
pub struct CredentialStore {
    current: RwLock<Arc<CredentialSet>>,
    generation: AtomicU64,
    stale: AtomicBool,
}

impl CredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the current set. The snapshot never changes; later
    /// refreshes publish a new `Arc`.
    pub fn snapshot(&self) -> Arc<CredentialSet> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Publish a new set wholesale and return its generation number.
    pub fn replace(&self, set: CredentialSet) -> u64 {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::new(set);
        self.stale.store(false, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn clear(&self) {
        self.replace(CredentialSet::default());
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Flag the current set as rejected by the gateway.
    pub fn mark_stale(&self) {
        self.stale.store(true, Ordering::Release);
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    /// Whether a preflight must run before the next connection attempt.
    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        if self.is_stale() {
            return true;
        }
        let snapshot = self.snapshot();
        snapshot.is_empty() || snapshot.is_expired(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn feed_url() -> Url {
        Url::parse("wss://socket.example.com/signalr/connect").unwrap()
    }

    #[test]
    fn domain_cookie_matches_subdomains() {
        let cookie = Credential::new(".AspNet.ApplicationCookie", "token", ".example.com");
        assert!(cookie.matches_host("socket.example.com"));
        assert!(cookie.matches_host("example.com"));
        assert!(!cookie.matches_host("example.org"));
        assert!(!cookie.matches_host("badexample.com"));
    }

    #[test]
    fn host_only_cookie_requires_exact_host() {
        let cookie = Credential::new("cf_clearance", "c", "example.com").with_flags(CredentialFlags {
            host_only: true,
            ..Default::default()
        });
        assert!(cookie.matches_host("example.com"));
        assert!(!cookie.matches_host("socket.example.com"));
    }

    #[test]
    fn secure_cookie_is_not_sent_over_plain_ws() {
        let cookie = Credential::new("cf_clearance", "c", "example.com").with_flags(CredentialFlags {
            secure: true,
            ..Default::default()
        });
        assert!(cookie.applies_to(&feed_url()));
        assert!(!cookie.applies_to(&Url::parse("ws://socket.example.com/").unwrap()));
    }

    #[test]
    fn path_scoping() {
        let cookie = Credential::new("a", "1", "example.com").with_path("/signalr");
        assert!(cookie.matches_path("/signalr"));
        assert!(cookie.matches_path("/signalr/connect"));
        assert!(!cookie.matches_path("/signalrx"));
        assert!(!cookie.matches_path("/"));
    }

    #[test]
    fn insert_replaces_same_domain_and_name() {
        let mut set = CredentialSet::new();
        set.insert(Credential::new("__cfduid", "old", ".example.com"));
        set.insert(Credential::new("cf_clearance", "c", ".example.com"));
        set.insert(Credential::new("__cfduid", "new", "example.com"));

        assert_eq!(set.len(), 2);
        assert_eq!(set.get("__cfduid").unwrap().value, "new");
        assert_eq!(
            set.cookie_header_for(&feed_url()).as_deref(),
            Some("__cfduid=new; cf_clearance=c")
        );
    }

    #[test]
    fn expiry_is_tracked() {
        let past = Utc::now() - chrono::Duration::minutes(1);
        let set = CredentialSet::new()
            .with_credential(Credential::new("cf_clearance", "c", "example.com").with_expires(Some(past)));
        assert!(set.is_expired(Utc::now()));

        let store = CredentialStore::new();
        assert!(store.needs_refresh(Utc::now()));
        store.replace(set);
        assert!(store.needs_refresh(Utc::now()));
    }

    #[test]
    fn stale_flag_cleared_by_replace() {
        let store = CredentialStore::new();
        store.replace(CredentialSet::new().with_credential(Credential::new("a", "1", "example.com")));
        assert!(!store.needs_refresh(Utc::now()));
        store.mark_stale();
        assert!(store.needs_refresh(Utc::now()));
        let generation = store.replace(
            CredentialSet::new().with_credential(Credential::new("a", "2", "example.com")),
        );
        assert_eq!(generation, 2);
        assert!(!store.is_stale());
    }

    #[test]
    fn readers_never_observe_mixed_sets() {
        let store = Arc::new(CredentialStore::new());
        let make = |session: &str, clearance: &str| {
            CredentialSet::new()
                .with_credential(Credential::new("__cfduid", session, "example.com"))
                .with_credential(Credential::new("cf_clearance", clearance, "example.com"))
        };
        store.replace(make("S", "C"));

        let writer = {
            let store = store.clone();
            thread::spawn(move || {
                for i in 0..500 {
                    if i % 2 == 0 {
                        store.replace(make("S2", "C2"));
                    } else {
                        store.replace(make("S", "C"));
                    }
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || {
                    for _ in 0..2000 {
                        let snapshot = store.snapshot();
                        let session = &snapshot.get("__cfduid").unwrap().value;
                        let clearance = &snapshot.get("cf_clearance").unwrap().value;
                        match session.as_str() {
                            "S" => assert_eq!(clearance, "C"),
                            "S2" => assert_eq!(clearance, "C2"),
                            other => panic!("unexpected session value {other}"),
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
