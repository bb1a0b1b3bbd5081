//! Metrics collection utilities.
//!
//! Counters for connection attempts, opens, message traffic, and preflight
//! outcomes, shared between the supervisor, the send handle, and the
//! metrics event handler.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::transport::state::AttemptKind;

/// Point-in-time copy of the link counters.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkStats {
    pub started_at: DateTime<Utc>,
    pub connect_attempts: u64,
    pub opens: u64,
    pub reconnects: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub errors: u64,
    pub preflights: u64,
    pub preflight_failures: u64,
    pub consecutive_failures: u32,
    pub last_opened_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Default for LinkStats {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            connect_attempts: 0,
            opens: 0,
            reconnects: 0,
            messages_received: 0,
            messages_sent: 0,
            messages_dropped: 0,
            errors: 0,
            preflights: 0,
            preflight_failures: 0,
            consecutive_failures: 0,
            last_opened_at: None,
            last_error: None,
        }
    }
}

/// Thread-safe metrics collector.
#[derive(Clone, Debug, Default)]
pub struct LinkMetrics {
    inner: Arc<Mutex<LinkStats>>,
}

impl LinkMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LinkStats> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_attempt(&self) {
        self.state().connect_attempts += 1;
    }

    pub fn record_open(&self, kind: AttemptKind) {
        let mut stats = self.state();
        stats.opens += 1;
        if kind == AttemptKind::Reconnect {
            stats.reconnects += 1;
        }
        stats.consecutive_failures = 0;
        stats.last_opened_at = Some(Utc::now());
    }

    pub fn record_message_in(&self) {
        self.state().messages_received += 1;
    }

    pub fn record_message_out(&self) {
        self.state().messages_sent += 1;
    }

    pub fn record_dropped(&self) {
        self.state().messages_dropped += 1;
    }

    pub fn record_error(&self, error: &str) {
        let mut stats = self.state();
        stats.errors += 1;
        stats.consecutive_failures = stats.consecutive_failures.saturating_add(1);
        stats.last_error = Some(error.to_string());
    }

    pub fn record_preflight(&self, success: bool) {
        let mut stats = self.state();
        stats.preflights += 1;
        if !success {
            stats.preflight_failures += 1;
        }
    }

    pub fn snapshot(&self) -> LinkStats {
        self.state().clone()
    }
}
