//! Outstanding latency probes.
//!
//! The sender records a probe when the user types `/ping`; the receiver
//! resolves it when a matching reply arrives. Both run as separate tasks, so
//! the table lives behind an async mutex.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use tokio::sync::Mutex;
use tracing::debug;

/// Fresh opaque probe id: 8 random bytes, hex encoded.
pub fn new_probe_id() -> String {
    rand::random::<[u8; 8]>()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

pub struct ProbeTracker {
    outstanding: Mutex<HashMap<String, Instant>>,
    ttl: Option<Duration>,
}

impl ProbeTracker {
    /// `ttl` of `None` keeps unanswered probes forever.
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            outstanding: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    pub async fn record(&self, id: impl Into<String>, sent_at: Instant) {
        let mut outstanding = self.outstanding.lock().await;
        if let Some(ttl) = self.ttl {
            let before = outstanding.len();
            outstanding.retain(|_, recorded| sent_at.saturating_duration_since(*recorded) <= ttl);
            let expired = before - outstanding.len();
            if expired > 0 {
                debug!(expired, "dropped unanswered probes");
            }
        }
        outstanding.insert(id.into(), sent_at);
    }

    /// Removes the probe `id` and returns how long ago it was sent.
    ///
    /// Unknown ids, and probes older than the TTL, resolve to `None`.
    pub async fn resolve(&self, id: &str, now: Instant) -> Option<Duration> {
        let sent_at = self.outstanding.lock().await.remove(id)?;
        let elapsed = now.saturating_duration_since(sent_at);
        match self.ttl {
            Some(ttl) if elapsed > ttl => None,
            _ => Some(elapsed),
        }
    }

    pub async fn outstanding(&self) -> usize {
        self.outstanding.lock().await.len()
    }
}
