//! Alert Deduplication
//! Suppresses identical notifications repeated inside a time window

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::debug;

use crate::observability::metrics::get_metrics;

#[derive(Debug)]
struct SentAlert {
    sent_at: Instant,
    fingerprint: String,
}

#[derive(Debug)]
pub struct AlertDeduplicator {
    window: Duration,
    sent: Mutex<HashMap<String, SentAlert>>,
}

impl Default for AlertDeduplicator {
    fn default() -> Self {
        Self::new(Duration::from_secs(5 * 60))
    }
}

impl AlertDeduplicator {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            sent: Mutex::new(HashMap::new()),
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Decide whether `content` should go out under `alert_key`.
    ///
    /// Returns `false` when the same content was sent for this key within the
    /// window. Otherwise the alert is recorded and `true` is returned.
    pub fn should_send(&self, alert_key: &str, content: &str) -> bool {
        let now = Instant::now();
        let fingerprint = fingerprint(content);
        let mut sent = self.sent.lock();

        let horizon = self.window.saturating_mul(2);
        sent.retain(|_, alert| now.duration_since(alert.sent_at) < horizon);

        if let Some(previous) = sent.get(alert_key) {
            if previous.fingerprint == fingerprint
                && now.duration_since(previous.sent_at) < self.window
            {
                debug!(alert_key = alert_key, "Duplicate alert suppressed");
                if let Some(metrics) = get_metrics() {
                    metrics.alerts_suppressed_total.inc();
                }
                return false;
            }
        }

        sent.insert(
            alert_key.to_string(),
            SentAlert {
                sent_at: now,
                fingerprint,
            },
        );
        true
    }

    /// Forget one key, or everything when `alert_key` is `None`.
    pub fn clear(&self, alert_key: Option<&str>) {
        let mut sent = self.sent.lock();
        match alert_key {
            Some(key) => {
                sent.remove(key);
            }
            None => sent.clear(),
        }
    }

    pub fn tracked_keys(&self) -> usize {
        self.sent.lock().len()
    }
}

fn fingerprint(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}
