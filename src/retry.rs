//! Retry-receipt engine: when inbound decryption fails, request the sender resend the
//! message, rate-limited per (sender, message id) pair with exponential backoff so a
//! persistently undecryptable message doesn't spin forever.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::binary::BinaryNode;
use crate::config::RetryConfig;
use crate::jid::Jid;

struct AttemptState {
    count: u32,
    next_allowed_at: Instant,
}

/// Tracks outstanding retry attempts and decides when another retry receipt may be sent.
pub struct RetryEngine {
    config: RetryConfig,
    attempts: Mutex<HashMap<(String, String), AttemptState>>,
}

impl RetryEngine {
    pub fn new(config: RetryConfig) -> Self {
        Self { config, attempts: Mutex::new(HashMap::new()) }
    }

    /// Returns `true` and records the attempt if a retry is currently permitted for this
    /// (sender, message id) pair under the configured attempt cap and backoff schedule.
    pub fn try_record_attempt(&self, sender: &str, message_id: &str) -> bool {
        let key = (sender.to_owned(), message_id.to_owned());
        let now = Instant::now();
        let mut attempts = self.attempts.lock().expect("retry engine mutex poisoned");

        let state = attempts.entry(key).or_insert_with(|| AttemptState {
            count: 0,
            next_allowed_at: now,
        });

        if state.count >= self.config.max_attempts {
            return false;
        }
        if now < state.next_allowed_at {
            return false;
        }

        state.count += 1;
        let backoff_ms = (self.config.initial_backoff_ms.saturating_mul(1u64 << state.count.min(16)))
            .min(self.config.max_backoff_ms);
        state.next_allowed_at = now + Duration::from_millis(backoff_ms);
        true
    }

    /// Drops tracking state once a message is either successfully decrypted on a later
    /// retry or abandoned.
    pub fn forget(&self, sender: &str, message_id: &str) {
        let key = (sender.to_owned(), message_id.to_owned());
        self.attempts.lock().expect("retry engine mutex poisoned").remove(&key);
    }

    pub fn attempt_count(&self, sender: &str, message_id: &str) -> u32 {
        let key = (sender.to_owned(), message_id.to_owned());
        self.attempts
            .lock()
            .expect("retry engine mutex poisoned")
            .get(&key)
            .map(|s| s.count)
            .unwrap_or(0)
    }
}

/// Builds the `<receipt type="retry">` stanza sent back to `from` for `message_id`.
pub fn build_retry_receipt(from: &Jid, message_id: &str, attempt: u32, own_device: &Jid) -> BinaryNode {
    BinaryNode::new("receipt")
        .with_attr("to", from.to_string())
        .with_attr("id", message_id)
        .with_attr("type", "retry")
        .with_children(vec![
            BinaryNode::new("retry")
                .with_attr("count", attempt.to_string())
                .with_attr("id", message_id),
            BinaryNode::new("registration").with_attr("from", own_device.to_string()),
        ])
}
