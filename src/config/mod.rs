//! Client-scoped configuration surface, serde-deserializable and overridable from
//! environment variables, following the teacher's `AppConfig::from_env()` idiom but
//! scoped to what this core actually needs (no web server / database / webhook sections).

use std::env;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub client: ClientConfig,
    pub reconnect: ReconnectConfig,
    pub signal: SignalConfig,
    pub retry: RetryConfig,
    pub synchronous_ack: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    pub platform: String,
    pub version: (u32, u32, u32),
    pub user_agent: String,
    pub locale: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    pub auto_reconnect: bool,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub keepalive_interval_secs: u64,
    pub keepalive_pong_deadline_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    /// Accept a changed identity for a known address instead of rejecting the message.
    pub auto_trust_identity_change: bool,
    pub max_skipped_keys: usize,
    pub max_skipped_key_age_secs: u64,
    pub prekey_low_water: usize,
    pub prekey_refill_target: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client: ClientConfig {
                platform: "web".to_string(),
                version: crate::version::WaWebVersion::fallback().as_tuple(),
                user_agent: "wa-rs/0.1".to_string(),
                locale: "en".to_string(),
            },
            reconnect: ReconnectConfig {
                auto_reconnect: true,
                initial_backoff_ms: 1_000,
                max_backoff_ms: 300_000,
                keepalive_interval_secs: 30,
                keepalive_pong_deadline_secs: 10,
            },
            signal: SignalConfig::default(),
            retry: RetryConfig {
                max_attempts: 5,
                initial_backoff_ms: 1_000,
                max_backoff_ms: 30_000,
            },
            synchronous_ack: false,
        }
    }
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            auto_trust_identity_change: false,
            max_skipped_keys: 2_000,
            max_skipped_key_age_secs: 300,
            prekey_low_water: 20,
            prekey_refill_target: 50,
        }
    }
}

impl Config {
    /// Builds a config from defaults overridden by environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = optional_var("WA_RS_PLATFORM") {
            config.client.platform = v;
        }
        if let Some(v) = optional_var("WA_RS_USER_AGENT") {
            config.client.user_agent = v;
        }
        if let Some(v) = optional_var("WA_RS_LOCALE") {
            config.client.locale = v;
        }
        config.reconnect.auto_reconnect = bool_var(
            "WA_RS_AUTO_RECONNECT",
            config.reconnect.auto_reconnect,
        );
        config.reconnect.max_backoff_ms =
            parse_u64("WA_RS_MAX_BACKOFF_MS", config.reconnect.max_backoff_ms);
        config.signal.auto_trust_identity_change = bool_var(
            "WA_RS_AUTO_TRUST_IDENTITY_CHANGE",
            config.signal.auto_trust_identity_change,
        );
        config.signal.max_skipped_keys =
            parse_usize("WA_RS_MAX_SKIPPED_KEYS", config.signal.max_skipped_keys);
        config.signal.prekey_low_water =
            parse_usize("WA_RS_PREKEY_LOW_WATER", config.signal.prekey_low_water);
        config.signal.prekey_refill_target = parse_usize(
            "WA_RS_PREKEY_REFILL_TARGET",
            config.signal.prekey_refill_target,
        );
        config.retry.max_attempts =
            parse_u32("WA_RS_RETRY_MAX_ATTEMPTS", config.retry.max_attempts);
        config.synchronous_ack = bool_var("WA_RS_SYNCHRONOUS_ACK", config.synchronous_ack);

        config
    }
}

fn optional_var(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn bool_var(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|value| value == "true" || value == "1")
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|value| value.parse::<usize>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_policy() {
        let config = Config::default();
        assert_eq!(config.reconnect.max_backoff_ms, 300_000);
        assert_eq!(config.signal.max_skipped_keys, 2_000);
        assert_eq!(config.signal.prekey_low_water, 20);
        assert_eq!(config.signal.prekey_refill_target, 50);
        assert_eq!(config.retry.max_attempts, 5);
    }
}
