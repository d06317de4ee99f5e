//! Connection lifecycle supervisor: reconnect backoff and keepalive tracking. Grounded on
//! the teacher's `instance::wa_rs_runner::run` reconnect loop — same doubling-backoff
//! shape, generalized to read its schedule from [`crate::config::ReconnectConfig`] instead
//! of a hardcoded match arm, since the cap here is configurable (and, per the spec, must
//! default to 300s rather than the teacher's 30s ceiling).

use std::time::Duration;

use crate::config::ReconnectConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Reconnecting,
    Disconnected,
}

/// Computes the backoff delay for the given 0-based reconnect attempt: doubling from
/// `initial_backoff_ms`, capped at `max_backoff_ms`.
pub fn backoff_for_attempt(config: &ReconnectConfig, attempt: u32) -> Duration {
    let shift = attempt.min(32);
    let scaled = config.initial_backoff_ms.saturating_mul(1u64 << shift);
    Duration::from_millis(scaled.min(config.max_backoff_ms))
}

/// Tracks connection state, reconnect attempt count, and keepalive liveness for a single
/// transport lifetime (reset on every successful reconnect).
pub struct ConnectionSupervisor {
    config: ReconnectConfig,
    state: ConnectionState,
    reconnect_attempt: u32,
    last_pong_at: Option<std::time::Instant>,
    logged_out: bool,
}

impl ConnectionSupervisor {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            state: ConnectionState::Idle,
            reconnect_attempt: 0,
            last_pong_at: None,
            logged_out: false,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn mark_connecting(&mut self) {
        self.state = ConnectionState::Connecting;
    }

    pub fn mark_connected(&mut self) {
        self.state = ConnectionState::Connected;
        self.reconnect_attempt = 0;
        self.last_pong_at = Some(std::time::Instant::now());
    }

    /// Marks the transport as having dropped, returning the delay before the next
    /// reconnect attempt (or `None` when `auto_reconnect` is disabled, or the device has
    /// been marked logged out).
    pub fn mark_disconnected(&mut self) -> Option<Duration> {
        self.last_pong_at = None;
        if self.logged_out || !self.config.auto_reconnect {
            self.state = ConnectionState::Disconnected;
            return None;
        }
        self.state = ConnectionState::Reconnecting;
        let delay = backoff_for_attempt(&self.config, self.reconnect_attempt);
        self.reconnect_attempt = self.reconnect_attempt.saturating_add(1);
        Some(delay)
    }

    /// Marks the session as terminally logged out: no further reconnect attempts should be
    /// scheduled regardless of `auto_reconnect`, matching the requirement that a fatal
    /// disconnect halts reconnection rather than retrying into a dead session.
    pub fn mark_logged_out(&mut self) {
        self.logged_out = true;
        self.state = ConnectionState::Disconnected;
        self.last_pong_at = None;
    }

    pub fn is_logged_out(&self) -> bool {
        self.logged_out
    }

    pub fn record_pong(&mut self) {
        self.last_pong_at = Some(std::time::Instant::now());
    }

    /// True when no pong has arrived within the configured deadline after the last ping,
    /// signalling the caller should treat the connection as dead and reconnect.
    pub fn keepalive_expired(&self) -> bool {
        match self.last_pong_at {
            Some(at) => at.elapsed() > Duration::from_secs(self.config.keepalive_pong_deadline_secs),
            None => false,
        }
    }

    pub fn reconnect_attempt(&self) -> u32 {
        self.reconnect_attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ReconnectConfig {
        ReconnectConfig {
            auto_reconnect: true,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 300_000,
            keepalive_interval_secs: 30,
            keepalive_pong_deadline_secs: 10,
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let cfg = config();
        assert_eq!(backoff_for_attempt(&cfg, 0), Duration::from_millis(1_000));
        assert_eq!(backoff_for_attempt(&cfg, 1), Duration::from_millis(2_000));
        assert_eq!(backoff_for_attempt(&cfg, 2), Duration::from_millis(4_000));
        // Keeps doubling well past the point where it would overflow without the cap.
        assert_eq!(backoff_for_attempt(&cfg, 20), Duration::from_millis(300_000));
    }

    #[test]
    fn disconnect_schedules_increasing_backoff_across_attempts() {
        let mut supervisor = ConnectionSupervisor::new(config());
        supervisor.mark_connected();
        let first = supervisor.mark_disconnected().unwrap();
        supervisor.mark_connecting();
        let second_cfg_attempt = supervisor.reconnect_attempt();
        assert_eq!(second_cfg_attempt, 1);
        let second = backoff_for_attempt(&config(), second_cfg_attempt);
        assert!(second > first);
    }

    #[test]
    fn disabled_auto_reconnect_yields_no_delay() {
        let mut cfg = config();
        cfg.auto_reconnect = false;
        let mut supervisor = ConnectionSupervisor::new(cfg);
        supervisor.mark_connected();
        assert!(supervisor.mark_disconnected().is_none());
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn keepalive_expires_after_deadline() {
        let mut supervisor = ConnectionSupervisor::new(config());
        supervisor.mark_connected();
        assert!(!supervisor.keepalive_expired());
    }

    #[test]
    fn logged_out_blocks_future_reconnects_even_with_auto_reconnect_on() {
        let mut supervisor = ConnectionSupervisor::new(config());
        supervisor.mark_connected();
        supervisor.mark_logged_out();
        assert!(supervisor.is_logged_out());
        assert_eq!(supervisor.state(), ConnectionState::Disconnected);
        assert!(supervisor.mark_disconnected().is_none());
    }
}
