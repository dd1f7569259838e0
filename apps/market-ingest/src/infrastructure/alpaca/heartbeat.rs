//! Heartbeat
//!
//! Connection liveness through periodic pings. Any inbound frame counts as
//! proof of life; a ping left unanswered past the timeout means the
//! connection is dead and must be replaced.

use std::time::Duration;

use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::infrastructure::config::AlpacaSettings;

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Interval between ping messages.
    pub ping_interval: Duration,
    /// Silence tolerated after a ping before the connection is dead.
    pub pong_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(60),
        }
    }
}

impl HeartbeatConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(ping_interval: Duration, pong_timeout: Duration) -> Self {
        Self {
            ping_interval,
            pong_timeout,
        }
    }

    /// Take the heartbeat tuning from the Alpaca settings.
    #[must_use]
    pub const fn from_settings(settings: &AlpacaSettings) -> Self {
        Self::new(settings.heartbeat_interval, settings.heartbeat_timeout)
    }
}

/// Action required on a heartbeat tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Send a ping frame.
    SendPing,
    /// The connection missed its deadline.
    Timeout,
}

/// Per-connection heartbeat state.
#[derive(Debug)]
pub struct Heartbeat {
    config: HeartbeatConfig,
    last_seen: Instant,
    awaiting_pong: bool,
}

impl Heartbeat {
    /// Start tracking a connection opened at `now`.
    #[must_use]
    pub const fn new(config: HeartbeatConfig, now: Instant) -> Self {
        Self {
            config,
            last_seen: now,
            awaiting_pong: false,
        }
    }

    /// Ticker for [`Heartbeat::on_tick`]. The first tick fires one full
    /// interval after creation.
    #[must_use]
    pub fn ticker(&self) -> Interval {
        let period = self.config.ping_interval;
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        interval
    }

    /// Record any inbound frame.
    pub const fn record_activity(&mut self, now: Instant) {
        self.last_seen = now;
        self.awaiting_pong = false;
    }

    /// Whether a ping is outstanding.
    #[must_use]
    pub const fn is_awaiting_pong(&self) -> bool {
        self.awaiting_pong
    }

    /// Decide what to do on a tick at `now`.
    pub fn on_tick(&mut self, now: Instant) -> HeartbeatEvent {
        if self.awaiting_pong && now.duration_since(self.last_seen) > self.config.pong_timeout {
            tracing::warn!(
                silent_secs = now.duration_since(self.last_seen).as_secs(),
                timeout_secs = self.config.pong_timeout.as_secs(),
                "Heartbeat timeout detected"
            );
            return HeartbeatEvent::Timeout;
        }

        self.awaiting_pong = true;
        HeartbeatEvent::SendPing
    }
}
