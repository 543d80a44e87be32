//! Connection liveness and the reconnect state machine.
//!
//! ```text
//!  Connected ──(no traffic for no_activity_timeout)──► Reconnecting
//!      ▲                                                   │
//!      └──────────────(on_reconnected)─────────────────────┤
//!                                                          ▼
//!                 (max_attempts failed or total_timeout) Disconnected
//! ```
//!
//! The machine is pure: it is fed instants and returns the action the
//! viewer has to take, so every timing rule is testable without sleeping.

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReconnectConfig {
    pub no_activity_timeout_ms: u64,
    pub attempt_interval_ms: u64,
    pub total_timeout_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            no_activity_timeout_ms: 10_000,
            attempt_interval_ms: 10_000,
            total_timeout_ms: 30_000,
            max_attempts: 3,
        }
    }
}

impl ReconnectConfig {
    pub fn no_activity_timeout(&self) -> Duration {
        Duration::from_millis(self.no_activity_timeout_ms)
    }

    pub fn attempt_interval(&self) -> Duration {
        Duration::from_millis(self.attempt_interval_ms)
    }

    pub fn total_timeout(&self) -> Duration {
        Duration::from_millis(self.total_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connected,
    Reconnecting,
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Disconnected => "disconnected",
        })
    }
}

/// What the viewer must do after feeding the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectAction {
    None,
    /// Ask the signaling layer for reconnect attempt number `attempt`
    /// (1-based).
    RequestReconnect { attempt: u32 },
    /// Give up. Returned exactly once per machine.
    Disconnect,
}

#[derive(Debug)]
pub struct ReconnectMachine {
    config: ReconnectConfig,
    state: ConnectionState,
    last_activity: Instant,
    reconnect_started: Option<Instant>,
    last_attempt: Option<Instant>,
    attempts: u32,
}

impl ReconnectMachine {
    pub fn new(config: ReconnectConfig) -> Self {
        Self::new_at(config, Instant::now())
    }

    pub fn new_at(config: ReconnectConfig, now: Instant) -> Self {
        Self {
            config,
            state: ConnectionState::Connected,
            last_activity: now,
            reconnect_started: None,
            last_attempt: None,
            attempts: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Attempts issued in the current reconnect episode.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Traffic from the host arrived.
    pub fn on_activity(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Advance timers.
    pub fn poll(&mut self, now: Instant) -> ReconnectAction {
        match self.state {
            ConnectionState::Disconnected => ReconnectAction::None,
            ConnectionState::Connected => {
                let idle = now.saturating_duration_since(self.last_activity);
                if idle < self.config.no_activity_timeout() {
                    return ReconnectAction::None;
                }
                warn!(idle_ms = idle.as_millis() as u64, "no traffic from host, reconnecting");
                self.state = ConnectionState::Reconnecting;
                self.reconnect_started = Some(now);
                self.attempts = 0;
                self.next_attempt(now)
            }
            ConnectionState::Reconnecting => {
                if self.total_expired(now) {
                    return self.disconnect("reconnect timed out");
                }
                let since_attempt = self
                    .last_attempt
                    .map_or(Duration::MAX, |t| now.saturating_duration_since(t));
                if since_attempt >= self.config.attempt_interval() {
                    // The previous attempt never reported back.
                    self.next_attempt(now)
                } else {
                    ReconnectAction::None
                }
            }
        }
    }

    /// The signaling layer reported that an attempt failed.
    pub fn on_attempt_failed(&mut self, now: Instant) -> ReconnectAction {
        if self.state != ConnectionState::Reconnecting {
            return ReconnectAction::None;
        }
        if self.total_expired(now) {
            return self.disconnect("reconnect timed out");
        }
        self.next_attempt(now)
    }

    /// A new transport is in place.
    pub fn on_reconnected(&mut self, now: Instant) -> bool {
        if self.state == ConnectionState::Disconnected {
            return false;
        }
        if self.state == ConnectionState::Reconnecting {
            info!(attempts = self.attempts, "reconnected");
        }
        self.state = ConnectionState::Connected;
        self.last_activity = now;
        self.reconnect_started = None;
        self.last_attempt = None;
        self.attempts = 0;
        true
    }

    /// Stop without waiting for timers (viewer shut down).
    pub fn close(&mut self) {
        self.state = ConnectionState::Disconnected;
    }

    fn total_expired(&self, now: Instant) -> bool {
        self.reconnect_started
            .is_some_and(|t| now.saturating_duration_since(t) >= self.config.total_timeout())
    }

    fn next_attempt(&mut self, now: Instant) -> ReconnectAction {
        if self.attempts >= self.config.max_attempts {
            return self.disconnect("reconnect attempts exhausted");
        }
        self.attempts += 1;
        self.last_attempt = Some(now);
        info!(attempt = self.attempts, max = self.config.max_attempts, "requesting reconnect");
        ReconnectAction::RequestReconnect {
            attempt: self.attempts,
        }
    }

    fn disconnect(&mut self, reason: &str) -> ReconnectAction {
        warn!(reason, attempts = self.attempts, "disconnected");
        self.state = ConnectionState::Disconnected;
        ReconnectAction::Disconnect
    }
}
