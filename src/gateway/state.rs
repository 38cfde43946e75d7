/// Connection state machine types, statistics and reconnection policy
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

use super::GatewayId;
use crate::config::ReconnectConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Authenticating,
    Authenticated,
    Reconnecting,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Authenticating => "AUTHENTICATING",
            ConnectionState::Authenticated => "AUTHENTICATED",
            ConnectionState::Reconnecting => "RECONNECTING",
            ConnectionState::Error => "ERROR",
        }
    }

    /// States in which a new `connect()` joins the existing attempt
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::Connected
                | ConnectionState::Authenticating
                | ConnectionState::Authenticated
                | ConnectionState::Reconnecting
        )
    }

    pub fn is_authenticated(&self) -> bool {
        *self == ConnectionState::Authenticated
    }

    /// Edges of the state machine; `disconnect()` is allowed from anywhere
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        if next == Disconnected {
            return true;
        }

        matches!(
            (*self, next),
            (Disconnected, Connecting)
                | (Error, Connecting)
                | (Reconnecting, Connecting)
                | (Connecting, Connected)
                | (Connecting, Error)
                | (Connecting, Reconnecting)
                | (Connected, Authenticating)
                | (Connected, Error)
                | (Connected, Reconnecting)
                | (Error, Authenticating)
                | (Authenticating, Authenticated)
                | (Authenticating, Error)
                | (Authenticating, Reconnecting)
                | (Authenticated, Reconnecting)
                | (Authenticated, Error)
                | (Reconnecting, Error)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// STATS
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionStats {
    pub connected_at: Option<DateTime<Utc>>,
    pub authenticated_at: Option<DateTime<Utc>>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub error_count: u64,
}

/// Point-in-time view published by the connection actor
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionSnapshot {
    pub gateway_id: GatewayId,
    pub state: ConnectionState,
    /// Last failure; cleared on reaching Authenticated
    pub error: Option<String>,
    pub stats: ConnectionStats,
    pub pending_commands: usize,
    pub subscriptions: usize,
    /// Attempt number inside the current reconnection cycle (0 outside one)
    pub reconnect_attempt: u32,
}

impl ConnectionSnapshot {
    pub fn new(gateway_id: GatewayId) -> Self {
        Self {
            gateway_id,
            state: ConnectionState::Disconnected,
            error: None,
            stats: ConnectionStats::default(),
            pending_commands: 0,
            subscriptions: 0,
            reconnect_attempt: 0,
        }
    }
}

// ============================================================================
// RECONNECT POLICY
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::from_config(&ReconnectConfig::default())
    }
}

impl ReconnectPolicy {
    pub fn from_config(cfg: &ReconnectConfig) -> Self {
        Self {
            enabled: cfg.enabled,
            initial_delay: Duration::from_millis(cfg.initial_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            multiplier: cfg.multiplier,
            max_attempts: cfg.max_attempts,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt` (1-based), or None once the cap is exceeded
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if !self.enabled || attempt == 0 || attempt > self.max_attempts {
            return None;
        }

        let factor = self.multiplier.max(1.0).powi(attempt as i32 - 1);
        let delay_ms = (self.initial_delay.as_millis() as f64 * factor)
            .min(self.max_delay.as_millis() as f64);
        Some(Duration::from_millis(delay_ms as u64))
    }
}
