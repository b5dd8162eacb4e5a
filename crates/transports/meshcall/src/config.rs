//! Configuration types for mesh calls

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Main configuration for a call client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    /// WebSocket signaling relay URL (ws:// or wss://)
    pub signaling_url: String,

    /// Room to join
    pub room_id: String,

    /// Local identity, also used as the display name
    pub username: String,

    /// STUN server URLs (at least one required)
    pub stun_servers: Vec<String>,

    /// TURN server configurations (optional)
    pub turn_servers: Vec<TurnServerConfig>,

    /// ICE candidate pool size (default: 10)
    pub ice_candidate_pool_size: u8,

    /// Delay before initiating an offer to a newly joined peer (default: 100ms)
    pub offer_delay_ms: u64,

    /// Signaling liveness probing
    pub heartbeat: HeartbeatConfig,

    /// Signaling channel recovery
    pub reconnect: ReconnectionPolicy,
}

/// TURN server configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnServerConfig {
    /// TURN server URL (turn: or turns:)
    pub url: String,

    /// Username for TURN authentication
    pub username: String,

    /// Credential for TURN authentication
    pub credential: String,
}

/// Heartbeat timing over the signaling channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Probe period in milliseconds (default: 15000)
    pub interval_ms: u64,

    /// Per-probe response deadline in milliseconds (default: 5000)
    pub timeout_ms: u64,

    /// Consecutive misses that declare the channel dead (default: 3)
    pub max_missed: u32,
}

/// Fixed-delay reconnection policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectionPolicy {
    /// Wait after teardown before the first reopen attempt (default: 500ms)
    pub settle_delay_ms: u64,

    /// Wait between failed reopen attempts (default: 3000ms)
    pub retry_delay_ms: u64,

    /// Give up after this many attempts (default: never)
    pub max_attempts: Option<u32>,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://localhost:8080".to_string(),
            room_id: "lobby".to_string(),
            username: String::new(),
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
                "stun:stun2.l.google.com:19302".to_string(),
            ],
            turn_servers: Vec::new(),
            ice_candidate_pool_size: 10,
            offer_delay_ms: 100,
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectionPolicy::default(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: 15_000,
            timeout_ms: 5_000,
            max_missed: 3,
        }
    }
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self {
            settle_delay_ms: 500,
            retry_delay_ms: 3_000,
            max_attempts: None,
        }
    }
}

impl HeartbeatConfig {
    /// Probe period
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Response deadline
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl ReconnectionPolicy {
    /// Delay before the first reopen attempt
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    /// Delay between reopen attempts
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Check if another attempt is allowed (`attempt` is 1-based)
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.max_attempts.map_or(true, |max| attempt <= max)
    }
}

impl CallConfig {
    /// Create a config for joining `room_id` as `username` with default servers
    pub fn new(signaling_url: impl Into<String>, room_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            signaling_url: signaling_url.into(),
            room_id: room_id.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    /// Parse a TOML document; missing keys keep their defaults
    pub fn from_toml_str(input: &str) -> Result<Self> {
        toml::from_str(input)
            .map_err(|e| Error::InvalidConfig(format!("Failed to parse config: {}", e)))
    }

    /// Load a TOML config file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    /// Delay before initiating an offer to a new peer
    pub fn offer_delay(&self) -> Duration {
        Duration::from_millis(self.offer_delay_ms)
    }

    /// Validate configuration parameters
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - signaling_url is not a ws:// or wss:// URL
    /// - room_id or username is empty
    /// - no STUN server is configured, or a STUN/TURN URL has the wrong scheme
    /// - a heartbeat timing is zero or the deadline is not shorter than the period
    pub fn validate(&self) -> Result<()> {
        if !self.signaling_url.starts_with("ws://") && !self.signaling_url.starts_with("wss://") {
            return Err(Error::InvalidConfig(format!(
                "signaling_url must start with ws:// or wss://, got: {}",
                self.signaling_url
            )));
        }

        if self.room_id.trim().is_empty() {
            return Err(Error::InvalidConfig("room_id must not be empty".to_string()));
        }

        if self.username.trim().is_empty() {
            return Err(Error::InvalidConfig("username must not be empty".to_string()));
        }

        if self.stun_servers.is_empty() {
            return Err(Error::InvalidConfig(
                "At least one STUN server is required".to_string(),
            ));
        }

        for stun in &self.stun_servers {
            if !stun.starts_with("stun:") && !stun.starts_with("stuns:") {
                return Err(Error::InvalidConfig(format!(
                    "STUN server URL must start with stun: or stuns:, got: {}",
                    stun
                )));
            }
        }

        for turn in &self.turn_servers {
            if !turn.url.starts_with("turn:") && !turn.url.starts_with("turns:") {
                return Err(Error::InvalidConfig(format!(
                    "TURN server URL must start with turn: or turns:, got: {}",
                    turn.url
                )));
            }
        }

        if self.heartbeat.interval_ms == 0 || self.heartbeat.timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "heartbeat interval and timeout must be non-zero".to_string(),
            ));
        }

        if self.heartbeat.timeout_ms >= self.heartbeat.interval_ms {
            return Err(Error::InvalidConfig(format!(
                "heartbeat timeout ({}ms) must be shorter than the interval ({}ms)",
                self.heartbeat.timeout_ms, self.heartbeat.interval_ms
            )));
        }

        if self.heartbeat.max_missed == 0 {
            return Err(Error::InvalidConfig(
                "heartbeat max_missed must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}
