//! Signaling reconnection coordinator
//!
//! ```text
//! Connected ──channel lost──▶ Disconnected ──attempt──▶ Reconnecting ──join sent──▶ Connected
//!                                                           │   ▲
//!                                                           └───┘ retry after fixed delay
//! ```
//!
//! The coordinator only tracks status and the intent snapshot; the call loop
//! owns the timers and the actual teardown.

use crate::config::ReconnectionPolicy;
use crate::media::LocalMediaIntent;
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Status of the signaling channel as seen by the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Reconnecting,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Reconnecting => "reconnecting",
        };
        write!(f, "{}", status)
    }
}

/// Reconnection attempt granted by [`ReconnectionCoordinator::start_attempt`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    /// 1-based attempt number within this outage
    pub number: u32,
    /// True for the first attempt, which moves status to `Reconnecting`
    pub entered_reconnecting: bool,
}

/// Tracks one outage at a time
#[derive(Debug, Clone)]
pub struct ReconnectionCoordinator {
    policy: ReconnectionPolicy,
    status: ConnectionStatus,
    snapshot: Option<LocalMediaIntent>,
    attempts: u32,
}

impl ReconnectionCoordinator {
    /// Coordinator for a call that has not connected yet
    pub fn new(policy: ReconnectionPolicy) -> Self {
        Self {
            policy,
            status: ConnectionStatus::Disconnected,
            snapshot: None,
            attempts: 0,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// Attempts made in the current outage
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Intent captured when the channel was lost
    pub fn snapshot(&self) -> Option<LocalMediaIntent> {
        self.snapshot
    }

    pub fn settle_delay(&self) -> Duration {
        self.policy.settle_delay()
    }

    pub fn retry_delay(&self) -> Duration {
        self.policy.retry_delay()
    }

    /// Whether an outage is being handled
    pub fn in_progress(&self) -> bool {
        self.status != ConnectionStatus::Connected && self.snapshot.is_some()
    }

    /// The initial join succeeded
    pub fn mark_connected(&mut self) {
        self.status = ConnectionStatus::Connected;
    }

    /// The channel died while joined
    ///
    /// Returns false when an outage is already being handled or the call
    /// never connected; the caller must then leave everything alone.
    pub fn on_channel_lost(&mut self, intent: LocalMediaIntent) -> bool {
        if self.status != ConnectionStatus::Connected {
            debug!("Channel loss ignored: status {}", self.status);
            return false;
        }

        info!("Signaling channel lost, saving media intent {:?}", intent);
        self.status = ConnectionStatus::Disconnected;
        self.snapshot = Some(intent);
        self.attempts = 0;
        true
    }

    /// Record a media change made while the outage is being handled
    ///
    /// The intent restored on reconnection is the latest one, not the one
    /// captured at loss. No-op outside an outage.
    pub fn update_snapshot(&mut self, intent: LocalMediaIntent) {
        if self.in_progress() && self.snapshot != Some(intent) {
            debug!("Media intent changed during outage: {:?}", intent);
            self.snapshot = Some(intent);
        }
    }

    /// Claim the next attempt
    ///
    /// Returns `None` once the policy's attempt limit is exhausted, after
    /// which the call stays disconnected.
    pub fn start_attempt(&mut self) -> Option<Attempt> {
        if !self.in_progress() {
            return None;
        }

        let number = self.attempts + 1;
        if !self.policy.should_retry(number) {
            warn!("Giving up reconnection after {} attempt(s)", self.attempts);
            self.snapshot = None;
            self.status = ConnectionStatus::Disconnected;
            return None;
        }

        self.attempts = number;
        let entered_reconnecting = self.status != ConnectionStatus::Reconnecting;
        self.status = ConnectionStatus::Reconnecting;
        debug!("Reconnection attempt {}", number);

        Some(Attempt {
            number,
            entered_reconnecting,
        })
    }

    /// The channel is open again; returns the intent to restore
    pub fn complete(&mut self) -> Option<LocalMediaIntent> {
        if self.status != ConnectionStatus::Reconnecting {
            return None;
        }

        info!("Reconnected after {} attempt(s)", self.attempts);
        self.status = ConnectionStatus::Connected;
        self.attempts = 0;
        self.snapshot.take()
    }

    /// Start over after giving up, on user request
    ///
    /// Returns false while an outage is still being handled.
    pub fn restart(&mut self, intent: LocalMediaIntent) -> bool {
        if self.in_progress() || self.status == ConnectionStatus::Connected {
            return false;
        }

        info!("Restarting reconnection");
        self.snapshot = Some(intent);
        self.attempts = 0;
        true
    }

    /// Stop handling the outage (the user left)
    pub fn abandon(&mut self) {
        self.snapshot = None;
        self.attempts = 0;
        self.status = ConnectionStatus::Disconnected;
    }
}
