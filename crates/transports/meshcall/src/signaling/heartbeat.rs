//! Signaling channel liveness
//!
//! The call loop owns the timers; this type only tracks probe bookkeeping so
//! the miss accounting can be tested without a clock.

use super::SignalMessage;
use crate::config::HeartbeatConfig;
use std::time::Duration;
use tracing::{debug, warn};

/// Outcome of a probe deadline firing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatVerdict {
    /// The probe was answered (or superseded) in time
    Alive,
    /// Probe missed; carries the consecutive miss count
    Missed(u32),
    /// Miss threshold reached; the channel must be closed
    Dead,
}

/// Ping/pong miss counter
#[derive(Debug, Clone)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    pending: Option<u64>,
    missed: u32,
}

impl HeartbeatMonitor {
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            config,
            pending: None,
            missed: 0,
        }
    }

    pub fn interval(&self) -> Duration {
        self.config.interval()
    }

    pub fn timeout(&self) -> Duration {
        self.config.timeout()
    }

    /// Consecutive missed probes
    pub fn missed(&self) -> u32 {
        self.missed
    }

    /// Timestamp of the unanswered probe, if any
    pub fn pending(&self) -> Option<u64> {
        self.pending
    }

    /// Start a probe stamped `timestamp`; returns the ping to send
    pub fn probe(&mut self, timestamp: u64) -> SignalMessage {
        self.pending = Some(timestamp);
        SignalMessage::Ping { timestamp }
    }

    /// Any pong proves the channel alive
    pub fn on_pong(&mut self, timestamp: u64) {
        if self.missed > 0 {
            debug!("Heartbeat recovered after {} missed probe(s)", self.missed);
        }
        debug!("Received pong {}", timestamp);
        self.pending = None;
        self.missed = 0;
    }

    /// Deadline for the probe stamped `probe` elapsed
    pub fn on_deadline(&mut self, probe: u64) -> HeartbeatVerdict {
        if self.pending != Some(probe) {
            return HeartbeatVerdict::Alive;
        }

        self.pending = None;
        self.missed += 1;

        if self.missed >= self.config.max_missed {
            warn!(
                "Heartbeat failed: {} consecutive probes unanswered",
                self.missed
            );
            HeartbeatVerdict::Dead
        } else {
            debug!("Heartbeat probe {} missed ({} so far)", probe, self.missed);
            HeartbeatVerdict::Missed(self.missed)
        }
    }

    /// Forget all probe state (new channel)
    pub fn reset(&mut self) {
        self.pending = None;
        self.missed = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor() -> HeartbeatMonitor {
        HeartbeatMonitor::new(HeartbeatConfig::default())
    }

    #[test]
    fn test_three_misses_declare_dead() {
        let mut hb = monitor();

        hb.probe(1);
        assert_eq!(hb.on_deadline(1), HeartbeatVerdict::Missed(1));
        hb.probe(2);
        assert_eq!(hb.on_deadline(2), HeartbeatVerdict::Missed(2));
        hb.probe(3);
        assert_eq!(hb.on_deadline(3), HeartbeatVerdict::Dead);
    }

    #[test]
    fn test_pong_resets_counter() {
        let mut hb = monitor();

        hb.probe(1);
        hb.on_deadline(1);
        hb.probe(2);
        hb.on_deadline(2);
        assert_eq!(hb.missed(), 2);

        hb.probe(3);
        hb.on_pong(3);
        assert_eq!(hb.missed(), 0);
        assert_eq!(hb.pending(), None);
        assert_eq!(hb.on_deadline(3), HeartbeatVerdict::Alive);
    }

    #[test]
    fn test_stale_deadline_ignored() {
        let mut hb = monitor();
        hb.probe(1);
        hb.probe(2);
        assert_eq!(hb.on_deadline(1), HeartbeatVerdict::Alive);
        assert_eq!(hb.on_deadline(2), HeartbeatVerdict::Missed(1));
    }

    #[test]
    fn test_probe_message() {
        let mut hb = monitor();
        assert_eq!(hb.probe(7), SignalMessage::Ping { timestamp: 7 });
        assert_eq!(hb.pending(), Some(7));
        assert_eq!(hb.interval(), Duration::from_secs(15));
        assert_eq!(hb.timeout(), Duration::from_secs(5));
    }
}
