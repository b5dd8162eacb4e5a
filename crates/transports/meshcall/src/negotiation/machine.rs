//! Per-peer negotiation state machine ("perfect negotiation")
//!
//! ```text
//! Idle ──bind_lanes──▶ Active(Stable ⇄ HaveLocalOffer | HaveRemoteOffer) ──close──▶ Closed
//! ```
//!
//! Glare is resolved by politeness: the peer whose identity sorts strictly
//! smaller is polite and rolls back its own offer when one arrives while it
//! has an offer outstanding; the impolite peer ignores the incoming offer.
//! Structural failures yield [`ApplyOutcome::Recreate`] and the owner replaces
//! the whole machine with a fresh one.

use super::transport::{SessionEventSender, SessionTransport, SignalingState, TransportFactory};
use crate::media::{BoundLane, Lane, LaneSources, LocalSource, TrackLaneAllocator};
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};
use crate::{Error, Result};
use tracing::{debug, info, instrument, warn};

/// Lifecycle phase of a machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Transport created, lanes not bound yet
    Idle,
    /// Lanes bound; signaling state comes from the transport
    Active,
    Closed,
}

/// Result of applying a remote description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Applied; after an offer the caller must answer
    Success,
    /// Dropped without effect (glare on the impolite side, stale answer)
    Ignored,
    /// Session is unusable; discard it and start over with a fresh one
    Recreate,
}

/// Polite iff the local identity sorts strictly before the remote one
pub fn is_polite(local_id: &str, remote_id: &str) -> bool {
    local_id < remote_id
}

/// Whether to offer to a newly joined peer
///
/// The impolite side normally initiates. A side already sending camera or
/// screen always initiates, otherwise a late joiner would never receive it.
pub fn should_initiate(polite: bool, sending_visual: bool) -> bool {
    !polite || sending_visual
}

/// Negotiation state for one remote peer
pub struct NegotiationStateMachine {
    peer_id: String,
    polite: bool,
    generation: u64,
    phase: Phase,
    renegotiation_needed: bool,
    transport: Box<dyn SessionTransport>,
    allocator: TrackLaneAllocator,
}

impl NegotiationStateMachine {
    /// Wrap a fresh transport; lanes still need binding
    pub fn new(
        local_id: &str,
        peer_id: impl Into<String>,
        generation: u64,
        transport: Box<dyn SessionTransport>,
    ) -> Self {
        let peer_id = peer_id.into();
        Self {
            polite: is_polite(local_id, &peer_id),
            peer_id,
            generation,
            phase: Phase::Idle,
            renegotiation_needed: false,
            transport,
            allocator: TrackLaneAllocator::new(),
        }
    }

    /// Create a transport through `factory` and bind all lanes from `sources`
    #[instrument(skip(factory, sources, events), fields(peer_id = %peer_id))]
    pub async fn open(
        factory: &dyn TransportFactory,
        local_id: &str,
        peer_id: &str,
        generation: u64,
        sources: &LaneSources,
        events: SessionEventSender,
    ) -> Result<Self> {
        let transport = factory.create(peer_id, generation, events).await?;
        let mut machine = Self::new(local_id, peer_id, generation, transport);

        if let Err(e) = machine.bind_lanes(sources).await {
            machine.close().await;
            return Err(e);
        }

        info!(
            "Opened session {} with {} (polite: {})",
            generation, peer_id, machine.polite
        );

        Ok(machine)
    }

    /// Bind Audio, Video and Screen; moves Idle to Active
    pub async fn bind_lanes(&mut self, sources: &LaneSources) -> Result<()> {
        if self.phase != Phase::Idle {
            return Err(Error::InvalidState(format!(
                "Lanes for {} already bound (phase {:?})",
                self.peer_id, self.phase
            )));
        }

        self.allocator
            .bind_all(self.transport.as_ref(), sources)
            .await?;
        self.phase = Phase::Active;
        Ok(())
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn is_polite(&self) -> bool {
        self.polite
    }

    /// Session instance number, unique per manager
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Current signaling state
    pub fn state(&self) -> SignalingState {
        match self.phase {
            Phase::Closed => SignalingState::Closed,
            Phase::Idle | Phase::Active => self.transport.signaling_state(),
        }
    }

    /// Bound lanes in session order
    pub fn lanes(&self) -> Vec<BoundLane> {
        self.allocator.lanes()
    }

    /// Offer from Stable; returns `None` in any other state
    pub async fn create_offer(&mut self) -> Result<Option<SessionDescription>> {
        if self.phase != Phase::Active || self.state() != SignalingState::Stable {
            debug!(
                "Skipping offer to {}: state {:?}",
                self.peer_id,
                self.state()
            );
            return Ok(None);
        }

        let offer = self
            .transport
            .create_offer()
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create offer: {}", e)))?;

        debug!("Created offer for {}", self.peer_id);
        self.renegotiation_needed = false;
        Ok(Some(offer))
    }

    /// Whether lane content changed while an exchange was in flight
    pub fn needs_renegotiation(&self) -> bool {
        self.renegotiation_needed
    }

    /// Offer again if lane content changed mid-negotiation and we are Stable now
    pub async fn renegotiate_if_needed(&mut self) -> Result<Option<SessionDescription>> {
        if !self.renegotiation_needed {
            return Ok(None);
        }
        self.create_offer().await
    }

    /// Apply a remote offer or answer, resolving glare by politeness
    pub async fn apply_remote_description(
        &mut self,
        description: SessionDescription,
    ) -> Result<ApplyOutcome> {
        if self.phase != Phase::Active {
            debug!(
                "Ignoring {:?} from {}: session {:?}",
                description.kind, self.peer_id, self.phase
            );
            return Ok(ApplyOutcome::Ignored);
        }

        let kind = description.kind;
        match (kind, self.state()) {
            (SdpKind::Answer, SignalingState::Stable) => {
                debug!("Ignoring stale answer from {}", self.peer_id);
                return Ok(ApplyOutcome::Ignored);
            }
            (SdpKind::Offer, SignalingState::HaveLocalOffer) => {
                if !self.polite {
                    info!("Offer collision with {}: keeping our offer", self.peer_id);
                    return Ok(ApplyOutcome::Ignored);
                }

                info!("Offer collision with {}: rolling back our offer", self.peer_id);
                if let Err(e) = self.transport.rollback().await {
                    warn!("Rollback failed for {}: {}", self.peer_id, e);
                    return Ok(ApplyOutcome::Recreate);
                }
                // Our rolled-back offer is gone; offer again once stable
                self.renegotiation_needed = true;
            }
            _ => {}
        }

        match self.transport.set_remote_description(description).await {
            Ok(()) => {
                debug!("Applied remote {:?} from {}", kind, self.peer_id);
                Ok(ApplyOutcome::Success)
            }
            Err(e) if e.is_structural() => {
                warn!(
                    "Session with {} unusable after remote {:?}: {}",
                    self.peer_id, kind, e
                );
                Ok(ApplyOutcome::Recreate)
            }
            Err(e) => Err(Error::SdpError(format!(
                "Failed to set remote {:?}: {}",
                kind, e
            ))),
        }
    }

    /// Answer a previously applied remote offer
    pub async fn create_answer(&mut self) -> Result<SessionDescription> {
        if self.phase != Phase::Active || self.state() != SignalingState::HaveRemoteOffer {
            return Err(Error::InvalidState(format!(
                "Cannot answer {} from {:?}",
                self.peer_id,
                self.state()
            )));
        }

        let answer = self
            .transport
            .create_answer()
            .await
            .map_err(|e| Error::SdpError(format!("Failed to create answer: {}", e)))?;

        debug!("Created answer for {}", self.peer_id);
        Ok(answer)
    }

    /// Apply a remote candidate; failures are logged and dropped
    ///
    /// Returns whether the candidate was applied.
    pub async fn add_remote_candidate(&self, candidate: IceCandidate) -> bool {
        if self.phase != Phase::Active {
            return false;
        }

        match self.transport.add_ice_candidate(candidate).await {
            Ok(()) => true,
            Err(e) => {
                debug!("Dropping ICE candidate from {}: {}", self.peer_id, e);
                false
            }
        }
    }

    /// Swap lane content in place and renegotiate
    ///
    /// Returns the new offer, or `None` when the session is mid-negotiation;
    /// the offer is then deferred until [`Self::renegotiate_if_needed`].
    pub async fn replace_lane(
        &mut self,
        lane: Lane,
        source: Option<LocalSource>,
    ) -> Result<Option<SessionDescription>> {
        if self.phase != Phase::Active {
            return Err(Error::InvalidState(format!(
                "Cannot replace {} lane on {} session with {}",
                lane,
                match self.phase {
                    Phase::Idle => "unbound",
                    _ => "closed",
                },
                self.peer_id
            )));
        }

        self.allocator
            .replace(self.transport.as_ref(), lane, source)
            .await?;

        let offer = self.create_offer().await?;
        if offer.is_none() {
            self.renegotiation_needed = true;
        }
        Ok(offer)
    }

    /// Release the transport and lane handles; idempotent
    pub async fn close(&mut self) {
        if self.phase == Phase::Closed {
            return;
        }

        self.phase = Phase::Closed;
        self.allocator.release();

        if let Err(e) = self.transport.close().await {
            debug!("Error closing session with {}: {}", self.peer_id, e);
        }

        info!("Closed session {} with {}", self.generation, self.peer_id);
    }
}
