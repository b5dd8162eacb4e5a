//! Session transport abstraction
//!
//! A session transport is one bidirectional media connection to one remote
//! peer. The negotiation state machine drives it; the WebRTC implementation
//! lives in [`super::rtc`].

use crate::error::TransportResult;
use crate::media::{Lane, LocalSource, TrackMetadata};
use crate::signaling::{IceCandidate, SessionDescription};
use crate::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Signaling state reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// Connectivity state of the media path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// A lane received from the remote peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub track_id: String,
    pub stream_id: String,
    pub metadata: TrackMetadata,
}

/// Something the transport observed asynchronously
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Locally gathered ICE candidate to forward to the peer
    LocalCandidate(IceCandidate),
    /// Remote lane started arriving
    RemoteTrack(RemoteTrack),
    /// Media path state changed
    ConnectionState(PeerState),
}

/// Transport event tagged with the session that produced it
///
/// `generation` identifies the session instance; events from a superseded
/// session carry an older generation and are dropped.
#[derive(Debug, Clone)]
pub struct SessionEvent {
    pub peer_id: String,
    pub generation: u64,
    pub event: TransportEvent,
}

/// Sink handed to transports for their events
pub type SessionEventSender = mpsc::UnboundedSender<SessionEvent>;

/// One media connection to one remote peer
#[async_trait]
pub trait SessionTransport: Send + Sync {
    /// Current signaling state
    fn signaling_state(&self) -> SignalingState;

    /// Attach `source` as the sender of `lane`
    ///
    /// Lanes are attached exactly once each, in [`Lane::ALL`] order.
    async fn add_lane(&self, lane: Lane, source: &LocalSource) -> TransportResult<()>;

    /// Swap the content of an attached lane in place
    async fn replace_lane(&self, lane: Lane, source: &LocalSource) -> TransportResult<()>;

    /// Create an offer and install it as the local description
    async fn create_offer(&self) -> TransportResult<SessionDescription>;

    /// Create an answer and install it as the local description
    async fn create_answer(&self) -> TransportResult<SessionDescription>;

    /// Install a remote offer or answer
    async fn set_remote_description(&self, description: SessionDescription) -> TransportResult<()>;

    /// Discard the pending local offer and return to stable
    async fn rollback(&self) -> TransportResult<()>;

    /// Add a remote ICE candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> TransportResult<()>;

    /// Tear the connection down
    async fn close(&self) -> TransportResult<()>;
}

/// Creates session transports
#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Open a fresh transport to `peer_id`
    ///
    /// Every event the transport produces is sent to `events` tagged with
    /// `peer_id` and `generation`.
    async fn create(
        &self,
        peer_id: &str,
        generation: u64,
        events: SessionEventSender,
    ) -> Result<Box<dyn SessionTransport>>;
}
