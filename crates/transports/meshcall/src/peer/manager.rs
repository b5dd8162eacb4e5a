//! Peer session table
//!
//! Owns one [`NegotiationStateMachine`] per remote peer, routes inbound
//! signaling to it, and keeps the received-stream and participant tables the
//! UI renders from. Negotiation faults stop here: a failed session is logged
//! and discarded, never surfaced.

use crate::media::{role_for, BoundLane, Lane, LaneSources, LocalSource, StreamRole};
use crate::negotiation::{
    is_polite, should_initiate, ApplyOutcome, NegotiationStateMachine, PeerState, SessionEvent,
    SessionEventSender, SignalingState, TransportEvent, TransportFactory,
};
use crate::signaling::{SessionDescription, SignalMessage};
use crate::{Error, Result};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// A lane received from a peer, tagged with its classified role
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteLaneStream {
    pub peer_id: String,
    pub role: StreamRole,
    pub track_id: String,
    pub stream_id: String,
}

/// Offer to send once the initiation delay elapses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingOffer {
    pub peer_id: String,
    /// Session the offer was planned for; a replaced session drops it
    pub generation: u64,
}

/// Snapshot of one peer session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub peer_id: String,
    pub generation: u64,
    pub polite: bool,
    pub state: SignalingState,
    pub connection: PeerState,
    pub lanes: Vec<BoundLane>,
}

/// Observable effect of a transport event
#[derive(Debug, Clone, PartialEq)]
pub enum SessionUpdate {
    /// Message to forward to the relay
    Signal(SignalMessage),
    /// A remote lane was classified and stored
    Stream(RemoteLaneStream),
    /// Media path state changed
    Connection { peer_id: String, state: PeerState },
}

enum OfferStep {
    Answer(SessionDescription),
    Nothing,
    Recreate,
}

struct PeerEntry {
    machine: NegotiationStateMachine,
    connection: PeerState,
}

/// Manages the mesh of peer sessions for one call
pub struct PeerConnectionManager {
    local_id: String,
    room_id: String,
    factory: Arc<dyn TransportFactory>,
    events: SessionEventSender,
    sessions: HashMap<String, PeerEntry>,
    participants: BTreeSet<String>,
    remote_streams: BTreeMap<(String, StreamRole), RemoteLaneStream>,
    focused_peer: Option<String>,
    next_generation: u64,
}

impl PeerConnectionManager {
    /// Create a new peer manager
    ///
    /// # Arguments
    ///
    /// * `local_id` - Our identity in the room
    /// * `room_id` - Room stamped on outbound messages
    /// * `factory` - Creates a transport per session
    /// * `events` - Sink every session transport reports to
    pub fn new(
        local_id: impl Into<String>,
        room_id: impl Into<String>,
        factory: Arc<dyn TransportFactory>,
        events: SessionEventSender,
    ) -> Self {
        Self {
            local_id: local_id.into(),
            room_id: room_id.into(),
            factory,
            events,
            sessions: HashMap::new(),
            participants: BTreeSet::new(),
            remote_streams: BTreeMap::new(),
            focused_peer: None,
            next_generation: 0,
        }
    }

    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// A peer announced itself (`call-new-peer`)
    ///
    /// Any existing session with that peer is replaced, since the peer
    /// discarded its side when it rejoined. Returns the offer to schedule
    /// when this side should initiate.
    #[instrument(skip(self, sources), fields(local = %self.local_id))]
    pub async fn on_peer_joined(
        &mut self,
        peer_id: &str,
        sources: &LaneSources,
    ) -> Option<PendingOffer> {
        if peer_id == self.local_id {
            debug!("Ignoring our own join announcement");
            return None;
        }

        if !self.participants.insert(peer_id.to_string()) {
            info!("Peer {} rejoined, replacing its session", peer_id);
        } else {
            info!("Peer {} joined", peer_id);
        }
        self.clear_streams(peer_id);

        if let Err(e) = self.open_session(peer_id, sources).await {
            error!("Failed to open session with {}: {}", peer_id, e);
            return None;
        }

        let polite = is_polite(&self.local_id, peer_id);
        if !should_initiate(polite, sources.has_visual()) {
            debug!("Waiting for {} to initiate", peer_id);
            return None;
        }

        let generation = self.sessions.get(peer_id)?.machine.generation();
        Some(PendingOffer {
            peer_id: peer_id.to_string(),
            generation,
        })
    }

    /// Send a scheduled offer if its session is still current and Stable
    pub async fn fire_pending_offer(&mut self, pending: &PendingOffer) -> Option<SignalMessage> {
        let Some(entry) = self.sessions.get_mut(&pending.peer_id) else {
            debug!("Dropping scheduled offer: {} is gone", pending.peer_id);
            return None;
        };

        if entry.machine.generation() != pending.generation {
            debug!(
                "Dropping scheduled offer for superseded session {} with {}",
                pending.generation, pending.peer_id
            );
            return None;
        }

        if entry.machine.state() != SignalingState::Stable {
            debug!(
                "Dropping scheduled offer to {}: negotiation already under way",
                pending.peer_id
            );
            return None;
        }

        match entry.machine.create_offer().await {
            Ok(offer) => offer.map(|offer| self.offer_to(&pending.peer_id, offer)),
            Err(e) => {
                self.fail_session(&pending.peer_id, e).await;
                None
            }
        }
    }

    /// A peer left (`call-peer-left`); repeat calls are no-ops
    ///
    /// Returns whether anything was known about the peer.
    #[instrument(skip(self), fields(local = %self.local_id))]
    pub async fn on_peer_left(&mut self, peer_id: &str) -> bool {
        let known = self.participants.remove(peer_id);
        let had_session = self.discard_session(peer_id).await;
        self.clear_streams(peer_id);

        if self.focused_peer.as_deref() == Some(peer_id) {
            self.focused_peer = None;
        }

        if known || had_session {
            info!("Peer {} left", peer_id);
            true
        } else {
            debug!("Peer {} already gone", peer_id);
            false
        }
    }

    /// Route an offer, answer or candidate from `from`
    ///
    /// Returns the messages to send back.
    pub async fn on_signal(
        &mut self,
        from: &str,
        message: SignalMessage,
        sources: &LaneSources,
    ) -> Vec<SignalMessage> {
        if from == self.local_id {
            debug!("Ignoring {} echoed from ourselves", message.kind());
            return Vec::new();
        }

        if let Some(to) = message.recipient() {
            if to != self.local_id {
                debug!("Ignoring {} addressed to {}", message.kind(), to);
                return Vec::new();
            }
        }

        match message {
            SignalMessage::CallOffer { payload, .. } => {
                self.handle_offer(from, payload, sources).await
            }
            SignalMessage::CallAnswer { payload, .. } => {
                self.handle_answer(from, payload, sources).await
            }
            SignalMessage::CallIce { payload, .. } => {
                match self.sessions.get(from) {
                    Some(entry) => {
                        entry.machine.add_remote_candidate(payload).await;
                    }
                    None => debug!("Dropping ICE candidate from {}: no session", from),
                }
                Vec::new()
            }
            other => {
                debug!("Not a session message: {}", other.kind());
                Vec::new()
            }
        }
    }

    async fn handle_offer(
        &mut self,
        from: &str,
        offer: SessionDescription,
        sources: &LaneSources,
    ) -> Vec<SignalMessage> {
        if self.participants.insert(from.to_string()) {
            info!("Peer {} discovered through its offer", from);
        }

        if !self.sessions.contains_key(from) {
            if let Err(e) = self.open_session(from, sources).await {
                error!("Failed to open session with {}: {}", from, e);
                return Vec::new();
            }
        }

        let step = match self.accept_offer(from, offer.clone()).await {
            Ok(OfferStep::Recreate) => {
                info!("Recreating session with {} to accept its offer", from);
                self.clear_streams(from);
                if let Err(e) = self.open_session(from, sources).await {
                    error!("Failed to reopen session with {}: {}", from, e);
                    return Vec::new();
                }
                match self.accept_offer(from, offer).await {
                    Ok(OfferStep::Recreate) => {
                        warn!("Fresh session with {} rejected its offer", from);
                        self.discard_session(from).await;
                        return Vec::new();
                    }
                    other => other,
                }
            }
            other => other,
        };

        match step {
            Ok(OfferStep::Answer(answer)) => {
                let mut replies = vec![self.answer_to(from, answer)];
                replies.extend(self.renegotiate(from).await);
                replies
            }
            Ok(OfferStep::Nothing) | Ok(OfferStep::Recreate) => Vec::new(),
            Err(e) => {
                self.fail_session(from, e).await;
                Vec::new()
            }
        }
    }

    async fn accept_offer(&mut self, from: &str, offer: SessionDescription) -> Result<OfferStep> {
        let entry = self
            .sessions
            .get_mut(from)
            .ok_or_else(|| Error::PeerNotFound(from.to_string()))?;

        match entry.machine.apply_remote_description(offer).await? {
            ApplyOutcome::Success => Ok(OfferStep::Answer(entry.machine.create_answer().await?)),
            ApplyOutcome::Ignored => Ok(OfferStep::Nothing),
            ApplyOutcome::Recreate => Ok(OfferStep::Recreate),
        }
    }

    async fn handle_answer(
        &mut self,
        from: &str,
        answer: SessionDescription,
        sources: &LaneSources,
    ) -> Vec<SignalMessage> {
        let Some(entry) = self.sessions.get_mut(from) else {
            debug!("Dropping answer from {}: no session", from);
            return Vec::new();
        };

        match entry.machine.apply_remote_description(answer).await {
            Ok(ApplyOutcome::Success) => self.renegotiate(from).await.into_iter().collect(),
            Ok(ApplyOutcome::Ignored) => Vec::new(),
            Ok(ApplyOutcome::Recreate) => {
                info!("Recreating session with {} after a failed answer", from);
                self.clear_streams(from);
                if let Err(e) = self.open_session(from, sources).await {
                    error!("Failed to reopen session with {}: {}", from, e);
                    return Vec::new();
                }
                self.offer_now(from).await.into_iter().collect()
            }
            Err(e) => {
                self.fail_session(from, e).await;
                Vec::new()
            }
        }
    }

    async fn offer_now(&mut self, peer_id: &str) -> Option<SignalMessage> {
        let entry = self.sessions.get_mut(peer_id)?;
        match entry.machine.create_offer().await {
            Ok(offer) => offer.map(|offer| self.offer_to(peer_id, offer)),
            Err(e) => {
                self.fail_session(peer_id, e).await;
                None
            }
        }
    }

    async fn renegotiate(&mut self, peer_id: &str) -> Option<SignalMessage> {
        let entry = self.sessions.get_mut(peer_id)?;
        match entry.machine.renegotiate_if_needed().await {
            Ok(offer) => offer.map(|offer| self.offer_to(peer_id, offer)),
            Err(e) => {
                self.fail_session(peer_id, e).await;
                None
            }
        }
    }

    /// Apply a transport event; events from superseded sessions are dropped
    pub fn handle_session_event(&mut self, event: SessionEvent) -> Option<SessionUpdate> {
        let Some(entry) = self.sessions.get_mut(&event.peer_id) else {
            debug!("Dropping transport event for departed {}", event.peer_id);
            return None;
        };

        if entry.machine.generation() != event.generation {
            debug!(
                "Dropping transport event from superseded session {} with {}",
                event.generation, event.peer_id
            );
            return None;
        }

        match event.event {
            TransportEvent::LocalCandidate(candidate) => {
                Some(SessionUpdate::Signal(SignalMessage::CallIce {
                    room_id: self.room_id.clone(),
                    from: self.local_id.clone(),
                    to: event.peer_id,
                    payload: candidate,
                }))
            }
            TransportEvent::RemoteTrack(track) => {
                let role = role_for(&track.metadata);
                let stream = RemoteLaneStream {
                    peer_id: event.peer_id.clone(),
                    role,
                    track_id: track.track_id,
                    stream_id: track.stream_id,
                };
                debug!("Received {:?} stream from {}", role, event.peer_id);
                self.remote_streams
                    .insert((event.peer_id, role), stream.clone());
                Some(SessionUpdate::Stream(stream))
            }
            TransportEvent::ConnectionState(state) => {
                if state == PeerState::Failed {
                    warn!("Media path to {} failed", event.peer_id);
                }
                entry.connection = state;
                Some(SessionUpdate::Connection {
                    peer_id: event.peer_id,
                    state,
                })
            }
        }
    }

    /// Put `source` (or a placeholder) on `lane` of every session
    ///
    /// Returns the offers produced by sessions that were Stable.
    pub async fn apply_lane(&mut self, lane: Lane, source: Option<LocalSource>) -> Vec<SignalMessage> {
        let mut peers: Vec<String> = self.sessions.keys().cloned().collect();
        peers.sort();

        let mut offers = Vec::new();
        for peer_id in peers {
            let Some(entry) = self.sessions.get_mut(&peer_id) else {
                continue;
            };
            match entry.machine.replace_lane(lane, source.clone()).await {
                Ok(Some(offer)) => offers.push(self.offer_to(&peer_id, offer)),
                Ok(None) => debug!("Deferred {} lane renegotiation with {}", lane, peer_id),
                Err(e) => warn!("Failed to update {} lane for {}: {}", lane, peer_id, e),
            }
        }
        offers
    }

    /// Close every session and drop received streams
    ///
    /// With `retain_participants` the peer set survives, so a UI can show
    /// "waiting" while the call reconnects.
    pub async fn close_all(&mut self, retain_participants: bool) {
        let peers: Vec<String> = self.sessions.keys().cloned().collect();
        for peer_id in peers {
            self.discard_session(&peer_id).await;
        }

        self.remote_streams.clear();
        self.focused_peer = None;
        if !retain_participants {
            self.participants.clear();
        }
    }

    /// Select the peer the UI shows large; only known participants qualify
    pub fn set_focused_peer(&mut self, peer_id: Option<String>) -> bool {
        match peer_id {
            Some(peer_id) if !self.participants.contains(&peer_id) => false,
            peer_id => {
                self.focused_peer = peer_id;
                true
            }
        }
    }

    pub fn focused_peer(&self) -> Option<&str> {
        self.focused_peer.as_deref()
    }

    /// Known peers, sorted
    pub fn participants(&self) -> Vec<String> {
        self.participants.iter().cloned().collect()
    }

    pub fn is_participant(&self, peer_id: &str) -> bool {
        self.participants.contains(peer_id)
    }

    /// Received streams ordered by peer then role
    pub fn remote_streams(&self) -> Vec<RemoteLaneStream> {
        self.remote_streams.values().cloned().collect()
    }

    pub fn has_session(&self, peer_id: &str) -> bool {
        self.sessions.contains_key(peer_id)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn session(&self, peer_id: &str) -> Option<SessionInfo> {
        self.sessions.get(peer_id).map(|entry| SessionInfo {
            peer_id: peer_id.to_string(),
            generation: entry.machine.generation(),
            polite: entry.machine.is_polite(),
            state: entry.machine.state(),
            connection: entry.connection,
            lanes: entry.machine.lanes(),
        })
    }

    /// All sessions ordered by peer
    pub fn sessions(&self) -> Vec<SessionInfo> {
        let mut peers: Vec<&String> = self.sessions.keys().collect();
        peers.sort();
        peers
            .into_iter()
            .filter_map(|peer_id| self.session(peer_id))
            .collect()
    }

    async fn open_session(&mut self, peer_id: &str, sources: &LaneSources) -> Result<()> {
        // The old session is fully closed before its replacement exists
        self.discard_session(peer_id).await;

        self.next_generation += 1;
        let machine = NegotiationStateMachine::open(
            self.factory.as_ref(),
            &self.local_id,
            peer_id,
            self.next_generation,
            sources,
            self.events.clone(),
        )
        .await?;

        self.sessions.insert(
            peer_id.to_string(),
            PeerEntry {
                machine,
                connection: PeerState::New,
            },
        );
        Ok(())
    }

    async fn discard_session(&mut self, peer_id: &str) -> bool {
        match self.sessions.remove(peer_id) {
            Some(mut entry) => {
                entry.machine.close().await;
                true
            }
            None => false,
        }
    }

    async fn fail_session(&mut self, peer_id: &str, e: Error) {
        error!("Session with {} failed: {}", peer_id, e);
        self.discard_session(peer_id).await;
        self.clear_streams(peer_id);
    }

    fn clear_streams(&mut self, peer_id: &str) {
        self.remote_streams.retain(|(peer, _), _| peer != peer_id);
    }

    fn offer_to(&self, peer_id: &str, offer: SessionDescription) -> SignalMessage {
        SignalMessage::CallOffer {
            room_id: self.room_id.clone(),
            from: self.local_id.clone(),
            to: peer_id.to_string(),
            payload: offer,
        }
    }

    fn answer_to(&self, peer_id: &str, answer: SessionDescription) -> SignalMessage {
        SignalMessage::CallAnswer {
            room_id: self.room_id.clone(),
            from: self.local_id.clone(),
            to: peer_id.to_string(),
            payload: answer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureClass;
    use crate::media::MediaKind;
    use crate::negotiation::loopback::{sdp_lanes, LoopbackFactory};
    use crate::negotiation::RemoteTrack;
    use crate::media::TrackMetadata;
    use tokio::sync::mpsc;

    fn manager(local: &str) -> (PeerConnectionManager, LoopbackFactory, mpsc::UnboundedReceiver<SessionEvent>) {
        let factory = LoopbackFactory::new();
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = PeerConnectionManager::new(local, "r1", Arc::new(factory.clone()), tx);
        (manager, factory, rx)
    }

    fn offer_payload(message: &SignalMessage) -> SessionDescription {
        match message {
            SignalMessage::CallOffer { payload, .. } => payload.clone(),
            other => panic!("expected offer, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_impolite_side_initiates() {
        let (mut bob, _, _rx) = manager("bob");
        let pending = bob
            .on_peer_joined("alice", &LaneSources::default())
            .await
            .unwrap();
        assert_eq!(pending.peer_id, "alice");

        let offer = bob.fire_pending_offer(&pending).await.unwrap();
        assert_eq!(offer.recipient(), Some("alice"));
        assert_eq!(bob.session("alice").unwrap().state, SignalingState::HaveLocalOffer);
    }

    #[tokio::test]
    async fn test_polite_side_waits_unless_sending_visual() {
        let (mut alice, _, _rx) = manager("alice");
        assert!(alice
            .on_peer_joined("bob", &LaneSources::default())
            .await
            .is_none());
        assert!(alice.has_session("bob"));

        let sources = LaneSources {
            video: Some(LocalSource::capture(Lane::Video, "cam")),
            ..Default::default()
        };
        let pending = alice.on_peer_joined("carol", &sources).await;
        assert!(pending.is_some());
    }

    #[tokio::test]
    async fn test_rejoin_replaces_session() {
        let (mut bob, factory, _rx) = manager("bob");
        let first = bob
            .on_peer_joined("alice", &LaneSources::default())
            .await
            .unwrap();
        let second = bob
            .on_peer_joined("alice", &LaneSources::default())
            .await
            .unwrap();

        assert_eq!(factory.created_count("alice"), 2);
        assert!(factory.sessions("alice")[0].is_closed());
        assert_eq!(bob.session_count(), 1);

        // The offer planned for the old session is dropped
        assert!(bob.fire_pending_offer(&first).await.is_none());
        assert!(bob.fire_pending_offer(&second).await.is_some());
    }

    #[tokio::test]
    async fn test_pending_offer_dropped_when_not_stable() {
        let (mut bob, _, _rx) = manager("bob");
        let pending = bob
            .on_peer_joined("alice", &LaneSources::default())
            .await
            .unwrap();
        assert!(bob.fire_pending_offer(&pending).await.is_some());
        assert!(bob.fire_pending_offer(&pending).await.is_none());
    }

    #[tokio::test]
    async fn test_offer_creates_session_and_answers() {
        let (mut alice, _, _rx) = manager("alice");
        let (mut bob, _, _rx2) = manager("bob");

        let pending = bob
            .on_peer_joined("alice", &LaneSources::default())
            .await
            .unwrap();
        let offer = bob.fire_pending_offer(&pending).await.unwrap();

        let replies = alice.on_signal("bob", offer, &LaneSources::default()).await;
        assert_eq!(replies.len(), 1);
        assert!(matches!(replies[0], SignalMessage::CallAnswer { .. }));
        assert!(alice.is_participant("bob"));

        let replies = bob
            .on_signal("alice", replies[0].clone(), &LaneSources::default())
            .await;
        assert!(replies.is_empty());
        assert_eq!(alice.session("bob").unwrap().state, SignalingState::Stable);
        assert_eq!(bob.session("alice").unwrap().state, SignalingState::Stable);
    }

    #[tokio::test]
    async fn test_misaddressed_and_echoed_messages_ignored() {
        let (mut alice, _, _rx) = manager("alice");
        let offer = SignalMessage::CallOffer {
            room_id: "r1".to_string(),
            from: "bob".to_string(),
            to: "carol".to_string(),
            payload: SessionDescription::offer("v=0\nm=audio 0 a live\n"),
        };
        assert!(alice
            .on_signal("bob", offer.clone(), &LaneSources::default())
            .await
            .is_empty());
        assert!(alice
            .on_signal("alice", offer, &LaneSources::default())
            .await
            .is_empty());
        assert_eq!(alice.session_count(), 0);
    }

    #[tokio::test]
    async fn test_recreate_on_structural_offer_failure() {
        let (mut alice, factory, _rx) = manager("alice");
        let (mut bob, _, _rx2) = manager("bob");
        let sources = LaneSources::default();

        alice.on_peer_joined("bob", &sources).await;
        let pending = bob.on_peer_joined("alice", &sources).await.unwrap();
        let offer = bob.fire_pending_offer(&pending).await.unwrap();

        factory.fail_next_remote_description("bob", FailureClass::InvalidState);
        let replies = alice.on_signal("bob", offer, &sources).await;

        assert_eq!(factory.created_count("bob"), 2);
        assert!(factory.sessions("bob")[0].is_closed());
        assert_eq!(replies.len(), 1);
        assert!(matches!(replies[0], SignalMessage::CallAnswer { .. }));
    }

    #[tokio::test]
    async fn test_recreate_on_structural_answer_failure_reoffers() {
        let (mut alice, _, _rx) = manager("alice");
        let (mut bob, factory, _rx2) = manager("bob");
        let sources = LaneSources::default();

        let pending = bob.on_peer_joined("alice", &sources).await.unwrap();
        let offer = bob.fire_pending_offer(&pending).await.unwrap();
        let answer = alice.on_signal("bob", offer, &sources).await.remove(0);

        factory.fail_next_remote_description("alice", FailureClass::RoleConflict);
        let replies = bob.on_signal("alice", answer, &sources).await;

        assert_eq!(factory.created_count("alice"), 2);
        assert_eq!(replies.len(), 1);
        assert!(matches!(replies[0], SignalMessage::CallOffer { .. }));
        assert_eq!(bob.session("alice").unwrap().generation, 2);
    }

    #[tokio::test]
    async fn test_fatal_failure_discards_session() {
        let (mut alice, factory, _rx) = manager("alice");
        let (mut bob, _, _rx2) = manager("bob");
        let sources = LaneSources::default();

        let pending = bob.on_peer_joined("alice", &sources).await.unwrap();
        let offer = bob.fire_pending_offer(&pending).await.unwrap();

        alice.on_peer_joined("bob", &sources).await;
        factory.fail_next_remote_description("bob", FailureClass::Other);
        assert!(alice.on_signal("bob", offer, &sources).await.is_empty());
        assert!(!alice.has_session("bob"));
        assert!(alice.is_participant("bob"));
    }

    #[tokio::test]
    async fn test_peer_left_is_idempotent() {
        let (mut alice, factory, _rx) = manager("alice");
        alice.on_peer_joined("bob", &LaneSources::default()).await;
        assert!(alice.set_focused_peer(Some("bob".to_string())));

        assert!(alice.on_peer_left("bob").await);
        assert!(factory.latest("bob").unwrap().is_closed());
        assert!(alice.focused_peer().is_none());
        assert!(alice.participants().is_empty());

        assert!(!alice.on_peer_left("bob").await);
        assert!(!alice.on_peer_left("nobody").await);
        assert_eq!(alice.session_count(), 0);
    }

    #[tokio::test]
    async fn test_focus_requires_participant() {
        let (mut alice, _, _rx) = manager("alice");
        assert!(!alice.set_focused_peer(Some("ghost".to_string())));
        assert!(alice.set_focused_peer(None));
    }

    #[tokio::test]
    async fn test_session_events_classified_and_filtered() {
        let (mut alice, _, _rx) = manager("alice");
        alice.on_peer_joined("bob", &LaneSources::default()).await;
        let generation = alice.session("bob").unwrap().generation;

        let track = |id: &str, kind| RemoteTrack {
            track_id: id.to_string(),
            stream_id: "s".to_string(),
            metadata: TrackMetadata::new(kind, id),
        };

        let update = alice.handle_session_event(SessionEvent {
            peer_id: "bob".to_string(),
            generation,
            event: TransportEvent::RemoteTrack(track("screen-1", MediaKind::Video)),
        });
        assert!(matches!(
            update,
            Some(SessionUpdate::Stream(RemoteLaneStream { role: StreamRole::Screen, .. }))
        ));

        alice.handle_session_event(SessionEvent {
            peer_id: "bob".to_string(),
            generation,
            event: TransportEvent::RemoteTrack(track("camera-1", MediaKind::Video)),
        });
        assert_eq!(alice.remote_streams().len(), 2);

        // Stale generation
        assert!(alice
            .handle_session_event(SessionEvent {
                peer_id: "bob".to_string(),
                generation: generation + 10,
                event: TransportEvent::RemoteTrack(track("camera-2", MediaKind::Video)),
            })
            .is_none());

        alice.on_peer_left("bob").await;
        assert!(alice.remote_streams().is_empty());
    }

    #[tokio::test]
    async fn test_apply_lane_offers_to_stable_sessions() {
        let (mut alice, _, _rx) = manager("alice");
        let (mut bob, _, _rx2) = manager("bob");
        let sources = LaneSources::default();

        alice.on_peer_joined("bob", &sources).await;
        alice.on_peer_joined("carol", &sources).await;

        // Put carol's session mid-negotiation
        let pending = PendingOffer {
            peer_id: "carol".to_string(),
            generation: alice.session("carol").unwrap().generation,
        };
        assert!(alice.fire_pending_offer(&pending).await.is_some());

        let camera = LocalSource::capture(Lane::Video, "cam");
        let offers = alice.apply_lane(Lane::Video, Some(camera.clone())).await;
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].recipient(), Some("bob"));

        let lanes = sdp_lanes(&offer_payload(&offers[0]).sdp);
        assert_eq!(lanes[1].track_id, Lane::Video.wire_id());
        assert!(!lanes[1].placeholder);

        for session in alice.sessions() {
            assert_eq!(session.lanes.len(), 3);
            assert_eq!(session.lanes[1].track_id, camera.id());
        }

        // bob can accept it
        let replies = bob.on_signal("alice", offers[0].clone(), &sources).await;
        assert!(matches!(replies[0], SignalMessage::CallAnswer { .. }));
    }

    #[tokio::test]
    async fn test_close_all_retains_participants() {
        let (mut alice, factory, _rx) = manager("alice");
        alice.on_peer_joined("bob", &LaneSources::default()).await;
        alice.on_peer_joined("carol", &LaneSources::default()).await;

        alice.close_all(true).await;
        assert_eq!(alice.session_count(), 0);
        assert_eq!(alice.participants(), vec!["bob".to_string(), "carol".to_string()]);
        assert!(factory.latest("bob").unwrap().is_closed());

        alice.close_all(false).await;
        assert!(alice.participants().is_empty());
    }
}
