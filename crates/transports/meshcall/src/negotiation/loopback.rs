//! In-memory session transport
//!
//! Models the signaling-state rules of a real peer connection without any
//! networking. Descriptions are a tiny line format with one `m=` line per
//! lane, so tests can check lane order and content of what was offered:
//!
//! ```text
//! v=0
//! o=- <session> <version>
//! m=audio 0 microphone placeholder
//! m=video 1 camera live
//! m=video 2 screen placeholder
//! ```
//!
//! Track ids are the lanes' fixed wire ids, as on a real peer connection
//! where a sender keeps its first track id. Receiving a description
//! announces each lane once as a remote track, placeholder or not, since
//! placeholders send frames too. The `live` flag only exists here so tests
//! can see what a receiver would be rendering.

use super::transport::{
    PeerState, RemoteTrack, SessionEvent, SessionEventSender, SessionTransport, SignalingState,
    TransportEvent, TransportFactory,
};
use crate::error::{FailureClass, TransportError, TransportResult};
use crate::media::{Lane, LocalSource, MediaKind, TrackMetadata};
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// One `m=` line of a loopback description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdpLane {
    pub kind: MediaKind,
    pub mid: usize,
    pub track_id: String,
    pub placeholder: bool,
}

/// Parse the lanes of a loopback description
pub fn sdp_lanes(sdp: &str) -> Vec<SdpLane> {
    sdp.lines()
        .filter_map(|line| line.strip_prefix("m="))
        .filter_map(|rest| {
            let mut parts = rest.split_whitespace();
            let kind = match parts.next()? {
                "audio" => MediaKind::Audio,
                "video" => MediaKind::Video,
                _ => return None,
            };
            let mid = parts.next()?.parse().ok()?;
            let track_id = parts.next()?.to_string();
            let placeholder = parts.next()? == "placeholder";
            Some(SdpLane {
                kind,
                mid,
                track_id,
                placeholder,
            })
        })
        .collect()
}

/// Failures to inject into transports created for a peer
#[derive(Debug, Default)]
struct Faults {
    remote_description: HashMap<String, FailureClass>,
    rollback: HashSet<String>,
}

/// In-memory transport
#[derive(Clone)]
pub struct LoopbackTransport {
    inner: Arc<Inner>,
}

struct Inner {
    peer_id: String,
    generation: u64,
    session_id: String,
    events: Option<SessionEventSender>,
    faults: Arc<Mutex<Faults>>,
    state: Mutex<State>,
}

struct State {
    signaling: SignalingState,
    lanes: Vec<(Lane, String, bool)>,
    version: u64,
    remote_applied: bool,
    connected: bool,
    announced: HashSet<usize>,
    remote_lanes: Vec<SdpLane>,
    candidates_added: usize,
    local_description: Option<SessionDescription>,
}

impl LoopbackTransport {
    fn build(
        peer_id: &str,
        generation: u64,
        events: Option<SessionEventSender>,
        faults: Arc<Mutex<Faults>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                peer_id: peer_id.to_string(),
                generation,
                session_id: uuid::Uuid::new_v4().simple().to_string(),
                events,
                faults,
                state: Mutex::new(State {
                    signaling: SignalingState::Stable,
                    lanes: Vec::new(),
                    version: 0,
                    remote_applied: false,
                    connected: false,
                    announced: HashSet::new(),
                    remote_lanes: Vec::new(),
                    candidates_added: 0,
                    local_description: None,
                }),
            }),
        }
    }

    /// Transport that reports no events
    pub fn detached(peer_id: &str) -> Self {
        Self::build(peer_id, 0, None, Arc::new(Mutex::new(Faults::default())))
    }

    pub fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }

    pub fn generation(&self) -> u64 {
        self.inner.generation
    }

    /// Lanes of the last remote description applied
    pub fn remote_lanes(&self) -> Vec<SdpLane> {
        self.inner.state.lock().remote_lanes.clone()
    }

    /// Whether the remote side is sending real content on `lane`
    pub fn receiving_live(&self, lane: Lane) -> bool {
        self.inner
            .state
            .lock()
            .remote_lanes
            .get(lane.index())
            .is_some_and(|l| !l.placeholder)
    }

    /// Ids of the sources bound to the lanes, in order
    pub fn lane_track_ids(&self) -> Vec<String> {
        self.inner
            .state
            .lock()
            .lanes
            .iter()
            .map(|(_, id, _)| id.clone())
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().signaling == SignalingState::Closed
    }

    /// Remote candidates accepted so far
    pub fn candidates_added(&self) -> usize {
        self.inner.state.lock().candidates_added
    }

    /// Last description installed locally
    pub fn local_description(&self) -> Option<SessionDescription> {
        self.inner.state.lock().local_description.clone()
    }

    fn emit(&self, event: TransportEvent) {
        if let Some(events) = &self.inner.events {
            let _ = events.send(SessionEvent {
                peer_id: self.inner.peer_id.clone(),
                generation: self.inner.generation,
                event,
            });
        }
    }

    fn render(&self, state: &mut State) -> String {
        state.version += 1;
        let mut sdp = format!("v=0\no=- {} {}\n", self.inner.session_id, state.version);
        for (lane, _, placeholder) in &state.lanes {
            sdp.push_str(&format!(
                "m={} {} {} {}\n",
                lane.kind(),
                lane.index(),
                lane.wire_id(),
                if *placeholder { "placeholder" } else { "live" }
            ));
        }
        sdp
    }

    fn local_candidate(&self, version: u64) -> IceCandidate {
        IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
                version,
                40000 + version
            ),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }

    fn settle(&self, state: &mut State) -> Option<TransportEvent> {
        if state.connected {
            return None;
        }
        state.connected = true;
        Some(TransportEvent::ConnectionState(PeerState::Connected))
    }
}

fn invalid_state(operation: &str, state: SignalingState) -> TransportError {
    TransportError::new(
        FailureClass::InvalidState,
        format!("InvalidStateError: cannot {} in signaling state {:?}", operation, state),
    )
}

#[async_trait]
impl SessionTransport for LoopbackTransport {
    fn signaling_state(&self) -> SignalingState {
        self.inner.state.lock().signaling
    }

    async fn add_lane(&self, lane: Lane, source: &LocalSource) -> TransportResult<()> {
        let mut state = self.inner.state.lock();
        if state.signaling == SignalingState::Closed {
            return Err(invalid_state("add a lane", state.signaling));
        }
        if state.lanes.len() != lane.index() {
            return Err(TransportError::new(
                FailureClass::Other,
                format!("{} lane added at position {}", lane, state.lanes.len()),
            ));
        }
        state
            .lanes
            .push((lane, source.id().to_string(), source.is_placeholder()));
        Ok(())
    }

    async fn replace_lane(&self, lane: Lane, source: &LocalSource) -> TransportResult<()> {
        let mut state = self.inner.state.lock();
        if state.signaling == SignalingState::Closed {
            return Err(invalid_state("replace a lane", state.signaling));
        }
        let slot = state.lanes.get_mut(lane.index()).ok_or_else(|| {
            TransportError::new(FailureClass::Other, format!("{} lane not bound", lane))
        })?;
        *slot = (lane, source.id().to_string(), source.is_placeholder());
        Ok(())
    }

    async fn create_offer(&self) -> TransportResult<SessionDescription> {
        let (offer, candidate) = {
            let mut state = self.inner.state.lock();
            if state.signaling != SignalingState::Stable {
                return Err(invalid_state("create an offer", state.signaling));
            }
            state.signaling = SignalingState::HaveLocalOffer;
            let offer = SessionDescription::offer(self.render(&mut state));
            state.local_description = Some(offer.clone());
            (offer, self.local_candidate(state.version))
        };

        self.emit(TransportEvent::LocalCandidate(candidate));
        Ok(offer)
    }

    async fn create_answer(&self) -> TransportResult<SessionDescription> {
        let (answer, candidate, connected) = {
            let mut state = self.inner.state.lock();
            if state.signaling != SignalingState::HaveRemoteOffer {
                return Err(invalid_state("create an answer", state.signaling));
            }
            state.signaling = SignalingState::Stable;
            let answer = SessionDescription::answer(self.render(&mut state));
            state.local_description = Some(answer.clone());
            let connected = self.settle(&mut state);
            (answer, self.local_candidate(state.version), connected)
        };

        self.emit(TransportEvent::LocalCandidate(candidate));
        if let Some(event) = connected {
            self.emit(event);
        }
        Ok(answer)
    }

    async fn set_remote_description(&self, description: SessionDescription) -> TransportResult<()> {
        let injected = self
            .inner
            .faults
            .lock()
            .remote_description
            .remove(&self.inner.peer_id);
        if let Some(class) = injected {
            return Err(TransportError::new(
                class,
                format!("injected {:?} failure", class),
            ));
        }

        let lanes = sdp_lanes(&description.sdp);
        if lanes.is_empty() {
            return Err(TransportError::new(
                FailureClass::Other,
                "description has no media sections",
            ));
        }

        let mut events = Vec::new();
        {
            let mut state = self.inner.state.lock();
            match (description.kind, state.signaling) {
                (SdpKind::Offer, SignalingState::Stable) => {
                    state.signaling = SignalingState::HaveRemoteOffer;
                }
                (SdpKind::Answer, SignalingState::HaveLocalOffer) => {
                    state.signaling = SignalingState::Stable;
                    events.extend(self.settle(&mut state));
                }
                (kind, current) => {
                    return Err(invalid_state(
                        &format!("set remote {:?}", kind).to_lowercase(),
                        current,
                    ));
                }
            }
            state.remote_applied = true;

            for lane in &lanes {
                if state.announced.insert(lane.mid) {
                    events.push(TransportEvent::RemoteTrack(RemoteTrack {
                        metadata: TrackMetadata::new(lane.kind, lane.track_id.clone()),
                        track_id: lane.track_id.clone(),
                        stream_id: self.inner.peer_id.clone(),
                    }));
                }
            }
            state.remote_lanes = lanes;
        }

        for event in events {
            self.emit(event);
        }
        Ok(())
    }

    async fn rollback(&self) -> TransportResult<()> {
        if self.inner.faults.lock().rollback.remove(&self.inner.peer_id) {
            return Err(TransportError::new(
                FailureClass::InvalidState,
                "injected rollback failure",
            ));
        }

        let mut state = self.inner.state.lock();
        match state.signaling {
            SignalingState::HaveLocalOffer | SignalingState::HaveRemoteOffer => {
                state.signaling = SignalingState::Stable;
                Ok(())
            }
            current => Err(invalid_state("rollback", current)),
        }
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> TransportResult<()> {
        let mut state = self.inner.state.lock();
        if state.signaling == SignalingState::Closed {
            return Err(invalid_state("add a candidate", state.signaling));
        }
        if !state.remote_applied {
            return Err(TransportError::new(
                FailureClass::Other,
                "remote description not set",
            ));
        }
        state.candidates_added += 1;
        Ok(())
    }

    async fn close(&self) -> TransportResult<()> {
        {
            let mut state = self.inner.state.lock();
            if state.signaling == SignalingState::Closed {
                return Ok(());
            }
            state.signaling = SignalingState::Closed;
        }
        self.emit(TransportEvent::ConnectionState(PeerState::Closed));
        Ok(())
    }
}

/// Creates [`LoopbackTransport`]s and keeps every one it created
#[derive(Clone, Default)]
pub struct LoopbackFactory {
    created: Arc<Mutex<Vec<LoopbackTransport>>>,
    faults: Arc<Mutex<Faults>>,
}

impl LoopbackFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// All transports created for `peer_id`, oldest first
    pub fn sessions(&self, peer_id: &str) -> Vec<LoopbackTransport> {
        self.created
            .lock()
            .iter()
            .filter(|t| t.peer_id() == peer_id)
            .cloned()
            .collect()
    }

    /// Most recent transport created for `peer_id`
    pub fn latest(&self, peer_id: &str) -> Option<LoopbackTransport> {
        self.sessions(peer_id).pop()
    }

    /// Number of transports created for `peer_id`
    pub fn created_count(&self, peer_id: &str) -> usize {
        self.sessions(peer_id).len()
    }

    /// Make the next remote description applied on a `peer_id` session fail
    pub fn fail_next_remote_description(&self, peer_id: &str, class: FailureClass) {
        self.faults
            .lock()
            .remote_description
            .insert(peer_id.to_string(), class);
    }

    /// Make the next rollback on a `peer_id` session fail
    pub fn fail_next_rollback(&self, peer_id: &str) {
        self.faults.lock().rollback.insert(peer_id.to_string());
    }
}

#[async_trait]
impl TransportFactory for LoopbackFactory {
    async fn create(
        &self,
        peer_id: &str,
        generation: u64,
        events: SessionEventSender,
    ) -> Result<Box<dyn SessionTransport>> {
        let transport =
            LoopbackTransport::build(peer_id, generation, Some(events), Arc::clone(&self.faults));
        self.created.lock().push(transport.clone());
        Ok(Box::new(transport))
    }
}
