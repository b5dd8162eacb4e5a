//! WebRTC session transport (webrtc-rs)

use super::transport::{
    PeerState, RemoteTrack, SessionEvent, SessionEventSender, SessionTransport, SignalingState,
    TransportEvent, TransportFactory,
};
use crate::config::CallConfig;
use crate::error::{TransportError, TransportResult};
use crate::media::{Lane, LocalSource, MediaKind, TrackMetadata};
use crate::signaling::{IceCandidate, SdpKind, SessionDescription};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Opus comfort-noise frame (TOC for 20ms CELT FB, near-silent payload)
const OPUS_SILENCE: [u8; 3] = [0xF8, 0xFF, 0xFE];

/// Audio placeholder frame period
const SILENCE_FRAME: Duration = Duration::from_millis(20);

/// VP8 key frame of a 320x240 all-black picture
const BLACK_KEYFRAME: [u8; 164] = [
    0x94, 0x11, 0x00, 0x9d, 0x01, 0x2a, 0x40, 0x01, 0xf0, 0x00, 0x00, 0x00,
    0x96, 0x06, 0xee, 0x17, 0x76, 0x11, 0xb4, 0x77, 0x06, 0x4f, 0x1a, 0x6d,
    0x13, 0x1a, 0x6d, 0x13, 0x1a, 0x6d, 0x13, 0x1a, 0x6d, 0x13, 0x1a, 0x6d,
    0x13, 0x1a, 0x6d, 0x13, 0x1a, 0x6d, 0x13, 0x1a, 0x6d, 0x13, 0x1a, 0x6d,
    0x13, 0x1a, 0x6d, 0x13, 0x1a, 0x6d, 0x13, 0x1a, 0x6d, 0x13, 0x1a, 0x6d,
    0x13, 0x1a, 0x6d, 0x13, 0x1a, 0x6d, 0x13, 0x1a, 0x6d, 0x13, 0x1a, 0x6d,
    0x13, 0x1a, 0x6d, 0x13, 0x1a, 0x6d, 0x13, 0x1a, 0x6d, 0x13, 0x1a, 0x6d,
    0x13, 0x1a, 0x6d, 0x13, 0x1a, 0x6d, 0x13, 0x1a, 0x6d, 0x13, 0x1a, 0x6d,
    0x13, 0x1a, 0x6d, 0x13, 0x1a, 0x6d, 0x13, 0x1a, 0x6d, 0x13, 0x1a, 0x6d,
    0x13, 0x1a, 0x6d, 0x13, 0x1a, 0x6d, 0x13, 0x1a, 0x6d, 0x13, 0x1a, 0x6d,
    0x13, 0x1a, 0x6d, 0x13, 0x1a, 0x6d, 0x13, 0x1a, 0x6d, 0x13, 0x1a, 0x6d,
    0x13, 0x1a, 0x6d, 0x13, 0x1a, 0x6d, 0x13, 0x1a, 0x6d, 0x13, 0x1a, 0x6d,
    0x13, 0x1a, 0x6d, 0x0e, 0x00, 0x00, 0xfe, 0xff, 0xb4, 0x0d, 0x00, 0x00,
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
];

/// Video placeholder frame period
const BLACK_FRAME: Duration = Duration::from_secs(1);

/// Builds one [`RtcSession`] per peer from the call's ICE settings
#[derive(Debug, Clone)]
pub struct RtcTransportFactory {
    ice_servers: Vec<RTCIceServer>,
    ice_candidate_pool_size: u8,
}

impl RtcTransportFactory {
    pub fn new(config: &CallConfig) -> Self {
        let ice_servers = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(config.turn_servers.iter().map(|turn| RTCIceServer {
                urls: vec![turn.url.clone()],
                username: turn.username.clone(),
                credential: turn.credential.clone(),
                ..Default::default()
            }))
            .collect();

        Self {
            ice_servers,
            ice_candidate_pool_size: config.ice_candidate_pool_size,
        }
    }

    async fn peer_connection(&self) -> webrtc::error::Result<RTCPeerConnection> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let interceptor_registry =
            register_default_interceptors(Default::default(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ice_candidate_pool_size: self.ice_candidate_pool_size,
            bundle_policy: RTCBundlePolicy::MaxBundle,
            rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
            ..Default::default()
        };

        api.new_peer_connection(rtc_config).await
    }
}

#[async_trait]
impl TransportFactory for RtcTransportFactory {
    async fn create(
        &self,
        peer_id: &str,
        generation: u64,
        events: SessionEventSender,
    ) -> Result<Box<dyn SessionTransport>> {
        let session = RtcSession::new(peer_id, generation, self, events).await?;
        Ok(Box::new(session))
    }
}

struct RtcLane {
    lane: Lane,
    source: LocalSource,
    sender: Arc<RTCRtpSender>,
    pump: Option<JoinHandle<()>>,
}

impl RtcLane {
    fn stop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// One `RTCPeerConnection` with three fixed senders
///
/// Each sender's track id is its lane's [`Lane::wire_id`], so receivers see
/// the same id whatever source the lane carries.
///
/// webrtc-rs cannot roll back a local offer. [`SessionTransport::rollback`]
/// instead swaps in a fresh peer connection carrying the same lane content,
/// which is indistinguishable to the remote side since it never accepted the
/// abandoned offer.
pub struct RtcSession {
    peer_id: String,
    stream_id: String,
    settings: RtcTransportFactory,
    tag: EventTag,
    peer_connection: Mutex<Arc<RTCPeerConnection>>,
    lanes: Mutex<Vec<RtcLane>>,
}

impl RtcSession {
    /// Create a peer connection for `peer_id` and wire its callbacks to `events`
    #[instrument(skip(factory, events), fields(peer_id = %peer_id))]
    pub async fn new(
        peer_id: &str,
        generation: u64,
        factory: &RtcTransportFactory,
        events: SessionEventSender,
    ) -> Result<Self> {
        let connection_id = uuid::Uuid::new_v4().to_string();
        info!(
            "Creating peer connection: peer_id={}, generation={}, connection_id={}",
            peer_id, generation, connection_id
        );

        let peer_connection = Arc::new(factory.peer_connection().await.map_err(|e| {
            Error::WebRtcError(format!("Failed to create peer connection: {}", e))
        })?);

        let tag = EventTag {
            peer_id: peer_id.to_string(),
            generation,
            events,
        };
        Self::install_handlers(&peer_connection, tag.clone());

        Ok(Self {
            peer_id: peer_id.to_string(),
            stream_id: format!("meshcall-{}", connection_id),
            settings: factory.clone(),
            tag,
            peer_connection: Mutex::new(peer_connection),
            lanes: Mutex::new(Vec::new()),
        })
    }

    /// Current peer connection
    fn connection(&self) -> Arc<RTCPeerConnection> {
        Arc::clone(&self.peer_connection.lock())
    }

    fn install_handlers(peer_connection: &RTCPeerConnection, tag: EventTag) {
        let candidate_tag = tag.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tag = candidate_tag.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => tag.emit(TransportEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                        username_fragment: init.username_fragment,
                    })),
                    Err(e) => warn!("Failed to serialize local candidate: {}", e),
                }
            })
        }));

        let track_tag = tag.clone();
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let tag = track_tag.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => MediaKind::Audio,
                        RTPCodecType::Video => MediaKind::Video,
                        _ => return,
                    };
                    let track_id = track.id();
                    debug!("Remote {} track {} from {}", kind, track_id, tag.peer_id);
                    tag.emit(TransportEvent::RemoteTrack(RemoteTrack {
                        metadata: TrackMetadata::new(kind, track_id.clone()),
                        stream_id: track.stream_id(),
                        track_id,
                    }));
                })
            },
        ));

        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let tag = tag.clone();
                Box::pin(async move {
                    let state = match state {
                        RTCPeerConnectionState::New => PeerState::New,
                        RTCPeerConnectionState::Connecting => PeerState::Connecting,
                        RTCPeerConnectionState::Connected => PeerState::Connected,
                        RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
                        RTCPeerConnectionState::Failed => PeerState::Failed,
                        RTCPeerConnectionState::Closed => PeerState::Closed,
                        _ => return,
                    };
                    tag.emit(TransportEvent::ConnectionState(state));
                })
            },
        ));
    }

    /// Stop a retired peer connection from reporting into the session
    fn detach_handlers(peer_connection: &RTCPeerConnection) {
        peer_connection.on_ice_candidate(Box::new(|_: Option<RTCIceCandidate>| {
            Box::pin(async {})
        }));
        peer_connection.on_track(Box::new(
            |_: Arc<TrackRemote>, _: Arc<RTCRtpReceiver>, _: Arc<RTCRtpTransceiver>| {
                Box::pin(async {})
            },
        ));
        peer_connection.on_peer_connection_state_change(Box::new(
            |_: RTCPeerConnectionState| Box::pin(async {}),
        ));
    }

    fn local_track(&self, lane: Lane) -> Arc<TrackLocalStaticSample> {
        let capability = match lane.kind() {
            MediaKind::Audio => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            MediaKind::Video => RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_owned(),
                clock_rate: 90000,
                ..Default::default()
            },
        };

        Arc::new(TrackLocalStaticSample::new(
            capability,
            lane.wire_id().to_string(),
            self.stream_id.clone(),
        ))
    }

    /// Add a sender for `lane` to `peer_connection` and start feeding it
    async fn attach_lane(
        &self,
        peer_connection: &RTCPeerConnection,
        lane: Lane,
        source: &LocalSource,
    ) -> TransportResult<RtcLane> {
        let track = self.local_track(lane);
        let sender = peer_connection
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| transport_error("Failed to add track", e))?;

        // Drain RTCP so interceptors keep running
        let rtcp_sender = Arc::clone(&sender);
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtcp_sender.read(&mut buf).await.is_ok() {}
        });

        Ok(RtcLane {
            lane,
            source: source.clone(),
            sender,
            pump: Some(spawn_pump(track, source.clone())),
        })
    }

    async fn local_description(&self, kind: SdpKind) -> TransportResult<SessionDescription> {
        let description = self
            .connection()
            .local_description()
            .await
            .ok_or_else(|| TransportError::classify("No local description after setting it"))?;

        Ok(SessionDescription {
            kind,
            sdp: description.sdp,
        })
    }
}

/// Feed a track from its source
///
/// Real sources forward device frames while enabled. Placeholders repeat a
/// fixed frame: comfort silence for audio, a black key frame for video.
fn spawn_pump(track: Arc<TrackLocalStaticSample>, source: LocalSource) -> JoinHandle<()> {
    if source.is_placeholder() {
        let (data, period) = match source.lane().kind() {
            MediaKind::Audio => (Bytes::from_static(&OPUS_SILENCE), SILENCE_FRAME),
            MediaKind::Video => (Bytes::from_static(&BLACK_KEYFRAME), BLACK_FRAME),
        };
        return tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            while !source.is_ended() {
                ticker.tick().await;
                let sample = Sample {
                    data: data.clone(),
                    duration: period,
                    ..Default::default()
                };
                if let Err(e) = track.write_sample(&sample).await {
                    debug!("Placeholder writer for {} stopped: {}", source.lane(), e);
                    break;
                }
            }
        });
    }

    let mut frames = source.subscribe();
    tokio::spawn(async move {
        loop {
            match frames.recv().await {
                Ok(frame) => {
                    if !source.is_enabled() {
                        continue;
                    }
                    let sample = Sample {
                        data: frame.data,
                        duration: frame.duration,
                        ..Default::default()
                    };
                    if let Err(e) = track.write_sample(&sample).await {
                        debug!("Track writer for {} stopped: {}", source.id(), e);
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!("Track writer for {} skipped {} frames", source.id(), skipped);
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn transport_error(context: &str, e: impl std::fmt::Display) -> TransportError {
    TransportError::classify(format!("{}: {}", context, e))
}

#[async_trait]
impl SessionTransport for RtcSession {
    fn signaling_state(&self) -> SignalingState {
        match self.connection().signaling_state() {
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveRemotePranswer => {
                SignalingState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveLocalPranswer => {
                SignalingState::HaveRemoteOffer
            }
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Stable,
        }
    }

    async fn add_lane(&self, lane: Lane, source: &LocalSource) -> TransportResult<()> {
        let position = self.lanes.lock().len();
        if position != lane.index() {
            return Err(TransportError::classify(format!(
                "{} lane added at position {}",
                lane, position
            )));
        }

        let slot = self
            .attach_lane(&self.connection(), lane, source)
            .await?;
        self.lanes.lock().push(slot);

        debug!("Added {} lane for {}", lane, self.peer_id);
        Ok(())
    }

    async fn replace_lane(&self, lane: Lane, source: &LocalSource) -> TransportResult<()> {
        let sender = {
            let lanes = self.lanes.lock();
            let slot = lanes.get(lane.index()).ok_or_else(|| {
                TransportError::classify(format!("{} lane not bound", lane))
            })?;
            Arc::clone(&slot.sender)
        };

        let track = self.local_track(lane);
        sender
            .replace_track(Some(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>))
            .await
            .map_err(|e| transport_error("Failed to replace track", e))?;

        let pump = spawn_pump(track, source.clone());
        let previous = {
            let mut lanes = self.lanes.lock();
            match lanes.get_mut(lane.index()) {
                Some(slot) => {
                    slot.source = source.clone();
                    slot.pump.replace(pump)
                }
                None => Some(pump),
            }
        };
        if let Some(previous) = previous {
            previous.abort();
        }

        debug!("Replaced {} lane for {} with {}", lane, self.peer_id, source.id());
        Ok(())
    }

    async fn create_offer(&self) -> TransportResult<SessionDescription> {
        let peer_connection = self.connection();
        let offer = peer_connection
            .create_offer(None)
            .await
            .map_err(|e| transport_error("Failed to create offer", e))?;

        peer_connection
            .set_local_description(offer)
            .await
            .map_err(|e| transport_error("Failed to set local description", e))?;

        self.local_description(SdpKind::Offer).await
    }

    async fn create_answer(&self) -> TransportResult<SessionDescription> {
        let peer_connection = self.connection();
        let answer = peer_connection
            .create_answer(None)
            .await
            .map_err(|e| transport_error("Failed to create answer", e))?;

        peer_connection
            .set_local_description(answer)
            .await
            .map_err(|e| transport_error("Failed to set local description", e))?;

        self.local_description(SdpKind::Answer).await
    }

    async fn set_remote_description(&self, description: SessionDescription) -> TransportResult<()> {
        let description = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(|e| transport_error("Failed to parse description", e))?;

        self.connection()
            .set_remote_description(description)
            .await
            .map_err(|e| transport_error("Failed to set remote description", e))
    }

    async fn rollback(&self) -> TransportResult<()> {
        let previous = self.connection();
        let state = previous.signaling_state();
        if state != RTCSignalingState::HaveLocalOffer {
            return Err(TransportError::classify(format!(
                "InvalidStateError: no local offer to roll back in state {}",
                state
            )));
        }

        let replacement = Arc::new(
            self.settings
                .peer_connection()
                .await
                .map_err(|e| transport_error("Failed to rebuild peer connection", e))?,
        );
        Self::install_handlers(&replacement, self.tag.clone());

        let bound: Vec<(Lane, LocalSource)> = self
            .lanes
            .lock()
            .iter()
            .map(|slot| (slot.lane, slot.source.clone()))
            .collect();

        let mut rebuilt = Vec::with_capacity(bound.len());
        for (lane, source) in bound {
            match self.attach_lane(&replacement, lane, &source).await {
                Ok(slot) => rebuilt.push(slot),
                Err(e) => {
                    rebuilt.iter_mut().for_each(RtcLane::stop);
                    Self::detach_handlers(&replacement);
                    let _ = replacement.close().await;
                    return Err(e);
                }
            }
        }

        *self.peer_connection.lock() = replacement;
        let retired = std::mem::replace(&mut *self.lanes.lock(), rebuilt);
        for mut slot in retired {
            slot.stop();
        }

        Self::detach_handlers(&previous);
        if let Err(e) = previous.close().await {
            debug!("Error closing rolled back connection to {}: {}", self.peer_id, e);
        }

        info!("Rolled back offer to {} onto a fresh peer connection", self.peer_id);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> TransportResult<()> {
        self.connection()
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|e| transport_error("Failed to add ICE candidate", e))
    }

    async fn close(&self) -> TransportResult<()> {
        info!("Closing peer connection for peer {}", self.peer_id);

        for slot in self.lanes.lock().iter_mut() {
            debug!("Stopping {} lane writer", slot.lane);
            slot.stop();
        }

        self.connection()
            .close()
            .await
            .map_err(|e| transport_error("Failed to close peer connection", e))
    }
}

#[derive(Clone)]
struct EventTag {
    peer_id: String,
    generation: u64,
    events: SessionEventSender,
}

impl EventTag {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(SessionEvent {
            peer_id: self.peer_id.clone(),
            generation: self.generation,
            event,
        });
    }
}
