//! Call client event loop
//!
//! One [`CallClient`] runs one call. Inbound signaling, transport events,
//! timers and UI commands all funnel into a single `select!` loop, so the peer
//! tables, local sources and media intent have exactly one writer. Timers are
//! spawned sleeps that post an [`Internal`] event back into the loop; every
//! such event re-checks the state it was scheduled for before acting.

use crate::config::CallConfig;
use crate::error::DeviceError;
use crate::media::{devices, Lane, LaneSources, LocalMediaIntent, LocalSource, MediaDevices};
use crate::media::CameraFacing;
use crate::negotiation::{SessionEvent, TransportFactory};
use crate::peer::{PeerConnectionManager, PendingOffer, RemoteLaneStream, SessionInfo, SessionUpdate};
use crate::reconnect::{ConnectionStatus, ReconnectionCoordinator};
use crate::signaling::{
    ChannelEvent, HeartbeatMonitor, HeartbeatVerdict, SignalMessage, SignalingConnector,
    SignalingLink,
};
use crate::{Error, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Event surfaced to the UI
#[derive(Debug, Clone, PartialEq)]
pub enum CallNotice {
    /// A capture device failed; the lane carries a placeholder
    DeviceAdvisory { lane: Lane, error: DeviceError },
    /// Signaling channel status changed
    StatusChanged(ConnectionStatus),
    ParticipantJoined(String),
    ParticipantLeft(String),
    /// A remote lane became available
    RemoteStream(RemoteLaneStream),
    /// The platform stopped our screen share
    ScreenShareEnded,
    /// Reconnection gave up after the policy's attempt limit
    ReconnectFailed { attempts: u32 },
}

/// Point-in-time view of the call
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSnapshot {
    pub local_id: String,
    pub room_id: String,
    pub status: ConnectionStatus,
    pub intent: LocalMediaIntent,
    pub participants: Vec<String>,
    pub remote_streams: Vec<RemoteLaneStream>,
    #[serde(skip)]
    pub sessions: Vec<SessionInfo>,
    pub focused_peer: Option<String>,
    /// Lanes whose device failed last time it was requested
    #[serde(skip)]
    pub advisories: Vec<DeviceError>,
}

type Reply<T> = oneshot::Sender<T>;

enum Command {
    SetMuted(bool, Reply<Result<()>>),
    SetVideoEnabled(bool, Reply<Result<()>>),
    SetScreenSharing(bool, Reply<Result<()>>),
    SetCameraFacing(CameraFacing, Reply<Result<()>>),
    SwitchCamera(Reply<Result<()>>),
    SetFocusedPeer(Option<String>, Reply<bool>),
    Reconnect(Reply<Result<()>>),
    Leave(Reply<Result<()>>),
    Snapshot(Reply<CallSnapshot>),
}

/// Deferred work posted back into the loop by timers and watchers
#[derive(Debug)]
enum Internal {
    OfferDue(PendingOffer),
    ReconnectDue,
    SourceEnded(String),
}

enum Step {
    Channel(ChannelEvent),
    Session(SessionEvent),
    Internal(Internal),
    Command(Command),
    HandlesDropped,
    HeartbeatTick,
    HeartbeatDeadline(u64),
}

/// Cloneable handle the UI drives the call with
#[derive(Clone)]
pub struct CallHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl CallHandle {
    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(build(reply))
            .map_err(|_| Error::ChannelClosed("call has ended".to_string()))?;
        response
            .await
            .map_err(|_| Error::ChannelClosed("call has ended".to_string()))
    }

    /// Mute or unmute; unmuting without a microphone acquires one
    pub async fn set_muted(&self, muted: bool) -> Result<()> {
        self.request(|reply| Command::SetMuted(muted, reply)).await?
    }

    /// Start or stop the camera
    pub async fn set_video_enabled(&self, enabled: bool) -> Result<()> {
        self.request(|reply| Command::SetVideoEnabled(enabled, reply))
            .await?
    }

    /// Start or stop sharing the screen
    pub async fn set_screen_sharing(&self, sharing: bool) -> Result<()> {
        self.request(|reply| Command::SetScreenSharing(sharing, reply))
            .await?
    }

    pub async fn set_camera_facing(&self, facing: CameraFacing) -> Result<()> {
        self.request(|reply| Command::SetCameraFacing(facing, reply))
            .await?
    }

    /// Flip between front and rear camera
    pub async fn switch_camera(&self) -> Result<()> {
        self.request(Command::SwitchCamera).await?
    }

    /// Select the peer to show large; returns false for an unknown peer
    pub async fn set_focused_peer(&self, peer_id: Option<String>) -> Result<bool> {
        self.request(|reply| Command::SetFocusedPeer(peer_id, reply))
            .await
    }

    /// Drop the signaling channel and rebuild every session
    pub async fn reconnect(&self) -> Result<()> {
        self.request(Command::Reconnect).await?
    }

    /// Leave the room; the call loop exits afterwards
    pub async fn leave(&self) -> Result<()> {
        self.request(Command::Leave).await?
    }

    pub async fn snapshot(&self) -> Result<CallSnapshot> {
        self.request(Command::Snapshot).await
    }
}

/// A single call in one room
pub struct CallClient {
    config: CallConfig,
    connector: Arc<dyn SignalingConnector>,
    devices: Arc<dyn MediaDevices>,
    manager: PeerConnectionManager,
    session_events: mpsc::UnboundedReceiver<SessionEvent>,
    commands: mpsc::UnboundedReceiver<Command>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    notices: mpsc::UnboundedSender<CallNotice>,
    intent: LocalMediaIntent,
    sources: LaneSources,
    link: Option<SignalingLink>,
    heartbeat: HeartbeatMonitor,
    next_probe: Option<Instant>,
    probe_deadline: Option<(Instant, u64)>,
    last_probe: u64,
    reconnection: ReconnectionCoordinator,
    advisories: BTreeMap<Lane, DeviceError>,
    left: bool,
}

impl CallClient {
    /// Create a call client
    ///
    /// # Arguments
    ///
    /// * `config` - Validated before anything starts
    /// * `connector` - Opens signaling links to the relay
    /// * `devices` - Local capture devices
    /// * `factory` - Creates one session transport per peer
    ///
    /// Returns the client to [`run`](Self::run), the handle that drives it and
    /// the notice stream.
    pub fn new(
        config: CallConfig,
        connector: Arc<dyn SignalingConnector>,
        devices: Arc<dyn MediaDevices>,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<(Self, CallHandle, mpsc::UnboundedReceiver<CallNotice>)> {
        config.validate()?;

        let (events_tx, session_events) = mpsc::unbounded_channel();
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (notices, notices_rx) = mpsc::unbounded_channel();

        let manager = PeerConnectionManager::new(
            config.username.clone(),
            config.room_id.clone(),
            factory,
            events_tx,
        );

        let client = Self {
            heartbeat: HeartbeatMonitor::new(config.heartbeat.clone()),
            reconnection: ReconnectionCoordinator::new(config.reconnect.clone()),
            config,
            connector,
            devices,
            manager,
            session_events,
            commands,
            internal_tx,
            internal_rx,
            notices,
            intent: LocalMediaIntent::default(),
            sources: LaneSources::default(),
            link: None,
            next_probe: None,
            probe_deadline: None,
            last_probe: 0,
            advisories: BTreeMap::new(),
            left: false,
        };

        Ok((
            client,
            CallHandle {
                commands: commands_tx,
            },
            notices_rx,
        ))
    }

    /// Media to request when joining
    pub fn with_intent(mut self, intent: LocalMediaIntent) -> Self {
        self.intent = intent;
        self
    }

    /// Join the room and run until the call is left
    ///
    /// Fails only when the first connection to the relay cannot be opened.
    #[instrument(skip(self), fields(room = %self.config.room_id, user = %self.config.username))]
    pub async fn run(mut self) -> Result<()> {
        self.acquire_media().await;

        let link = match self.connector.connect().await {
            Ok(link) => link,
            Err(e) => {
                self.sources.stop_all();
                return Err(e);
            }
        };
        self.attach(link);
        self.reconnection.mark_connected();
        self.notify(CallNotice::StatusChanged(ConnectionStatus::Connected));
        info!("Joined room {}", self.config.room_id);

        while !self.left {
            let deadline = self.probe_deadline;
            let step = tokio::select! {
                event = next_link_event(&mut self.link) => Step::Channel(event),
                Some(event) = self.session_events.recv() => Step::Session(event),
                Some(internal) = self.internal_rx.recv() => Step::Internal(internal),
                command = self.commands.recv() => match command {
                    Some(command) => Step::Command(command),
                    None => Step::HandlesDropped,
                },
                _ = sleep_until(self.next_probe) => Step::HeartbeatTick,
                _ = sleep_until(deadline.map(|(at, _)| at)) => {
                    Step::HeartbeatDeadline(deadline.map_or(0, |(_, probe)| probe))
                }
            };

            match step {
                Step::Channel(ChannelEvent::Message(message)) => self.handle_signal(message).await,
                Step::Channel(ChannelEvent::Closed(reason)) => {
                    let reason = reason.unwrap_or_else(|| "connection closed".to_string());
                    self.on_channel_lost(&reason).await;
                }
                Step::Session(event) => self.handle_session_event(event),
                Step::Internal(internal) => self.handle_internal(internal).await,
                Step::Command(command) => self.handle_command(command).await,
                Step::HandlesDropped => {
                    info!("All call handles dropped, leaving");
                    self.leave().await;
                }
                Step::HeartbeatTick => self.send_probe(),
                Step::HeartbeatDeadline(probe) => {
                    self.probe_deadline = None;
                    if self.heartbeat.on_deadline(probe) == HeartbeatVerdict::Dead {
                        self.on_channel_lost("heartbeat failed").await;
                    }
                }
            }
        }

        info!("Left room {}", self.config.room_id);
        Ok(())
    }

    fn attach(&mut self, link: SignalingLink) {
        self.link = Some(link);
        self.heartbeat.reset();
        self.probe_deadline = None;
        self.next_probe = Some(Instant::now() + self.heartbeat.interval());
        self.send(SignalMessage::join(
            self.config.room_id.clone(),
            self.config.username.clone(),
        ));
    }

    fn send(&self, message: SignalMessage) {
        let Some(link) = &self.link else {
            debug!("Dropping {}: no signaling link", message.kind());
            return;
        };
        if let Err(e) = link.send(message) {
            warn!("Failed to queue signaling message: {}", e);
        }
    }

    fn notify(&self, notice: CallNotice) {
        let _ = self.notices.send(notice);
    }

    fn schedule(&self, event: Internal, delay: Duration) {
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = internal.send(event);
        });
    }

    async fn handle_signal(&mut self, message: SignalMessage) {
        match message {
            SignalMessage::CallNewPeer { username } => {
                let known = self.manager.is_participant(&username);
                let pending = self.manager.on_peer_joined(&username, &self.sources).await;
                if !known && self.manager.is_participant(&username) {
                    self.notify(CallNotice::ParticipantJoined(username));
                }
                if let Some(pending) = pending {
                    self.schedule(Internal::OfferDue(pending), self.config.offer_delay());
                }
            }
            message @ (SignalMessage::CallOffer { .. }
            | SignalMessage::CallAnswer { .. }
            | SignalMessage::CallIce { .. }) => {
                let Some(from) = message.sender().map(str::to_string) else {
                    return;
                };
                let known = self.manager.is_participant(&from);
                let replies = self.manager.on_signal(&from, message, &self.sources).await;
                if !known && self.manager.is_participant(&from) {
                    self.notify(CallNotice::ParticipantJoined(from));
                }
                for reply in replies {
                    self.send(reply);
                }
            }
            SignalMessage::CallPeerLeft { username, .. } => {
                if self.manager.on_peer_left(&username).await {
                    self.notify(CallNotice::ParticipantLeft(username));
                }
            }
            SignalMessage::Ping { timestamp } => self.send(SignalMessage::Pong { timestamp }),
            SignalMessage::Pong { timestamp } => {
                self.heartbeat.on_pong(timestamp);
                self.probe_deadline = None;
            }
            other => debug!("Ignoring {} message", other.kind()),
        }
    }

    fn handle_session_event(&mut self, event: SessionEvent) {
        match self.manager.handle_session_event(event) {
            Some(SessionUpdate::Signal(message)) => self.send(message),
            Some(SessionUpdate::Stream(stream)) => self.notify(CallNotice::RemoteStream(stream)),
            Some(SessionUpdate::Connection { peer_id, state }) => {
                debug!("Media path to {}: {:?}", peer_id, state);
            }
            None => {}
        }
    }

    async fn handle_internal(&mut self, internal: Internal) {
        match internal {
            Internal::OfferDue(pending) => {
                if let Some(offer) = self.manager.fire_pending_offer(&pending).await {
                    self.send(offer);
                }
            }
            Internal::ReconnectDue => self.attempt_reconnect().await,
            Internal::SourceEnded(id) => {
                let current = self
                    .sources
                    .screen
                    .as_ref()
                    .is_some_and(|screen| screen.id() == id);
                if current {
                    info!("Screen share ended by the platform");
                    self.intent.screen_sharing = false;
                    self.set_lane(Lane::Screen, None).await;
                    self.reconnection.update_snapshot(self.intent);
                    self.notify(CallNotice::ScreenShareEnded);
                }
            }
        }
    }

    async fn handle_command(&mut self, command: Command) {
        self.apply_command(command).await;
        // Changes made while reconnecting must survive the rejoin
        self.reconnection.update_snapshot(self.intent);
    }

    async fn apply_command(&mut self, command: Command) {
        match command {
            Command::SetMuted(muted, reply) => {
                let _ = reply.send(self.set_muted(muted).await);
            }
            Command::SetVideoEnabled(enabled, reply) => {
                let _ = reply.send(self.set_video_enabled(enabled).await);
            }
            Command::SetScreenSharing(sharing, reply) => {
                let _ = reply.send(self.set_screen_sharing(sharing).await);
            }
            Command::SetCameraFacing(facing, reply) => {
                let _ = reply.send(self.set_camera_facing(facing).await);
            }
            Command::SwitchCamera(reply) => {
                let facing = self.intent.camera_facing.toggled();
                let _ = reply.send(self.set_camera_facing(facing).await);
            }
            Command::SetFocusedPeer(peer_id, reply) => {
                let _ = reply.send(self.manager.set_focused_peer(peer_id));
            }
            Command::Reconnect(reply) => {
                let result = if self.reconnection.in_progress() {
                    Err(Error::InvalidState(
                        "reconnection already in progress".to_string(),
                    ))
                } else if self.link.is_some() {
                    self.on_channel_lost("reconnect requested").await;
                    Ok(())
                } else if self.reconnection.restart(self.intent) {
                    self.schedule(Internal::ReconnectDue, Duration::ZERO);
                    Ok(())
                } else {
                    Err(Error::InvalidState("call is not connected".to_string()))
                };
                let _ = reply.send(result);
            }
            Command::Leave(reply) => {
                self.leave().await;
                let _ = reply.send(Ok(()));
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    fn snapshot(&self) -> CallSnapshot {
        CallSnapshot {
            local_id: self.config.username.clone(),
            room_id: self.config.room_id.clone(),
            status: self.reconnection.status(),
            intent: self.intent,
            participants: self.manager.participants(),
            remote_streams: self.manager.remote_streams(),
            sessions: self.manager.sessions(),
            focused_peer: self.manager.focused_peer().map(str::to_string),
            advisories: self.advisories.values().copied().collect(),
        }
    }

    // Heartbeat

    fn send_probe(&mut self) {
        let now = Instant::now();
        self.next_probe = Some(now + self.heartbeat.interval());

        let timestamp = epoch_millis().max(self.last_probe + 1);
        self.last_probe = timestamp;
        let ping = self.heartbeat.probe(timestamp);
        self.probe_deadline = Some((now + self.heartbeat.timeout(), timestamp));
        self.send(ping);
    }

    // Reconnection

    async fn on_channel_lost(&mut self, reason: &str) {
        if let Some(link) = self.link.take() {
            link.close();
        }
        self.next_probe = None;
        self.probe_deadline = None;

        if !self.reconnection.on_channel_lost(self.intent) {
            return;
        }

        warn!("Signaling channel lost: {}", reason);
        self.manager.close_all(true).await;
        self.sources.stop_all();
        self.notify(CallNotice::StatusChanged(ConnectionStatus::Disconnected));
        self.schedule(Internal::ReconnectDue, self.reconnection.settle_delay());
    }

    async fn attempt_reconnect(&mut self) {
        if self.left || !self.reconnection.in_progress() {
            return;
        }

        let Some(attempt) = self.reconnection.start_attempt() else {
            self.notify(CallNotice::StatusChanged(ConnectionStatus::Disconnected));
            self.notify(CallNotice::ReconnectFailed {
                attempts: self.reconnection.attempts(),
            });
            return;
        };

        if attempt.entered_reconnecting {
            self.notify(CallNotice::StatusChanged(ConnectionStatus::Reconnecting));
        }

        match self.connector.connect().await {
            Ok(link) => {
                if let Some(intent) = self.reconnection.complete() {
                    self.intent = intent;
                }
                // Lanes are bound from these sources as peers reappear
                self.acquire_media().await;
                self.attach(link);
                self.notify(CallNotice::StatusChanged(ConnectionStatus::Connected));
            }
            Err(e) => {
                warn!("Reconnection attempt {} failed: {}", attempt.number, e);
                self.schedule(Internal::ReconnectDue, self.reconnection.retry_delay());
            }
        }
    }

    async fn leave(&mut self) {
        if self.left {
            return;
        }

        self.send(SignalMessage::leave(
            self.config.room_id.clone(),
            self.config.username.clone(),
        ));
        if let Some(link) = self.link.take() {
            link.close();
        }

        self.reconnection.abandon();
        self.manager.close_all(false).await;
        self.sources.stop_all();
        self.left = true;
        self.notify(CallNotice::StatusChanged(ConnectionStatus::Disconnected));
    }

    // Local media

    async fn acquire(&mut self, lane: Lane) -> std::result::Result<LocalSource, DeviceError> {
        match devices::acquire(self.devices.as_ref(), lane, self.intent.camera_facing).await {
            Ok(source) => {
                self.advisories.remove(&lane);
                if lane == Lane::Screen {
                    self.watch_ended(&source);
                }
                debug!("Acquired {} source {}", lane, source.id());
                Ok(source)
            }
            Err(error) => {
                warn!("{}; sending a placeholder", error);
                self.advisories.insert(lane, error);
                self.notify(CallNotice::DeviceAdvisory { lane, error });
                Err(error)
            }
        }
    }

    /// Bring sources in line with the current intent
    ///
    /// Sources still running are kept; failures fall back to placeholders.
    async fn acquire_media(&mut self) {
        if !self.ensure_source(Lane::Audio, true).await {
            self.intent.muted = true;
        }
        if let Some(microphone) = &self.sources.audio {
            microphone.set_enabled(!self.intent.muted);
        }

        if !self.ensure_source(Lane::Video, self.intent.video_enabled).await {
            self.intent.video_enabled = false;
        }
        if !self.ensure_source(Lane::Screen, self.intent.screen_sharing).await {
            self.intent.screen_sharing = false;
        }
    }

    /// Make `lane` hold a running source when `wanted`, and none otherwise
    ///
    /// Returns false when a wanted source could not be acquired.
    async fn ensure_source(&mut self, lane: Lane, wanted: bool) -> bool {
        let running = self.sources.get(lane).is_some_and(|s| !s.is_ended());
        if wanted && running {
            return true;
        }

        let replacement = if wanted {
            self.acquire(lane).await.ok()
        } else {
            None
        };
        let acquired = !wanted || replacement.is_some();

        if let Some(previous) = self.sources.set(lane, replacement) {
            previous.stop();
        }
        acquired
    }

    fn watch_ended(&self, source: &LocalSource) {
        let mut ended = source.ended();
        let id = source.id().to_string();
        let internal = self.internal_tx.clone();
        tokio::spawn(async move {
            while !*ended.borrow_and_update() {
                if ended.changed().await.is_err() {
                    return;
                }
            }
            let _ = internal.send(Internal::SourceEnded(id));
        });
    }

    /// Put `source` on `lane` for every session and stop what it replaced
    async fn set_lane(&mut self, lane: Lane, source: Option<LocalSource>) {
        let previous = self.sources.set(lane, source.clone());
        for offer in self.manager.apply_lane(lane, source).await {
            self.send(offer);
        }
        if let Some(previous) = previous {
            previous.stop();
        }
    }

    async fn set_muted(&mut self, muted: bool) -> Result<()> {
        if let Some(microphone) = &self.sources.audio {
            microphone.set_enabled(!muted);
            self.intent.muted = muted;
            return Ok(());
        }

        if muted {
            self.intent.muted = true;
            return Ok(());
        }

        let microphone = self.acquire(Lane::Audio).await?;
        self.intent.muted = false;
        self.set_lane(Lane::Audio, Some(microphone)).await;
        Ok(())
    }

    async fn set_video_enabled(&mut self, enabled: bool) -> Result<()> {
        if !enabled {
            self.intent.video_enabled = false;
            if self.sources.video.is_some() {
                self.set_lane(Lane::Video, None).await;
            }
            return Ok(());
        }

        if self.sources.video.is_none() {
            let camera = self.acquire(Lane::Video).await?;
            self.set_lane(Lane::Video, Some(camera)).await;
        }
        self.intent.video_enabled = true;
        Ok(())
    }

    async fn set_screen_sharing(&mut self, sharing: bool) -> Result<()> {
        if !sharing {
            self.intent.screen_sharing = false;
            if self.sources.screen.is_some() {
                self.set_lane(Lane::Screen, None).await;
            }
            return Ok(());
        }

        if self.sources.screen.is_none() {
            let screen = self.acquire(Lane::Screen).await?;
            self.set_lane(Lane::Screen, Some(screen)).await;
        }
        self.intent.screen_sharing = true;
        Ok(())
    }

    async fn set_camera_facing(&mut self, facing: CameraFacing) -> Result<()> {
        if facing == self.intent.camera_facing {
            return Ok(());
        }

        let previous = self.intent.camera_facing;
        self.intent.camera_facing = facing;
        if self.sources.video.is_none() {
            return Ok(());
        }

        match self.acquire(Lane::Video).await {
            Ok(camera) => {
                info!("Switched camera to {:?}", facing);
                self.set_lane(Lane::Video, Some(camera)).await;
                Ok(())
            }
            Err(error) => {
                // The current camera keeps running
                self.intent.camera_facing = previous;
                Err(error.into())
            }
        }
    }
}

async fn next_link_event(link: &mut Option<SignalingLink>) -> ChannelEvent {
    match link {
        Some(link) => link.next_event().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
