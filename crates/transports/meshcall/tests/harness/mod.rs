//! Mesh call test harness
//!
//! Provides in-process infrastructure for driving several [`CallClient`]s
//! against each other:
//! - [`LoopbackRelay`]: an in-memory signaling relay with fault injection
//! - [`ScriptedDevices`]: capture devices that can be denied per lane
//! - [`TestPeer`]: a running client with its handle, notices and transports
//!
//! The relay announces rosters both ways on `call-join`: existing members get
//! `call-new-peer` for the newcomer and the newcomer gets one per existing
//! member.

#![allow(dead_code)]

use async_trait::async_trait;
use meshcall::client::{CallHandle, CallNotice, CallSnapshot};
use meshcall::media::{CameraFacing, Lane, LocalMediaIntent, LocalSource, MediaDevices};
use meshcall::negotiation::loopback::LoopbackFactory;
use meshcall::signaling::{ChannelEvent, Outbound, SignalingConnector, SignalingLink};
use meshcall::{CallClient, CallConfig, DeviceError, SignalMessage};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

/// Result type for test harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

/// Error type for test harness operations
#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Client error: {0}")]
    ClientError(#[from] meshcall::Error),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Notice stream ended")]
    NoticesClosed,
}

/// How long a condition may take to hold before a test fails
pub const WAIT_LIMIT: Duration = Duration::from_secs(10);

/// A message the relay accepted, with the username of its sender
#[derive(Debug, Clone)]
pub struct Routed {
    pub from: String,
    pub message: SignalMessage,
}

struct Member {
    username: Option<String>,
    room: Option<String>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

#[derive(Default)]
struct RelayState {
    next_id: u64,
    members: BTreeMap<u64, Member>,
    log: Vec<Routed>,
    mute_pongs: bool,
    refuse: usize,
    connects: usize,
}

/// In-memory signaling relay
#[derive(Clone, Default)]
pub struct LoopbackRelay {
    state: Arc<Mutex<RelayState>>,
}

impl LoopbackRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector handing out links to this relay
    pub fn connector(&self) -> Arc<dyn SignalingConnector> {
        Arc::new(RelayConnector {
            relay: self.clone(),
        })
    }

    /// Stop answering pings
    pub fn mute_pongs(&self, muted: bool) {
        self.state.lock().mute_pongs = muted;
    }

    /// Refuse the next `count` connection attempts
    pub fn refuse_next(&self, count: usize) {
        self.state.lock().refuse = count;
    }

    /// Successful connections so far
    pub fn connects(&self) -> usize {
        self.state.lock().connects
    }

    /// Drop `username`'s connection as if the network failed
    pub fn sever(&self, username: &str) -> bool {
        let mut state = self.state.lock();
        let ids: Vec<u64> = state
            .members
            .iter()
            .filter(|(_, m)| m.username.as_deref() == Some(username))
            .map(|(id, _)| *id)
            .collect();

        for id in &ids {
            if let Some(member) = state.members.remove(id) {
                let _ = member
                    .events
                    .send(ChannelEvent::Closed(Some("severed by relay".to_string())));
            }
        }
        !ids.is_empty()
    }

    /// Deliver `message` to `username` as if the relay sent it
    pub fn inject(&self, username: &str, message: SignalMessage) {
        let state = self.state.lock();
        for member in state.members.values() {
            if member.username.as_deref() == Some(username) {
                let _ = member.events.send(ChannelEvent::Message(message.clone()));
            }
        }
    }

    /// Every message accepted so far
    pub fn messages(&self) -> Vec<Routed> {
        self.state.lock().log.clone()
    }

    /// Messages of `kind` (`call-offer`, `ping`, ...) sent by `username`
    pub fn sent_by(&self, username: &str, kind: &str) -> Vec<SignalMessage> {
        self.messages()
            .into_iter()
            .filter(|r| r.from == username && r.message.kind() == kind)
            .map(|r| r.message)
            .collect()
    }

    fn disconnect(&self, id: u64) {
        self.state.lock().members.remove(&id);
    }

    fn route(&self, id: u64, message: SignalMessage) {
        let mut state = self.state.lock();

        match &message {
            SignalMessage::CallJoin {
                room_id, username, ..
            } => {
                // A rejoin replaces the old connection
                state
                    .members
                    .retain(|other, m| *other == id || m.username.as_deref() != Some(username.as_str()));

                if let Some(member) = state.members.get_mut(&id) {
                    member.username = Some(username.clone());
                    member.room = Some(room_id.clone());
                }

                let roster: Vec<(u64, String)> = state
                    .members
                    .iter()
                    .filter(|(other, m)| **other != id && m.room.as_deref() == Some(room_id.as_str()))
                    .filter_map(|(other, m)| m.username.clone().map(|u| (*other, u)))
                    .collect();

                for (other, existing) in roster {
                    state.send(
                        other,
                        SignalMessage::CallNewPeer {
                            username: username.clone(),
                        },
                    );
                    state.send(id, SignalMessage::CallNewPeer { username: existing });
                }
            }
            SignalMessage::CallOffer { to, .. }
            | SignalMessage::CallAnswer { to, .. }
            | SignalMessage::CallIce { to, .. } => {
                let room = state.members.get(&id).and_then(|m| m.room.clone());
                let targets: Vec<u64> = state
                    .members
                    .iter()
                    .filter(|(_, m)| m.username.as_deref() == Some(to.as_str()) && m.room == room)
                    .map(|(other, _)| *other)
                    .collect();
                for target in targets {
                    state.send(target, message.clone());
                }
            }
            SignalMessage::CallPeerLeft { .. } => {
                let room = state.members.get(&id).and_then(|m| m.room.clone());
                let targets: Vec<u64> = state
                    .members
                    .iter()
                    .filter(|(other, m)| **other != id && m.room == room)
                    .map(|(other, _)| *other)
                    .collect();
                for target in targets {
                    state.send(target, message.clone());
                }
            }
            SignalMessage::Ping { timestamp } => {
                if !state.mute_pongs {
                    state.send(id, SignalMessage::Pong { timestamp: *timestamp });
                }
            }
            _ => {}
        }

        let from = match &message {
            SignalMessage::CallJoin { username, .. } => username.clone(),
            _ => state
                .members
                .get(&id)
                .and_then(|m| m.username.clone())
                .unwrap_or_default(),
        };
        debug!("relay: {} from {:?}", message.kind(), from);
        state.log.push(Routed { from, message });
    }
}

impl RelayState {
    fn send(&mut self, id: u64, message: SignalMessage) {
        let delivered = self
            .members
            .get(&id)
            .is_some_and(|m| m.events.send(ChannelEvent::Message(message)).is_ok());
        if !delivered {
            self.members.remove(&id);
        }
    }
}

struct RelayConnector {
    relay: LoopbackRelay,
}

#[async_trait]
impl SignalingConnector for RelayConnector {
    async fn connect(&self) -> meshcall::Result<SignalingLink> {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let id = {
            let mut state = self.relay.state.lock();
            if state.refuse > 0 {
                state.refuse -= 1;
                return Err(meshcall::Error::WebSocketError(
                    "connection refused".to_string(),
                ));
            }
            let id = state.next_id;
            state.next_id += 1;
            state.connects += 1;
            state.members.insert(
                id,
                Member {
                    username: None,
                    room: None,
                    events: events_tx,
                },
            );
            id
        };

        let relay = self.relay.clone();
        let task = tokio::spawn(async move {
            while let Some(outbound) = outbound_rx.recv().await {
                match outbound {
                    Outbound::Message(message) => relay.route(id, message),
                    Outbound::Close => break,
                }
            }
            relay.disconnect(id);
        });

        Ok(SignalingLink::new(outbound_tx, events_rx, vec![task]))
    }
}

#[derive(Default)]
struct DeviceState {
    denied: BTreeSet<Lane>,
    acquired: Vec<LocalSource>,
    facings: Vec<CameraFacing>,
}

/// Capture devices whose availability tests control per lane
#[derive(Clone, Default)]
pub struct ScriptedDevices {
    state: Arc<Mutex<DeviceState>>,
}

impl ScriptedDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse permission for `lane` from now on
    pub fn deny(&self, lane: Lane) {
        self.state.lock().denied.insert(lane);
    }

    pub fn allow(&self, lane: Lane) {
        self.state.lock().denied.remove(&lane);
    }

    /// Sources handed out for `lane`, oldest first
    pub fn acquired(&self, lane: Lane) -> Vec<LocalSource> {
        self.state
            .lock()
            .acquired
            .iter()
            .filter(|s| s.lane() == lane)
            .cloned()
            .collect()
    }

    pub fn latest(&self, lane: Lane) -> Option<LocalSource> {
        self.acquired(lane).pop()
    }

    /// Facing requested by each camera acquisition
    pub fn facings(&self) -> Vec<CameraFacing> {
        self.state.lock().facings.clone()
    }

    fn open(&self, lane: Lane, label: &str) -> Result<LocalSource, DeviceError> {
        let mut state = self.state.lock();
        if state.denied.contains(&lane) {
            return Err(DeviceError::PermissionDenied(lane));
        }
        let source = LocalSource::capture(lane, label);
        state.acquired.push(source.clone());
        Ok(source)
    }
}

#[async_trait]
impl MediaDevices for ScriptedDevices {
    async fn microphone(&self) -> Result<LocalSource, DeviceError> {
        self.open(Lane::Audio, "Test microphone")
    }

    async fn camera(&self, facing: CameraFacing) -> Result<LocalSource, DeviceError> {
        self.state.lock().facings.push(facing);
        let label = match facing {
            CameraFacing::User => "Front camera",
            CameraFacing::Environment => "Rear camera",
        };
        self.open(Lane::Video, label)
    }

    async fn screen(&self) -> Result<LocalSource, DeviceError> {
        self.open(Lane::Screen, "Entire screen")
    }
}

/// Config for `username` in room `r1` with short reconnection delays
pub fn test_config(username: &str) -> CallConfig {
    let mut config = CallConfig::new("ws://relay.test", "r1", username);
    config.reconnect.settle_delay_ms = 50;
    config.reconnect.retry_delay_ms = 100;
    config
}

/// A call client running on its own task
pub struct TestPeer {
    pub username: String,
    pub handle: CallHandle,
    pub notices: mpsc::UnboundedReceiver<CallNotice>,
    pub factory: LoopbackFactory,
    pub devices: ScriptedDevices,
    pub task: JoinHandle<meshcall::Result<()>>,
}

impl TestPeer {
    /// Join the relay's room with default test config
    pub fn spawn(relay: &LoopbackRelay, username: &str, intent: LocalMediaIntent) -> Self {
        Self::spawn_with(relay, test_config(username), ScriptedDevices::new(), intent)
    }

    pub fn spawn_with(
        relay: &LoopbackRelay,
        config: CallConfig,
        devices: ScriptedDevices,
        intent: LocalMediaIntent,
    ) -> Self {
        let factory = LoopbackFactory::new();
        let username = config.username.clone();
        let (client, handle, notices) = CallClient::new(
            config,
            relay.connector(),
            Arc::new(devices.clone()),
            Arc::new(factory.clone()),
        )
        .expect("valid test config");

        let task = tokio::spawn(client.with_intent(intent).run());

        Self {
            username,
            handle,
            notices,
            factory,
            devices,
            task,
        }
    }

    /// Poll snapshots until `condition` holds
    pub async fn wait_for(
        &self,
        what: &str,
        condition: impl Fn(&CallSnapshot) -> bool,
    ) -> HarnessResult<CallSnapshot> {
        let poll = async {
            loop {
                let snapshot = match self.handle.snapshot().await {
                    Ok(snapshot) => snapshot,
                    Err(e) => return Err(HarnessError::from(e)),
                };
                if condition(&snapshot) {
                    return Ok(snapshot);
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };

        tokio::time::timeout(WAIT_LIMIT, poll)
            .await
            .map_err(|_| HarnessError::Timeout(format!("{}: {}", self.username, what)))?
    }

    /// Poll `condition` until it holds
    pub async fn wait_until(&self, what: &str, condition: impl Fn() -> bool) -> HarnessResult<()> {
        let poll = async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };

        tokio::time::timeout(WAIT_LIMIT, poll)
            .await
            .map_err(|_| HarnessError::Timeout(format!("{}: {}", self.username, what)))
    }

    /// Wait until the latest session with `from` carries real content on `lane`
    pub async fn wait_for_live(&self, from: &str, lane: Lane) -> HarnessResult<()> {
        self.wait_until(&format!("live {} from {}", lane, from), || {
            self.receiving_live(from, lane)
        })
        .await
    }

    /// Whether the latest session with `from` carries real content on `lane`
    pub fn receiving_live(&self, from: &str, lane: Lane) -> bool {
        self.factory
            .latest(from)
            .is_some_and(|t| t.receiving_live(lane))
    }

    /// Skip notices until one matches
    pub async fn next_notice(
        &mut self,
        what: &str,
        matches: impl Fn(&CallNotice) -> bool,
    ) -> HarnessResult<CallNotice> {
        let notices = &mut self.notices;
        let search = async {
            while let Some(notice) = notices.recv().await {
                if matches(&notice) {
                    return Ok(notice);
                }
            }
            Err(HarnessError::NoticesClosed)
        };

        tokio::time::timeout(WAIT_LIMIT, search)
            .await
            .map_err(|_| HarnessError::Timeout(format!("{}: {}", self.username, what)))?
    }

    /// Notices already queued
    pub fn drain_notices(&mut self) -> Vec<CallNotice> {
        let mut drained = Vec::new();
        while let Ok(notice) = self.notices.try_recv() {
            drained.push(notice);
        }
        drained
    }
}
