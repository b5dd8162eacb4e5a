//! Signaling relay protocol, channel and heartbeat

pub mod channel;
pub mod heartbeat;
pub mod protocol;

pub use channel::{ChannelEvent, Outbound, SignalingConnector, SignalingLink, WebSocketConnector};
pub use heartbeat::{HeartbeatMonitor, HeartbeatVerdict};
pub use protocol::{IceCandidate, SdpKind, SessionDescription, SignalMessage};
