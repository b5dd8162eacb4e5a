//! Mesh call negotiation core
//!
//! This crate runs the client side of an N-way audio/video/screen call where
//! every participant holds one WebRTC session with every other participant.
//!
//! # Features
//!
//! - **Perfect negotiation**: deterministic glare resolution by identity order
//! - **Stable lanes**: every session carries Audio, Video and Screen in a fixed
//!   order; missing media is a placeholder, never a missing lane
//! - **Session recreation**: structurally broken sessions are replaced, not patched
//! - **Heartbeat and reconnection**: a dead relay link rebuilds the whole mesh
//!   and restores the user's media intent
//! - **Stream classification**: incoming video is tagged camera or screen
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │  UI  ──CallHandle──▶  CallClient (single event loop)     │
//! │                       ├─ SignalingLink (JSON over WS)    │
//! │                       ├─ HeartbeatMonitor                │
//! │                       ├─ ReconnectionCoordinator         │
//! │                       └─ PeerConnectionManager           │
//! │                           └─ NegotiationStateMachine     │
//! │                               per peer                   │
//! │                               ├─ TrackLaneAllocator      │
//! │                               └─ SessionTransport        │
//! │                                   (webrtc-rs)            │
//! │  UI  ◀──CallNotice──  device advisories, status, streams │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use meshcall::CallConfig;
//!
//! let config = CallConfig::new("ws://localhost:8080", "standup", "alice");
//! assert!(config.validate().is_ok());
//! assert_eq!(config.heartbeat.max_missed, 3);
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use meshcall::{CallClient, CallConfig, NoDevices, RtcTransportFactory, WebSocketConnector};
//!
//! # async fn example() -> meshcall::Result<()> {
//! let config = CallConfig::new("ws://localhost:8080", "standup", "alice");
//! let (client, handle, mut notices) = CallClient::new(
//!     config.clone(),
//!     Arc::new(WebSocketConnector::new(config.signaling_url.clone())),
//!     Arc::new(NoDevices),
//!     Arc::new(RtcTransportFactory::new(&config)),
//! )?;
//!
//! tokio::spawn(client.run());
//! handle.set_video_enabled(true).await?;
//! while let Some(notice) = notices.recv().await {
//!     println!("{:?}", notice);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod error;
pub mod media;
pub mod negotiation;
pub mod peer;
pub mod reconnect;
pub mod signaling;

pub use client::{CallClient, CallHandle, CallNotice, CallSnapshot};
pub use config::{CallConfig, HeartbeatConfig, ReconnectionPolicy, TurnServerConfig};
pub use error::{DeviceError, Error, FailureClass, Result, TransportError};
pub use media::{
    CameraFacing, Lane, LocalMediaIntent, LocalSource, MediaDevices, NoDevices, StreamRole,
    TrackMetadata,
};
pub use negotiation::{RtcTransportFactory, TransportFactory};
pub use peer::{PeerConnectionManager, RemoteLaneStream};
pub use reconnect::ConnectionStatus;
pub use signaling::{SignalMessage, SignalingConnector, WebSocketConnector};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
