//! Peer session management

pub mod manager;

pub use manager::{
    PeerConnectionManager, PendingOffer, RemoteLaneStream, SessionInfo, SessionUpdate,
};
