//! Per-peer session negotiation
//!
//! Handles the offer/answer state machine, glare resolution and the
//! transports it drives.

#[cfg(any(test, feature = "test-util"))]
pub mod loopback;
pub mod machine;
pub mod rtc;
pub mod transport;

pub use machine::{is_polite, should_initiate, ApplyOutcome, NegotiationStateMachine, Phase};
pub use rtc::{RtcSession, RtcTransportFactory};
pub use transport::{
    PeerState, RemoteTrack, SessionEvent, SessionEventSender, SessionTransport, SignalingState,
    TransportEvent, TransportFactory,
};
