//! Error types for the mesh call core

use crate::media::Lane;

/// Result type alias using the meshcall Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in call operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Signaling connection error
    #[error("Signaling error: {0}")]
    SignalingError(String),

    /// Peer not found
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// Media track or lane error
    #[error("Media track error: {0}")]
    MediaTrackError(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtcError(String),

    /// Operation attempted from a negotiation state that does not allow it
    #[error("Invalid negotiation state: {0}")]
    InvalidState(String),

    /// The signaling channel or call loop is gone
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Local capture device could not be acquired
    #[error(transparent)]
    DeviceError(#[from] DeviceError),

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::SignalingError(_)
                | Error::WebSocketError(_)
                | Error::ChannelClosed(_)
                | Error::IoError(_)
        )
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }

    /// Check if this error is a peer-related error
    pub fn is_peer_error(&self) -> bool {
        matches!(
            self,
            Error::PeerNotFound(_)
                | Error::IceCandidateError(_)
                | Error::SdpError(_)
                | Error::InvalidState(_)
        )
    }
}

/// Capture device failures
///
/// Never fatal to a call: the affected lane falls back to a placeholder and
/// the failure is surfaced as an advisory notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeviceError {
    /// The user or platform refused access
    #[error("Permission denied for {0} capture")]
    PermissionDenied(Lane),

    /// No device exists for this lane
    #[error("No {0} capture device available")]
    Unavailable(Lane),
}

impl DeviceError {
    /// Lane the failed device would have fed
    pub fn lane(&self) -> Lane {
        match self {
            DeviceError::PermissionDenied(lane) | DeviceError::Unavailable(lane) => *lane,
        }
    }
}

/// Coarse classification of a session transport failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The transport refused the operation in its current signaling state
    InvalidState,
    /// DTLS/SSL role negotiation failed
    RoleConflict,
    /// Anything else
    Other,
}

/// Failure reported by a session transport
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    /// Failure class used to decide between recreate and bubble-up
    pub class: FailureClass,
    /// Human readable reason
    pub message: String,
}

impl TransportError {
    /// Create an error with an explicit class
    pub fn new(class: FailureClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    /// Classify a transport error from its message text
    ///
    /// Transport libraries expose these conditions only through their error
    /// text, so matching is done on lowercase keywords.
    pub fn classify(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();

        let class = if lower.contains("dtls") || lower.contains("ssl") || lower.contains("role") {
            FailureClass::RoleConflict
        } else if lower.contains("signaling state")
            || lower.contains("invalid state")
            || lower.contains("invalidstate")
            || lower.contains("proposed signaling")
            || lower.contains("rollback")
        {
            FailureClass::InvalidState
        } else {
            FailureClass::Other
        };

        Self { class, message }
    }

    /// Whether the failure leaves the session unusable
    pub fn is_structural(&self) -> bool {
        matches!(
            self.class,
            FailureClass::InvalidState | FailureClass::RoleConflict
        )
    }
}

/// Result type for session transport operations
pub type TransportResult<T> = std::result::Result<T, TransportError>;
