//! Signaling message types
//!
//! JSON objects discriminated by `type`, with camelCase fields:
//!
//! ```json
//! {"type": "call-offer", "roomId": "r1", "from": "alice", "to": "bob",
//!  "payload": {"type": "offer", "sdp": "v=0..."}}
//! ```

use serde::{Deserialize, Serialize};

/// Message exchanged with the signaling relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    /// Announce presence in a room
    #[serde(rename_all = "camelCase")]
    CallJoin {
        room_id: String,
        username: String,
        #[serde(default)]
        is_listener: bool,
    },

    /// Broadcast by the relay when someone joins
    CallNewPeer { username: String },

    #[serde(rename_all = "camelCase")]
    CallOffer {
        #[serde(default)]
        room_id: String,
        from: String,
        to: String,
        payload: SessionDescription,
    },

    #[serde(rename_all = "camelCase")]
    CallAnswer {
        #[serde(default)]
        room_id: String,
        from: String,
        to: String,
        payload: SessionDescription,
    },

    #[serde(rename_all = "camelCase")]
    CallIce {
        #[serde(default)]
        room_id: String,
        from: String,
        to: String,
        payload: IceCandidate,
    },

    /// Sent on leave, broadcast by the relay
    #[serde(rename_all = "camelCase")]
    CallPeerLeft {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        room_id: Option<String>,
        username: String,
    },

    /// Heartbeat probe
    Ping { timestamp: u64 },

    /// Heartbeat response
    Pong { timestamp: u64 },

    /// Any message type this client does not handle (chat, notifications, ...)
    #[serde(other)]
    Unknown,
}

/// Session description payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

/// Offer or answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// ICE candidate payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default)]
    pub username_fragment: Option<String>,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

impl SignalMessage {
    /// `call-join` for an active (non-listener) participant
    pub fn join(room_id: impl Into<String>, username: impl Into<String>) -> Self {
        SignalMessage::CallJoin {
            room_id: room_id.into(),
            username: username.into(),
            is_listener: false,
        }
    }

    /// `call-peer-left` announcing our own departure
    pub fn leave(room_id: impl Into<String>, username: impl Into<String>) -> Self {
        SignalMessage::CallPeerLeft {
            room_id: Some(room_id.into()),
            username: username.into(),
        }
    }

    /// Peer this message originates from, if it names one
    pub fn sender(&self) -> Option<&str> {
        match self {
            SignalMessage::CallOffer { from, .. }
            | SignalMessage::CallAnswer { from, .. }
            | SignalMessage::CallIce { from, .. } => Some(from),
            SignalMessage::CallNewPeer { username }
            | SignalMessage::CallPeerLeft { username, .. }
            | SignalMessage::CallJoin { username, .. } => Some(username),
            SignalMessage::Ping { .. } | SignalMessage::Pong { .. } | SignalMessage::Unknown => {
                None
            }
        }
    }

    /// Addressed recipient, for directed messages
    pub fn recipient(&self) -> Option<&str> {
        match self {
            SignalMessage::CallOffer { to, .. }
            | SignalMessage::CallAnswer { to, .. }
            | SignalMessage::CallIce { to, .. } => Some(to),
            _ => None,
        }
    }

    /// Wire name of the message type, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::CallJoin { .. } => "call-join",
            SignalMessage::CallNewPeer { .. } => "call-new-peer",
            SignalMessage::CallOffer { .. } => "call-offer",
            SignalMessage::CallAnswer { .. } => "call-answer",
            SignalMessage::CallIce { .. } => "call-ice",
            SignalMessage::CallPeerLeft { .. } => "call-peer-left",
            SignalMessage::Ping { .. } => "ping",
            SignalMessage::Pong { .. } => "pong",
            SignalMessage::Unknown => "unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_wire_format() {
        let msg = SignalMessage::join("r1", "alice");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(
            value,
            json!({"type": "call-join", "roomId": "r1", "username": "alice", "isListener": false})
        );
    }

    #[test]
    fn test_offer_wire_format() {
        let msg = SignalMessage::CallOffer {
            room_id: "r1".to_string(),
            from: "alice".to_string(),
            to: "bob".to_string(),
            payload: SessionDescription::offer("v=0"),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "call-offer");
        assert_eq!(value["payload"]["type"], "offer");
        assert_eq!(value["payload"]["sdp"], "v=0");
        assert_eq!(msg.sender(), Some("alice"));
        assert_eq!(msg.recipient(), Some("bob"));
    }

    #[test]
    fn test_parse_browser_ice() {
        let msg: SignalMessage = serde_json::from_value(json!({
            "type": "call-ice",
            "roomId": "r1",
            "from": "bob",
            "to": "alice",
            "payload": {
                "candidate": "candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host",
                "sdpMid": "0",
                "sdpMLineIndex": 0,
                "usernameFragment": null
            }
        }))
        .unwrap();

        match msg {
            SignalMessage::CallIce { payload, .. } => {
                assert_eq!(payload.sdp_mid.as_deref(), Some("0"));
                assert_eq!(payload.sdp_mline_index, Some(0));
                assert!(payload.username_fragment.is_none());
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_peer_left_without_room() {
        let msg: SignalMessage =
            serde_json::from_str(r#"{"type":"call-peer-left","username":"bob"}"#).unwrap();
        assert_eq!(
            msg,
            SignalMessage::CallPeerLeft {
                room_id: None,
                username: "bob".to_string()
            }
        );

        let text = serde_json::to_string(&msg).unwrap();
        assert!(!text.contains("roomId"));
    }

    #[test]
    fn test_unknown_type_tolerated() {
        let msg: SignalMessage =
            serde_json::from_str(r#"{"type":"chat-message","text":"hi"}"#).unwrap();
        assert_eq!(msg, SignalMessage::Unknown);
        assert_eq!(msg.sender(), None);
    }

    #[test]
    fn test_heartbeat_messages() {
        let msg: SignalMessage = serde_json::from_str(r#"{"type":"pong","timestamp":42}"#).unwrap();
        assert_eq!(msg, SignalMessage::Pong { timestamp: 42 });
        assert_eq!(msg.kind(), "pong");
    }
}
