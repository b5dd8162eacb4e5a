//! Fixed media lanes

use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the three positional sender slots of a session
///
/// Every session carries exactly these lanes, in declaration order, for its
/// whole lifetime. The session description encodes lanes by position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lane {
    /// Microphone
    Audio,
    /// Camera
    Video,
    /// Screen share
    Screen,
}

/// Wire-level media kind of a lane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl Lane {
    /// All lanes in session order
    pub const ALL: [Lane; 3] = [Lane::Audio, Lane::Video, Lane::Screen];

    /// Position of this lane in the session description
    pub fn index(self) -> usize {
        match self {
            Lane::Audio => 0,
            Lane::Video => 1,
            Lane::Screen => 2,
        }
    }

    /// Media kind carried by this lane
    pub fn kind(self) -> MediaKind {
        match self {
            Lane::Audio => MediaKind::Audio,
            Lane::Video | Lane::Screen => MediaKind::Video,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Lane::Audio => "audio",
            Lane::Video => "video",
            Lane::Screen => "screen",
        }
    }

    /// Track id of this lane's sender on the wire
    ///
    /// Fixed for the life of a session whatever source the lane carries,
    /// since a sender keeps the track id it was first negotiated with.
    pub fn wire_id(self) -> &'static str {
        match self {
            Lane::Audio => "microphone",
            Lane::Video => "camera",
            Lane::Screen => "screen",
        }
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl MediaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
