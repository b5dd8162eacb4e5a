//! Camera vs screen classification of inbound lanes
//!
//! The wire protocol carries no role tag, so the role is inferred from lane
//! metadata. Priority order:
//!
//! 1. display surface kind (monitor, window, application, browser)
//! 2. label keywords
//! 3. screen-sized resolution
//! 4. a surface constraint on the source
//!
//! Anything else is a camera. A high resolution camera can be misread as a
//! screen; senders built on this crate put `screen` in their screen track ids
//! so rule 2 catches them first.

use super::MediaKind;
use serde::{Deserialize, Serialize};

const SCREEN_SURFACES: &[&str] = &["monitor", "window", "application", "browser", "browser-tab"];

const SCREEN_KEYWORDS: &[&str] = &[
    "screen",
    "monitor",
    "display",
    "desktop",
    "window",
    "tab",
    "application",
    "capture",
];

/// Semantic role of a received lane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamRole {
    Audio,
    Camera,
    Screen,
}

/// Metadata available for an inbound lane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackMetadata {
    pub kind: MediaKind,
    /// Track label (track id when the transport exposes no label)
    pub label: String,
    /// Reported display surface kind, if any
    pub display_surface: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// A display-surface constraint was applied to the source
    pub surface_constraint: bool,
}

impl TrackMetadata {
    /// Metadata carrying only a kind and label
    pub fn new(kind: MediaKind, label: impl Into<String>) -> Self {
        Self {
            kind,
            label: label.into(),
            display_surface: None,
            width: None,
            height: None,
            surface_constraint: false,
        }
    }

    pub fn with_surface(mut self, surface: impl Into<String>) -> Self {
        self.display_surface = Some(surface.into());
        self
    }

    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.width = Some(width);
        self.height = Some(height);
        self
    }

    pub fn with_surface_constraint(mut self) -> Self {
        self.surface_constraint = true;
        self
    }
}

/// Classify a video lane as camera or screen
///
/// Never returns [`StreamRole::Audio`]; use [`role_for`] for lanes of any kind.
pub fn classify(metadata: &TrackMetadata) -> StreamRole {
    if let Some(surface) = &metadata.display_surface {
        if SCREEN_SURFACES.contains(&surface.to_lowercase().as_str()) {
            return StreamRole::Screen;
        }
    }

    let label = metadata.label.to_lowercase();
    if SCREEN_KEYWORDS.iter().any(|keyword| label.contains(keyword)) {
        return StreamRole::Screen;
    }

    if let (Some(width), Some(height)) = (metadata.width, metadata.height) {
        if width >= 1024 && height >= 768 && (width >= 1920 || height >= 1080) {
            return StreamRole::Screen;
        }
    }

    if metadata.surface_constraint {
        return StreamRole::Screen;
    }

    StreamRole::Camera
}

/// Role of an inbound lane of any kind
pub fn role_for(metadata: &TrackMetadata) -> StreamRole {
    match metadata.kind {
        MediaKind::Audio => StreamRole::Audio,
        MediaKind::Video => classify(metadata),
    }
}
