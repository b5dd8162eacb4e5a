//! Desired local media state

use serde::{Deserialize, Serialize};

/// Which camera to capture from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CameraFacing {
    /// Front camera
    #[default]
    User,
    /// Rear camera
    Environment,
}

impl CameraFacing {
    /// The other camera
    pub fn toggled(self) -> Self {
        match self {
            CameraFacing::User => CameraFacing::Environment,
            CameraFacing::Environment => CameraFacing::User,
        }
    }
}

/// What the user asked to send
///
/// Mutated only by user actions and by reconnection restoring a snapshot.
/// Lane content of every session is derived from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalMediaIntent {
    pub muted: bool,
    pub video_enabled: bool,
    pub screen_sharing: bool,
    pub camera_facing: CameraFacing,
}

impl LocalMediaIntent {
    /// Whether a visual lane (camera or screen) is wanted
    pub fn wants_visual(&self) -> bool {
        self.video_enabled || self.screen_sharing
    }
}
