//! Local media lanes and inbound stream roles
//!
//! Handles the fixed Audio/Video/Screen sender table, placeholder
//! substitution, device acquisition and camera/screen classification.

pub mod allocator;
pub mod classifier;
pub mod devices;
pub mod intent;
pub mod lane;
pub mod source;

pub use allocator::{BoundLane, TrackLaneAllocator};
pub use classifier::{classify, role_for, StreamRole, TrackMetadata};
pub use devices::{MediaDevices, NoDevices};
pub use intent::{CameraFacing, LocalMediaIntent};
pub use lane::{Lane, MediaKind};
pub use source::{LocalSource, MediaFrame};

/// Real local sources currently captured, one optional source per lane
///
/// Absent lanes are filled with placeholders when a session binds them.
#[derive(Debug, Clone, Default)]
pub struct LaneSources {
    pub audio: Option<LocalSource>,
    pub video: Option<LocalSource>,
    pub screen: Option<LocalSource>,
}

impl LaneSources {
    pub fn get(&self, lane: Lane) -> Option<&LocalSource> {
        match lane {
            Lane::Audio => self.audio.as_ref(),
            Lane::Video => self.video.as_ref(),
            Lane::Screen => self.screen.as_ref(),
        }
    }

    /// Store `source` for `lane`, returning the previous one
    pub fn set(&mut self, lane: Lane, source: Option<LocalSource>) -> Option<LocalSource> {
        let slot = match lane {
            Lane::Audio => &mut self.audio,
            Lane::Video => &mut self.video,
            Lane::Screen => &mut self.screen,
        };
        std::mem::replace(slot, source)
    }

    /// Whether a camera or screen is being sent
    pub fn has_visual(&self) -> bool {
        self.video.is_some() || self.screen.is_some()
    }

    /// Stop and drop every source
    pub fn stop_all(&mut self) {
        for lane in Lane::ALL {
            if let Some(source) = self.set(lane, None) {
                source.stop();
            }
        }
    }
}
