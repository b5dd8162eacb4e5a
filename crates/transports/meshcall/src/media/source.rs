//! Local media source handles

use super::Lane;
use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};

/// Frames buffered per subscriber before the slowest one starts lagging
const FRAME_BUFFER: usize = 64;

/// Encoded media frame pushed by a capture device
#[derive(Debug, Clone)]
pub struct MediaFrame {
    /// Encoded payload (Opus for audio, VP8 for video)
    pub data: Bytes,
    /// Playout duration of this frame
    pub duration: Duration,
}

/// Handle to a local media source, real or placeholder
///
/// Cloning is cheap and clones refer to the same source, so one captured
/// microphone can feed the audio lane of every session at once.
#[derive(Clone)]
pub struct LocalSource {
    inner: Arc<SourceInner>,
}

struct SourceInner {
    id: String,
    lane: Lane,
    label: String,
    placeholder: bool,
    enabled: AtomicBool,
    ended: watch::Sender<bool>,
    frames: broadcast::Sender<MediaFrame>,
}

impl LocalSource {
    /// Wrap a source captured from a device; starts enabled
    ///
    /// Ids are prefixed with the lane's wire id, so screen sources always
    /// carry `screen` in their id.
    pub fn capture(lane: Lane, label: impl Into<String>) -> Self {
        let id = format!("{}-{}", lane.wire_id(), uuid::Uuid::new_v4().simple());
        Self::build(id, lane, label.into(), false, true)
    }

    /// Create an inert placeholder for `lane`; starts disabled
    ///
    /// Transports send near-silence for audio placeholders and a black still
    /// frame for video and screen placeholders.
    pub fn placeholder(lane: Lane) -> Self {
        let id = format!("placeholder-{}", lane);
        let label = format!("{} placeholder", lane);
        Self::build(id, lane, label, true, false)
    }

    fn build(id: String, lane: Lane, label: String, placeholder: bool, enabled: bool) -> Self {
        let (ended, _) = watch::channel(false);
        let (frames, _) = broadcast::channel(FRAME_BUFFER);
        Self {
            inner: Arc::new(SourceInner {
                id,
                lane,
                label,
                placeholder,
                enabled: AtomicBool::new(enabled),
                ended,
                frames,
            }),
        }
    }

    /// Local identity of the source
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn lane(&self) -> Lane {
        self.inner.lane
    }

    /// Device label
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_placeholder(&self) -> bool {
        self.inner.placeholder
    }

    /// Whether frames should be sent (false means muted / black)
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::Release);
    }

    /// Stop the source; every `ended()` watcher is notified
    pub fn stop(&self) {
        self.set_enabled(false);
        self.inner.ended.send_replace(true);
    }

    pub fn is_ended(&self) -> bool {
        *self.inner.ended.borrow()
    }

    /// Watch for the source ending (device unplugged, share stopped by the OS)
    pub fn ended(&self) -> watch::Receiver<bool> {
        self.inner.ended.subscribe()
    }

    /// Push an encoded frame to every session carrying this source
    ///
    /// Returns false when no session is currently subscribed.
    pub fn push_frame(&self, frame: MediaFrame) -> bool {
        self.inner.frames.send(frame).is_ok()
    }

    /// Subscribe to frames pushed by the device
    pub fn subscribe(&self) -> broadcast::Receiver<MediaFrame> {
        self.inner.frames.subscribe()
    }

    /// Whether both handles refer to the same source
    pub fn same_as(&self, other: &LocalSource) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for LocalSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalSource")
            .field("id", &self.inner.id)
            .field("lane", &self.inner.lane)
            .field("placeholder", &self.inner.placeholder)
            .field("enabled", &self.is_enabled())
            .finish()
    }
}
