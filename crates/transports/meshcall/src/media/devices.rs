//! Capture device acquisition

use super::{CameraFacing, Lane, LocalSource};
use crate::error::DeviceError;
use async_trait::async_trait;

/// Device acquisition capability supplied by the embedding application
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Open the default microphone
    async fn microphone(&self) -> Result<LocalSource, DeviceError>;

    /// Open the camera facing `facing`
    async fn camera(&self, facing: CameraFacing) -> Result<LocalSource, DeviceError>;

    /// Start a screen capture
    async fn screen(&self) -> Result<LocalSource, DeviceError>;
}

/// Acquire the device feeding `lane`
pub async fn acquire(
    devices: &dyn MediaDevices,
    lane: Lane,
    facing: CameraFacing,
) -> Result<LocalSource, DeviceError> {
    match lane {
        Lane::Audio => devices.microphone().await,
        Lane::Video => devices.camera(facing).await,
        Lane::Screen => devices.screen().await,
    }
}

/// Host without any capture device (headless processes)
///
/// Calls made with it are receive-only.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDevices;

#[async_trait]
impl MediaDevices for NoDevices {
    async fn microphone(&self) -> Result<LocalSource, DeviceError> {
        Err(DeviceError::Unavailable(Lane::Audio))
    }

    async fn camera(&self, _facing: CameraFacing) -> Result<LocalSource, DeviceError> {
        Err(DeviceError::Unavailable(Lane::Video))
    }

    async fn screen(&self) -> Result<LocalSource, DeviceError> {
        Err(DeviceError::Unavailable(Lane::Screen))
    }
}
