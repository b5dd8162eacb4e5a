//! Fixed three-lane sender table
//!
//! Every session binds Audio, Video and Screen exactly once, in that order.
//! Missing media is a disabled placeholder, never a missing lane, and later
//! content changes go through [`TrackLaneAllocator::replace`], which swaps the
//! sender content in place. Removing or reordering lanes after the first
//! exchange would produce a description the remote side cannot match.

use super::{Lane, LaneSources, LocalSource};
use crate::negotiation::SessionTransport;
use crate::{Error, Result};
use tracing::debug;

/// Snapshot of one bound lane
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundLane {
    pub lane: Lane,
    pub track_id: String,
    pub placeholder: bool,
    pub enabled: bool,
}

/// Per-session lane table
#[derive(Debug, Default)]
pub struct TrackLaneAllocator {
    slots: Vec<LocalSource>,
}

impl TrackLaneAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the next lane to `source`, or to a fresh placeholder
    ///
    /// # Errors
    ///
    /// Fails when `lane` is not the next lane in order (including rebinding an
    /// already bound lane) or when the transport rejects the sender.
    pub async fn bind(
        &mut self,
        transport: &dyn SessionTransport,
        lane: Lane,
        source: Option<LocalSource>,
    ) -> Result<LocalSource> {
        let expected = Lane::ALL.get(self.slots.len()).copied().ok_or_else(|| {
            Error::MediaTrackError(format!("All lanes already bound, cannot bind {}", lane))
        })?;

        if lane != expected {
            return Err(Error::MediaTrackError(format!(
                "Lane {} bound out of order, expected {}",
                lane, expected
            )));
        }

        let applied = source.unwrap_or_else(|| LocalSource::placeholder(lane));
        check_lane(lane, &applied)?;

        transport
            .add_lane(lane, &applied)
            .await
            .map_err(|e| Error::MediaTrackError(format!("Failed to bind {} lane: {}", lane, e)))?;

        debug!(
            "Bound {} lane to {} (placeholder: {})",
            lane,
            applied.id(),
            applied.is_placeholder()
        );

        self.slots.push(applied.clone());
        Ok(applied)
    }

    /// Bind all three lanes from `sources`, in order
    pub async fn bind_all(
        &mut self,
        transport: &dyn SessionTransport,
        sources: &LaneSources,
    ) -> Result<()> {
        for lane in Lane::ALL {
            self.bind(transport, lane, sources.get(lane).cloned()).await?;
        }
        Ok(())
    }

    /// Swap the content of a bound lane; `None` substitutes a placeholder
    ///
    /// Placeholders owned by this table are stopped once swapped out. Real
    /// sources are shared between sessions and are left running.
    pub async fn replace(
        &mut self,
        transport: &dyn SessionTransport,
        lane: Lane,
        source: Option<LocalSource>,
    ) -> Result<LocalSource> {
        if lane.index() >= self.slots.len() {
            return Err(Error::MediaTrackError(format!(
                "Cannot replace unbound {} lane",
                lane
            )));
        }

        let applied = source.unwrap_or_else(|| LocalSource::placeholder(lane));
        check_lane(lane, &applied)?;

        transport
            .replace_lane(lane, &applied)
            .await
            .map_err(|e| Error::MediaTrackError(format!("Failed to replace {} lane: {}", lane, e)))?;

        let previous = std::mem::replace(&mut self.slots[lane.index()], applied.clone());
        if previous.is_placeholder() {
            previous.stop();
        }

        debug!(
            "Replaced {} lane content: {} -> {}",
            lane,
            previous.id(),
            applied.id()
        );

        Ok(applied)
    }

    /// Content currently bound to `lane`
    pub fn source(&self, lane: Lane) -> Option<&LocalSource> {
        self.slots.get(lane.index())
    }

    /// Whether all three lanes are bound
    pub fn is_complete(&self) -> bool {
        self.slots.len() == Lane::ALL.len()
    }

    /// Bound lanes in session order
    pub fn lanes(&self) -> Vec<BoundLane> {
        self.slots
            .iter()
            .map(|source| BoundLane {
                lane: source.lane(),
                track_id: source.id().to_string(),
                placeholder: source.is_placeholder(),
                enabled: source.is_enabled(),
            })
            .collect()
    }

    /// Stop owned placeholders and forget every lane
    pub fn release(&mut self) {
        for source in self.slots.drain(..) {
            if source.is_placeholder() {
                source.stop();
            }
        }
    }
}

fn check_lane(lane: Lane, source: &LocalSource) -> Result<()> {
    if source.lane() != lane {
        return Err(Error::MediaTrackError(format!(
            "Source {} belongs to the {} lane, not {}",
            source.id(),
            source.lane(),
            lane
        )));
    }
    Ok(())
}
