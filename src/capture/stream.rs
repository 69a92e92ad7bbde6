use anyhow::{anyhow, Result};
use image::RgbImage;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Which way the requested camera should face.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FacingMode {
    User,
    Environment,
}

impl FacingMode {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(FacingMode::User),
            "environment" => Ok(FacingMode::Environment),
            other => Err(anyhow!("unknown facing mode '{}'", other)),
        }
    }
}

/// Constraints for a camera request. Sizes are preferences, not guarantees.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MediaConstraints {
    pub facing_mode: FacingMode,
    pub ideal_width: u32,
    pub ideal_height: u32,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            facing_mode: FacingMode::Environment,
            ideal_width: 1280,
            ideal_height: 720,
        }
    }
}

/// Dimensions a track currently delivers. Zero until the source knows them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrackSettings {
    pub width: u32,
    pub height: u32,
}

/// A live source of video frames.
pub trait VideoTrack: Send + Sync {
    fn label(&self) -> String;

    fn settings(&self) -> TrackSettings;

    /// Latest frame, or `None` when the track has nothing to show yet.
    fn capture(&self) -> Result<Option<RgbImage>>;

    /// Release the underlying device. Idempotent.
    fn stop(&self);

    fn is_live(&self) -> bool;
}

/// Camera access point.
pub trait MediaDevices: Send + Sync {
    /// Acquire a stream. Fails when access is denied or no camera exists.
    fn get_user_media(&self, constraints: &MediaConstraints) -> Result<MediaStream>;
}

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to a set of acquired tracks. Clones share the same tracks.
#[derive(Clone)]
pub struct MediaStream {
    id: u64,
    tracks: Vec<Arc<dyn VideoTrack>>,
}

impl MediaStream {
    pub fn new(tracks: Vec<Arc<dyn VideoTrack>>) -> Self {
        Self {
            id: NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed),
            tracks,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn video_track(&self) -> Option<&Arc<dyn VideoTrack>> {
        self.tracks.first()
    }

    /// True while at least one track is live.
    pub fn active(&self) -> bool {
        self.tracks.iter().any(|t| t.is_live())
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

impl std::fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field(
                "tracks",
                &self.tracks.iter().map(|t| t.label()).collect::<Vec<_>>(),
            )
            .field("active", &self.active())
            .finish()
    }
}
