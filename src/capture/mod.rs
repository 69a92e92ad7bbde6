//! Media capture.
//!
//! A small model of browser media capture:
//! - `MediaDevices` hands out `MediaStream`s (camera permission, device choice)
//! - `MediaStream` owns one or more `VideoTrack`s and stops them together
//! - `VideoElement` binds a stream, tracks playback readiness and rendered size
//!
//! Sources:
//! - `stub://...` devices produce synthetic frames (tests, demos)
//! - still images (one-shot detection)
//! - V4L2 device nodes (feature: ingest-v4l2)

#[cfg(feature = "ingest-v4l2")]
mod normalize;
pub mod still;
pub mod stream;
pub mod synthetic;
#[cfg(feature = "ingest-v4l2")]
pub mod v4l2;
pub mod video;

use anyhow::Result;

pub use still::StillImageTrack;
pub use stream::{
    FacingMode, MediaConstraints, MediaDevices, MediaStream, TrackSettings, VideoTrack,
};
pub use synthetic::{SyntheticCamera, SyntheticDevices};
#[cfg(feature = "ingest-v4l2")]
pub use v4l2::{V4l2Config, V4l2Devices, V4l2Track};
pub use video::{stop_camera, ReadyState, VideoElement};

/// Pick the `MediaDevices` implementation for a configured device string.
pub fn devices_for(device: &str, target_fps: u32) -> Result<Box<dyn MediaDevices>> {
    if device.starts_with("stub://") {
        return Ok(Box::new(SyntheticDevices::new(device)));
    }
    #[cfg(feature = "ingest-v4l2")]
    {
        Ok(Box::new(V4l2Devices::new(V4l2Config {
            device: device.to_string(),
            target_fps,
        })))
    }
    #[cfg(not(feature = "ingest-v4l2"))]
    {
        let _ = target_fps;
        anyhow::bail!("camera device {} requires the ingest-v4l2 feature", device)
    }
}
