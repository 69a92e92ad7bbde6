//! V4L2 camera track.
//!
//! Opens a local device node (e.g. `/dev/video0`), negotiates the requested
//! size, and hands out frames from a memory-mapped buffer ring. Frames are
//! converted to RGB in memory; nothing is written to disk.

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use ouroboros::self_referencing;
use std::sync::Mutex;
use std::sync::Arc;

use super::normalize::{normalize_to_rgb, PixelFormat};
use super::stream::{MediaConstraints, MediaDevices, MediaStream, TrackSettings, VideoTrack};

#[derive(Clone, Debug)]
pub struct V4l2Config {
    /// Device path (e.g., "/dev/video0")
    pub device: String,
    /// Requested frame rate; 0 keeps the driver default.
    pub target_fps: u32,
}

#[self_referencing]
struct DeviceV4l2State {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

struct V4l2Inner {
    state: Option<DeviceV4l2State>,
    frame_count: u64,
}

pub struct V4l2Track {
    config: V4l2Config,
    width: u32,
    height: u32,
    format: PixelFormat,
    inner: Mutex<V4l2Inner>,
}

impl V4l2Track {
    pub fn open(config: V4l2Config, constraints: &MediaConstraints) -> Result<Self> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device = v4l::Device::with_path(&config.device)
            .with_context(|| format!("open v4l2 device {}", config.device))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = constraints.ideal_width;
        format.height = constraints.ideal_height;
        format.fourcc = v4l::FourCC::new(b"YUYV");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Track: failed to set format on {}: {}",
                    config.device,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };
        let pixel_format = PixelFormat::from_fourcc(&format.fourcc.repr).ok_or_else(|| {
            anyhow!(
                "v4l2 device {} delivers unsupported format {}",
                config.device,
                format.fourcc
            )
        })?;

        if config.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(config.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!(
                    "V4l2Track: failed to set fps on {}: {}",
                    config.device,
                    err
                );
            }
        }

        let state = DeviceV4l2StateBuilder {
            device,
            stream_builder: |device| {
                v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                    .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))
            },
        }
        .try_build()?;

        log::info!(
            "V4l2Track: connected to {} ({}x{}, {:?}, facing {:?} requested)",
            config.device,
            format.width,
            format.height,
            pixel_format,
            constraints.facing_mode
        );
        Ok(Self {
            config,
            width: format.width,
            height: format.height,
            format: pixel_format,
            inner: Mutex::new(V4l2Inner {
                state: Some(state),
                frame_count: 0,
            }),
        })
    }
}

impl VideoTrack for V4l2Track {
    fn label(&self) -> String {
        self.config.device.clone()
    }

    fn settings(&self) -> TrackSettings {
        TrackSettings {
            width: self.width,
            height: self.height,
        }
    }

    fn capture(&self) -> Result<Option<RgbImage>> {
        use v4l::io::traits::CaptureStream;

        let mut inner = self
            .inner
            .lock()
            .map_err(|_| anyhow!("v4l2 track lock poisoned"))?;
        let Some(state) = inner.state.as_mut() else {
            return Ok(None);
        };
        let frame = state.with_mut(|fields| {
            let (buf, _meta) = fields
                .stream
                .next()
                .map_err(|err| anyhow::Error::new(err).context("capture v4l2 frame"))?;
            normalize_to_rgb(buf, self.width, self.height, self.format)
        })?;
        inner.frame_count += 1;
        Ok(Some(frame))
    }

    fn stop(&self) {
        if let Ok(mut inner) = self.inner.lock() {
            if inner.state.take().is_some() {
                log::info!(
                    "V4l2Track: released {} after {} frames",
                    self.config.device,
                    inner.frame_count
                );
            }
        }
    }

    fn is_live(&self) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.state.is_some())
            .unwrap_or(false)
    }
}

/// `MediaDevices` backed by one V4L2 device node.
pub struct V4l2Devices {
    config: V4l2Config,
}

impl V4l2Devices {
    pub fn new(config: V4l2Config) -> Self {
        Self { config }
    }
}

impl MediaDevices for V4l2Devices {
    fn get_user_media(&self, constraints: &MediaConstraints) -> Result<MediaStream> {
        let track = V4l2Track::open(self.config.clone(), constraints)?;
        Ok(MediaStream::new(vec![Arc::new(track)]))
    }
}
