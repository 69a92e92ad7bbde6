//! Frame sampling.
//!
//! Grabs the current video frame and downscales it so the longest side stays
//! within `max_side`, never going below a 160x120 floor.

use anyhow::{anyhow, Result};
use image::imageops::FilterType;
use image::RgbImage;

use crate::capture::VideoElement;

/// Default cap on the longest side of a sampled frame.
pub const DEFAULT_MAX_SIDE: u32 = 512;
pub const MIN_SAMPLE_WIDTH: u32 = 160;
pub const MIN_SAMPLE_HEIGHT: u32 = 120;

/// Target raster size for a video of natural size `(width, height)`.
///
/// Returns `None` when the video has no dimensions yet.
pub fn target_size(width: u32, height: u32, max_side: u32) -> Option<(u32, u32)> {
    if width == 0 || height == 0 {
        return None;
    }
    let longest = width.max(height) as f64;
    let scale = (max_side as f64 / longest).min(1.0);
    let w = ((width as f64 * scale).round() as u32).max(MIN_SAMPLE_WIDTH);
    let h = ((height as f64 * scale).round() as u32).max(MIN_SAMPLE_HEIGHT);
    Some((w, h))
}

/// Downscaling sampler with a raster buffer reused across ticks.
pub struct FrameSampler {
    max_side: u32,
    buffer: RgbImage,
}

impl FrameSampler {
    pub fn new(max_side: u32) -> Self {
        Self {
            max_side,
            buffer: RgbImage::new(0, 0),
        }
    }

    pub fn max_side(&self) -> u32 {
        self.max_side
    }

    pub fn set_max_side(&mut self, max_side: u32) {
        self.max_side = max_side;
    }

    /// Sample the element's current frame into the internal buffer.
    pub fn sample(&mut self, video: &VideoElement) -> Result<&RgbImage> {
        let (vw, vh) = video.video_size();
        if target_size(vw, vh, self.max_side).is_none() {
            return Err(anyhow!("video has no dimensions yet ({}x{})", vw, vh));
        }
        let frame = video.current_frame()?;
        self.sample_image(&frame)
    }

    /// Downscale an already captured frame into the internal buffer.
    pub fn sample_image(&mut self, frame: &RgbImage) -> Result<&RgbImage> {
        let (fw, fh) = frame.dimensions();
        let (tw, th) = target_size(fw, fh, self.max_side)
            .ok_or_else(|| anyhow!("frame has no dimensions ({}x{})", fw, fh))?;

        if (tw, th) == (fw, fh) {
            if self.buffer.dimensions() == (tw, th) {
                self.buffer.copy_from_slice(frame.as_raw());
            } else {
                self.buffer = frame.clone();
            }
        } else {
            self.buffer = image::imageops::resize(frame, tw, th, FilterType::Triangle);
        }
        Ok(&self.buffer)
    }

    /// Most recently sampled raster.
    pub fn buffer(&self) -> &RgbImage {
        &self.buffer
    }
}

impl Default for FrameSampler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIDE)
    }
}
