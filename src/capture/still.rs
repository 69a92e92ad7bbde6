//! Single-image video track, used for one-shot detection on stored pictures.

use anyhow::{Context, Result};
use image::RgbImage;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use super::stream::{TrackSettings, VideoTrack};

pub struct StillImageTrack {
    label: String,
    image: RgbImage,
    live: AtomicBool,
}

impl StillImageTrack {
    pub fn new(image: RgbImage) -> Self {
        Self {
            label: "still".to_string(),
            image,
            live: AtomicBool::new(true),
        }
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let image = image::open(path)
            .with_context(|| format!("failed to open image {}", path.display()))?
            .to_rgb8();
        Ok(Self {
            label: path.display().to_string(),
            image,
            live: AtomicBool::new(true),
        })
    }
}

impl VideoTrack for StillImageTrack {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn settings(&self) -> TrackSettings {
        TrackSettings {
            width: self.image.width(),
            height: self.image.height(),
        }
    }

    fn capture(&self) -> Result<Option<RgbImage>> {
        if !self.is_live() {
            return Ok(None);
        }
        Ok(Some(self.image.clone()))
    }

    fn stop(&self) {
        self.live.store(false, Ordering::Release);
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }
}
