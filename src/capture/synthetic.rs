//! Synthetic camera for `stub://` devices and tests.
//!
//! Produces frames of a dark scene in which a varying number of bright
//! "walkers" drift across the four quadrants, so region-based stub detection
//! sees the crowd level change over time.

use anyhow::{anyhow, Result};
use image::{Rgb, RgbImage};
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::sync::Arc;

use super::stream::{MediaConstraints, MediaDevices, MediaStream, TrackSettings, VideoTrack};

/// Frames between scene changes.
const SCENE_PERIOD: u64 = 25;

pub struct SyntheticCamera {
    label: String,
    width: u32,
    height: u32,
    live: AtomicBool,
    state: Mutex<SceneState>,
}

struct SceneState {
    frame_count: u64,
    scene: u8,
}

impl SyntheticCamera {
    pub fn new(label: impl Into<String>, width: u32, height: u32) -> Self {
        Self {
            label: label.into(),
            width,
            height,
            live: AtomicBool::new(true),
            state: Mutex::new(SceneState {
                frame_count: 0,
                scene: 0,
            }),
        }
    }

    pub fn frames_captured(&self) -> u64 {
        self.state.lock().map(|s| s.frame_count).unwrap_or(0)
    }

    fn render(&self, scene: u8) -> RgbImage {
        let mut rng = rand::thread_rng();
        let mut frame = RgbImage::from_fn(self.width, self.height, |_, _| {
            let v = rng.gen_range(10..40u8);
            Rgb([v, v, v])
        });

        // Quadrants 0..=3 light up in turn as the scene advances.
        let lit = (scene % 5) as u32;
        let (qw, qh) = (self.width / 2, self.height / 2);
        for quadrant in 0..lit {
            let x0 = (quadrant % 2) * qw;
            let y0 = (quadrant / 2) * qh;
            for y in y0..(y0 + qh).min(self.height) {
                for x in x0..(x0 + qw).min(self.width) {
                    frame.put_pixel(x, y, Rgb([200, 190, 180]));
                }
            }
        }
        frame
    }
}

impl VideoTrack for SyntheticCamera {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn settings(&self) -> TrackSettings {
        TrackSettings {
            width: self.width,
            height: self.height,
        }
    }

    fn capture(&self) -> Result<Option<RgbImage>> {
        if !self.is_live() {
            return Ok(None);
        }
        let scene = {
            let mut state = self
                .state
                .lock()
                .map_err(|_| anyhow!("synthetic camera lock poisoned"))?;
            state.frame_count += 1;
            if state.frame_count % SCENE_PERIOD == 0 {
                state.scene = state.scene.wrapping_add(1);
            }
            state.scene
        };
        Ok(Some(self.render(scene)))
    }

    fn stop(&self) {
        if self.live.swap(false, Ordering::AcqRel) {
            log::info!("SyntheticCamera: {} stopped", self.label);
        }
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }
}

/// `MediaDevices` handing out synthetic cameras.
pub struct SyntheticDevices {
    label: String,
    deny: bool,
}

impl SyntheticDevices {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            deny: false,
        }
    }

    /// Devices that refuse every request, as when permission is denied.
    pub fn denied() -> Self {
        Self {
            label: "stub://denied".to_string(),
            deny: true,
        }
    }
}

impl MediaDevices for SyntheticDevices {
    fn get_user_media(&self, constraints: &MediaConstraints) -> Result<MediaStream> {
        if self.deny {
            return Err(anyhow!("camera permission denied for {}", self.label));
        }
        if constraints.ideal_width == 0 || constraints.ideal_height == 0 {
            return Err(anyhow!("no camera mode matches {:?}", constraints));
        }
        log::info!(
            "SyntheticCamera: connected to {} ({}x{}, {:?})",
            self.label,
            constraints.ideal_width,
            constraints.ideal_height,
            constraints.facing_mode
        );
        let camera = SyntheticCamera::new(
            self.label.clone(),
            constraints.ideal_width,
            constraints.ideal_height,
        );
        Ok(MediaStream::new(vec![Arc::new(camera)]))
    }
}
