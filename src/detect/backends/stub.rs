use anyhow::Result;
use image::RgbImage;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{RawPrediction, PERSON_CLASS};

/// Stub backend for tests and camera-less demos.
///
/// In scripted mode it replays a fixed list of frames' predictions, one entry
/// per call, repeating the last entry once the script runs out. In
/// region-activity mode it splits the frame into a 2x2 grid and reports one
/// person for every quadrant whose mean luminance crosses a threshold.
pub struct StubBackend {
    mode: StubMode,
    calls: usize,
}

enum StubMode {
    Scripted(Vec<Vec<RawPrediction>>),
    RegionActivity { luma_threshold: f32 },
}

impl StubBackend {
    pub fn new() -> Self {
        Self::scripted(Vec::new())
    }

    pub fn scripted(script: Vec<Vec<RawPrediction>>) -> Self {
        Self {
            mode: StubMode::Scripted(script),
            calls: 0,
        }
    }

    /// Same predictions on every call.
    pub fn fixed(predictions: Vec<RawPrediction>) -> Self {
        Self::scripted(vec![predictions])
    }

    pub fn region_activity() -> Self {
        Self {
            mode: StubMode::RegionActivity {
                luma_threshold: 0.3,
            },
            calls: 0,
        }
    }

    /// Number of `detect` calls served so far.
    pub fn calls(&self) -> usize {
        self.calls
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<RawPrediction>> {
        let index = self.calls;
        self.calls += 1;
        match &self.mode {
            StubMode::Scripted(script) => Ok(script
                .get(index)
                .or_else(|| script.last())
                .cloned()
                .unwrap_or_default()),
            StubMode::RegionActivity { luma_threshold } => {
                Ok(region_activity(frame, *luma_threshold))
            }
        }
    }
}

fn region_activity(frame: &RgbImage, luma_threshold: f32) -> Vec<RawPrediction> {
    let (width, height) = frame.dimensions();
    if width < 2 || height < 2 {
        return Vec::new();
    }
    let rw = width / 2;
    let rh = height / 2;

    let mut predictions = Vec::new();
    for (rx, ry) in [(0, 0), (rw, 0), (0, rh), (rw, rh)] {
        let luma = mean_luma(frame, rx, ry, rw, rh);
        if luma > luma_threshold {
            // A person-shaped box centered in the quadrant.
            let bw = rw as f32 * 0.4;
            let bh = rh as f32 * 0.8;
            let x = rx as f32 + (rw as f32 - bw) / 2.0;
            let y = ry as f32 + (rh as f32 - bh) / 2.0;
            let score = (0.5 + luma / 2.0).min(1.0);
            predictions.push(RawPrediction::new(PERSON_CLASS, score, [x, y, bw, bh]));
        }
    }
    predictions
}

fn mean_luma(frame: &RgbImage, x0: u32, y0: u32, w: u32, h: u32) -> f32 {
    let mut total = 0.0f64;
    let mut samples = 0u64;
    for y in (y0..y0 + h).step_by(4) {
        for x in (x0..x0 + w).step_by(4) {
            let [r, g, b] = frame.get_pixel(x, y).0;
            total += 0.299 * r as f64 + 0.587 * g as f64 + 0.114 * b as f64;
            samples += 1;
        }
    }
    if samples == 0 {
        return 0.0;
    }
    (total / samples as f64 / 255.0) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn scripted_backend_replays_then_repeats_last() -> Result<()> {
        let mut backend = StubBackend::scripted(vec![
            vec![RawPrediction::new("person", 0.9, [0.0, 0.0, 1.0, 1.0])],
            vec![],
        ]);
        let frame = RgbImage::new(4, 4);
        assert_eq!(backend.detect(&frame)?.len(), 1);
        assert_eq!(backend.detect(&frame)?.len(), 0);
        assert_eq!(backend.detect(&frame)?.len(), 0);
        assert_eq!(backend.calls(), 3);
        Ok(())
    }

    #[test]
    fn empty_script_yields_nothing() -> Result<()> {
        let mut backend = StubBackend::new();
        assert!(backend.detect(&RgbImage::new(4, 4))?.is_empty());
        Ok(())
    }

    #[test]
    fn region_activity_counts_bright_quadrants() -> Result<()> {
        let mut frame = RgbImage::from_pixel(64, 48, Rgb([0, 0, 0]));
        for y in 0..24 {
            for x in 0..32 {
                frame.put_pixel(x, y, Rgb([255, 255, 255]));
            }
        }
        let mut backend = StubBackend::region_activity();
        let predictions = backend.detect(&frame)?;
        assert_eq!(predictions.len(), 1);
        assert_eq!(predictions[0].class, "person");
        assert!(predictions[0].bbox[0] < 32.0);
        Ok(())
    }
}
