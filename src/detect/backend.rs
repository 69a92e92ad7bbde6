use anyhow::Result;
use image::RgbImage;

use crate::detect::result::RawPrediction;

/// Object-detection model backend.
///
/// A backend receives the sampled frame and returns every prediction the
/// model produced, unfiltered and unvalidated. Filtering by class and
/// threshold happens in `DetectionEngine`.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Run inference on an RGB frame.
    ///
    /// Boxes are `[x, y, width, height]` in the pixel space of `frame`.
    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<RawPrediction>>;

    /// Optional warm-up hook, run once right after loading.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
