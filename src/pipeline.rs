//! Single-shot detection: sample, detect, classify, annotate.

use ab_glyph::FontArc;
use anyhow::{bail, Result};

use crate::capture::VideoElement;
use crate::classify::classify;
use crate::detect::{DetectionEngine, DetectionResult};
use crate::frame::{FrameSampler, DEFAULT_MAX_SIDE};
use crate::overlay::{OverlayCanvas, OverlayRenderer, RasterCanvas, DEFAULT_JPEG_QUALITY};

/// Per-call knobs for `detect_people`.
#[derive(Clone)]
pub struct DetectOptions {
    /// Longest side of the sampled frame (512 for live cameras, 448 for recordings).
    pub max_side: u32,
    pub jpeg_quality: u8,
    /// Attach an annotated JPEG snapshot to the result.
    pub snapshot: bool,
    /// Label font; `None` uses the bundled DejaVu Sans.
    pub font: Option<FontArc>,
}

impl Default for DetectOptions {
    fn default() -> Self {
        Self {
            max_side: DEFAULT_MAX_SIDE,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            snapshot: true,
            font: None,
        }
    }
}

impl DetectOptions {
    pub fn with_max_side(mut self, max_side: u32) -> Self {
        self.max_side = max_side;
        self
    }
}

/// Run one detection pass against the element's current frame.
///
/// When `overlay` is given it is resized to the element's rendered size,
/// cleared, and annotated with boxes scaled from sampled-frame space.
pub fn detect_people(
    video: &VideoElement,
    engine: &DetectionEngine,
    sampler: &mut FrameSampler,
    overlay: Option<&mut dyn OverlayCanvas>,
    options: &DetectOptions,
) -> Result<DetectionResult> {
    if !video.has_frame() {
        bail!("video not ready (ready state {:?})", video.ready_state());
    }
    sampler.set_max_side(options.max_side);
    let frame = sampler.sample(video)?;
    let frame_size = frame.dimensions();

    let detections = engine.detect(frame)?;
    let classification = classify(detections.len());
    let renderer = OverlayRenderer::default();

    if let Some(canvas) = overlay {
        let (width, height) = video.client_size();
        canvas.resize(width, height);
        canvas.clear();
        renderer.render(canvas, &detections, &classification, frame_size);
    }

    let image = if options.snapshot {
        let mut snapshot = RasterCanvas::from_frame(frame).with_font(options.font.clone());
        renderer.render(&mut snapshot, &detections, &classification, frame_size);
        match snapshot.to_jpeg_data_url(options.jpeg_quality) {
            Ok(url) => Some(url),
            Err(e) => {
                log::warn!("snapshot encoding failed: {:#}", e);
                None
            }
        }
    } else {
        None
    };

    log::debug!(
        "detected {} people in {}x{} frame ({})",
        detections.len(),
        frame_size.0,
        frame_size.1,
        classification.label
    );
    Ok(DetectionResult::from_detections(detections, image))
}

/// `detect_people`, collapsing any failure into the zero-count Green result.
pub fn detect_people_or_fallback(
    video: &VideoElement,
    engine: &DetectionEngine,
    sampler: &mut FrameSampler,
    overlay: Option<&mut dyn OverlayCanvas>,
    options: &DetectOptions,
) -> DetectionResult {
    match detect_people(video, engine, sampler, overlay, options) {
        Ok(result) => result,
        Err(e) => {
            log::error!("person detection failed: {:#}", e);
            DetectionResult::fallback()
        }
    }
}
