use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

use crate::classify::{classify, AlertStatus};

/// COCO label for the only class the crowd counter keeps.
pub const PERSON_CLASS: &str = "person";

/// Axis-aligned box in frame-buffer pixel space.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl BoundingBox {
    pub fn from_xywh([x, y, width, height]: [f32; 4]) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let ix1 = self.x.max(other.x);
        let iy1 = self.y.max(other.y);
        let ix2 = (self.x + self.width).min(other.x + other.width);
        let iy2 = (self.y + self.height).min(other.y + other.height);
        let inter = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        if inter == 0.0 {
            return 0.0;
        }
        inter / (self.area() + other.area() - inter)
    }

    /// Map a box between two raster sizes that share an origin.
    pub fn scaled(&self, sx: f32, sy: f32) -> Self {
        Self {
            x: self.x * sx,
            y: self.y * sy,
            width: self.width * sx,
            height: self.height * sy,
        }
    }
}

/// Model output as a backend hands it over, before any validation.
#[derive(Clone, Debug)]
pub struct RawPrediction {
    pub class: String,
    pub score: f32,
    pub bbox: [f32; 4],
}

impl RawPrediction {
    pub fn new(class: impl Into<String>, score: f32, bbox: [f32; 4]) -> Self {
        Self {
            class: class.into(),
            score,
            bbox,
        }
    }
}

/// Validated model output.
#[derive(Clone, Debug, PartialEq)]
pub struct Prediction {
    pub class: String,
    pub score: f32,
    pub bbox: BoundingBox,
}

impl Prediction {
    pub fn is_person(&self) -> bool {
        self.class == PERSON_CLASS
    }
}

impl TryFrom<RawPrediction> for Prediction {
    type Error = anyhow::Error;

    fn try_from(raw: RawPrediction) -> Result<Self> {
        if raw.class.trim().is_empty() {
            return Err(anyhow!("prediction has an empty class label"));
        }
        if !raw.score.is_finite() || !(0.0..=1.0).contains(&raw.score) {
            return Err(anyhow!("prediction score {} outside [0, 1]", raw.score));
        }
        if raw.bbox.iter().any(|v| !v.is_finite()) {
            return Err(anyhow!("prediction bbox {:?} is not finite", raw.bbox));
        }
        let [_, _, w, h] = raw.bbox;
        if w < 0.0 || h < 0.0 {
            return Err(anyhow!("prediction bbox {:?} has negative extent", raw.bbox));
        }
        Ok(Self {
            class: raw.class,
            score: raw.score,
            bbox: BoundingBox::from_xywh(raw.bbox),
        })
    }
}

/// One qualifying person in a frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub score: f32,
}

/// Outcome of one detection pass.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionResult {
    pub count: usize,
    pub status: AlertStatus,
    /// `data:image/jpeg;base64,...` snapshot of the annotated frame.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub detections: Vec<Detection>,
}

impl DetectionResult {
    pub fn from_detections(detections: Vec<Detection>, image: Option<String>) -> Self {
        let count = detections.len();
        Self {
            count,
            status: classify(count).status,
            image,
            detections,
        }
    }

    /// Zero-count Green result used when detection cannot run.
    pub fn fallback() -> Self {
        Self::from_detections(Vec::new(), None)
    }

    pub fn label(&self) -> String {
        classify(self.count).label
    }
}
