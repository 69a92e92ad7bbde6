#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::FilterType;
use image::RgbImage;
use tract_onnx::prelude::*;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{BoundingBox, RawPrediction};

/// COCO-80 labels in YOLOv8 output order.
const COCO_CLASSES: [&str; 80] = [
    "person", "bicycle", "car", "motorcycle", "airplane", "bus", "train", "truck", "boat",
    "traffic light", "fire hydrant", "stop sign", "parking meter", "bench", "bird", "cat", "dog",
    "horse", "sheep", "cow", "elephant", "bear", "zebra", "giraffe", "backpack", "umbrella",
    "handbag", "tie", "suitcase", "frisbee", "skis", "snowboard", "sports ball", "kite",
    "baseball bat", "baseball glove", "skateboard", "surfboard", "tennis racket", "bottle",
    "wine glass", "cup", "fork", "knife", "spoon", "bowl", "banana", "apple", "sandwich", "orange",
    "broccoli", "carrot", "hot dog", "pizza", "donut", "cake", "chair", "couch", "potted plant",
    "bed", "dining table", "toilet", "tv", "laptop", "mouse", "remote", "keyboard", "cell phone",
    "microwave", "oven", "toaster", "sink", "refrigerator", "book", "clock", "vase", "scissors",
    "teddy bear", "hair drier", "toothbrush",
];

/// Candidates below this score never reach NMS.
const CANDIDATE_FLOOR: f32 = 0.25;
const NMS_IOU: f32 = 0.45;

/// Tract-based YOLOv8 backend.
///
/// Loads a local ONNX export (`1x3xSxS` input, `[1, 84, N]` output) and maps
/// boxes back to the pixel space of the frame it was given.
pub struct TractBackend {
    model: TypedSimplePlan<TypedModel>,
    input_size: u32,
}

impl TractBackend {
    pub fn new<P: AsRef<Path>>(model_path: P, input_size: u32) -> Result<Self> {
        let model_path = model_path.as_ref();
        let size = input_size as usize;
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                InferenceFact::dt_shape(f32::datum_type(), tvec!(1, 3, size, size)),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self { model, input_size })
    }

    fn build_input(&self, frame: &RgbImage) -> Tensor {
        let size = self.input_size;
        let resized = image::imageops::resize(frame, size, size, FilterType::Triangle);
        let side = size as usize;
        tract_ndarray::Array4::from_shape_fn((1, 3, side, side), |(_, channel, y, x)| {
            resized.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0
        })
        .into_tensor()
    }

    fn decode(&self, outputs: TVec<TValue>, frame_w: u32, frame_h: u32) -> Result<Vec<RawPrediction>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?;
        let shape = view.shape().to_vec();
        if shape.len() != 3 || shape[1] != 4 + COCO_CLASSES.len() {
            return Err(anyhow!("unexpected YOLOv8 output shape {:?}", shape));
        }

        let sx = frame_w as f32 / self.input_size as f32;
        let sy = frame_h as f32 / self.input_size as f32;
        let mut candidates: Vec<(usize, f32, BoundingBox)> = Vec::new();
        for i in 0..shape[2] {
            let (class_id, score) = (0..COCO_CLASSES.len())
                .map(|c| (c, view[[0, 4 + c, i]]))
                .fold((0, f32::NEG_INFINITY), |best, cur| if cur.1 > best.1 { cur } else { best });
            if score < CANDIDATE_FLOOR {
                continue;
            }
            let cx = view[[0, 0, i]];
            let cy = view[[0, 1, i]];
            let w = view[[0, 2, i]];
            let h = view[[0, 3, i]];
            let bbox = BoundingBox::from_xywh([cx - w / 2.0, cy - h / 2.0, w, h]).scaled(sx, sy);
            candidates.push((class_id, score, bbox));
        }

        Ok(non_max_suppression(candidates)
            .into_iter()
            .map(|(class_id, score, b)| {
                RawPrediction::new(COCO_CLASSES[class_id], score, [b.x, b.y, b.width, b.height])
            })
            .collect())
    }
}

fn non_max_suppression(
    mut candidates: Vec<(usize, f32, BoundingBox)>,
) -> Vec<(usize, f32, BoundingBox)> {
    candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    let mut keep: Vec<(usize, f32, BoundingBox)> = Vec::new();
    for candidate in candidates {
        let overlaps = keep
            .iter()
            .any(|kept| kept.0 == candidate.0 && kept.2.iou(&candidate.2) > NMS_IOU);
        if !overlaps {
            keep.push(candidate);
        }
    }
    keep
}

impl DetectorBackend for TractBackend {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn detect(&mut self, frame: &RgbImage) -> Result<Vec<RawPrediction>> {
        let input = self.build_input(frame);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        self.decode(outputs, frame.width(), frame.height())
    }

    fn warm_up(&mut self) -> Result<()> {
        let blank = RgbImage::new(self.input_size, self.input_size);
        self.detect(&blank).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nms_keeps_best_of_overlapping_same_class() {
        let a = BoundingBox::from_xywh([0.0, 0.0, 10.0, 10.0]);
        let b = BoundingBox::from_xywh([1.0, 1.0, 10.0, 10.0]);
        let kept = non_max_suppression(vec![(0, 0.6, b), (0, 0.9, a), (2, 0.5, a)]);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].1, 0.9);
        assert_eq!(kept[1].0, 2);
    }

    #[test]
    fn missing_model_file_is_an_error() {
        assert!(TractBackend::new("does/not/exist.onnx", 640).is_err());
    }
}
