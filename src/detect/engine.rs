use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Context, Result};
use image::RgbImage;

use crate::detect::backend::DetectorBackend;
use crate::detect::result::{Detection, Prediction, RawPrediction};

/// Default minimum score a person must exceed to be counted.
pub const DEFAULT_SCORE_THRESHOLD: f32 = 0.6;

/// Builds the model backend. Called on first use and again after a failure.
pub type BackendLoader = Box<dyn Fn() -> Result<Box<dyn DetectorBackend>> + Send + Sync>;

/// Shared detection model.
///
/// Holds at most one loaded backend for the whole process. The backend is
/// built lazily by the loader; a failed load leaves the engine empty so the
/// next call retries. Callers share the engine through `Arc<DetectionEngine>`.
pub struct DetectionEngine {
    loader: BackendLoader,
    model: Mutex<Option<Box<dyn DetectorBackend>>>,
    score_threshold: f32,
    load_failures: AtomicU64,
}

impl DetectionEngine {
    pub fn new(loader: BackendLoader) -> Self {
        Self {
            loader,
            model: Mutex::new(None),
            score_threshold: DEFAULT_SCORE_THRESHOLD,
            load_failures: AtomicU64::new(0),
        }
    }

    /// Engine around a backend that is already built. It never reloads.
    pub fn with_backend<B: DetectorBackend + 'static>(backend: B) -> Self {
        Self {
            loader: Box::new(|| Err(anyhow!("backend was supplied pre-loaded"))),
            model: Mutex::new(Some(Box::new(backend))),
            score_threshold: DEFAULT_SCORE_THRESHOLD,
            load_failures: AtomicU64::new(0),
        }
    }

    pub fn with_threshold(mut self, threshold: f32) -> Self {
        self.score_threshold = threshold;
        self
    }

    pub fn score_threshold(&self) -> f32 {
        self.score_threshold
    }

    pub fn is_loaded(&self) -> bool {
        self.model.lock().map(|slot| slot.is_some()).unwrap_or(false)
    }

    pub fn load_failures(&self) -> u64 {
        self.load_failures.load(Ordering::Relaxed)
    }

    /// Load the model if it is not loaded yet.
    pub fn ensure_loaded(&self) -> Result<()> {
        let mut slot = self.lock_model()?;
        self.load_into(&mut slot)?;
        Ok(())
    }

    /// Run the model and keep the persons scoring above the threshold.
    pub fn detect(&self, frame: &RgbImage) -> Result<Vec<Detection>> {
        let mut slot = self.lock_model()?;
        let backend = self.load_into(&mut slot)?;
        let raw = backend
            .detect(frame)
            .with_context(|| format!("{} inference failed", backend.name()))?;
        Ok(filter_people(validate(raw), self.score_threshold))
    }

    fn lock_model(&self) -> Result<MutexGuard<'_, Option<Box<dyn DetectorBackend>>>> {
        self.model
            .lock()
            .map_err(|_| anyhow!("detection model lock poisoned"))
    }

    fn load_into<'a>(
        &self,
        slot: &'a mut Option<Box<dyn DetectorBackend>>,
    ) -> Result<&'a mut Box<dyn DetectorBackend>> {
        if slot.is_none() {
            log::info!("loading detection model");
            let loaded = (self.loader)().and_then(|mut backend| {
                backend.warm_up()?;
                Ok(backend)
            });
            match loaded {
                Ok(backend) => {
                    log::info!("detection model '{}' loaded", backend.name());
                    *slot = Some(backend);
                }
                Err(e) => {
                    self.load_failures.fetch_add(1, Ordering::Relaxed);
                    log::error!("error loading detection model: {:#}", e);
                    return Err(e.context("could not load detection model"));
                }
            }
        }
        slot.as_mut()
            .ok_or_else(|| anyhow!("detection model missing after load"))
    }
}

/// Validate raw model output, dropping malformed entries.
pub fn validate(raw: Vec<RawPrediction>) -> Vec<Prediction> {
    raw.into_iter()
        .filter_map(|p| match Prediction::try_from(p) {
            Ok(p) => Some(p),
            Err(e) => {
                log::debug!("dropping malformed prediction: {}", e);
                None
            }
        })
        .collect()
}

/// Keep persons with `score > threshold`, in model order.
pub fn filter_people(predictions: Vec<Prediction>, threshold: f32) -> Vec<Detection> {
    predictions
        .into_iter()
        .filter(|p| p.is_person() && p.score > threshold)
        .map(|p| Detection {
            bbox: p.bbox,
            score: p.score,
        })
        .collect()
}
