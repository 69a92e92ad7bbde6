mod backend;
pub mod backends;
mod engine;
mod result;

pub use backend::DetectorBackend;
pub use backends::StubBackend;
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use engine::{filter_people, validate, BackendLoader, DetectionEngine, DEFAULT_SCORE_THRESHOLD};
pub use result::{
    BoundingBox, Detection, DetectionResult, Prediction, RawPrediction, PERSON_CLASS,
};
