//! Crowd Monitor
//!
//! Live person counting for crowd-safety monitoring: a camera stream is
//! sampled on a fixed interval, people are detected in each frame, the count
//! is mapped to a Green/Yellow/Red alert tier, an annotated overlay is drawn,
//! and a throttled subset of results is persisted as crowd samples.
//!
//! # Architecture
//!
//! - The detection model is loaded once and shared by every loop through an
//!   `Arc<DetectionEngine>`.
//! - A `DetectionLoop` owns exactly one camera stream and one repeating task.
//!   `stop` is the single cancellation point; no result is delivered after it
//!   returns.
//! - The alert tier is a pure function of the person count.
//! - Sample persistence never blocks or fails the loop.
//!
//! # Module Structure
//!
//! - `capture`: media devices, streams, tracks, and the video element
//! - `frame`: bounded frame sampling
//! - `detect`: model backends and person filtering
//! - `classify`: crowd-tier thresholds and labels
//! - `overlay`: box, label and banner drawing, JPEG snapshots
//! - `pipeline`: single-shot detection
//! - `schedule`: cancellable repeating task
//! - `controller`: the detection loop
//! - `notify`: operator notifications
//! - `storage`, `sample_log`: crowd sample persistence
//! - `config`: file and environment configuration

pub mod capture;
pub mod classify;
pub mod config;
pub mod controller;
pub mod detect;
pub mod frame;
pub mod notify;
pub mod overlay;
pub mod pipeline;
pub mod sample_log;
pub mod schedule;
pub mod storage;

pub use capture::{stop_camera, MediaDevices, MediaStream, VideoElement};
pub use classify::{classify, AlertStatus, Classification};
pub use config::MonitorConfig;
pub use controller::{DetectionLoop, LoopSettings, LoopState, LoopStats};
pub use detect::{Detection, DetectionEngine, DetectionResult};
pub use frame::FrameSampler;
pub use notify::{AlertSink, LogAlertSink, Notification};
pub use overlay::{OverlayCanvas, RasterCanvas};
pub use pipeline::{detect_people, detect_people_or_fallback, DetectOptions};
pub use sample_log::SampleLogger;
pub use storage::{CrowdSample, SampleStore, SqliteSampleStore};
