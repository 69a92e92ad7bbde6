use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::capture::{FacingMode, MediaConstraints};
use crate::controller::LoopSettings;
use crate::detect::{DetectionEngine, DetectorBackend, StubBackend};
use crate::pipeline::DetectOptions;
use crate::schedule::OverlapPolicy;

const DEFAULT_DB_PATH: &str = "crowd_samples.db";
const DEFAULT_CAMERA_DEVICE: &str = "stub://environment";
const DEFAULT_CAMERA_WIDTH: u32 = 1280;
const DEFAULT_CAMERA_HEIGHT: u32 = 720;
const DEFAULT_CAMERA_FPS: u32 = 10;
const DEFAULT_FACING: &str = "environment";
const DEFAULT_TICK_MS: u64 = 800;
const DEFAULT_WARMUP_MS: u64 = 1000;
const DEFAULT_OVERLAP: &str = "skip";
const DEFAULT_MAX_SIDE: u32 = 512;
const DEFAULT_SCORE_THRESHOLD: f32 = 0.6;
const DEFAULT_BACKEND: &str = "stub";
const DEFAULT_MODEL_PATH: &str = "models/yolov8n.onnx";
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_JPEG_QUALITY: u8 = 70;
const DEFAULT_LOG_INTERVAL_SECS: u64 = 20;
const DEFAULT_PLACE_ID: &str = "temple";
const DEFAULT_PLACE_NAME: &str = "Temple";
const MIN_MAX_SIDE: u32 = 160;

#[derive(Debug, Deserialize, Default)]
struct MonitorConfigFile {
    db_path: Option<String>,
    camera: Option<CameraConfigFile>,
    detection: Option<DetectionConfigFile>,
    schedule: Option<ScheduleConfigFile>,
    place: Option<PlaceConfigFile>,
    samples: Option<SamplesConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CameraConfigFile {
    device: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    facing: Option<String>,
    target_fps: Option<u32>,
    display_width: Option<u32>,
    display_height: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    backend: Option<String>,
    model_path: Option<PathBuf>,
    input_size: Option<u32>,
    score_threshold: Option<f32>,
    max_side: Option<u32>,
    jpeg_quality: Option<u8>,
    font_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
struct ScheduleConfigFile {
    tick_ms: Option<u64>,
    warmup_ms: Option<u64>,
    overlap: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct PlaceConfigFile {
    id: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct SamplesConfigFile {
    interval_secs: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendKind {
    Stub,
    Tract,
}

impl BackendKind {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stub" => Ok(BackendKind::Stub),
            "tract" | "onnx" => Ok(BackendKind::Tract),
            other => Err(anyhow!("unknown detector backend '{}'", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub db_path: String,
    pub camera: CameraSettings,
    pub detection: DetectionSettings,
    pub schedule: ScheduleSettings,
    pub place: PlaceSettings,
    /// Minimum time between persisted samples per place.
    pub log_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct CameraSettings {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub facing: FacingMode,
    pub target_fps: u32,
    /// Rendered size of the video; the overlay canvas follows it.
    pub display_size: Option<(u32, u32)>,
}

#[derive(Debug, Clone)]
pub struct DetectionSettings {
    pub backend: BackendKind,
    pub model_path: PathBuf,
    pub input_size: u32,
    pub score_threshold: f32,
    pub max_side: u32,
    pub jpeg_quality: u8,
    pub font_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ScheduleSettings {
    pub tick: Duration,
    pub warmup: Duration,
    pub overlap: OverlapPolicy,
}

#[derive(Debug, Clone)]
pub struct PlaceSettings {
    pub id: String,
    pub name: String,
}

impl MonitorConfig {
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("CROWD_MONITOR_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Load with an explicit config file instead of `CROWD_MONITOR_CONFIG`.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: MonitorConfigFile) -> Result<Self> {
        let db_path = file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string());

        let camera_file = file.camera.unwrap_or_default();
        let display_size = match (camera_file.display_width, camera_file.display_height) {
            (Some(w), Some(h)) => Some((w, h)),
            (None, None) => None,
            _ => {
                return Err(anyhow!(
                    "camera.display_width and camera.display_height must be set together"
                ))
            }
        };
        let camera = CameraSettings {
            device: camera_file
                .device
                .unwrap_or_else(|| DEFAULT_CAMERA_DEVICE.to_string()),
            width: camera_file.width.unwrap_or(DEFAULT_CAMERA_WIDTH),
            height: camera_file.height.unwrap_or(DEFAULT_CAMERA_HEIGHT),
            facing: FacingMode::parse(camera_file.facing.as_deref().unwrap_or(DEFAULT_FACING))?,
            target_fps: camera_file.target_fps.unwrap_or(DEFAULT_CAMERA_FPS),
            display_size,
        };

        let detection_file = file.detection.unwrap_or_default();
        let detection = DetectionSettings {
            backend: BackendKind::parse(
                detection_file.backend.as_deref().unwrap_or(DEFAULT_BACKEND),
            )?,
            model_path: detection_file
                .model_path
                .unwrap_or_else(|| PathBuf::from(DEFAULT_MODEL_PATH)),
            input_size: detection_file.input_size.unwrap_or(DEFAULT_INPUT_SIZE),
            score_threshold: detection_file
                .score_threshold
                .unwrap_or(DEFAULT_SCORE_THRESHOLD),
            max_side: detection_file.max_side.unwrap_or(DEFAULT_MAX_SIDE),
            jpeg_quality: detection_file.jpeg_quality.unwrap_or(DEFAULT_JPEG_QUALITY),
            font_path: detection_file.font_path,
        };

        let schedule_file = file.schedule.unwrap_or_default();
        let schedule = ScheduleSettings {
            tick: Duration::from_millis(schedule_file.tick_ms.unwrap_or(DEFAULT_TICK_MS)),
            warmup: Duration::from_millis(schedule_file.warmup_ms.unwrap_or(DEFAULT_WARMUP_MS)),
            overlap: OverlapPolicy::parse(
                schedule_file.overlap.as_deref().unwrap_or(DEFAULT_OVERLAP),
            )?,
        };

        let place_file = file.place.unwrap_or_default();
        let place = PlaceSettings {
            id: place_file.id.unwrap_or_else(|| DEFAULT_PLACE_ID.to_string()),
            name: place_file
                .name
                .unwrap_or_else(|| DEFAULT_PLACE_NAME.to_string()),
        };

        let log_interval = Duration::from_secs(
            file.samples
                .and_then(|samples| samples.interval_secs)
                .unwrap_or(DEFAULT_LOG_INTERVAL_SECS),
        );

        Ok(Self {
            db_path,
            camera,
            detection,
            schedule,
            place,
            log_interval,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(device) = env_nonempty("CROWD_CAMERA_DEVICE") {
            self.camera.device = device;
        }
        if let Some(id) = env_nonempty("CROWD_PLACE_ID") {
            self.place.id = id;
        }
        if let Some(name) = env_nonempty("CROWD_PLACE_NAME") {
            self.place.name = name;
        }
        if let Some(path) = env_nonempty("CROWD_DB_PATH") {
            self.db_path = path;
        }
        if let Some(backend) = env_nonempty("CROWD_BACKEND") {
            self.detection.backend = BackendKind::parse(&backend)?;
        }
        if let Some(path) = env_nonempty("CROWD_MODEL_PATH") {
            self.detection.model_path = PathBuf::from(path);
        }
        if let Some(tick) = env_nonempty("CROWD_TICK_MS") {
            let ms: u64 = tick
                .trim()
                .parse()
                .map_err(|_| anyhow!("CROWD_TICK_MS must be an integer number of milliseconds"))?;
            self.schedule.tick = Duration::from_millis(ms);
        }
        if let Some(threshold) = env_nonempty("CROWD_SCORE_THRESHOLD") {
            self.detection.score_threshold = threshold
                .trim()
                .parse()
                .map_err(|_| anyhow!("CROWD_SCORE_THRESHOLD must be a number"))?;
        }
        Ok(())
    }

    fn validate(&mut self) -> Result<()> {
        if self.schedule.tick.is_zero() {
            return Err(anyhow!("schedule tick must be greater than zero"));
        }
        if self.detection.max_side < MIN_MAX_SIDE {
            return Err(anyhow!(
                "detection max_side must be at least {}",
                MIN_MAX_SIDE
            ));
        }
        let threshold = self.detection.score_threshold;
        if !(0.0..1.0).contains(&threshold) {
            return Err(anyhow!(
                "score threshold must be in [0, 1), got {}",
                threshold
            ));
        }
        if !(1..=100).contains(&self.detection.jpeg_quality) {
            return Err(anyhow!("jpeg quality must be between 1 and 100"));
        }
        if self.detection.input_size == 0 {
            return Err(anyhow!("detection input size must be greater than zero"));
        }
        if self.log_interval.is_zero() {
            return Err(anyhow!("sample log interval must be greater than zero"));
        }
        self.place.id = self.place.id.trim().to_string();
        if self.place.id.is_empty() {
            return Err(anyhow!("place id must not be empty"));
        }
        Ok(())
    }

    pub fn media_constraints(&self) -> MediaConstraints {
        MediaConstraints {
            facing_mode: self.camera.facing,
            ideal_width: self.camera.width,
            ideal_height: self.camera.height,
        }
    }

    pub fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            constraints: self.media_constraints(),
            interval: self.schedule.tick,
            warmup: self.schedule.warmup,
            overlap: self.schedule.overlap,
            detect: DetectOptions {
                max_side: self.detection.max_side,
                jpeg_quality: self.detection.jpeg_quality,
                snapshot: true,
                font: None,
            },
        }
    }
}

impl DetectionSettings {
    /// Engine for the configured backend. The model itself loads on first use.
    pub fn build_engine(&self) -> Result<DetectionEngine> {
        let engine = match self.backend {
            BackendKind::Stub => DetectionEngine::new(Box::new(|| {
                Ok(Box::new(StubBackend::region_activity()) as Box<dyn DetectorBackend>)
            })),
            BackendKind::Tract => self.tract_engine()?,
        };
        Ok(engine.with_threshold(self.score_threshold))
    }

    #[cfg(feature = "backend-tract")]
    fn tract_engine(&self) -> Result<DetectionEngine> {
        let model_path = self.model_path.clone();
        let input_size = self.input_size;
        Ok(DetectionEngine::new(Box::new(move || {
            let backend = crate::detect::TractBackend::new(&model_path, input_size)?;
            Ok(Box::new(backend) as Box<dyn DetectorBackend>)
        })))
    }

    #[cfg(not(feature = "backend-tract"))]
    fn tract_engine(&self) -> Result<DetectionEngine> {
        Err(anyhow!(
            "detector backend 'tract' requires the backend-tract feature"
        ))
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn read_config_file(path: &Path) -> Result<MonitorConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}
