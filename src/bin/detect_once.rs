//! detect-once - run person detection on one stored image
//!
//! Prints the detection result as JSON. With `--out`, also writes the
//! annotated snapshot as a JPEG file.

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use crowd_monitor::capture::{MediaStream, StillImageTrack, VideoElement};
use crowd_monitor::config::{BackendKind, MonitorConfig};
use crowd_monitor::frame::FrameSampler;
use crowd_monitor::overlay::load_font;
use crowd_monitor::pipeline::{detect_people_or_fallback, DetectOptions};

const DATA_URL_PREFIX: &str = "data:image/jpeg;base64,";

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Image to analyze (JPEG or PNG).
    image: PathBuf,
    /// Longest side of the sampled frame (448 suits recorded footage).
    #[arg(long, default_value_t = 512)]
    max_side: u32,
    /// Detector backend (stub or tract).
    #[arg(long, env = "CROWD_BACKEND")]
    backend: Option<String>,
    /// ONNX model for the tract backend.
    #[arg(long, env = "CROWD_MODEL_PATH")]
    model: Option<PathBuf>,
    /// Write the annotated snapshot here.
    #[arg(long)]
    out: Option<PathBuf>,
    /// Font for confidence labels and the banner (default: bundled DejaVu Sans).
    #[arg(long)]
    font: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    if args.max_side < 160 {
        return Err(anyhow!("--max-side must be >= 160"));
    }

    let mut detection = MonitorConfig::load_from(None)?.detection;
    if let Some(backend) = args.backend.as_deref() {
        detection.backend = BackendKind::parse(backend)?;
    }
    if let Some(model) = args.model {
        detection.model_path = model;
    }
    let engine = detection.build_engine()?;

    let track = StillImageTrack::open(&args.image)?;
    let video = VideoElement::new();
    video.set_src_object(Some(MediaStream::new(vec![Arc::new(track)])))?;
    video.play()?;

    let options = DetectOptions {
        max_side: args.max_side,
        jpeg_quality: detection.jpeg_quality,
        snapshot: args.out.is_some(),
        font: args.font.as_ref().map(load_font).transpose()?,
    };
    let mut sampler = FrameSampler::new(args.max_side);
    let result = detect_people_or_fallback(&video, &engine, &mut sampler, None, &options);

    if let Some(out) = args.out.as_ref() {
        let image = result
            .image
            .as_deref()
            .and_then(|url| url.strip_prefix(DATA_URL_PREFIX))
            .ok_or_else(|| anyhow!("no snapshot was produced for {}", args.image.display()))?;
        let bytes = BASE64.decode(image).context("decode snapshot")?;
        std::fs::write(out, bytes)
            .with_context(|| format!("failed to write snapshot {}", out.display()))?;
        log::info!("annotated snapshot written to {}", out.display());
    }

    let mut summary = result.clone();
    summary.image = None;
    println!("{}", serde_json::to_string_pretty(&summary)?);
    log::info!("{}", result.label());
    Ok(())
}
