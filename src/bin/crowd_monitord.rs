//! crowd-monitord - live crowd monitoring daemon
//!
//! This daemon:
//! 1. Loads the detection model shared by the loop
//! 2. Opens the configured camera and binds it to a video element
//! 3. Runs person detection on a fixed interval and raises crowd-tier alerts
//! 4. Persists a throttled crowd sample per place to SQLite

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crowd_monitor::capture::{devices_for, MediaDevices, VideoElement};
use crowd_monitor::controller::{DetectionLoop, SharedOverlay};
use crowd_monitor::notify::LogAlertSink;
use crowd_monitor::overlay::{load_font, RasterCanvas};
use crowd_monitor::sample_log::{SampleLogger, SystemClock};
use crowd_monitor::storage::SqliteSampleStore;
use crowd_monitor::{DetectionResult, MonitorConfig};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Config file (JSON, or TOML with a .toml extension).
    #[arg(long, env = "CROWD_MONITOR_CONFIG")]
    config: Option<PathBuf>,
    /// Stop after this many seconds instead of waiting for Ctrl-C.
    #[arg(long)]
    seconds: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let cfg = MonitorConfig::load_from(args.config.as_deref())?;
    let font = cfg
        .detection
        .font_path
        .as_ref()
        .map(load_font)
        .transpose()?;
    if font.is_none() {
        log::info!("no label font configured; using bundled DejaVu Sans");
    }

    let engine = Arc::new(cfg.detection.build_engine()?);
    let devices: Arc<dyn MediaDevices> =
        Arc::from(devices_for(&cfg.camera.device, cfg.camera.target_fps)?);
    let store = SqliteSampleStore::open(&cfg.db_path)?;
    let logger = Arc::new(SampleLogger::with_clock(
        Box::new(store),
        Box::new(SystemClock),
        cfg.log_interval,
    ));

    let video = VideoElement::new();
    let (display_w, display_h) = cfg
        .camera
        .display_size
        .unwrap_or((cfg.camera.width, cfg.camera.height));
    video.set_display_size(display_w, display_h);
    let overlay: SharedOverlay = Arc::new(Mutex::new(
        RasterCanvas::new(display_w, display_h).with_font(font.clone()),
    ));

    let mut settings = cfg.loop_settings();
    settings.detect.font = font;
    let controller = Arc::new(DetectionLoop::new(
        engine,
        devices,
        Arc::new(LogAlertSink),
        settings,
    ));

    let place_id = cfg.place.id.clone();
    let place_name = cfg.place.name.clone();
    let sample_logger = Arc::clone(&logger);
    let on_detection = move |result: &DetectionResult| {
        log::info!(
            "{}: {} people ({})",
            place_id,
            result.count,
            result.status
        );
        sample_logger.maybe_log(result, &place_id, &place_name);
    };

    let stream = controller
        .start(&video, on_detection, Some(overlay))
        .ok_or_else(|| anyhow!("detection loop failed to start"))?;
    log::info!(
        "crowd-monitord running. camera {} (stream {}), samples in {}",
        cfg.camera.device,
        stream.id(),
        cfg.db_path
    );
    log::info!(
        "place {} ({}), tick {:?}, sample interval {:?}",
        cfg.place.id,
        cfg.place.name,
        cfg.schedule.tick,
        cfg.log_interval
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    match args.seconds {
        Some(seconds) => {
            let _ = rx.recv_timeout(Duration::from_secs(seconds));
        }
        None => {
            log::info!("crowd-monitord waiting for shutdown signal (Ctrl-C)...");
            let _ = rx.recv();
        }
    }

    log::info!("shutting down, releasing camera...");
    if !controller.is_running() {
        log::warn!("detection loop was no longer running at shutdown");
    }
    controller.stop();
    let stats = controller.stats();
    log::info!(
        "ticks run {}, not ready {}, failed {}, delivered {}, deadlines skipped {}",
        stats.ticks_run,
        stats.ticks_not_ready,
        stats.ticks_failed,
        stats.callbacks_delivered,
        stats.deadlines_skipped
    );
    match logger.samples() {
        Ok(samples) => log::info!("{} crowd samples stored", samples.len()),
        Err(e) => log::warn!("could not read back crowd samples: {:#}", e),
    }
    Ok(())
}
