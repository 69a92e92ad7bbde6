//! End-to-end scenarios: camera, shared model, loop, alerts and sample logging.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use image::{Rgb, RgbImage};
use tempfile::tempdir;

use crowd_monitor::capture::{MediaStream, StillImageTrack, SyntheticDevices, VideoElement};
use crowd_monitor::classify::{classify, AlertStatus};
use crowd_monitor::controller::{DetectionLoop, LoopSettings, LoopState};
use crowd_monitor::detect::{DetectionEngine, DetectorBackend, StubBackend};
use crowd_monitor::frame::FrameSampler;
use crowd_monitor::notify::RecordingAlertSink;
use crowd_monitor::pipeline::{detect_people_or_fallback, DetectOptions};
use crowd_monitor::sample_log::SampleLogger;
use crowd_monitor::storage::{SampleStore, SqliteSampleStore};
use crowd_monitor::DetectionResult;

fn fast_settings() -> LoopSettings {
    LoopSettings {
        interval: Duration::from_millis(25),
        warmup: Duration::ZERO,
        ..LoopSettings::default()
    }
}

fn wait_for(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    done()
}

fn counting_engine(loads: Arc<AtomicUsize>) -> Arc<DetectionEngine> {
    Arc::new(DetectionEngine::new(Box::new(move || {
        loads.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(StubBackend::region_activity()) as Box<dyn DetectorBackend>)
    })))
}

/// 640x480 frame with the first `lit` quadrants bright.
fn quadrant_frame(lit: u32) -> RgbImage {
    RgbImage::from_fn(640, 480, |x, y| {
        let quadrant = (y / 240) * 2 + x / 320;
        if quadrant < lit {
            Rgb([220, 210, 200])
        } else {
            Rgb([15, 15, 15])
        }
    })
}

#[test]
fn still_image_counts_bright_regions() -> Result<()> {
    let engine = counting_engine(Arc::new(AtomicUsize::new(0)));
    let video = VideoElement::new();
    let track = StillImageTrack::new(quadrant_frame(3));
    video.set_src_object(Some(MediaStream::new(vec![Arc::new(track)])))?;
    video.play()?;

    let mut sampler = FrameSampler::default();
    let result =
        detect_people_or_fallback(&video, &engine, &mut sampler, None, &DetectOptions::default());

    assert_eq!(result.count, 3);
    assert_eq!(result.status, AlertStatus::Green);
    assert_eq!(result.label(), "Green Alert - Count: 3");
    assert!(result
        .detections
        .iter()
        .all(|d| d.score > 0.6 && d.bbox.x + d.bbox.width <= 512.0));
    Ok(())
}

#[test]
fn live_loop_persists_throttled_samples() -> Result<()> {
    let dir = tempdir()?;
    let db_path = dir.path().join("crowd_samples.db");
    let db_path = db_path.to_string_lossy().to_string();
    let logger = Arc::new(SampleLogger::new(Box::new(SqliteSampleStore::open(&db_path)?)));

    let loads = Arc::new(AtomicUsize::new(0));
    let controller = DetectionLoop::new(
        counting_engine(Arc::clone(&loads)),
        Arc::new(SyntheticDevices::new("stub://temple")),
        Arc::new(RecordingAlertSink::new()),
        fast_settings(),
    );

    let results = Arc::new(Mutex::new(Vec::<DetectionResult>::new()));
    let sink = Arc::clone(&results);
    let sample_logger = Arc::clone(&logger);
    let video = VideoElement::new();
    let stream = controller
        .start(
            &video,
            move |result: &DetectionResult| {
                sample_logger.maybe_log(result, "temple", "Temple");
                sink.lock().unwrap().push(result.clone());
            },
            None,
        )
        .expect("loop started");
    assert_eq!(controller.state(), LoopState::Running);

    assert!(wait_for(Duration::from_secs(10), || results
        .lock()
        .unwrap()
        .len()
        >= 5));
    controller.stop();
    assert!(!stream.active());

    for result in results.lock().unwrap().iter() {
        assert_eq!(result.status, classify(result.count).status);
        assert!(result
            .image
            .as_deref()
            .is_some_and(|url| url.starts_with("data:image/jpeg;base64,")));
    }

    let samples = logger.samples()?;
    assert_eq!(samples.len(), 1);
    assert_eq!(samples[0].place_id, "temple");
    assert_eq!(samples[0].date.len(), 10);
    assert_eq!(loads.load(Ordering::SeqCst), 1);

    let mut reopened = SqliteSampleStore::open(&db_path)?;
    assert_eq!(reopened.list()?.len(), 1);
    Ok(())
}

#[test]
fn loops_share_one_model() -> Result<()> {
    let loads = Arc::new(AtomicUsize::new(0));
    let engine = counting_engine(Arc::clone(&loads));
    let alerts = Arc::new(RecordingAlertSink::new());
    let gate = DetectionLoop::new(
        Arc::clone(&engine),
        Arc::new(SyntheticDevices::new("stub://gate")),
        alerts.clone(),
        fast_settings(),
    );
    let ghat = DetectionLoop::new(
        Arc::clone(&engine),
        Arc::new(SyntheticDevices::new("stub://ghat")),
        alerts.clone(),
        fast_settings(),
    );

    let delivered = Arc::new(AtomicUsize::new(0));
    let (a, b) = (Arc::clone(&delivered), Arc::clone(&delivered));
    let (gate_video, ghat_video) = (VideoElement::new(), VideoElement::new());
    assert!(gate
        .start(
            &gate_video,
            move |_: &DetectionResult| {
                a.fetch_add(1, Ordering::SeqCst);
            },
            None,
        )
        .is_some());
    assert!(ghat
        .start(
            &ghat_video,
            move |_: &DetectionResult| {
                b.fetch_add(1, Ordering::SeqCst);
            },
            None,
        )
        .is_some());

    assert!(wait_for(Duration::from_secs(10), || delivered
        .load(Ordering::SeqCst)
        >= 4));
    gate.stop();
    ghat.stop();

    assert_eq!(loads.load(Ordering::SeqCst), 1);
    assert!(engine.is_loaded());
    assert!(gate_video.src_object().is_none());
    assert!(ghat_video.src_object().is_none());
    Ok(())
}

#[test]
fn stopped_loop_can_restart() -> Result<()> {
    let controller = DetectionLoop::new(
        counting_engine(Arc::new(AtomicUsize::new(0))),
        Arc::new(SyntheticDevices::new("stub://temple")),
        Arc::new(RecordingAlertSink::new()),
        fast_settings(),
    );
    let video = VideoElement::new();
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let seen = Arc::clone(&calls);
        let before = calls.load(Ordering::SeqCst);
        let stream = controller
            .start(
                &video,
                move |_: &DetectionResult| {
                    seen.fetch_add(1, Ordering::SeqCst);
                },
                None,
            )
            .expect("loop started");
        assert!(wait_for(Duration::from_secs(10), || calls
            .load(Ordering::SeqCst)
            > before));
        controller.stop();
        controller.stop();
        assert!(!stream.active());
        assert_eq!(controller.state(), LoopState::Idle);
    }
    Ok(())
}
