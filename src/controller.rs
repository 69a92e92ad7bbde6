//! Detection loop controller.
//!
//! Owns one camera stream and one repeating task. `start` loads the model,
//! acquires the camera, binds it to the video element and schedules ticks;
//! each ready tick samples, detects, classifies, draws, and hands the result
//! to the caller. `stop` cancels ticking and releases the camera at once.
//!
//! Lifecycle: Idle -> Starting -> Running -> Stopping -> Idle. A failure
//! while Starting goes straight back to Idle and is reported through the
//! `AlertSink`.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, ThreadId};
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::capture::{stop_camera, MediaConstraints, MediaDevices, MediaStream, VideoElement};
use crate::detect::{DetectionEngine, DetectionResult};
use crate::frame::FrameSampler;
use crate::notify::{alert_for, AlertSink, Notification};
use crate::overlay::OverlayCanvas;
use crate::pipeline::{detect_people, DetectOptions};
use crate::schedule::{OverlapPolicy, RepeatingTask};

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(800);
pub const DEFAULT_WARMUP: Duration = Duration::from_millis(1000);

/// Receives every delivered result, on the timer (or tick worker) thread.
pub type DetectionCallback = Arc<dyn Fn(&DetectionResult) + Send + Sync>;

/// Overlay canvas shared between the loop and whoever displays it.
pub type SharedOverlay = Arc<Mutex<dyn OverlayCanvas>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Starting,
    Running,
    Stopping,
}

#[derive(Clone)]
pub struct LoopSettings {
    pub constraints: MediaConstraints,
    pub interval: Duration,
    pub warmup: Duration,
    pub overlap: OverlapPolicy,
    pub detect: DetectOptions,
}

impl Default for LoopSettings {
    fn default() -> Self {
        Self {
            constraints: MediaConstraints::default(),
            interval: DEFAULT_TICK_INTERVAL,
            warmup: DEFAULT_WARMUP,
            overlap: OverlapPolicy::default(),
            detect: DetectOptions::default(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoopStats {
    /// Ticks that found the video ready and ran the pipeline.
    pub ticks_run: u64,
    /// Ticks dropped because the video had no frame.
    pub ticks_not_ready: u64,
    pub ticks_failed: u64,
    pub callbacks_delivered: u64,
    /// Results dropped because the loop stopped or a newer one was delivered.
    pub results_discarded: u64,
    /// Deadlines that passed while a tick was still running.
    pub deadlines_skipped: u64,
}

#[derive(Debug, Default)]
struct LoopCounters {
    ticks_run: AtomicU64,
    ticks_not_ready: AtomicU64,
    ticks_failed: AtomicU64,
    callbacks_delivered: AtomicU64,
    results_discarded: AtomicU64,
    deadlines_skipped: AtomicU64,
}

/// State shared by one session's ticks and `stop`.
struct TickShared {
    running: AtomicBool,
    /// Sequence of the newest delivered result; held while delivering.
    delivered: Mutex<u64>,
    delivering_thread: Mutex<Option<ThreadId>>,
}

struct Session {
    video: VideoElement,
    task: RepeatingTask,
    shared: Arc<TickShared>,
}

pub struct DetectionLoop {
    engine: Arc<DetectionEngine>,
    devices: Arc<dyn MediaDevices>,
    alerts: Arc<dyn AlertSink>,
    settings: LoopSettings,
    state: Mutex<LoopState>,
    /// Serializes start and stop.
    lifecycle: Mutex<Option<Session>>,
    counters: Arc<LoopCounters>,
}

impl DetectionLoop {
    pub fn new(
        engine: Arc<DetectionEngine>,
        devices: Arc<dyn MediaDevices>,
        alerts: Arc<dyn AlertSink>,
        settings: LoopSettings,
    ) -> Self {
        Self {
            engine,
            devices,
            alerts,
            settings,
            state: Mutex::new(LoopState::Idle),
            lifecycle: Mutex::new(None),
            counters: Arc::new(LoopCounters::default()),
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
            .lock()
            .map(|state| *state)
            .unwrap_or(LoopState::Idle)
    }

    fn set_state(&self, next: LoopState) {
        if let Ok(mut state) = self.state.lock() {
            log::debug!("detection loop {:?} -> {:?}", *state, next);
            *state = next;
        }
    }

    fn lock_lifecycle(&self) -> Result<MutexGuard<'_, Option<Session>>> {
        self.lifecycle
            .lock()
            .map_err(|_| anyhow!("detection loop lifecycle lock poisoned"))
    }

    /// Start detecting on `video`. Returns the acquired stream, or `None`
    /// when the loop could not start (the reason has been notified).
    pub fn start<F>(
        &self,
        video: &VideoElement,
        on_detection: F,
        overlay: Option<SharedOverlay>,
    ) -> Option<MediaStream>
    where
        F: Fn(&DetectionResult) + Send + Sync + 'static,
    {
        let mut session = match self.lock_lifecycle() {
            Ok(session) => session,
            Err(e) => {
                log::error!("{:#}", e);
                return None;
            }
        };
        if session.is_some() {
            log::warn!("detection loop already running; start ignored");
            return None;
        }

        self.set_state(LoopState::Starting);
        match self.start_session(video, Arc::new(on_detection), overlay) {
            Ok((started, stream)) => {
                *session = Some(started);
                self.set_state(LoopState::Running);
                log::info!(
                    "detection loop running on stream {} (every {:?}, {})",
                    stream.id(),
                    self.settings.interval,
                    self.settings.overlap.as_str()
                );
                Some(stream)
            }
            Err(notification) => {
                self.alerts.notify(notification);
                self.set_state(LoopState::Idle);
                None
            }
        }
    }

    fn start_session(
        &self,
        video: &VideoElement,
        on_detection: DetectionCallback,
        overlay: Option<SharedOverlay>,
    ) -> std::result::Result<(Session, MediaStream), Notification> {
        if !video.try_claim() {
            log::error!("video element is already bound to a detection loop");
            return Err(Notification::video_in_use());
        }

        if let Err(e) = self.engine.ensure_loaded() {
            log::error!("cannot start detection: {:#}", e);
            video.release_claim();
            return Err(Notification::model_loading_error());
        }

        let stream = match self.devices.get_user_media(&self.settings.constraints) {
            Ok(stream) => stream,
            Err(e) => {
                log::error!("error accessing camera: {:#}", e);
                video.release_claim();
                return Err(Notification::camera_access_error());
            }
        };
        if let Err(e) = video.set_src_object(Some(stream.clone())) {
            log::error!("error binding camera stream: {:#}", e);
            stream.stop_all();
            video.release_claim();
            return Err(Notification::camera_access_error());
        }
        if let Err(e) = video.play() {
            log::warn!("video playback did not start: {:#}", e);
            self.alerts.notify(Notification::video_error());
        }

        let shared = Arc::new(TickShared {
            running: AtomicBool::new(true),
            delivered: Mutex::new(0),
            delivering_thread: Mutex::new(None),
        });
        let tick = Tick {
            video: video.clone(),
            engine: Arc::clone(&self.engine),
            sampler: Mutex::new(FrameSampler::new(self.settings.detect.max_side)),
            overlay,
            options: self.settings.detect.clone(),
            on_detection,
            alerts: Arc::clone(&self.alerts),
            shared: Arc::clone(&shared),
            counters: Arc::clone(&self.counters),
        };
        let task = RepeatingTask::spawn(
            "detection",
            self.settings.warmup,
            self.settings.interval,
            self.settings.overlap,
            move |sequence| tick.run(sequence),
        );
        let task = match task {
            Ok(task) => task,
            Err(e) => {
                log::error!("cannot schedule detection ticks: {:#}", e);
                stop_camera(video);
                video.release_claim();
                return Err(Notification::camera_access_error());
            }
        };

        Ok((
            Session {
                video: video.clone(),
                task,
                shared,
            },
            stream,
        ))
    }

    /// Stop ticking and release the camera. Safe to call repeatedly, and
    /// from inside the detection callback.
    pub fn stop(&self) {
        let session = match self.lock_lifecycle() {
            Ok(mut session) => session.take(),
            Err(e) => {
                log::error!("{:#}", e);
                return;
            }
        };
        let Some(session) = session else {
            return;
        };

        self.set_state(LoopState::Stopping);
        session.shared.running.store(false, Ordering::Release);
        if let Err(e) = session.task.cancel() {
            log::warn!("{:#}", e);
        }
        stop_camera(&session.video);
        session.video.release_claim();
        self.counters
            .deadlines_skipped
            .fetch_add(session.task.deadlines_skipped(), Ordering::Relaxed);

        // Wait out a callback in progress unless it is the caller.
        let delivering = session
            .shared
            .delivering_thread
            .lock()
            .map(|thread| *thread)
            .unwrap_or(None);
        if delivering != Some(thread::current().id()) {
            drop(session.shared.delivered.lock());
        }

        self.set_state(LoopState::Idle);
        log::info!("detection loop stopped");
    }

    pub fn is_running(&self) -> bool {
        self.state() == LoopState::Running
    }

    pub fn stats(&self) -> LoopStats {
        let live_skipped = self
            .lifecycle
            .lock()
            .ok()
            .and_then(|session| session.as_ref().map(|s| s.task.deadlines_skipped()))
            .unwrap_or(0);
        let c = &self.counters;
        LoopStats {
            ticks_run: c.ticks_run.load(Ordering::Relaxed),
            ticks_not_ready: c.ticks_not_ready.load(Ordering::Relaxed),
            ticks_failed: c.ticks_failed.load(Ordering::Relaxed),
            callbacks_delivered: c.callbacks_delivered.load(Ordering::Relaxed),
            results_discarded: c.results_discarded.load(Ordering::Relaxed),
            deadlines_skipped: c.deadlines_skipped.load(Ordering::Relaxed) + live_skipped,
        }
    }
}

impl Drop for DetectionLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Tick {
    video: VideoElement,
    engine: Arc<DetectionEngine>,
    sampler: Mutex<FrameSampler>,
    overlay: Option<SharedOverlay>,
    options: DetectOptions,
    on_detection: DetectionCallback,
    alerts: Arc<dyn AlertSink>,
    shared: Arc<TickShared>,
    counters: Arc<LoopCounters>,
}

impl Tick {
    fn run(&self, sequence: u64) {
        if !self.shared.running.load(Ordering::Acquire) {
            return;
        }
        if !self.video.has_frame() {
            self.counters.ticks_not_ready.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.counters.ticks_run.fetch_add(1, Ordering::Relaxed);

        match self.detect() {
            Ok(result) => self.deliver(sequence, result),
            Err(e) => {
                self.counters.ticks_failed.fetch_add(1, Ordering::Relaxed);
                log::error!("detection tick {} failed: {:#}", sequence, e);
            }
        }
    }

    fn detect(&self) -> Result<DetectionResult> {
        let mut overlay = match self.overlay.as_ref() {
            Some(canvas) => Some(
                canvas
                    .lock()
                    .map_err(|_| anyhow!("overlay canvas lock poisoned"))?,
            ),
            None => None,
        };

        // Overlapping ticks that find the shared buffer busy sample into their own.
        let mut own;
        let mut guard;
        let sampler: &mut FrameSampler = match self.sampler.try_lock() {
            Ok(locked) => {
                guard = locked;
                &mut *guard
            }
            Err(_) => {
                own = FrameSampler::new(self.options.max_side);
                &mut own
            }
        };

        let canvas: Option<&mut dyn OverlayCanvas> = match overlay.as_mut() {
            Some(locked) => Some(&mut **locked),
            None => None,
        };
        detect_people(&self.video, &self.engine, sampler, canvas, &self.options)
    }

    fn deliver(&self, sequence: u64, result: DetectionResult) {
        let Ok(mut delivered) = self.shared.delivered.lock() else {
            log::error!("detection delivery lock poisoned");
            return;
        };
        if !self.shared.running.load(Ordering::Acquire) || sequence <= *delivered {
            self.counters.results_discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        *delivered = sequence;

        self.set_delivering(Some(thread::current().id()));
        (self.on_detection)(&result);
        self.set_delivering(None);
        self.counters
            .callbacks_delivered
            .fetch_add(1, Ordering::Relaxed);

        // The callback may have stopped the loop; a closed stream raises no alert.
        if !self.shared.running.load(Ordering::Acquire) {
            return;
        }
        if let Some(notification) = alert_for(&result) {
            self.alerts.notify(notification);
        }
    }

    fn set_delivering(&self, thread: Option<ThreadId>) {
        if let Ok(mut current) = self.shared.delivering_thread.lock() {
            *current = thread;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::{StillImageTrack, SyntheticDevices, VideoTrack};
    use crate::detect::{DetectorBackend, RawPrediction, StubBackend};
    use crate::notify::RecordingAlertSink;
    use crate::overlay::RasterCanvas;
    use image::RgbImage;
    use std::time::Instant;

    fn fast_settings() -> LoopSettings {
        LoopSettings {
            interval: Duration::from_millis(20),
            warmup: Duration::ZERO,
            ..LoopSettings::default()
        }
    }

    fn crowd_engine(people: usize) -> Arc<DetectionEngine> {
        let predictions = (0..people)
            .map(|i| RawPrediction::new("person", 0.9, [i as f32 * 10.0, 5.0, 8.0, 20.0]))
            .collect();
        Arc::new(DetectionEngine::with_backend(StubBackend::fixed(predictions)))
    }

    fn wait_for(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    struct StillDevices {
        width: u32,
        height: u32,
        stopped: bool,
    }

    impl MediaDevices for StillDevices {
        fn get_user_media(&self, _constraints: &MediaConstraints) -> Result<MediaStream> {
            let track = StillImageTrack::new(RgbImage::new(self.width, self.height));
            if self.stopped {
                track.stop();
            }
            Ok(MediaStream::new(vec![Arc::new(track)]))
        }
    }

    #[test]
    fn ticks_deliver_results_and_alerts() {
        let alerts = Arc::new(RecordingAlertSink::new());
        let controller = DetectionLoop::new(
            crowd_engine(5),
            Arc::new(SyntheticDevices::new("stub://test")),
            alerts.clone(),
            fast_settings(),
        );
        let video = VideoElement::new();
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&results);

        let stream = controller.start(
            &video,
            move |r: &DetectionResult| {
                if let Ok(mut v) = sink.lock() {
                    v.push(r.clone());
                }
            },
            None,
        );
        assert!(stream.is_some());
        assert_eq!(controller.state(), LoopState::Running);
        assert!(controller.is_running());
        assert!(wait_for(Duration::from_secs(5), || {
            results.lock().map(|v| v.len() >= 2).unwrap_or(false)
        }));
        controller.stop();

        let delivered = results.lock().map(|v| v.clone()).unwrap_or_default();
        assert!(delivered.iter().all(|r| r.count == 5 && r.label() == "Yellow Alert - Count: 5"));
        assert!(alerts
            .notifications()
            .iter()
            .any(|n| n.title == "⚠️ YELLOW ALERT - Moderate Crowd"));
        assert!(!controller.is_running());
        assert_eq!(controller.stats().callbacks_delivered, delivered.len() as u64);
        assert!(!video.is_claimed());
        assert!(video.src_object().is_none());
    }

    #[test]
    fn stop_right_after_start_delivers_nothing() {
        let controller = DetectionLoop::new(
            crowd_engine(1),
            Arc::new(SyntheticDevices::new("stub://test")),
            Arc::new(RecordingAlertSink::new()),
            LoopSettings::default(),
        );
        let video = VideoElement::new();
        let calls = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&calls);

        let stream = controller
            .start(
                &video,
                move |_: &DetectionResult| {
                    seen.fetch_add(1, Ordering::SeqCst);
                },
                None,
            )
            .expect("camera stream");
        controller.stop();
        assert!(!stream.active());
        assert!(video.src_object().is_none());
        assert_eq!(controller.state(), LoopState::Idle);

        thread::sleep(Duration::from_millis(1200));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        controller.stop();
    }

    #[test]
    fn no_callback_after_stop_returns() {
        let controller = DetectionLoop::new(
            crowd_engine(2),
            Arc::new(SyntheticDevices::new("stub://test")),
            Arc::new(RecordingAlertSink::new()),
            LoopSettings {
                overlap: OverlapPolicy::AllowOverlap,
                ..fast_settings()
            },
        );
        let video = VideoElement::new();
        let calls = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&calls);
        controller.start(
            &video,
            move |_: &DetectionResult| {
                seen.fetch_add(1, Ordering::SeqCst);
            },
            None,
        );
        assert!(wait_for(Duration::from_secs(5), || calls.load(Ordering::SeqCst) >= 1));
        controller.stop();
        let at_stop = calls.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(150));
        assert_eq!(calls.load(Ordering::SeqCst), at_stop);
    }

    #[test]
    fn denied_camera_stays_idle() {
        let alerts = Arc::new(RecordingAlertSink::new());
        let controller = DetectionLoop::new(
            crowd_engine(1),
            Arc::new(SyntheticDevices::denied()),
            alerts.clone(),
            fast_settings(),
        );
        let video = VideoElement::new();
        assert!(controller.start(&video, |_: &DetectionResult| {}, None).is_none());
        assert_eq!(controller.state(), LoopState::Idle);
        assert!(!video.is_claimed());
        let titles: Vec<_> = alerts.notifications().into_iter().map(|n| n.title).collect();
        assert_eq!(titles, vec!["Camera Access Error"]);
    }

    #[test]
    fn model_failure_prevents_start() {
        let alerts = Arc::new(RecordingAlertSink::new());
        let engine = Arc::new(DetectionEngine::new(Box::new(
            || -> Result<Box<dyn DetectorBackend>> { Err(anyhow!("weights missing")) },
        )));
        let controller = DetectionLoop::new(
            engine,
            Arc::new(SyntheticDevices::new("stub://test")),
            alerts.clone(),
            fast_settings(),
        );
        let video = VideoElement::new();
        assert!(controller.start(&video, |_: &DetectionResult| {}, None).is_none());
        assert!(video.src_object().is_none());
        assert_eq!(alerts.notifications()[0].title, "Model Loading Error");
    }

    #[test]
    fn video_element_is_exclusive() {
        let engine = crowd_engine(0);
        let devices: Arc<dyn MediaDevices> = Arc::new(SyntheticDevices::new("stub://test"));
        let alerts = Arc::new(RecordingAlertSink::new());
        let first = DetectionLoop::new(
            Arc::clone(&engine),
            Arc::clone(&devices),
            alerts.clone(),
            fast_settings(),
        );
        let second = DetectionLoop::new(engine, devices, alerts.clone(), fast_settings());
        let video = VideoElement::new();

        assert!(first.start(&video, |_: &DetectionResult| {}, None).is_some());
        assert!(second.start(&video, |_: &DetectionResult| {}, None).is_none());
        assert_eq!(second.state(), LoopState::Idle);
        first.stop();
        assert!(second.start(&video, |_: &DetectionResult| {}, None).is_some());
        second.stop();
    }

    #[test]
    fn unready_video_skips_ticks() {
        let controller = DetectionLoop::new(
            crowd_engine(1),
            Arc::new(StillDevices {
                width: 0,
                height: 0,
                stopped: false,
            }),
            Arc::new(RecordingAlertSink::new()),
            fast_settings(),
        );
        let video = VideoElement::new();
        assert!(controller.start(&video, |_: &DetectionResult| {}, None).is_some());
        assert!(wait_for(Duration::from_secs(5), || controller.stats().ticks_not_ready >= 2));
        controller.stop();
        let stats = controller.stats();
        assert_eq!(stats.ticks_run, 0);
        assert_eq!(stats.callbacks_delivered, 0);
    }

    #[test]
    fn playback_failure_is_not_fatal() {
        let alerts = Arc::new(RecordingAlertSink::new());
        let controller = DetectionLoop::new(
            crowd_engine(1),
            Arc::new(StillDevices {
                width: 64,
                height: 48,
                stopped: true,
            }),
            alerts.clone(),
            fast_settings(),
        );
        let video = VideoElement::new();
        assert!(controller.start(&video, |_: &DetectionResult| {}, None).is_some());
        assert_eq!(controller.state(), LoopState::Running);
        assert_eq!(alerts.notifications()[0].title, "Video Error");
        controller.stop();
    }

    #[test]
    fn overlay_tracks_rendered_size() {
        let controller = DetectionLoop::new(
            crowd_engine(1),
            Arc::new(SyntheticDevices::new("stub://test")),
            Arc::new(RecordingAlertSink::new()),
            fast_settings(),
        );
        let video = VideoElement::new();
        video.set_display_size(320, 180);
        let canvas = Arc::new(Mutex::new(RasterCanvas::new(1, 1)));
        let overlay: SharedOverlay = canvas.clone();
        let calls = Arc::new(AtomicU64::new(0));
        let seen = Arc::clone(&calls);

        controller.start(
            &video,
            move |_: &DetectionResult| {
                seen.fetch_add(1, Ordering::SeqCst);
            },
            Some(overlay),
        );
        assert!(wait_for(Duration::from_secs(5), || calls.load(Ordering::SeqCst) >= 1));
        controller.stop();
        let size = canvas.lock().map(|c| c.size()).unwrap_or((0, 0));
        assert_eq!(size, (320, 180));
    }

    #[test]
    fn stop_waits_for_a_running_callback() {
        let controller = DetectionLoop::new(
            crowd_engine(2),
            Arc::new(SyntheticDevices::new("stub://test")),
            Arc::new(RecordingAlertSink::new()),
            fast_settings(),
        );
        let video = VideoElement::new();
        let entered = Arc::new(AtomicU64::new(0));
        let finished = Arc::new(AtomicU64::new(0));
        let (e, f) = (Arc::clone(&entered), Arc::clone(&finished));
        controller.start(
            &video,
            move |_: &DetectionResult| {
                e.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(150));
                f.fetch_add(1, Ordering::SeqCst);
            },
            None,
        );
        assert!(wait_for(Duration::from_secs(5), || entered.load(Ordering::SeqCst) >= 1));

        let stopper = thread::scope(|scope| scope.spawn(|| controller.stop()).join());
        assert!(stopper.is_ok());
        let done = finished.load(Ordering::SeqCst);
        assert_eq!(entered.load(Ordering::SeqCst), done);

        thread::sleep(Duration::from_millis(100));
        assert_eq!(entered.load(Ordering::SeqCst), done);
        assert_eq!(controller.state(), LoopState::Idle);
    }

    #[test]
    fn callback_may_stop_its_own_loop() {
        let alerts = Arc::new(RecordingAlertSink::new());
        let controller = Arc::new(DetectionLoop::new(
            crowd_engine(8),
            Arc::new(SyntheticDevices::new("stub://test")),
            alerts.clone(),
            fast_settings(),
        ));
        let handle = Arc::downgrade(&controller);
        let video = VideoElement::new();
        controller.start(
            &video,
            move |r: &DetectionResult| {
                if r.count > 6 {
                    if let Some(controller) = handle.upgrade() {
                        controller.stop();
                    }
                }
            },
            None,
        );
        assert!(wait_for(Duration::from_secs(5), || controller.state() == LoopState::Idle));
        assert!(!video.is_claimed());

        // The red crowd was seen, but the loop was already stopped.
        thread::sleep(Duration::from_millis(100));
        assert!(alerts.notifications().is_empty());
        assert_eq!(controller.stats().callbacks_delivered, 1);
    }
}
