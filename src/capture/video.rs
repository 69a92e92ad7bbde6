use anyhow::{anyhow, Result};
use image::RgbImage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::stream::MediaStream;

/// Playback readiness, ordered like the HTML media `readyState` levels.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReadyState {
    HaveNothing = 0,
    HaveMetadata = 1,
    HaveCurrentData = 2,
    HaveFutureData = 3,
    HaveEnoughData = 4,
}

struct VideoInner {
    src: Option<MediaStream>,
    playing: bool,
    display_size: Option<(u32, u32)>,
}

/// Playback surface a stream is bound to.
///
/// Clones refer to the same element. At most one detection loop may hold the
/// element's claim at a time.
#[derive(Clone)]
pub struct VideoElement {
    inner: Arc<Mutex<VideoInner>>,
    claimed: Arc<AtomicBool>,
}

impl VideoElement {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(VideoInner {
                src: None,
                playing: false,
                display_size: None,
            })),
            claimed: Arc::new(AtomicBool::new(false)),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, VideoInner>> {
        self.inner
            .lock()
            .map_err(|_| anyhow!("video element lock poisoned"))
    }

    /// Bind (or with `None`, detach) a stream. Playback pauses on rebinding.
    pub fn set_src_object(&self, stream: Option<MediaStream>) -> Result<()> {
        let mut inner = self.lock()?;
        inner.src = stream;
        inner.playing = false;
        Ok(())
    }

    pub fn src_object(&self) -> Option<MediaStream> {
        self.lock().ok().and_then(|inner| inner.src.clone())
    }

    /// Detach and return the bound stream.
    pub fn take_src_object(&self) -> Option<MediaStream> {
        let mut inner = self.lock().ok()?;
        inner.playing = false;
        inner.src.take()
    }

    pub fn play(&self) -> Result<()> {
        let mut inner = self.lock()?;
        let live = inner.src.as_ref().is_some_and(|s| s.active());
        if !live {
            return Err(anyhow!("no live stream bound to the video element"));
        }
        inner.playing = true;
        Ok(())
    }

    pub fn is_playing(&self) -> bool {
        self.lock().map(|inner| inner.playing).unwrap_or(false)
    }

    /// Natural size of the bound video, `(0, 0)` until known.
    pub fn video_size(&self) -> (u32, u32) {
        let Ok(inner) = self.lock() else {
            return (0, 0);
        };
        inner
            .src
            .as_ref()
            .and_then(|s| s.video_track())
            .map(|t| {
                let settings = t.settings();
                (settings.width, settings.height)
            })
            .unwrap_or((0, 0))
    }

    pub fn video_width(&self) -> u32 {
        self.video_size().0
    }

    pub fn ready_state(&self) -> ReadyState {
        let Ok(inner) = self.lock() else {
            return ReadyState::HaveNothing;
        };
        let Some(track) = inner.src.as_ref().and_then(|s| s.video_track()) else {
            return ReadyState::HaveNothing;
        };
        if !track.is_live() {
            return ReadyState::HaveNothing;
        }
        let settings = track.settings();
        if settings.width == 0 || settings.height == 0 {
            return ReadyState::HaveNothing;
        }
        if inner.playing {
            ReadyState::HaveEnoughData
        } else {
            ReadyState::HaveMetadata
        }
    }

    /// True when a frame can be sampled: current data and a nonzero width.
    pub fn has_frame(&self) -> bool {
        self.ready_state() >= ReadyState::HaveCurrentData && self.video_width() > 0
    }

    /// Size the element is rendered at on screen.
    pub fn set_display_size(&self, width: u32, height: u32) {
        if let Ok(mut inner) = self.lock() {
            inner.display_size = Some((width, height));
        }
    }

    /// Rendered size, falling back to the natural size.
    pub fn client_size(&self) -> (u32, u32) {
        let display = self.lock().ok().and_then(|inner| inner.display_size);
        match display {
            Some((w, h)) if w > 0 && h > 0 => (w, h),
            _ => self.video_size(),
        }
    }

    /// Grab the current frame from the bound track.
    pub fn current_frame(&self) -> Result<RgbImage> {
        let track = {
            let inner = self.lock()?;
            inner
                .src
                .as_ref()
                .and_then(|s| s.video_track())
                .cloned()
                .ok_or_else(|| anyhow!("no stream bound to the video element"))?
        };
        track
            .capture()?
            .ok_or_else(|| anyhow!("video track '{}' has no frame yet", track.label()))
    }

    pub(crate) fn try_claim(&self) -> bool {
        self.claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub(crate) fn release_claim(&self) {
        self.claimed.store(false, Ordering::Release);
    }

    pub fn is_claimed(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }
}

impl Default for VideoElement {
    fn default() -> Self {
        Self::new()
    }
}

/// Stop every track of the bound stream and detach it. No-op when nothing is bound.
pub fn stop_camera(video: &VideoElement) {
    if let Some(stream) = video.take_src_object() {
        stream.stop_all();
        log::info!("camera stream {} released", stream.id());
    }
}
