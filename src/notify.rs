//! User-facing notifications.
//!
//! `AlertSink` is the seam to whatever shows notifications to the operator.
//! `alert_for` is the crowd-tier policy applied after each delivered result.

use std::sync::Mutex;

use crate::classify::{AlertStatus, GREEN_MAX};
use crate::detect::DetectionResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Default,
    Destructive,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub description: String,
    pub severity: Severity,
}

impl Notification {
    pub fn new(title: impl Into<String>, description: impl Into<String>, severity: Severity) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            severity,
        }
    }

    pub fn camera_access_error() -> Self {
        Self::new(
            "Camera Access Error",
            "Could not access camera. Please check permissions and try again.",
            Severity::Destructive,
        )
    }

    pub fn model_loading_error() -> Self {
        Self::new(
            "Model Loading Error",
            "Could not load AI detection model.",
            Severity::Destructive,
        )
    }

    pub fn video_error() -> Self {
        Self::new(
            "Video Error",
            "Could not start video playback",
            Severity::Destructive,
        )
    }

    pub fn video_in_use() -> Self {
        Self::new(
            "Error",
            "Video element is already bound to a running detection loop",
            Severity::Destructive,
        )
    }
}

pub trait AlertSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Writes notifications to the log: destructive at `error`, default at `warn`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LogAlertSink;

impl AlertSink for LogAlertSink {
    fn notify(&self, notification: Notification) {
        match notification.severity {
            Severity::Destructive => {
                log::error!("{}: {}", notification.title, notification.description)
            }
            Severity::Default => log::warn!("{}: {}", notification.title, notification.description),
        }
    }
}

/// Keeps every notification; used by tests and embedders that poll.
#[derive(Debug, Default)]
pub struct RecordingAlertSink {
    seen: Mutex<Vec<Notification>>,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.seen.lock().map(|seen| seen.clone()).unwrap_or_default()
    }
}

impl AlertSink for RecordingAlertSink {
    fn notify(&self, notification: Notification) {
        if let Ok(mut seen) = self.seen.lock() {
            seen.push(notification);
        }
    }
}

/// Notification raised for a result, if any. Red and Yellow alert the
/// operator; Green with people in frame is only logged.
pub fn alert_for(result: &DetectionResult) -> Option<Notification> {
    match result.status {
        AlertStatus::Red => Some(Notification::new(
            "🚨 RED ALERT - High Crowd Detected!",
            format!(
                "AI detected {} people - IMMEDIATE ACTION REQUIRED!",
                result.count
            ),
            Severity::Destructive,
        )),
        AlertStatus::Yellow => Some(Notification::new(
            "⚠️ YELLOW ALERT - Moderate Crowd",
            format!("AI detected {} people - Monitor closely", result.count),
            Severity::Default,
        )),
        AlertStatus::Green => {
            if (1..=GREEN_MAX).contains(&result.count) {
                log::info!("GREEN ALERT - Safe crowd level: {} people", result.count);
            }
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BoundingBox, Detection};

    fn result_with(count: usize) -> DetectionResult {
        let detections = (0..count)
            .map(|i| Detection {
                bbox: BoundingBox::from_xywh([i as f32, 0.0, 5.0, 10.0]),
                score: 0.9,
            })
            .collect();
        DetectionResult::from_detections(detections, None)
    }

    #[test]
    fn red_is_destructive() {
        let n = alert_for(&result_with(9)).expect("red alert");
        assert_eq!(n.severity, Severity::Destructive);
        assert_eq!(n.title, "🚨 RED ALERT - High Crowd Detected!");
        assert_eq!(n.description, "AI detected 9 people - IMMEDIATE ACTION REQUIRED!");
    }

    #[test]
    fn yellow_is_default_severity() {
        let n = alert_for(&result_with(5)).expect("yellow alert");
        assert_eq!(n.severity, Severity::Default);
        assert_eq!(n.description, "AI detected 5 people - Monitor closely");
    }

    #[test]
    fn green_never_notifies() {
        assert!(alert_for(&result_with(0)).is_none());
        assert!(alert_for(&result_with(2)).is_none());
    }

    #[test]
    fn recording_sink_keeps_order() {
        let sink = RecordingAlertSink::new();
        sink.notify(Notification::camera_access_error());
        sink.notify(Notification::video_error());
        let titles: Vec<_> = sink.notifications().into_iter().map(|n| n.title).collect();
        assert_eq!(titles, vec!["Camera Access Error", "Video Error"]);
    }
}
