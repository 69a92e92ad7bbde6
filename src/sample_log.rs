//! Throttled persistence of crowd samples.
//!
//! At most one write per place per interval, measured from the last
//! successful write. Store failures are logged and never reach the caller.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Result};

use crate::detect::DetectionResult;
use crate::storage::{CrowdSample, NewCrowdSample, SampleStore};

pub const DEFAULT_LOG_INTERVAL: Duration = Duration::from_secs(20);

/// Millisecond wall clock.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            now: AtomicI64::new(start_ms),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }

    pub fn set(&self, ms: i64) {
        self.now.store(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

impl<C: Clock + ?Sized> Clock for Arc<C> {
    fn now_ms(&self) -> i64 {
        (**self).now_ms()
    }
}

pub struct SampleLogger {
    store: Mutex<Box<dyn SampleStore>>,
    clock: Box<dyn Clock>,
    min_interval_ms: i64,
    last_write: Mutex<HashMap<String, i64>>,
}

impl SampleLogger {
    pub fn new(store: Box<dyn SampleStore>) -> Self {
        Self::with_clock(store, Box::new(SystemClock), DEFAULT_LOG_INTERVAL)
    }

    pub fn with_clock(store: Box<dyn SampleStore>, clock: Box<dyn Clock>, interval: Duration) -> Self {
        Self {
            store: Mutex::new(store),
            clock,
            min_interval_ms: interval.as_millis() as i64,
            last_write: Mutex::new(HashMap::new()),
        }
    }

    /// Persist a sample for `place_id` if the interval has elapsed since the
    /// last successful write for it. Returns the stored sample when written.
    pub fn maybe_log(
        &self,
        result: &DetectionResult,
        place_id: &str,
        place_name: &str,
    ) -> Option<CrowdSample> {
        match self.try_log(result, place_id, place_name) {
            Ok(written) => written,
            Err(e) => {
                log::warn!("failed to log crowd sample for {}: {:#}", place_id, e);
                None
            }
        }
    }

    fn try_log(
        &self,
        result: &DetectionResult,
        place_id: &str,
        place_name: &str,
    ) -> Result<Option<CrowdSample>> {
        // Held across the write so two loops on one place cannot both pass the gate.
        let mut last_write = self
            .last_write
            .lock()
            .map_err(|_| anyhow!("sample logger throttle lock poisoned"))?;
        let now = self.clock.now_ms();
        if let Some(last) = last_write.get(place_id) {
            if now - last < self.min_interval_ms {
                return Ok(None);
            }
        }

        let sample = NewCrowdSample {
            place_id: place_id.to_string(),
            place_name: place_name.to_string(),
            count: u32::try_from(result.count).unwrap_or(u32::MAX),
            status: result.status,
            captured_at: now,
        };
        let stored = self
            .store
            .lock()
            .map_err(|_| anyhow!("sample store lock poisoned"))?
            .insert(&sample)?;
        last_write.insert(place_id.to_string(), now);
        log::debug!(
            "logged crowd sample {} for {}: {} ({})",
            stored.id,
            place_id,
            stored.count,
            stored.status
        );
        Ok(Some(stored))
    }

    pub fn samples(&self) -> Result<Vec<CrowdSample>> {
        self.store
            .lock()
            .map_err(|_| anyhow!("sample store lock poisoned"))?
            .list()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BoundingBox, Detection};
    use crate::storage::InMemorySampleStore;
    use anyhow::bail;

    struct FailingStore {
        failures_left: usize,
        inner: InMemorySampleStore,
    }

    impl SampleStore for FailingStore {
        fn insert(&mut self, sample: &NewCrowdSample) -> Result<CrowdSample> {
            if self.failures_left > 0 {
                self.failures_left -= 1;
                bail!("network unreachable");
            }
            self.inner.insert(sample)
        }

        fn list(&mut self) -> Result<Vec<CrowdSample>> {
            self.inner.list()
        }
    }

    fn result_with(count: usize) -> DetectionResult {
        let detections = (0..count)
            .map(|_| Detection {
                bbox: BoundingBox::from_xywh([0.0, 0.0, 4.0, 8.0]),
                score: 0.8,
            })
            .collect();
        DetectionResult::from_detections(detections, None)
    }

    fn logger(clock: Arc<ManualClock>, store: Box<dyn SampleStore>) -> SampleLogger {
        SampleLogger::with_clock(store, Box::new(clock), DEFAULT_LOG_INTERVAL)
    }

    #[test]
    fn tick_stream_is_throttled() -> Result<()> {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let logger = logger(Arc::clone(&clock), Box::new(InMemorySampleStore::new()));

        let mut written = 0;
        for _ in 0..30 {
            if logger.maybe_log(&result_with(2), "temple", "Temple").is_some() {
                written += 1;
            }
            clock.advance(Duration::from_millis(800));
        }
        assert_eq!(written, 2);
        assert_eq!(logger.samples()?.len(), 2);
        Ok(())
    }

    #[test]
    fn exactly_twenty_seconds_writes_again() {
        let clock = Arc::new(ManualClock::new(0));
        let logger = logger(Arc::clone(&clock), Box::new(InMemorySampleStore::new()));
        assert!(logger.maybe_log(&result_with(1), "temple", "Temple").is_some());
        clock.advance(Duration::from_millis(19_999));
        assert!(logger.maybe_log(&result_with(1), "temple", "Temple").is_none());
        clock.advance(Duration::from_millis(1));
        assert!(logger.maybe_log(&result_with(1), "temple", "Temple").is_some());
    }

    #[test]
    fn places_are_throttled_independently() {
        let clock = Arc::new(ManualClock::new(0));
        let logger = logger(Arc::clone(&clock), Box::new(InMemorySampleStore::new()));
        assert!(logger.maybe_log(&result_with(7), "temple", "Temple").is_some());
        assert!(logger.maybe_log(&result_with(3), "ghat", "Ghat").is_some());
        assert!(logger.maybe_log(&result_with(3), "ghat", "Ghat").is_none());
    }

    #[test]
    fn failed_write_does_not_start_the_interval() -> Result<()> {
        let clock = Arc::new(ManualClock::new(0));
        let store = FailingStore {
            failures_left: 1,
            inner: InMemorySampleStore::new(),
        };
        let logger = logger(Arc::clone(&clock), Box::new(store));

        assert!(logger.maybe_log(&result_with(8), "temple", "Temple").is_none());
        clock.advance(Duration::from_millis(800));
        let stored = logger
            .maybe_log(&result_with(8), "temple", "Temple")
            .expect("retry on next tick");
        assert_eq!(stored.captured_at, 800);
        assert_eq!(stored.status, crate::classify::AlertStatus::Red);
        assert_eq!(logger.samples()?.len(), 1);
        Ok(())
    }
}
