//! Cancellable fixed-interval task.
//!
//! A dedicated timer thread fires ticks at `warmup + n * interval`. The
//! handle's `cancel` is the single cancellation point; dropping the handle
//! cancels too.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};

/// What to do when a tick is still running at the next deadline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum OverlapPolicy {
    /// Run ticks one after another; deadlines that pass meanwhile are skipped.
    #[default]
    SkipIfBusy,
    /// Start every tick on its own worker thread, up to
    /// `MAX_OVERLAPPING_TICKS` at once; further deadlines are skipped.
    AllowOverlap,
}

/// Worker threads one overlapping task may have in flight.
pub const MAX_OVERLAPPING_TICKS: usize = 4;

impl OverlapPolicy {
    pub fn parse(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "skip" | "skip-if-busy" => Ok(OverlapPolicy::SkipIfBusy),
            "overlap" | "allow-overlap" => Ok(OverlapPolicy::AllowOverlap),
            other => bail!("unknown overlap policy '{}' (expected skip or overlap)", other),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OverlapPolicy::SkipIfBusy => "skip",
            OverlapPolicy::AllowOverlap => "overlap",
        }
    }
}

#[derive(Debug, Default)]
struct TaskCounters {
    started: AtomicU64,
    skipped: AtomicU64,
    in_flight: AtomicUsize,
}

/// Releases a worker slot when the tick returns or unwinds.
struct InFlight(Arc<TaskCounters>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Handle to a running repeating task.
pub struct RepeatingTask {
    name: String,
    running: Arc<AtomicBool>,
    cancel_tx: Mutex<Option<Sender<()>>>,
    counters: Arc<TaskCounters>,
}

impl RepeatingTask {
    /// Spawn the timer thread. `tick` receives a sequence number starting at 1.
    pub fn spawn<F>(
        name: &str,
        warmup: Duration,
        interval: Duration,
        policy: OverlapPolicy,
        tick: F,
    ) -> Result<Self>
    where
        F: Fn(u64) + Send + Sync + 'static,
    {
        if interval.is_zero() {
            bail!("repeating task '{}' needs a non-zero interval", name);
        }
        let running = Arc::new(AtomicBool::new(true));
        let counters = Arc::new(TaskCounters::default());
        let (cancel_tx, cancel_rx) = mpsc::channel::<()>();

        let thread_running = Arc::clone(&running);
        let thread_counters = Arc::clone(&counters);
        let thread_name = name.to_string();
        let tick = Arc::new(tick);
        thread::Builder::new()
            .name(format!("{}-timer", name))
            .spawn(move || {
                let mut next = Instant::now() + warmup;
                let mut sequence = 0u64;
                loop {
                    let now = Instant::now();
                    if next > now {
                        match cancel_rx.recv_timeout(next - now) {
                            Err(RecvTimeoutError::Timeout) => {}
                            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        }
                    }
                    if !thread_running.load(Ordering::Acquire) {
                        break;
                    }

                    match policy {
                        OverlapPolicy::SkipIfBusy => {
                            sequence += 1;
                            thread_counters.started.fetch_add(1, Ordering::Relaxed);
                            tick(sequence);
                        }
                        OverlapPolicy::AllowOverlap => {
                            let busy = thread_counters.in_flight.load(Ordering::Acquire);
                            if busy >= MAX_OVERLAPPING_TICKS {
                                thread_counters.skipped.fetch_add(1, Ordering::Relaxed);
                            } else {
                                sequence += 1;
                                thread_counters.started.fetch_add(1, Ordering::Relaxed);
                                thread_counters.in_flight.fetch_add(1, Ordering::AcqRel);
                                let slot = InFlight(Arc::clone(&thread_counters));
                                let worker = Arc::clone(&tick);
                                let spawned = thread::Builder::new()
                                    .name(format!("{}-tick", thread_name))
                                    .spawn(move || {
                                        let _slot = slot;
                                        worker(sequence)
                                    });
                                if let Err(e) = spawned {
                                    log::error!(
                                        "{}: failed to spawn tick worker: {}",
                                        thread_name,
                                        e
                                    );
                                }
                            }
                        }
                    }

                    next += interval;
                    let now = Instant::now();
                    while next <= now {
                        next += interval;
                        thread_counters.skipped.fetch_add(1, Ordering::Relaxed);
                    }
                }
                log::debug!("{}: timer stopped after {} ticks", thread_name, sequence);
            })
            .with_context(|| format!("failed to spawn timer thread for '{}'", name))?;

        Ok(Self {
            name: name.to_string(),
            running,
            cancel_tx: Mutex::new(Some(cancel_tx)),
            counters,
        })
    }

    /// Stop scheduling ticks. Returns without waiting for an in-flight tick.
    pub fn cancel(&self) -> Result<()> {
        self.running.store(false, Ordering::Release);
        let sender = self
            .cancel_tx
            .lock()
            .map_err(|_| anyhow!("repeating task '{}' lock poisoned", self.name))?
            .take();
        if let Some(sender) = sender {
            // The timer may already have exited; a closed channel is fine.
            let _ = sender.send(());
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn ticks_started(&self) -> u64 {
        self.counters.started.load(Ordering::Relaxed)
    }

    /// Deadlines that passed while a tick was still running.
    pub fn deadlines_skipped(&self) -> u64 {
        self.counters.skipped.load(Ordering::Relaxed)
    }

    /// Overlapping tick workers currently running.
    pub fn ticks_in_flight(&self) -> usize {
        self.counters.in_flight.load(Ordering::Acquire)
    }
}

impl Drop for RepeatingTask {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn ticks_repeat_until_cancelled() -> Result<()> {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let task = RepeatingTask::spawn(
            "repeat",
            Duration::ZERO,
            Duration::from_millis(10),
            OverlapPolicy::SkipIfBusy,
            move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            },
        )?;

        assert!(wait_for(Duration::from_secs(2), || count.load(Ordering::SeqCst) >= 3));
        task.cancel()?;
        assert!(!task.is_running());
        thread::sleep(Duration::from_millis(30));
        let after_cancel = count.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(60));
        assert_eq!(count.load(Ordering::SeqCst), after_cancel);
        Ok(())
    }

    #[test]
    fn warmup_delays_first_tick() -> Result<()> {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let task = RepeatingTask::spawn(
            "warmup",
            Duration::from_millis(300),
            Duration::from_millis(10),
            OverlapPolicy::SkipIfBusy,
            move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            },
        )?;
        thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        task.cancel()?;
        Ok(())
    }

    #[test]
    fn slow_ticks_skip_deadlines() -> Result<()> {
        let task = RepeatingTask::spawn(
            "slow",
            Duration::ZERO,
            Duration::from_millis(10),
            OverlapPolicy::SkipIfBusy,
            |_| thread::sleep(Duration::from_millis(35)),
        )?;
        assert!(wait_for(Duration::from_secs(2), || task.ticks_started() >= 3));
        task.cancel()?;
        assert!(task.deadlines_skipped() >= 2);
        Ok(())
    }

    #[test]
    fn overlapping_ticks_run_concurrently() -> Result<()> {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (a, p) = (Arc::clone(&active), Arc::clone(&peak));
        let task = RepeatingTask::spawn(
            "overlap",
            Duration::ZERO,
            Duration::from_millis(10),
            OverlapPolicy::AllowOverlap,
            move |_| {
                let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(50));
                a.fetch_sub(1, Ordering::SeqCst);
            },
        )?;
        assert!(wait_for(Duration::from_secs(2), || peak.load(Ordering::SeqCst) >= 2));
        task.cancel()?;
        Ok(())
    }

    #[test]
    fn overlapping_workers_are_capped() -> Result<()> {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (a, p) = (Arc::clone(&active), Arc::clone(&peak));
        let task = RepeatingTask::spawn(
            "capped",
            Duration::ZERO,
            Duration::from_millis(2),
            OverlapPolicy::AllowOverlap,
            move |_| {
                let now = a.fetch_add(1, Ordering::SeqCst) + 1;
                p.fetch_max(now, Ordering::SeqCst);
                thread::sleep(Duration::from_millis(200));
                a.fetch_sub(1, Ordering::SeqCst);
            },
        )?;
        assert!(wait_for(Duration::from_secs(2), || task.deadlines_skipped() >= 5));
        assert!(task.ticks_in_flight() <= MAX_OVERLAPPING_TICKS);
        task.cancel()?;
        assert!(peak.load(Ordering::SeqCst) <= MAX_OVERLAPPING_TICKS);
        assert!(wait_for(Duration::from_secs(2), || task.ticks_in_flight() == 0));
        Ok(())
    }

    #[test]
    fn sequence_numbers_increase() -> Result<()> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let task = RepeatingTask::spawn(
            "sequence",
            Duration::ZERO,
            Duration::from_millis(5),
            OverlapPolicy::SkipIfBusy,
            move |seq| {
                if let Ok(mut v) = sink.lock() {
                    v.push(seq);
                }
            },
        )?;
        assert!(wait_for(Duration::from_secs(2), || seen
            .lock()
            .map(|v| v.len() >= 3)
            .unwrap_or(false)));
        task.cancel()?;
        let v = seen.lock().map_err(|_| anyhow!("poisoned"))?.clone();
        assert_eq!(&v[..3], &[1, 2, 3]);
        Ok(())
    }

    #[test]
    fn zero_interval_is_rejected() {
        assert!(RepeatingTask::spawn(
            "zero",
            Duration::ZERO,
            Duration::ZERO,
            OverlapPolicy::SkipIfBusy,
            |_| {}
        )
        .is_err());
    }

    #[test]
    fn policy_parsing() -> Result<()> {
        assert_eq!(OverlapPolicy::parse("skip")?, OverlapPolicy::SkipIfBusy);
        assert_eq!(OverlapPolicy::parse("Overlap")?, OverlapPolicy::AllowOverlap);
        assert!(OverlapPolicy::parse("queue").is_err());
        Ok(())
    }
}
