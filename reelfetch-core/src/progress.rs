use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::types::Progress;

const SPEED_ALPHA: f64 = 0.3;
const PERSIST_INTERVAL: Duration = Duration::from_millis(500);

struct Smoothing {
    speed: f64,
    last_update: Instant,
    last_bytes: u64,
    last_persist: Instant,
}

/// Per-download byte accounting, smoothed speed, and throttled persistence.
/// Notifies on every `record` call regardless of the persistence throttle —
/// UI sees fresh data, the state store sees at most one write per 500ms.
pub struct ProgressTracker {
    downloaded: AtomicU64,
    total: AtomicU64,
    fragment_total: AtomicU64,
    fragments_completed: AtomicU64,
    segments_collected: AtomicU64,
    force_next_persist: AtomicBool,
    smoothing: Mutex<Smoothing>,
    notify: Box<dyn Fn(&Progress) + Send + Sync>,
    persist: Box<dyn Fn(&Progress) + Send + Sync>,
}

impl ProgressTracker {
    pub fn new(
        notify: impl Fn(&Progress) + Send + Sync + 'static,
        persist: impl Fn(&Progress) + Send + Sync + 'static,
    ) -> Self {
        let now = Instant::now();
        Self {
            downloaded: AtomicU64::new(0),
            total: AtomicU64::new(0),
            fragment_total: AtomicU64::new(0),
            fragments_completed: AtomicU64::new(0),
            segments_collected: AtomicU64::new(0),
            force_next_persist: AtomicBool::new(true),
            smoothing: Mutex::new(Smoothing {
                speed: 0.0,
                last_update: now,
                last_bytes: 0,
                last_persist: now - PERSIST_INTERVAL,
            }),
            notify: Box::new(notify),
            persist: Box::new(persist),
        }
    }

    /// Bump `totalBytes`; monotonically non-decreasing, as new samples bump
    /// the estimate further during §4.E step 2-3.
    pub fn set_total(&self, total: u64) {
        self.total
            .fetch_max(total, Ordering::Relaxed);
    }

    /// Fragment count the running average is scaled against. Set once, before
    /// the first `record` call, so every completion re-estimates `total` as
    /// `avg(bytes/fragment) * fragment_total`.
    pub fn set_fragment_total(&self, fragment_total: u64) {
        self.fragment_total.store(fragment_total, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    /// Live recording's running segment count; surfaced in `Progress` the
    /// same way `total`/`downloaded` are, with no smoothing applied.
    pub fn set_segments_collected(&self, count: u64) {
        self.segments_collected.store(count, Ordering::Relaxed);
    }

    /// Called once per fragment completion. Updates the in-memory state on
    /// every call, persists at most once per 500ms, and always notifies.
    pub fn record(&self, bytes: u64) {
        let downloaded = self.downloaded.fetch_add(bytes, Ordering::Relaxed) + bytes;
        let fragments_completed = self.fragments_completed.fetch_add(1, Ordering::Relaxed) + 1;

        let fragment_total = self.fragment_total.load(Ordering::Relaxed);
        if fragment_total > 0 {
            let avg = downloaded as f64 / fragments_completed as f64;
            let estimated = (avg * fragment_total as f64).round() as u64;
            self.total.fetch_max(estimated, Ordering::Relaxed);
        }
        let total = self.total.load(Ordering::Relaxed);

        let (speed, should_persist) = {
            let mut smoothing = self.smoothing.lock().unwrap();
            let now = Instant::now();
            let elapsed = now.duration_since(smoothing.last_update).as_secs_f64();
            let instant = if elapsed > 0.0 {
                (downloaded.saturating_sub(smoothing.last_bytes)) as f64 / elapsed
            } else {
                smoothing.speed
            };
            smoothing.speed = SPEED_ALPHA * instant + (1.0 - SPEED_ALPHA) * smoothing.speed;
            smoothing.last_update = now;
            smoothing.last_bytes = downloaded;

            let forced = self.force_next_persist.swap(false, Ordering::AcqRel);
            let due = now.duration_since(smoothing.last_persist) >= PERSIST_INTERVAL;
            let should_persist = forced || due;
            if should_persist {
                smoothing.last_persist = now;
            }
            (smoothing.speed, should_persist)
        };

        let percentage = if total > 0 {
            (downloaded as f64 / total as f64 * 100.0).min(100.0)
        } else {
            0.0
        };

        let segments_collected = self.segments_collected.load(Ordering::Relaxed);
        let progress = Progress {
            downloaded,
            total,
            percentage,
            speed,
            message: None,
            error: None,
            segments_collected: if segments_collected > 0 {
                Some(segments_collected)
            } else {
                None
            },
        };

        (self.notify)(&progress);
        if should_persist {
            (self.persist)(&progress);
        }
    }

    /// Invalidate the persistence throttle so the next `record` call writes
    /// through immediately; called on every stage transition.
    pub fn invalidate_on_stage_transition(&self) {
        self.force_next_persist.store(true, Ordering::Release);
    }

    pub fn snapshot(&self) -> Progress {
        let smoothing = self.smoothing.lock().unwrap();
        let downloaded = self.downloaded.load(Ordering::Relaxed);
        let total = self.total.load(Ordering::Relaxed);
        Progress {
            downloaded,
            total,
            percentage: if total > 0 {
                (downloaded as f64 / total as f64 * 100.0).min(100.0)
            } else {
                0.0
            },
            speed: smoothing.speed,
            message: None,
            error: None,
            segments_collected: {
                let count = self.segments_collected.load(Ordering::Relaxed);
                if count > 0 {
                    Some(count)
                } else {
                    None
                }
            },
        }
    }
}
