//! Rolling-window throughput measurement.
//!
//! [`RateWindow`] splits a time window into fixed buckets and rotates
//! through them as time passes, so the reported rate reflects only recent
//! activity. The progress tracker uses a ~30 second window for its
//! instantaneous records-per-second figure.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Shortest supported bucket; windows are clamped so that rotation math
/// never divides by zero.
const MIN_BUCKET: Duration = Duration::from_millis(1);

/// Bucketed rolling-window event counter.
#[derive(Debug)]
pub struct RateWindow {
    buckets: Box<[AtomicU64]>,
    bucket_duration: Duration,
    cursor: AtomicUsize,
    last_rotation: Mutex<Instant>,
}

impl RateWindow {
    /// Create a window of `window` total length split into `buckets` slots.
    pub fn new(window: Duration, buckets: usize) -> Self {
        let buckets = buckets.max(1);
        let bucket_duration = (window / buckets as u32).max(MIN_BUCKET);
        let slots: Vec<AtomicU64> = (0..buckets).map(|_| AtomicU64::new(0)).collect();

        Self {
            buckets: slots.into_boxed_slice(),
            bucket_duration,
            cursor: AtomicUsize::new(0),
            last_rotation: Mutex::new(Instant::now()),
        }
    }

    /// Total window length.
    pub fn window(&self) -> Duration {
        self.bucket_duration * self.buckets.len() as u32
    }

    /// Record `count` events now.
    pub fn record(&self, count: u64) {
        self.advance();
        let idx = self.cursor.load(Ordering::Relaxed);
        self.buckets[idx].fetch_add(count, Ordering::Relaxed);
    }

    /// Events per second over the window.
    pub fn rate(&self) -> f64 {
        self.advance();
        let total: u64 = self
            .buckets
            .iter()
            .map(|b| b.load(Ordering::Relaxed))
            .sum();
        total as f64 / self.window().as_secs_f64()
    }

    /// Total events still inside the window.
    pub fn total(&self) -> u64 {
        self.advance();
        self.buckets.iter().map(|b| b.load(Ordering::Relaxed)).sum()
    }

    /// Rotate past buckets out of the window.
    fn advance(&self) {
        let mut last = self.last_rotation.lock();
        let elapsed = last.elapsed();
        if elapsed < self.bucket_duration {
            return;
        }

        let steps = (elapsed.as_nanos() / self.bucket_duration.as_nanos()) as usize;
        if steps >= self.buckets.len() {
            // window fully elapsed; everything ages out
            for bucket in self.buckets.iter() {
                bucket.store(0, Ordering::Relaxed);
            }
            *last = Instant::now();
            return;
        }

        for _ in 0..steps {
            let next = (self.cursor.load(Ordering::Relaxed) + 1) % self.buckets.len();
            self.buckets[next].store(0, Ordering::Relaxed);
            self.cursor.store(next, Ordering::Relaxed);
        }
        // advance by whole buckets so rotation does not drift
        *last += self.bucket_duration * steps as u32;
    }
}

impl Default for RateWindow {
    /// A 30 second window with one-second buckets.
    fn default() -> Self {
        Self::new(Duration::from_secs(30), 30)
    }
}
