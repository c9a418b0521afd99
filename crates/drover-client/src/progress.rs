//! Progress tracking for bulk runs
//!
//! [`ProgressTracker`] folds per-batch results into completion percent,
//! overall and recent throughput, and an ETA. Consumers receive
//! [`ProgressSnapshot`]s through a [`ProgressSink`] after every completed
//! batch.

use drover_core::RateWindow;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Point-in-time progress of a bulk run
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProgressSnapshot {
    /// Records in the run
    pub total: u64,
    /// Records confirmed written
    pub succeeded: u64,
    /// Records that failed permanently
    pub failed: u64,
    /// Completion percentage over `total`
    pub percent: f64,
    /// Records per second since the run started
    pub overall_rate: f64,
    /// Records per second over the recent window (~30s)
    pub instantaneous_rate: f64,
    /// Estimated time to completion; `None` until a rate is measurable
    pub eta: Option<Duration>,
    /// Time since the run started
    pub elapsed: Duration,
}

/// Aggregates batch completions into run-level progress
#[derive(Debug)]
pub struct ProgressTracker {
    total: u64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    started: Instant,
    window: RateWindow,
}

impl ProgressTracker {
    /// Start tracking a run of `total` records
    pub fn new(total: u64) -> Self {
        Self {
            total,
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            started: Instant::now(),
            window: RateWindow::default(),
        }
    }

    /// Fold one completed batch in and return the updated snapshot
    pub fn record_batch(&self, succeeded: u64, failed: u64) -> ProgressSnapshot {
        self.succeeded.fetch_add(succeeded, Ordering::Relaxed);
        self.failed.fetch_add(failed, Ordering::Relaxed);
        self.window.record(succeeded + failed);
        self.snapshot()
    }

    /// Current progress
    pub fn snapshot(&self) -> ProgressSnapshot {
        let succeeded = self.succeeded.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let done = succeeded + failed;
        let elapsed = self.started.elapsed();

        let percent = if self.total == 0 {
            100.0
        } else {
            done as f64 * 100.0 / self.total as f64
        };

        let overall_rate = if elapsed.as_secs_f64() > 0.0 {
            done as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };
        let instantaneous_rate = self.window.rate();

        let remaining = self.total.saturating_sub(done);
        // prefer the recent window; early in a run it is empty and the
        // overall rate is the only signal
        let pace = if instantaneous_rate > 0.0 {
            instantaneous_rate
        } else {
            overall_rate
        };
        let eta = if remaining == 0 {
            Some(Duration::ZERO)
        } else if pace > 0.0 {
            Some(Duration::from_secs_f64(remaining as f64 / pace))
        } else {
            None
        };

        ProgressSnapshot {
            total: self.total,
            succeeded,
            failed,
            percent,
            overall_rate,
            instantaneous_rate,
            eta,
            elapsed,
        }
    }
}

/// Receives a snapshot after every completed batch.
///
/// Implementations must not block: they run on the dispatch path. A slow
/// consumer should forward the snapshot to its own channel or task.
pub trait ProgressSink: Send + Sync {
    /// Publish one snapshot
    fn publish(&self, snapshot: &ProgressSnapshot);
}

/// Discards all snapshots
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn publish(&self, _snapshot: &ProgressSnapshot) {}
}

/// Broadcasting through a watch channel keeps only the latest snapshot,
/// which is exactly the progress-bar use case.
impl ProgressSink for tokio::sync::watch::Sender<ProgressSnapshot> {
    fn publish(&self, snapshot: &ProgressSnapshot) {
        let _ = self.send(snapshot.clone());
    }
}
