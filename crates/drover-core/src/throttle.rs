//! Per-source throttle state.
//!
//! The remote record service answers over-quota calls with a rate-limit
//! fault carrying an optional retry-after hint. [`ThrottleTracker`] remembers,
//! per connection source, when that penalty expires so that selection can
//! route around throttled sources and acquisition can sleep until the
//! nearest expiry instead of polling.
//!
//! The tracker is pure in-memory state: it never performs I/O and has no
//! side effects beyond its own map and counters. Reads vastly outnumber
//! writes (every selection consults it, only faults mutate it), so the
//! expiry map lives under a `parking_lot::RwLock` and the counters are
//! relaxed atomics.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

/// Penalty applied when a rate-limit fault carries no retry-after hint.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(30);

/// Tracks which connection sources are currently rate limited.
///
/// Expiries are monotonic: concurrent writers can only extend a penalty,
/// never shorten one. A stale writer that observed an older, shorter
/// retry-after loses against the newer, longer one regardless of arrival
/// order.
#[derive(Debug, Default)]
pub struct ThrottleTracker {
    /// Source name -> instant the throttle penalty expires.
    expiries: RwLock<HashMap<String, Instant>>,
    stats: ThrottleStats,
}

impl ThrottleTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a rate-limit fault for `source` with the given penalty.
    pub fn record_throttle(&self, source: &str, retry_after: Duration) {
        let until = Instant::now() + retry_after;
        {
            let mut map = self.expiries.write();
            let entry = map.entry(source.to_string()).or_insert(until);
            if until > *entry {
                *entry = until;
            }
        }
        self.stats.record_event(retry_after);
        debug!(
            source,
            retry_after_ms = retry_after.as_millis() as u64,
            "source throttled"
        );
    }

    /// Whether `source` currently has an unexpired penalty.
    pub fn is_throttled(&self, source: &str) -> bool {
        let now = Instant::now();
        self.expiries
            .read()
            .get(source)
            .map_or(false, |until| *until > now)
    }

    /// Remaining penalty for `source`, if it is currently throttled.
    pub fn remaining(&self, source: &str) -> Option<Duration> {
        let now = Instant::now();
        self.expiries
            .read()
            .get(source)
            .and_then(|until| until.checked_duration_since(now))
            .filter(|d| !d.is_zero())
    }

    /// The recorded expiry instant for `source`, possibly already past.
    pub fn expiry_of(&self, source: &str) -> Option<Instant> {
        self.expiries.read().get(source).copied()
    }

    /// Drop any penalty recorded for `source`.
    pub fn clear(&self, source: &str) {
        self.expiries.write().remove(source);
    }

    /// Shortest remaining penalty across all throttled sources.
    ///
    /// `None` when nothing is throttled. Availability waiters sleep this
    /// long before re-checking, so recovery lands on the nearest expiry
    /// rather than the farthest.
    pub fn shortest_remaining(&self) -> Option<Duration> {
        let now = Instant::now();
        self.expiries
            .read()
            .values()
            .filter_map(|until| until.checked_duration_since(now))
            .filter(|d| !d.is_zero())
            .min()
    }

    /// Whether at least one of `names` is clear of throttling.
    pub fn any_clear<'a, I>(&self, names: I) -> bool
    where
        I: IntoIterator<Item = &'a str>,
    {
        let now = Instant::now();
        let map = self.expiries.read();
        names
            .into_iter()
            .any(|name| map.get(name).map_or(true, |until| *until <= now))
    }

    /// Remove entries whose penalty has already expired, returning how many
    /// were dropped.
    pub fn prune_expired(&self) -> usize {
        let now = Instant::now();
        let mut map = self.expiries.write();
        let before = map.len();
        map.retain(|_, until| *until > now);
        before - map.len()
    }

    /// Number of sources with a recorded entry, expired or not.
    pub fn entry_count(&self) -> usize {
        self.expiries.read().len()
    }

    /// Point-in-time view of the throttle counters.
    pub fn stats(&self) -> ThrottleStatsSnapshot {
        ThrottleStatsSnapshot::from(&self.stats)
    }
}

/// Atomic throttle counters, updated on every recorded fault.
#[derive(Debug, Default)]
pub struct ThrottleStats {
    total_events: AtomicU64,
    total_backoff_ms: AtomicU64,
}

impl ThrottleStats {
    fn record_event(&self, retry_after: Duration) {
        self.total_events.fetch_add(1, Ordering::Relaxed);
        self.total_backoff_ms
            .fetch_add(retry_after.as_millis() as u64, Ordering::Relaxed);
    }

    /// Total rate-limit faults recorded.
    pub fn total_events(&self) -> u64 {
        self.total_events.load(Ordering::Relaxed)
    }

    /// Accumulated penalty time across all recorded faults, in milliseconds.
    pub fn total_backoff_ms(&self) -> u64 {
        self.total_backoff_ms.load(Ordering::Relaxed)
    }
}

/// Cloneable snapshot of [`ThrottleStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThrottleStatsSnapshot {
    /// Total rate-limit faults recorded.
    pub total_events: u64,
    /// Accumulated penalty time across all recorded faults, in milliseconds.
    pub total_backoff_ms: u64,
}

impl From<&ThrottleStats> for ThrottleStatsSnapshot {
    fn from(stats: &ThrottleStats) -> Self {
        Self {
            total_events: stats.total_events(),
            total_backoff_ms: stats.total_backoff_ms(),
        }
    }
}
