//! Exponential backoff schedules for retry loops.
//!
//! Each row of the retry matrix that sleeps between attempts does so
//! through a [`BackoffPolicy`]: exponential growth from an initial delay up
//! to a ceiling, with ±25% jitter so synchronized retriers fan out.

use std::time::Duration;

/// An exponential backoff schedule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub initial: Duration,
    /// Ceiling no computed delay exceeds.
    pub max: Duration,
    /// Growth factor applied per attempt.
    pub multiplier: f64,
}

impl BackoffPolicy {
    /// Create a schedule from its parts.
    pub const fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            initial,
            max,
            multiplier,
        }
    }

    /// Schedule for pool-exhaustion recovery: 1s doubling up to 32s.
    pub const fn exhaustion() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(32), 2.0)
    }

    /// Schedule for transient backend contention: 500ms doubling up to 2s.
    pub const fn contention() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(2), 2.0)
    }

    /// Jittered delay before retry `attempt` (zero-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        jittered_backoff(attempt, self.initial, self.max, self.multiplier)
    }

    /// Delay without jitter, for callers needing a deterministic schedule.
    pub fn delay_unjittered(&self, attempt: u32) -> Duration {
        let base = self.initial.as_millis() as f64 * self.multiplier.powi(attempt as i32);
        Duration::from_millis(base.min(self.max.as_millis() as f64) as u64)
    }
}

/// Exponential backoff with ±25% jitter.
fn jittered_backoff(
    attempt: u32,
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: f64,
) -> Duration {
    let base_delay = initial_delay.as_millis() as f64 * multiplier.powi(attempt as i32);
    let capped_delay = base_delay.min(max_delay.as_millis() as f64);

    let jitter = (rand_simple() * 0.5 - 0.25) * capped_delay;
    let final_delay = (capped_delay + jitter).max(0.0);

    Duration::from_millis(final_delay as u64)
}

/// Simple random number generator (0.0 - 1.0).
fn rand_simple() -> f64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhaustion_schedule() {
        let policy = BackoffPolicy::exhaustion();
        assert_eq!(policy.delay_unjittered(0), Duration::from_secs(1));
        assert_eq!(policy.delay_unjittered(1), Duration::from_secs(2));
        assert_eq!(policy.delay_unjittered(3), Duration::from_secs(8));
        assert_eq!(policy.delay_unjittered(5), Duration::from_secs(32));
        // capped past the ceiling
        assert_eq!(policy.delay_unjittered(10), Duration::from_secs(32));
    }

    #[test]
    fn test_contention_schedule() {
        let policy = BackoffPolicy::contention();
        assert_eq!(policy.delay_unjittered(0), Duration::from_millis(500));
        assert_eq!(policy.delay_unjittered(1), Duration::from_secs(1));
        assert_eq!(policy.delay_unjittered(2), Duration::from_secs(2));
        assert_eq!(policy.delay_unjittered(6), Duration::from_secs(2));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = BackoffPolicy::exhaustion();
        for attempt in 0..6 {
            let base = policy.delay_unjittered(attempt).as_millis() as f64;
            for _ in 0..20 {
                let jittered = policy.delay(attempt).as_millis() as f64;
                assert!(jittered >= base * 0.74, "attempt {attempt}: {jittered} too low");
                assert!(jittered <= base * 1.26, "attempt {attempt}: {jittered} too high");
            }
        }
    }

    #[test]
    fn test_flat_multiplier() {
        let policy = BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(1), 1.0);
        assert_eq!(policy.delay_unjittered(0), Duration::from_millis(100));
        assert_eq!(policy.delay_unjittered(7), Duration::from_millis(100));
    }
}
