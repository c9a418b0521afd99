//! Source selection strategies for the connection pool.

use drover_core::ThrottleTracker;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// How the pool picks a source when several could serve a checkout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SelectionStrategy {
    /// Cycle through sources in order
    RoundRobin,
    /// Prefer the source with the fewest active checkouts
    LeastConnections,
    /// Prefer sources that are not currently rate limited, cycling among
    /// them; falls back to the source whose throttle expires soonest
    #[default]
    ThrottleAware,
}

/// A source as seen by the selector at checkout time
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    /// Source name, used for throttle lookups
    pub name: &'a str,
    /// Checkouts currently outstanding against this source
    pub active: usize,
}

/// Stateful selector shared by all checkouts of a pool
#[derive(Debug)]
pub struct Selector {
    strategy: SelectionStrategy,
    cursor: AtomicUsize,
}

impl Selector {
    /// Create a selector for the given strategy
    pub fn new(strategy: SelectionStrategy) -> Self {
        Self {
            strategy,
            cursor: AtomicUsize::new(0),
        }
    }

    /// The strategy this selector applies
    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    /// Pick the index of the candidate to check out from
    ///
    /// Returns `None` only when `candidates` is empty. Under
    /// [`SelectionStrategy::ThrottleAware`] a throttled source is chosen
    /// only when every candidate is throttled, and then the one that clears
    /// soonest wins.
    pub fn select(&self, candidates: &[Candidate<'_>], throttle: &ThrottleTracker) -> Option<usize> {
        if candidates.is_empty() {
            return None;
        }

        match self.strategy {
            SelectionStrategy::RoundRobin => Some(self.rotate(candidates.len())),
            SelectionStrategy::LeastConnections => {
                let min_active = candidates.iter().map(|c| c.active).min()?;
                let leanest: Vec<usize> = candidates
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| c.active == min_active)
                    .map(|(idx, _)| idx)
                    .collect();
                Some(leanest[self.rotate(leanest.len())])
            }
            SelectionStrategy::ThrottleAware => {
                let clear: Vec<usize> = candidates
                    .iter()
                    .enumerate()
                    .filter(|(_, c)| !throttle.is_throttled(c.name))
                    .map(|(idx, _)| idx)
                    .collect();
                if !clear.is_empty() {
                    return Some(clear[self.rotate(clear.len())]);
                }
                // everything is throttled; least-bad choice is the source
                // that frees up first
                candidates
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, c)| {
                        throttle.remaining(c.name).unwrap_or(Duration::ZERO)
                    })
                    .map(|(idx, _)| idx)
            }
        }
    }

    fn rotate(&self, len: usize) -> usize {
        self.cursor.fetch_add(1, Ordering::Relaxed) % len
    }
}
