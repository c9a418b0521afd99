//! # drover-core
//!
//! Service-independent building blocks shared across the Drover workspace:
//! throttle bookkeeping, retry backoff schedules, and rolling-window rate
//! measurement. Nothing in this crate performs I/O; the client crate wires
//! these pieces into pools and bulk executors.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod backoff;
pub mod rate;
pub mod throttle;

pub use backoff::BackoffPolicy;
pub use rate::RateWindow;
pub use throttle::{ThrottleStatsSnapshot, ThrottleTracker, DEFAULT_RETRY_AFTER};
