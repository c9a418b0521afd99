//! # drover-client
//!
//! Throttle-aware connection pooling and bulk execution for quota-limited
//! record services.
//!
//! Services that meter both concurrent connections and request rates punish
//! naive pooling twice: capacity sits pinned against throttled backends, and
//! rate-limit faults surface to callers who can do nothing useful with them.
//! This crate pools the other way around: acquisition waits rate limits out
//! before taking capacity, and the bulk engine retries every infrastructure
//! fault class on its own schedule.
//!
//! ## Features
//!
//! - **Throttle-Aware Pooling**: acquisition holds no capacity while a
//!   source is rate limited, and selection steers around throttled sources
//! - **Seed-and-Clone Connections**: one authenticated session per source,
//!   cheaply cloned per checkout instead of re-authenticating
//! - **Bulk Execution**: batch partitioning with a shared parallelism
//!   budget and a per-fault-class retry matrix
//! - **Failure Diagnostics**: rejected records checked for self, same-batch
//!   and missing references, each with a remediation hint
//! - **Progress Reporting**: percent, overall and rolling throughput, and
//!   ETA published to a non-blocking sink
//! - **Pool Registry**: process-wide memoization with single-flight creation
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use drover_client::prelude::*;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! // Pool over every configured source
//! let pool = Arc::new(
//!     ConnectionPool::builder()
//!         .max_pool_size(16)
//!         .acquire_timeout(Duration::from_secs(120))
//!         .build(sources)?,
//! );
//!
//! // Write a collection in batches
//! let executor = BulkExecutor::new(Arc::clone(&pool));
//! let result = executor
//!     .run(
//!         "item",
//!         OperationKind::Create,
//!         records,
//!         &BulkOptions::default(),
//!         Arc::new(NullSink),
//!         &CallContext::new(),
//!     )
//!     .await?;
//!
//! println!("created {} of {}", result.succeeded, result.total);
//! pool.close().await;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod bulk;
pub mod client;
pub mod connection;
pub mod coordinator;
pub mod diagnostics;
pub mod error;
pub mod pool;
pub mod progress;
pub mod registry;
pub mod strategy;
pub mod types;

#[cfg(test)]
mod testkit;

/// Prelude module for convenient imports
pub mod prelude {
    // Error types
    pub use crate::error::{Error, FaultClass, Result};

    // Records and requests
    pub use crate::types::{
        EntityKind, FieldValue, ItemOutcome, OperationKind, Record, RecordRequest,
        RecordResponse, UpsertOutcome,
    };

    // Connection traits and context
    pub use crate::connection::{
        AuthContext, CallContext, CallOptions, ConnectionSource, Handle, RecordTransport,
    };

    // Pool types
    pub use crate::client::PooledClient;
    pub use crate::pool::{
        ConnectionPool, PoolBuilder, PoolConfig, PoolStatsSnapshot,
    };
    pub use crate::strategy::SelectionStrategy;

    // Bulk execution
    pub use crate::bulk::{
        BulkExecutor, BulkOptions, BulkResult, BulkStatsSnapshot, RecordFailure,
    };
    pub use crate::coordinator::BatchCoordinator;
    pub use crate::diagnostics::{analyze_failures, ReferenceIssue, ReferenceIssueKind};

    // Progress reporting
    pub use crate::progress::{NullSink, ProgressSink, ProgressSnapshot, ProgressTracker};

    // Registry
    pub use crate::registry::{PoolKey, PoolRegistry};

    // Service-independent building blocks
    pub use drover_core::{BackoffPolicy, RateWindow, ThrottleTracker};
}

// Re-export commonly used items at crate root
pub use error::{Error, Result};
