//! Error types for drover-client
//!
//! Faults are classified for retry handling:
//! - Infrastructure faults (throttle, pool exhaustion) are retried until
//!   cancelled
//! - Bounded faults (authentication, connection, contention) get a fixed
//!   number of attempts
//! - Everything else surfaces to the caller immediately

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Result type for drover-client operations
pub type Result<T> = std::result::Result<T, Error>;

/// Fault classes for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultClass {
    /// Service rate limit (retried indefinitely, absorbed by the pool)
    Throttle,
    /// All pool slots busy (retried indefinitely with backoff)
    PoolExhausted,
    /// Credential or session failure (bounded retries, seed refresh)
    Authentication,
    /// Transport-level failure (bounded retries on a fresh connection)
    Connection,
    /// Server-side write race (bounded retries with short backoff)
    Contention,
    /// Caller-supplied input is invalid (never retried)
    Validation,
    /// Service rejected the payload (never retried as-is)
    Rejection,
    /// Pool or registry has been closed
    Disposed,
    /// Caller cancelled the operation
    Cancelled,
}

impl FaultClass {
    /// Infrastructure faults are transient by definition and retried until
    /// the caller gives up.
    #[inline]
    pub const fn is_infrastructure(self) -> bool {
        matches!(self, Self::Throttle | Self::PoolExhausted)
    }

    /// Faults that get a bounded number of retries before surfacing.
    #[inline]
    pub const fn bounded_retry(self) -> bool {
        matches!(self, Self::Authentication | Self::Connection | Self::Contention)
    }
}

/// Main error type for drover-client
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Service reported a rate limit, optionally with a retry-after hint
    #[error("rate limited by service")]
    Throttled { retry_after: Option<Duration> },

    /// Every candidate source stayed throttled past the configured tolerance
    #[error("all sources throttled after waiting {waited_ms}ms")]
    AllSourcesThrottled { waited_ms: u64 },

    /// No pool slot freed up within the acquire timeout
    #[error("pool exhausted: {message}")]
    PoolExhausted { message: String },

    /// Credential rejected or session expired
    #[error("authentication failed: {message}")]
    Authentication {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Transport failure reaching the service
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Server-side write race (concurrent modification, lock timeout)
    #[error("write contention: {message}")]
    Contention { message: String },

    /// Caller input rejected before any call was made
    #[error("validation error: {message}")]
    Validation { message: String },

    /// Service rejected one or more records in the payload
    #[error("request rejected: {message}")]
    Rejection { message: String },

    /// Pool has been closed
    #[error("pool is closed")]
    Disposed,

    /// Operation was cancelled by the caller
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    /// Get the fault class
    pub fn class(&self) -> FaultClass {
        match self {
            Self::Throttled { .. } => FaultClass::Throttle,
            Self::AllSourcesThrottled { .. } => FaultClass::Throttle,
            Self::PoolExhausted { .. } => FaultClass::PoolExhausted,
            Self::Authentication { .. } => FaultClass::Authentication,
            Self::Connection { .. } => FaultClass::Connection,
            Self::Contention { .. } => FaultClass::Contention,
            Self::Validation { .. } => FaultClass::Validation,
            Self::Rejection { .. } => FaultClass::Rejection,
            Self::Disposed => FaultClass::Disposed,
            Self::Cancelled => FaultClass::Cancelled,
        }
    }

    /// Whether this is a rate-limit fault
    #[inline]
    pub fn is_throttle(&self) -> bool {
        matches!(self, Self::Throttled { .. })
    }

    /// Retry-after hint carried by a throttle fault, if any
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Throttled { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Create a throttle fault
    pub fn throttled(retry_after: Option<Duration>) -> Self {
        Self::Throttled { retry_after }
    }

    /// Create a pool-exhausted fault
    pub fn pool_exhausted(message: impl Into<String>) -> Self {
        Self::PoolExhausted {
            message: message.into(),
        }
    }

    /// Create an authentication fault
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
            source: None,
        }
    }

    /// Create an authentication fault with source
    pub fn authentication_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Authentication {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a connection fault
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection fault with source
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a contention fault
    pub fn contention(message: impl Into<String>) -> Self {
        Self::Contention {
            message: message.into(),
        }
    }

    /// Create a validation error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a rejection fault
    pub fn rejected(message: impl Into<String>) -> Self {
        Self::Rejection {
            message: message.into(),
        }
    }
}

impl fmt::Display for FaultClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Throttle => write!(f, "throttle"),
            Self::PoolExhausted => write!(f, "pool_exhausted"),
            Self::Authentication => write!(f, "authentication"),
            Self::Connection => write!(f, "connection"),
            Self::Contention => write!(f, "contention"),
            Self::Validation => write!(f, "validation"),
            Self::Rejection => write!(f, "rejection"),
            Self::Disposed => write!(f, "disposed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}
