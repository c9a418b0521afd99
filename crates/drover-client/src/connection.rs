//! Connection abstractions for drover-client
//!
//! Core pieces the pool is built from:
//! - RecordTransport: the wire-level call a connection can make
//! - ConnectionSource: an authenticated credential that seeds connections
//! - Handle: one usable connection, cheap to clone from a seed
//! - CallContext / CallOptions: per-call settings and cancellation

use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::types::{RecordRequest, RecordResponse};

/// Wire-level access to the record service
///
/// Implementations own the actual protocol. The pool never inspects
/// payloads; it only routes requests through handles and classifies the
/// errors that come back.
#[async_trait]
pub trait RecordTransport: Send + Sync {
    /// Execute a record request
    async fn execute(
        &self,
        options: &CallOptions,
        request: &RecordRequest,
    ) -> Result<RecordResponse>;

    /// Cheap liveness probe used by background validation
    async fn ping(&self) -> Result<()>;
}

/// A source of authenticated connections
///
/// Each source wraps one credential and declares how many concurrent calls
/// that credential's quota can sustain. The pool authenticates through a
/// source once, then clones the seeded handle for checkouts.
#[async_trait]
pub trait ConnectionSource: Send + Sync {
    /// Stable name used for throttle bookkeeping and logs
    fn name(&self) -> &str;

    /// Number of concurrent calls this source can sustain
    fn parallelism(&self) -> usize;

    /// Authenticate and produce a seed handle
    async fn seed_handle(&self) -> Result<Handle>;

    /// Drop any cached credential so the next seed re-authenticates
    fn invalidate_seed(&self);
}

/// Authentication state carried by a connection
#[derive(Clone)]
pub struct AuthContext {
    /// Service endpoint the token was issued for
    pub endpoint: String,
    /// Identity the token belongs to
    pub identity: String,
    /// Sticky-session token, when the service handed one out
    pub affinity_token: Option<String>,
    token: String,
    issued_at: Instant,
}

impl AuthContext {
    /// Create an auth context from a freshly issued token
    pub fn new(
        endpoint: impl Into<String>,
        identity: impl Into<String>,
        token: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            identity: identity.into(),
            affinity_token: None,
            token: token.into(),
            issued_at: Instant::now(),
        }
    }

    /// Attach a sticky-session token
    pub fn with_affinity_token(mut self, token: impl Into<String>) -> Self {
        self.affinity_token = Some(token.into());
        self
    }

    /// The bearer token
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Time since the token was issued
    pub fn age(&self) -> Duration {
        self.issued_at.elapsed()
    }
}

impl fmt::Debug for AuthContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Redact the token to keep credentials out of logs.
        f.debug_struct("AuthContext")
            .field("endpoint", &self.endpoint)
            .field("identity", &self.identity)
            .field("affinity_token", &self.affinity_token)
            .field("token", &"***")
            .finish()
    }
}

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// One usable connection to the record service
///
/// A handle pairs an auth context with a transport. New handles come from a
/// source's seed; additional ones are cheap clones of that seed that share
/// the transport.
pub struct Handle {
    id: u64,
    source: String,
    auth: AuthContext,
    transport: Arc<dyn RecordTransport>,
    created_at: Instant,
    last_used: Instant,
}

impl Handle {
    /// Create a handle from a freshly authenticated context
    pub fn new(
        source: impl Into<String>,
        auth: AuthContext,
        transport: Arc<dyn RecordTransport>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            source: source.into(),
            auth,
            transport,
            created_at: now,
            last_used: now,
        }
    }

    /// Clone this handle for a checkout
    ///
    /// The clone gets its own id and fresh lifecycle timestamps but shares
    /// the transport and auth state. With `strip_affinity` the clone drops
    /// any sticky-session token so the service is free to route it anywhere.
    pub fn clone_for_checkout(&self, strip_affinity: bool) -> Self {
        let mut auth = self.auth.clone();
        if strip_affinity {
            auth.affinity_token = None;
        }
        let now = Instant::now();
        Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            source: self.source.clone(),
            auth,
            transport: Arc::clone(&self.transport),
            created_at: now,
            last_used: now,
        }
    }

    /// Unique id of this handle
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Name of the source that seeded this handle
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Auth state carried by this handle
    pub fn auth(&self) -> &AuthContext {
        &self.auth
    }

    /// Time since this handle was created
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time since this handle last executed a request
    pub fn idle_time(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// Mark the handle as just used
    pub fn touch(&mut self) {
        self.last_used = Instant::now();
    }

    /// Execute a request on this handle
    pub async fn execute(
        &mut self,
        options: &CallOptions,
        request: &RecordRequest,
    ) -> Result<RecordResponse> {
        self.last_used = Instant::now();
        self.transport.execute(options, request).await
    }

    /// Probe the transport without counting as a use
    ///
    /// Validation pings must not reset the idle clock, otherwise idle
    /// eviction would never fire.
    pub async fn ping(&self) -> Result<()> {
        self.transport.ping().await
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("age", &self.age())
            .field("idle_time", &self.idle_time())
            .finish()
    }
}

/// Per-call settings supplied by the caller
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    /// Identity to attribute the call to, when the service supports it
    pub caller_id: Option<String>,
    /// Ask the service to skip server-side custom logic for this call
    pub bypass_custom_logic: bool,
    /// Cancels pending waits; already-dispatched calls run to completion
    pub cancellation: CancellationToken,
}

impl CallContext {
    /// Create a context with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Attribute calls to a specific identity
    pub fn with_caller_id(mut self, id: impl Into<String>) -> Self {
        self.caller_id = Some(id.into());
        self
    }

    /// Skip server-side custom logic
    pub fn with_bypass_custom_logic(mut self, bypass: bool) -> Self {
        self.bypass_custom_logic = bypass;
        self
    }

    /// Use an externally owned cancellation token
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }
}

/// Resolved options attached to a single wire call
///
/// Built by the client from the caller's [`CallContext`] plus the affinity
/// state of the handle the call runs on.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Identity to attribute the call to
    pub caller_id: Option<String>,
    /// Skip server-side custom logic
    pub bypass_custom_logic: bool,
    /// Sticky-session token of the executing handle, if kept
    pub affinity_token: Option<String>,
}
