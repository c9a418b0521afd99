//! Connection pool for quota-limited record services
//!
//! The pool multiplexes checkouts across one or more authenticated sources:
//! - Capacity equals the summed parallelism of all sources
//! - Acquisition waits out service throttles before taking a slot
//! - Connections are cheap clones of one seed handle per source
//! - A background task evicts stale idle connections and keeps one warm
//!   connection per seeded source
//!
//! # Example
//!
//! ```rust,ignore
//! use drover_client::prelude::*;
//!
//! let pool = ConnectionPool::new(sources, PoolConfig::default())?;
//!
//! let ctx = CallContext::new();
//! let mut client = pool.acquire(&ctx).await?;
//! let response = client.execute(&request, &ctx).await?;
//! client.release();
//! ```

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex as AsyncMutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use drover_core::{ThrottleTracker, DEFAULT_RETRY_AFTER};

use crate::client::PooledClient;
use crate::connection::{CallContext, ConnectionSource, Handle};
use crate::error::{Error, FaultClass, Result};
use crate::strategy::{Candidate, SelectionStrategy, Selector};
use crate::types::{RecordRequest, RecordResponse};

/// Floor for throttle-wait sleeps when no expiry is recorded yet
const MIN_THROTTLE_POLL: Duration = Duration::from_millis(10);

/// Slack added to throttle waits so the re-check lands after expiry
const POLL_GRACE: Duration = Duration::from_millis(5);

// ============================================================================
// Configuration
// ============================================================================

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Pool connection reuse; when false every checkout clones a fresh
    /// handle and releases dispose instead of parking
    pub enabled: bool,
    /// Cap on total concurrent checkouts; 0 means the summed parallelism
    /// of all sources
    pub max_pool_size: usize,
    /// Maximum time to wait for a free slot
    pub acquire_timeout: Duration,
    /// Longest total throttle wait tolerated during acquisition; `None`
    /// waits as long as the service demands
    pub max_retry_after_tolerance: Option<Duration>,
    /// Strip sticky-session tokens from checked-out clones so the service
    /// can route each call independently
    pub disable_session_affinity: bool,
    /// Discard idle connections that aged out before handing them to a
    /// caller
    pub validate_on_checkout: bool,
    /// Extra attempts when seeding a source fails
    pub max_connection_retries: u32,
    /// Idle connections older than this are evicted
    pub max_idle: Duration,
    /// Connections older than this are evicted regardless of use
    pub max_lifetime: Duration,
    /// Run the background validation task
    pub enable_validation: bool,
    /// How often the background validation pass runs
    pub validation_interval: Duration,
    /// Source selection strategy
    pub strategy: SelectionStrategy,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_pool_size: 0,
            acquire_timeout: Duration::from_secs(120),
            max_retry_after_tolerance: None,
            disable_session_affinity: true,
            validate_on_checkout: true,
            max_connection_retries: 2,
            max_idle: Duration::from_secs(300),
            max_lifetime: Duration::from_secs(3600),
            enable_validation: true,
            validation_interval: Duration::from_secs(60),
            strategy: SelectionStrategy::ThrottleAware,
        }
    }
}

impl PoolConfig {
    /// Create a config with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Tuned for large imports: skips checkout staleness checks and keeps
    /// connections parked longer
    pub fn high_throughput() -> Self {
        Self {
            validate_on_checkout: false,
            max_idle: Duration::from_secs(600),
            validation_interval: Duration::from_secs(120),
            ..Default::default()
        }
    }

    /// Tuned for shared environments: bounded throttle waits and more
    /// seeding attempts
    pub fn conservative() -> Self {
        Self {
            max_retry_after_tolerance: Some(Duration::from_secs(300)),
            acquire_timeout: Duration::from_secs(60),
            max_connection_retries: 3,
            ..Default::default()
        }
    }

    /// Enable or disable connection reuse
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the checkout cap (0 = summed source parallelism)
    pub fn with_max_pool_size(mut self, size: usize) -> Self {
        self.max_pool_size = size;
        self
    }

    /// Set the acquire timeout
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    /// Bound total throttle waiting during acquisition
    pub fn with_max_retry_after_tolerance(mut self, tolerance: Option<Duration>) -> Self {
        self.max_retry_after_tolerance = tolerance;
        self
    }

    /// Keep or strip sticky-session tokens on checkout
    pub fn with_disable_session_affinity(mut self, disable: bool) -> Self {
        self.disable_session_affinity = disable;
        self
    }

    /// Enable or disable checkout staleness checks
    pub fn with_validate_on_checkout(mut self, validate: bool) -> Self {
        self.validate_on_checkout = validate;
        self
    }

    /// Set extra seeding attempts
    pub fn with_max_connection_retries(mut self, retries: u32) -> Self {
        self.max_connection_retries = retries;
        self
    }

    /// Set the idle eviction threshold
    pub fn with_max_idle(mut self, max_idle: Duration) -> Self {
        self.max_idle = max_idle;
        self
    }

    /// Set the lifetime eviction threshold
    pub fn with_max_lifetime(mut self, max_lifetime: Duration) -> Self {
        self.max_lifetime = max_lifetime;
        self
    }

    /// Enable or disable the background validation task
    pub fn with_enable_validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Set the background validation cadence
    pub fn with_validation_interval(mut self, interval: Duration) -> Self {
        self.validation_interval = interval;
        self
    }

    /// Set the source selection strategy
    pub fn with_strategy(mut self, strategy: SelectionStrategy) -> Self {
        self.strategy = strategy;
        self
    }
}

/// Pool builder for fluent configuration
pub struct PoolBuilder {
    config: PoolConfig,
}

impl PoolBuilder {
    /// Create a new pool builder
    pub fn new() -> Self {
        Self {
            config: PoolConfig::default(),
        }
    }

    /// Cap total concurrent checkouts
    pub fn max_pool_size(mut self, size: usize) -> Self {
        self.config.max_pool_size = size;
        self
    }

    /// Set the acquire timeout
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.config.acquire_timeout = timeout;
        self
    }

    /// Bound total throttle waiting during acquisition
    pub fn max_retry_after_tolerance(mut self, tolerance: Duration) -> Self {
        self.config.max_retry_after_tolerance = Some(tolerance);
        self
    }

    /// Set the source selection strategy
    pub fn strategy(mut self, strategy: SelectionStrategy) -> Self {
        self.config.strategy = strategy;
        self
    }

    /// Set the idle eviction threshold
    pub fn max_idle(mut self, max_idle: Duration) -> Self {
        self.config.max_idle = max_idle;
        self
    }

    /// Set the lifetime eviction threshold
    pub fn max_lifetime(mut self, max_lifetime: Duration) -> Self {
        self.config.max_lifetime = max_lifetime;
        self
    }

    /// Get the configuration
    pub fn config(self) -> PoolConfig {
        self.config
    }

    /// Build a pool over the given sources
    pub fn build(self, sources: Vec<Arc<dyn ConnectionSource>>) -> Result<ConnectionPool> {
        ConnectionPool::new(sources, self.config)
    }
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Point-in-time pool statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStatsSnapshot {
    /// Total checkout slots
    pub capacity: usize,
    /// Checkouts currently outstanding
    pub active: usize,
    /// Connections parked in idle queues
    pub idle: usize,
    /// Outstanding checkouts per source
    pub per_source_active: HashMap<String, usize>,
    /// Seed authentications performed
    pub seeds_created: u64,
    /// Handles cloned from seeds
    pub clones_created: u64,
    /// Successful acquisitions
    pub acquired: u64,
    /// Releases (explicit or via drop)
    pub released: u64,
    /// Connections evicted as stale or invalid
    pub evicted: u64,
    /// Connections disposed on release or shutdown
    pub closed: u64,
    /// Acquisitions that timed out waiting for a slot
    pub exhausted: u64,
    /// Background validation passes completed
    pub validation_runs: u64,
    /// Summed acquisition wait time
    pub total_acquire_wait_ms: u64,
    /// Throttle signals recorded against any source
    pub throttle_events: u64,
    /// Summed retry-after time across throttle signals
    pub total_throttle_backoff_ms: u64,
}

impl PoolStatsSnapshot {
    /// Average wait per successful acquisition in milliseconds
    pub fn avg_acquire_wait_ms(&self) -> f64 {
        if self.acquired == 0 {
            0.0
        } else {
            self.total_acquire_wait_ms as f64 / self.acquired as f64
        }
    }
}

/// Atomic counters updated on the checkout hot path
#[derive(Debug, Default)]
struct AtomicPoolStats {
    seeds_created: AtomicU64,
    clones_created: AtomicU64,
    acquired: AtomicU64,
    released: AtomicU64,
    evicted: AtomicU64,
    closed: AtomicU64,
    exhausted: AtomicU64,
    validation_runs: AtomicU64,
    total_acquire_wait_ms: AtomicU64,
}

impl AtomicPoolStats {
    fn record_seeded(&self) {
        self.seeds_created.fetch_add(1, Ordering::Relaxed);
    }

    fn record_cloned(&self) {
        self.clones_created.fetch_add(1, Ordering::Relaxed);
    }

    fn record_acquired(&self, wait_ms: u64) {
        self.acquired.fetch_add(1, Ordering::Relaxed);
        self.total_acquire_wait_ms
            .fetch_add(wait_ms, Ordering::Relaxed);
    }

    fn record_released(&self) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }

    fn record_evicted(&self) {
        self.evicted.fetch_add(1, Ordering::Relaxed);
    }

    fn record_evicted_many(&self, count: u64) {
        self.evicted.fetch_add(count, Ordering::Relaxed);
    }

    fn record_closed(&self) {
        self.closed.fetch_add(1, Ordering::Relaxed);
    }

    fn record_exhausted(&self) {
        self.exhausted.fetch_add(1, Ordering::Relaxed);
    }

    fn record_validation_run(&self) {
        self.validation_runs.fetch_add(1, Ordering::Relaxed);
    }
}

// ============================================================================
// Pool internals
// ============================================================================

/// Per-source state: the seed, parked clones, and the active count
struct SourceState {
    source: Arc<dyn ConnectionSource>,
    parallelism: usize,
    /// Seed handle; async mutex because refreshing it awaits authentication
    seed: AsyncMutex<Option<Handle>>,
    /// Parked clones, LIFO so recently used connections go out first
    idle: Mutex<Vec<Handle>>,
    active: AtomicUsize,
}

/// State shared between the pool, its checkouts, and the validation task
pub(crate) struct PoolShared {
    config: PoolConfig,
    sources: Vec<SourceState>,
    by_name: HashMap<String, usize>,
    admission: Arc<Semaphore>,
    capacity: usize,
    selector: Selector,
    throttle: Arc<ThrottleTracker>,
    stats: AtomicPoolStats,
    disposed: AtomicBool,
}

impl PoolShared {
    /// Indices of sources eligible for this checkout. An exclusion that
    /// would leave no candidates is ignored.
    fn candidate_indices(&self, exclude: Option<&str>) -> Vec<usize> {
        let all: Vec<usize> = (0..self.sources.len()).collect();
        if let Some(name) = exclude {
            let filtered: Vec<usize> = all
                .iter()
                .copied()
                .filter(|&idx| self.sources[idx].source.name() != name)
                .collect();
            if !filtered.is_empty() {
                return filtered;
            }
        }
        all
    }

    /// Phase one of acquisition: wait until at least one candidate source
    /// is clear of throttles. No pool slot is held during this wait, so
    /// throttled callers never starve the pool.
    async fn wait_for_clear_source(
        &self,
        exclude: Option<&str>,
        ctx: &CallContext,
        start: Instant,
    ) -> Result<()> {
        loop {
            if self.disposed.load(Ordering::Acquire) {
                return Err(Error::Disposed);
            }

            let indices = self.candidate_indices(exclude);
            let clear = self
                .throttle
                .any_clear(indices.iter().map(|&idx| self.sources[idx].source.name()));
            if clear {
                return Ok(());
            }

            let mut wait = self
                .throttle
                .shortest_remaining()
                .unwrap_or(MIN_THROTTLE_POLL)
                + POLL_GRACE;

            if let Some(tolerance) = self.config.max_retry_after_tolerance {
                let waited = start.elapsed();
                if waited >= tolerance {
                    return Err(Error::AllSourcesThrottled {
                        waited_ms: waited.as_millis() as u64,
                    });
                }
                wait = wait.min(tolerance - waited);
            }

            debug!(wait_ms = wait.as_millis() as u64, "All sources throttled; waiting");
            tokio::select! {
                _ = ctx.cancellation.cancelled() => return Err(Error::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// Phase two of acquisition: take a slot or time out.
    async fn admit(&self, ctx: &CallContext) -> Result<OwnedSemaphorePermit> {
        tokio::select! {
            _ = ctx.cancellation.cancelled() => Err(Error::Cancelled),
            acquired = tokio::time::timeout(
                self.config.acquire_timeout,
                Arc::clone(&self.admission).acquire_owned(),
            ) => match acquired {
                Ok(Ok(permit)) => Ok(permit),
                Ok(Err(_)) => Err(Error::Disposed),
                Err(_) => {
                    self.stats.record_exhausted();
                    Err(Error::pool_exhausted(format!(
                        "no slot freed within {}ms",
                        self.config.acquire_timeout.as_millis()
                    )))
                }
            },
        }
    }

    /// Pick a source for the admitted checkout.
    fn select_source(&self, exclude: Option<&str>) -> Result<usize> {
        let indices = self.candidate_indices(exclude);
        let candidates: Vec<Candidate<'_>> = indices
            .iter()
            .map(|&idx| {
                let state = &self.sources[idx];
                Candidate {
                    name: state.source.name(),
                    active: state.active.load(Ordering::Relaxed),
                }
            })
            .collect();

        let pick = self
            .selector
            .select(&candidates, &self.throttle)
            .ok_or_else(|| Error::validation("pool has no sources"))?;
        Ok(indices[pick])
    }

    fn is_stale(&self, handle: &Handle) -> bool {
        handle.age() > self.config.max_lifetime || handle.idle_time() > self.config.max_idle
    }

    /// Produce a handle for the checkout: reuse a parked clone when the
    /// pool is enabled, otherwise clone straight from the seed.
    async fn checkout_handle(&self, idx: usize) -> Result<Handle> {
        let state = &self.sources[idx];

        if self.config.enabled {
            loop {
                let parked = state.idle.lock().pop();
                let Some(handle) = parked else { break };

                if self.config.validate_on_checkout && self.is_stale(&handle) {
                    self.stats.record_evicted();
                    debug!(
                        source = state.source.name(),
                        id = handle.id(),
                        "Discarding stale idle connection"
                    );
                    continue;
                }

                state.active.fetch_add(1, Ordering::Relaxed);
                return Ok(handle);
            }
        }

        let handle = self.clone_from_seed(state).await?;
        state.active.fetch_add(1, Ordering::Relaxed);
        Ok(handle)
    }

    /// Clone a checkout handle from the source's seed, authenticating the
    /// seed first if the source has never been used (or was invalidated).
    async fn clone_from_seed(&self, state: &SourceState) -> Result<Handle> {
        let mut seed = state.seed.lock().await;
        let seeded = match seed.take() {
            Some(handle) => handle,
            None => self.authenticate(state).await?,
        };
        let clone = seeded.clone_for_checkout(self.config.disable_session_affinity);
        *seed = Some(seeded);
        self.stats.record_cloned();
        Ok(clone)
    }

    /// Authenticate a source, retrying per `max_connection_retries`.
    async fn authenticate(&self, state: &SourceState) -> Result<Handle> {
        let mut last_err = Error::authentication("no seed attempt was made");
        for attempt in 0..=self.config.max_connection_retries {
            match state.source.seed_handle().await {
                Ok(handle) => {
                    self.stats.record_seeded();
                    if attempt > 0 {
                        debug!(
                            source = state.source.name(),
                            attempt, "Seed authentication recovered"
                        );
                    }
                    return Ok(handle);
                }
                Err(e) => {
                    warn!(
                        source = state.source.name(),
                        attempt,
                        error = %e,
                        "Seed authentication failed"
                    );
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    /// Return a checkout to the pool. Runs synchronously so the client's
    /// Drop can call it without spawning.
    pub(crate) fn return_handle(
        &self,
        mut handle: Handle,
        invalid: Option<String>,
        permit: OwnedSemaphorePermit,
    ) {
        if let Some(&idx) = self.by_name.get(handle.source()) {
            let state = &self.sources[idx];
            state.active.fetch_sub(1, Ordering::Relaxed);

            if let Some(reason) = invalid {
                self.stats.record_evicted();
                debug!(
                    source = handle.source(),
                    id = handle.id(),
                    reason = %reason,
                    "Dropping invalidated connection"
                );
            } else if self.disposed.load(Ordering::Acquire) || !self.config.enabled {
                self.stats.record_closed();
            } else {
                handle.touch();
                state.idle.lock().push(handle);
            }
        }
        self.stats.record_released();
        // releasing the permit last means an admitted waiter can find the
        // handle we just parked
        drop(permit);
    }

    /// Record a throttle signal against a source.
    pub(crate) fn note_throttle(&self, source: &str, retry_after: Option<Duration>) {
        self.throttle
            .record_throttle(source, retry_after.unwrap_or(DEFAULT_RETRY_AFTER));
    }

    pub(crate) fn is_source_throttled(&self, source: &str) -> bool {
        self.throttle.is_throttled(source)
    }

    /// One background validation pass: evict stale or dead idle
    /// connections, keep one warm connection per seeded source, and prune
    /// expired throttle entries.
    async fn run_validation_pass(&self) {
        self.stats.record_validation_run();

        for state in &self.sources {
            let mut kept: Vec<Handle> = Vec::new();
            loop {
                // pop one at a time; the idle lock must not be held across
                // the ping await
                let parked = state.idle.lock().pop();
                let Some(handle) = parked else { break };

                if handle.age() > self.config.max_lifetime {
                    self.stats.record_evicted();
                    debug!(
                        source = state.source.name(),
                        id = handle.id(),
                        "Retiring connection past max lifetime"
                    );
                    continue;
                }
                if handle.idle_time() > self.config.max_idle {
                    self.stats.record_evicted();
                    debug!(
                        source = state.source.name(),
                        id = handle.id(),
                        "Retiring connection idle too long"
                    );
                    continue;
                }
                if let Err(e) = handle.ping().await {
                    self.stats.record_evicted();
                    warn!(
                        source = state.source.name(),
                        id = handle.id(),
                        error = %e,
                        "Connection failed validation ping"
                    );
                    continue;
                }
                kept.push(handle);
            }

            // Warm floor: a source that has authenticated before keeps one
            // parked connection. Never triggers a first authentication.
            if kept.is_empty() {
                let seed = state.seed.lock().await;
                if let Some(seeded) = seed.as_ref() {
                    kept.push(seeded.clone_for_checkout(self.config.disable_session_affinity));
                    self.stats.record_cloned();
                }
            }

            state.idle.lock().extend(kept);
        }

        let pruned = self.throttle.prune_expired();
        if pruned > 0 {
            debug!(pruned, "Dropped expired throttle entries");
        }
    }
}

fn spawn_validation(
    shared: Arc<PoolShared>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(shared.config.validation_interval) => {
                    shared.run_validation_pass().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

// ============================================================================
// ConnectionPool
// ============================================================================

/// A connection pool over one or more quota-limited sources.
///
/// Acquisition runs in two phases. Phase one waits until at least one
/// source is clear of service throttles, holding no pool capacity. Phase
/// two takes a slot from the shared semaphore, bounded by the acquire
/// timeout. Only then is a source selected and a handle checked out, so a
/// caller stuck behind a throttle never blocks callers of other sources.
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
    shutdown_tx: watch::Sender<bool>,
    validation_task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionPool {
    /// Create a pool over the given sources.
    ///
    /// No source is authenticated here; the first checkout against a
    /// source triggers its seed authentication. Must be called from within
    /// a Tokio runtime when the pool is enabled, because the validation
    /// task is spawned immediately.
    pub fn new(sources: Vec<Arc<dyn ConnectionSource>>, config: PoolConfig) -> Result<Self> {
        if sources.is_empty() {
            return Err(Error::validation("at least one connection source is required"));
        }

        let mut by_name = HashMap::with_capacity(sources.len());
        let mut states = Vec::with_capacity(sources.len());
        let mut summed = 0usize;
        for source in sources {
            let name = source.name().to_string();
            let parallelism = source.parallelism();
            if parallelism == 0 {
                return Err(Error::validation(format!(
                    "source {name} declares zero parallelism"
                )));
            }
            if by_name.insert(name.clone(), states.len()).is_some() {
                return Err(Error::validation(format!("duplicate source name: {name}")));
            }
            summed += parallelism;
            states.push(SourceState {
                source,
                parallelism,
                seed: AsyncMutex::new(None),
                idle: Mutex::new(Vec::new()),
                active: AtomicUsize::new(0),
            });
        }

        let capacity = if config.max_pool_size > 0 {
            config.max_pool_size.min(summed)
        } else {
            summed
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = Arc::new(PoolShared {
            selector: Selector::new(config.strategy),
            admission: Arc::new(Semaphore::new(capacity)),
            capacity,
            config,
            sources: states,
            by_name,
            throttle: Arc::new(ThrottleTracker::new()),
            stats: AtomicPoolStats::default(),
            disposed: AtomicBool::new(false),
        });

        let validation_task = if shared.config.enabled && shared.config.enable_validation {
            Some(spawn_validation(Arc::clone(&shared), shutdown_rx))
        } else {
            None
        };

        info!(
            capacity,
            sources = shared.sources.len(),
            "Connection pool ready"
        );

        Ok(Self {
            shared,
            shutdown_tx,
            validation_task: Mutex::new(validation_task),
        })
    }

    /// Create a builder for fluent configuration
    pub fn builder() -> PoolBuilder {
        PoolBuilder::new()
    }

    /// Acquire a client from the pool
    pub async fn acquire(&self, ctx: &CallContext) -> Result<PooledClient> {
        self.acquire_excluding(None, ctx).await
    }

    /// Acquire a client, avoiding the named source when another candidate
    /// exists
    pub async fn acquire_excluding(
        &self,
        exclude: Option<&str>,
        ctx: &CallContext,
    ) -> Result<PooledClient> {
        self.ensure_open()?;
        let start = Instant::now();
        let shared = &self.shared;

        shared.wait_for_clear_source(exclude, ctx, start).await?;
        let permit = shared.admit(ctx).await?;

        // A throttle can land between the phases; selection then falls
        // back to the nearest-expiry source rather than looping back.
        let idx = shared.select_source(exclude)?;
        match shared.checkout_handle(idx).await {
            Ok(handle) => {
                shared
                    .stats
                    .record_acquired(start.elapsed().as_millis() as u64);
                Ok(PooledClient::new(handle, permit, Arc::clone(shared)))
            }
            Err(e) => {
                drop(permit);
                Err(e)
            }
        }
    }

    /// Execute a request, transparently retrying through service throttles.
    ///
    /// A throttle response is recorded against the executing source and the
    /// call is retried on the next acquisition, which waits the throttle
    /// out first. Rate-limit faults therefore never surface from here
    /// unless a retry-after tolerance is configured and exceeded. All other
    /// faults propagate after a single attempt.
    pub async fn execute_with_retry(
        &self,
        request: &RecordRequest,
        ctx: &CallContext,
    ) -> Result<RecordResponse> {
        loop {
            if ctx.cancellation.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let mut client = self.acquire(ctx).await?;
            match client.execute(request, ctx).await {
                Ok(response) => {
                    client.release();
                    return Ok(response);
                }
                Err(e) if e.is_throttle() => {
                    debug!(kind = request.kind_name(), "Call throttled; re-acquiring");
                    client.release();
                }
                Err(e) => {
                    if e.class() == FaultClass::Connection {
                        client.mark_invalid(e.to_string());
                    }
                    client.release();
                    return Err(e);
                }
            }
        }
    }

    /// Drop a source's cached credential and every idle clone built on it.
    ///
    /// The next checkout against the source re-authenticates from scratch.
    pub async fn invalidate_seed(&self, source: &str) -> Result<()> {
        let shared = &self.shared;
        let idx = shared
            .by_name
            .get(source)
            .copied()
            .ok_or_else(|| Error::validation(format!("unknown source: {source}")))?;
        let state = &shared.sources[idx];

        state.source.invalidate_seed();
        {
            let mut seed = state.seed.lock().await;
            *seed = None;
        }
        // idle clones share the dead credential and go down with it
        let drained = {
            let mut idle = state.idle.lock();
            let count = idle.len();
            idle.clear();
            count
        };
        shared.stats.record_evicted_many(drained as u64);

        info!(source, evicted = drained, "Seed invalidated");
        Ok(())
    }

    /// Eagerly authenticate every source and park one connection each.
    ///
    /// Returns the number of connections parked. When reuse is disabled
    /// only the seeds are cached and the count stays zero. Optional;
    /// without it the first checkout pays the authentication cost.
    pub async fn warm_up(&self) -> Result<usize> {
        self.ensure_open()?;
        let mut created = 0;
        for state in &self.shared.sources {
            if !self.shared.config.enabled {
                let mut seed = state.seed.lock().await;
                if seed.is_none() {
                    *seed = Some(self.shared.authenticate(state).await?);
                }
                continue;
            }
            if !state.idle.lock().is_empty() {
                continue;
            }
            let handle = self.shared.clone_from_seed(state).await?;
            state.idle.lock().push(handle);
            created += 1;
        }
        Ok(created)
    }

    /// Close the pool: stop validation, wake pending waiters with
    /// [`Error::Disposed`], and drop parked connections. Idempotent.
    pub async fn close(&self) {
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let _ = self.shutdown_tx.send(true);
        let task = self.validation_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }

        self.shared.admission.close();

        let mut dropped = 0usize;
        for state in &self.shared.sources {
            dropped += {
                let mut idle = state.idle.lock();
                let count = idle.len();
                idle.clear();
                count
            };
            let mut seed = state.seed.lock().await;
            *seed = None;
        }
        for _ in 0..dropped {
            self.shared.stats.record_closed();
        }

        info!(dropped, "Connection pool closed");
    }

    /// Total checkout slots
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Whether the pool has been closed
    pub fn is_closed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }

    /// Throttle state shared by acquisition and selection
    pub fn throttle(&self) -> &ThrottleTracker {
        &self.shared.throttle
    }

    /// Pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Point-in-time statistics
    pub fn stats(&self) -> PoolStatsSnapshot {
        let shared = &self.shared;
        let mut per_source_active = HashMap::with_capacity(shared.sources.len());
        let mut active = 0;
        let mut idle = 0;
        for state in &shared.sources {
            let source_active = state.active.load(Ordering::Relaxed);
            active += source_active;
            idle += state.idle.lock().len();
            per_source_active.insert(state.source.name().to_string(), source_active);
        }

        let throttle = shared.throttle.stats();
        let stats = &shared.stats;
        PoolStatsSnapshot {
            capacity: shared.capacity,
            active,
            idle,
            per_source_active,
            seeds_created: stats.seeds_created.load(Ordering::Relaxed),
            clones_created: stats.clones_created.load(Ordering::Relaxed),
            acquired: stats.acquired.load(Ordering::Relaxed),
            released: stats.released.load(Ordering::Relaxed),
            evicted: stats.evicted.load(Ordering::Relaxed),
            closed: stats.closed.load(Ordering::Relaxed),
            exhausted: stats.exhausted.load(Ordering::Relaxed),
            validation_runs: stats.validation_runs.load(Ordering::Relaxed),
            total_acquire_wait_ms: stats.total_acquire_wait_ms.load(Ordering::Relaxed),
            throttle_events: throttle.total_events,
            total_throttle_backoff_ms: throttle.total_backoff_ms,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shared.disposed.load(Ordering::Acquire) {
            Err(Error::Disposed)
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("capacity", &self.shared.capacity)
            .field("sources", &self.shared.sources.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
