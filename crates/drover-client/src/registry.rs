//! Process-wide pool registry
//!
//! Pools are expensive to spin up (every source authenticates) and costly
//! to duplicate (each duplicate competes for the same service quota), so
//! callers that cannot thread a pool through their call graph memoize one
//! per endpoint-and-source-set key here. Creation is single-flight: under a
//! burst of first requests for the same key, one caller builds while the
//! rest wait for its result.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::error::Result;
use crate::pool::ConnectionPool;

/// Identity of a pool: the endpoint plus the set of sources behind it
///
/// Source order does not matter; the constructor sorts and dedupes so two
/// keys built from the same set in different orders compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    endpoint: String,
    sources: Vec<String>,
}

impl PoolKey {
    /// Build a key from an endpoint and its source names
    pub fn new(
        endpoint: impl Into<String>,
        sources: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        let mut sources: Vec<String> = sources.into_iter().map(Into::into).collect();
        sources.sort();
        sources.dedup();
        Self {
            endpoint: endpoint.into(),
            sources,
        }
    }

    /// The service endpoint
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// The normalized source names
    pub fn sources(&self) -> &[String] {
        &self.sources
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.endpoint, self.sources.join(","))
    }
}

/// Memoizing registry of [`ConnectionPool`]s keyed by [`PoolKey`]
#[derive(Default)]
pub struct PoolRegistry {
    pools: DashMap<PoolKey, Arc<OnceCell<Arc<ConnectionPool>>>>,
}

impl PoolRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the pool for `key`, building it with `init` on first use.
    ///
    /// Concurrent first callers share one build: a single `init` runs and
    /// everyone gets the same pool. A failed build is returned to its
    /// caller and forgotten, so the next caller starts over; a caller that
    /// gives up mid-build only abandons its own wait.
    pub async fn get_or_create<F, Fut>(&self, key: &PoolKey, init: F) -> Result<Arc<ConnectionPool>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ConnectionPool>>,
    {
        // the map guard must drop before the init future runs
        let cell = self.pools.entry(key.clone()).or_default().clone();

        let result = cell
            .get_or_try_init(|| async {
                info!(key = %key, "Building pool");
                init().await.map(Arc::new)
            })
            .await
            .cloned();

        if result.is_err() {
            // drop the empty cell so a later request starts fresh; a cell
            // another waiter managed to fill in the meantime stays
            self.pools.remove_if(key, |_, cell| cell.get().is_none());
            debug!(key = %key, "Pool build failed; entry dropped");
        }
        result
    }

    /// The pool for `key`, when one has been built
    pub fn get(&self, key: &PoolKey) -> Option<Arc<ConnectionPool>> {
        self.pools.get(key).and_then(|cell| cell.get().cloned())
    }

    /// Whether a built pool exists for `key`
    pub fn contains(&self, key: &PoolKey) -> bool {
        self.get(key).is_some()
    }

    /// Number of registered keys, built or still building
    pub fn len(&self) -> usize {
        self.pools.len()
    }

    /// Whether the registry holds no keys
    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }

    /// Drop `key` from the registry, returning its pool when one was built.
    ///
    /// The pool itself is not closed; callers still holding it keep
    /// working, and closing is up to whoever takes the return value.
    pub fn remove(&self, key: &PoolKey) -> Option<Arc<ConnectionPool>> {
        self.pools
            .remove(key)
            .and_then(|(_, cell)| cell.get().cloned())
    }

    /// Close every built pool and clear the registry
    pub async fn close_all(&self) {
        let cells: Vec<_> = self
            .pools
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.pools.clear();

        let mut closed = 0usize;
        for cell in cells {
            if let Some(pool) = cell.get() {
                pool.close().await;
                closed += 1;
            }
        }
        info!(closed, "Registry closed");
    }
}

impl fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("keys", &self.pools.len())
            .finish()
    }
}
