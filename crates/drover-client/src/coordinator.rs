//! Shared parallelism budget for concurrent batch dispatch.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{Error, Result};
use crate::pool::ConnectionPool;

/// Caps how many batches may be in flight at once.
///
/// Sized to pool capacity by default, so dispatch never queues more work
/// than there are connections to serve it. Waiting happens here, before a
/// batch task exists, rather than inside the pool's acquire timeout.
#[derive(Debug, Clone)]
pub struct BatchCoordinator {
    limiter: Arc<Semaphore>,
    slots: usize,
}

impl BatchCoordinator {
    /// Create a coordinator with a fixed number of dispatch slots
    pub fn new(slots: usize) -> Self {
        let slots = slots.max(1);
        Self {
            limiter: Arc::new(Semaphore::new(slots)),
            slots,
        }
    }

    /// Create a coordinator sized to the pool's capacity
    pub fn for_pool(pool: &ConnectionPool) -> Self {
        Self::new(pool.capacity())
    }

    /// Wait for a dispatch slot; the slot frees when the permit drops
    pub async fn checkout(&self) -> Result<OwnedSemaphorePermit> {
        Arc::clone(&self.limiter)
            .acquire_owned()
            .await
            .map_err(|_| Error::Disposed)
    }

    /// Total dispatch slots
    pub fn slots(&self) -> usize {
        self.slots
    }

    /// Slots currently free
    pub fn available(&self) -> usize {
        self.limiter.available_permits()
    }
}
