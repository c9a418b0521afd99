//! A checked-out pool client
//!
//! [`PooledClient`] wraps one connection handle plus the pool slot it
//! occupies. Dropping the client returns both; a client marked invalid is
//! evicted instead of parked. Throttle responses observed here are recorded
//! against the executing source so the next acquisition waits them out.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OwnedSemaphorePermit;
use tracing::debug;

use crate::connection::{CallContext, CallOptions, Handle};
use crate::error::{Error, Result};
use crate::pool::PoolShared;
use crate::types::{RecordRequest, RecordResponse};

/// A connection checked out of a [`crate::pool::ConnectionPool`]
pub struct PooledClient {
    handle: Option<Handle>,
    permit: Option<OwnedSemaphorePermit>,
    shared: Arc<PoolShared>,
    id: u64,
    source: String,
    invalid: Option<String>,
}

impl PooledClient {
    pub(crate) fn new(
        handle: Handle,
        permit: OwnedSemaphorePermit,
        shared: Arc<PoolShared>,
    ) -> Self {
        let id = handle.id();
        let source = handle.source().to_string();
        Self {
            handle: Some(handle),
            permit: Some(permit),
            shared,
            id,
            source,
            invalid: None,
        }
    }

    /// Execute a request on this connection.
    ///
    /// A throttle fault is recorded against this client's source before it
    /// propagates, which is what lets the pool's acquisition phase wait the
    /// throttle out for every later caller.
    pub async fn execute(
        &mut self,
        request: &RecordRequest,
        ctx: &CallContext,
    ) -> Result<RecordResponse> {
        if let Some(reason) = &self.invalid {
            return Err(Error::connection(format!(
                "connection marked invalid: {reason}"
            )));
        }
        let Some(handle) = self.handle.as_mut() else {
            return Err(Error::Disposed);
        };

        let options = CallOptions {
            caller_id: ctx.caller_id.clone(),
            bypass_custom_logic: ctx.bypass_custom_logic,
            affinity_token: handle.auth().affinity_token.clone(),
        };

        match handle.execute(&options, request).await {
            Ok(response) => Ok(response),
            Err(e) => {
                if let Error::Throttled { retry_after } = &e {
                    self.shared.note_throttle(&self.source, *retry_after);
                    debug!(
                        source = %self.source,
                        retry_after_ms = retry_after.map(|d| d.as_millis() as u64),
                        "Source throttled"
                    );
                }
                Err(e)
            }
        }
    }

    /// Mark this connection as broken; it will be evicted on release
    /// instead of returned to the idle queue. The first reason sticks.
    pub fn mark_invalid(&mut self, reason: impl Into<String>) {
        if self.invalid.is_none() {
            self.invalid = Some(reason.into());
        }
    }

    /// Return the connection and slot to the pool.
    ///
    /// Dropping the client does the same; calling this merely makes the
    /// hand-back explicit at the call site.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let (Some(handle), Some(permit)) = (self.handle.take(), self.permit.take()) {
            self.shared
                .return_handle(handle, self.invalid.take(), permit);
        }
    }

    /// Id of the underlying connection handle
    pub fn connection_id(&self) -> u64 {
        self.id
    }

    /// Name of the source this connection came from
    pub fn source_name(&self) -> &str {
        &self.source
    }

    /// Whether this client's source is currently throttled
    pub fn source_throttled(&self) -> bool {
        self.shared.is_source_throttled(&self.source)
    }

    /// Whether the connection has been marked invalid
    pub fn is_invalid(&self) -> bool {
        self.invalid.is_some()
    }

    /// Why the connection was marked invalid, if it was
    pub fn invalid_reason(&self) -> Option<&str> {
        self.invalid.as_deref()
    }

    /// Age of the underlying connection
    pub fn age(&self) -> Duration {
        self.handle.as_ref().map(Handle::age).unwrap_or_default()
    }

    /// Idle time of the underlying connection before this checkout
    pub fn idle_time(&self) -> Duration {
        self.handle
            .as_ref()
            .map(Handle::idle_time)
            .unwrap_or_default()
    }
}

impl Drop for PooledClient {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl std::fmt::Debug for PooledClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledClient")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("invalid", &self.invalid)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ConnectionPool;
    use crate::testkit::{quick_config, FakeSource};
    use crate::types::Record;
    use crate::connection::ConnectionSource;

    fn pool_with(source: &Arc<FakeSource>) -> ConnectionPool {
        ConnectionPool::new(
            vec![Arc::clone(source) as Arc<dyn ConnectionSource>],
            quick_config(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_execute_routes_through_transport() {
        let source = FakeSource::new("a", 1);
        let pool = pool_with(&source);
        let ctx = CallContext::new().with_caller_id("import-job");

        let mut client = pool.acquire(&ctx).await.unwrap();
        assert_eq!(client.source_name(), "a");

        let request = RecordRequest::CreateMultiple {
            entity: "item".into(),
            records: vec![Record::new().set("name", "one")],
        };
        let response = client.execute(&request, &ctx).await.unwrap();
        assert!(matches!(response, RecordResponse::Created { ids } if ids.len() == 1));

        let options = source.transport().last_options().unwrap();
        assert_eq!(options.caller_id.as_deref(), Some("import-job"));
        client.release();
    }

    #[tokio::test]
    async fn test_affinity_token_stripped_by_default() {
        let source = FakeSource::new("a", 1);
        source.set_seed_affinity("sticky-route");
        let pool = pool_with(&source);
        let ctx = CallContext::new();

        let mut client = pool.acquire(&ctx).await.unwrap();
        client.execute(&RecordRequest::Ping, &ctx).await.unwrap();

        let options = source.transport().last_options().unwrap();
        assert_eq!(options.affinity_token, None);
        client.release();
    }

    #[tokio::test]
    async fn test_affinity_token_kept_when_enabled() {
        let source = FakeSource::new("a", 1);
        source.set_seed_affinity("sticky-route");
        let pool = ConnectionPool::new(
            vec![Arc::clone(&source) as Arc<dyn ConnectionSource>],
            quick_config().with_disable_session_affinity(false),
        )
        .unwrap();
        let ctx = CallContext::new();

        let mut client = pool.acquire(&ctx).await.unwrap();
        client.execute(&RecordRequest::Ping, &ctx).await.unwrap();

        let options = source.transport().last_options().unwrap();
        assert_eq!(options.affinity_token.as_deref(), Some("sticky-route"));
        client.release();
    }

    #[tokio::test]
    async fn test_throttle_recorded_against_source() {
        let source = FakeSource::new("a", 1);
        source
            .transport()
            .push_fault(Error::throttled(Some(Duration::from_secs(5))));
        let pool = pool_with(&source);
        let ctx = CallContext::new();

        let mut client = pool.acquire(&ctx).await.unwrap();
        let err = client.execute(&RecordRequest::Ping, &ctx).await.unwrap_err();
        assert!(err.is_throttle());
        assert!(client.source_throttled());
        assert!(pool.throttle().is_throttled("a"));

        let remaining = pool.throttle().remaining("a").unwrap();
        assert!(remaining <= Duration::from_secs(5));
        client.release();
    }

    #[tokio::test]
    async fn test_invalid_client_refuses_calls() {
        let source = FakeSource::new("a", 1);
        let pool = pool_with(&source);
        let ctx = CallContext::new();

        let mut client = pool.acquire(&ctx).await.unwrap();
        client.mark_invalid("socket reset");
        client.mark_invalid("second reason ignored");

        assert!(client.is_invalid());
        assert_eq!(client.invalid_reason(), Some("socket reset"));

        let err = client.execute(&RecordRequest::Ping, &ctx).await.unwrap_err();
        assert!(matches!(err, Error::Connection { .. }));
        assert_eq!(source.transport().calls(), 0);
        client.release();
    }
}
