//! End-to-end bulk execution tests: records → pool → stub service
//!
//! These tests drive the public API the way an importer would:
//! 1. Sources seed handles against an in-memory record service
//! 2. The pool multiplexes checkouts across them
//! 3. The bulk executor partitions, dispatches, and aggregates
//!
//! The stub service tracks concurrency high-water marks and can throttle
//! or reject calls on demand, so the tests can assert the pooling
//! invariants from the outside.

use async_trait::async_trait;
use drover_client::prelude::*;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// In-memory record service shared by every connection the tests mint
struct StubService {
    in_flight: AtomicUsize,
    high_water: AtomicUsize,
    calls: AtomicU64,
    next_id: AtomicU64,
    latency: Duration,
    /// Throttle the next N calls with the given retry-after
    throttle_next: Mutex<Option<(u32, Duration)>>,
    /// Refuse multi-record payloads, forcing the per-record replay
    reject_multi: AtomicBool,
}

impl StubService {
    fn new(latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            in_flight: AtomicUsize::new(0),
            high_water: AtomicUsize::new(0),
            calls: AtomicU64::new(0),
            next_id: AtomicU64::new(0),
            latency,
            throttle_next: Mutex::new(None),
            reject_multi: AtomicBool::new(false),
        })
    }

    fn throttle_next(&self, calls: u32, retry_after: Duration) {
        *self.throttle_next.lock() = Some((calls, retry_after));
    }

    fn reject_multi_record(&self, reject: bool) {
        self.reject_multi.store(reject, Ordering::SeqCst);
    }

    fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn max_concurrency(&self) -> usize {
        self.high_water.load(Ordering::SeqCst)
    }

    fn assign_id(&self) -> String {
        format!("rec-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// A record carrying a `poison` field is refused at the item level
    fn item_outcome(&self, child: &RecordRequest) -> ItemOutcome {
        let poisoned = match child {
            RecordRequest::CreateMultiple { records, .. }
            | RecordRequest::UpdateMultiple { records, .. }
            | RecordRequest::UpsertMultiple { records, .. } => {
                records.iter().any(|r| r.get("poison").is_some())
            }
            _ => false,
        };
        if poisoned {
            return ItemOutcome::Failed {
                message: "field validation failed: poison".to_string(),
            };
        }
        let id = match child {
            RecordRequest::CreateMultiple { .. } => Some(self.assign_id()),
            RecordRequest::UpdateMultiple { records, .. }
            | RecordRequest::UpsertMultiple { records, .. } => {
                records.first().and_then(|r| r.id.clone())
            }
            RecordRequest::DeleteMultiple { ids, .. } => ids.first().cloned(),
            _ => None,
        };
        ItemOutcome::Success { id }
    }

    fn respond(&self, request: &RecordRequest) -> Result<RecordResponse> {
        match request {
            RecordRequest::CreateMultiple { records, .. } => {
                if self.reject_multi.load(Ordering::SeqCst) {
                    return Err(Error::rejected("multi-record payload refused"));
                }
                let ids = records.iter().map(|_| self.assign_id()).collect();
                Ok(RecordResponse::Created { ids })
            }
            RecordRequest::UpdateMultiple { records, .. } => Ok(RecordResponse::Updated {
                count: records.len() as u64,
            }),
            RecordRequest::UpsertMultiple { records, .. } => {
                let outcomes = records
                    .iter()
                    .map(|r| match &r.id {
                        Some(id) => UpsertOutcome {
                            id: id.clone(),
                            created: false,
                        },
                        None => UpsertOutcome {
                            id: self.assign_id(),
                            created: true,
                        },
                    })
                    .collect();
                Ok(RecordResponse::Upserted { outcomes })
            }
            RecordRequest::DeleteMultiple { ids, .. } => Ok(RecordResponse::Deleted {
                count: ids.len() as u64,
            }),
            RecordRequest::ExecuteContainer { requests, .. } => {
                let outcomes = requests.iter().map(|c| self.item_outcome(c)).collect();
                Ok(RecordResponse::Container { outcomes })
            }
            RecordRequest::Ping => Ok(RecordResponse::Pong),
        }
    }
}

#[async_trait]
impl RecordTransport for StubService {
    async fn execute(
        &self,
        _options: &CallOptions,
        request: &RecordRequest,
    ) -> Result<RecordResponse> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.high_water.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.calls.fetch_add(1, Ordering::SeqCst);

        let throttled = {
            let mut slot = self.throttle_next.lock();
            match *slot {
                Some((remaining, wait)) => {
                    *slot = if remaining > 1 {
                        Some((remaining - 1, wait))
                    } else {
                        None
                    };
                    Some(wait)
                }
                None => None,
            }
        };
        if let Some(wait) = throttled {
            return Err(Error::throttled(Some(wait)));
        }
        self.respond(request)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

/// Credential wrapper; each seed mints a handle over the shared service
struct StubSource {
    name: String,
    parallelism: usize,
    service: Arc<StubService>,
    seeds: AtomicU64,
}

impl StubSource {
    fn new(name: &str, parallelism: usize, service: Arc<StubService>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            parallelism,
            service,
            seeds: AtomicU64::new(0),
        })
    }

    fn seeds(&self) -> u64 {
        self.seeds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConnectionSource for StubSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn parallelism(&self) -> usize {
        self.parallelism
    }

    async fn seed_handle(&self) -> Result<Handle> {
        self.seeds.fetch_add(1, Ordering::SeqCst);
        let auth = AuthContext::new(
            "https://records.invalid",
            self.name.clone(),
            format!("token-{}", self.name),
        );
        Ok(Handle::new(
            self.name.clone(),
            auth,
            Arc::clone(&self.service) as Arc<dyn RecordTransport>,
        ))
    }

    fn invalidate_seed(&self) {}
}

fn records(n: usize) -> Vec<Record> {
    (0..n)
        .map(|i| Record::new().set("name", format!("widget-{i}")))
        .collect()
}

#[tokio::test]
async fn test_bulk_create_round_trip() {
    let service = StubService::new(Duration::ZERO);
    let alpha = StubSource::new("alpha", 2, Arc::clone(&service));
    let beta = StubSource::new("beta", 2, Arc::clone(&service));
    let sources: Vec<Arc<dyn ConnectionSource>> = vec![alpha.clone(), beta.clone()];

    let pool = Arc::new(ConnectionPool::new(sources, PoolConfig::default()).unwrap());
    let executor = BulkExecutor::new(Arc::clone(&pool));

    let options = BulkOptions::default().with_batch_size(50);
    let result = executor
        .run(
            "item",
            OperationKind::Create,
            records(230),
            &options,
            Arc::new(NullSink),
            &CallContext::new(),
        )
        .await
        .unwrap();

    assert!(result.is_complete_success());
    assert_eq!(result.total, 230);
    assert_eq!(result.succeeded, 230);
    assert_eq!(result.batches, 5);
    assert_eq!(service.calls(), 5);

    let unique: HashSet<&String> = result.created_ids.iter().collect();
    assert_eq!(unique.len(), 230, "created ids must be unique");

    // a source authenticates at most once no matter how many checkouts hit it
    assert!(alpha.seeds() <= 1);
    assert!(beta.seeds() <= 1);
    assert!(alpha.seeds() + beta.seeds() >= 1);

    let stats = pool.stats();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.acquired, stats.released);
    pool.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pool_capacity_bounded_under_load() {
    let service = StubService::new(Duration::from_millis(5));
    let alpha = StubSource::new("alpha", 2, Arc::clone(&service));
    let beta = StubSource::new("beta", 2, Arc::clone(&service));
    let sources: Vec<Arc<dyn ConnectionSource>> = vec![alpha, beta];

    let pool = Arc::new(ConnectionPool::new(sources, PoolConfig::default()).unwrap());
    assert_eq!(pool.capacity(), 4);
    let executor = BulkExecutor::new(Arc::clone(&pool));

    // 20 batches contending for 4 slots
    let options = BulkOptions::default().with_batch_size(2);
    let result = executor
        .run(
            "item",
            OperationKind::Create,
            records(40),
            &options,
            Arc::new(NullSink),
            &CallContext::new(),
        )
        .await
        .unwrap();

    assert!(result.is_complete_success());
    assert_eq!(result.batches, 20);
    assert!(
        service.max_concurrency() <= 4,
        "observed {} concurrent calls against capacity 4",
        service.max_concurrency()
    );

    let stats = pool.stats();
    assert_eq!(stats.active, 0);
    assert_eq!(stats.acquired, 20);
    assert_eq!(stats.released, 20);
    pool.close().await;
}

#[tokio::test]
async fn test_throttle_absorbed_and_charged_to_source() {
    let service = StubService::new(Duration::ZERO);
    service.throttle_next(1, Duration::from_millis(50));
    let source = StubSource::new("alpha", 2, Arc::clone(&service));
    let sources: Vec<Arc<dyn ConnectionSource>> = vec![source];

    let pool = Arc::new(ConnectionPool::new(sources, PoolConfig::default()).unwrap());
    let executor = BulkExecutor::new(Arc::clone(&pool));

    let options = BulkOptions::default().with_batch_size(60);
    let result = executor
        .run(
            "item",
            OperationKind::Create,
            records(120),
            &options,
            Arc::new(NullSink),
            &CallContext::new(),
        )
        .await
        .unwrap();

    // the rate limit cost time, never records
    assert!(result.is_complete_success());
    assert_eq!(result.succeeded, 120);

    let run_stats = executor.stats();
    assert!(run_stats.throttle_retries >= 1);

    let pool_stats = pool.stats();
    assert!(pool_stats.throttle_events >= 1);
    assert!(pool_stats.total_throttle_backoff_ms >= 50);
    pool.close().await;
}

#[tokio::test]
async fn test_rejected_batch_replayed_per_record() {
    let service = StubService::new(Duration::ZERO);
    service.reject_multi_record(true);
    let source = StubSource::new("alpha", 2, Arc::clone(&service));
    let sources: Vec<Arc<dyn ConnectionSource>> = vec![source];

    let pool = Arc::new(ConnectionPool::new(sources, PoolConfig::default()).unwrap());
    let executor = BulkExecutor::new(Arc::clone(&pool));

    let mut input = records(8);
    input[2] = input[2].clone().set("poison", true);
    input[5] = input[5].clone().set("poison", true);

    let options = BulkOptions::default().with_batch_size(4);
    let result = executor
        .run(
            "item",
            OperationKind::Create,
            input,
            &options,
            Arc::new(NullSink),
            &CallContext::new(),
        )
        .await
        .unwrap();

    // the two poisoned records fail alone; their neighbors land
    assert!(!result.is_complete_success());
    assert_eq!(result.succeeded, 6);
    assert_eq!(result.failed, 2);
    assert_eq!(result.created_ids.len(), 6);

    let failed_indices: Vec<usize> = result.failures.iter().map(|f| f.index).collect();
    assert_eq!(failed_indices, vec![2, 5]);
    for failure in &result.failures {
        assert!(failure.message.contains("poison"));
        assert!(failure.issues.is_empty());
    }

    assert_eq!(executor.stats().fallback_passes, 2);
    pool.close().await;
}

#[tokio::test]
async fn test_upsert_splits_created_and_updated() {
    let service = StubService::new(Duration::ZERO);
    let source = StubSource::new("alpha", 2, Arc::clone(&service));
    let sources: Vec<Arc<dyn ConnectionSource>> = vec![source];

    let pool = Arc::new(ConnectionPool::new(sources, PoolConfig::default()).unwrap());
    let executor = BulkExecutor::new(Arc::clone(&pool));

    let mut input = Vec::new();
    for i in 0..5 {
        input.push(Record::with_id(format!("known-{i}")).set("name", "kept"));
    }
    for _ in 0..5 {
        input.push(Record::new().set("name", "fresh"));
    }

    let result = executor
        .run(
            "item",
            OperationKind::Upsert,
            input,
            &BulkOptions::default(),
            Arc::new(NullSink),
            &CallContext::new(),
        )
        .await
        .unwrap();

    assert!(result.is_complete_success());
    assert_eq!(result.upserted_created, 5);
    assert_eq!(result.upserted_updated, 5);
    pool.close().await;
}
