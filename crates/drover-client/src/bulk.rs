//! Bulk execution engine
//!
//! Splits a record collection into service-sized batches and dispatches
//! them concurrently through the connection pool, with every batch holding
//! one slot of a shared parallelism budget. Recovery is per fault class:
//! throttles are waited out by the acquisition phase and retried for as
//! long as it takes, pool exhaustion backs off exponentially, and
//! authentication, connection and contention faults retry a bounded number
//! of times before surfacing. A batch the service refuses outright gets one
//! more pass with each record as its own container item, so a single bad
//! record costs itself rather than its ninety-nine neighbors.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, info, warn};

use drover_core::BackoffPolicy;

use crate::connection::CallContext;
use crate::coordinator::BatchCoordinator;
use crate::diagnostics::{self, ReferenceIssue};
use crate::error::{Error, FaultClass, Result};
use crate::pool::ConnectionPool;
use crate::progress::{ProgressSink, ProgressTracker};
use crate::types::{
    EntityKind, ItemOutcome, OperationKind, Record, RecordRequest, RecordResponse,
};

/// Records per service call unless overridden
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Redraws allowed when the drawn source turns out throttled, before the
/// batch is dispatched on it anyway
pub const DEFAULT_PREFLIGHT_ATTEMPTS: u32 = 10;

/// Retry ceiling for authentication, connection and contention faults
const MAX_FAULT_RETRIES: u32 = 3;

// ============================================================================
// Options
// ============================================================================

/// Tuning knobs for one bulk run
#[derive(Debug, Clone)]
pub struct BulkOptions {
    /// Records packed into each service call
    pub batch_size: usize,
    /// Whether the target entity accepts multi-record calls
    pub entity_kind: EntityKind,
    /// Cap on this run's concurrent batches, on top of the shared budget
    pub max_parallel_batches: Option<usize>,
    /// Redraw budget when the drawn source is throttled at dispatch time
    pub preflight_attempts: u32,
    /// Ask the service to skip custom server-side logic for every call in
    /// this run
    pub bypass_custom_logic: bool,
}

impl Default for BulkOptions {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            entity_kind: EntityKind::MultiRecordCapable,
            max_parallel_batches: None,
            preflight_attempts: DEFAULT_PREFLIGHT_ATTEMPTS,
            bypass_custom_logic: false,
        }
    }
}

impl BulkOptions {
    /// Create options with the defaults above
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of records per service call
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Declare how the target entity handles multi-record calls
    pub fn with_entity_kind(mut self, kind: EntityKind) -> Self {
        self.entity_kind = kind;
        self
    }

    /// Cap this run's concurrent batches below the shared budget
    pub fn with_max_parallel_batches(mut self, cap: usize) -> Self {
        self.max_parallel_batches = Some(cap);
        self
    }

    /// Set the pre-dispatch redraw budget
    pub fn with_preflight_attempts(mut self, attempts: u32) -> Self {
        self.preflight_attempts = attempts;
        self
    }

    /// Skip custom server-side logic for every call in this run
    pub fn with_bypass_custom_logic(mut self, bypass: bool) -> Self {
        self.bypass_custom_logic = bypass;
        self
    }
}

// ============================================================================
// Results
// ============================================================================

/// One record the service rejected, with any reference diagnosis
#[derive(Debug, Clone, Serialize)]
pub struct RecordFailure {
    /// Position of the record in the run's input
    pub index: usize,
    /// Id of the record, when the input carried one
    pub id: Option<String>,
    /// Failure message reported by the service
    pub message: String,
    /// Suspicious references found on the record, indices rebased to the
    /// run's input order
    pub issues: Vec<ReferenceIssue>,
}

/// Aggregated outcome of a bulk run
#[derive(Debug, Clone, Serialize)]
pub struct BulkResult {
    /// Records in the run's input
    pub total: u64,
    /// Records the service accepted
    pub succeeded: u64,
    /// Records the service rejected
    pub failed: u64,
    /// Ids assigned to created records, in input order
    pub created_ids: Vec<String>,
    /// Upserts that created a new record
    pub upserted_created: u64,
    /// Upserts that updated an existing record
    pub upserted_updated: u64,
    /// Rejected records with diagnostics, sorted by input position
    pub failures: Vec<RecordFailure>,
    /// Batches the input was split into
    pub batches: usize,
    /// Wall-clock time of the run
    pub duration: Duration,
}

impl BulkResult {
    /// Whether every input record was accepted
    pub fn is_complete_success(&self) -> bool {
        self.failed == 0 && self.succeeded == self.total
    }
}

// ============================================================================
// Statistics
// ============================================================================

#[derive(Debug, Default)]
struct AtomicBulkStats {
    records_written: AtomicU64,
    records_failed: AtomicU64,
    batches_dispatched: AtomicU64,
    throttle_retries: AtomicU64,
    exhaustion_retries: AtomicU64,
    auth_retries: AtomicU64,
    connection_retries: AtomicU64,
    contention_retries: AtomicU64,
    preflight_redraws: AtomicU64,
    fallback_passes: AtomicU64,
}

impl AtomicBulkStats {
    fn record_batch_dispatched(&self) {
        self.batches_dispatched.fetch_add(1, Ordering::Relaxed);
    }

    fn record_completed(&self, succeeded: u64, failed: u64) {
        self.records_written.fetch_add(succeeded, Ordering::Relaxed);
        self.records_failed.fetch_add(failed, Ordering::Relaxed);
    }

    fn record_throttle_retry(&self) {
        self.throttle_retries.fetch_add(1, Ordering::Relaxed);
    }

    fn record_exhaustion_retry(&self) {
        self.exhaustion_retries.fetch_add(1, Ordering::Relaxed);
    }

    fn record_auth_retry(&self) {
        self.auth_retries.fetch_add(1, Ordering::Relaxed);
    }

    fn record_connection_retry(&self) {
        self.connection_retries.fetch_add(1, Ordering::Relaxed);
    }

    fn record_contention_retry(&self) {
        self.contention_retries.fetch_add(1, Ordering::Relaxed);
    }

    fn record_preflight_redraw(&self) {
        self.preflight_redraws.fetch_add(1, Ordering::Relaxed);
    }

    fn record_fallback_pass(&self) {
        self.fallback_passes.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> BulkStatsSnapshot {
        BulkStatsSnapshot {
            records_written: self.records_written.load(Ordering::Relaxed),
            records_failed: self.records_failed.load(Ordering::Relaxed),
            batches_dispatched: self.batches_dispatched.load(Ordering::Relaxed),
            throttle_retries: self.throttle_retries.load(Ordering::Relaxed),
            exhaustion_retries: self.exhaustion_retries.load(Ordering::Relaxed),
            auth_retries: self.auth_retries.load(Ordering::Relaxed),
            connection_retries: self.connection_retries.load(Ordering::Relaxed),
            contention_retries: self.contention_retries.load(Ordering::Relaxed),
            preflight_redraws: self.preflight_redraws.load(Ordering::Relaxed),
            fallback_passes: self.fallback_passes.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time counters of an executor, cumulative across runs
#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkStatsSnapshot {
    /// Records accepted by the service
    pub records_written: u64,
    /// Records rejected by the service
    pub records_failed: u64,
    /// Batches handed to the pool at least once
    pub batches_dispatched: u64,
    /// Batch re-dispatches after a throttle response
    pub throttle_retries: u64,
    /// Batch re-dispatches after pool exhaustion
    pub exhaustion_retries: u64,
    /// In-batch retries after an authentication fault
    pub auth_retries: u64,
    /// In-batch retries after a connection fault
    pub connection_retries: u64,
    /// In-batch retries after backend contention
    pub contention_retries: u64,
    /// Connections handed back unused because their source was throttled
    pub preflight_redraws: u64,
    /// Batches replayed record-by-record after a rejection
    pub fallback_passes: u64,
}

// ============================================================================
// Executor
// ============================================================================

/// Batch-oriented writer on top of a [`ConnectionPool`]
///
/// Cheap to share behind an [`Arc`]; statistics accumulate across runs.
#[derive(Debug)]
pub struct BulkExecutor {
    pool: Arc<ConnectionPool>,
    coordinator: BatchCoordinator,
    stats: Arc<AtomicBulkStats>,
}

impl BulkExecutor {
    /// Create an executor whose parallelism budget equals the pool capacity
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        let coordinator = BatchCoordinator::for_pool(&pool);
        Self::with_coordinator(pool, coordinator)
    }

    /// Create an executor sharing an existing parallelism budget
    ///
    /// Executors built over the same coordinator compete for the same
    /// batch slots, which keeps several concurrent runs from oversubscribing
    /// one pool.
    pub fn with_coordinator(pool: Arc<ConnectionPool>, coordinator: BatchCoordinator) -> Self {
        Self {
            pool,
            coordinator,
            stats: Arc::new(AtomicBulkStats::default()),
        }
    }

    /// The pool this executor writes through
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// The shared parallelism budget
    pub fn coordinator(&self) -> &BatchCoordinator {
        &self.coordinator
    }

    /// Cumulative counters across all runs of this executor
    pub fn stats(&self) -> BulkStatsSnapshot {
        self.stats.snapshot()
    }

    /// Run one bulk operation over `records`.
    ///
    /// Batches run concurrently up to the shared budget; per-record
    /// failures land in the result rather than aborting the run, while
    /// batch-level faults that outlive their retry budget abort it once
    /// in-flight batches have drained. Progress snapshots go to `sink`
    /// after every completed batch.
    pub async fn run(
        &self,
        entity: &str,
        operation: OperationKind,
        records: Vec<Record>,
        options: &BulkOptions,
        sink: Arc<dyn ProgressSink>,
        ctx: &CallContext,
    ) -> Result<BulkResult> {
        let started = Instant::now();
        let total = records.len() as u64;

        if entity.trim().is_empty() {
            return Err(Error::validation("entity name must not be empty"));
        }
        if records.is_empty() {
            return Err(Error::validation("record set must not be empty"));
        }
        if operation.requires_ids() {
            if let Some(missing) = records.iter().position(|r| r.id.is_none()) {
                return Err(Error::validation(format!(
                    "{operation} requires an id on every record; record {missing} has none"
                )));
            }
        }

        let tracker = Arc::new(ProgressTracker::new(total));
        let input_ids: Arc<HashSet<String>> =
            Arc::new(records.iter().filter_map(|r| r.id.clone()).collect());
        let batches = partition(records, options.batch_size);
        let batch_count = batches.len();

        info!(
            entity,
            operation = %operation,
            records = total,
            batches = batch_count,
            "Starting bulk run"
        );

        let mut run_ctx = ctx.clone();
        run_ctx.bypass_custom_logic |= options.bypass_custom_logic;

        let shared = Arc::new(RunShared {
            pool: Arc::clone(&self.pool),
            stats: Arc::clone(&self.stats),
            tracker,
            sink,
            input_ids,
            entity: entity.to_string(),
            operation,
            entity_kind: options.entity_kind,
            preflight_attempts: options.preflight_attempts,
            ctx: run_ctx,
        });
        let local_cap = options.max_parallel_batches.map(|n| n.max(1));

        let mut join_set: JoinSet<BatchOutcome> = JoinSet::new();
        let mut aggregate = Aggregate::default();
        let mut cancelled = false;

        for batch in batches {
            if ctx.cancellation.is_cancelled() {
                cancelled = true;
                break;
            }
            if let Some(cap) = local_cap {
                while join_set.len() >= cap {
                    match join_set.join_next().await {
                        Some(joined) => aggregate.absorb(joined, &mut cancelled),
                        None => break,
                    }
                }
            }

            let slot = tokio::select! {
                _ = ctx.cancellation.cancelled() => {
                    cancelled = true;
                    break;
                }
                slot = self.coordinator.checkout() => match slot {
                    Ok(slot) => slot,
                    Err(e) => {
                        aggregate.record_error(batch.index, e);
                        break;
                    }
                },
            };

            let shared = Arc::clone(&shared);
            join_set.spawn(async move {
                let outcome = run_batch(&shared, batch).await;
                drop(slot);
                outcome
            });
        }

        // already-dispatched batches always drain, cancelled or not
        while let Some(joined) = join_set.join_next().await {
            aggregate.absorb(joined, &mut cancelled);
        }

        if let Some((index, error)) = aggregate.first_error {
            warn!(batch = index, error = %error, "Bulk run failed");
            return Err(error);
        }
        if cancelled {
            info!(
                completed = aggregate.completed,
                batches = batch_count,
                "Bulk run cancelled"
            );
            return Err(Error::Cancelled);
        }

        aggregate.created.sort_by_key(|(index, _)| *index);
        let created_ids: Vec<String> = aggregate
            .created
            .into_iter()
            .flat_map(|(_, ids)| ids)
            .collect();
        let mut failures = aggregate.failures;
        failures.sort_by_key(|f| f.index);

        let duration = started.elapsed();
        info!(
            succeeded = aggregate.succeeded,
            failed = aggregate.failed,
            batches = batch_count,
            elapsed_ms = duration.as_millis() as u64,
            "Bulk run complete"
        );

        Ok(BulkResult {
            total,
            succeeded: aggregate.succeeded,
            failed: aggregate.failed,
            created_ids,
            upserted_created: aggregate.upserted_created,
            upserted_updated: aggregate.upserted_updated,
            failures,
            batches: batch_count,
            duration,
        })
    }

    /// Delete records by id; sugar over [`run`](Self::run) with
    /// [`OperationKind::Delete`]
    pub async fn delete_ids(
        &self,
        entity: &str,
        ids: Vec<String>,
        options: &BulkOptions,
        sink: Arc<dyn ProgressSink>,
        ctx: &CallContext,
    ) -> Result<BulkResult> {
        let records = ids.into_iter().map(Record::with_id).collect();
        self.run(entity, OperationKind::Delete, records, options, sink, ctx)
            .await
    }
}

// ============================================================================
// Batch execution
// ============================================================================

/// Everything a batch task needs, shared across the run
struct RunShared {
    pool: Arc<ConnectionPool>,
    stats: Arc<AtomicBulkStats>,
    tracker: Arc<ProgressTracker>,
    sink: Arc<dyn ProgressSink>,
    input_ids: Arc<HashSet<String>>,
    entity: String,
    operation: OperationKind,
    entity_kind: EntityKind,
    preflight_attempts: u32,
    ctx: CallContext,
}

struct Batch {
    index: usize,
    /// Global position of the batch's first record
    offset: usize,
    records: Vec<Record>,
}

enum BatchOutcome {
    Done {
        index: usize,
        succeeded: u64,
        failed: u64,
        created_ids: Vec<String>,
        upserted_created: u64,
        upserted_updated: u64,
        failures: Vec<RecordFailure>,
    },
    Failed {
        index: usize,
        error: Error,
    },
    Cancelled,
}

#[derive(Default)]
struct Aggregate {
    succeeded: u64,
    failed: u64,
    upserted_created: u64,
    upserted_updated: u64,
    created: Vec<(usize, Vec<String>)>,
    failures: Vec<RecordFailure>,
    first_error: Option<(usize, Error)>,
    completed: usize,
}

impl Aggregate {
    fn absorb(
        &mut self,
        joined: std::result::Result<BatchOutcome, JoinError>,
        cancelled: &mut bool,
    ) {
        match joined {
            Ok(BatchOutcome::Done {
                index,
                succeeded,
                failed,
                created_ids,
                upserted_created,
                upserted_updated,
                failures,
            }) => {
                self.completed += 1;
                self.succeeded += succeeded;
                self.failed += failed;
                self.upserted_created += upserted_created;
                self.upserted_updated += upserted_updated;
                if !created_ids.is_empty() {
                    self.created.push((index, created_ids));
                }
                self.failures.extend(failures);
            }
            Ok(BatchOutcome::Failed { index, error }) => self.record_error(index, error),
            Ok(BatchOutcome::Cancelled) => *cancelled = true,
            Err(join_error) => self.record_error(
                usize::MAX,
                Error::rejected(format!("batch task aborted: {join_error}")),
            ),
        }
    }

    /// Keep the error of the earliest batch for deterministic reporting
    fn record_error(&mut self, index: usize, error: Error) {
        match &self.first_error {
            Some((stored, _)) if *stored <= index => {}
            _ => self.first_error = Some((index, error)),
        }
    }
}

/// Split records into service-sized batches; a zero size means one record
/// per call
fn partition(records: Vec<Record>, batch_size: usize) -> Vec<Batch> {
    let batch_size = batch_size.max(1);
    let mut batches = Vec::with_capacity(records.len().div_ceil(batch_size));
    let mut rest = records;
    let mut index = 0;
    let mut offset = 0;

    while !rest.is_empty() {
        let take = batch_size.min(rest.len());
        let tail = rest.split_off(take);
        batches.push(Batch {
            index,
            offset,
            records: rest,
        });
        rest = tail;
        index += 1;
        offset += take;
    }
    batches
}

fn build_request(
    entity: &str,
    operation: OperationKind,
    entity_kind: EntityKind,
    records: &[Record],
) -> RecordRequest {
    match operation {
        OperationKind::Create => RecordRequest::CreateMultiple {
            entity: entity.to_string(),
            records: records.to_vec(),
        },
        OperationKind::Update => RecordRequest::UpdateMultiple {
            entity: entity.to_string(),
            records: records.to_vec(),
        },
        OperationKind::Upsert => RecordRequest::UpsertMultiple {
            entity: entity.to_string(),
            records: records.to_vec(),
        },
        OperationKind::Delete => {
            let ids: Vec<String> = records.iter().filter_map(|r| r.id.clone()).collect();
            if entity_kind.supports_multi_record() {
                RecordRequest::DeleteMultiple {
                    entity: entity.to_string(),
                    ids,
                }
            } else {
                // the entity only takes one record per request; aggregating
                // the singles still covers the batch in one round trip
                RecordRequest::ExecuteContainer {
                    requests: ids
                        .into_iter()
                        .map(|id| RecordRequest::DeleteMultiple {
                            entity: entity.to_string(),
                            ids: vec![id],
                        })
                        .collect(),
                    continue_on_error: true,
                }
            }
        }
    }
}

/// One single-record request per record, aggregated with continue-on-error
fn fallback_request(entity: &str, operation: OperationKind, records: &[Record]) -> RecordRequest {
    let requests = records
        .iter()
        .map(|record| match operation {
            OperationKind::Create => RecordRequest::CreateMultiple {
                entity: entity.to_string(),
                records: vec![record.clone()],
            },
            OperationKind::Update => RecordRequest::UpdateMultiple {
                entity: entity.to_string(),
                records: vec![record.clone()],
            },
            OperationKind::Upsert => RecordRequest::UpsertMultiple {
                entity: entity.to_string(),
                records: vec![record.clone()],
            },
            OperationKind::Delete => RecordRequest::DeleteMultiple {
                entity: entity.to_string(),
                ids: record.id.clone().into_iter().collect(),
            },
        })
        .collect();
    RecordRequest::ExecuteContainer {
        requests,
        continue_on_error: true,
    }
}

#[derive(Default)]
struct BatchTally {
    succeeded: u64,
    failed: u64,
    created_ids: Vec<String>,
    upserted_created: u64,
    upserted_updated: u64,
    failures: Vec<LocalFailure>,
}

struct LocalFailure {
    index: usize,
    id: Option<String>,
    message: String,
}

fn interpret_response(
    operation: OperationKind,
    records: &[Record],
    response: RecordResponse,
) -> BatchTally {
    let size = records.len() as u64;
    let mut tally = BatchTally::default();

    match response {
        RecordResponse::Created { ids } => {
            tally.succeeded = ids.len() as u64;
            tally.failed = size.saturating_sub(tally.succeeded);
            tally.created_ids = ids;
        }
        RecordResponse::Updated { count } | RecordResponse::Deleted { count } => {
            tally.succeeded = count.min(size);
            tally.failed = size - tally.succeeded;
        }
        RecordResponse::Upserted { outcomes } => {
            tally.succeeded = outcomes.len() as u64;
            tally.failed = size.saturating_sub(tally.succeeded);
            for outcome in outcomes {
                if outcome.created {
                    tally.upserted_created += 1;
                } else {
                    tally.upserted_updated += 1;
                }
            }
        }
        RecordResponse::Container { outcomes } => {
            let reported = outcomes.len();
            for (i, outcome) in outcomes.into_iter().enumerate() {
                match outcome {
                    ItemOutcome::Success { id } => {
                        tally.succeeded += 1;
                        if operation == OperationKind::Create {
                            if let Some(id) = id {
                                tally.created_ids.push(id);
                            }
                        }
                    }
                    ItemOutcome::Failed { message } => {
                        tally.failed += 1;
                        tally.failures.push(LocalFailure {
                            index: i,
                            id: records.get(i).and_then(|r| r.id.clone()),
                            message,
                        });
                    }
                }
            }
            // items the service never reported on count as failed
            tally.failed += records.len().saturating_sub(reported) as u64;
        }
        RecordResponse::Pong => {}
    }
    tally
}

/// Attach reference diagnosis to a batch's failures and rebase their
/// indices to the run's input order
fn diagnose(
    batch: &Batch,
    local: Vec<LocalFailure>,
    input_ids: &HashSet<String>,
) -> Vec<RecordFailure> {
    if local.is_empty() {
        return Vec::new();
    }
    let failed_indices: Vec<usize> = local.iter().map(|f| f.index).collect();
    let issues = diagnostics::analyze_failures(&batch.records, &failed_indices, input_ids);

    local
        .into_iter()
        .map(|f| {
            let mut own: Vec<ReferenceIssue> = issues
                .iter()
                .filter(|issue| issue.record_index == f.index)
                .cloned()
                .collect();
            for issue in &mut own {
                issue.record_index += batch.offset;
            }
            RecordFailure {
                index: batch.offset + f.index,
                id: f.id,
                message: f.message,
                issues: own,
            }
        })
        .collect()
}

/// Drive one batch to completion through the retry matrix
async fn run_batch(shared: &RunShared, batch: Batch) -> BatchOutcome {
    shared.stats.record_batch_dispatched();
    let mut request = build_request(
        &shared.entity,
        shared.operation,
        shared.entity_kind,
        &batch.records,
    );
    let mut fallback_used = matches!(request, RecordRequest::ExecuteContainer { .. });
    let mut exhaustion_attempt: u32 = 0;

    loop {
        if shared.ctx.cancellation.is_cancelled() {
            return BatchOutcome::Cancelled;
        }

        let response = match dispatch(shared, &request).await {
            Ok(response) => response,
            Err(e) if e.is_throttle() => {
                // the next acquisition waits the throttle out; no local sleep
                shared.stats.record_throttle_retry();
                debug!(batch = batch.index, "Batch throttled; re-dispatching");
                continue;
            }
            Err(e) if e.class() == FaultClass::PoolExhausted => {
                let delay = BackoffPolicy::exhaustion().delay(exhaustion_attempt);
                exhaustion_attempt = exhaustion_attempt.saturating_add(1);
                shared.stats.record_exhaustion_retry();
                warn!(
                    batch = batch.index,
                    delay_ms = delay.as_millis() as u64,
                    "Pool exhausted; backing off"
                );
                if sleep_or_cancel(delay, &shared.ctx).await.is_err() {
                    return BatchOutcome::Cancelled;
                }
                continue;
            }
            Err(e) if e.class() == FaultClass::Rejection && !fallback_used => {
                // one more pass with each record as its own container item,
                // so an offending record fails alone
                shared.stats.record_fallback_pass();
                info!(
                    batch = batch.index,
                    error = %e,
                    "Multi-record call rejected; retrying records individually"
                );
                request = fallback_request(&shared.entity, shared.operation, &batch.records);
                fallback_used = true;
                continue;
            }
            Err(Error::Cancelled) => return BatchOutcome::Cancelled,
            Err(e) => {
                return BatchOutcome::Failed {
                    index: batch.index,
                    error: e,
                }
            }
        };

        let tally = interpret_response(shared.operation, &batch.records, response);
        let failures = diagnose(&batch, tally.failures, &shared.input_ids);

        let snapshot = shared.tracker.record_batch(tally.succeeded, tally.failed);
        shared.sink.publish(&snapshot);
        shared.stats.record_completed(tally.succeeded, tally.failed);
        debug!(
            batch = batch.index,
            succeeded = tally.succeeded,
            failed = tally.failed,
            percent = snapshot.percent,
            "Batch complete"
        );

        return BatchOutcome::Done {
            index: batch.index,
            succeeded: tally.succeeded,
            failed: tally.failed,
            created_ids: tally.created_ids,
            upserted_created: tally.upserted_created,
            upserted_updated: tally.upserted_updated,
            failures,
        };
    }
}

/// Acquire, pre-check, execute; retries the bounded fault classes in place
/// and hands everything else to [`run_batch`]
async fn dispatch(shared: &RunShared, request: &RecordRequest) -> Result<RecordResponse> {
    let mut auth_attempts: u32 = 0;
    let mut connection_attempts: u32 = 0;
    let mut contention_attempts: u32 = 0;

    loop {
        if shared.ctx.cancellation.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let mut client = shared.pool.acquire(&shared.ctx).await?;

        // the drawn source may have been throttled since the acquisition
        // phases ran; redraw on the others before trusting it
        let mut redraws = 0;
        while client.source_throttled() && redraws < shared.preflight_attempts {
            let drawn = client.source_name().to_string();
            client.release();
            shared.stats.record_preflight_redraw();
            redraws += 1;
            debug!(source = %drawn, redraws, "Drawn source throttled; redrawing");
            client = shared.pool.acquire_excluding(Some(&drawn), &shared.ctx).await?;
        }
        // past the redraw budget the service's own verdict decides

        match client.execute(request, &shared.ctx).await {
            Ok(response) => {
                client.release();
                return Ok(response);
            }
            Err(e) => match e.class() {
                FaultClass::Authentication => {
                    let source = client.source_name().to_string();
                    client.release();
                    auth_attempts += 1;
                    if auth_attempts > MAX_FAULT_RETRIES {
                        return Err(e);
                    }
                    shared.stats.record_auth_retry();
                    warn!(
                        source = %source,
                        attempt = auth_attempts,
                        error = %e,
                        "Authentication fault; invalidating seed"
                    );
                    shared.pool.invalidate_seed(&source).await?;
                }
                FaultClass::Connection => {
                    client.mark_invalid(e.to_string());
                    client.release();
                    connection_attempts += 1;
                    if connection_attempts > MAX_FAULT_RETRIES {
                        return Err(e);
                    }
                    shared.stats.record_connection_retry();
                    warn!(
                        attempt = connection_attempts,
                        error = %e,
                        "Connection fault; retrying on a fresh connection"
                    );
                }
                FaultClass::Contention => {
                    client.release();
                    contention_attempts += 1;
                    if contention_attempts > MAX_FAULT_RETRIES {
                        return Err(e);
                    }
                    shared.stats.record_contention_retry();
                    let delay = BackoffPolicy::contention().delay(contention_attempts - 1);
                    debug!(
                        attempt = contention_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "Backend contention; backing off"
                    );
                    sleep_or_cancel(delay, &shared.ctx).await?;
                }
                _ => {
                    client.release();
                    return Err(e);
                }
            },
        }
    }
}

async fn sleep_or_cancel(delay: Duration, ctx: &CallContext) -> Result<()> {
    tokio::select! {
        _ = ctx.cancellation.cancelled() => Err(Error::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}
