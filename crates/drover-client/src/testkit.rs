//! Scripted fakes shared by the crate's tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::connection::{
    AuthContext, CallOptions, ConnectionSource, Handle, RecordTransport,
};
use crate::error::{Error, Result};
use crate::pool::PoolConfig;
use crate::types::{ItemOutcome, RecordRequest, RecordResponse, UpsertOutcome};

/// In-memory transport that synthesizes successful responses unless a
/// fault has been scripted.
pub(crate) struct FakeTransport {
    calls: AtomicU64,
    pings: AtomicU64,
    id_counter: AtomicU64,
    faults: Mutex<VecDeque<Error>>,
    container_script: Mutex<VecDeque<Vec<ItemOutcome>>>,
    fail_pings: AtomicBool,
    last_options: Mutex<Option<CallOptions>>,
    last_request: Mutex<Option<RecordRequest>>,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU64::new(0),
            pings: AtomicU64::new(0),
            id_counter: AtomicU64::new(0),
            faults: Mutex::new(VecDeque::new()),
            container_script: Mutex::new(VecDeque::new()),
            fail_pings: AtomicBool::new(false),
            last_options: Mutex::new(None),
            last_request: Mutex::new(None),
        })
    }

    /// Queue a fault; each execute consumes one before succeeding.
    pub fn push_fault(&self, error: Error) {
        self.faults.lock().push_back(error);
    }

    /// Script the outcomes of the next container call.
    pub fn script_container(&self, outcomes: Vec<ItemOutcome>) {
        self.container_script.lock().push_back(outcomes);
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub fn pings(&self) -> u64 {
        self.pings.load(Ordering::Relaxed)
    }

    pub fn set_fail_pings(&self, fail: bool) {
        self.fail_pings.store(fail, Ordering::Relaxed);
    }

    pub fn last_options(&self) -> Option<CallOptions> {
        self.last_options.lock().clone()
    }

    pub fn last_request(&self) -> Option<RecordRequest> {
        self.last_request.lock().clone()
    }

    fn next_id(&self) -> String {
        format!("gen-{}", self.id_counter.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn synthesize(&self, request: &RecordRequest) -> RecordResponse {
        match request {
            RecordRequest::CreateMultiple { records, .. } => RecordResponse::Created {
                ids: (0..records.len()).map(|_| self.next_id()).collect(),
            },
            RecordRequest::UpdateMultiple { records, .. } => RecordResponse::Updated {
                count: records.len() as u64,
            },
            RecordRequest::UpsertMultiple { records, .. } => RecordResponse::Upserted {
                outcomes: records
                    .iter()
                    .map(|record| match &record.id {
                        Some(id) => UpsertOutcome {
                            id: id.clone(),
                            created: false,
                        },
                        None => UpsertOutcome {
                            id: self.next_id(),
                            created: true,
                        },
                    })
                    .collect(),
            },
            RecordRequest::DeleteMultiple { ids, .. } => RecordResponse::Deleted {
                count: ids.len() as u64,
            },
            RecordRequest::ExecuteContainer { requests, .. } => {
                if let Some(outcomes) = self.container_script.lock().pop_front() {
                    return RecordResponse::Container { outcomes };
                }
                RecordResponse::Container {
                    outcomes: requests
                        .iter()
                        .map(|inner| ItemOutcome::Success {
                            id: match inner {
                                RecordRequest::DeleteMultiple { ids, .. } => ids.first().cloned(),
                                RecordRequest::CreateMultiple { .. }
                                | RecordRequest::UpsertMultiple { .. } => Some(self.next_id()),
                                _ => None,
                            },
                        })
                        .collect(),
                }
            }
            RecordRequest::Ping => RecordResponse::Pong,
        }
    }
}

#[async_trait]
impl RecordTransport for FakeTransport {
    async fn execute(
        &self,
        options: &CallOptions,
        request: &RecordRequest,
    ) -> Result<RecordResponse> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        *self.last_options.lock() = Some(options.clone());
        *self.last_request.lock() = Some(request.clone());

        if let Some(error) = self.faults.lock().pop_front() {
            return Err(error);
        }
        Ok(self.synthesize(request))
    }

    async fn ping(&self) -> Result<()> {
        self.pings.fetch_add(1, Ordering::Relaxed);
        if self.fail_pings.load(Ordering::Relaxed) {
            Err(Error::connection("scripted ping failure"))
        } else {
            Ok(())
        }
    }
}

/// Connection source backed by a [`FakeTransport`], with scriptable seed
/// failures.
pub(crate) struct FakeSource {
    name: String,
    parallelism: usize,
    transport: Arc<FakeTransport>,
    seed_attempts: AtomicU64,
    seeds_created: AtomicU64,
    invalidations: AtomicU64,
    fail_next_seeds: AtomicU64,
    seed_affinity: Mutex<Option<String>>,
}

impl FakeSource {
    pub fn new(name: impl Into<String>, parallelism: usize) -> Arc<Self> {
        Self::with_transport(name, parallelism, FakeTransport::new())
    }

    pub fn with_transport(
        name: impl Into<String>,
        parallelism: usize,
        transport: Arc<FakeTransport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            parallelism,
            transport,
            seed_attempts: AtomicU64::new(0),
            seeds_created: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
            fail_next_seeds: AtomicU64::new(0),
            seed_affinity: Mutex::new(None),
        })
    }

    pub fn transport(&self) -> &Arc<FakeTransport> {
        &self.transport
    }

    pub fn seed_attempts(&self) -> u64 {
        self.seed_attempts.load(Ordering::Relaxed)
    }

    pub fn seeds_created(&self) -> u64 {
        self.seeds_created.load(Ordering::Relaxed)
    }

    pub fn invalidations(&self) -> u64 {
        self.invalidations.load(Ordering::Relaxed)
    }

    /// Fail the next `n` seed attempts with an authentication fault.
    pub fn fail_next_seeds(&self, n: u64) {
        self.fail_next_seeds.store(n, Ordering::Relaxed);
    }

    /// Attach a sticky-session token to future seeds.
    pub fn set_seed_affinity(&self, token: impl Into<String>) {
        *self.seed_affinity.lock() = Some(token.into());
    }
}

#[async_trait]
impl ConnectionSource for FakeSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn parallelism(&self) -> usize {
        self.parallelism
    }

    async fn seed_handle(&self) -> Result<Handle> {
        self.seed_attempts.fetch_add(1, Ordering::Relaxed);

        let remaining = self.fail_next_seeds.load(Ordering::Relaxed);
        if remaining > 0 {
            self.fail_next_seeds.store(remaining - 1, Ordering::Relaxed);
            return Err(Error::authentication("scripted seed failure"));
        }

        let n = self.seeds_created.fetch_add(1, Ordering::Relaxed) + 1;
        let mut auth = AuthContext::new("https://records.test", &self.name, format!("token-{n}"));
        if let Some(token) = self.seed_affinity.lock().clone() {
            auth = auth.with_affinity_token(token);
        }
        Ok(Handle::new(
            &self.name,
            auth,
            Arc::clone(&self.transport) as Arc<dyn RecordTransport>,
        ))
    }

    fn invalidate_seed(&self) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
    }
}

/// Pool config suitable for fast tests: no background validation churn,
/// short enough timeouts that nothing hangs for minutes.
pub(crate) fn quick_config() -> PoolConfig {
    PoolConfig::default()
        .with_acquire_timeout(Duration::from_secs(5))
        .with_validation_interval(Duration::from_secs(3600))
}
