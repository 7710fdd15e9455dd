use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::collaborators::{ContractRecord, ReviewItem, Store};
use crate::contract::{ContractId, ContractPayload, Decision, Outcome, RiskLevel};
use crate::error::{FailureKind, IntakeError};
use crate::orchestrator::ContractOrchestrator;
use crate::registry::{AwaitResult, IdempotencyRegistry, JobHandle, JobResult};
use crate::state_machine::{FailureDetail, JobStatus, ProcessingLogEntry, Stage};

/// Pool and timing settings for the executor.
#[derive(Debug, Clone, Copy)]
pub struct ExecutorConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub sync_timeout: Duration,
    pub stale_job_ttl: Duration,
    pub result_retention: Duration,
    /// Zero disables the background reaper.
    pub reaper_interval: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 32,
            sync_timeout: Duration::from_secs(30),
            stale_job_ttl: Duration::from_secs(600),
            result_retention: Duration::from_secs(3600),
            reaper_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    /// Finished within the synchronous wait.
    Processed,
    /// Still running; the decision fields are a conservative placeholder.
    Accepted,
    /// Finished with a terminal failure.
    Failed,
}

/// What a submitter gets back.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitResponse {
    pub status: ResponseStatus,
    pub decision: Decision,
    pub risk_level: RiskLevel,
    pub requires_review: bool,
    pub contract_id: ContractId,
    pub processing_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureDetail>,
}

impl SubmitResponse {
    fn processed(outcome: &Outcome, elapsed_ms: u64) -> Self {
        Self {
            status: ResponseStatus::Processed,
            decision: outcome.decision,
            risk_level: outcome.risk_level,
            requires_review: outcome.requires_review,
            contract_id: outcome.contract_record_id.clone(),
            processing_time_ms: elapsed_ms,
            error: None,
        }
    }

    /// Placeholder while the job keeps running: always review, high risk.
    fn accepted(request_id: &str, elapsed_ms: u64) -> Self {
        Self {
            status: ResponseStatus::Accepted,
            decision: Decision::Review,
            risk_level: RiskLevel::High,
            requires_review: true,
            contract_id: request_id.to_string(),
            processing_time_ms: elapsed_ms,
            error: None,
        }
    }

    fn failed(request_id: &str, detail: FailureDetail, elapsed_ms: u64) -> Self {
        Self {
            status: ResponseStatus::Failed,
            decision: Decision::Review,
            risk_level: RiskLevel::High,
            requires_review: true,
            contract_id: request_id.to_string(),
            processing_time_ms: elapsed_ms,
            error: Some(detail),
        }
    }
}

/// Answer to a later query about a submission.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobView {
    pub request_id: String,
    pub submitted_at: DateTime<Utc>,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureDetail>,
    /// Stored record, when the job has left the registry and only the store
    /// still knows about it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contract: Option<ContractRecord>,
}

struct QueuedJob {
    handle: JobHandle,
    payload: Arc<ContractPayload>,
}

/// Payloads of jobs that have not reached a terminal state, by request id.
///
/// Whoever wins a job's terminal write removes its payload and writes its
/// processing-log entry: the run itself, the crash handler, or the reaper.
type InFlight = Arc<DashMap<String, Arc<ContractPayload>>>;

/// Bounded worker pool in front of the orchestrator.
///
/// Submissions are deduplicated through the registry, queued without
/// blocking (a full queue is `Overloaded`), and answered either with the real
/// result, if it lands within the sync timeout, or a deferred placeholder.
pub struct PipelineExecutor {
    registry: Arc<IdempotencyRegistry>,
    orchestrator: Arc<ContractOrchestrator>,
    queue: mpsc::Sender<QueuedJob>,
    in_flight: InFlight,
    capacity: usize,
    sync_timeout: Duration,
    workers: Vec<JoinHandle<()>>,
    reaper: Option<JoinHandle<()>>,
}

impl PipelineExecutor {
    /// Spawn the workers and the reaper. Must be called inside a Tokio runtime.
    pub fn start(
        orchestrator: Arc<ContractOrchestrator>,
        registry: Arc<IdempotencyRegistry>,
        config: ExecutorConfig,
    ) -> Self {
        let workers_n = config.workers.max(1);
        let capacity = config.queue_capacity.max(1);
        let (tx, rx) = mpsc::channel::<QueuedJob>(capacity);
        let rx = Arc::new(Mutex::new(rx));
        let in_flight: InFlight = Arc::new(DashMap::new());

        let workers = (0..workers_n)
            .map(|id| {
                let ctx = WorkerContext {
                    orchestrator: orchestrator.clone(),
                    registry: registry.clone(),
                    in_flight: in_flight.clone(),
                };
                tokio::spawn(worker_loop(id, rx.clone(), ctx))
            })
            .collect();

        let reaper = (!config.reaper_interval.is_zero()).then(|| {
            tokio::spawn(reaper_loop(
                Arc::downgrade(&registry),
                orchestrator.clone(),
                in_flight.clone(),
                config,
            ))
        });

        info!(workers = workers_n, queue_capacity = capacity, "pipeline executor started");
        Self {
            registry,
            orchestrator,
            queue: tx,
            in_flight,
            capacity,
            sync_timeout: config.sync_timeout,
            workers,
            reaper,
        }
    }

    /// Submit a contract and wait up to `sync_timeout` (or the configured
    /// default) for its result.
    pub async fn submit(
        &self,
        payload: ContractPayload,
        idempotency_key: Option<&str>,
        sync_timeout: Option<Duration>,
    ) -> Result<SubmitResponse, IntakeError> {
        let started = Instant::now();
        let request_id = Uuid::new_v4().to_string();
        let (handle, is_new) = self.registry.submit_or_join(idempotency_key, &request_id);

        if is_new {
            let payload = Arc::new(payload);
            self.in_flight.insert(request_id.clone(), payload.clone());
            let job = QueuedJob {
                handle: handle.clone(),
                payload,
            };
            if let Err(err) = self.queue.try_send(job) {
                self.in_flight.remove(&request_id);
                let (kind, rejection) = match err {
                    mpsc::error::TrySendError::Full(_) => (
                        FailureKind::Overloaded,
                        IntakeError::Overloaded {
                            capacity: self.capacity,
                        },
                    ),
                    mpsc::error::TrySendError::Closed(_) => (FailureKind::WorkerFault, IntakeError::ShutDown),
                };
                // Wake anyone who joined in the meantime, then free the key.
                let detail = FailureDetail::new(Stage::Ingest, kind, rejection.to_string(), true);
                self.registry.fail(&handle, detail);
                self.registry.forget(&handle);
                warn!(request_id, capacity = self.capacity, "submission rejected: {rejection}");
                return Err(rejection);
            }
            info!(request_id, key = %handle.key(), "job queued");
        } else {
            info!(
                request_id,
                joined = %handle.request_id(),
                key = %handle.key(),
                "duplicate submission joined running job"
            );
        }

        let timeout = sync_timeout.unwrap_or(self.sync_timeout);
        let waited = handle.wait(timeout).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        Ok(match waited {
            AwaitResult::Outcome(outcome) => SubmitResponse::processed(&outcome, elapsed_ms),
            AwaitResult::Failed(detail) => SubmitResponse::failed(handle.request_id(), detail, elapsed_ms),
            AwaitResult::TimedOut => {
                info!(
                    request_id = %handle.request_id(),
                    elapsed_ms,
                    "sync wait elapsed, returning deferred response"
                );
                SubmitResponse::accepted(handle.request_id(), elapsed_ms)
            }
        })
    }

    /// Current state of a submission by the request id it was created with.
    ///
    /// Once the registry has evicted the job (or after a restart) the store
    /// is asked for the contract that submission wrote.
    pub async fn lookup(&self, request_id: &str) -> Result<Option<JobView>, IntakeError> {
        if let Some(handle) = self.registry.lookup(request_id) {
            let snapshot = handle.snapshot();
            let (outcome, failure) = match snapshot.result {
                Some(JobResult::Completed(outcome)) => (Some(outcome), None),
                Some(JobResult::Failed(detail)) => (None, Some(detail)),
                None => (None, None),
            };
            return Ok(Some(JobView {
                request_id: handle.request_id().to_string(),
                submitted_at: handle.created_at(),
                status: snapshot.status,
                outcome,
                failure,
                contract: None,
            }));
        }

        let record = self.orchestrator.store().find_by_request(request_id).await?;
        Ok(record.map(|record| JobView {
            request_id: record.request_id.clone(),
            submitted_at: record.created_at,
            status: JobStatus::Completed,
            outcome: None,
            failure: None,
            contract: Some(record),
        }))
    }

    pub async fn list_approved(&self, limit: usize, offset: usize) -> Result<Vec<ContractRecord>, IntakeError> {
        Ok(self.orchestrator.store().list_approved(limit, offset).await?)
    }

    pub async fn list_review_queue(&self, limit: usize, offset: usize) -> Result<Vec<ReviewItem>, IntakeError> {
        Ok(self.orchestrator.store().list_review_queue(limit, offset).await?)
    }

    pub async fn approve(&self, contract_id: &str) -> Result<ContractRecord, IntakeError> {
        let record = self.orchestrator.store().approve(contract_id).await?;
        info!(contract_id, "contract approved by reviewer");
        Ok(record)
    }

    pub async fn reject(&self, contract_id: &str) -> Result<ContractRecord, IntakeError> {
        let record = self.orchestrator.store().decide_reject(contract_id).await?;
        info!(contract_id, "contract rejected by reviewer");
        Ok(record)
    }

    /// A contract by its record id, or by the request id a deferred
    /// response handed out.
    pub async fn contract(&self, contract_id: &str) -> Result<ContractRecord, IntakeError> {
        let store = self.orchestrator.store();
        if let Some(record) = store.get_contract(contract_id).await? {
            return Ok(record);
        }
        store
            .find_by_request(contract_id)
            .await?
            .ok_or_else(|| IntakeError::ContractNotFound(contract_id.to_string()))
    }

    pub async fn list_logs(&self, limit: usize, offset: usize) -> Result<Vec<ProcessingLogEntry>, IntakeError> {
        Ok(self.orchestrator.store().list_logs(limit, offset).await?)
    }

    /// Stop accepting work, let the workers drain the queue, and wait for them.
    pub async fn shutdown(self) {
        let Self {
            queue,
            workers,
            reaper,
            ..
        } = self;
        drop(queue);
        for worker in workers {
            if let Err(e) = worker.await {
                error!(error = %e, "worker ended abnormally");
            }
        }
        if let Some(reaper) = reaper {
            reaper.abort();
        }
        info!("pipeline executor stopped");
    }
}

struct WorkerContext {
    orchestrator: Arc<ContractOrchestrator>,
    registry: Arc<IdempotencyRegistry>,
    in_flight: InFlight,
}

async fn worker_loop(id: usize, rx: Arc<Mutex<mpsc::Receiver<QueuedJob>>>, ctx: WorkerContext) {
    debug!(worker = id, "worker started");
    loop {
        let next = rx.lock().await.recv().await;
        let Some(job) = next else {
            break;
        };
        run_job(id, job, &ctx).await;
    }
    debug!(worker = id, "worker stopped");
}

/// Run one job and record its terminal state. A panic inside the pipeline
/// is caught here and recorded as a `WorkerFault` at the stage it hit.
async fn run_job(worker: usize, job: QueuedJob, ctx: &WorkerContext) {
    let QueuedJob { handle, payload } = job;
    if !ctx.registry.mark_running(&handle) {
        // Abandoned while queued; the reaper has already logged it.
        debug!(worker, key = %handle.key(), "job no longer pending, skipping");
        return;
    }

    let request_id = handle.request_id().to_string();
    let commit = {
        let registry = ctx.registry.clone();
        let in_flight = ctx.in_flight.clone();
        let handle = handle.clone();
        move |result: &Result<Outcome, FailureDetail>| {
            let won = match result {
                Ok(outcome) => registry.complete(&handle, outcome.clone()),
                Err(detail) => registry.fail(&handle, detail.clone()),
            };
            if won {
                in_flight.remove(handle.request_id());
            }
            won
        }
    };
    let task = {
        let orchestrator = ctx.orchestrator.clone();
        let payload = payload.clone();
        let handle = handle.clone();
        let request_id = request_id.clone();
        tokio::spawn(async move {
            orchestrator
                .run(&request_id, &payload, handle.cursor(), commit)
                .await
        })
    };

    if let Err(join_err) = task.await {
        let stage = handle.cursor().get();
        let detail = FailureDetail::new(
            stage,
            FailureKind::WorkerFault,
            format!("worker crashed: {join_err}"),
            false,
        );
        error!(worker, request_id, stage = %stage, error = %join_err, "pipeline task crashed");
        if ctx.registry.fail(&handle, detail.clone()) {
            ctx.in_flight.remove(&request_id);
            ctx.orchestrator.record_fault(&request_id, &payload, detail).await;
        }
    }
}

async fn reaper_loop(
    registry: Weak<IdempotencyRegistry>,
    orchestrator: Arc<ContractOrchestrator>,
    in_flight: InFlight,
    config: ExecutorConfig,
) {
    let mut ticker = tokio::time::interval(config.reaper_interval);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(registry) = registry.upgrade() else {
            break;
        };
        if registry.is_empty() {
            continue;
        }
        let stats = registry.reap(config.stale_job_ttl, config.result_retention);
        for (handle, detail) in &stats.abandoned {
            match in_flight.remove(handle.request_id()) {
                Some((request_id, payload)) => orchestrator.record_fault(&request_id, &payload, detail.clone()).await,
                None => warn!(request_id = %handle.request_id(), "abandoned job has no payload to log"),
            }
        }
        debug!(
            abandoned = stats.abandoned.len(),
            evicted = stats.evicted,
            remaining = registry.len(),
            "reaper tick"
        );
    }
}
