//! Runs one job: builds its input, executes it through retry + circuit
//! breaker + a single-worker supervisor, and handles fallback/dead-lettering.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{instrument, warn};

use crate::actor::{spawn_actor, ActorEvent};
use crate::reliability::{
    CircuitBreakerError, CircuitBreakerRegistry, DeadLetterQueue, RetryAttempt, RetryOrchestrator,
    RetryPolicy, RetryableError,
};
use crate::work::{Work, WorkResult};
use crate::worker::Processor;
use crate::workflow::context::WorkflowContext;
use crate::workflow::job::Job;

/// Type-erased [`Processor`] operating on JSON values, so the executor can
/// look workers up by name without a generic parameter per job — the same
/// shape the teacher's `AnyWorkflow`/`WorkflowWrapper<W>` type erasure uses
/// to store heterogeneous workflow types behind one registry.
#[async_trait]
trait JsonWorker: Send + Sync {
    async fn process_json(&self, work: Work<Value>) -> WorkResult<Value>;
}

struct JsonWorkerWrapper<P> {
    processor: P,
}

#[async_trait]
impl<P> JsonWorker for JsonWorkerWrapper<P>
where
    P: Processor,
    P::Input: DeserializeOwned,
    P::Output: Serialize,
{
    async fn process_json(&self, work: Work<Value>) -> WorkResult<Value> {
        let work_id = work.id();
        let input: P::Input = match serde_json::from_value(work.into_payload()) {
            Ok(v) => v,
            Err(e) => {
                return WorkResult::err(
                    work_id,
                    crate::work::WorkError::new("deserialize", e.to_string()),
                )
            }
        };
        let result = self.processor.process(Work::new(input)).await;
        match result.into_result() {
            Ok(output) => match serde_json::to_value(output) {
                Ok(value) => WorkResult::ok(work_id, value),
                Err(e) => WorkResult::err(
                    work_id,
                    crate::work::WorkError::new("serialize", e.to_string()),
                ),
            },
            Err(error) => WorkResult::err(work_id, error),
        }
    }
}

/// Adapts an `Arc<dyn JsonWorker>` back into a [`Processor`] over JSON
/// values, so one job invocation can be run through the same isolated,
/// panic-catching actor every other worker runs through.
#[derive(Clone)]
struct ErasedJsonProcessor(Arc<dyn JsonWorker>);

#[async_trait]
impl Processor for ErasedJsonProcessor {
    const TYPE: &'static str = "erased-json-worker";
    type Input = Value;
    type Output = Value;

    async fn process(&self, work: Work<Value>) -> WorkResult<Value> {
        self.0.process_json(work).await
    }
}

/// Maps a job's `worker_type` name to a runnable worker instance.
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    workers: Arc<DashMap<String, Arc<dyn JsonWorker>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P>(&self, processor: P)
    where
        P: Processor,
        P::Input: DeserializeOwned,
        P::Output: Serialize,
    {
        self.workers.insert(
            P::TYPE.to_string(),
            Arc::new(JsonWorkerWrapper { processor }),
        );
    }

    fn get(&self, worker_type: &str) -> Option<Arc<dyn JsonWorker>> {
        self.workers.get(worker_type).map(|e| e.clone())
    }
}

#[derive(Debug, Error)]
pub enum JobExecutorError {
    #[error("job {job_name:?}'s worker type {worker_type:?} is not registered")]
    UnknownWorkerType { job_name: String, worker_type: String },
    #[error("job {job_name:?} failed: {message}")]
    WorkerFailure { job_name: String, message: String },
    #[error("job {job_name:?} failed unrecoverably and was dead-lettered")]
    Unrecoverable { job_name: String },
}

/// Internal outcome of [`JobExecutor::run_worker`]: either the worker type
/// was never registered, or the full retry budget was spent and the last
/// failure (plus its history) is carried forward for dead-lettering.
#[derive(Debug)]
enum RunWorkerError {
    UnknownWorkerType(JobExecutorError),
    Failed(WorkerFailureDetail),
}

/// Everything about a worker failure worth recording once it's been through
/// the full retry budget: the final message plus the attempt history, so the
/// dead letter entry carries more than just the last error.
#[derive(Debug)]
struct WorkerFailureDetail {
    message: String,
    attempts: u32,
    total_elapsed: std::time::Duration,
    history: Vec<RetryAttempt>,
}

struct JsonRetryError(crate::work::WorkError);

impl RetryableError for JsonRetryError {
    fn kind(&self) -> &str {
        &self.0.kind
    }

    fn message(&self) -> String {
        self.0.message.clone()
    }
}

/// Drives one job invocation: resolve input, run through
/// retry(breaker(single-worker supervisor)), fall back or dead-letter on
/// unrecoverable failure.
pub struct JobExecutor {
    registry: WorkerRegistry,
    breakers: Arc<CircuitBreakerRegistry>,
    dlq: Arc<DeadLetterQueue<Value>>,
    workflow_name: String,
}

impl JobExecutor {
    pub fn new(registry: WorkerRegistry, workflow_name: impl Into<String>) -> Self {
        Self {
            registry,
            breakers: Arc::new(CircuitBreakerRegistry::new()),
            dlq: Arc::new(DeadLetterQueue::new(1000)),
            workflow_name: workflow_name.into(),
        }
    }

    pub fn with_dead_letter_queue(mut self, dlq: Arc<DeadLetterQueue<Value>>) -> Self {
        self.dlq = dlq;
        self
    }

    pub fn dead_letter_queue(&self) -> &Arc<DeadLetterQueue<Value>> {
        &self.dlq
    }

    #[instrument(skip(self, ctx, jobs), fields(job = %job.name, workflow = %self.workflow_name))]
    pub async fn run_job(
        &self,
        job: &Job,
        ctx: &WorkflowContext,
        jobs: &HashMap<String, Job>,
    ) -> Result<Value, JobExecutorError> {
        let input = ctx.build_job_input(job);
        match self.run_worker(job, input.clone()).await {
            Ok(output) => Ok(output),
            Err(RunWorkerError::UnknownWorkerType(err)) => Err(err),
            Err(RunWorkerError::Failed(detail)) => {
                warn!(error = %detail.message, attempts = detail.attempts, "job failed after retry/breaker decorators");
                self.handle_unrecoverable(job, jobs, ctx, input, detail).await
            }
        }
    }

    /// Run `job`'s worker once through retry(breaker(supervisor)) nesting.
    async fn run_worker(&self, job: &Job, input: Value) -> Result<Value, RunWorkerError> {
        let worker_type = job.worker_type.clone();
        let processor = self.registry.get(&worker_type).ok_or_else(|| {
            RunWorkerError::UnknownWorkerType(JobExecutorError::UnknownWorkerType {
                job_name: job.name.clone(),
                worker_type: worker_type.clone(),
            })
        })?;

        let breaker = job.circuit_breaker.clone().map(|config| {
            let key = job
                .circuit_breaker_shared_key
                .clone()
                .unwrap_or_else(|| job.name.clone());
            self.breakers.get_or_insert(&key, config)
        });

        let retry_policy = job.retry_policy.clone().unwrap_or_else(RetryPolicy::no_retry);
        let orchestrator = RetryOrchestrator::new(retry_policy);

        let outcome = orchestrator
            .execute(|| {
                let processor = Arc::clone(&processor);
                let breaker = breaker.clone();
                let input = input.clone();
                async move {
                    let permit = match &breaker {
                        Some(b) => match b.allow() {
                            Ok(p) => Some(p),
                            Err(CircuitBreakerError::Open | CircuitBreakerError::HalfOpenSaturated) => {
                                return Err(JsonRetryError(crate::work::WorkError::new(
                                    "circuit_open",
                                    "circuit breaker rejected the call",
                                )));
                            }
                        },
                        None => None,
                    };

                    let result =
                        run_through_isolated_actor(ErasedJsonProcessor(Arc::clone(&processor)), input)
                            .await;
                    match result.into_result() {
                        Ok(value) => {
                            if let Some(p) = permit {
                                p.success();
                            }
                            Ok(value)
                        }
                        Err(error) => {
                            if let Some(p) = permit {
                                p.failure();
                            }
                            Err(JsonRetryError(error))
                        }
                    }
                }
            })
            .await;

        let attempts = outcome.attempts;
        let total_elapsed = outcome.total_elapsed;
        let history = outcome.history;
        outcome.result.map_err(|e| {
            RunWorkerError::Failed(WorkerFailureDetail {
                message: e.0.message,
                attempts,
                total_elapsed,
                history,
            })
        })
    }

    async fn handle_unrecoverable(
        &self,
        job: &Job,
        jobs: &HashMap<String, Job>,
        ctx: &WorkflowContext,
        input: Value,
        detail: WorkerFailureDetail,
    ) -> Result<Value, JobExecutorError> {
        if let Some(hook) = &job.on_error {
            hook(&job.name, &detail.message);
        }

        if let Some(fallback_name) = &job.fallback_job_name {
            if let Some(fallback) = jobs.get(fallback_name) {
                let mut fallback_no_retry = fallback.clone();
                fallback_no_retry.retry_policy = Some(RetryPolicy::no_retry());
                fallback_no_retry.circuit_breaker = None;
                match self.run_worker(&fallback_no_retry, input.clone()).await {
                    Ok(output) => return Ok(output),
                    Err(fallback_err) => {
                        warn!(error = ?fallback_err, "fallback job also failed");
                    }
                }
            }
        }

        self.dlq
            .add(
                input,
                "job_failure",
                detail.message,
                serde_json::json!({
                    "job_name": job.name,
                    "worker_type": job.worker_type,
                    "correlation_id": ctx.correlation_id(),
                    "workflow_name": self.workflow_name,
                }),
                serde_json::json!({
                    "retry_attempts": detail.attempts,
                    "total_retry_time": detail.total_elapsed.as_secs_f64(),
                    "all_errors": detail.history,
                }),
            )
            .await
            .ok();

        Err(JobExecutorError::Unrecoverable {
            job_name: job.name.clone(),
        })
    }
}

/// Spins up a throwaway single actor to run one job invocation's worker,
/// echoing the teacher's "fresh single-pool `WorkerPool` built per test"
/// framing: one mailbox, one item, panic-isolated, then torn down.
async fn run_through_isolated_actor(worker: ErasedJsonProcessor, input: Value) -> WorkResult<Value> {
    let (handle, mut events) = spawn_actor("job-executor", worker, 1);
    match events.recv().await {
        Some(ActorEvent::Initialized { .. }) => {}
        _ => {
            return WorkResult::err(
                crate::work::WorkId::new(),
                crate::work::WorkError::new("actor_init_failed", "job actor failed to initialize"),
            )
        }
    }

    let work = Work::new(input);
    let work_id = work.id();
    if handle.send_work(work).await.is_err() {
        return WorkResult::err(
            work_id,
            crate::work::WorkError::new("actor_unreachable", "job actor mailbox closed"),
        );
    }

    let result = match events.recv().await {
        Some(ActorEvent::Result(r)) => r,
        _ => WorkResult::err(
            work_id,
            crate::work::WorkError::new("actor_no_result", "job actor closed without a result"),
        ),
    };
    handle.shutdown().await;
    result
}
