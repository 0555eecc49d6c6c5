//! Drives a [`WorkflowDefinition`] level by level to completion.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::reliability::DeadLetterQueue;
use crate::workflow::context::WorkflowContext;
use crate::workflow::executor::{JobExecutor, JobExecutorError, WorkerRegistry};
use crate::workflow::job::Job;
use crate::workflow::resolver::{DependencyResolver, ResolverError};

/// An immutable named DAG of [`Job`]s.
pub struct WorkflowDefinition {
    pub name: String,
    pub jobs: HashMap<String, Job>,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, jobs: impl IntoIterator<Item = Job>) -> Self {
        Self {
            name: name.into(),
            jobs: jobs.into_iter().map(|j| (j.name.clone(), j)).collect(),
        }
    }
}

type JobHook = Arc<dyn Fn(&str) + Send + Sync>;
type JobErrorHook = Arc<dyn Fn(&str, &str) + Send + Sync>;
type WorkflowHook = Arc<dyn Fn() + Send + Sync>;

/// One job's entry in an optional execution trace.
#[derive(Debug, Clone, serde::Serialize)]
pub struct JobTrace {
    pub job: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub input: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
}

/// Outcome of running a workflow to completion (or first unrecoverable stop).
#[derive(Debug)]
pub struct WorkflowRunResult {
    pub workflow_name: String,
    pub workflow_output: Value,
    pub completed_jobs: Vec<String>,
    pub failed_jobs: Vec<String>,
    pub execution_time_seconds: f64,
    pub success: bool,
    pub correlation_id: String,
    pub trace: Option<Vec<JobTrace>>,
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Resolver(#[from] ResolverError),
    #[error("job {0:?} failed unrecoverably")]
    JobFailed(String),
}

#[derive(Clone, Default)]
struct Hooks {
    on_job_start: Vec<JobHook>,
    on_job_complete: Vec<JobHook>,
    on_job_error: Vec<JobErrorHook>,
    on_workflow_start: Vec<WorkflowHook>,
    on_workflow_complete: Vec<WorkflowHook>,
}

impl Hooks {
    fn fire_job(hooks: &[JobHook], job_name: &str) {
        for hook in hooks {
            if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook(job_name))) {
                warn!(?panic, "workflow hook panicked, ignoring");
            }
        }
    }

    fn fire_job_error(hooks: &[JobErrorHook], job_name: &str, message: &str) {
        for hook in hooks {
            if let Err(panic) =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook(job_name, message)))
            {
                warn!(?panic, "workflow error hook panicked, ignoring");
            }
        }
    }

    fn fire(hooks: &[WorkflowHook]) {
        for hook in hooks {
            if let Err(panic) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| hook())) {
                warn!(?panic, "workflow hook panicked, ignoring");
            }
        }
    }
}

pub struct WorkflowEngineConfig {
    pub trace: bool,
    pub dead_letter_queue: Option<Arc<DeadLetterQueue<Value>>>,
}

impl Default for WorkflowEngineConfig {
    fn default() -> Self {
        Self {
            trace: false,
            dead_letter_queue: None,
        }
    }
}

impl WorkflowEngineConfig {
    pub fn with_trace(mut self, trace: bool) -> Self {
        self.trace = trace;
        self
    }

    pub fn with_dead_letter_queue(mut self, dlq: Arc<DeadLetterQueue<Value>>) -> Self {
        self.dead_letter_queue = Some(dlq);
        self
    }

    /// Adopt the process-wide debug toggle (`TASKMESH_DEBUG`): debug mode
    /// defaults workflow tracing on.
    pub fn with_debug_config(mut self, cfg: crate::config::DebugConfig) -> Self {
        self.trace = self.trace || cfg.debug;
        self
    }
}

/// Resolves a workflow's levels, then runs each level's jobs concurrently
/// (nothing in a level depends on anything else in the same level, by
/// construction of the resolver), stopping at the first job whose
/// executor reports [`JobExecutorError::Unrecoverable`].
pub struct WorkflowEngine {
    resolver: DependencyResolver,
    registry: WorkerRegistry,
    config: WorkflowEngineConfig,
    hooks: Hooks,
}

impl WorkflowEngine {
    pub fn new(registry: WorkerRegistry, config: WorkflowEngineConfig) -> Self {
        Self {
            resolver: DependencyResolver::new(),
            registry,
            config,
            hooks: Hooks::default(),
        }
    }

    pub fn on_job_start(&mut self, hook: impl Fn(&str) + Send + Sync + 'static) {
        self.hooks.on_job_start.push(Arc::new(hook));
    }

    pub fn on_job_complete(&mut self, hook: impl Fn(&str) + Send + Sync + 'static) {
        self.hooks.on_job_complete.push(Arc::new(hook));
    }

    pub fn on_job_error(&mut self, hook: impl Fn(&str, &str) + Send + Sync + 'static) {
        self.hooks.on_job_error.push(Arc::new(hook));
    }

    pub fn on_workflow_start(&mut self, hook: impl Fn() + Send + Sync + 'static) {
        self.hooks.on_workflow_start.push(Arc::new(hook));
    }

    pub fn on_workflow_complete(&mut self, hook: impl Fn() + Send + Sync + 'static) {
        self.hooks.on_workflow_complete.push(Arc::new(hook));
    }

    #[instrument(skip(self, workflow, input), fields(workflow = %workflow.name))]
    pub async fn run(
        &self,
        workflow: &WorkflowDefinition,
        input: Value,
        correlation_id: Option<String>,
    ) -> Result<WorkflowRunResult, WorkflowError> {
        let run_started = Utc::now();
        Hooks::fire(&self.hooks.on_workflow_start);

        let levels = self.resolver.resolve(&workflow.jobs)?;
        let ctx = WorkflowContext::new(
            input,
            correlation_id.unwrap_or_else(|| uuid::Uuid::now_v7().to_string()),
        );

        let mut executor = JobExecutor::new(self.registry.clone(), workflow.name.clone());
        if let Some(dlq) = &self.config.dead_letter_queue {
            executor = executor.with_dead_letter_queue(Arc::clone(dlq));
        }
        let executor = Arc::new(executor);

        let mut trace = self.config.trace.then(Vec::new);
        let mut failed_job = None;

        'levels: for level in levels.iter() {
            let futures = level.iter().map(|job_name| {
                let job = workflow.jobs.get(job_name).expect("resolved level names exist");
                let ctx = &ctx;
                let jobs = &workflow.jobs;
                let executor = Arc::clone(&executor);
                let hooks = self.hooks.clone();
                async move {
                    let skip = job
                        .if_condition
                        .as_ref()
                        .map(|predicate| !predicate(ctx))
                        .unwrap_or(false);
                    if skip {
                        ctx.record_skip(&job.name);
                        return (job.name.clone(), None, None);
                    }

                    Hooks::fire_job(&hooks.on_job_start, &job.name);
                    info!(job = %job.name, "starting job");
                    let start = Utc::now();
                    let result = executor.run_job(job, ctx, jobs).await;
                    let end = Utc::now();

                    match result {
                        Ok(output) => {
                            ctx.record_output(&job.name, output.clone());
                            Hooks::fire_job(&hooks.on_job_complete, &job.name);
                            (job.name.clone(), Some(output), Some((start, end, None)))
                        }
                        Err(err) => {
                            ctx.record_failure(&job.name);
                            Hooks::fire_job_error(&hooks.on_job_error, &job.name, &err.to_string());
                            (job.name.clone(), None, Some((start, end, Some(err))))
                        }
                    }
                }
            });

            let results = join_all(futures).await;

            for (job_name, output, timing) in results {
                if let (Some(t), Some((start, end, error))) = (trace.as_mut(), timing.clone()) {
                    t.push(JobTrace {
                        job: job_name.clone(),
                        start_time: start,
                        end_time: end,
                        input: ctx.build_job_input(&workflow.jobs[&job_name]),
                        output: output.clone(),
                        error: error.as_ref().map(|e| e.to_string()),
                    });
                }

                if let Some((_, _, Some(err))) = timing {
                    if matches!(err, JobExecutorError::Unrecoverable { .. }) {
                        failed_job = Some(job_name);
                        break 'levels;
                    }
                }
            }
        }

        Hooks::fire(&self.hooks.on_workflow_complete);

        let workflow_output = workflow
            .jobs
            .values()
            .filter(|j| j.outputs_to_workflow)
            .filter_map(|j| ctx.output_of(&j.name))
            .next()
            .or_else(|| {
                workflow
                    .jobs
                    .values()
                    .filter(|j| j.terminates_workflow)
                    .filter(|j| ctx.is_completed(&j.name))
                    .filter_map(|j| ctx.output_of(&j.name))
                    .next()
            })
            .unwrap_or(Value::Null);

        if let Some(job_name) = &failed_job {
            return Err(WorkflowError::JobFailed(job_name.clone()));
        }

        let execution_time_seconds = (Utc::now() - run_started).num_milliseconds() as f64 / 1000.0;

        Ok(WorkflowRunResult {
            workflow_name: workflow.name.clone(),
            workflow_output,
            completed_jobs: ctx.completed_jobs().into_iter().collect(),
            failed_jobs: failed_job.into_iter().collect(),
            execution_time_seconds,
            success: true,
            correlation_id: ctx.correlation_id().to_string(),
            trace,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::{Work, WorkResult};
    use crate::worker::Processor;
    use async_trait::async_trait;

    #[derive(Clone)]
    struct Doubler;

    #[async_trait]
    impl Processor for Doubler {
        const TYPE: &'static str = "doubler";
        type Input = i64;
        type Output = i64;

        async fn process(&self, work: Work<i64>) -> WorkResult<i64> {
            WorkResult::ok(work.id(), *work.payload() * 2)
        }
    }

    #[derive(Clone)]
    struct Fails;

    #[async_trait]
    impl Processor for Fails {
        const TYPE: &'static str = "fails";
        type Input = Value;
        type Output = Value;

        async fn process(&self, work: Work<Value>) -> WorkResult<Value> {
            WorkResult::err(work.id(), crate::work::WorkError::new("boom", "nope"))
        }
    }

    #[tokio::test]
    async fn linear_workflow_runs_to_completion() {
        let registry = WorkerRegistry::new();
        registry.register(Doubler);

        let workflow = WorkflowDefinition::new(
            "double-twice",
            [
                Job::new("first", "doubler").inputs_from_workflow().build(),
                Job::new("second", "doubler")
                    .needs(["first"])
                    .inputs_from_job("first")
                    .outputs_to_workflow()
                    .build(),
            ],
        );

        let engine = WorkflowEngine::new(registry, WorkflowEngineConfig::default());
        let result = engine.run(&workflow, serde_json::json!(3), None).await.unwrap();

        assert_eq!(result.workflow_output, serde_json::json!(12));
        assert_eq!(result.completed_jobs.len(), 2);
        assert!(result.failed_jobs.is_empty());
        assert!(result.success);
        assert_eq!(result.workflow_name, "double-twice");
    }

    #[tokio::test]
    async fn unrecoverable_job_stops_the_workflow() {
        let registry = WorkerRegistry::new();
        registry.register(Fails);

        let workflow = WorkflowDefinition::new(
            "one-step",
            [Job::new("step", "fails")
                .inputs_from_workflow()
                .retry_on_error(crate::reliability::RetryPolicy::no_retry())
                .outputs_to_workflow()
                .build()],
        );

        let engine = WorkflowEngine::new(registry, WorkflowEngineConfig::default());
        let err = engine.run(&workflow, serde_json::json!({}), None).await.unwrap_err();
        assert!(matches!(err, WorkflowError::JobFailed(name) if name == "step"));
    }

    #[tokio::test]
    async fn trace_is_populated_when_requested() {
        let registry = WorkerRegistry::new();
        registry.register(Doubler);

        let workflow = WorkflowDefinition::new(
            "traced",
            [Job::new("only", "doubler")
                .inputs_from_workflow()
                .outputs_to_workflow()
                .build()],
        );

        let engine = WorkflowEngine::new(registry, WorkflowEngineConfig::default().with_trace(true));
        let result = engine.run(&workflow, serde_json::json!(5), None).await.unwrap();

        let trace = result.trace.unwrap();
        assert_eq!(trace.len(), 1);
        assert_eq!(trace[0].job, "only");
        assert_eq!(trace[0].output, Some(serde_json::json!(10)));
    }
}
