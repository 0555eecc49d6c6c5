//! # Taskmesh
//!
//! A parallel task-processing framework: isolated worker actors supervised
//! by a dispatch pool, plus a declarative job-graph workflow engine layered
//! on top of the same actor machinery.
//!
//! ## Features
//!
//! - **Isolated worker actors**: each actor hosts one clone of a
//!   [`worker::Processor`] on its own task; panics inside `process` are
//!   caught and turned into an `Err` result, never taking the pool down.
//! - **Supervised dispatch**: a [`supervisor::Supervisor`] runs a pool of
//!   actors against any [`queue::WorkQueue`] implementation, in batch mode
//!   (drain and stop) or continuous mode (poll on an interval until told
//!   to stop).
//! - **Resilience primitives**: configurable retry with backoff
//!   ([`reliability::RetryPolicy`]), circuit breakers
//!   ([`reliability::CircuitBreaker`]), and a bounded dead-letter queue
//!   ([`reliability::DeadLetterQueue`]) shared between plain supervised work
//!   and workflow jobs.
//! - **Workflow engine**: a [`workflow::Job`] DAG resolved into concurrent
//!   levels by [`workflow::DependencyResolver`], executed by
//!   [`workflow::JobExecutor`] (retry, circuit breaking, fallback jobs,
//!   dead-lettering) and driven end to end by [`workflow::WorkflowEngine`].
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Supervisor                           │
//! │  (owns a pool of actors, drives dispatch in batch/continuous) │
//! └─────────────────────────────────────────────────────────────┘
//!              │                              │
//!              ▼                              ▼
//! ┌───────────────────────┐      ┌───────────────────────────────┐
//! │       WorkQueue        │      │        ResultAggregator       │
//! │ (Fifo / Priority)       │      │ (subscribers, ok/err counts)  │
//! └───────────────────────┘      └───────────────────────────────┘
//!              │
//!              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    DispatchManager + Actor pool               │
//! │      (round-robin idle actors, one isolated task each)        │
//! └─────────────────────────────────────────────────────────────┘
//!
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       WorkflowEngine                          │
//! │  (resolves Job DAG into levels, runs each level concurrently) │
//! └─────────────────────────────────────────────────────────────┘
//!              │
//!              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        JobExecutor                            │
//! │  (per job: retry(breaker(isolated actor)), fallback, DLQ)    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use taskmesh::prelude::*;
//!
//! #[derive(Clone)]
//! struct Doubler;
//!
//! #[async_trait::async_trait]
//! impl Processor for Doubler {
//!     const TYPE: &'static str = "doubler";
//!     type Input = i64;
//!     type Output = i64;
//!
//!     async fn process(&self, work: Work<i64>) -> WorkResult<i64> {
//!         WorkResult::ok(work.id(), *work.payload() * 2)
//!     }
//! }
//!
//! # async fn run() {
//! let queue: FifoQueue<i64> = FifoQueue::new();
//! queue.push(Work::new(21)).unwrap();
//!
//! let supervisor = Supervisor::start(SupervisorConfig::default(), Doubler);
//! supervisor.run(&queue).await.unwrap();
//! # }
//! ```

pub mod actor;
pub mod aggregator;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod queue;
pub mod reliability;
pub mod supervisor;
pub mod work;
pub mod worker;
pub mod workflow;

/// Prelude for common imports.
pub mod prelude {
    pub use crate::actor::{ActorEvent, ActorHandle, ActorState};
    pub use crate::aggregator::ResultAggregator;
    pub use crate::config::DebugConfig;
    pub use crate::dispatch::DispatchManager;
    pub use crate::error::{FrameworkError, Result};
    pub use crate::queue::{FifoQueue, PriorityClass, PriorityQueue, QueueError, WorkQueue};
    pub use crate::reliability::{
        BackoffStrategy, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry,
        DeadLetterQueue, RetryOrchestrator, RetryPolicy,
    };
    pub use crate::supervisor::{
        ExecutionMode, Supervisor, SupervisorConfig, SupervisorError, WorkSource,
    };
    pub use crate::work::{Severity, Work, WorkError, WorkId, WorkResult};
    pub use crate::worker::Processor;
    pub use crate::workflow::{
        Job, JobExecutor, WorkerRegistry, WorkflowContext, WorkflowDefinition, WorkflowEngine,
        WorkflowEngineConfig, WorkflowValidator,
    };
}
