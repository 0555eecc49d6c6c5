//! End-to-end scenarios exercising the public API surface: a supervised
//! worker pool on one side, the workflow engine on the other.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use taskmesh::prelude::*;
use taskmesh::reliability::{BackoffStrategy, CircuitBreakerConfig, CircuitBreakerError, CircuitState};
use taskmesh::workflow::{DependencyResolver, WorkflowDefinition, WorkflowEngine, WorkflowEngineConfig};

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
struct DoublerExceptFive;

#[async_trait]
impl Processor for DoublerExceptFive {
    const TYPE: &'static str = "doubler_except_five";
    type Input = i64;
    type Output = i64;

    async fn process(&self, work: Work<i64>) -> WorkResult<i64> {
        let n = *work.payload();
        if n == 5 {
            return WorkResult::err(work.id(), WorkError::new("bad_input", "Cannot process value 5"));
        }
        WorkResult::ok(work.id(), n * 2)
    }
}

#[derive(Clone)]
struct AlwaysFails;

#[async_trait]
impl Processor for AlwaysFails {
    const TYPE: &'static str = "always_fails";
    type Input = i64;
    type Output = i64;

    async fn process(&self, work: Work<i64>) -> WorkResult<i64> {
        WorkResult::err(work.id(), WorkError::new("boom", "always fails"))
    }
}

#[tokio::test]
async fn s1_doubling_pipeline_produces_expected_multiset() {
    let queue: FifoQueue<i64> = FifoQueue::new();
    for i in 1..=10 {
        queue.push(Work::new(i)).unwrap();
    }

    let supervisor = Supervisor::start(SupervisorConfig::default().with_worker_count(2), Doubler);
    supervisor.run(&queue).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let (ok, err) = supervisor.aggregator().counts();
    assert_eq!(ok, 10);
    assert_eq!(err, 0);

    let mut values: Vec<i64> = supervisor
        .aggregator()
        .oks()
        .into_iter()
        .map(|v| v)
        .collect();
    values.sort_unstable();
    assert_eq!(values, vec![2, 4, 6, 8, 10, 12, 14, 16, 18, 20]);
}

#[tokio::test]
async fn s2_error_isolation_one_bad_item_does_not_sink_the_batch() {
    let queue: FifoQueue<i64> = FifoQueue::new();
    for i in 1..=10 {
        queue.push(Work::new(i)).unwrap();
    }

    let supervisor = Supervisor::start(SupervisorConfig::default().with_worker_count(2), DoublerExceptFive);
    supervisor.run(&queue).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let (ok, err) = supervisor.aggregator().counts();
    assert_eq!(ok, 9);
    assert_eq!(err, 1);

    let snapshot = supervisor.aggregator().snapshot();
    let failing = snapshot.iter().find(|r| r.is_err()).unwrap();
    assert_eq!(failing.error().unwrap().message, "Cannot process value 5");
}

#[derive(Clone)]
struct Uppercase;
#[async_trait]
impl Processor for Uppercase {
    const TYPE: &'static str = "uppercase";
    type Input = String;
    type Output = String;
    async fn process(&self, work: Work<String>) -> WorkResult<String> {
        WorkResult::ok(work.id(), work.payload().to_uppercase())
    }
}

#[derive(Clone)]
struct Reverse;
#[async_trait]
impl Processor for Reverse {
    const TYPE: &'static str = "reverse";
    type Input = String;
    type Output = String;
    async fn process(&self, work: Work<String>) -> WorkResult<String> {
        WorkResult::ok(work.id(), work.payload().chars().rev().collect())
    }
}

#[derive(Clone)]
struct Finalize;
#[async_trait]
impl Processor for Finalize {
    const TYPE: &'static str = "finalize";
    type Input = String;
    type Output = String;
    async fn process(&self, work: Work<String>) -> WorkResult<String> {
        WorkResult::ok(work.id(), work.into_payload())
    }
}

#[tokio::test]
async fn s3_linear_workflow_chains_three_jobs() {
    let registry = WorkerRegistry::new();
    registry.register(Uppercase);
    registry.register(Reverse);
    registry.register(Finalize);

    let workflow = WorkflowDefinition::new(
        "uppercase-reverse-finalize",
        [
            Job::new("uppercase", "uppercase").inputs_from_workflow().build(),
            Job::new("reverse", "reverse")
                .needs(["uppercase"])
                .inputs_from_job("uppercase")
                .build(),
            Job::new("finalize", "finalize")
                .needs(["reverse"])
                .inputs_from_job("reverse")
                .outputs_to_workflow()
                .build(),
        ],
    );

    let engine = WorkflowEngine::new(registry, WorkflowEngineConfig::default());
    let result = engine
        .run(&workflow, json!("hello world"), None)
        .await
        .unwrap();

    assert_eq!(result.workflow_output, json!("DLROW OLLEH"));
    assert_eq!(result.completed_jobs, {
        let mut v = result.completed_jobs.clone();
        v.sort();
        vec!["finalize".to_string(), "reverse".to_string(), "uppercase".to_string()]
    });
    assert!(result.failed_jobs.is_empty());
    assert!(result.success);
}

#[derive(Clone)]
struct FlakyPrimary {
    calls: Arc<AtomicU32>,
}
#[async_trait]
impl Processor for FlakyPrimary {
    const TYPE: &'static str = "flaky_primary";
    type Input = serde_json::Value;
    type Output = serde_json::Value;
    async fn process(&self, work: Work<serde_json::Value>) -> WorkResult<serde_json::Value> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        // fails on the first two calls, succeeds on the third
        if n < 2 {
            WorkResult::err(work.id(), WorkError::new("transient", "flaky failure"))
        } else {
            WorkResult::ok(work.id(), json!({"source": "primary"}))
        }
    }
}

#[derive(Clone)]
struct CachedFallback;
#[async_trait]
impl Processor for CachedFallback {
    const TYPE: &'static str = "cached_fallback";
    type Input = serde_json::Value;
    type Output = serde_json::Value;
    async fn process(&self, work: Work<serde_json::Value>) -> WorkResult<serde_json::Value> {
        WorkResult::ok(work.id(), json!({"source": "fallback"}))
    }
}

#[tokio::test]
async fn s4_retry_then_fallback_always_recovers_without_dead_lettering() {
    let registry = WorkerRegistry::new();
    registry.register(FlakyPrimary {
        calls: Arc::new(AtomicU32::new(0)),
    });
    registry.register(CachedFallback);

    let workflow = WorkflowDefinition::new(
        "flaky-with-fallback",
        [
            Job::new("fallback", "cached_fallback").build(),
            Job::new("primary", "flaky_primary")
                .inputs_from_workflow()
                .retry_on_error(
                    RetryPolicy::exponential()
                        .with_max_attempts(3)
                        .with_strategy(BackoffStrategy::Exponential {
                            initial: std::time::Duration::from_millis(1),
                            multiplier: 2.0,
                            max: std::time::Duration::from_millis(5),
                            jitter: 0.0,
                        }),
                )
                .fallback_to("fallback")
                .outputs_to_workflow()
                .build(),
        ],
    );

    let dlq = Arc::new(DeadLetterQueue::new(10));
    let engine = WorkflowEngine::new(
        registry,
        WorkflowEngineConfig::default().with_dead_letter_queue(Arc::clone(&dlq)),
    );

    let result = engine.run(&workflow, json!({}), None).await.unwrap();
    assert!(result.failed_jobs.is_empty());
    assert!(matches!(
        result.workflow_output["source"].as_str(),
        Some("primary") | Some("fallback")
    ));
    assert_eq!(dlq.len(), 0);
}

#[tokio::test]
async fn s5_circuit_breaker_opens_after_threshold_and_rejects_further_calls() {
    let breaker = CircuitBreaker::new(
        CircuitBreakerConfig::default()
            .with_failure_threshold(3)
            .with_reset_timeout(std::time::Duration::from_secs(60))
            .with_half_open_calls(2),
    );

    for _ in 0..3 {
        let permit = breaker.allow().expect("calls 1-3 invoke the thunk");
        permit.failure();
    }

    assert_eq!(breaker.state(), CircuitState::Open);
    assert_eq!(breaker.allow().unwrap_err(), CircuitBreakerError::Open);
    assert_eq!(breaker.allow().unwrap_err(), CircuitBreakerError::Open);
}

#[tokio::test]
async fn s6_cyclic_dependency_is_rejected_before_the_engine_runs() {
    let registry = WorkerRegistry::new();
    registry.register(Doubler);

    let workflow = WorkflowDefinition::new(
        "cyclic",
        [
            Job::new("a", "doubler").needs(["b"]).build(),
            Job::new("b", "doubler").needs(["a"]).build(),
        ],
    );

    let errors = WorkflowValidator::validate(&workflow).unwrap_err();
    assert!(errors
        .iter()
        .any(|e| matches!(e, taskmesh::workflow::ValidationError::Cycle(_))));

    let engine = WorkflowEngine::new(registry, WorkflowEngineConfig::default());
    let run_err = engine.run(&workflow, json!({}), None).await.unwrap_err();
    assert!(matches!(
        run_err,
        taskmesh::workflow::WorkflowError::Resolver(_)
    ));
}

#[tokio::test]
async fn b1_zero_worker_count_is_clamped_to_one() {
    let config = SupervisorConfig::default().with_worker_count(0);
    assert_eq!(config.worker_count, 1);
}

#[tokio::test]
async fn b2_empty_queue_in_batch_mode_returns_immediately() {
    let queue: FifoQueue<i64> = FifoQueue::new();
    let supervisor = Supervisor::start(SupervisorConfig::default().with_worker_count(2), Doubler);
    supervisor.run(&queue).await.unwrap();
    let (ok, err) = supervisor.aggregator().counts();
    assert_eq!((ok, err), (0, 0));
}

#[tokio::test]
async fn b3_every_item_fails_aggregator_has_one_err_per_item() {
    let queue: FifoQueue<i64> = FifoQueue::new();
    for i in 0..5 {
        queue.push(Work::new(i)).unwrap();
    }

    let supervisor = Supervisor::start(SupervisorConfig::default().with_worker_count(2), AlwaysFails);
    supervisor.run(&queue).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;

    let (ok, err) = supervisor.aggregator().counts();
    assert_eq!(ok, 0);
    assert_eq!(err, 5);
}

#[test]
fn r1_fifo_push_then_pop_batch_preserves_order_and_size_invariant() {
    let queue: FifoQueue<i32> = FifoQueue::new();
    for i in 0..7 {
        queue.push(Work::new(i)).unwrap();
    }
    let popped = queue.pop_batch(7);
    let values: Vec<_> = popped.iter().map(|w| *w.payload()).collect();
    assert_eq!(values, (0..7).collect::<Vec<_>>());
    assert_eq!(queue.len(), 0);
}

#[tokio::test]
async fn r2_identical_inputs_and_deterministic_workers_yield_identical_outputs() {
    let run_once = || async {
        let registry = WorkerRegistry::new();
        registry.register(Uppercase);
        registry.register(Reverse);

        let workflow = WorkflowDefinition::new(
            "det",
            [
                Job::new("uppercase", "uppercase").inputs_from_workflow().build(),
                Job::new("reverse", "reverse")
                    .needs(["uppercase"])
                    .inputs_from_job("uppercase")
                    .outputs_to_workflow()
                    .build(),
            ],
        );

        let engine = WorkflowEngine::new(registry, WorkflowEngineConfig::default());
        engine.run(&workflow, json!("deterministic"), None).await.unwrap()
    };

    let first = run_once().await;
    let second = run_once().await;
    assert_eq!(first.workflow_output, second.workflow_output);
    assert_eq!(
        {
            let mut v = first.completed_jobs.clone();
            v.sort();
            v
        },
        {
            let mut v = second.completed_jobs.clone();
            v.sort();
            v
        }
    );
}

#[test]
fn r3_resolver_cache_hit_matches_a_fresh_computation() {
    let resolver = DependencyResolver::new();
    let mut jobs = HashMap::new();
    jobs.insert("a".to_string(), Job::new("a", "noop").build());
    jobs.insert(
        "b".to_string(),
        Job::new("b", "noop").needs(["a"]).build(),
    );

    let cached = resolver.resolve(&jobs).unwrap();
    let fresh = DependencyResolver::new().resolve(&jobs).unwrap();
    assert_eq!(*cached, *fresh);
}
