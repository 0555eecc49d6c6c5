//! Retry policies and the orchestrator that drives a thunk through them.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// A backoff shape between attempts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum BackoffStrategy {
    /// No delay between attempts.
    None,
    /// Fixed delay between attempts.
    Constant(#[serde(with = "duration_millis")] Duration),
    /// Delay grows by a fixed increment each attempt, capped at `max`.
    Linear {
        #[serde(with = "duration_millis")]
        initial: Duration,
        #[serde(with = "duration_millis")]
        increment: Duration,
        #[serde(with = "opt_duration_millis")]
        max: Option<Duration>,
    },
    /// Delay grows multiplicatively, capped at `max`, with full jitter.
    Exponential {
        #[serde(with = "duration_millis")]
        initial: Duration,
        multiplier: f64,
        #[serde(with = "duration_millis")]
        max: Duration,
        jitter: f64,
    },
}

impl BackoffStrategy {
    pub fn exponential_default() -> Self {
        Self::Exponential {
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            max: Duration::from_secs(60),
            jitter: 0.1,
        }
    }
}

/// Configuration for retrying a fallible operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the initial one).
    pub max_attempts: u32,

    pub strategy: BackoffStrategy,

    /// Which error kinds are retryable. `None` retries everything;
    /// `Some(set)` retries only kinds present in the set.
    #[serde(default)]
    pub retryable_error_kinds: Option<HashSet<String>>,

    /// Caps total wall time spent retrying, independent of `max_attempts`.
    #[serde(default, with = "opt_duration_millis")]
    pub timeout: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential()
    }
}

impl RetryPolicy {
    pub fn exponential() -> Self {
        Self {
            max_attempts: 5,
            strategy: BackoffStrategy::exponential_default(),
            retryable_error_kinds: None,
            timeout: None,
        }
    }

    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            strategy: BackoffStrategy::None,
            retryable_error_kinds: None,
            timeout: None,
        }
    }

    pub fn fixed(interval: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            strategy: BackoffStrategy::Constant(interval),
            retryable_error_kinds: None,
            timeout: None,
        }
    }

    pub fn linear(initial: Duration, increment: Duration, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            strategy: BackoffStrategy::Linear {
                initial,
                increment,
                max: None,
            },
            retryable_error_kinds: None,
            timeout: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_retryable_kind(mut self, kind: impl Into<String>) -> Self {
        self.retryable_error_kinds
            .get_or_insert_with(HashSet::new)
            .insert(kind.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Duration to wait before `attempt` (1-based; attempt 1 is the first
    /// try and never waits).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let retry_num = (attempt - 1) as i32;

        match &self.strategy {
            BackoffStrategy::None => Duration::ZERO,
            BackoffStrategy::Constant(d) => *d,
            BackoffStrategy::Linear {
                initial,
                increment,
                max,
            } => {
                let base = initial.as_secs_f64() + increment.as_secs_f64() * (retry_num - 1) as f64;
                let capped = match max {
                    Some(m) => base.min(m.as_secs_f64()),
                    None => base,
                };
                Duration::from_secs_f64(capped.max(0.0))
            }
            BackoffStrategy::Exponential {
                initial,
                multiplier,
                max,
                jitter,
            } => {
                let base = initial.as_secs_f64() * multiplier.powi(retry_num - 1);
                let capped = base.min(max.as_secs_f64());
                let jittered = if *jitter > 0.0 {
                    let mut rng = rand::thread_rng();
                    let range = capped * jitter;
                    (capped + rng.gen_range(-range..range)).max(0.0)
                } else {
                    capped
                };
                Duration::from_secs_f64(jittered)
            }
        }
    }

    /// Whether an error of the given kind should be retried.
    pub fn should_retry(&self, error_kind: &str) -> bool {
        match &self.retryable_error_kinds {
            Some(set) => set.contains(error_kind),
            None => true,
        }
    }

    pub fn has_attempts_remaining(&self, current_attempt: u32) -> bool {
        current_attempt < self.max_attempts
    }
}

/// Errors a [`RetryOrchestrator`] surfaces itself (not the thunk's own errors).
#[derive(Debug, Error)]
pub enum RetryError {
    #[error("retry budget exhausted after {attempts} attempt(s)")]
    Exhausted { attempts: u32 },
    #[error("retry timed out after {elapsed:?}")]
    TimedOut { elapsed: Duration },
}

/// A trait exposing the error-kind classifier `RetryPolicy` checks against.
pub trait RetryableError {
    fn kind(&self) -> &str;

    /// Human-readable detail kept in the orchestrator's per-attempt
    /// history. Defaults to empty for callers who only care about `kind`.
    fn message(&self) -> String {
        String::new()
    }
}

/// Record of one failed attempt, kept for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct RetryAttempt {
    pub attempt: u32,
    pub kind: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Result of running a thunk through a [`RetryOrchestrator`].
#[derive(Debug)]
pub struct RetryOutcome<O, E> {
    pub result: Result<O, E>,
    pub attempts: u32,
    pub total_elapsed: Duration,
    pub history: Vec<RetryAttempt>,
}

/// Drives a fallible async thunk through a [`RetryPolicy`].
pub struct RetryOrchestrator {
    policy: RetryPolicy,
}

impl RetryOrchestrator {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `thunk` repeatedly until it succeeds, the policy is exhausted,
    /// an error kind is found non-retryable, or `timeout` elapses.
    pub async fn execute<F, Fut, O, E>(&self, mut thunk: F) -> RetryOutcome<O, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<O, E>>,
        E: RetryableError,
    {
        let start = Instant::now();
        let mut history = Vec::new();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            if attempt > 1 {
                tokio::time::sleep(self.policy.delay_for_attempt(attempt)).await;
            }

            match thunk().await {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                        total_elapsed: start.elapsed(),
                        history,
                    };
                }
                Err(err) => {
                    let kind = err.kind().to_string();
                    history.push(RetryAttempt {
                        attempt,
                        kind: kind.clone(),
                        message: err.message(),
                        at: Utc::now(),
                    });

                    let retryable = self.policy.should_retry(&kind);
                    let exhausted = !self.policy.has_attempts_remaining(attempt);
                    let timed_out = self
                        .policy
                        .timeout
                        .is_some_and(|t| start.elapsed() >= t);

                    if !retryable || exhausted || timed_out {
                        return RetryOutcome {
                            result: Err(err),
                            attempts: attempt,
                            total_elapsed: start.elapsed(),
                            history,
                        };
                    }
                }
            }
        }
    }
}

/// Serde support for Duration as milliseconds.
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

mod opt_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_millis()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<u64>::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct TestError(&'static str);

    impl RetryableError for TestError {
        fn kind(&self) -> &str {
            self.0
        }
    }

    #[test]
    fn exponential_defaults_match_teacher_values() {
        let policy = RetryPolicy::exponential();
        assert_eq!(policy.max_attempts, 5);
        assert!(matches!(
            policy.strategy,
            BackoffStrategy::Exponential { multiplier, .. } if multiplier == 2.0
        ));
    }

    #[test]
    fn no_retry_has_one_attempt() {
        let policy = RetryPolicy::no_retry();
        assert!(!policy.has_attempts_remaining(1));
    }

    #[test]
    fn exponential_delay_doubles_without_jitter() {
        let policy = RetryPolicy::exponential().with_strategy(BackoffStrategy::Exponential {
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            max: Duration::from_secs(60),
            jitter: 0.0,
        });

        assert_eq!(policy.delay_for_attempt(1), Duration::ZERO);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(4));
    }

    #[test]
    fn exponential_delay_respects_cap() {
        let policy = RetryPolicy::exponential().with_strategy(BackoffStrategy::Exponential {
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            max: Duration::from_secs(5),
            jitter: 0.0,
        });
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(5));
    }

    #[test]
    fn constant_strategy_never_varies() {
        let policy = RetryPolicy::fixed(Duration::from_secs(5), 3);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(5));
    }

    #[test]
    fn retryable_kinds_allowlist_restricts_retry() {
        let policy = RetryPolicy::exponential()
            .with_retryable_kind("timeout")
            .with_retryable_kind("rate_limited");

        assert!(policy.should_retry("timeout"));
        assert!(!policy.should_retry("invalid_input"));
    }

    #[test]
    fn no_allowlist_retries_everything() {
        let policy = RetryPolicy::exponential();
        assert!(policy.should_retry("anything"));
    }

    #[tokio::test]
    async fn orchestrator_stops_at_first_success() {
        let policy = RetryPolicy::fixed(Duration::from_millis(1), 5);
        let orchestrator = RetryOrchestrator::new(policy);
        let calls = AtomicU32::new(0);

        let outcome = orchestrator
            .execute(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(TestError("transient"))
                    } else {
                        Ok::<_, TestError>(42)
                    }
                }
            })
            .await;

        assert_eq!(outcome.result.unwrap(), 42);
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.history.len(), 2);
    }

    #[tokio::test]
    async fn orchestrator_exhausts_and_returns_last_error() {
        let policy = RetryPolicy::fixed(Duration::from_millis(1), 2);
        let orchestrator = RetryOrchestrator::new(policy);

        let outcome = orchestrator
            .execute(|| async { Err::<i32, _>(TestError("permanent")) })
            .await;

        assert!(outcome.result.is_err());
        assert_eq!(outcome.attempts, 2);
    }

    #[tokio::test]
    async fn non_retryable_kind_stops_after_first_attempt() {
        let policy = RetryPolicy::exponential()
            .with_max_attempts(5)
            .with_retryable_kind("transient");
        let orchestrator = RetryOrchestrator::new(policy);
        let calls = AtomicU32::new(0);

        let outcome = orchestrator
            .execute(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<i32, _>(TestError("fatal")) }
            })
            .await;

        assert_eq!(outcome.attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
