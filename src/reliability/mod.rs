//! Resilience primitives shared by the supervisor and the workflow engine.
//!
//! - [`RetryPolicy`] / [`RetryOrchestrator`] - configurable retry with backoff
//! - [`CircuitBreaker`] / [`CircuitBreakerRegistry`] - fail-fast protection for flaky dependencies
//! - [`DeadLetterQueue`] - bounded holding pen for unrecoverable work

mod circuit_breaker;
mod dead_letter;
mod retry;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerPermit,
    CircuitBreakerRegistry, CircuitState,
};
pub use dead_letter::{
    DeadLetterQueue, DlqEntry, DlqError, DlqPersister, DlqStats, FileDlqPersister,
    InMemoryDlqPersister,
};
pub use retry::{
    BackoffStrategy, RetryAttempt, RetryError, RetryOrchestrator, RetryOutcome, RetryPolicy,
    RetryableError,
};
