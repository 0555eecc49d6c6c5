//! A crate-level error composing every module's own error type, for
//! callers who want one `Result` alias rather than matching per subsystem.

use thiserror::Error;

use crate::queue::QueueError;
use crate::reliability::{CircuitBreakerError, DlqError, RetryError};
use crate::supervisor::SupervisorError;
use crate::workflow::{JobExecutorError, ResolverError, ValidationError};

#[derive(Debug, Error)]
pub enum FrameworkError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Retry(#[from] RetryError),

    #[error(transparent)]
    CircuitBreaker(#[from] CircuitBreakerError),

    #[error(transparent)]
    DeadLetter(#[from] DlqError),

    #[error(transparent)]
    JobExecutor(#[from] JobExecutorError),

    #[error(transparent)]
    Resolver(#[from] ResolverError),

    #[error("workflow failed validation: {0:?}")]
    Validation(Vec<ValidationError>),
}

pub type Result<T> = std::result::Result<T, FrameworkError>;
