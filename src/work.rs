//! Immutable work items and their outcomes.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity of a [`Work`] item.
///
/// Assigned at construction from a time-ordered UUID. Never derived from
/// object/pointer identity — two `Work` values with the same payload are
/// still distinct work items unless they share a `WorkId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkId(Uuid);

impl WorkId {
    /// Generate a new, time-ordered id.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for WorkId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An immutable unit of input for a worker to process.
///
/// `Work` carries no mutation methods: once constructed, only ownership
/// moves (producer -> queue -> exactly one worker actor -> a result).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Work<T> {
    id: WorkId,
    payload: T,
    correlation_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl<T> Work<T> {
    /// Wrap a payload as a new work item.
    pub fn new(payload: T) -> Self {
        Self {
            id: WorkId::new(),
            payload,
            correlation_id: None,
            created_at: Utc::now(),
        }
    }

    /// Wrap a payload, tagging it with a workflow correlation id.
    pub fn with_correlation_id(payload: T, correlation_id: impl Into<String>) -> Self {
        Self {
            id: WorkId::new(),
            payload,
            correlation_id: Some(correlation_id.into()),
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> WorkId {
        self.id
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn into_payload(self) -> T {
        self.payload
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Replace the payload, keeping identity, correlation id and creation time.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Work<U> {
        Work {
            id: self.id,
            payload: f(self.payload),
            correlation_id: self.correlation_id,
            created_at: self.created_at,
        }
    }
}

/// Severity of a [`WorkError`].
///
/// Ordered `Info < Warning < Error < Critical` so the highest-severity
/// entry in a batch can be found with a plain `max()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        };
        write!(f, "{s}")
    }
}

/// The error half of a [`WorkResult`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkError {
    /// Short classifier (e.g. `"panic"`, `"timeout"`, a user-defined kind).
    pub kind: String,
    pub message: String,
    pub cause: Option<String>,
    pub severity: Severity,
    pub context: BTreeMap<String, serde_json::Value>,
}

impl WorkError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            cause: None,
            severity: Severity::Error,
            context: BTreeMap::new(),
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Build the `WorkError` a caught panic inside a worker actor becomes.
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "worker panicked with a non-string payload".to_string()
        };
        Self::new("panic", message).with_severity(Severity::Critical)
    }
}

impl std::fmt::Display for WorkError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

impl std::error::Error for WorkError {}

/// Lets a [`Processor::process`](crate::worker::Processor::process)
/// implementation use `?` against any `anyhow::Error`-returning helper and
/// have it become a retryable `WorkResult::Err` automatically.
impl From<anyhow::Error> for WorkError {
    fn from(err: anyhow::Error) -> Self {
        Self::new("anyhow", err.to_string())
    }
}

/// The outcome of processing one [`Work`] item.
///
/// Exactly one of `value`/`error` is ever present — enforced here by using
/// a tagged enum rather than two optional fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum WorkResult<T> {
    Ok { value: T, work_id: WorkId },
    Err { error: WorkError, work_id: WorkId },
}

impl<T> WorkResult<T> {
    pub fn ok(work_id: WorkId, value: T) -> Self {
        Self::Ok { value, work_id }
    }

    pub fn err(work_id: WorkId, error: WorkError) -> Self {
        Self::Err { error, work_id }
    }

    pub fn work_id(&self) -> WorkId {
        match self {
            Self::Ok { work_id, .. } => *work_id,
            Self::Err { work_id, .. } => *work_id,
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok { .. })
    }

    pub fn is_err(&self) -> bool {
        matches!(self, Self::Err { .. })
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Self::Ok { value, .. } => Some(value),
            Self::Err { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&WorkError> {
        match self {
            Self::Err { error, .. } => Some(error),
            Self::Ok { .. } => None,
        }
    }

    pub fn into_result(self) -> Result<T, WorkError> {
        match self {
            Self::Ok { value, .. } => Ok(value),
            Self::Err { error, .. } => Err(error),
        }
    }
}

/// Ordering helper: pick the higher-severity of two optional errors.
pub fn max_severity(a: Severity, b: Severity) -> Severity {
    match a.cmp(&b) {
        Ordering::Less => b,
        _ => a,
    }
}
