//! A bounded, in-process dead-letter queue for unrecoverable work.

use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::error;

type DlqHandler<T> = Box<dyn Fn(&DlqEntry<T>) + Send + Sync>;

/// One dead-lettered item plus the context needed to inspect or retry it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry<T> {
    pub work: T,
    pub error_class: String,
    pub error_message: String,
    pub context: Value,
    pub timestamp: DateTime<Utc>,
    pub metadata: Value,
}

#[derive(Debug, Error)]
pub enum DlqError {
    #[error("persister error: {0}")]
    Persist(String),
}

/// Pluggable backing store for dead-lettered entries.
#[async_trait]
pub trait DlqPersister<T>: Send + Sync {
    async fn persist(&self, entry: &DlqEntry<T>) -> Result<(), DlqError>;
    async fn remove(&self, index: usize) -> Result<(), DlqError>;
    async fn clear(&self) -> Result<(), DlqError>;
}

/// No-op persister; the default when callers only need the in-memory queue.
pub struct InMemoryDlqPersister;

#[async_trait]
impl<T: Send + Sync> DlqPersister<T> for InMemoryDlqPersister {
    async fn persist(&self, _entry: &DlqEntry<T>) -> Result<(), DlqError> {
        Ok(())
    }

    async fn remove(&self, _index: usize) -> Result<(), DlqError> {
        Ok(())
    }

    async fn clear(&self) -> Result<(), DlqError> {
        Ok(())
    }
}

/// Appends one JSON object per line to a file; never rewrites history, so
/// `remove`/`clear` only affect the in-memory queue they're called from.
pub struct FileDlqPersister {
    path: PathBuf,
}

impl FileDlqPersister {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl<T: Serialize + Send + Sync> DlqPersister<T> for FileDlqPersister {
    async fn persist(&self, entry: &DlqEntry<T>) -> Result<(), DlqError> {
        let line = serde_json::to_string(entry).map_err(|e| DlqError::Persist(e.to_string()))?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| DlqError::Persist(e.to_string()))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| DlqError::Persist(e.to_string()))?;
        file.write_all(b"\n")
            .await
            .map_err(|e| DlqError::Persist(e.to_string()))?;
        Ok(())
    }

    async fn remove(&self, _index: usize) -> Result<(), DlqError> {
        Ok(())
    }

    async fn clear(&self) -> Result<(), DlqError> {
        Ok(())
    }
}

/// Aggregate counts returned by [`DeadLetterQueue::stats`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DlqStats {
    pub total: usize,
    pub capacity: usize,
}

/// A bounded queue of unrecoverable work items.
///
/// `add` evicts the oldest entry once `capacity` is reached, persists
/// under the same lock that performs the eviction (so eviction and
/// persistence never interleave with another `add`), then notifies
/// handlers outside the lock with panic isolation identical to
/// [`crate::aggregator::ResultAggregator`]'s subscriber discipline.
pub struct DeadLetterQueue<T> {
    entries: Mutex<VecDeque<DlqEntry<T>>>,
    capacity: usize,
    persister: Box<dyn DlqPersister<T>>,
    handlers: Mutex<Vec<DlqHandler<T>>>,
}

impl<T: Clone + Send + Sync + 'static> DeadLetterQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self::with_persister(capacity, Box::new(InMemoryDlqPersister))
    }

    pub fn with_persister(capacity: usize, persister: Box<dyn DlqPersister<T>>) -> Self {
        Self {
            entries: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            persister,
            handlers: Mutex::new(Vec::new()),
        }
    }

    pub fn on_entry(&self, f: impl Fn(&DlqEntry<T>) + Send + Sync + 'static) {
        self.handlers.lock().push(Box::new(f));
    }

    /// Record one item as unrecoverable.
    pub async fn add(
        &self,
        work: T,
        error_class: impl Into<String>,
        error_message: impl Into<String>,
        context: Value,
        metadata: Value,
    ) -> Result<(), DlqError> {
        let entry = DlqEntry {
            work,
            error_class: error_class.into(),
            error_message: error_message.into(),
            context,
            timestamp: Utc::now(),
            metadata,
        };

        {
            let mut entries = self.entries.lock();
            if entries.len() >= self.capacity {
                entries.pop_front();
            }
            entries.push_back(entry.clone());
        }
        self.persister.persist(&entry).await?;

        let handlers = self.handlers.lock();
        for handler in handlers.iter() {
            if let Err(panic) = std::panic::catch_unwind(AssertUnwindSafe(|| handler(&entry))) {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                error!(panic = %msg, "dead-letter handler panicked, ignoring");
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn filter(&self, predicate: impl Fn(&DlqEntry<T>) -> bool) -> Vec<DlqEntry<T>> {
        self.entries
            .lock()
            .iter()
            .filter(|e| predicate(e))
            .cloned()
            .collect()
    }

    pub fn by_error_kind(&self, kind: &str) -> Vec<DlqEntry<T>> {
        self.filter(|e| e.error_class == kind)
    }

    pub fn by_time_range(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<DlqEntry<T>> {
        self.filter(|e| e.timestamp >= from && e.timestamp <= to)
    }

    /// Replay the entry at `index` through `f`; on success it is removed
    /// from the queue (and from the persister), on failure it stays put.
    pub async fn retry_entry<F, Fut, E>(&self, index: usize, f: F) -> Option<Result<(), E>>
    where
        F: FnOnce(DlqEntry<T>) -> Fut,
        Fut: std::future::Future<Output = Result<(), E>>,
    {
        let entry = self.entries.lock().get(index).cloned()?;
        let outcome = f(entry).await;
        if outcome.is_ok() {
            self.entries.lock().remove(index);
            let _ = self.persister.remove(index).await;
        }
        Some(outcome)
    }

    /// Replay every entry through `f`, oldest first; only entries `f`
    /// succeeds on are removed. Returns the outcome of each attempt.
    pub async fn retry_all<F, Fut, E>(&self, mut f: F) -> Vec<Result<(), E>>
    where
        F: FnMut(DlqEntry<T>) -> Fut,
        Fut: std::future::Future<Output = Result<(), E>>,
    {
        let snapshot: Vec<DlqEntry<T>> = self.entries.lock().iter().cloned().collect();
        let mut outcomes = Vec::with_capacity(snapshot.len());
        let mut survivors = Vec::new();
        for entry in snapshot {
            let outcome = f(entry.clone()).await;
            if outcome.is_err() {
                survivors.push(entry);
            }
            outcomes.push(outcome);
        }
        *self.entries.lock() = survivors.into();
        if outcomes.iter().all(Result::is_ok) {
            let _ = self.persister.clear().await;
        }
        outcomes
    }

    pub async fn clear(&self) -> Result<(), DlqError> {
        self.entries.lock().clear();
        self.persister.clear().await
    }

    pub fn stats(&self) -> DlqStats {
        DlqStats {
            total: self.len(),
            capacity: self.capacity,
        }
    }
}
