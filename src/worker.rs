//! The user-code boundary: one fallible method mapping `Work` to `WorkResult`.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::work::{Work, WorkResult};

/// A worker processes one [`Work`] item per call.
///
/// Implementations must be safe to instantiate once per actor and invoked
/// from a single task — the framework never calls `process` concurrently
/// on the same instance. Payload types are opaque to the framework beyond
/// the (de)serialization bound needed to cross the workflow engine's JSON
/// data bus.
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    /// Identifier used to look this worker type up in a [`crate::supervisor::SupervisorConfig`]
    /// worker-pool spec or a workflow [`crate::workflow::Job`]'s `runs_with`.
    const TYPE: &'static str;

    type Input: Serialize + DeserializeOwned + Send + 'static;
    type Output: Serialize + DeserializeOwned + Send + 'static;

    /// Process one work item. Panics inside this method are caught by the
    /// hosting actor and turned into an `Err` result — implementors do not
    /// need to catch their own panics.
    async fn process(&self, work: Work<Self::Input>) -> WorkResult<Self::Output>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::{WorkError, WorkId};

    struct Doubler;

    #[async_trait]
    impl Processor for Doubler {
        const TYPE: &'static str = "doubler";
        type Input = i64;
        type Output = i64;

        async fn process(&self, work: Work<i64>) -> WorkResult<i64> {
            let id = work.id();
            let n = *work.payload();
            if n == 5 {
                return WorkResult::err(id, WorkError::new("bad_input", "Cannot process value 5"));
            }
            WorkResult::ok(id, n * 2)
        }
    }

    #[tokio::test]
    async fn processes_and_reports_error_by_value() {
        let worker = Doubler;
        let ok = worker.process(Work::new(4)).await;
        assert_eq!(*ok.value().unwrap(), 8);

        let err = worker.process(Work::new(5)).await;
        assert_eq!(err.error().unwrap().message, "Cannot process value 5");
        let _ = WorkId::new();
    }
}
