//! Collects [`WorkResult`]s as they arrive and fans them out to subscribers.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::error;

use crate::work::WorkResult;

type OnNewResult<O> = Box<dyn Fn(&WorkResult<O>) + Send + Sync>;
type OnComplete = Box<dyn Fn(usize, usize) + Send + Sync>;

enum Subscriber<O> {
    OnNewResult(OnNewResult<O>),
    OnNewError(OnNewResult<O>),
    OnComplete(OnComplete),
}

/// Accumulates [`WorkResult`]s and notifies registered subscribers as each
/// one arrives.
///
/// Subscribers are called outside the results lock so a slow or reentrant
/// subscriber never blocks producers pushing new results, and a panicking
/// subscriber is caught and logged rather than allowed to fail the `add`.
pub struct ResultAggregator<O> {
    results: Mutex<Vec<Arc<WorkResult<O>>>>,
    subscribers: Mutex<Vec<Subscriber<O>>>,
}

impl<O> ResultAggregator<O> {
    pub fn new() -> Self {
        Self {
            results: Mutex::new(Vec::new()),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn on_new_result(&self, f: impl Fn(&WorkResult<O>) + Send + Sync + 'static) {
        self.subscribers
            .lock()
            .push(Subscriber::OnNewResult(Box::new(f)));
    }

    pub fn on_new_error(&self, f: impl Fn(&WorkResult<O>) + Send + Sync + 'static) {
        self.subscribers
            .lock()
            .push(Subscriber::OnNewError(Box::new(f)));
    }

    /// Register a callback invoked on every `add`, receiving running
    /// `(ok_count, err_count)` totals.
    pub fn on_complete(&self, f: impl Fn(usize, usize) + Send + Sync + 'static) {
        self.subscribers
            .lock()
            .push(Subscriber::OnComplete(Box::new(f)));
    }

    /// Record one result and notify subscribers.
    pub fn add(&self, result: WorkResult<O>) {
        let is_err = result.is_err();
        // Wrap in an `Arc` so the result lock can be dropped before any
        // subscriber runs: callbacks get a cheap clone of the reference,
        // never the results mutex itself.
        let latest = Arc::new(result);
        self.results.lock().push(Arc::clone(&latest));
        let (ok_count, err_count) = self.counts();

        let guard = self.subscribers.lock();
        for sub in guard.iter() {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| match sub {
                Subscriber::OnNewResult(f) => f(&latest),
                Subscriber::OnNewError(f) => {
                    if is_err {
                        f(&latest)
                    }
                }
                Subscriber::OnComplete(f) => f(ok_count, err_count),
            }));
            if let Err(panic) = outcome {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                error!(panic = %msg, "aggregator subscriber panicked, ignoring");
            }
        }
    }

    pub fn counts(&self) -> (usize, usize) {
        let results = self.results.lock();
        let ok = results.iter().filter(|r| r.is_ok()).count();
        (ok, results.len() - ok)
    }

    pub fn len(&self) -> usize {
        self.results.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every `Ok` value recorded so far, in arrival order.
    pub fn oks(&self) -> Vec<O>
    where
        O: Clone,
    {
        self.results
            .lock()
            .iter()
            .filter_map(|r| r.value().cloned())
            .collect()
    }

    /// Snapshot of every recorded result, in arrival order.
    pub fn snapshot(&self) -> Vec<WorkResult<O>>
    where
        O: Clone,
    {
        self.results.lock().iter().map(|r| (**r).clone()).collect()
    }
}

impl<O> Default for ResultAggregator<O> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::work::{WorkError, WorkId};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn tracks_ok_and_err_counts_separately() {
        let agg: ResultAggregator<i32> = ResultAggregator::new();
        agg.add(WorkResult::ok(WorkId::new(), 1));
        agg.add(WorkResult::err(WorkId::new(), WorkError::new("k", "m")));
        agg.add(WorkResult::ok(WorkId::new(), 2));

        assert_eq!(agg.counts(), (2, 1));
        assert_eq!(agg.oks(), vec![1, 2]);
    }

    #[test]
    fn notifies_subscribers_in_arrival_order() {
        let agg: ResultAggregator<i32> = ResultAggregator::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        agg.on_new_result(move |r| seen2.lock().push(*r.value().unwrap()));

        agg.add(WorkResult::ok(WorkId::new(), 10));
        agg.add(WorkResult::ok(WorkId::new(), 20));

        assert_eq!(*seen.lock(), vec![10, 20]);
    }

    #[test]
    fn on_new_error_only_fires_for_errors() {
        let agg: ResultAggregator<i32> = ResultAggregator::new();
        let err_count = Arc::new(AtomicUsize::new(0));
        let c2 = Arc::clone(&err_count);
        agg.on_new_error(move |_| {
            c2.fetch_add(1, Ordering::SeqCst);
        });

        agg.add(WorkResult::ok(WorkId::new(), 1));
        agg.add(WorkResult::err(WorkId::new(), WorkError::new("k", "m")));

        assert_eq!(err_count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_subscriber_is_caught_and_does_not_break_add() {
        let agg: ResultAggregator<i32> = ResultAggregator::new();
        agg.on_new_result(|_| panic!("subscriber bug"));

        agg.add(WorkResult::ok(WorkId::new(), 1));
        agg.add(WorkResult::ok(WorkId::new(), 2));

        assert_eq!(agg.len(), 2);
        assert_eq!(agg.counts(), (2, 0));
    }
}
