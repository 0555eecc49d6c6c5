//! Owns a pool of worker actors and drives dispatch in batch or continuous mode.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{interval, Duration, Instant};
use tracing::{debug, info, instrument, warn};

use crate::actor::{spawn_actor, ActorEvent, ActorHandle, ActorState};
use crate::aggregator::ResultAggregator;
use crate::dispatch::DispatchManager;
use crate::queue::{QueueError, WorkQueue};
use crate::work::Work;
use crate::worker::Processor;

/// A pull callback polled once per tick in continuous mode (spec.md §4.5's
/// `workSources`): returns newly available work, or an empty vec if there is
/// none to offer this tick. Ignored entirely in batch mode.
pub type WorkSource<I> = Box<dyn Fn() -> Vec<Work<I>> + Send + Sync>;

/// Batch mode drains the queue once and stops when every actor is idle and
/// the queue is empty; continuous mode keeps polling on a tick until `stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Batch,
    Continuous { poll_interval: Duration },
}

pub struct SupervisorConfig {
    pub worker_count: usize,
    pub mode: ExecutionMode,
    pub actor_mailbox_capacity: usize,
    pub debug: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            worker_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            mode: ExecutionMode::Batch,
            actor_mailbox_capacity: 16,
            debug: false,
        }
    }
}

impl SupervisorConfig {
    pub fn with_worker_count(mut self, n: usize) -> Self {
        self.worker_count = n.max(1);
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_mailbox_capacity(mut self, n: usize) -> Self {
        self.actor_mailbox_capacity = n.max(1);
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Adopt the process-wide debug toggle (`TASKMESH_DEBUG`).
    pub fn with_debug_config(mut self, cfg: crate::config::DebugConfig) -> Self {
        self.debug = cfg.debug;
        self
    }
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("no live workers remain but work is still queued")]
    NoLiveWorkers,
    #[error("shutdown did not complete within the deadline")]
    ShutdownTimeout,
}

/// Runs a pool of actors hosting clones of one [`Processor`], feeding them
/// from a [`WorkQueue`] and collecting results into a [`ResultAggregator`].
pub struct Supervisor<I, O> {
    config: SupervisorConfig,
    dispatch: Arc<DispatchManager<I>>,
    aggregator: Arc<ResultAggregator<O>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    total_dispatched: Arc<AtomicU64>,
    live_actors: Arc<AtomicUsize>,
    actors: Vec<ActorHandle<I>>,
    work_sources: Mutex<Vec<WorkSource<I>>>,
}

impl<I, O> Supervisor<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Spawn `config.worker_count` actors hosting clones of `worker`.
    ///
    /// Each actor starts out unknown to the dispatch manager; it only
    /// becomes eligible for work once its own event-draining task observes
    /// the `Initialized` event it emits on startup, matching spec.md
    /// §4.4's "event-driven: when an actor emits `Initialized` or `Result`,
    /// it is marked idle".
    pub fn start<P>(mut config: SupervisorConfig, worker: P) -> Self
    where
        P: Processor<Input = I, Output = O> + Clone,
    {
        // B1: zero workers defaults to one rather than silently spawning a
        // pool that can never drain its queue.
        config.worker_count = config.worker_count.max(1);

        let dispatch = Arc::new(DispatchManager::new(Vec::new()));
        let aggregator = Arc::new(ResultAggregator::new());
        let live_actors = Arc::new(AtomicUsize::new(config.worker_count));
        let mut actors = Vec::with_capacity(config.worker_count);

        for idx in 0..config.worker_count {
            let (handle, mut rx) = spawn_actor(
                format!("{}-{idx}", P::TYPE),
                worker.clone(),
                config.actor_mailbox_capacity,
            );
            actors.push(handle.clone());
            let dispatch = Arc::clone(&dispatch);
            let aggregator = Arc::clone(&aggregator);
            let live_actors = Arc::clone(&live_actors);
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    match event {
                        ActorEvent::Initialized { name } => {
                            info!(actor = %name, "actor ready");
                            dispatch.mark_idle(handle.clone());
                        }
                        ActorEvent::Result(result) => {
                            aggregator.add(result);
                            dispatch.mark_idle(handle.clone());
                        }
                        ActorEvent::Closed { name } => {
                            info!(actor = %name, "actor closed");
                            break;
                        }
                    }
                }
                live_actors.fetch_sub(1, Ordering::SeqCst);
            });
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            dispatch,
            aggregator,
            shutdown_tx,
            shutdown_rx,
            total_dispatched: Arc::new(AtomicU64::new(0)),
            live_actors,
            actors,
            work_sources: Mutex::new(Vec::new()),
        }
    }

    pub fn aggregator(&self) -> &Arc<ResultAggregator<O>> {
        &self.aggregator
    }

    /// Request shutdown: signals `run` to return, and tells every tracked
    /// actor to shut down. Actors finish in-flight work, emit `Closed`, then
    /// exit; this does not wait for that to happen (see
    /// [`Supervisor::shutdown`] for a variant that does, with a deadline).
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        for handle in self.actors.clone() {
            tokio::spawn(async move {
                handle.shutdown().await;
            });
        }
    }

    /// Like [`Supervisor::stop`], but waits (polling) for every actor to
    /// actually exit, up to `deadline`. Mirrors the teacher's two-phase
    /// `WorkerPool::shutdown`: a second call to `stop`/`shutdown` after this
    /// one returns is a no-op against actors that already exited.
    pub async fn shutdown(&self, deadline: Duration) -> Result<(), SupervisorError> {
        self.stop();
        let start = Instant::now();
        loop {
            if self.live_actors.load(Ordering::SeqCst) == 0 {
                return Ok(());
            }
            if start.elapsed() >= deadline {
                warn!(
                    remaining = self.live_actors.load(Ordering::SeqCst),
                    "shutdown timeout reached"
                );
                return Err(SupervisorError::ShutdownTimeout);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Register a pull callback invoked once per tick in continuous mode
    /// (spec.md §4.5: `registerWorkSource(fn)`). No-op in batch mode.
    pub fn register_work_source(&self, source: impl Fn() -> Vec<Work<I>> + Send + Sync + 'static) {
        self.work_sources.lock().push(Box::new(source));
    }

    /// Enqueue one item onto `queue` (spec.md §4.5: `addWork(w)`). The queue
    /// is injected rather than owned by the supervisor, so this is a thin
    /// convenience wrapper; callers may just as well call `queue.push`
    /// directly.
    pub fn add_work(&self, queue: &dyn WorkQueue<I>, item: Work<I>) -> Result<(), QueueError> {
        queue.push(item)
    }

    /// Enqueue a batch of items onto `queue` (spec.md §4.5: `addWorkItems([])`).
    pub fn add_work_items(
        &self,
        queue: &dyn WorkQueue<I>,
        items: impl IntoIterator<Item = Work<I>>,
    ) -> Result<(), QueueError> {
        for item in items {
            queue.push(item)?;
        }
        Ok(())
    }

    /// Snapshot of every spawned actor's name and current lifecycle state
    /// (spec.md §4.5: `workersStatus`).
    pub fn workers_status(&self) -> Vec<(String, ActorState)> {
        self.actors
            .iter()
            .map(|h| (h.name().to_string(), h.state()))
            .collect()
    }

    /// Drive dispatch against `queue` until the configured mode's stop
    /// condition is reached or [`Supervisor::stop`] is called.
    #[instrument(skip(self, queue), fields(mode = ?self.config.mode))]
    pub async fn run(&self, queue: &dyn WorkQueue<I>) -> Result<(), SupervisorError> {
        let mut shutdown_rx = self.shutdown_rx.clone();
        match self.config.mode {
            ExecutionMode::Batch => {
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }

                    if self.live_actors.load(Ordering::SeqCst) == 0 && !queue.is_empty() {
                        warn!("no live workers remain, queue not drained");
                        return Err(SupervisorError::NoLiveWorkers);
                    }

                    let dispatched = self.dispatch.dispatch(queue).await;
                    self.total_dispatched
                        .fetch_add(dispatched as u64, Ordering::SeqCst);

                    let (ok, err) = self.aggregator.counts();
                    let accounted_for = (ok + err) as u64;
                    if self.config.debug {
                        debug!(
                            dispatched,
                            accounted_for,
                            total_dispatched = self.total_dispatched.load(Ordering::SeqCst),
                            queue_len = queue.len(),
                            idle = self.dispatch.idle_count(),
                            "batch dispatch tick"
                        );
                    }
                    if queue.is_empty() && accounted_for >= self.total_dispatched.load(Ordering::SeqCst)
                    {
                        break;
                    }
                    tokio::task::yield_now().await;
                }
            }
            ExecutionMode::Continuous { poll_interval } => {
                let mut ticker = interval(poll_interval);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            let sources = self.work_sources.lock();
                            for source in sources.iter() {
                                for item in source() {
                                    let _ = queue.push(item);
                                }
                            }
                            drop(sources);
                            self.dispatch.dispatch(queue).await;
                        }
                        _ = shutdown_rx.changed() => {
                            if *shutdown_rx.borrow() {
                                break;
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::FifoQueue;
    use crate::work::{Work, WorkResult};
    use async_trait::async_trait;
    use std::time::Duration as StdDuration;

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

    #[tokio::test]
    async fn batch_mode_drains_queue_and_aggregates_results() {
        let queue: FifoQueue<i64> = FifoQueue::new();
        for i in 0..10 {
            queue.push(Work::new(i)).unwrap();
        }

        let config = SupervisorConfig::default().with_worker_count(3);
        let supervisor = Supervisor::start(config, Doubler);
        supervisor.run(&queue).await.unwrap();

        // give the event-draining tasks a moment to catch up
        tokio::time::sleep(StdDuration::from_millis(20)).await;

        let (ok, err) = supervisor.aggregator().counts();
        assert_eq!(ok, 10);
        assert_eq!(err, 0);
    }

    #[tokio::test]
    async fn continuous_mode_stops_on_stop_signal() {
        let queue: FifoQueue<i64> = FifoQueue::new();
        let config = SupervisorConfig::default()
            .with_worker_count(1)
            .with_mode(ExecutionMode::Continuous {
                poll_interval: StdDuration::from_millis(5),
            });
        let supervisor = Supervisor::start(config, Doubler);

        let handle = {
            let queue = &queue;
            let sup = &supervisor;
            async move { sup.run(queue).await }
        };
        let stopper = async {
            tokio::time::sleep(StdDuration::from_millis(20)).await;
            supervisor.stop();
        };

        let (result, _) = tokio::join!(handle, stopper);
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn workers_status_reports_one_entry_per_actor() {
        let config = SupervisorConfig::default().with_worker_count(3);
        let supervisor = Supervisor::start(config, Doubler);

        // let the per-actor listener tasks observe `Initialized` first
        tokio::time::sleep(StdDuration::from_millis(20)).await;

        let status = supervisor.workers_status();
        assert_eq!(status.len(), 3);
        assert!(status.iter().all(|(_, s)| *s == ActorState::Idle));
    }

    #[tokio::test]
    async fn work_source_feeds_queue_in_continuous_mode() {
        let queue: FifoQueue<i64> = FifoQueue::new();
        let config = SupervisorConfig::default()
            .with_worker_count(1)
            .with_mode(ExecutionMode::Continuous {
                poll_interval: StdDuration::from_millis(5),
            });
        let supervisor = Supervisor::start(config, Doubler);

        let delivered = Arc::new(AtomicUsize::new(0));
        let delivered_for_source = Arc::clone(&delivered);
        supervisor.register_work_source(move || {
            if delivered_for_source.fetch_add(1, Ordering::SeqCst) == 0 {
                vec![Work::new(7)]
            } else {
                Vec::new()
            }
        });

        let handle = {
            let queue = &queue;
            let sup = &supervisor;
            async move { sup.run(queue).await }
        };
        let stopper = async {
            tokio::time::sleep(StdDuration::from_millis(40)).await;
            supervisor.stop();
        };
        let (result, _) = tokio::join!(handle, stopper);
        assert!(result.is_ok());

        let (ok, _) = supervisor.aggregator().counts();
        assert_eq!(ok, 1);
    }

    #[tokio::test]
    async fn shutdown_waits_for_actors_to_exit() {
        let config = SupervisorConfig::default().with_worker_count(2);
        let supervisor = Supervisor::start(config, Doubler);
        tokio::time::sleep(StdDuration::from_millis(20)).await;

        supervisor
            .shutdown(StdDuration::from_millis(500))
            .await
            .unwrap();

        assert!(supervisor
            .workers_status()
            .iter()
            .all(|(_, s)| *s == ActorState::Closed));
    }
}
