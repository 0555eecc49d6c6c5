//! Round-robins queued work across a pool of idle actors.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tracing::trace;

use crate::actor::ActorHandle;
use crate::queue::{PopOutcome, WorkQueue};

/// Tracks which actors are currently idle and feeds them queued work.
///
/// Actors are dispatched round-robin: popped from the front of the idle
/// deque, handed one item, and only pushed back once they re-announce
/// idle (the caller does that by calling [`DispatchManager::mark_idle`]
/// when it observes an actor's outbound channel report it picked up work
/// again, or more commonly, right away for fire-and-forget dispatch).
pub struct DispatchManager<I> {
    idle: Mutex<VecDeque<ActorHandle<I>>>,
}

impl<I> DispatchManager<I> {
    pub fn new(actors: impl IntoIterator<Item = ActorHandle<I>>) -> Self {
        Self {
            idle: Mutex::new(actors.into_iter().collect()),
        }
    }

    /// Number of actors currently considered available for dispatch.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Return an actor to the idle pool (e.g. after its result was observed).
    pub fn mark_idle(&self, handle: ActorHandle<I>) {
        self.idle.lock().push_back(handle);
    }

    /// Drain `queue` into idle actors until either runs dry.
    ///
    /// Returns the number of items actually dispatched. An actor whose
    /// mailbox has closed (it has exited) is dropped rather than requeued.
    pub async fn dispatch(&self, queue: &dyn WorkQueue<I>) -> usize
    where
        I: Send,
    {
        let mut dispatched = 0;
        loop {
            let handle = {
                let mut idle = self.idle.lock();
                match idle.pop_front() {
                    Some(h) => h,
                    None => break,
                }
            };

            if !handle.is_alive() {
                trace!(actor = handle.name(), "dropping dead actor handle");
                continue;
            }

            match queue.pop_one() {
                PopOutcome::Item(work) => {
                    if handle.send_work(work).await.is_ok() {
                        dispatched += 1;
                    }
                    // Not requeued here: the caller re-adds it via
                    // `mark_idle` once it observes the actor idle again.
                }
                PopOutcome::Empty | PopOutcome::Closed => {
                    self.idle.lock().push_front(handle);
                    break;
                }
            }
        }
        dispatched
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{spawn_actor, ActorEvent};
    use crate::queue::FifoQueue;
    use crate::work::Work;
    use crate::worker::Processor;
    use async_trait::async_trait;

    struct Echo;

    #[async_trait]
    impl Processor for Echo {
        const TYPE: &'static str = "echo";
        type Input = i32;
        type Output = i32;

        async fn process(&self, work: Work<i32>) -> crate::work::WorkResult<i32> {
            crate::work::WorkResult::ok(work.id(), *work.payload())
        }
    }

    #[tokio::test]
    async fn dispatches_to_one_of_two_idle_actors_round_robin() {
        let (h1, mut rx1) = spawn_actor("a1", Echo, 4);
        let (h2, mut rx2) = spawn_actor("a2", Echo, 4);
        assert!(matches!(rx1.recv().await, Some(ActorEvent::Initialized { .. })));
        assert!(matches!(rx2.recv().await, Some(ActorEvent::Initialized { .. })));

        let manager = DispatchManager::new(vec![h1, h2]);
        let queue: FifoQueue<i32> = FifoQueue::new();
        queue.push(Work::new(1)).unwrap();
        queue.push(Work::new(2)).unwrap();

        let n = manager.dispatch(&queue).await;
        assert_eq!(n, 2);
        assert_eq!(manager.idle_count(), 0);

        assert!(matches!(rx1.recv().await, Some(ActorEvent::Result(_))));
        assert!(matches!(rx2.recv().await, Some(ActorEvent::Result(_))));
    }

    #[tokio::test]
    async fn dispatch_on_empty_queue_dispatches_nothing() {
        let (h1, mut rx1) = spawn_actor("a1", Echo, 4);
        assert!(matches!(rx1.recv().await, Some(ActorEvent::Initialized { .. })));

        let manager = DispatchManager::new(vec![h1]);
        let queue: FifoQueue<i32> = FifoQueue::new();
        let n = manager.dispatch(&queue).await;
        assert_eq!(n, 0);
        assert_eq!(manager.idle_count(), 1);
    }
}
