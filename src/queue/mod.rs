//! Thread-safe FIFO (and priority) queues of [`Work`].

mod fifo;
mod priority;

pub use fifo::FifoQueue;
pub use priority::{PriorityClass, PriorityQueue};

use crate::work::Work;

/// Errors raised by queue operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,
}

/// Result of a single-item pop.
#[derive(Debug)]
pub enum PopOutcome<T> {
    Item(Work<T>),
    Empty,
    Closed,
}

/// The queue-injection interface (spec.md §6): anything implementing this
/// can be handed to a [`crate::supervisor::Supervisor`].
pub trait WorkQueue<T>: Send + Sync {
    /// Enqueue one item. Fails if the queue has been closed.
    fn push(&self, item: Work<T>) -> Result<(), QueueError>;

    /// Pop one item without blocking.
    fn pop_one(&self) -> PopOutcome<T>;

    /// Pop up to `n` items without blocking. May return fewer than `n`,
    /// including zero, without that meaning the queue is closed.
    fn pop_batch(&self, n: usize) -> Vec<Work<T>>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close the queue: further `push` calls fail; pending items may still
    /// be popped until drained.
    fn close(&self);

    fn is_closed(&self) -> bool;
}
