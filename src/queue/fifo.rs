use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use super::{PopOutcome, QueueError, WorkQueue};
use crate::work::Work;

/// Plain first-in-first-out [`WorkQueue`].
pub struct FifoQueue<T> {
    items: Mutex<VecDeque<Work<T>>>,
    closed: AtomicBool,
}

impl<T> FifoQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            closed: AtomicBool::new(false),
        }
    }
}

impl<T> Default for FifoQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> WorkQueue<T> for FifoQueue<T> {
    fn push(&self, item: Work<T>) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        self.items.lock().push_back(item);
        Ok(())
    }

    fn pop_one(&self) -> PopOutcome<T> {
        match self.items.lock().pop_front() {
            Some(item) => PopOutcome::Item(item),
            None if self.closed.load(Ordering::Acquire) => PopOutcome::Closed,
            None => PopOutcome::Empty,
        }
    }

    fn pop_batch(&self, n: usize) -> Vec<Work<T>> {
        if n == 0 {
            return Vec::new();
        }
        let mut guard = self.items.lock();
        let take = n.min(guard.len());
        guard.drain(..take).collect()
    }

    fn len(&self) -> usize {
        self.items.lock().len()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
