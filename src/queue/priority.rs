use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{PopOutcome, QueueError, WorkQueue};
use crate::work::Work;

/// Priority classes, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PriorityClass {
    Critical,
    High,
    Normal,
    Low,
    Background,
}

impl PriorityClass {
    const ALL: [PriorityClass; 5] = [
        Self::Critical,
        Self::High,
        Self::Normal,
        Self::Low,
        Self::Background,
    ];

    /// The next class up, if any (used for age promotion).
    fn promoted(self) -> Option<Self> {
        match self {
            Self::Critical => None,
            Self::High => Some(Self::Critical),
            Self::Normal => Some(Self::High),
            Self::Low => Some(Self::Normal),
            Self::Background => Some(Self::Low),
        }
    }
}

struct Entry<T> {
    work: Work<T>,
    enqueued_at: Instant,
}

/// A [`WorkQueue`] with five priority sub-queues and optional age-based
/// promotion: an item that has waited past a threshold moves up one class.
pub struct PriorityQueue<T> {
    lanes: Mutex<[VecDeque<Entry<T>>; 5]>,
    closed: AtomicBool,
}

impl<T> PriorityQueue<T> {
    pub fn new() -> Self {
        Self {
            lanes: Mutex::new([
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
            ]),
            closed: AtomicBool::new(false),
        }
    }

    fn index(class: PriorityClass) -> usize {
        PriorityClass::ALL.iter().position(|c| *c == class).unwrap()
    }

    pub fn push_with_priority(&self, item: Work<T>, class: PriorityClass) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        self.lanes.lock()[Self::index(class)].push_back(Entry {
            work: item,
            enqueued_at: Instant::now(),
        });
        Ok(())
    }

    /// Move any item that has waited longer than `threshold` up one
    /// priority class. Call periodically (the supervisor's dispatch tick).
    pub fn promote_aged(&self, threshold: Duration) {
        let now = Instant::now();
        let mut lanes = self.lanes.lock();
        // Walk from highest to lowest class so each lane is scanned and
        // promoted from before any promotion lands into it — one class
        // per item per call, never a same-pass cascade to Critical.
        for class in PriorityClass::ALL.iter() {
            let Some(target) = class.promoted() else {
                continue;
            };
            let idx = Self::index(*class);
            let mut i = 0;
            let mut promoted = Vec::new();
            while i < lanes[idx].len() {
                if now.duration_since(lanes[idx][i].enqueued_at) > threshold {
                    promoted.push(lanes[idx].remove(i).unwrap());
                } else {
                    i += 1;
                }
            }
            let target_idx = Self::index(target);
            for entry in promoted {
                lanes[target_idx].push_back(entry);
            }
        }
    }

    pub fn len_in(&self, class: PriorityClass) -> usize {
        self.lanes.lock()[Self::index(class)].len()
    }
}

impl<T> Default for PriorityQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> WorkQueue<T> for PriorityQueue<T> {
    /// Pushes at [`PriorityClass::Normal`]. Use [`PriorityQueue::push_with_priority`]
    /// to pick an explicit class.
    fn push(&self, item: Work<T>) -> Result<(), QueueError> {
        self.push_with_priority(item, PriorityClass::Normal)
    }

    fn pop_one(&self) -> PopOutcome<T> {
        let mut lanes = self.lanes.lock();
        for class in PriorityClass::ALL {
            if let Some(entry) = lanes[Self::index(class)].pop_front() {
                return PopOutcome::Item(entry.work);
            }
        }
        if self.closed.load(Ordering::Acquire) {
            PopOutcome::Closed
        } else {
            PopOutcome::Empty
        }
    }

    fn pop_batch(&self, n: usize) -> Vec<Work<T>> {
        if n == 0 {
            return Vec::new();
        }
        let mut lanes = self.lanes.lock();
        let mut out = Vec::with_capacity(n);
        for class in PriorityClass::ALL {
            while out.len() < n {
                match lanes[Self::index(class)].pop_front() {
                    Some(entry) => out.push(entry.work),
                    None => break,
                }
            }
            if out.len() == n {
                break;
            }
        }
        out
    }

    fn len(&self) -> usize {
        self.lanes.lock().iter().map(|l| l.len()).sum()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
