use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;

/// One unit of work: a request plus the attempt it was enqueued under.
///
/// The attempt travels with the item so a worker that dequeues an item after
/// the request was retried can detect it is executing a superseded attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WorkItem {
    pub request_id: u64,
    pub attempt: u32,
}

/// Minimal queue contract the worker pool consumes. The in-process
/// implementation below backs the CLI and tests; a broker-backed
/// implementation can slot in behind the same trait.
pub trait WorkQueue: Send + Sync {
    fn push(&self, item: WorkItem) -> Result<()>;

    /// Blocks up to `timeout` for the next item; `None` on timeout or after
    /// the queue is closed and drained.
    fn pop(&self, timeout: Duration) -> Option<WorkItem>;

    fn ack(&self, item: &WorkItem);

    /// Returns an item the worker could not finish processing.
    fn nack(&self, item: WorkItem);

    /// True once no further items will ever arrive; lets workers exit.
    fn is_closed(&self) -> bool;
}

struct QueueState {
    items: VecDeque<WorkItem>,
    closed: bool,
}

/// Mutex-and-condvar queue for single-process deployments.
pub struct InProcessQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl InProcessQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }

    /// After close, pushes are rejected and pops drain what remains.
    pub fn close(&self) {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        state.closed = true;
        self.ready.notify_all();
    }

    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .items
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InProcessQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkQueue for InProcessQueue {
    fn push(&self, item: WorkItem) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if state.closed {
            anyhow::bail!("queue is closed");
        }
        state.items.push_back(item);
        self.ready.notify_one();
        Ok(())
    }

    fn pop(&self, timeout: Duration) -> Option<WorkItem> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if state.closed {
                return None;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let (next, result) = self
                .ready
                .wait_timeout(state, remaining)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            state = next;
            if result.timed_out() && state.items.is_empty() {
                return None;
            }
        }
    }

    fn ack(&self, _item: &WorkItem) {
        // Delivery is at-most-once in process; nothing to settle.
    }

    fn nack(&self, item: WorkItem) {
        let mut state = self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        if !state.closed {
            state.items.push_back(item);
            self.ready.notify_one();
        }
    }

    fn is_closed(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .closed
    }
}
