//! De-duplicating, rate-limited work queue
//!
//! The queue keeps three views of an item: queued (FIFO order), dirty
//! (wants processing), and processing (currently held by a worker). An item
//! equal to one already dirty is suppressed; an item re-added while a worker
//! holds it becomes eligible again exactly once when the worker calls
//! [`WorkQueue::done`]. Together with one `get`/`done` pair per worker
//! iteration this yields at-most-one in-flight processing per item.
//!
//! `add_rate_limited` schedules a delayed re-add with per-item exponential
//! backoff; `forget` resets the item's failure history.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::Semaphore;

use crate::utils::BackoffConfig;

/// Work item trait alias: hashable, cloneable, and movable across tasks
pub trait WorkItem: Clone + Eq + Hash + Send + Sync + 'static {}
impl<T: Clone + Eq + Hash + Send + Sync + 'static> WorkItem for T {}

struct QueueState<T> {
    queue: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    shutting_down: bool,
}

impl<T> QueueState<T> {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            dirty: HashSet::new(),
            processing: HashSet::new(),
            shutting_down: false,
        }
    }
}

/// De-duplicating FIFO handing items to a worker pool.
///
/// The semaphore carries one permit per queued item; `shutdown` closes it,
/// which unblocks every waiter. Remaining queued items are still drained
/// before `get` reports shutdown.
pub struct WorkQueue<T> {
    state: Mutex<QueueState<T>>,
    available: Semaphore,
    retries: Mutex<HashMap<T, u32>>,
    backoff: BackoffConfig,
    // Handle to ourselves for the delayed re-add tasks.
    self_ref: Weak<WorkQueue<T>>,
}

impl<T: WorkItem> WorkQueue<T> {
    pub fn new(backoff: BackoffConfig) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            state: Mutex::new(QueueState::new()),
            available: Semaphore::new(0),
            retries: Mutex::new(HashMap::new()),
            backoff,
            self_ref: self_ref.clone(),
        })
    }

    /// Enqueue an item unless an equal one is already pending.
    ///
    /// If the item is currently being processed it is marked dirty instead of
    /// queued; `done` will re-enqueue it once.
    pub fn add(&self, item: T) {
        let mut state = self.state.lock().expect("workqueue poisoned");
        if state.shutting_down || state.dirty.contains(&item) {
            return;
        }
        state.dirty.insert(item.clone());
        if state.processing.contains(&item) {
            return;
        }
        state.queue.push_back(item);
        drop(state);
        self.available.add_permits(1);
    }

    /// Await the next item. Returns `None` once the queue has shut down and
    /// drained.
    pub async fn get(&self) -> Option<T> {
        loop {
            match self.available.acquire().await {
                Ok(permit) => {
                    permit.forget();
                    let mut state = self.state.lock().expect("workqueue poisoned");
                    // A permit always corresponds to a queued item.
                    if let Some(item) = state.queue.pop_front() {
                        state.dirty.remove(&item);
                        state.processing.insert(item.clone());
                        return Some(item);
                    }
                }
                Err(_closed) => {
                    let mut state = self.state.lock().expect("workqueue poisoned");
                    if let Some(item) = state.queue.pop_front() {
                        state.dirty.remove(&item);
                        state.processing.insert(item.clone());
                        return Some(item);
                    }
                    return None;
                }
            }
        }
    }

    /// Release an item after processing. Re-enqueues it if it was re-added
    /// while in flight.
    pub fn done(&self, item: &T) {
        let mut state = self.state.lock().expect("workqueue poisoned");
        state.processing.remove(item);
        if state.dirty.contains(item) {
            state.queue.push_back(item.clone());
            drop(state);
            self.available.add_permits(1);
        }
    }

    /// Schedule a re-add after the item's next backoff delay
    pub fn add_rate_limited(&self, item: T) {
        let attempt = {
            let mut retries = self.retries.lock().expect("workqueue poisoned");
            let count = retries.entry(item.clone()).or_insert(0);
            *count += 1;
            *count
        };

        // The queue is gone once every Arc is dropped; a delayed re-add to a
        // dead queue has nowhere to land anyway.
        let Some(queue) = self.self_ref.upgrade() else {
            return;
        };
        let delay = self.backoff.delay_for(attempt);
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            queue.add(item);
        });
    }

    /// Clear the item's backoff history
    pub fn forget(&self, item: &T) {
        self.retries.lock().expect("workqueue poisoned").remove(item);
    }

    /// Failure count accumulated by `add_rate_limited`
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.retries
            .lock()
            .expect("workqueue poisoned")
            .get(item)
            .copied()
            .unwrap_or(0)
    }

    /// Unblock all waiters. Queued items are still handed out; once drained,
    /// `get` returns `None`.
    pub fn shutdown(&self) {
        self.state
            .lock()
            .expect("workqueue poisoned")
            .shutting_down = true;
        self.available.close();
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("workqueue poisoned").queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
