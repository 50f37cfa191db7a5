//! Rate-limited, deduplicating work queue
//!
//! Producers (event handlers) push items; a fixed pool of workers pulls them.
//! An item that is already waiting is not queued twice. Failed items come
//! back through [`WorkQueue::add_rate_limited`] with a per-item exponential
//! backoff that is reset by [`WorkQueue::forget`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::debug;

/// Operation requested for a queued record
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum QueueOperation {
    Add,
    Sync,
    Destroy,
}

impl fmt::Display for QueueOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            QueueOperation::Add => "add",
            QueueOperation::Sync => "sync",
            QueueOperation::Destroy => "destroy",
        };
        f.write_str(op)
    }
}

/// A record key (`namespace/name`) and the operation to run on it
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct QueueItem {
    pub key: String,
    pub operation: QueueOperation,
}

impl QueueItem {
    pub fn new(key: impl Into<String>, operation: QueueOperation) -> Self {
        Self {
            key: key.into(),
            operation,
        }
    }
}

/// Per-item exponential backoff: `base * 2^failures`, capped at `max`
#[derive(Clone, Copy, Debug)]
pub struct ExponentialBackoff {
    pub base: Duration,
    pub max: Duration,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(5),
            max: Duration::from_secs(1000),
        }
    }
}

impl ExponentialBackoff {
    /// Delay before retry number `failures` (zero-based)
    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .map_or(self.max, |d| d.min(self.max))
    }
}

struct State<T> {
    pending: VecDeque<T>,
    queued: HashSet<T>,
    failures: HashMap<T, u32>,
    shutting_down: bool,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    available: Notify,
    backoff: ExponentialBackoff,
}

/// Cloneable handle to a shared queue
pub struct WorkQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + 'static,
{
    fn default() -> Self {
        Self::new(ExponentialBackoff::default())
    }
}

impl<T> WorkQueue<T>
where
    T: Clone + Eq + Hash + Send + 'static,
{
    pub fn new(backoff: ExponentialBackoff) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    pending: VecDeque::new(),
                    queued: HashSet::new(),
                    failures: HashMap::new(),
                    shutting_down: false,
                }),
                available: Notify::new(),
                backoff,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, State<T>> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue an item unless it is already waiting or the queue is shut down
    pub fn add(&self, item: T) {
        {
            let mut state = self.state();
            if state.shutting_down || state.queued.contains(&item) {
                return;
            }
            state.queued.insert(item.clone());
            state.pending.push_back(item);
        }
        self.inner.available.notify_one();
    }

    /// Queue an item after its backoff delay and count the failure
    pub fn add_rate_limited(&self, item: T) {
        let delay = {
            let mut state = self.state();
            if state.shutting_down {
                return;
            }
            let failures = state.failures.entry(item.clone()).or_insert(0);
            let delay = self.inner.backoff.delay(*failures);
            *failures = failures.saturating_add(1);
            delay
        };

        debug!(delay_ms = delay.as_millis() as u64, "Requeueing item with backoff");
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(item);
        });
    }

    /// Clear the failure history of an item
    pub fn forget(&self, item: &T) {
        self.state().failures.remove(item);
    }

    /// How many times an item has been requeued since it was last forgotten
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.state().failures.get(item).copied().unwrap_or(0)
    }

    /// Number of items waiting
    pub fn len(&self) -> usize {
        self.state().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for the next item; `None` once the queue is shut down
    pub async fn get(&self) -> Option<T> {
        loop {
            let notified = self.inner.available.notified();
            {
                let mut state = self.state();
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.pending.pop_front() {
                    state.queued.remove(&item);
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    /// Stop handing out items; workers blocked in [`WorkQueue::get`] return `None`
    pub fn shut_down(&self) {
        self.state().shutting_down = true;
        self.inner.available.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }
}
