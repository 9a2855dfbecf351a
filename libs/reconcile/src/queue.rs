//! Per-identity work queue.
//!
//! Semantics:
//! - A key queued several times before it is picked up is processed once.
//! - A key handed to a worker is "processing" until [`WorkQueue::done`];
//!   adds during that time mark it dirty and it is queued again on `done`.
//! - A key holds at most one delayed add: a later deadline is absorbed by a
//!   pending earlier one, an earlier deadline replaces it.
//! - Failed keys are re-queued with exponential backoff via
//!   [`WorkQueue::add_rate_limited`] until [`WorkQueue::forget`] resets them.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tokio::time::Instant;

use crate::BackoffPolicy;

struct QueueState<K> {
    queue: VecDeque<K>,
    dirty: HashSet<K>,
    processing: HashSet<K>,
    failures: HashMap<K, u32>,
    delayed: HashMap<K, Delayed>,
    shutting_down: bool,
}

struct Delayed {
    deadline: Instant,
    timer: AbortHandle,
}

struct Inner<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
    backoff: BackoffPolicy,
}

/// Deduplicating, rate-limited work queue. Cheap to clone.
pub struct WorkQueue<K> {
    inner: Arc<Inner<K>>,
}

impl<K> Clone for WorkQueue<K> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Debug + 'static,
{
    pub fn new(backoff: BackoffPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState {
                    queue: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    delayed: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                backoff,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, QueueState<K>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue a key for processing.
    pub fn add(&self, key: K) {
        let mut state = self.state();
        if state.shutting_down || state.dirty.contains(&key) {
            return;
        }
        state.dirty.insert(key.clone());
        if state.processing.contains(&key) {
            // Re-queued by `done`.
            return;
        }
        state.queue.push_back(key);
        drop(state);
        self.inner.notify.notify_one();
    }

    /// Queue a key after `delay`.
    pub fn add_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            self.add(key);
            return;
        }
        let deadline = Instant::now() + delay;
        let mut state = self.state();
        if state.shutting_down
            || state
                .delayed
                .get(&key)
                .is_some_and(|pending| pending.deadline <= deadline)
        {
            return;
        }

        let queue = self.clone();
        let timer_key = key.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            queue.fire(timer_key, deadline);
        })
        .abort_handle();
        if let Some(replaced) = state.delayed.insert(key, Delayed { deadline, timer }) {
            replaced.timer.abort();
        }
    }

    fn fire(&self, key: K, deadline: Instant) {
        {
            let mut state = self.state();
            if !state.delayed.get(&key).is_some_and(|d| d.deadline == deadline) {
                return;
            }
            state.delayed.remove(&key);
        }
        self.add(key);
    }

    /// Number of keys with a delayed add pending.
    pub fn scheduled(&self) -> usize {
        self.state().delayed.len()
    }

    /// Queue a key after its per-key backoff delay and bump its failure count.
    pub fn add_rate_limited(&self, key: K) -> Duration {
        let attempt = {
            let mut state = self.state();
            let count = state.failures.entry(key.clone()).or_insert(0);
            let attempt = *count;
            *count += 1;
            attempt
        };
        let delay = self.inner.backoff.delay(attempt);
        self.add_after(key, delay);
        delay
    }

    /// Reset the failure count of a key.
    pub fn forget(&self, key: &K) {
        self.state().failures.remove(key);
    }

    /// Number of consecutive rate-limited requeues of a key.
    pub fn failures(&self, key: &K) -> u32 {
        self.state().failures.get(key).copied().unwrap_or(0)
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let notified = self.inner.notify.notified();
            {
                let mut state = self.state();
                if state.shutting_down {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Mark a key as no longer being processed.
    pub fn done(&self, key: &K) {
        let mut state = self.state();
        state.processing.remove(key);
        if state.dirty.contains(key) && !state.shutting_down {
            state.queue.push_back(key.clone());
            drop(state);
            self.inner.notify.notify_one();
        }
    }

    /// Stop handing out keys and wake every waiting worker.
    pub fn shutdown(&self) {
        {
            let mut state = self.state();
            state.shutting_down = true;
            for (_, pending) in state.delayed.drain() {
                pending.timer.abort();
            }
        }
        self.inner.notify.notify_waiters();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }

    /// Number of keys waiting to be picked up.
    pub fn len(&self) -> usize {
        self.state().queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
