//! Bounded retry budgets.

use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct FailureWindow {
    opened: Instant,
    count: u32,
}

impl FailureWindow {
    fn is_open(&self, now: Instant, window: Duration) -> bool {
        now.duration_since(self.opened) <= window
    }
}

/// Counts failures per key within a window so that a failure that keeps
/// recurring eventually becomes terminal instead of requeueing forever.
///
/// A failure outside the window starts a fresh count.
#[derive(Debug, Clone)]
pub struct RetryTracker {
    max_retries: u32,
    window: Duration,
    failures: HashMap<String, FailureWindow>,
}

impl RetryTracker {
    pub fn new(max_retries: u32, window: Duration) -> Self {
        Self {
            max_retries,
            window,
            failures: HashMap::new(),
        }
    }

    /// Records one failure for `key`. Returns true once the budget of
    /// `max_retries` retries is spent.
    pub fn record_failure(&mut self, key: &str) -> bool {
        let now = Instant::now();
        let window = self.window;
        let entry = self
            .failures
            .entry(key.to_string())
            .and_modify(|w| {
                if !w.is_open(now, window) {
                    *w = FailureWindow { opened: now, count: 0 };
                }
            })
            .or_insert(FailureWindow { opened: now, count: 0 });
        entry.count += 1;
        entry.count > self.max_retries
    }

    /// Failures recorded for `key` in its current window.
    pub fn failures(&self, key: &str) -> u32 {
        let now = Instant::now();
        match self.failures.get(key) {
            Some(w) if w.is_open(now, self.window) => w.count,
            _ => 0,
        }
    }

    pub fn is_exhausted(&self, key: &str) -> bool {
        self.failures(key) > self.max_retries
    }

    /// Forget `key`, typically after it succeeded.
    pub fn clear(&mut self, key: &str) {
        self.failures.remove(key);
    }

    /// Drops every key whose window has closed.
    pub fn prune(&mut self) {
        let now = Instant::now();
        let window = self.window;
        self.failures.retain(|_, w| w.is_open(now, window));
    }
}
