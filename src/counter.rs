//! Process-wide pending-work counter.
//!
//! Each runtime reports "I have fibers parked on timers" through a
//! [`WorkCounter`]. The host decides from its value whether the process still
//! has work in flight. The counter is injected into every runtime so that
//! independent schedulers (one per thread, or several in a test binary) can
//! either share one counter or keep their own.

use crossbeam::utils::CachePadded;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

lazy_static::lazy_static! {
    static ref GLOBAL: WorkCounter = WorkCounter::new();
}

/// A thread-safe counter of outstanding work sources.
#[derive(Clone, Debug)]
pub struct WorkCounter {
    inner: Arc<CachePadded<AtomicUsize>>,
}

impl WorkCounter {
    /// Creates a new counter starting at zero.
    pub fn new() -> Self {
        WorkCounter {
            inner: Arc::new(CachePadded::new(AtomicUsize::new(0))),
        }
    }

    /// The process-wide counter used by runtimes that were not given one.
    pub fn global() -> WorkCounter {
        GLOBAL.clone()
    }

    /// Registers one more source of pending work.
    pub fn increment(&self) {
        self.inner.fetch_add(1, Ordering::SeqCst);
    }

    /// Removes a source of pending work.
    ///
    /// Returns true if the counter reached zero.
    pub fn decrement(&self) -> bool {
        let prev = self
            .inner
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
        matches!(prev, Ok(1))
    }

    /// Returns the current value of the counter.
    pub fn value(&self) -> usize {
        self.inner.load(Ordering::SeqCst)
    }

    /// Checks if no work is pending.
    pub fn is_idle(&self) -> bool {
        self.value() == 0
    }

    /// Whether both handles point at the same underlying counter.
    pub fn same_as(&self, other: &WorkCounter) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for WorkCounter {
    fn default() -> Self {
        Self::new()
    }
}
