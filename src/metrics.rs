use std::cell::Cell;
use std::time::Instant;

/// Event-loop counters for one runtime.
///
/// Single-threaded like the runtime that owns them, so plain cells suffice.
#[derive(Debug)]
pub(crate) struct Metrics {
    polls: Cell<u64>,
    io_wakeups: Cell<u64>,
    timer_expirations: Cell<u64>,
    fibers_spawned: Cell<u64>,
    fibers_completed: Cell<u64>,
    fiber_panics: Cell<u64>,
    start_time: Instant,
}

fn bump(cell: &Cell<u64>, by: u64) {
    cell.set(cell.get() + by);
}

impl Metrics {
    pub(crate) fn new() -> Self {
        Self {
            polls: Cell::new(0),
            io_wakeups: Cell::new(0),
            timer_expirations: Cell::new(0),
            fibers_spawned: Cell::new(0),
            fibers_completed: Cell::new(0),
            fiber_panics: Cell::new(0),
            start_time: Instant::now(),
        }
    }

    pub(crate) fn record_poll(&self, io_wakeups: usize) {
        bump(&self.polls, 1);
        bump(&self.io_wakeups, io_wakeups as u64);
    }

    pub(crate) fn record_expirations(&self, count: usize) {
        bump(&self.timer_expirations, count as u64);
    }

    pub(crate) fn record_spawn(&self) {
        bump(&self.fibers_spawned, 1);
    }

    pub(crate) fn record_completion(&self) {
        bump(&self.fibers_completed, 1);
    }

    pub(crate) fn record_panic(&self) {
        bump(&self.fiber_panics, 1);
    }

    /// Returns a snapshot of current metrics values.
    pub(crate) fn snapshot(&self, io_count: usize, sleeping: usize) -> MetricsSnapshot {
        MetricsSnapshot {
            polls: self.polls.get(),
            io_wakeups: self.io_wakeups.get(),
            timer_expirations: self.timer_expirations.get(),
            fibers_spawned: self.fibers_spawned.get(),
            fibers_completed: self.fibers_completed.get(),
            fiber_panics: self.fiber_panics.get(),
            io_count,
            sleeping,
            elapsed_seconds: self.start_time.elapsed().as_secs_f64(),
        }
    }
}

/// Snapshot of runtime metrics at a point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSnapshot {
    /// Multiplexer waits performed by the event loop.
    pub polls: u64,
    /// Fibers woken because their handle became ready.
    pub io_wakeups: u64,
    /// Fibers woken because their deadline passed.
    pub timer_expirations: u64,
    pub fibers_spawned: u64,
    pub fibers_completed: u64,
    /// Fiber bodies that panicked (caught and logged).
    pub fiber_panics: u64,
    /// Outstanding I/O registrations right now.
    pub io_count: usize,
    /// Non-system fibers parked on the timer queue right now.
    pub sleeping: usize,
    pub elapsed_seconds: f64,
}

impl MetricsSnapshot {
    /// Fibers still alive (spawned minus completed), event loop included.
    pub fn live_fibers(&self) -> u64 {
        self.fibers_spawned.saturating_sub(self.fibers_completed)
    }

    /// Average number of I/O wakeups delivered per poll.
    pub fn wakeups_per_poll(&self) -> f64 {
        if self.polls > 0 {
            self.io_wakeups as f64 / self.polls as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new();
        let snapshot = metrics.snapshot(0, 0);
        assert_eq!(snapshot.polls, 0);
        assert_eq!(snapshot.io_wakeups, 0);
        assert_eq!(snapshot.timer_expirations, 0);
        assert_eq!(snapshot.live_fibers(), 0);
        assert_eq!(snapshot.wakeups_per_poll(), 0.0);
        assert!(snapshot.elapsed_seconds >= 0.0);
    }

    #[test]
    fn test_metrics_updates() {
        let metrics = Metrics::new();
        metrics.record_spawn();
        metrics.record_spawn();
        metrics.record_completion();
        metrics.record_poll(3);
        metrics.record_poll(1);
        metrics.record_expirations(2);

        let snapshot = metrics.snapshot(1, 2);
        assert_eq!(snapshot.live_fibers(), 1);
        assert_eq!(snapshot.polls, 2);
        assert_eq!(snapshot.io_wakeups, 4);
        assert_eq!(snapshot.wakeups_per_poll(), 2.0);
        assert_eq!(snapshot.timer_expirations, 2);
        assert_eq!(snapshot.io_count, 1);
        assert_eq!(snapshot.sleeping, 2);
    }
}
