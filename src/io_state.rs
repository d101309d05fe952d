//! Per-thread fiber I/O state.
//!
//! [`IoState`] is the aggregate the event loop and the blocking entry points
//! share: the multiplexer, the readiness table, the timer queue and the
//! counters derived from them. It is created lazily by the runtime and never
//! leaves the thread that created it.

use crate::counter::WorkCounter;
use crate::error::Result;
use crate::fiber::{FiberId, FiberKind};
use crate::poller::{Interest, Multiplexer, Readiness};
use crate::readiness::ReadinessTable;
use crate::scheduler::Scheduler;
use crate::timer::TimerQueue;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

pub(crate) struct IoState {
    poller: Box<dyn Multiplexer>,
    pub(crate) table: ReadinessTable,
    /// Outstanding I/O registrations. Equals `table.occupied()` unless the
    /// host adjusted it through `increment_io_count`/`decrement_io_count`.
    pub(crate) io_count: usize,
    /// The live event-loop fiber. Cleared when the loop exits.
    pub(crate) event_loop: Option<FiberId>,
    pub(crate) timers: TimerQueue,
    /// Non-system fibers currently parked in `timers`.
    pub(crate) sleeping: usize,
    pub(crate) stop_requested: bool,
    /// Reused between polls.
    ready: Vec<Readiness>,
}

impl IoState {
    pub(crate) fn new(poller: Box<dyn Multiplexer>, capacity: usize) -> Self {
        IoState {
            poller,
            table: ReadinessTable::new(capacity),
            io_count: 0,
            event_loop: None,
            timers: TimerQueue::new(),
            sleeping: 0,
            stop_requested: false,
            ready: Vec::new(),
        }
    }

    /// Records `fiber` as the waiter on `fd` and arms a one-shot interest.
    ///
    /// Returns `Ok(false)` when the multiplexer refuses the handle; the
    /// caller must then return without suspending.
    pub(crate) fn register_waiter(
        &mut self,
        fd: RawFd,
        interest: Interest,
        fiber: FiberId,
    ) -> Result<bool> {
        self.table.check_vacant(fd)?;
        if let Err(err) = self.poller.register(fd, interest) {
            tracing::info!(fd, ?interest, error = %err, "handle is not pollable, not waiting");
            return Ok(false);
        }
        self.table.insert(fd, fiber)?;
        self.io_count += 1;
        Ok(true)
    }

    /// Readiness callback: disarms the interest and releases the waiter.
    fn on_ready(&mut self, event: Readiness) -> Option<FiberId> {
        if let Err(err) = self.poller.deregister(event.fd, event.interest) {
            tracing::debug!(fd = event.fd, error = %err, "deregister after readiness failed");
        }
        let fiber = self.table.take(event.fd)?;
        self.io_count = self.io_count.saturating_sub(1);
        Some(fiber)
    }

    /// Drops the registration of a waiter that was resumed by something
    /// other than readiness.
    pub(crate) fn cancel_waiter(&mut self, fd: RawFd, interest: Interest, fiber: FiberId) -> bool {
        if self.table.waiter(fd) != Some(fiber) {
            return false;
        }
        self.on_ready(Readiness { fd, interest });
        true
    }

    /// Waits on the multiplexer and marks every fiber whose handle became
    /// ready. Returns how many fibers were woken.
    pub(crate) fn poll(&mut self, sched: &mut Scheduler, timeout: Option<Duration>) -> io::Result<usize> {
        let mut ready = std::mem::take(&mut self.ready);
        ready.clear();
        let result = self.poller.poll(&mut ready, timeout);

        let mut woken = 0;
        if result.is_ok() {
            for event in ready.drain(..) {
                if let Some(fiber) = self.on_ready(event) {
                    tracing::trace!(fd = event.fd, fiber = %fiber, "handle ready");
                    if sched.mark_ready(fiber) {
                        woken += 1;
                    }
                }
            }
        }
        self.ready = ready;
        result.map(|()| woken)
    }

    /// Removes `fd` from the multiplexer and releases its waiter, if any.
    pub(crate) fn close_handle(&mut self, sched: &mut Scheduler, fd: RawFd) -> Option<FiberId> {
        if let Err(err) = self.poller.remove(fd) {
            tracing::debug!(fd, error = %err, "removing handle from multiplexer failed");
        }
        let fiber = self.table.take(fd)?;
        self.io_count = self.io_count.saturating_sub(1);
        sched.mark_ready(fiber);
        Some(fiber)
    }

    /// Parks `id` on the timer queue until `deadline`.
    ///
    /// A fiber already parked is moved, not counted twice.
    pub(crate) fn add_sleeper(
        &mut self,
        sched: &mut Scheduler,
        id: FiberId,
        deadline: i64,
        work: &WorkCounter,
    ) {
        let Some(fiber) = sched.fiber_mut(id) else {
            return;
        };
        let was_parked = match fiber.timer_key.take() {
            Some(key) => self.timers.remove(key).is_some(),
            None => false,
        };
        fiber.timer_key = Some(self.timers.insert(deadline, id));

        if !was_parked && !fiber.kind.is_system() {
            self.sleeping += 1;
            if self.sleeping == 1 {
                work.increment();
            }
        }
    }

    /// Detaches `id` from the timer queue if it is parked there.
    pub(crate) fn remove_sleeper(&mut self, sched: &mut Scheduler, id: FiberId, work: &WorkCounter) -> bool {
        let Some(fiber) = sched.fiber_mut(id) else {
            return false;
        };
        let Some(key) = fiber.timer_key.take() else {
            return false;
        };
        let kind = fiber.kind;
        self.timers.remove(key);
        self.release_sleeper(kind, work);
        true
    }

    /// Wakes every parked fiber whose deadline is at or before `now`, in
    /// deadline order. Returns how many were woken.
    pub(crate) fn expire_timers(&mut self, sched: &mut Scheduler, now: i64, work: &WorkCounter) -> usize {
        let mut expired = 0;
        while let Some(id) = self.timers.pop_expired(now) {
            let Some(fiber) = sched.fiber_mut(id) else {
                continue;
            };
            fiber.timer_key = None;
            let kind = fiber.kind;
            self.release_sleeper(kind, work);
            sched.mark_ready(id);
            expired += 1;
        }
        expired
    }

    fn release_sleeper(&mut self, kind: FiberKind, work: &WorkCounter) {
        if kind.is_system() || self.sleeping == 0 {
            return;
        }
        self.sleeping -= 1;
        if self.sleeping == 0 {
            work.decrement();
        }
    }

    /// Gives back the pending-work unit of fibers abandoned on the timer queue.
    pub(crate) fn release_work(&mut self, work: &WorkCounter) {
        if self.sleeping > 0 {
            self.sleeping = 0;
            work.decrement();
        }
    }
}
