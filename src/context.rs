//! Context handed to every fiber body.
//!
//! All blocking entry points live here: they can only suspend the fiber
//! they are called from, so they need its yielder.

use crate::counter::WorkCounter;
use crate::error::{FiberError, Result};
use crate::fiber::{FiberId, FiberKind, FiberYielder, YieldType};
use crate::metrics::MetricsSnapshot;
use crate::poller::Interest;
use crate::runtime::{Inner, millis};
use crate::timer::now_ms;
use std::os::fd::RawFd;
use std::rc::Rc;

/// Capabilities of the running fiber.
pub struct Context<'a> {
    inner: &'a Rc<Inner>,
    id: FiberId,
    kind: FiberKind,
    yielder: &'a FiberYielder,
}

impl<'a> Context<'a> {
    pub(crate) fn new(inner: &'a Rc<Inner>, id: FiberId, kind: FiberKind, yielder: &'a FiberYielder) -> Self {
        Context {
            inner,
            id,
            kind,
            yielder,
        }
    }

    pub(crate) fn inner(&self) -> &'a Rc<Inner> {
        self.inner
    }

    /// Handle of the fiber this context belongs to.
    pub fn id(&self) -> FiberId {
        self.id
    }

    pub fn kind(&self) -> FiberKind {
        self.kind
    }

    /// Parks the fiber until something marks it ready.
    fn suspend(&self) {
        self.yielder.suspend(YieldType::Wait);
    }

    /// Moves the fiber to the back of the ready queue.
    ///
    /// Returns how many other fibers ran before it was resumed.
    pub fn yield_now(&self) -> usize {
        let before = self.inner.sched.borrow().switched();
        self.yielder.suspend(YieldType::Normal);
        let after = self.inner.sched.borrow().switched();
        after.saturating_sub(before + 1) as usize
    }

    /// Suspends until `fd` is readable.
    ///
    /// Returns immediately with `Ok(())` if the multiplexer cannot watch
    /// `fd`; the caller's next read reports the real condition.
    ///
    /// # Errors
    ///
    /// [`FiberError::HandleOutOfRange`] if `fd` is outside the readiness
    /// table, [`FiberError::HandleBusy`] if another fiber already waits on
    /// it, [`FiberError::SystemFiber`] when called from the event loop.
    pub fn wait_readable(&self, fd: RawFd) -> Result<()> {
        self.wait_for(fd, Interest::Readable)
    }

    /// Suspends until `fd` is writable. Same contract as [`wait_readable`](Self::wait_readable).
    pub fn wait_writable(&self, fd: RawFd) -> Result<()> {
        self.wait_for(fd, Interest::Writable)
    }

    fn wait_for(&self, fd: RawFd, interest: Interest) -> Result<()> {
        if self.kind.is_system() {
            return Err(FiberError::SystemFiber(self.id));
        }
        let io = self.inner.io_or_abort();
        let registered = io.borrow_mut().register_waiter(fd, interest, self.id)?;
        if !registered {
            return Ok(());
        }
        self.inner.event_loop_or_abort(io);

        self.suspend();

        // Readiness already cleared the slot; anything else that woke us
        // (close_handle, schedule) leaves it to us.
        io.borrow_mut().cancel_waiter(fd, interest, self.id);
        Ok(())
    }

    /// Suspends for at least `milliseconds` and returns how many
    /// milliseconds late the fiber woke up.
    ///
    /// Returns `0` when resumed before the deadline by an explicit
    /// [`schedule`](Self::schedule) or [`reset_timer`](Self::reset_timer).
    pub fn delay(&self, milliseconds: u64) -> u64 {
        let io = self.inner.io_or_abort();
        let deadline = now_ms().saturating_add(millis(milliseconds));
        {
            let mut state = io.borrow_mut();
            let mut sched = self.inner.sched.borrow_mut();
            state.add_sleeper(&mut sched, self.id, deadline, &self.inner.work);
        }
        if !self.kind.is_system() {
            self.inner.event_loop_or_abort(io);
        }

        self.suspend();

        {
            let mut state = io.borrow_mut();
            let mut sched = self.inner.sched.borrow_mut();
            state.remove_sleeper(&mut sched, self.id, &self.inner.work);
        }
        let now = now_ms();
        if now > deadline { (now - deadline) as u64 } else { 0 }
    }

    /// [`delay`](Self::delay) in whole seconds; the overrun is in seconds too.
    pub fn sleep(&self, seconds: u64) -> u64 {
        self.delay(seconds.saturating_mul(1000)) / 1000
    }

    /// Spawns a fiber on this thread's runtime and makes it ready.
    pub fn spawn<F>(&self, body: F) -> Result<FiberId>
    where
        F: FnOnce(&Context<'_>) + 'static,
    {
        self.inner.spawn(body)
    }

    /// Creates a timer fiber that runs `callback` after `milliseconds`.
    ///
    /// The fiber is not scheduled: start it with [`schedule`](Self::schedule)
    /// or [`reset_timer`](Self::reset_timer). The deadline is fixed at
    /// creation time.
    pub fn create_timer<F>(&self, milliseconds: u64, callback: F) -> Result<FiberId>
    where
        F: FnOnce(&Context<'_>) + 'static,
    {
        self.inner.io_or_abort();
        self.inner.create_timer(milliseconds, callback)
    }

    /// Moves a timer fiber's deadline to `milliseconds` from now and makes
    /// it ready so it re-evaluates the new deadline.
    pub fn reset_timer(&self, id: FiberId, milliseconds: u64) -> Result<()> {
        let io = self.inner.io_or_abort();
        self.inner.reset_timer(io, id, milliseconds)
    }

    /// Marks a created or parked fiber ready to run.
    pub fn schedule(&self, id: FiberId) -> Result<()> {
        self.inner.schedule(id)
    }

    /// Asks the event loop to exit after its current iteration.
    pub fn request_stop(&self) {
        let io = self.inner.io_or_abort();
        self.inner.request_stop(io);
    }

    /// Drops every multiplexer registration of `fd` and wakes its waiter.
    /// Call before closing the descriptor.
    pub fn close_handle(&self, fd: RawFd) {
        self.inner.close_handle(fd);
    }

    pub fn increment_io_count(&self) {
        let io = self.inner.io_or_abort();
        self.inner.adjust_io_count(io, true);
    }

    pub fn decrement_io_count(&self) {
        let io = self.inner.io_or_abort();
        self.inner.adjust_io_count(io, false);
    }

    pub fn io_count(&self) -> usize {
        self.inner.io_count()
    }

    pub fn sleeping_count(&self) -> usize {
        self.inner.sleeping_count()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.snapshot()
    }

    pub fn work_counter(&self) -> &WorkCounter {
        &self.inner.work
    }
}

impl std::fmt::Debug for Context<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}
