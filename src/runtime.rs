//! Per-thread fiber runtime.
//!
//! A [`Runtime`] is the explicit context object of one OS thread: it owns
//! the fibers, the ready queue and (once an I/O or timer entry point is
//! first used) the fiber I/O state with its event-loop fiber. It is neither
//! `Send` nor `Sync`, so everything it owns is reached only from the thread
//! that created it.

use crate::config::FiberConfig;
use crate::context::Context;
use crate::counter::WorkCounter;
use crate::error::{FiberError, Result};
use crate::event_loop;
use crate::fiber::{self, FiberId, FiberKind, FiberStatus, panic_message};
use crate::io_state::IoState;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::poller::{MioPoller, Multiplexer};
use crate::scheduler::Scheduler;
use crate::timer::now_ms;
use std::cell::{Cell, OnceCell, RefCell};
use std::io;
use std::os::fd::RawFd;
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};
use std::rc::Rc;

/// Builds the multiplexer for a runtime, given the readiness table capacity.
pub type MultiplexerFactory = Box<dyn FnOnce(usize) -> io::Result<Box<dyn Multiplexer>>>;

thread_local! {
    static RUNNING: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as driving a runtime for as long as it lives.
struct RunGuard;

impl RunGuard {
    fn enter() -> Result<Self> {
        if RUNNING.with(|running| running.replace(true)) {
            return Err(FiberError::AlreadyRunning);
        }
        Ok(RunGuard)
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        RUNNING.with(|running| running.set(false));
    }
}

pub(crate) fn millis(ms: u64) -> i64 {
    i64::try_from(ms).unwrap_or(i64::MAX)
}

fn abort_on(err: FiberError) -> ! {
    tracing::error!(error = %err, "fiber I/O state initialization failed");
    std::process::abort();
}

/// State shared by the runtime handle and every fiber context.
pub(crate) struct Inner {
    pub(crate) config: FiberConfig,
    pub(crate) sched: RefCell<Scheduler>,
    io: OnceCell<RefCell<IoState>>,
    pub(crate) work: WorkCounter,
    pub(crate) metrics: Metrics,
    multiplexer: RefCell<Option<MultiplexerFactory>>,
    /// Set when the multiplexer could not be created; later initializations
    /// report the same failure instead of falling back to another poller.
    multiplexer_failure: RefCell<Option<(io::ErrorKind, String)>>,
    /// Whether an event-loop fiber was ever spawned for the I/O state.
    loop_started: Cell<bool>,
    teardown_hook: RefCell<Option<Box<dyn FnOnce()>>>,
    tearing_down: Cell<bool>,
}

impl Inner {
    pub(crate) fn io_state(&self) -> Option<&RefCell<IoState>> {
        self.io.get()
    }

    /// Creates the fiber I/O state on first use. Later calls return it untouched.
    pub(crate) fn ensure_io(self: &Rc<Self>) -> Result<&RefCell<IoState>> {
        if let Some(io) = self.io.get() {
            if !self.loop_started.get() {
                self.start_event_loop(io)?;
            }
            return Ok(io);
        }
        if let Some((kind, message)) = self.multiplexer_failure.borrow().as_ref() {
            return Err(FiberError::Multiplexer(io::Error::new(*kind, message.clone())));
        }

        let capacity = self.config.fd_capacity();
        let factory = self.multiplexer.borrow_mut().take();
        let created = match factory {
            Some(factory) => factory(capacity),
            None => MioPoller::new(capacity).map(|p| Box::new(p) as Box<dyn Multiplexer>),
        };
        let poller = match created {
            Ok(poller) => poller,
            Err(err) => {
                *self.multiplexer_failure.borrow_mut() = Some((err.kind(), err.to_string()));
                return Err(FiberError::Multiplexer(err));
            }
        };

        let io = self
            .io
            .get_or_init(|| RefCell::new(IoState::new(poller, capacity)));
        self.start_event_loop(io)?;
        tracing::debug!(capacity, "fiber I/O state initialized");
        Ok(io)
    }

    /// Spawns the event-loop fiber unless one is alive or a stop was requested.
    ///
    /// The loop exits once nothing can wake a fiber anymore; the next sleeper
    /// or I/O waiter brings it back.
    pub(crate) fn start_event_loop(self: &Rc<Self>, io: &RefCell<IoState>) -> Result<()> {
        {
            let state = io.borrow();
            if state.event_loop.is_some() || state.stop_requested {
                return Ok(());
            }
        }
        let id = self.spawn_fiber(
            FiberKind::System,
            self.config.event_loop_stack_size,
            event_loop::run,
        )?;
        io.borrow_mut().event_loop = Some(id);
        self.loop_started.set(true);
        self.sched.borrow_mut().mark_ready(id);
        tracing::debug!(fiber = %id, "event loop scheduled");
        Ok(())
    }

    /// Initialization from inside a fiber has no error channel; the
    /// scheduler cannot make progress without it.
    pub(crate) fn io_or_abort(self: &Rc<Self>) -> &RefCell<IoState> {
        match self.ensure_io() {
            Ok(io) => io,
            Err(err) => abort_on(err),
        }
    }

    /// Makes sure a fiber about to park has an event loop to wake it.
    pub(crate) fn event_loop_or_abort(self: &Rc<Self>, io: &RefCell<IoState>) {
        if let Err(err) = self.start_event_loop(io) {
            abort_on(err);
        }
    }

    pub(crate) fn spawn_fiber<F>(self: &Rc<Self>, kind: FiberKind, stack_size: usize, body: F) -> Result<FiberId>
    where
        F: FnOnce(&Context<'_>) + 'static,
    {
        let inner = Rc::clone(self);
        let id = self
            .sched
            .borrow_mut()
            .spawn(kind, stack_size, move |id, yielder| {
                let ctx = Context::new(&inner, id, kind, yielder);
                inner.run_guarded(&ctx, body);
            })?;
        self.metrics.record_spawn();
        tracing::trace!(fiber = %id, ?kind, "fiber created");
        Ok(id)
    }

    fn run_guarded<F>(&self, ctx: &Context<'_>, body: F)
    where
        F: FnOnce(&Context<'_>),
    {
        let result = catch_unwind(AssertUnwindSafe(|| body(ctx)));
        if let Err(payload) = result {
            // Stack teardown unwinds parked fibers; that unwind must reach the
            // coroutine base untouched.
            if self.tearing_down.get() {
                resume_unwind(payload);
            }
            self.metrics.record_panic();
            tracing::error!(
                fiber = %ctx.id(),
                panic = panic_message(payload.as_ref()),
                "fiber panicked"
            );
        }
    }

    pub(crate) fn spawn<F>(self: &Rc<Self>, body: F) -> Result<FiberId>
    where
        F: FnOnce(&Context<'_>) + 'static,
    {
        let id = self.spawn_fiber(FiberKind::User, self.config.stack_size, body)?;
        self.sched.borrow_mut().mark_ready(id);
        Ok(id)
    }

    /// Creates a timer fiber that runs `callback` once `milliseconds` have
    /// passed. The fiber is returned unscheduled.
    pub(crate) fn create_timer<F>(self: &Rc<Self>, milliseconds: u64, callback: F) -> Result<FiberId>
    where
        F: FnOnce(&Context<'_>) + 'static,
    {
        let deadline = now_ms().saturating_add(millis(milliseconds));
        let id = self.spawn_fiber(FiberKind::Timer, self.config.timer_stack_size, move |ctx| {
            // Re-read every round: reset_timer may have moved the target.
            while let Some(deadline) = ctx.inner().timer_deadline(ctx.id()) {
                let left = deadline - now_ms();
                if left <= 0 {
                    break;
                }
                ctx.delay(left as u64);
            }
            callback(ctx);
        })?;
        if let Some(fiber) = self.sched.borrow_mut().fiber_mut(id) {
            fiber.timer_deadline = Some(deadline);
        }
        Ok(id)
    }

    pub(crate) fn timer_deadline(&self, id: FiberId) -> Option<i64> {
        self.sched.borrow().fiber(id).and_then(|f| f.timer_deadline)
    }

    pub(crate) fn reset_timer(&self, io: &RefCell<IoState>, id: FiberId, milliseconds: u64) -> Result<()> {
        let deadline = now_ms().saturating_add(millis(milliseconds));
        let mut state = io.borrow_mut();
        let mut sched = self.sched.borrow_mut();

        let fiber = sched.fiber_mut(id).ok_or(FiberError::UnknownFiber(id))?;
        if fiber.kind != FiberKind::Timer {
            return Err(FiberError::NotATimer(id));
        }
        fiber.timer_deadline = Some(deadline);

        state.remove_sleeper(&mut sched, id, &self.work);
        sched.mark_ready(id);
        tracing::trace!(fiber = %id, deadline, "timer re-armed");
        Ok(())
    }

    pub(crate) fn schedule(&self, id: FiberId) -> Result<()> {
        let mut sched = self.sched.borrow_mut();
        if sched.fiber(id).is_none() {
            return Err(FiberError::UnknownFiber(id));
        }
        sched.mark_ready(id);
        Ok(())
    }

    pub(crate) fn request_stop(&self, io: &RefCell<IoState>) {
        io.borrow_mut().stop_requested = true;
        tracing::debug!("event loop stop requested");
    }

    pub(crate) fn close_handle(&self, fd: RawFd) {
        let Some(io) = self.io.get() else {
            return;
        };
        let mut sched = self.sched.borrow_mut();
        io.borrow_mut().close_handle(&mut sched, fd);
    }

    pub(crate) fn adjust_io_count(&self, io: &RefCell<IoState>, increment: bool) {
        let mut state = io.borrow_mut();
        state.io_count = if increment {
            state.io_count + 1
        } else {
            state.io_count.saturating_sub(1)
        };
    }

    pub(crate) fn io_count(&self) -> usize {
        self.io.get().map_or(0, |io| io.borrow().io_count)
    }

    pub(crate) fn sleeping_count(&self) -> usize {
        self.io.get().map_or(0, |io| io.borrow().sleeping)
    }

    pub(crate) fn snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot(self.io_count(), self.sleeping_count())
    }
}

/// Builder for a [`Runtime`] with injected collaborators.
pub struct RuntimeBuilder {
    config: FiberConfig,
    work: Option<WorkCounter>,
    multiplexer: Option<MultiplexerFactory>,
    teardown_hook: Option<Box<dyn FnOnce()>>,
}

impl RuntimeBuilder {
    pub fn config(mut self, config: FiberConfig) -> Self {
        self.config = config;
        self
    }

    /// Counter notified when this runtime starts or stops having sleepers.
    /// Defaults to [`WorkCounter::global`].
    pub fn work_counter(mut self, work: WorkCounter) -> Self {
        self.work = Some(work);
        self
    }

    /// Replaces the default mio multiplexer. Called once, on first I/O use.
    pub fn multiplexer<F>(mut self, factory: F) -> Self
    where
        F: FnOnce(usize) -> io::Result<Box<dyn Multiplexer>> + 'static,
    {
        self.multiplexer = Some(Box::new(factory));
        self
    }

    /// Runs after the runtime has released its fibers and I/O state.
    pub fn on_teardown<F>(mut self, hook: F) -> Self
    where
        F: FnOnce() + 'static,
    {
        self.teardown_hook = Some(Box::new(hook));
        self
    }

    pub fn build(self) -> Runtime {
        Runtime {
            inner: Rc::new(Inner {
                config: self.config,
                sched: RefCell::new(Scheduler::new()),
                io: OnceCell::new(),
                work: self.work.unwrap_or_else(WorkCounter::global),
                metrics: Metrics::new(),
                multiplexer: RefCell::new(self.multiplexer),
                multiplexer_failure: RefCell::new(None),
                loop_started: Cell::new(false),
                teardown_hook: RefCell::new(self.teardown_hook),
                tearing_down: Cell::new(false),
            }),
        }
    }
}

/// The fiber runtime of one thread.
///
/// Fibers are spawned onto it and driven by [`Runtime::run`]. Blocking on
/// I/O and time happens through the [`Context`] each fiber body receives.
///
/// # Example
///
/// ```no_run
/// use rustfiber_io::Runtime;
///
/// let runtime = Runtime::new();
/// runtime
///     .spawn(|ctx| {
///         let overrun = ctx.delay(10);
///         println!("woke {overrun}ms late");
///     })
///     .unwrap();
/// runtime.run().unwrap();
/// ```
pub struct Runtime {
    inner: Rc<Inner>,
}

impl Runtime {
    /// Creates a runtime with the default configuration.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Creates a runtime with a custom configuration.
    pub fn with_config(config: FiberConfig) -> Self {
        Self::builder().config(config).build()
    }

    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder {
            config: FiberConfig::default(),
            work: None,
            multiplexer: None,
            teardown_hook: None,
        }
    }

    pub fn config(&self) -> &FiberConfig {
        &self.inner.config
    }

    pub fn work_counter(&self) -> &WorkCounter {
        &self.inner.work
    }

    /// Creates the fiber I/O state and the event-loop fiber if they do not
    /// exist yet. Every I/O and timer entry point does this implicitly.
    pub fn ensure_initialized(&self) -> Result<()> {
        self.inner.ensure_io().map(|_| ())
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.io_state().is_some()
    }

    /// Spawns a fiber and puts it on the ready queue.
    pub fn spawn<F>(&self, body: F) -> Result<FiberId>
    where
        F: FnOnce(&Context<'_>) + 'static,
    {
        self.inner.spawn(body)
    }

    /// Creates a timer fiber; see [`Context::create_timer`].
    pub fn create_timer<F>(&self, milliseconds: u64, callback: F) -> Result<FiberId>
    where
        F: FnOnce(&Context<'_>) + 'static,
    {
        self.inner.ensure_io()?;
        self.inner.create_timer(milliseconds, callback)
    }

    /// Re-arms a timer fiber; see [`Context::reset_timer`].
    pub fn reset_timer(&self, id: FiberId, milliseconds: u64) -> Result<()> {
        let io = self.inner.ensure_io()?;
        self.inner.reset_timer(io, id, milliseconds)
    }

    /// Marks a created or parked fiber ready to run.
    pub fn schedule(&self, id: FiberId) -> Result<()> {
        self.inner.schedule(id)
    }

    pub fn increment_io_count(&self) -> Result<()> {
        let io = self.inner.ensure_io()?;
        self.inner.adjust_io_count(io, true);
        Ok(())
    }

    pub fn decrement_io_count(&self) -> Result<()> {
        let io = self.inner.ensure_io()?;
        self.inner.adjust_io_count(io, false);
        Ok(())
    }

    pub fn io_count(&self) -> usize {
        self.inner.io_count()
    }

    pub fn sleeping_count(&self) -> usize {
        self.inner.sleeping_count()
    }

    /// Asks the event loop to finish its current iteration and exit.
    /// Fibers still waiting on I/O or timers are abandoned.
    pub fn request_stop(&self) -> Result<()> {
        let io = self.inner.ensure_io()?;
        self.inner.request_stop(io);
        Ok(())
    }

    pub fn is_stop_requested(&self) -> bool {
        self.inner
            .io_state()
            .is_some_and(|io| io.borrow().stop_requested)
    }

    /// Drops every multiplexer registration of `fd` and releases its waiter.
    /// No-op before initialization.
    pub fn close_handle(&self, fd: RawFd) {
        self.inner.close_handle(fd);
    }

    /// Live fibers, including the event loop and parked fibers.
    pub fn fiber_count(&self) -> usize {
        self.inner.sched.borrow().len()
    }

    pub fn fiber_status(&self, id: FiberId) -> Option<FiberStatus> {
        self.inner.sched.borrow().fiber(id).map(|f| f.status)
    }

    /// The live event-loop fiber, if the loop is currently running.
    pub fn event_loop_fiber(&self) -> Option<FiberId> {
        self.inner.io_state().and_then(|io| io.borrow().event_loop)
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.snapshot()
    }

    /// Runs ready fibers until none is left.
    ///
    /// With the event loop active this returns once it has stopped (after
    /// [`request_stop`](Self::request_stop), or when nothing could wake a
    /// fiber anymore) and the remaining ready fibers have run.
    pub fn run(&self) -> Result<()> {
        let _guard = RunGuard::enter()?;
        loop {
            let next = self.inner.sched.borrow_mut().next_runnable();
            let Some((id, mut coroutine)) = next else {
                break;
            };
            let state = fiber::resume(&mut coroutine);
            let exited = self.inner.sched.borrow_mut().park(id, coroutine, state);
            if let Some(fiber) = exited {
                self.inner.metrics.record_completion();
                tracing::trace!(fiber = %id, "fiber exited");
                drop(fiber);
            }
        }
        Ok(())
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.inner.tearing_down.set(true);

        let fibers = self.inner.sched.borrow_mut().drain();
        let abandoned = fibers.len();
        if std::thread::panicking() {
            // Unwinding fiber stacks on top of a panic would abort.
            std::mem::forget(fibers);
        } else {
            drop(fibers);
        }

        if let Some(io) = self.inner.io_state() {
            io.borrow_mut().release_work(&self.inner.work);
        }
        if let Some(inner) = Rc::get_mut(&mut self.inner) {
            inner.io.take();
        }

        let hook = self.inner.teardown_hook.borrow_mut().take();
        if let Some(hook) = hook {
            hook();
        }
        tracing::debug!(abandoned, "fiber runtime torn down");
    }
}
