//! Fiber management and execution context.
//!
//! A fiber is a stackful coroutine with its own stack, resumed by the
//! runtime's run loop and suspended from inside its body through the
//! [`Context`](crate::Context) it was handed.

use crate::error::{FiberError, Result};
use crate::timer::TimerKey;
use corosensei::stack::DefaultStack;
use corosensei::{Coroutine, CoroutineResult, Yielder};
use std::fmt;

/// Stable handle to a fiber inside one runtime.
///
/// Handles are generational: once a fiber exits, its handle never resolves
/// again even if the storage slot is reused by a new fiber.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FiberId {
    index: u32,
    generation: u32,
}

impl FiberId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        FiberId { index, generation }
    }

    pub(crate) fn index(&self) -> usize {
        self.index as usize
    }

    pub(crate) fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for FiberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fiber#{}.{}", self.index, self.generation)
    }
}

/// What a fiber is for. Decides how it is accounted while sleeping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FiberKind {
    /// Ordinary fiber created with `spawn`.
    User,
    /// Runtime-internal fiber (the event loop). Never counted as pending work.
    System,
    /// Fiber created with `create_timer`; can be re-armed with `reset_timer`.
    Timer,
}

impl FiberKind {
    pub fn is_system(&self) -> bool {
        matches!(self, FiberKind::System)
    }
}

/// Scheduling state of a live fiber.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FiberStatus {
    /// Created but never scheduled.
    Created,
    /// Sitting in the ready queue.
    Ready,
    /// Currently executing.
    Running,
    /// Parked until something marks it ready.
    Suspended,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum YieldType {
    /// Reschedule the fiber immediately (cooperative yield).
    Normal,
    /// Park the fiber until it is explicitly marked ready.
    Wait,
}

pub(crate) enum FiberState {
    Yielded(YieldType),
    Complete,
}

pub(crate) type FiberYielder = Yielder<(), YieldType>;
pub(crate) type FiberCoroutine = Coroutine<(), YieldType, (), DefaultStack>;

/// A fiber slot: the coroutine plus the scheduling metadata the I/O layer
/// keeps on it.
pub(crate) struct Fiber {
    /// Taken out while the fiber runs so the arena stays borrowable.
    coroutine: Option<FiberCoroutine>,
    pub(crate) kind: FiberKind,
    pub(crate) status: FiberStatus,
    /// Position in the timer queue while parked there.
    pub(crate) timer_key: Option<TimerKey>,
    /// Target deadline of a timer fiber.
    pub(crate) timer_deadline: Option<i64>,
}

impl Fiber {
    /// Creates a new fiber whose coroutine runs `body` on a fresh stack.
    pub(crate) fn new<F>(kind: FiberKind, stack_size: usize, body: F) -> Result<Self>
    where
        F: FnOnce(&FiberYielder) + 'static,
    {
        let stack = DefaultStack::new(stack_size).map_err(|source| FiberError::StackAllocation {
            size: stack_size,
            source,
        })?;
        let coroutine = Coroutine::with_stack(stack, move |yielder: &FiberYielder, ()| {
            body(yielder);
        });

        Ok(Fiber {
            coroutine: Some(coroutine),
            kind,
            status: FiberStatus::Created,
            timer_key: None,
            timer_deadline: None,
        })
    }

    pub(crate) fn take_coroutine(&mut self) -> Option<FiberCoroutine> {
        self.coroutine.take()
    }

    pub(crate) fn restore_coroutine(&mut self, coroutine: FiberCoroutine) {
        self.coroutine = Some(coroutine);
    }
}

/// Resumes a coroutine until its next suspension or completion.
pub(crate) fn resume(coroutine: &mut FiberCoroutine) -> FiberState {
    match coroutine.resume(()) {
        CoroutineResult::Yield(reason) => FiberState::Yielded(reason),
        CoroutineResult::Return(()) => FiberState::Complete,
    }
}

/// Extracts a printable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "Unknown panic"
    }
}
