//! Single-threaded ready-queue scheduler.
//!
//! The scheduler owns every fiber of a runtime, the FIFO ready queue and the
//! bookkeeping of which fiber is running. It never resumes fibers itself:
//! the runtime's run loop takes a coroutine out with [`Scheduler::next_runnable`],
//! resumes it without holding any borrow, and hands it back with
//! [`Scheduler::park`].

use crate::arena::FiberArena;
use crate::error::Result;
use crate::fiber::{
    Fiber, FiberCoroutine, FiberId, FiberKind, FiberState, FiberStatus, FiberYielder, YieldType,
};
use std::collections::VecDeque;

pub(crate) struct Scheduler {
    fibers: FiberArena,
    ready: VecDeque<FiberId>,
    /// Number of resumptions so far; lets `yield_now` report how many
    /// fibers ran in between.
    switched: u64,
}

impl Scheduler {
    pub(crate) fn new() -> Self {
        Scheduler {
            fibers: FiberArena::new(),
            ready: VecDeque::new(),
            switched: 0,
        }
    }

    /// Creates a fiber in the `Created` state. It does not run until marked ready.
    pub(crate) fn spawn<F>(&mut self, kind: FiberKind, stack_size: usize, body: F) -> Result<FiberId>
    where
        F: FnOnce(FiberId, &FiberYielder) + 'static,
    {
        self.fibers
            .insert_with(|id| Fiber::new(kind, stack_size, move |yielder| body(id, yielder)))
    }

    /// Puts a created or parked fiber at the tail of the ready queue.
    ///
    /// Returns false when the fiber is unknown or already ready/running.
    pub(crate) fn mark_ready(&mut self, id: FiberId) -> bool {
        let Some(fiber) = self.fibers.get_mut(id) else {
            tracing::trace!(fiber = %id, "mark_ready on exited fiber ignored");
            return false;
        };
        match fiber.status {
            FiberStatus::Created | FiberStatus::Suspended => {
                fiber.status = FiberStatus::Ready;
                self.ready.push_back(id);
                true
            }
            FiberStatus::Ready | FiberStatus::Running => false,
        }
    }

    /// Pops the next ready fiber and takes its coroutine for resumption.
    pub(crate) fn next_runnable(&mut self) -> Option<(FiberId, FiberCoroutine)> {
        while let Some(id) = self.ready.pop_front() {
            let Some(fiber) = self.fibers.get_mut(id) else {
                continue;
            };
            let Some(coroutine) = fiber.take_coroutine() else {
                continue;
            };
            fiber.status = FiberStatus::Running;
            self.switched += 1;
            return Some((id, coroutine));
        }
        None
    }

    /// Hands a coroutine back after it suspended or finished.
    ///
    /// Returns the fiber if it exited so the caller can drop it outside
    /// any borrow of the scheduler.
    pub(crate) fn park(
        &mut self,
        id: FiberId,
        coroutine: FiberCoroutine,
        state: FiberState,
    ) -> Option<Fiber> {
        let fiber = self.fibers.get_mut(id)?;
        fiber.restore_coroutine(coroutine);
        match state {
            FiberState::Yielded(YieldType::Normal) => {
                fiber.status = FiberStatus::Ready;
                self.ready.push_back(id);
                None
            }
            FiberState::Yielded(YieldType::Wait) => {
                fiber.status = FiberStatus::Suspended;
                None
            }
            FiberState::Complete => self.fibers.remove(id),
        }
    }

    pub(crate) fn fiber(&self, id: FiberId) -> Option<&Fiber> {
        self.fibers.get(id)
    }

    pub(crate) fn fiber_mut(&mut self, id: FiberId) -> Option<&mut Fiber> {
        self.fibers.get_mut(id)
    }

    pub(crate) fn switched(&self) -> u64 {
        self.switched
    }

    pub(crate) fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.fibers.len()
    }

    /// Removes all fibers, ready or parked.
    pub(crate) fn drain(&mut self) -> Vec<Fiber> {
        self.ready.clear();
        self.fibers.drain()
    }
}
