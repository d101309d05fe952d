//! The event-loop fiber.
//!
//! One per initialized runtime. It lets every ready fiber run, then blocks
//! on the multiplexer until either a handle becomes ready or the earliest
//! timer is due, and wakes whichever fibers that concerns.

use crate::context::Context;
use crate::timer::now_ms;
use std::time::Duration;

/// How long one multiplexer wait may block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PollPlan {
    pub(crate) timeout: Option<Duration>,
    /// Milliseconds from `planned_at` to the earliest deadline, if any timer is queued.
    pub(crate) timer_left: Option<i64>,
    pub(crate) planned_at: i64,
}

impl PollPlan {
    pub(crate) fn new(stop_requested: bool, first_deadline: Option<i64>, now: i64) -> Self {
        let timer_left = first_deadline.map(|deadline| (deadline - now).max(0));
        let timeout = if stop_requested {
            Some(Duration::ZERO)
        } else {
            match timer_left {
                None => None,
                Some(0) => Some(Duration::ZERO),
                // One extra millisecond so the wait never ends just short of the deadline.
                Some(left) => Some(Duration::from_millis(left as u64 + 1)),
            }
        };
        PollPlan {
            timeout,
            timer_left,
            planned_at: now,
        }
    }

    /// Whether the timer queue must be scanned after a poll that returned at `now`.
    pub(crate) fn timers_due(&self, now: i64) -> bool {
        self.timer_left
            .is_some_and(|left| now - self.planned_at >= left)
    }
}

pub(crate) fn run(ctx: &Context<'_>) {
    let inner = ctx.inner();
    let Some(io) = inner.io_state() else {
        return;
    };
    tracing::debug!(fiber = %ctx.id(), "event loop started");

    loop {
        while ctx.yield_now() > 0 {}

        let plan = {
            let state = io.borrow();
            let idle = !state.stop_requested
                && state.timers.is_empty()
                && state.io_count == 0
                && state.table.occupied() == 0
                && inner.sched.borrow().ready_len() == 0;
            if idle {
                tracing::debug!("no timers or I/O waiters left");
                break;
            }
            let plan = PollPlan::new(
                state.stop_requested,
                state.timers.peek().map(|(deadline, _)| deadline),
                now_ms(),
            );
            tracing::trace!(
                timers = state.timers.len(),
                io_count = state.io_count,
                timeout = ?plan.timeout,
                "waiting for readiness"
            );
            plan
        };

        let polled = {
            let mut state = io.borrow_mut();
            let mut sched = inner.sched.borrow_mut();
            state.poll(&mut sched, plan.timeout)
        };
        match polled {
            Ok(woken) => inner.metrics.record_poll(woken),
            Err(err) => {
                tracing::error!(error = %err, "multiplexer wait failed");
                break;
            }
        }

        let mut state = io.borrow_mut();
        if state.stop_requested {
            if state.io_count > 0 {
                tracing::info!(io_count = state.io_count, "stopping with I/O still outstanding");
            }
            break;
        }

        let now = now_ms();
        if plan.timers_due(now) {
            let mut sched = inner.sched.borrow_mut();
            let expired = state.expire_timers(&mut sched, now, &inner.work);
            inner.metrics.record_expirations(expired);
        }
    }
    io.borrow_mut().event_loop = None;
    tracing::debug!(fiber = %ctx.id(), "event loop exited");
}
