//! Deadline-ordered queue of sleeping fibers.
//!
//! The queue is an ordered index over fiber handles; it owns no fiber
//! memory. Each parked fiber remembers its [`TimerKey`] so it can be
//! detached without a scan.

use crate::fiber::FiberId;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Position of a fiber in the timer queue: `(deadline_ms, insertion_seq)`.
///
/// The sequence number breaks ties so that fibers with equal deadlines wake
/// in the order they went to sleep.
pub(crate) type TimerKey = (i64, u64);

/// Current wall-clock time in milliseconds since the Unix epoch.
///
/// Wall time, not monotonic: clock adjustments shift pending deadlines.
pub fn now_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_millis() as i64,
        Err(before) => -(before.duration().as_millis() as i64),
    }
}

pub(crate) struct TimerQueue {
    entries: BTreeMap<TimerKey, FiberId>,
    next_seq: u64,
}

impl TimerQueue {
    pub(crate) fn new() -> Self {
        TimerQueue {
            entries: BTreeMap::new(),
            next_seq: 0,
        }
    }

    /// Inserts `fiber` after every entry whose deadline is <= `deadline`.
    pub(crate) fn insert(&mut self, deadline: i64, fiber: FiberId) -> TimerKey {
        let key = (deadline, self.next_seq);
        self.next_seq += 1;
        self.entries.insert(key, fiber);
        key
    }

    pub(crate) fn remove(&mut self, key: TimerKey) -> Option<FiberId> {
        self.entries.remove(&key)
    }

    /// Earliest entry, if any.
    pub(crate) fn peek(&self) -> Option<(i64, FiberId)> {
        self.entries
            .first_key_value()
            .map(|(&(deadline, _), &fiber)| (deadline, fiber))
    }

    /// Detaches the earliest entry if its deadline is at or before `now`.
    pub(crate) fn pop_expired(&mut self, now: i64) -> Option<FiberId> {
        let (&(deadline, _), _) = self.entries.first_key_value()?;
        if deadline > now {
            return None;
        }
        self.entries.pop_first().map(|(_, fiber)| fiber)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
