//! Handle → waiting fiber table.
//!
//! Indexed directly by descriptor number, so its size is fixed at creation
//! from the configured fd capacity.

use crate::error::{FiberError, Result};
use crate::fiber::FiberId;
use std::os::fd::RawFd;

/// Dense table mapping a handle to the one fiber blocked on it.
pub(crate) struct ReadinessTable {
    slots: Box<[Option<FiberId>]>,
    occupied: usize,
}

impl ReadinessTable {
    pub(crate) fn new(capacity: usize) -> Self {
        ReadinessTable {
            slots: vec![None; capacity].into_boxed_slice(),
            occupied: 0,
        }
    }

    fn slot(&self, fd: RawFd) -> Result<usize> {
        usize::try_from(fd)
            .ok()
            .filter(|&index| index < self.slots.len())
            .ok_or(FiberError::HandleOutOfRange {
                fd,
                capacity: self.slots.len(),
            })
    }

    /// Fails if `fd` is out of range or already awaited.
    pub(crate) fn check_vacant(&self, fd: RawFd) -> Result<()> {
        let index = self.slot(fd)?;
        match self.slots[index] {
            Some(waiter) => Err(FiberError::HandleBusy { fd, waiter }),
            None => Ok(()),
        }
    }

    pub(crate) fn waiter(&self, fd: RawFd) -> Option<FiberId> {
        self.slot(fd).ok().and_then(|index| self.slots[index])
    }

    pub(crate) fn insert(&mut self, fd: RawFd, fiber: FiberId) -> Result<()> {
        self.check_vacant(fd)?;
        let index = self.slot(fd)?;
        self.slots[index] = Some(fiber);
        self.occupied += 1;
        Ok(())
    }

    pub(crate) fn take(&mut self, fd: RawFd) -> Option<FiberId> {
        let index = self.slot(fd).ok()?;
        let fiber = self.slots[index].take()?;
        self.occupied -= 1;
        Some(fiber)
    }

    /// Number of handles with a waiting fiber.
    pub(crate) fn occupied(&self) -> usize {
        self.occupied
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_waiter_per_handle() {
        let mut table = ReadinessTable::new(16);
        let a = FiberId::new(1, 0);
        let b = FiberId::new(2, 0);

        table.insert(7, a).unwrap();
        assert!(matches!(
            table.insert(7, b),
            Err(FiberError::HandleBusy { fd: 7, waiter }) if waiter == a
        ));
        assert_eq!(table.waiter(7), Some(a));
        assert_eq!(table.occupied(), 1);

        assert_eq!(table.take(7), Some(a));
        assert_eq!(table.take(7), None);
        assert_eq!(table.occupied(), 0);
        table.insert(7, b).unwrap();
    }

    #[test]
    fn test_out_of_range_handles() {
        let mut table = ReadinessTable::new(8);
        let a = FiberId::new(1, 0);
        assert!(matches!(
            table.insert(8, a),
            Err(FiberError::HandleOutOfRange { fd: 8, capacity: 8 })
        ));
        assert!(matches!(
            table.check_vacant(-1),
            Err(FiberError::HandleOutOfRange { fd: -1, .. })
        ));
        assert_eq!(table.waiter(-1), None);
        assert_eq!(table.take(100), None);
    }
}
