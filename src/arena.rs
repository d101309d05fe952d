//! Generational slot storage for fibers.

use crate::error::Result;
use crate::fiber::{Fiber, FiberId};

struct Slot {
    generation: u32,
    fiber: Option<Fiber>,
}

/// Storage for the fibers of one runtime, addressed by [`FiberId`].
///
/// Slots of exited fibers are reused; the generation stamp keeps stale
/// handles from resolving to the new occupant. Owned by a single runtime
/// and never shared across threads.
pub(crate) struct FiberArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    len: usize,
}

impl FiberArena {
    pub(crate) fn new() -> Self {
        FiberArena {
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Builds a fiber for the next free slot and stores it.
    ///
    /// The constructor receives the id the fiber will have, so a fiber body
    /// can know its own handle before it first runs.
    pub(crate) fn insert_with<F>(&mut self, build: F) -> Result<FiberId>
    where
        F: FnOnce(FiberId) -> Result<Fiber>,
    {
        let index = match self.free.last() {
            Some(&index) => index,
            None => self.slots.len() as u32,
        };
        let generation = self
            .slots
            .get(index as usize)
            .map_or(0, |slot| slot.generation);
        let id = FiberId::new(index, generation);
        let fiber = build(id)?;

        if (index as usize) < self.slots.len() {
            self.free.pop();
            self.slots[index as usize].fiber = Some(fiber);
        } else {
            self.slots.push(Slot {
                generation,
                fiber: Some(fiber),
            });
        }
        self.len += 1;
        Ok(id)
    }

    pub(crate) fn get(&self, id: FiberId) -> Option<&Fiber> {
        self.slots
            .get(id.index())
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.fiber.as_ref())
    }

    pub(crate) fn get_mut(&mut self, id: FiberId) -> Option<&mut Fiber> {
        self.slots
            .get_mut(id.index())
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.fiber.as_mut())
    }

    /// Removes a fiber, retiring its handle.
    pub(crate) fn remove(&mut self, id: FiberId) -> Option<Fiber> {
        let slot = self
            .slots
            .get_mut(id.index())
            .filter(|slot| slot.generation == id.generation())?;
        let fiber = slot.fiber.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index() as u32);
        self.len -= 1;
        Some(fiber)
    }

    /// Takes every fiber out of the arena.
    pub(crate) fn drain(&mut self) -> Vec<Fiber> {
        let fibers = self
            .slots
            .iter_mut()
            .filter_map(|slot| slot.fiber.take())
            .collect();
        self.slots.clear();
        self.free.clear();
        self.len = 0;
        fibers
    }

    /// Returns the current number of live fibers.
    pub(crate) fn len(&self) -> usize {
        self.len
    }
}
