//! Generational slot storage backing every typed object allocator.
//!
//! Slots are addressed by `(index, generation)` handles. Indices are reused
//! through a free list and every reuse bumps the slot's generation, so a
//! stale handle can never reach a recycled slot. Doomed slots stay resident
//! until the device timeline has provably passed their last use, then their
//! payload is handed back for destruction and the index is refiled.

use crate::error::Error;

/// A slot queued for destruction once the timeline semaphore reaches
/// `fence_value`.
#[derive(Copy, Clone, Debug)]
pub(crate) struct PendingDestroy {
    pub index: usize,
    pub fence_value: u64,
}

struct SlotEntry<T> {
    payload: Option<T>,
    generation: u64,
    alive: bool,
}

pub(crate) struct SlotStore<T> {
    slots: Vec<SlotEntry<T>>,
    free_list: Vec<usize>,
    pending_destroy: Vec<PendingDestroy>,
}

impl<T> SlotStore<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            pending_destroy: Vec::new(),
        }
    }

    /// Installs a payload, reusing a free index when one exists.
    ///
    /// Returns the slot index and its current generation.
    pub fn insert(&mut self, payload: T) -> (usize, u64) {
        let index = match self.free_list.pop() {
            Some(index) => index,
            None => {
                self.slots.push(SlotEntry {
                    payload: None,
                    generation: 0,
                    alive: false,
                });
                self.slots.len() - 1
            }
        };

        let slot = &mut self.slots[index];
        debug_assert!(slot.payload.is_none());
        slot.payload = Some(payload);
        slot.alive = true;

        (index, slot.generation)
    }

    /// Resolves a handle, rejecting stale generations.
    pub fn get(&self, index: usize, generation: u64) -> Option<&T> {
        let slot = self.slots.get(index)?;
        if slot.generation != generation || !slot.alive {
            return None;
        }
        slot.payload.as_ref()
    }

    /// Resolves a handle mutably, rejecting stale generations.
    pub fn get_mut(&mut self, index: usize, generation: u64) -> Option<&mut T> {
        let slot = self.slots.get_mut(index)?;
        if slot.generation != generation || !slot.alive {
            return None;
        }
        slot.payload.as_mut()
    }

    pub fn generation(&self, index: usize) -> Option<u64> {
        self.slots.get(index).map(|slot| slot.generation)
    }

    /// Marks a slot as logically dead and queues it for physical destruction
    /// once the timeline passes `fence_value`.
    ///
    /// The handle is invalidated immediately: the generation is bumped so no
    /// later lookup can reach the doomed payload. A stale or already dead
    /// handle is rejected with [`Error::InvalidArgumentError`].
    pub fn destroy(&mut self, index: usize, generation: u64, fence_value: u64) -> Result<(), Error> {
        let slot = match self.slots.get_mut(index) {
            Some(slot) => slot,
            None => return Err(Error::InvalidArgumentError),
        };

        if slot.generation != generation || !slot.alive {
            return Err(Error::InvalidArgumentError);
        }

        slot.generation += 1;
        slot.alive = false;

        self.pending_destroy.push(PendingDestroy {
            index,
            fence_value,
        });

        Ok(())
    }

    /// Hands every payload whose fence value the timeline has reached to
    /// `destroy_payload` and refiles its index.
    pub fn collect_pending(&mut self, completed: u64, mut destroy_payload: impl FnMut(usize, T)) {
        let mut collected = Vec::new();
        self.pending_destroy.retain(|pending| {
            if pending.fence_value <= completed {
                collected.push(pending.index);
                false
            } else {
                true
            }
        });

        for index in collected {
            if let Some(payload) = self.slots[index].payload.take() {
                destroy_payload(index, payload);
                self.free_list.push(index);
            }
        }
    }

    /// Number of destructions currently waiting on the timeline.
    pub fn pending_count(&self) -> usize {
        self.pending_destroy.len()
    }

    /// Handles of every slot that has not been destroyed. Used by the
    /// shutdown path to doom whatever the application leaked.
    pub fn live_handles(&self) -> Vec<(usize, u64)> {
        self.slots.iter()
            .enumerate()
            .filter(|(_, slot)| slot.alive)
            .map(|(index, slot)| (index, slot.generation))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_and_get() {
        let mut store = SlotStore::new();
        let (index, generation) = store.insert("payload");

        assert_eq!(index, 0);
        assert_eq!(generation, 0);
        assert_eq!(store.get(index, generation), Some(&"payload"));
        assert_eq!(store.get(index, generation + 1), None);
    }

    #[test]
    fn destroyed_slot_is_unreachable_before_collection() {
        let mut store = SlotStore::new();
        let (index, generation) = store.insert(1u32);

        store.destroy(index, generation, 5).unwrap();

        // Logically dead right away even though the payload still exists.
        assert_eq!(store.get(index, generation), None);
        assert_eq!(store.pending_count(), 1);
    }

    #[test]
    fn reuse_bumps_generation() {
        let mut store = SlotStore::new();
        let (index, generation) = store.insert(1u32);

        store.destroy(index, generation, 3).unwrap();

        let mut destroyed = Vec::new();
        store.collect_pending(3, |index, payload| destroyed.push((index, payload)));
        assert_eq!(destroyed, vec![(index, 1u32)]);

        let (new_index, new_generation) = store.insert(2u32);
        assert_eq!(new_index, index);
        assert!(new_generation > generation);
        assert_eq!(new_generation, generation + 1);
    }

    #[test]
    fn collection_respects_fence_values() {
        let mut store = SlotStore::new();
        let (a, a_gen) = store.insert("a");
        let (b, b_gen) = store.insert("b");

        store.destroy(a, a_gen, 2).unwrap();
        store.destroy(b, b_gen, 7).unwrap();

        let mut destroyed = Vec::new();
        store.collect_pending(4, |_, payload| destroyed.push(payload));
        assert_eq!(destroyed, vec!["a"]);
        assert_eq!(store.pending_count(), 1);

        store.collect_pending(7, |_, payload| destroyed.push(payload));
        assert_eq!(destroyed, vec!["a", "b"]);
        assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn stale_destroy_is_rejected() {
        let mut store = SlotStore::new();
        let (index, generation) = store.insert(1u32);

        store.destroy(index, generation, 0).unwrap();
        assert_eq!(
            store.destroy(index, generation, 0).unwrap_err(),
            Error::InvalidArgumentError
        );

        store.collect_pending(0, |_, _| {});
        let (index, new_generation) = store.insert(2u32);

        // A handle from the previous life of the slot must not destroy the
        // new occupant.
        assert_eq!(
            store.destroy(index, new_generation - 1, 0).unwrap_err(),
            Error::InvalidArgumentError
        );
    }

    #[test]
    fn live_handles_skips_doomed_slots() {
        let mut store = SlotStore::new();
        let (a, a_gen) = store.insert("a");
        let (_b, _) = store.insert("b");

        store.destroy(a, a_gen, 0).unwrap();

        let live = store.live_handles();
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].0, 1);
    }

    #[test]
    fn generations_are_monotonic_across_reuse() {
        let mut store = SlotStore::new();
        let mut last_generation = None;

        for round in 0..8u64 {
            let (index, generation) = store.insert(round);
            assert_eq!(index, 0);
            if let Some(last) = last_generation {
                assert!(generation > last);
            }
            last_generation = Some(generation);

            store.destroy(index, generation, round).unwrap();
            store.collect_pending(round, |_, _| {});
        }
    }
}
