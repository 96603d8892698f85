//! Fixed-size slot table of live connections.
//!
//! Occupancy is a bitmap, 64 slots per word. Mutation happens under a spin
//! lock; iteration copies the bitmap first and re-fetches each slot, so an
//! entry inserted or removed mid-walk is either seen once or skipped.

use std::sync::Arc;

use picomsg_frame::{SpinLock, SpinLockGuard};

use crate::error::{CommsError, Result};

const WORD_BITS: usize = 64;

/// Registry storage. Only reachable through a held lock.
pub(crate) struct Slots<T> {
    occupied: Vec<u64>,
    entries: Vec<Option<Arc<T>>>,
    len: usize,
}

impl<T> Slots<T> {
    fn with_capacity(slots: usize) -> Self {
        let words = slots.div_ceil(WORD_BITS).max(1);
        Self {
            occupied: vec![0; words],
            entries: (0..words * WORD_BITS).map(|_| None).collect(),
            len: 0,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Claim the lowest free slot.
    pub(crate) fn insert(&mut self, value: Arc<T>) -> Result<usize> {
        for (word_index, word) in self.occupied.iter_mut().enumerate() {
            let free = !*word;
            if free == 0 {
                continue;
            }
            let bit = free.trailing_zeros() as usize;
            *word |= 1 << bit;
            let slot = word_index * WORD_BITS + bit;
            self.entries[slot] = Some(value);
            self.len += 1;
            return Ok(slot);
        }
        Err(CommsError::RegistryFull {
            capacity: self.capacity(),
        })
    }

    fn take(&mut self, slot: usize) -> Option<Arc<T>> {
        let value = self.entries.get_mut(slot)?.take()?;
        self.occupied[slot / WORD_BITS] &= !(1 << (slot % WORD_BITS));
        self.len -= 1;
        Some(value)
    }

    /// Empty every slot, handing the entries back to the caller.
    pub(crate) fn drain(&mut self) -> Vec<Arc<T>> {
        self.occupied.iter_mut().for_each(|word| *word = 0);
        self.len = 0;
        self.entries.iter_mut().filter_map(Option::take).collect()
    }
}

pub struct Registry<T> {
    slots: SpinLock<Slots<T>>,
}

impl<T> Registry<T> {
    /// `slots` is rounded up to a multiple of 64.
    pub fn new(slots: usize) -> Self {
        Self {
            slots: SpinLock::new(Slots::with_capacity(slots)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().capacity()
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn insert(&self, value: Arc<T>) -> Result<usize> {
        self.slots.lock().insert(value)
    }

    pub fn get(&self, slot: usize) -> Option<Arc<T>> {
        self.slots.lock().entries.get(slot)?.clone()
    }

    /// Remove the entry at `slot` if `pred` accepts it.
    ///
    /// The removed `Arc` is returned so the caller drops it outside the lock.
    pub fn remove_if(&self, slot: usize, pred: impl FnOnce(&Arc<T>) -> bool) -> Option<Arc<T>> {
        let mut slots = self.slots.lock();
        match slots.entries.get(slot) {
            Some(Some(entry)) if pred(entry) => slots.take(slot),
            _ => None,
        }
    }

    /// Walk a snapshot of the occupied slots.
    pub fn iter(&self) -> Iter<'_, T> {
        let snapshot = self.slots.lock().occupied.clone();
        Iter {
            registry: self,
            snapshot,
            word: 0,
        }
    }

    /// Hold the registry lock, e.g. across `fork`.
    pub(crate) fn lock(&self) -> SpinLockGuard<'_, Slots<T>> {
        self.slots.lock()
    }
}

/// Snapshot iterator over `(slot, entry)` pairs.
pub struct Iter<'a, T> {
    registry: &'a Registry<T>,
    snapshot: Vec<u64>,
    word: usize,
}

impl<T> Iterator for Iter<'_, T> {
    type Item = (usize, Arc<T>);

    fn next(&mut self) -> Option<Self::Item> {
        while self.word < self.snapshot.len() {
            let bits = self.snapshot[self.word];
            if bits == 0 {
                self.word += 1;
                continue;
            }
            let bit = bits.trailing_zeros() as usize;
            self.snapshot[self.word] &= bits - 1;
            let slot = self.word * WORD_BITS + bit;
            // Removed since the snapshot: skip.
            if let Some(entry) = self.registry.get(slot) {
                return Some((slot, entry));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_rounds_up_to_whole_words() {
        assert_eq!(Registry::<u32>::new(1).capacity(), 64);
        assert_eq!(Registry::<u32>::new(64).capacity(), 64);
        assert_eq!(Registry::<u32>::new(65).capacity(), 128);
    }

    #[test]
    fn insert_fills_lowest_slot_and_reports_full() {
        let registry = Registry::new(64);
        for expected in 0..64 {
            assert_eq!(registry.insert(Arc::new(expected as u32)).unwrap(), expected);
        }
        assert!(matches!(
            registry.insert(Arc::new(99)),
            Err(CommsError::RegistryFull { capacity: 64 })
        ));

        assert!(registry.remove_if(10, |_| true).is_some());
        assert_eq!(registry.insert(Arc::new(100)).unwrap(), 10);
    }

    #[test]
    fn remove_if_checks_identity() {
        let registry = Registry::new(64);
        let first = Arc::new(1u32);
        let slot = registry.insert(Arc::clone(&first)).unwrap();

        let other = Arc::new(1u32);
        assert!(registry.remove_if(slot, |e| Arc::ptr_eq(e, &other)).is_none());
        let removed = registry
            .remove_if(slot, |e| Arc::ptr_eq(e, &first))
            .unwrap();
        assert!(Arc::ptr_eq(&removed, &first));
        assert!(registry.is_empty());
        assert!(registry.remove_if(slot, |_| true).is_none());
    }

    #[test]
    fn iteration_skips_entries_removed_mid_walk() {
        let registry = Registry::new(128);
        for value in 0..100u32 {
            registry.insert(Arc::new(value)).unwrap();
        }

        let mut seen = Vec::new();
        for (slot, value) in registry.iter() {
            seen.push(*value);
            // Remove the next odd slot before the walk reaches it.
            if slot % 2 == 0 {
                registry.remove_if(slot + 1, |_| true);
            }
        }
        let expected: Vec<u32> = (0..100).step_by(2).collect();
        assert_eq!(seen, expected);
        assert_eq!(registry.len(), 50);
    }

    #[test]
    fn iteration_survives_concurrent_mutation() {
        let registry = Arc::new(Registry::new(256));
        let keep: Vec<usize> = (0..32u32)
            .map(|v| registry.insert(Arc::new(v)).unwrap())
            .collect();

        let churn = {
            let registry = Arc::clone(&registry);
            std::thread::spawn(move || {
                for round in 0..2000u32 {
                    if let Ok(slot) = registry.insert(Arc::new(1000 + round)) {
                        registry.remove_if(slot, |_| true);
                    }
                }
            })
        };

        for _ in 0..200 {
            let survivors = registry.iter().filter(|(_, v)| **v < 1000).count();
            assert_eq!(survivors, keep.len());
        }
        churn.join().unwrap();
        assert_eq!(registry.len(), keep.len());
    }

    #[test]
    fn drain_empties_under_lock() {
        let registry = Registry::new(64);
        registry.insert(Arc::new(1u32)).unwrap();
        registry.insert(Arc::new(2u32)).unwrap();

        let drained = registry.lock().drain();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
        assert_eq!(registry.iter().count(), 0);
    }
}
