//! Concurrent handle table
//!
//! A slot arena keyed by [`HandleId`]. Each id carries the generation of the
//! slot it was issued from, so a stale id resolves to "not found" instead of
//! whatever was stored in the slot afterwards.

use super::HandleId;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// One slot of the arena
#[derive(Debug)]
struct Slot<V> {
    /// Generation of the value currently (or last) stored here
    generation: u32,
    /// The stored value, if the slot is occupied
    value: Option<Arc<V>>,
}

#[derive(Debug)]
struct Slots<V> {
    slots: Vec<Slot<V>>,
    /// Vacant slot indices available for reuse
    free: Vec<u32>,
}

/// Thread-safe map from [`HandleId`] to shared handle records
///
/// Lookups take a shared lock and may proceed concurrently; inserts and
/// removals are serialized. Values are handed out as `Arc`s so a caller can
/// keep using a record after it has been removed from the table.
#[derive(Debug)]
pub struct HandleTable<V> {
    inner: RwLock<Slots<V>>,
    len: AtomicUsize,
}

impl<V> Default for HandleTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> HandleTable<V> {
    /// Create an empty table
    pub fn new() -> Self {
        HandleTable {
            inner: RwLock::new(Slots {
                slots: Vec::new(),
                free: Vec::new(),
            }),
            len: AtomicUsize::new(0),
        }
    }

    /// Insert a value built from its freshly issued id
    ///
    /// The id is allocated first so the stored record can carry it.
    pub fn insert_with<F>(&self, make: F) -> (HandleId, Arc<V>)
    where
        F: FnOnce(HandleId) -> V,
    {
        let mut inner = self.inner.write();

        let index = match inner.free.pop() {
            Some(index) => index,
            None => {
                inner.slots.push(Slot {
                    generation: 0,
                    value: None,
                });
                (inner.slots.len() - 1) as u32
            }
        };

        let slot = &mut inner.slots[index as usize];
        slot.generation += 1;
        let id = HandleId::new(index, slot.generation);
        let value = Arc::new(make(id));
        slot.value = Some(value.clone());

        self.len.fetch_add(1, Ordering::Relaxed);
        (id, value)
    }

    /// Look up a live value
    pub fn get(&self, id: HandleId) -> Option<Arc<V>> {
        let inner = self.inner.read();
        let slot = inner.slots.get(id.index() as usize)?;
        if slot.generation != id.generation() {
            return None;
        }
        slot.value.clone()
    }

    /// Remove a value, returning it to exactly one caller
    pub fn remove(&self, id: HandleId) -> Option<Arc<V>> {
        let mut inner = self.inner.write();
        let slot = inner.slots.get_mut(id.index() as usize)?;
        if slot.generation != id.generation() {
            return None;
        }
        let value = slot.value.take()?;

        // A slot whose generation is exhausted is retired rather than reused,
        // so an (index, generation) pair is never issued twice.
        if slot.generation < u32::MAX {
            inner.free.push(id.index());
        }

        self.len.fetch_sub(1, Ordering::Relaxed);
        Some(value)
    }

    /// Point-in-time copy of every live entry
    pub fn snapshot(&self) -> Vec<(HandleId, Arc<V>)> {
        let inner = self.inner.read();
        inner
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.value
                    .as_ref()
                    .map(|value| (HandleId::new(index as u32, slot.generation), value.clone()))
            })
            .collect()
    }

    /// Visit every entry of a snapshot, outside the table lock
    pub fn for_each<F>(&self, mut visit: F)
    where
        F: FnMut(HandleId, &Arc<V>),
    {
        for (id, value) in self.snapshot() {
            visit(id, &value);
        }
    }

    /// Remove every entry, returning what was stored
    pub fn drain(&self) -> Vec<(HandleId, Arc<V>)> {
        let ids: Vec<HandleId> = self.snapshot().into_iter().map(|(id, _)| id).collect();
        ids.into_iter()
            .filter_map(|id| self.remove(id).map(|value| (id, value)))
            .collect()
    }

    /// Number of live entries (advisory under concurrent mutation)
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Whether the table holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_insert_and_get() {
        let table = HandleTable::new();
        let (id, value) = table.insert_with(|id| format!("handle-{}", id));

        assert_eq!(table.len(), 1);
        assert_eq!(*table.get(id).unwrap(), *value);
    }

    #[test]
    fn test_remove_is_exactly_once() {
        let table = HandleTable::new();
        let (id, _) = table.insert_with(|_| 7u32);

        assert_eq!(*table.remove(id).unwrap(), 7);
        assert!(table.remove(id).is_none());
        assert!(table.get(id).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn test_stale_id_does_not_resolve_to_reused_slot() {
        let table = HandleTable::new();
        let (old, _) = table.insert_with(|_| "old");
        table.remove(old);

        let (new, _) = table.insert_with(|_| "new");
        assert_eq!(old.index(), new.index());
        assert_ne!(old, new);
        assert!(table.get(old).is_none());
        assert!(table.remove(old).is_none());
        assert_eq!(*table.get(new).unwrap(), "new");
    }

    #[test]
    fn test_snapshot_and_for_each() {
        let table = HandleTable::new();
        let (a, _) = table.insert_with(|_| 1);
        let (b, _) = table.insert_with(|_| 2);
        let (c, _) = table.insert_with(|_| 3);
        table.remove(b);

        let ids: Vec<HandleId> = table.snapshot().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![a, c]);

        let mut sum = 0;
        table.for_each(|_, value| sum += **value);
        assert_eq!(sum, 4);
    }

    #[test]
    fn test_for_each_may_mutate_table() {
        let table = HandleTable::new();
        table.insert_with(|_| ());
        table.insert_with(|_| ());

        table.for_each(|id, _| {
            table.remove(id);
        });
        assert!(table.is_empty());
    }

    #[test]
    fn test_drain() {
        let table = HandleTable::new();
        table.insert_with(|_| 'a');
        table.insert_with(|_| 'b');

        let drained = table.drain();
        assert_eq!(drained.len(), 2);
        assert!(table.is_empty());
        assert!(table.snapshot().is_empty());
    }

    #[test]
    fn test_concurrent_remove_has_single_winner() {
        let table = Arc::new(HandleTable::new());
        let (id, _) = table.insert_with(|_| 0u8);

        let winners: usize = (0..8)
            .map(|_| {
                let table = table.clone();
                thread::spawn(move || table.remove(id).is_some() as usize)
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .sum();

        assert_eq!(winners, 1);
    }

    #[test]
    fn test_concurrent_inserts_issue_unique_ids() {
        let table = Arc::new(HandleTable::new());

        let mut ids: Vec<HandleId> = (0..4)
            .map(|_| {
                let table = table.clone();
                thread::spawn(move || {
                    (0..100)
                        .map(|_| table.insert_with(|_| ()).0)
                        .collect::<Vec<_>>()
                })
            })
            .collect::<Vec<_>>()
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();

        assert_eq!(table.len(), 400);
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 400);
    }
}
