//! Connection table
//!
//! A slab whose handles carry a generation. Event tokens are built from
//! these handles, so an event queued for a connection that has since been
//! closed no longer matches whatever reuses its slot.

use std::fmt;

/// Stable handle to a value stored in a [`Table`]
///
/// The generation changes every time a slot is vacated, so a handle kept
/// past the removal of its value never reaches whatever is stored in the
/// slot afterwards
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Id {
    slot: u32,
    generation: u32,
}

impl Id {
    /// Largest slot index; keeps encoded event tokens clear of the
    /// reserved values at the top of the `u64` range
    pub const MAX_SLOT: u32 = (1 << 31) - 2;

    pub(crate) fn from_parts(slot: u32, generation: u32) -> Self {
        Id { slot, generation }
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.slot, self.generation)
    }
}

struct Entry<T> {
    generation: u32,
    value: Option<T>,
}

/// Slab keyed by generation-checked [`Id`]s
///
/// Slots freed by [`remove`](Self::remove) are reused by later insertions
pub struct Table<T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Table<T> {
    /// Create an empty table with room for `capacity` values
    pub fn with_capacity(capacity: usize) -> Self {
        Table {
            entries: Vec::with_capacity(capacity),
            free: Vec::new(),
            len: 0,
        }
    }

    /// Insert a value built from its own id
    ///
    /// Returns `None` once every representable slot is taken
    pub fn insert_with(&mut self, make: impl FnOnce(Id) -> T) -> Option<Id> {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                let slot = u32::try_from(self.entries.len()).ok()?;
                if slot > Id::MAX_SLOT {
                    return None;
                }
                self.entries.push(Entry {
                    generation: 0,
                    value: None,
                });
                slot
            }
        };

        let entry = &mut self.entries[slot as usize];
        let id = Id::from_parts(slot, entry.generation);
        entry.value = Some(make(id));
        self.len += 1;

        Some(id)
    }

    /// Insert a value
    pub fn insert(&mut self, value: T) -> Option<Id> {
        self.insert_with(|_| value)
    }

    /// Get the value for `id`, unless it was removed since
    pub fn get(&self, id: Id) -> Option<&T> {
        self.entries
            .get(id.slot as usize)
            .filter(|e| e.generation == id.generation)
            .and_then(|e| e.value.as_ref())
    }

    /// Get the value for `id` mutably, unless it was removed since
    pub fn get_mut(&mut self, id: Id) -> Option<&mut T> {
        self.entries
            .get_mut(id.slot as usize)
            .filter(|e| e.generation == id.generation)
            .and_then(|e| e.value.as_mut())
    }

    /// Remove and return the value for `id`
    ///
    /// Removing an id twice returns `None` the second time
    pub fn remove(&mut self, id: Id) -> Option<T> {
        let entry = self
            .entries
            .get_mut(id.slot as usize)
            .filter(|e| e.generation == id.generation)?;

        let value = entry.value.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(id.slot);
        self.len -= 1;

        Some(value)
    }

    /// Ids of every stored value
    pub fn ids(&self) -> Vec<Id> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.value.is_some())
            .map(|(slot, e)| Id::from_parts(slot as u32, e.generation))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Self::with_capacity(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_get_remove() {
        let mut table = Table::default();
        let a = table.insert("a").unwrap();
        let b = table.insert("b").unwrap();

        assert_eq!(table.len(), 2);
        assert_eq!(table.get(a), Some(&"a"));
        assert_eq!(table.get(b), Some(&"b"));

        assert_eq!(table.remove(a), Some("a"));
        assert_eq!(table.remove(a), None);
        assert_eq!(table.get(a), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_stale_id_does_not_reach_reused_slot() {
        let mut table = Table::default();
        let old = table.insert(1).unwrap();
        table.remove(old);

        let new = table.insert(2).unwrap();
        assert_eq!(new.slot(), old.slot());
        assert_ne!(new.generation(), old.generation());

        assert_eq!(table.get(old), None);
        assert_eq!(table.get_mut(old), None);
        assert_eq!(table.remove(old), None);
        assert_eq!(table.get(new), Some(&2));
    }

    #[test]
    fn test_insert_with_sees_own_id() {
        let mut table = Table::default();
        let id = table.insert_with(|id| id).unwrap();
        assert_eq!(table.get(id), Some(&id));
    }

    #[test]
    fn test_ids_lists_live_values() {
        let mut table = Table::default();
        let a = table.insert('a').unwrap();
        let b = table.insert('b').unwrap();
        let c = table.insert('c').unwrap();
        table.remove(b);

        let ids = table.ids();
        assert_eq!(ids, vec![a, c]);
        assert!(!table.is_empty());
    }
}
