//! Generation-checked arena
//!
//! Expressions and nodes live in arenas and refer to each other by
//! [`Index`]. Removing an entry bumps its slot's generation, so an index
//! kept past teardown fails the lookup instead of aliasing whatever
//! reuses the slot.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use crate::error::{ExecError, ExecResult};

/// Typed handle into an [`Arena`]
pub struct Index<T> {
    slot: u32,
    generation: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Index<T> {
    fn new(slot: u32, generation: u32) -> Self {
        Self {
            slot,
            generation,
            _marker: PhantomData,
        }
    }

    /// Rebuild an index from its parts. Lookups through it are still
    /// generation checked.
    pub fn from_raw_parts(slot: u32, generation: u32) -> Self {
        Self::new(slot, generation)
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl<T> Clone for Index<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Index<T> {}

impl<T> PartialEq for Index<T> {
    fn eq(&self, other: &Self) -> bool {
        self.slot == other.slot && self.generation == other.generation
    }
}

impl<T> Eq for Index<T> {}

impl<T> Hash for Index<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.slot.hash(state);
        self.generation.hash(state);
    }
}

impl<T> PartialOrd for Index<T> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Index<T> {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.slot, self.generation).cmp(&(other.slot, other.generation))
    }
}

impl<T> fmt::Debug for Index<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}v{}", self.slot, self.generation)
    }
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Slot storage with free-slot reuse and generation checks
pub struct Arena<T> {
    kind: &'static str,
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Arena<T> {
    /// Create an empty arena; `kind` names the entries in error messages
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            slots: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }

    pub fn insert(&mut self, value: T) -> Index<T> {
        self.len += 1;
        if let Some(slot) = self.free.pop() {
            let entry = &mut self.slots[slot as usize];
            entry.value = Some(value);
            return Index::new(slot, entry.generation);
        }
        let slot = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        Index::new(slot, 0)
    }

    /// Remove an entry and retire its index
    pub fn remove(&mut self, index: Index<T>) -> Option<T> {
        let entry = self.slots.get_mut(index.slot as usize)?;
        if entry.generation != index.generation || entry.value.is_none() {
            return None;
        }
        let value = entry.value.take();
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(index.slot);
        self.len -= 1;
        value
    }

    pub fn contains(&self, index: Index<T>) -> bool {
        self.try_get(index).is_some()
    }

    pub fn try_get(&self, index: Index<T>) -> Option<&T> {
        self.slots
            .get(index.slot as usize)
            .filter(|entry| entry.generation == index.generation)
            .and_then(|entry| entry.value.as_ref())
    }

    pub fn try_get_mut(&mut self, index: Index<T>) -> Option<&mut T> {
        self.slots
            .get_mut(index.slot as usize)
            .filter(|entry| entry.generation == index.generation)
            .and_then(|entry| entry.value.as_mut())
    }

    /// Checked lookup; a stale index is an internal error
    pub fn get(&self, index: Index<T>) -> ExecResult<&T> {
        let kind = self.kind;
        self.try_get(index).ok_or(ExecError::StaleReference {
            kind,
            slot: index.slot,
            generation: index.generation,
        })
    }

    pub fn get_mut(&mut self, index: Index<T>) -> ExecResult<&mut T> {
        let kind = self.kind;
        self.try_get_mut(index).ok_or(ExecError::StaleReference {
            kind,
            slot: index.slot,
            generation: index.generation,
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Live entries in slot order
    pub fn iter(&self) -> impl Iterator<Item = (Index<T>, &T)> {
        self.slots.iter().enumerate().filter_map(|(slot, entry)| {
            entry
                .value
                .as_ref()
                .map(|value| (Index::new(slot as u32, entry.generation), value))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut arena = Arena::new("thing");
        let a = arena.insert("a");
        let b = arena.insert("b");
        assert_eq!(*arena.get(a).unwrap(), "a");
        assert_eq!(*arena.get(b).unwrap(), "b");
        assert_eq!(arena.len(), 2);
    }

    #[test]
    fn test_stale_index_is_rejected_after_reuse() {
        let mut arena = Arena::new("thing");
        let a = arena.insert(1);
        assert_eq!(arena.remove(a), Some(1));

        let b = arena.insert(2);
        assert_eq!(a.slot(), b.slot());
        assert!(arena.try_get(a).is_none());
        assert!(matches!(
            arena.get(a),
            Err(ExecError::StaleReference { kind: "thing", .. })
        ));
        assert_eq!(*arena.get(b).unwrap(), 2);
    }

    #[test]
    fn test_double_remove_is_noop() {
        let mut arena = Arena::new("thing");
        let a = arena.insert(1);
        assert!(arena.remove(a).is_some());
        assert!(arena.remove(a).is_none());
        assert!(arena.is_empty());
    }

    #[test]
    fn test_iter_skips_removed() {
        let mut arena = Arena::new("thing");
        let a = arena.insert(1);
        let _b = arena.insert(2);
        arena.remove(a);
        let values: Vec<_> = arena.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec![2]);
    }
}
