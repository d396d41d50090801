/// Generation-tagged slot arena.
///
/// Friends and groups are addressed by small integer handles. A removed
/// slot bumps its generation, so a handle kept past removal never aliases
/// the entry that later reuses the slot.
use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Handle {
    index: u32,
    generation: u32,
}

impl Handle {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}v{}", self.index, self.generation)
    }
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Slot<T>>,
    /// Vacant indices, lowest reused first.
    free: BTreeSet<u32>,
    limit: usize,
    len: usize,
}

impl<T> Arena<T> {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: BTreeSet::new(),
            limit,
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    /// Insert `value`, handing it back when the arena is full.
    pub fn try_insert(&mut self, value: T) -> Result<Handle, T> {
        if self.len >= self.limit {
            return Err(value);
        }
        let index = match self.free.pop_first() {
            Some(index) => index,
            None => {
                let Ok(index) = u32::try_from(self.slots.len()) else {
                    return Err(value);
                };
                self.slots.push(Slot {
                    generation: 0,
                    value: None,
                });
                index
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.value = Some(value);
        self.len += 1;
        Ok(Handle {
            index,
            generation: slot.generation,
        })
    }

    pub fn get(&self, handle: Handle) -> Option<&T> {
        self.slots
            .get(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.value.as_ref())
    }

    pub fn get_mut(&mut self, handle: Handle) -> Option<&mut T> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|s| s.generation == handle.generation)
            .and_then(|s| s.value.as_mut())
    }

    pub fn remove(&mut self, handle: Handle) -> Option<T> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let value = slot.value.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.insert(handle.index);
        self.len -= 1;
        Some(value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Handle, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, s)| {
            s.value.as_ref().map(|v| {
                (
                    Handle {
                        index: i as u32,
                        generation: s.generation,
                    },
                    v,
                )
            })
        })
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (Handle, &mut T)> {
        self.slots.iter_mut().enumerate().filter_map(|(i, s)| {
            let generation = s.generation;
            s.value.as_mut().map(|v| {
                (
                    Handle {
                        index: i as u32,
                        generation,
                    },
                    v,
                )
            })
        })
    }

    pub fn handles(&self) -> Vec<Handle> {
        self.iter().map(|(h, _)| h).collect()
    }
}

/// Local handle of a friend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FriendId(pub(crate) Handle);

impl fmt::Display for FriendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "friend#{}", self.0)
    }
}

/// Local handle of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupNumber(pub(crate) Handle);

impl fmt::Display for GroupNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let mut arena = Arena::with_limit(4);
        let a = arena.try_insert("a").unwrap();
        let b = arena.try_insert("b").unwrap();
        assert_eq!(arena.get(a), Some(&"a"));
        assert_eq!(arena.len(), 2);
        assert_eq!(arena.remove(a), Some("a"));
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.remove(a), None);
        assert_eq!(arena.get(b), Some(&"b"));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn reused_slot_does_not_alias_stale_handle() {
        let mut arena = Arena::with_limit(4);
        let old = arena.try_insert(1).unwrap();
        arena.remove(old);
        let new = arena.try_insert(2).unwrap();
        assert_eq!(new.index(), old.index());
        assert_ne!(new.generation(), old.generation());
        assert_eq!(arena.get(old), None);
        assert_eq!(arena.get(new), Some(&2));
    }

    #[test]
    fn lowest_free_index_reused_first() {
        let mut arena = Arena::with_limit(8);
        let handles: Vec<_> = (0..4).map(|i| arena.try_insert(i).unwrap()).collect();
        arena.remove(handles[2]);
        arena.remove(handles[1]);
        assert_eq!(arena.try_insert(9).unwrap().index(), 1);
        assert_eq!(arena.try_insert(9).unwrap().index(), 2);
        assert_eq!(arena.try_insert(9).unwrap().index(), 4);
    }

    #[test]
    fn limit_is_enforced() {
        let mut arena = Arena::with_limit(2);
        arena.try_insert(1).unwrap();
        arena.try_insert(2).unwrap();
        assert_eq!(arena.try_insert(3), Err(3));
    }

    #[test]
    fn iter_visits_live_entries_in_index_order() {
        let mut arena = Arena::with_limit(8);
        let a = arena.try_insert('a').unwrap();
        let b = arena.try_insert('b').unwrap();
        arena.try_insert('c').unwrap();
        arena.remove(b);
        let seen: Vec<_> = arena.iter().map(|(_, v)| *v).collect();
        assert_eq!(seen, vec!['a', 'c']);
        for (_, v) in arena.iter_mut() {
            *v = v.to_ascii_uppercase();
        }
        assert_eq!(arena.get(a), Some(&'A'));
    }
}
