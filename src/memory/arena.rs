//! Generational arena for kernel records.
//!
//! WMEs, preferences, slots, instantiations, productions, and goal dependency
//! sets reference each other in cycles. Each record lives in an [`Arena`] and
//! is addressed by a small copyable key carrying a generation, so a key that
//! outlives its record is detected instead of silently aliasing a new one.

use std::fmt;
use std::marker::PhantomData;

use serde::{Deserialize, Serialize};

/// Typed handle into an [`Arena`].
pub trait ArenaKey: Copy + Eq + std::hash::Hash + fmt::Debug {
    /// Human-readable record kind, used in diagnostics.
    const KIND: &'static str;

    fn from_parts(index: u32, generation: u32) -> Self;
    fn index(self) -> u32;
    fn generation(self) -> u32;
}

macro_rules! define_key {
    ($(#[$meta:meta])* $name:ident, $kind:literal, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name {
            index: u32,
            generation: u32,
        }

        impl ArenaKey for $name {
            const KIND: &'static str = $kind;

            fn from_parts(index: u32, generation: u32) -> Self {
                Self { index, generation }
            }

            fn index(self) -> u32 {
                self.index
            }

            fn generation(self) -> u32 {
                self.generation
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.index)
            }
        }
    };
}

define_key!(
    /// Handle to a working-memory element.
    WmeId, "wme", "w"
);
define_key!(
    /// Handle to a preference.
    PrefId, "preference", "p"
);
define_key!(
    /// Handle to an (identifier, attribute) slot.
    SlotId, "slot", "slot"
);
define_key!(
    /// Handle to an instantiation.
    InstId, "instantiation", "i"
);
define_key!(
    /// Handle to a production.
    ProdId, "production", "prod"
);
define_key!(
    /// Handle to a goal dependency set.
    GdsId, "gds", "gds"
);
define_key!(
    /// Handle to a pending match-set change.
    MscId, "match-set-change", "msc"
);

#[derive(Debug, Clone)]
struct Entry<V> {
    generation: u32,
    value: Option<V>,
}

/// Slot-reusing storage with generation-checked keys.
#[derive(Debug, Clone)]
pub struct Arena<K, V> {
    entries: Vec<Entry<V>>,
    free: Vec<u32>,
    len: usize,
    _key: PhantomData<K>,
}

impl<K: ArenaKey, V> Default for Arena<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: ArenaKey, V> Arena<K, V> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            len: 0,
            _key: PhantomData,
        }
    }

    /// Store a value and return its key.
    pub fn insert(&mut self, value: V) -> K {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index as usize];
            entry.generation = entry.generation.wrapping_add(1);
            entry.value = Some(value);
            return K::from_parts(index, entry.generation);
        }
        let index = self.entries.len() as u32;
        self.entries.push(Entry {
            generation: 0,
            value: Some(value),
        });
        K::from_parts(index, 0)
    }

    /// Remove a value, returning it if the key was live.
    pub fn remove(&mut self, key: K) -> Option<V> {
        let entry = self.entries.get_mut(key.index() as usize)?;
        if entry.generation != key.generation() {
            return None;
        }
        let value = entry.value.take()?;
        self.free.push(key.index());
        self.len -= 1;
        Some(value)
    }

    pub fn get(&self, key: K) -> Option<&V> {
        self.entries
            .get(key.index() as usize)
            .filter(|e| e.generation == key.generation())
            .and_then(|e| e.value.as_ref())
    }

    pub fn get_mut(&mut self, key: K) -> Option<&mut V> {
        self.entries
            .get_mut(key.index() as usize)
            .filter(|e| e.generation == key.generation())
            .and_then(|e| e.value.as_mut())
    }

    pub fn contains(&self, key: K) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Iterate over live entries in index order.
    pub fn iter(&self) -> impl Iterator<Item = (K, &V)> {
        self.entries.iter().enumerate().filter_map(|(i, e)| {
            e.value
                .as_ref()
                .map(|v| (K::from_parts(i as u32, e.generation), v))
        })
    }

    /// Keys of all live entries, collected so the arena can be mutated while
    /// walking them.
    pub fn keys(&self) -> Vec<K> {
        self.iter().map(|(k, _)| k).collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.free.clear();
        self.len = 0;
    }
}

impl<K: ArenaKey, V> std::ops::Index<K> for Arena<K, V> {
    type Output = V;

    fn index(&self, key: K) -> &V {
        match self.get(key) {
            Some(v) => v,
            None => panic!("stale {} handle {:?}", K::KIND, key),
        }
    }
}

impl<K: ArenaKey, V> std::ops::IndexMut<K> for Arena<K, V> {
    fn index_mut(&mut self, key: K) -> &mut V {
        match self.get_mut(key) {
            Some(v) => v,
            None => panic!("stale {} handle {:?}", K::KIND, key),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let mut arena: Arena<WmeId, &str> = Arena::new();
        let a = arena.insert("a");
        let b = arena.insert("b");
        assert_eq!(arena.len(), 2);
        assert_eq!(arena[a], "a");
        assert_eq!(arena.remove(a), Some("a"));
        assert!(!arena.contains(a));
        assert_eq!(arena.get(b), Some(&"b"));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn stale_key_does_not_alias_reused_slot() {
        let mut arena: Arena<PrefId, u32> = Arena::new();
        let old = arena.insert(1);
        arena.remove(old);
        let new = arena.insert(2);
        assert_eq!(old.index(), new.index());
        assert!(arena.get(old).is_none());
        assert_eq!(arena[new], 2);
        assert_eq!(arena.remove(old), None);
    }

    #[test]
    #[should_panic(expected = "stale preference handle")]
    fn indexing_stale_key_panics() {
        let mut arena: Arena<PrefId, u32> = Arena::new();
        let k = arena.insert(1);
        arena.remove(k);
        let _ = arena[k];
    }

    #[test]
    fn iteration_skips_removed() {
        let mut arena: Arena<InstId, u32> = Arena::new();
        let keys: Vec<_> = (0..5).map(|i| arena.insert(i)).collect();
        arena.remove(keys[1]);
        arena.remove(keys[3]);
        let values: Vec<u32> = arena.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec![0, 2, 4]);
        assert_eq!(arena.keys().len(), 3);
    }

    #[test]
    fn key_display_uses_prefix() {
        let mut arena: Arena<WmeId, ()> = Arena::new();
        let k = arena.insert(());
        assert_eq!(k.to_string(), "w0");
    }
}
