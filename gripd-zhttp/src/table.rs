//! Slab-backed session storage.
//!
//! Sessions live in an arena with stable integer slots; lookups by wire
//! identifier go through a side index. Freed slots are recycled by the
//! slab, and the index is the only path in, so a removed session can
//! never be aliased by a later one through a stale key.

use std::collections::HashMap;
use std::hash::Hash;

use slab::Slab;

pub(crate) struct SessionTable<K, V> {
    entries: Slab<(K, V)>,
    index: HashMap<K, usize>,
}

impl<K: Eq + Hash + Clone, V> SessionTable<K, V> {
    pub fn new() -> Self {
        Self {
            entries: Slab::new(),
            index: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Store a session, returning its slot. A colliding key replaces the
    /// previous entry.
    pub fn insert(&mut self, key: K, value: V) -> usize {
        if let Some(old) = self.index.remove(&key) {
            let _ = self.entries.try_remove(old);
        }
        let slot = self.entries.insert((key.clone(), value));
        self.index.insert(key, slot);
        slot
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        let slot = *self.index.get(key)?;
        self.entries.get_mut(slot).map(|(_, v)| v)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        let slot = *self.index.get(key)?;
        self.entries.get(slot).map(|(_, v)| v)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        let slot = self.index.remove(key)?;
        self.entries.try_remove(slot).map(|(_, v)| v)
    }

    /// Keep only the sessions the predicate approves, fixing the index for
    /// the rest.
    pub fn retain(&mut self, mut f: impl FnMut(&K, &mut V) -> bool) {
        let index = &mut self.index;
        self.entries.retain(|_, (k, v)| {
            if f(k, v) {
                true
            } else {
                index.remove(k);
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let mut table: SessionTable<&str, u32> = SessionTable::new();
        table.insert("a", 1);
        table.insert("b", 2);
        assert_eq!(table.len(), 2);
        assert!(table.contains(&"a"));
        assert_eq!(table.get(&"b"), Some(&2));

        *table.get_mut(&"a").unwrap() = 10;
        assert_eq!(table.remove(&"a"), Some(10));
        assert!(!table.contains(&"a"));
        assert_eq!(table.remove(&"a"), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn slots_recycle_without_aliasing() {
        let mut table: SessionTable<&str, u32> = SessionTable::new();
        let first = table.insert("a", 1);
        table.remove(&"a");
        let second = table.insert("b", 2);
        // the slab may hand back the same slot, but the old key is gone
        assert_eq!(first, second);
        assert!(!table.contains(&"a"));
        assert_eq!(table.get(&"b"), Some(&2));
    }

    #[test]
    fn insert_on_existing_key_replaces() {
        let mut table: SessionTable<&str, u32> = SessionTable::new();
        table.insert("a", 1);
        table.insert("a", 2);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(&"a"), Some(&2));
    }

    #[test]
    fn retain_keeps_index_consistent() {
        let mut table: SessionTable<u8, u32> = SessionTable::new();
        for n in 0..10 {
            table.insert(n, n as u32 * 100);
        }
        table.retain(|k, _| k % 2 == 0);
        assert_eq!(table.len(), 5);
        assert!(table.contains(&4));
        assert!(!table.contains(&5));
        // removed keys are fully gone; survivors still resolve
        assert_eq!(table.get(&6), Some(&600));
        assert_eq!(table.get(&7), None);
    }
}
