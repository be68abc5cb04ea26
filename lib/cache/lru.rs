//! Fixed-capacity LRU map.
//!
//! A thin ordered map: recency is the insertion order of a
//! [`LinkedHashMap`], refreshed by remove-and-reinsert. Displaced values are
//! handed back to the caller instead of being dropped in place, so a caller
//! holding a lock can release it before running value destructors.

use std::hash::Hash;

use hashlink::LinkedHashMap;

/// An ordered `key -> value` map that never holds more than `capacity`
/// entries. Insertion and lookup both count as a use.
pub struct LruCache<K: Eq + Hash + Clone, V> {
    map: LinkedHashMap<K, V>,
    capacity: usize,
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
    /// # Panics
    ///
    /// Panics when `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "cache capacity must be non-zero");
        Self {
            map: LinkedHashMap::new(),
            capacity,
        }
    }

    /// Insert or overwrite `key`, marking it most recently used. Returns the
    /// displaced value -- the previous value on overwrite, or the least
    /// recently used entry when the insert overflows `capacity`. The caller
    /// must drop it.
    pub fn add(&mut self, key: K, value: V) -> Option<V> {
        let replaced = self.map.remove(&key);
        self.map.insert(key, value);
        if replaced.is_some() {
            return replaced;
        }
        if self.map.len() > self.capacity {
            return self.map.pop_front().map(|(_, value)| value);
        }
        None
    }

    /// Clone out the value for `key`, marking it most recently used.
    pub fn get(&mut self, key: &K) -> Option<V>
    where
        V: Clone,
    {
        let value = self.map.remove(key)?;
        self.map.insert(key.clone(), value.clone());
        Some(value)
    }

    /// Remove `key`, returning its value for the caller to drop. Absent keys
    /// are a no-op.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.map.remove(key)
    }

    /// Empty the map, returning every value for the caller to drop.
    pub fn drain(&mut self) -> Vec<V> {
        let mut values = Vec::with_capacity(self.map.len());
        while let Some((_, value)) = self.map.pop_front() {
            values.push(value);
        }
        values
    }

    #[must_use]
    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
