//! A map which only remembers the `n` most-recently used entries.
//!
//! Used to bound the in-memory chunks of a [`DataArray`](crate::DataArray)
//! and the live instances of a [`CapDict`](crate::CapDict). Not internally
//! synchronized; owners wrap it in their own mutex.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

type EvictHandler<K, V> = Box<dyn FnMut(&K, V) + Send>;

/// A bounded most-recently-used map with an optional eviction callback.
pub struct LruCache<K, V> {
    capacity: usize,
    map: HashMap<K, V>,
    /// Keys in use order: least recent at the front.
    order: VecDeque<K>,
    on_evict: Option<EvictHandler<K, V>>,
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
    /// A cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "LRU cache needs a nonzero capacity");
        Self {
            capacity,
            map: HashMap::new(),
            order: VecDeque::new(),
            on_evict: None,
        }
    }

    /// Registers a callback invoked with each expelled entry.
    pub fn set_evict_handler(&mut self, handler: impl FnMut(&K, V) + Send + 'static) {
        self.on_evict = Some(Box::new(handler));
    }

    /// Inserts an entry, marking it most recently used. Evicts the least
    /// recently used entries above capacity. Returns the displaced value
    /// for the same key, if any.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let displaced = self.map.insert(key.clone(), value);
        self.touch(&key);
        while self.map.len() > self.capacity {
            if let Some(old_key) = self.order.pop_front() {
                if let Some(old_value) = self.map.remove(&old_key) {
                    if let Some(on_evict) = &mut self.on_evict {
                        on_evict(&old_key, old_value);
                    }
                }
            }
        }
        displaced
    }

    /// Looks up an entry, marking it most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        if self.map.contains_key(key) {
            self.touch(key);
        }
        self.map.get(key)
    }

    /// Mutable lookup, marking the entry most recently used.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        if self.map.contains_key(key) {
            self.touch(key);
        }
        self.map.get_mut(key)
    }

    /// Removes an entry. The eviction callback is not invoked.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.order.retain(|k| k != key);
        self.map.remove(key)
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.map.clear();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    /// Entries in no particular order; does not affect recency.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.map.iter()
    }

    /// Keys in no particular order; does not affect recency.
    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.map.keys()
    }

    fn touch(&mut self, key: &K) {
        if let Some(at) = self.order.iter().position(|k| k == key) {
            self.order.remove(at);
        }
        self.order.push_back(key.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn keeps_only_the_most_recent_entries() {
        let mut cache = LruCache::new(2);
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.insert("c", 3);
        assert!(!cache.contains(&"a"));
        assert!(cache.contains(&"b"));
        assert!(cache.contains(&"c"));
    }

    #[test]
    fn get_refreshes_recency() {
        let mut cache = LruCache::new(2);
        cache.insert("a", 1);
        cache.insert("b", 2);
        assert_eq!(cache.get(&"a"), Some(&1));
        cache.insert("c", 3);
        // "b" was the least recently used, not "a".
        assert!(cache.contains(&"a"));
        assert!(!cache.contains(&"b"));
    }

    #[test]
    fn eviction_callback_sees_expelled_entries() {
        let expelled = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&expelled);
        let mut cache = LruCache::new(1);
        cache.set_evict_handler(move |k: &&str, v: i32| log.lock().unwrap().push((*k, v)));
        cache.insert("a", 1);
        cache.insert("b", 2);
        cache.insert("c", 3);
        assert_eq!(*expelled.lock().unwrap(), vec![("a", 1), ("b", 2)]);
    }

    #[test]
    fn remove_skips_the_callback() {
        let expelled = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&expelled);
        let mut cache = LruCache::new(4);
        cache.set_evict_handler(move |k: &&str, v: i32| log.lock().unwrap().push((*k, v)));
        cache.insert("a", 1);
        assert_eq!(cache.remove(&"a"), Some(1));
        assert!(expelled.lock().unwrap().is_empty());
    }

    #[test]
    fn reinsert_replaces_in_place() {
        let mut cache = LruCache::new(2);
        cache.insert("a", 1);
        assert_eq!(cache.insert("a", 10), Some(1));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&"a"), Some(&10));
    }
}
