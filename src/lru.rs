//! Provides the size constrained LRU store backing each cache partition.
//!
//! The store behaves just like a **Map** as long as there is no shortage in storage.
//! However, once the accounted bytes (key length plus value length per entry) exceed
//! the configured capacity, the least recently used entries are evicted until the
//! budget holds again - hence the name LRU.
//!
//! The store is deliberately **not** safe for concurrent use. It is owned by a
//! [Group](crate::group::Group) which serializes all access through its own lock, so
//! adding another layer of synchronization here would only add overhead.
//!
//! # Example
//!
//! ```
//! # use ganymede::lru::LruStore;
//! # use ganymede::value::Value;
//! // A store with a budget of 12 bytes, fitting two 6 byte entries...
//! let mut store = LruStore::new(12);
//!
//! store.add("Tom", Value::from("630"));
//! store.add("ngs", Value::from("567"));
//! assert_eq!(store.len(), 2);
//!
//! // ...which evicts "Tom" (the least recently used entry) once a third
//! // entry pushes the accounted bytes over the budget:
//! store.add("Sam", Value::from("721"));
//! assert_eq!(store.get("Tom").is_none(), true);
//! assert_eq!(store.get("Sam").is_some(), true);
//! ```
use linked_hash_map::LinkedHashMap;

use crate::value::Value;

/// Invoked with the key and value of every entry leaving the store.
pub type EvictionCallback = Box<dyn FnMut(&str, &Value) + Send>;

/// A byte-bounded map of string keys to [Values](Value) with LRU eviction.
///
/// Each entry is charged with `key.len() + value.len()` bytes. A capacity of 0 disables
/// the budget entirely, turning the store into a plain recency-ordered map.
pub struct LruStore {
    capacity: usize,
    used: usize,
    map: LinkedHashMap<String, Value>,
    on_evict: Option<EvictionCallback>,
}

impl LruStore {
    /// Creates a new store with the given capacity in bytes.
    pub fn new(capacity: usize) -> Self {
        LruStore {
            capacity,
            used: 0,
            map: LinkedHashMap::new(),
            on_evict: None,
        }
    }

    /// Creates a new store which reports every evicted or removed entry to the given
    /// callback.
    pub fn with_eviction_callback(capacity: usize, callback: EvictionCallback) -> Self {
        LruStore {
            capacity,
            used: 0,
            map: LinkedHashMap::new(),
            on_evict: Some(callback),
        }
    }

    /// Stores the given value for the given key.
    ///
    /// If the key is already present, its value is replaced, the byte accounting is
    /// adjusted by the size difference and the entry becomes the most recently used
    /// one. Afterwards entries are evicted (oldest first) until the budget holds.
    ///
    /// Note that an entry which on its own exceeds the whole capacity is evicted again
    /// immediately - the byte budget is never violated, even for a single entry.
    pub fn add(&mut self, key: &str, value: Value) {
        let charge = key.len() + value.len();

        // LinkedHashMap::insert moves an existing entry to the back, which is exactly
        // the recency promotion we need for replacements.
        match self.map.insert(key.to_owned(), value) {
            Some(previous) => {
                self.used = self.used + charge - (key.len() + previous.len());
            }
            None => {
                self.used += charge;
            }
        }

        self.enforce_capacity();
    }

    /// Returns the value stored for the given key and promotes the entry to be the
    /// most recently used one.
    pub fn get(&mut self, key: &str) -> Option<&Value> {
        match self.map.get_refresh(key) {
            Some(value) => Some(&*value),
            None => None,
        }
    }

    /// Removes the entry for the given key.
    ///
    /// The eviction callback (if present) is informed just like for a regular
    /// eviction. Fails if no entry is present for the key.
    pub fn remove(&mut self, key: &str) -> anyhow::Result<()> {
        match self.map.remove(key) {
            Some(value) => {
                self.used -= key.len() + value.len();
                if let Some(callback) = self.on_evict.as_mut() {
                    callback(key, &value);
                }
                Ok(())
            }
            None => Err(anyhow::anyhow!("key not found: {}", key)),
        }
    }

    /// Returns the number of entries in the store.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Determines if the store is completely empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Returns the number of bytes currently accounted to the stored entries.
    pub fn used_bytes(&self) -> usize {
        self.used
    }

    /// Returns the byte budget of this store (0 if unbounded).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn enforce_capacity(&mut self) {
        while self.capacity > 0 && self.used > self.capacity {
            self.evict_oldest();
        }
    }

    fn evict_oldest(&mut self) {
        match self.map.pop_front() {
            Some((key, value)) => {
                self.used -= key.len() + value.len();
                if let Some(callback) = self.on_evict.as_mut() {
                    callback(&key, &value);
                }
            }
            None => unreachable!("Failed to enforce the byte budget of an LRU store!"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::LruStore;
    use crate::value::Value;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn the_byte_budget_is_enforced() {
        // Each entry ("keyN" -> "valueN") is charged with 10 bytes...
        let mut store = LruStore::new(30);
        assert_eq!(store.capacity(), 30);

        store.add("key1", Value::from("value1"));
        store.add("key2", Value::from("value2"));
        store.add("key3", Value::from("value3"));
        assert_eq!(store.len(), 3);
        assert_eq!(store.used_bytes(), 30);

        // ...therefore a fourth entry pushes the oldest one out:
        store.add("key4", Value::from("value4"));
        assert_eq!(store.len(), 3);
        assert_eq!(store.used_bytes(), 30);
        assert_eq!(store.get("key1").is_none(), true);
        assert_eq!(store.get("key4").is_some(), true);
    }

    #[test]
    fn get_promotes_an_entry() {
        let mut store = LruStore::new(30);
        store.add("key1", Value::from("value1"));
        store.add("key2", Value::from("value2"));
        store.add("key3", Value::from("value3"));

        // Touching key1 saves it from being the eviction victim...
        assert_eq!(store.get("key1").unwrap(), &Value::from("value1"));
        store.add("key4", Value::from("value4"));

        assert_eq!(store.get("key1").is_some(), true);
        assert_eq!(store.get("key2").is_none(), true);
    }

    #[test]
    fn replacing_a_value_adjusts_the_accounting() {
        let mut store = LruStore::new(100);
        store.add("key", Value::from("value"));
        assert_eq!(store.used_bytes(), 8);

        store.add("key", Value::from("a much longer value"));
        assert_eq!(store.used_bytes(), 22);
        assert_eq!(store.len(), 1);

        store.add("key", Value::from(""));
        assert_eq!(store.used_bytes(), 3);
    }

    #[test]
    fn removing_an_unknown_key_fails() {
        let mut store = LruStore::new(100);
        store.add("key", Value::from("value"));

        assert_eq!(store.remove("key").is_ok(), true);
        assert_eq!(store.remove("key").is_err(), true);
        assert_eq!(store.used_bytes(), 0);
    }

    #[test]
    fn the_eviction_callback_observes_evictions_and_removals() {
        let evicted = Arc::new(AtomicUsize::new(0));
        let counter = evicted.clone();
        let mut store = LruStore::with_eviction_callback(
            8,
            Box::new(move |_key, _value| {
                let _ = counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        store.add("a", Value::from("1234"));
        store.add("b", Value::from("1234"));
        // "a" was evicted to make room for "b"...
        assert_eq!(evicted.load(Ordering::SeqCst), 1);

        // ...and an explicit removal is reported as well:
        store.remove("b").unwrap();
        assert_eq!(evicted.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn an_oversize_entry_is_evicted_immediately() {
        let mut store = LruStore::new(10);
        store.add("a", Value::from("1"));
        store.add("big", Value::from("way too large to fit"));

        // The budget wins: even the fresh entry is gone and the store is empty.
        assert_eq!(store.len(), 0);
        assert_eq!(store.used_bytes(), 0);
    }

    #[test]
    fn a_capacity_of_zero_disables_the_budget() {
        let mut store = LruStore::new(0);
        for i in 0..1000 {
            store.add(&format!("key-{}", i), Value::from("x"));
        }

        assert_eq!(store.len(), 1000);
        assert_eq!(store.is_empty(), false);
    }
}
