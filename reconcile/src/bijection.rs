//! Invertible key↔value map.
//!
//! Both sides are unique: binding a key to a value evicts whatever the key
//! was bound to before and whatever key the value was bound to before. The
//! retry emitter uses it to remember which event id is the authoritative one
//! for a resource, and to find the resource a given event id belongs to.

use std::collections::HashMap;
use std::hash::Hash;

/// A one-to-one map that can be queried from either side.
#[derive(Debug, Clone)]
pub struct KeyedBijection<K, V> {
    forward: HashMap<K, V>,
    backward: HashMap<V, K>,
}

impl<K, V> KeyedBijection<K, V>
where
    K: Eq + Hash + Clone,
    V: Eq + Hash + Clone,
{
    /// Create an empty bijection.
    pub fn new() -> Self {
        Self {
            forward: HashMap::new(),
            backward: HashMap::new(),
        }
    }

    /// Bind `key` to `value`.
    ///
    /// Returns the value previously bound to `key`, if any. A previous key
    /// bound to `value` is unbound.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        if let Some(old_key) = self.backward.remove(&value) {
            self.forward.remove(&old_key);
        }
        let previous = self.forward.insert(key.clone(), value.clone());
        if let Some(ref old_value) = previous {
            self.backward.remove(old_value);
        }
        self.backward.insert(value, key);
        previous
    }

    pub fn get_by_key(&self, key: &K) -> Option<&V> {
        self.forward.get(key)
    }

    pub fn get_by_value(&self, value: &V) -> Option<&K> {
        self.backward.get(value)
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.forward.contains_key(key)
    }

    pub fn contains_value(&self, value: &V) -> bool {
        self.backward.contains_key(value)
    }

    /// Unbind `key`, returning its value.
    pub fn remove_by_key(&mut self, key: &K) -> Option<V> {
        let value = self.forward.remove(key)?;
        self.backward.remove(&value);
        Some(value)
    }

    /// Unbind `value`, returning its key.
    pub fn remove_by_value(&mut self, value: &V) -> Option<K> {
        let key = self.backward.remove(value)?;
        self.forward.remove(&key);
        Some(key)
    }

    pub fn len(&self) -> usize {
        self.forward.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forward.is_empty()
    }

    pub fn clear(&mut self) {
        self.forward.clear();
        self.backward.clear();
    }
}

impl<K, V> Default for KeyedBijection<K, V>
where
    K: Eq + Hash + Clone,
    V: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
