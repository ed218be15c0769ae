use std::{hash::Hash, num::NonZeroUsize};

use lru::LruCache;
use parking_lot::Mutex;

use super::CacheError;

/// Fixed capacity container evicting the least recently used entry.
///
/// All operations take an internal lock, so a store can be shared between
/// threads behind an `Arc`.
#[derive(Debug)]
pub struct KeyedStore<K: Hash + Eq, V> {
    inner: Mutex<LruCache<K, V>>,
}

/// Outcome of [`KeyedStore::remove_if`].
#[derive(Debug, PartialEq, Eq)]
pub enum Removal<V> {
    Removed(V),
    /// The key is present but the predicate rejected its value.
    Kept,
    Absent,
}

impl<K: Hash + Eq + Clone, V: Clone> KeyedStore<K, V> {
    pub fn new(capacity: usize) -> Result<Self, CacheError> {
        let capacity =
            NonZeroUsize::new(capacity).ok_or(CacheError::InvalidCapacity(capacity))?;
        Ok(Self {
            inner: Mutex::new(LruCache::new(capacity)),
        })
    }

    /// Look up a value, marking it as the most recently used.
    pub fn get(&self, key: &K) -> Option<V> {
        self.inner.lock().get(key).cloned()
    }

    /// Look up a value without touching recency.
    pub fn peek(&self, key: &K) -> Option<V> {
        self.inner.lock().peek(key).cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        self.inner.lock().contains(key)
    }

    /// Insert or overwrite a value. Returns the entry evicted to make room for
    /// it, if any. Overwriting an existing key never evicts.
    pub fn put(&self, key: K, value: V) -> Option<(K, V)> {
        let mut inner = self.inner.lock();
        match inner.push(key.clone(), value) {
            Some((old_key, old_value)) if old_key != key => Some((old_key, old_value)),
            _ => None,
        }
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.inner.lock().pop(key)
    }

    /// Remove the entry only if `predicate` accepts its current value.
    pub fn remove_if<F>(&self, key: &K, predicate: F) -> Removal<V>
    where
        F: FnOnce(&V) -> bool,
    {
        let mut inner = self.inner.lock();
        let accepted = match inner.peek(key) {
            Some(value) => predicate(value),
            None => return Removal::Absent,
        };
        if !accepted {
            return Removal::Kept;
        }
        match inner.pop(key) {
            Some(value) => Removal::Removed(value),
            None => Removal::Absent,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().cap().get()
    }

    pub fn clear(&self) {
        self.inner.lock().clear()
    }
}
