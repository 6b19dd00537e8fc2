//! Thread-safe keyed maps backing the store

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Generic, thread-safe in-memory map of resources keyed by ID
#[derive(Debug)]
pub struct StateStore<T> {
    items: RwLock<HashMap<String, T>>,
}

impl<T> Default for StateStore<T> {
    fn default() -> Self {
        Self {
            items: RwLock::new(HashMap::new()),
        }
    }
}

impl<T: Clone> StateStore<T> {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, T>> {
        self.items.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, T>> {
        self.items.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Get a copy of the value stored under `id`
    pub fn get(&self, id: &str) -> Option<T> {
        self.read().get(id).cloned()
    }

    /// Whether `id` is present
    pub fn contains(&self, id: &str) -> bool {
        self.read().contains_key(id)
    }

    /// Store `item` under `id`, overwriting any previous value
    pub fn put(&self, id: impl Into<String>, item: T) {
        self.write().insert(id.into(), item);
    }

    /// Store `item` under `id` unless the key is taken.
    ///
    /// Returns false and leaves the map untouched when `id` already exists.
    pub fn put_if_absent(&self, id: &str, item: T) -> bool {
        let mut items = self.write();
        if items.contains_key(id) {
            return false;
        }
        items.insert(id.to_string(), item);
        true
    }

    /// Remove `id`; returns true if it existed
    pub fn delete(&self, id: &str) -> bool {
        self.write().remove(id).is_some()
    }

    /// Snapshot of all values
    pub fn list(&self) -> Vec<T> {
        self.read().values().cloned().collect()
    }

    /// Snapshot of all `(key, value)` pairs
    pub fn entries(&self) -> Vec<(String, T)> {
        self.read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Snapshot of all keys
    pub fn keys(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    /// Values matching `pred`
    pub fn filter(&self, pred: impl Fn(&T) -> bool) -> Vec<T> {
        self.read().values().filter(|v| pred(v)).cloned().collect()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.read().len()
    }

    /// Whether the store is empty
    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Atomically read, modify and write back the value under `id`.
    ///
    /// Returns false without invoking `f` when `id` is missing.
    pub fn update(&self, id: &str, f: impl FnOnce(&mut T)) -> bool {
        let mut items = self.write();
        match items.get_mut(id) {
            Some(v) => {
                f(v);
                true
            }
            None => false,
        }
    }

    /// Remove every entry for which `pred` returns true and return the removed values.
    ///
    /// The write lock is held for the whole iteration.
    pub fn prune_if(&self, pred: impl Fn(&str, &T) -> bool) -> Vec<T> {
        let mut items = self.write();
        let doomed: Vec<String> = items
            .iter()
            .filter(|(k, v)| pred(k, v))
            .map(|(k, _)| k.clone())
            .collect();
        doomed.into_iter().filter_map(|k| items.remove(&k)).collect()
    }
}

/// Concurrent map for transient per-resource handles
#[derive(Debug)]
pub struct SyncMap<T> {
    items: Mutex<HashMap<String, T>>,
}

impl<T> Default for SyncMap<T> {
    fn default() -> Self {
        Self {
            items: Mutex::new(HashMap::new()),
        }
    }
}

impl<T> SyncMap<T> {
    /// Create an empty map
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, T>> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store `value` under `key`
    pub fn store(&self, key: impl Into<String>, value: T) {
        self.lock().insert(key.into(), value);
    }

    /// Remove and return the value under `key`
    pub fn load_and_delete(&self, key: &str) -> Option<T> {
        self.lock().remove(key)
    }

    /// Whether `key` is present
    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    /// Remove `key`
    pub fn delete(&self, key: &str) {
        self.lock().remove(key);
    }

    /// Snapshot of all keys
    pub fn keys(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    /// Run `f` against the value under `key`, inserting `T::default()` first if absent
    pub fn with_entry<R>(&self, key: &str, f: impl FnOnce(&mut T) -> R) -> R
    where
        T: Default,
    {
        let mut items = self.lock();
        f(items.entry(key.to_string()).or_default())
    }
}

impl<T: Clone> SyncMap<T> {
    /// Copy of the value under `key`
    pub fn load(&self, key: &str) -> Option<T> {
        self.lock().get(key).cloned()
    }

    /// Return the existing value under `key` or store the one produced by `f`
    pub fn load_or_store_with(&self, key: &str, f: impl FnOnce() -> T) -> T {
        self.lock().entry(key.to_string()).or_insert_with(f).clone()
    }
}
