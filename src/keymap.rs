//! Thread-safe lazily-populated keyed storage for per-key engine state.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::types::Key;

/// Maps `Key -> Arc<T>` with lazy initialization under an internal lock.
///
/// Entries are never removed or relocated while the engine lives, so the
/// returned `Arc`s are stable handles that worker threads may hold across
/// iterations.
pub(crate) struct KeyMap<T> {
    entries: RwLock<HashMap<Key, Arc<T>>>,
}

impl<T> KeyMap<T> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Create the entry for `key` with `init` if absent.
    ///
    /// Returns the entry and whether this call created it. The factory
    /// runs under the map's write lock, so concurrent initializers for
    /// the same key construct the entry exactly once.
    pub fn init_with<F>(&self, key: Key, init: F) -> (Arc<T>, bool)
    where
        F: FnOnce() -> T,
    {
        let mut entries = self.entries.write().unwrap();
        if let Some(entry) = entries.get(&key) {
            return (Arc::clone(entry), false);
        }
        let entry = Arc::new(init());
        entries.insert(key, Arc::clone(&entry));
        (entry, true)
    }

    /// Look up an entry.
    pub fn get(&self, key: Key) -> Option<Arc<T>> {
        self.entries.read().unwrap().get(&key).map(Arc::clone)
    }

    /// Look up an entry that is known to exist.
    ///
    /// Panics if the key was never initialized; workers only see keys
    /// that passed validation on the API side.
    pub fn get_ref(&self, key: Key) -> Arc<T> {
        self.get(key)
            .unwrap_or_else(|| panic!("key {key} must be initialized"))
    }
}
