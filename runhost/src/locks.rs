//! Per-instance mutual exclusion.
//!
//! Create, update, remove and the engine's terminal write for the same
//! `(collection, id)` run one at a time. Different ids never contend.

use std::collections::HashSet;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

#[derive(Debug, Default)]
pub struct KeyedLocks {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

/// Holds the lock for one key until dropped.
#[must_use = "the key is unlocked as soon as the guard is dropped"]
pub struct KeyedGuard {
    locks: Arc<KeyedLocks>,
    key: String,
}

impl KeyedLocks {
    /// Block until `key` is free, then hold it.
    pub fn lock(self: &Arc<Self>, key: &str) -> KeyedGuard {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        while held.contains(key) {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        held.insert(key.to_string());
        KeyedGuard {
            locks: Arc::clone(self),
            key: key.to_string(),
        }
    }
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        let mut held = self
            .locks
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        held.remove(&self.key);
        self.locks.released.notify_all();
    }
}
