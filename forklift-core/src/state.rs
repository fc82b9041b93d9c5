//! Process-wide mutable state shared with workers.
//!
//! The authoritative copy lives in the pool's process; every worker
//! keeps a mirror that its router thread updates from
//! `update_state_value` / `cancel` notifications. Compound updates go
//! through [`StateMap::lock`]. The guard must not be held across an
//! IPC send: the peer may be blocked waiting on the same update path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;

use crate::SubmissionId;

/// Reserved key holding the host-defined state bag.
pub const CURRENT_STATE_KEY: &str = "current_state";

/// Reserved key carrying the cancel flag for one submission.
pub fn cancel_key(id: SubmissionId) -> String {
    format!("cancel:{}", id)
}

/// Concurrently accessible string-keyed map of JSON values.
///
/// Cloning shares the underlying map.
#[derive(Clone, Default)]
pub struct StateMap {
    inner: Arc<Mutex<HashMap<String, Value>>>,
}

impl StateMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn locked(&self) -> MutexGuard<'_, HashMap<String, Value>> {
        // A panic while holding the lock leaves the map usable.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Read one key, cloning the value out.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.locked().get(key).cloned()
    }

    /// Set one key. A `Null` value removes the key, which is how cancel
    /// flags are purged from worker mirrors after a terminal frame.
    pub fn set(&self, key: &str, value: Value) {
        let mut map = self.locked();
        if value.is_null() {
            map.remove(key);
        } else {
            map.insert(key.to_string(), value);
        }
    }

    /// Remove one key. Returns whether it was present.
    pub fn remove(&self, key: &str) -> bool {
        self.locked().remove(key).is_some()
    }

    /// Read a boolean flag; an absent key counts as `false`.
    pub fn flag(&self, key: &str) -> bool {
        matches!(self.locked().get(key), Some(Value::Bool(true)))
    }

    /// Snapshot the whole map, e.g. for seeding a new worker.
    pub fn snapshot(&self) -> HashMap<String, Value> {
        self.locked().clone()
    }

    /// Bulk-insert entries (worker handshake seeding).
    pub fn seed(&self, entries: HashMap<String, Value>) {
        self.locked().extend(entries);
    }

    /// Take the update lock for a compound read-modify-write.
    pub fn lock(&self) -> StateGuard<'_> {
        StateGuard {
            guard: self.locked(),
        }
    }
}

impl std::fmt::Debug for StateMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMap")
            .field("len", &self.locked().len())
            .finish()
    }
}

/// Exclusive view of the map for compound updates.
pub struct StateGuard<'a> {
    guard: MutexGuard<'a, HashMap<String, Value>>,
}

impl StateGuard<'_> {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.guard.get(key)
    }

    pub fn set(&mut self, key: &str, value: Value) {
        if value.is_null() {
            self.guard.remove(key);
        } else {
            self.guard.insert(key.to_string(), value);
        }
    }

    pub fn remove(&mut self, key: &str) -> bool {
        self.guard.remove(key).is_some()
    }
}

#[cfg(test)]
#[path = "tests/state_tests.rs"]
mod tests;
