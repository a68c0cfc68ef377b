//! Process-local storage backend.

use std::collections::HashMap;

use ember_session::{Result, Storage, Values};
use parking_lot::Mutex;
use tracing::trace;

/// Storage that keeps saved values in a map.
///
/// Values survive demotion but not a restart. Share one instance between
/// providers by wrapping it in an `Arc`.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    sessions: Mutex<HashMap<String, Values>>,
}

impl MemoryStorage {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored sessions.
    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Check if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}

impl Storage for MemoryStorage {
    fn save(&self, id: &str, values: &Values) -> Result<()> {
        self.sessions.lock().insert(id.to_string(), values.clone());
        trace!(session_id = %id, keys = values.len(), "Session saved in memory");
        Ok(())
    }

    fn read(&self, id: &str) -> Result<Option<Values>> {
        Ok(self.sessions.lock().get(id).cloned())
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self.sessions.lock().keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    fn delete(&self, id: &str) -> Result<()> {
        self.sessions.lock().remove(id);
        Ok(())
    }
}
