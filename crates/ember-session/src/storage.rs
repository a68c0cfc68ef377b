//! Storage contract for durable session persistence.
//!
//! This module defines the trait that decouples the provider from concrete
//! backends. Backends receive and return plain [`Values`] maps; the
//! reserved metadata keys (at least the creation time) are always part of
//! what gets saved, so a provider can rebuild its records at startup from
//! [`Storage::list`] and [`Storage::read`] alone.

use std::sync::Arc;

use crate::error::Result;
use crate::session::Values;

/// Trait for storage backends.
///
/// Implementations must be `Send + Sync`. Calls are made while the
/// provider lock is held, so they should be fast (memory, local disk).
pub trait Storage: Send + Sync {
    /// Persist the full value set of a session, replacing any previous one.
    fn save(&self, id: &str, values: &Values) -> Result<()>;

    /// Load the value set of a session.
    ///
    /// Return `Ok(None)` if the id is not stored.
    fn read(&self, id: &str) -> Result<Option<Values>>;

    /// List every stored session id.
    fn list(&self) -> Result<Vec<String>>;

    /// Delete a session. Deleting an unknown id is not an error.
    fn delete(&self, id: &str) -> Result<()>;
}

impl<S: Storage + ?Sized> Storage for Arc<S> {
    fn save(&self, id: &str, values: &Values) -> Result<()> {
        (**self).save(id, values)
    }

    fn read(&self, id: &str) -> Result<Option<Values>> {
        (**self).read(id)
    }

    fn list(&self) -> Result<Vec<String>> {
        (**self).list()
    }

    fn delete(&self, id: &str) -> Result<()> {
        (**self).delete(id)
    }
}

/// A no-op storage for in-memory only sessions.
///
/// Pushed values are discarded and reads find nothing, so a session lives
/// only as long as its payload stays resident.
#[derive(Debug, Clone, Default)]
pub struct NoStorage;

impl Storage for NoStorage {
    fn save(&self, _id: &str, _values: &Values) -> Result<()> {
        Ok(())
    }

    fn read(&self, _id: &str) -> Result<Option<Values>> {
        Ok(None)
    }

    fn list(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }

    fn delete(&self, _id: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Storage double for unit tests.

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use parking_lot::Mutex;

    use super::*;
    use crate::error::Error;

    /// In-memory storage that counts calls and can be told to fail.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingStorage {
        data: Mutex<HashMap<String, Values>>,
        pub saves: AtomicUsize,
        pub reads: AtomicUsize,
        pub deletes: AtomicUsize,
        pub fail_saves: AtomicBool,
        pub fail_reads: AtomicBool,
        pub fail_list: AtomicBool,
    }

    impl RecordingStorage {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub(crate) fn get(&self, id: &str) -> Option<Values> {
            self.data.lock().get(id).cloned()
        }

        pub(crate) fn insert(&self, id: &str, values: Values) {
            self.data.lock().insert(id.to_string(), values);
        }

        pub(crate) fn contains(&self, id: &str) -> bool {
            self.data.lock().contains_key(id)
        }

        pub(crate) fn save_count(&self) -> usize {
            self.saves.load(Ordering::SeqCst)
        }
    }

    impl Storage for RecordingStorage {
        fn save(&self, id: &str, values: &Values) -> Result<()> {
            self.saves.fetch_add(1, Ordering::SeqCst);
            if self.fail_saves.load(Ordering::SeqCst) {
                return Err(Error::Storage("save failed".to_string()));
            }
            self.data.lock().insert(id.to_string(), values.clone());
            Ok(())
        }

        fn read(&self, id: &str) -> Result<Option<Values>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(Error::Storage("read failed".to_string()));
            }
            Ok(self.data.lock().get(id).cloned())
        }

        fn list(&self) -> Result<Vec<String>> {
            if self.fail_list.load(Ordering::SeqCst) {
                return Err(Error::Storage("list failed".to_string()));
            }
            Ok(self.data.lock().keys().cloned().collect())
        }

        fn delete(&self, id: &str) -> Result<()> {
            self.deletes.fetch_add(1, Ordering::SeqCst);
            self.data.lock().remove(id);
            Ok(())
        }
    }
}
