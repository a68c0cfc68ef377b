//! The session value container.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::trace;

use crate::error::{Error, Result};

/// Plain-data key-value map held by a session and handed to storage.
pub type Values = HashMap<String, Value>;

/// Callback run after every successful mutation of a session.
///
/// Receives the session id and all its values. It runs with the session
/// locked and must not call back into the same session.
pub type OnMutation = Arc<dyn Fn(&str, &Values) -> Result<()> + Send + Sync>;

/// Registry of reserved (metadata) keys.
///
/// Cloning shares the registry: a factory and every session it built see
/// the same set of keys.
#[derive(Debug, Clone, Default)]
pub struct ReservedKeys {
    keys: Arc<RwLock<HashSet<String>>>,
}

impl ReservedKeys {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Check whether a key is reserved.
    pub fn contains(&self, key: &str) -> bool {
        self.keys.read().contains(key)
    }

    /// Mark keys as reserved.
    pub fn reserve<I, S>(&self, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = self.keys.write();
        for key in keys {
            set.insert(key.into());
        }
    }

    /// All reserved keys, sorted.
    pub fn to_vec(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.keys.read().iter().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of reserved keys.
    pub fn len(&self) -> usize {
        self.keys.read().len()
    }

    /// Check if no key is reserved.
    pub fn is_empty(&self) -> bool {
        self.keys.read().is_empty()
    }
}

struct SessionState {
    values: Values,
    /// Bumped on every change to `values`.
    version: u64,
}

/// A per-id bag of key-value state with protected metadata keys.
///
/// All methods take `&self` and lock an internal mutex, so a session can be
/// shared (`Arc<Session>`) between concurrent callers. Locking is per
/// session; mutating one session never blocks another.
pub struct Session {
    id: String,
    state: Mutex<SessionState>,
    reserved: ReservedKeys,
    on_mutation: Option<OnMutation>,
}

impl Session {
    pub(crate) fn new(
        id: String,
        values: Values,
        reserved: ReservedKeys,
        on_mutation: Option<OnMutation>,
    ) -> Self {
        Self {
            id,
            state: Mutex::new(SessionState { values, version: 0 }),
            reserved,
            on_mutation,
        }
    }

    /// The session identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get a value. Reserved values are returned like any other.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.state.lock().values.get(key).cloned()
    }

    /// Get a value decoded into `T`.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key) {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Set a value.
    ///
    /// The value is converted to plain data here; anything serde cannot
    /// represent is rejected with `Error::Serialization`. Reserved keys are
    /// rejected with `Error::ProtectedKey`.
    ///
    /// If the session has a mutation callback, it runs after the value is
    /// stored and its error is returned. The value stays set either way.
    /// The callback runs while the session is locked, so concurrent
    /// mutations reach it in the order they were applied.
    pub fn set<V: Serialize>(&self, key: &str, value: V) -> Result<()> {
        self.ensure_unreserved(key)?;
        let value = serde_json::to_value(value)?;

        let mut state = self.state.lock();
        state.values.insert(key.to_string(), value);
        state.version += 1;

        trace!(session_id = %self.id, key = %key, "Session value set");
        self.notify(&state.values)
    }

    /// Remove a value. Removing an absent key is not an error.
    pub fn delete(&self, key: &str) -> Result<()> {
        self.ensure_unreserved(key)?;

        let mut state = self.state.lock();
        if state.values.remove(key).is_none() {
            return Ok(());
        }
        state.version += 1;

        trace!(session_id = %self.id, key = %key, "Session value deleted");
        self.notify(&state.values)
    }

    /// Check whether a key is present.
    pub fn contains_key(&self, key: &str) -> bool {
        self.state.lock().values.contains_key(key)
    }

    /// All keys, reserved ones included.
    pub fn keys(&self) -> Vec<String> {
        self.state.lock().values.keys().cloned().collect()
    }

    /// Number of values, reserved ones included.
    pub fn len(&self) -> usize {
        self.state.lock().values.len()
    }

    /// Check if the session holds no values at all.
    pub fn is_empty(&self) -> bool {
        self.state.lock().values.is_empty()
    }

    /// Check whether a key is reserved for metadata.
    pub fn is_reserved(&self, key: &str) -> bool {
        self.reserved.contains(key)
    }

    /// Mutation counter. Changes whenever the values change.
    pub fn version(&self) -> u64 {
        self.state.lock().version
    }

    /// Copy of all values together with the version they were taken at.
    pub(crate) fn snapshot(&self) -> (Values, u64) {
        let state = self.state.lock();
        (state.values.clone(), state.version)
    }

    /// Merge values that are not reserved, last write wins.
    pub(crate) fn merge_unreserved(&self, values: Values) -> usize {
        let mut state = self.state.lock();
        let mut merged = 0;
        for (key, value) in values {
            if self.reserved.contains(&key) {
                continue;
            }
            state.values.insert(key, value);
            merged += 1;
        }
        if merged > 0 {
            state.version += 1;
        }
        merged
    }

    fn ensure_unreserved(&self, key: &str) -> Result<()> {
        if self.reserved.contains(key) {
            return Err(Error::ProtectedKey(key.to_string()));
        }
        Ok(())
    }

    /// Run the mutation callback. The caller holds the state lock.
    fn notify(&self, values: &Values) -> Result<()> {
        match &self.on_mutation {
            Some(callback) => callback(&self.id, values),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("values", &state.values)
            .field("version", &state.version)
            .field("write_through", &self.on_mutation.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn session_with_ct() -> Session {
        let reserved = ReservedKeys::new();
        reserved.reserve(["ct"]);
        let mut values = Values::new();
        values.insert("ct".to_string(), json!(42));
        Session::new("abcde".to_string(), values, reserved, None)
    }

    #[test]
    fn test_set_and_get() {
        let sess = session_with_ct();
        sess.set("foo", "bar").unwrap();
        sess.set("n", 1).unwrap();

        assert_eq!(sess.id(), "abcde");
        assert_eq!(sess.get("foo"), Some(json!("bar")));
        assert_eq!(sess.get("n"), Some(json!(1)));
        assert_eq!(sess.get("missing"), None);
    }

    #[test]
    fn test_get_reserved_transparently() {
        let sess = session_with_ct();
        assert_eq!(sess.get_as::<i64>("ct").unwrap(), Some(42));
    }

    #[test]
    fn test_protected_key() {
        let sess = session_with_ct();

        let result = sess.set("ct", 7);
        assert!(matches!(result, Err(Error::ProtectedKey(ref k)) if k == "ct"));

        let result = sess.delete("ct");
        assert!(matches!(result, Err(Error::ProtectedKey(_))));

        assert_eq!(sess.get("ct"), Some(json!(42)));
        assert_eq!(sess.version(), 0);
    }

    #[test]
    fn test_delete() {
        let sess = session_with_ct();
        sess.set("foo", "bar").unwrap();
        let version = sess.version();

        sess.delete("foo").unwrap();
        assert!(!sess.contains_key("foo"));
        assert_eq!(sess.version(), version + 1);

        // Absent key is a no-op
        sess.delete("foo").unwrap();
        assert_eq!(sess.version(), version + 1);
    }

    #[test]
    fn test_struct_values_become_plain_data() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Player {
            name: String,
            score: u32,
        }

        let sess = session_with_ct();
        let player = Player {
            name: "ana".to_string(),
            score: 10,
        };
        sess.set("player", &player).unwrap();

        assert_eq!(sess.get("player"), Some(json!({"name": "ana", "score": 10})));
        assert_eq!(sess.get_as::<Player>("player").unwrap(), Some(player));
    }

    #[test]
    fn test_unrepresentable_value_rejected() {
        let sess = session_with_ct();
        let mut map = std::collections::HashMap::new();
        map.insert((1, 2), "tuple keys are not plain data");

        assert!(matches!(
            sess.set("bad", map),
            Err(Error::Serialization(_))
        ));
        assert!(!sess.contains_key("bad"));
    }

    #[test]
    fn test_on_mutation_called() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let callback: OnMutation = Arc::new(move |id: &str, values: &Values| -> Result<()> {
            assert_eq!(id, "s-1");
            assert!(values.contains_key("ct"));
            seen.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let reserved = ReservedKeys::new();
        reserved.reserve(["ct"]);
        let mut values = Values::new();
        values.insert("ct".to_string(), json!(1));
        let sess = Session::new("s-1".to_string(), values, reserved, Some(callback));

        sess.set("a", 1).unwrap();
        sess.delete("a").unwrap();
        sess.delete("a").unwrap();
        let _ = sess.set("ct", 2);

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_on_mutation_error_keeps_value() {
        let callback: OnMutation = Arc::new(|_: &str, _: &Values| -> Result<()> {
            Err(Error::Storage("disk full".to_string()))
        });
        let sess = Session::new(
            "s-1".to_string(),
            Values::new(),
            ReservedKeys::new(),
            Some(callback),
        );

        assert!(matches!(sess.set("a", 1), Err(Error::Storage(_))));
        assert_eq!(sess.get("a"), Some(json!(1)));
    }

    #[test]
    fn test_merge_unreserved_skips_reserved() {
        let sess = session_with_ct();
        let mut incoming = Values::new();
        incoming.insert("ct".to_string(), json!(0));
        incoming.insert("foo".to_string(), json!("pulled"));

        assert_eq!(sess.merge_unreserved(incoming), 1);
        assert_eq!(sess.get("ct"), Some(json!(42)));
        assert_eq!(sess.get("foo"), Some(json!("pulled")));
    }

    #[test]
    fn test_concurrent_mutation() {
        let sess = Arc::new(session_with_ct());

        std::thread::scope(|s| {
            for t in 0..4 {
                let sess = Arc::clone(&sess);
                s.spawn(move || {
                    for i in 0..50 {
                        sess.set(&format!("k-{t}-{i}"), i).unwrap();
                    }
                });
            }
        });

        // 200 caller keys plus "ct"
        assert_eq!(sess.len(), 201);
        assert_eq!(sess.version(), 200);
    }

    #[test]
    fn test_on_mutation_sees_mutations_in_order() {
        let stored = Arc::new(Mutex::new(Values::new()));
        let sink = Arc::clone(&stored);
        let callback: OnMutation = Arc::new(move |_: &str, values: &Values| -> Result<()> {
            // Stall the first save so a later mutation could overtake it
            if values.get("a") == Some(&json!(1)) {
                std::thread::sleep(Duration::from_millis(100));
            }
            *sink.lock() = values.clone();
            Ok(())
        });
        let sess = Arc::new(Session::new(
            "s-1".to_string(),
            Values::new(),
            ReservedKeys::new(),
            Some(callback),
        ));

        std::thread::scope(|s| {
            let first = Arc::clone(&sess);
            s.spawn(move || first.set("a", 1).unwrap());
            std::thread::sleep(Duration::from_millis(20));
            sess.set("a", 2).unwrap();
        });

        assert_eq!(stored.lock().get("a").cloned(), sess.get("a"));
    }

    #[test]
    fn test_reserved_keys_registry() {
        let reserved = ReservedKeys::new();
        assert!(reserved.is_empty());

        reserved.reserve(["ct", "at"]);
        reserved.reserve(["ct"]);
        assert_eq!(reserved.len(), 2);
        assert_eq!(reserved.to_vec(), vec!["at", "ct"]);

        // Clones share the registry
        let shared = reserved.clone();
        shared.reserve(["owner"]);
        assert!(reserved.contains("owner"));
    }
}
