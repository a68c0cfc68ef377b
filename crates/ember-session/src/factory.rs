//! Building, restoring and exporting sessions.

use tracing::trace;

use crate::session::{OnMutation, ReservedKeys, Session, Values};

/// Key holding a session's creation time (Unix nanoseconds).
pub const CREATED_AT_KEY: &str = "ct";

/// Builds sessions and moves values between sessions and storage.
///
/// The factory owns the registry of reserved keys. Every key passed as
/// metadata to [`create`](Self::create) or [`restore`](Self::restore) is
/// registered, and every session built by this factory refuses to `set` or
/// `delete` a registered key.
#[derive(Default)]
pub struct SessionFactory {
    reserved: ReservedKeys,
    on_mutation: Option<OnMutation>,
}

impl SessionFactory {
    /// Create a factory with an empty reserved-key registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a callback that sessions built afterwards run on mutation.
    pub fn with_on_mutation(mut self, callback: OnMutation) -> Self {
        self.on_mutation = Some(callback);
        self
    }

    /// The reserved-key registry.
    pub fn reserved(&self) -> &ReservedKeys {
        &self.reserved
    }

    /// Build an empty session seeded with `meta`.
    pub fn create(&self, id: impl Into<String>, meta: Values) -> Session {
        self.reserved.reserve(meta.keys().cloned());
        let id = id.into();
        trace!(session_id = %id, "Creating session");
        Session::new(id, meta, self.reserved.clone(), self.on_mutation.clone())
    }

    /// Rebuild a session from persisted values and authoritative metadata.
    ///
    /// Reserved keys found in `stored` are dropped and `meta` is laid on
    /// top, so metadata always wins over what storage returned.
    pub fn restore(&self, id: impl Into<String>, meta: Values, stored: Values) -> Session {
        self.reserved.reserve(meta.keys().cloned());

        let mut values: Values = stored
            .into_iter()
            .filter(|(key, _)| !self.reserved.contains(key))
            .collect();
        values.extend(meta);

        let id = id.into();
        trace!(session_id = %id, "Restoring session");
        Session::new(id, values, self.reserved.clone(), self.on_mutation.clone())
    }

    /// Merge `new_values` into a live session, skipping reserved keys.
    pub fn override_values(&self, session: &Session, new_values: Values) {
        let merged = session.merge_unreserved(new_values);
        trace!(session_id = %session.id(), merged, "Overrode session values");
    }

    /// Snapshot of every value of `session`, reserved ones included.
    pub fn export_values(&self, session: &Session) -> Values {
        session.snapshot().0
    }
}

/// Metadata map carrying only a creation time.
pub fn created_at_meta(created_at: i64) -> Values {
    let mut meta = Values::new();
    meta.insert(CREATED_AT_KEY.to_string(), created_at.into());
    meta
}

/// Read the creation time from a value map.
pub fn created_at_of(values: &Values) -> Option<i64> {
    values.get(CREATED_AT_KEY).and_then(|v| v.as_i64())
}
