//! In-memory registry of session records.
//!
//! Records live in a map keyed by insertion sequence, which is also
//! creation order because records are added with non-decreasing creation
//! times. A second structure, a vector of `(id, seq)` pairs kept sorted by
//! id, gives binary-search lookup by id. Both point at the same record; the
//! payload is never duplicated.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::trace;

use crate::age::AgeChecker;
use crate::error::{Error, Result};
use crate::session::Session;

/// Bookkeeping for one session id.
///
/// The id and creation time are always present. The payload is present
/// only while the session's values are resident in memory.
#[derive(Debug, Clone)]
pub struct CacheRecord {
    id: String,
    created_at: i64,
    seq: u64,
    pub(crate) payload: Option<Arc<Session>>,
    /// Callers currently holding the payload.
    pub(crate) refs: usize,
    /// Session version last written to storage, if any.
    pub(crate) persisted_version: Option<u64>,
}

impl CacheRecord {
    /// Create a metadata-only record.
    pub fn new(id: impl Into<String>, created_at: i64) -> Self {
        Self {
            id: id.into(),
            created_at,
            seq: 0,
            payload: None,
            refs: 0,
            persisted_version: None,
        }
    }

    /// Attach a resident payload.
    pub fn with_payload(mut self, session: Arc<Session>) -> Self {
        self.payload = Some(session);
        self
    }

    /// Session id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Creation time in Unix nanoseconds.
    pub fn created_at(&self) -> i64 {
        self.created_at
    }

    /// Insertion sequence number assigned by the cache.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    /// The resident session, if loaded.
    pub fn payload(&self) -> Option<&Arc<Session>> {
        self.payload.as_ref()
    }

    /// Whether the payload is resident.
    pub fn is_resident(&self) -> bool {
        self.payload.is_some()
    }

    /// Number of callers currently holding the payload.
    pub fn refs(&self) -> usize {
        self.refs
    }
}

#[derive(Debug, Clone)]
struct IndexEntry {
    id: String,
    seq: u64,
}

/// Creation-ordered, id-indexed collection of [`CacheRecord`]s.
#[derive(Debug, Default)]
pub struct Cache {
    /// Records by insertion sequence, oldest first.
    records: BTreeMap<u64, CacheRecord>,
    /// Sorted by id.
    index: Vec<IndexEntry>,
    next_seq: u64,
}

impl Cache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record and return the sequence number assigned to it.
    ///
    /// The caller must add records in non-decreasing `created_at` order.
    /// Fails with `DuplicatedSessionId` if the id is already present.
    pub fn add(&mut self, mut record: CacheRecord) -> Result<u64> {
        let pos = match self.position(&record.id) {
            Ok(_) => return Err(Error::DuplicatedSessionId(record.id)),
            Err(pos) => pos,
        };

        let seq = self.next_seq;
        self.next_seq += 1;
        record.seq = seq;

        self.index.insert(
            pos,
            IndexEntry {
                id: record.id.clone(),
                seq,
            },
        );
        trace!(session_id = %record.id, seq, cache_size = self.index.len(), "Record added to cache");
        self.records.insert(seq, record);
        Ok(seq)
    }

    /// Check if a record exists for `id`.
    pub fn contains(&self, id: &str) -> bool {
        self.position(id).is_ok()
    }

    /// Look up a record by id.
    pub fn get(&self, id: &str) -> Option<&CacheRecord> {
        let pos = self.position(id).ok()?;
        self.records.get(&self.index[pos].seq)
    }

    /// Look up a record by id for mutation.
    pub fn get_mut(&mut self, id: &str) -> Option<&mut CacheRecord> {
        let pos = self.position(id).ok()?;
        self.records.get_mut(&self.index[pos].seq)
    }

    /// Remove a record. Returns `None` if it was not cached.
    pub fn remove(&mut self, id: &str) -> Option<CacheRecord> {
        let pos = self.position(id).ok()?;
        let entry = self.index.remove(pos);
        self.records.remove(&entry.seq)
    }

    /// Pop every expired record, oldest first, and return their ids.
    ///
    /// Stops at the first record the checker keeps. Because records are
    /// ordered by creation time and checkers are monotonic, everything
    /// after that record is live too.
    pub fn expired_sessions<C>(&mut self, checker: &C) -> Vec<String>
    where
        C: AgeChecker + ?Sized,
    {
        let mut expired = Vec::new();

        while let Some(entry) = self.records.first_entry() {
            if !checker.should_reap(entry.get().created_at) {
                break;
            }
            let record = entry.remove();
            if let Ok(pos) = self.position(&record.id) {
                self.index.remove(pos);
            }
            expired.push(record.id);
        }

        expired
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Creation time of the most recently added record.
    pub fn newest_created_at(&self) -> Option<i64> {
        self.records
            .last_key_value()
            .map(|(_, record)| record.created_at)
    }

    /// Iterate over records, oldest first.
    pub fn iter(&self) -> impl Iterator<Item = &CacheRecord> {
        self.records.values()
    }

    fn position(&self, id: &str) -> std::result::Result<usize, usize> {
        self.index.binary_search_by(|entry| entry.id.as_str().cmp(id))
    }
}
