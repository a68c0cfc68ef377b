//! Session provider: cache, storage and expiry orchestration.
//!
//! Each session id moves through these states:
//!
//! ```text
//! absent ──init/read──▶ resident ──last caller done, push ok──▶ metadata-only
//!    ▲                     ▲                                        │
//!    │                     └──────────────read (promote)────────────┤
//!    └────────────────destroy / gc / read of expired────────────────┘
//! ```
//!
//! A resident record holds the live [`Session`]; a metadata-only record
//! keeps just the id and creation time so expiry can be decided without
//! touching storage. Writes are deferred: a session reaches storage when
//! the last caller holding it signals completion through its
//! [`CancellationToken`].

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::age::{AgeChecker, MaxAge, now_nanos};
use crate::cache::{Cache, CacheRecord};
use crate::config::ProviderConfig;
use crate::error::{Error, Result};
use crate::factory::{CREATED_AT_KEY, SessionFactory, created_at_meta, created_at_of};
use crate::session::{Session, Values};
use crate::storage::{NoStorage, Storage};

/// Where a cached session currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    /// Only the id and creation time are in memory.
    MetadataOnly,
    /// The session values are in memory, held by `refs` callers.
    Resident {
        /// Callers that have not signalled completion yet.
        refs: usize,
    },
}

/// Provider statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProviderStats {
    /// Number of cached records.
    pub records: usize,

    /// Records whose values are resident.
    pub resident: usize,

    /// Outstanding caller references across all records.
    pub in_flight: usize,
}

struct ProviderInner<S: Storage> {
    cache: Mutex<Cache>,
    storage: Arc<S>,
    factory: SessionFactory,
    checker: Box<dyn AgeChecker>,
    config: ProviderConfig,
}

/// Orchestrates the session cache, durable storage and expiry policy.
///
/// The provider is cheap to clone; clones share the same cache. Every
/// operation that touches the cache or storage holds one provider-wide
/// lock. Reading and writing values on a returned [`Session`] never does.
pub struct Provider<S: Storage = NoStorage> {
    inner: Arc<ProviderInner<S>>,
}

impl Provider<NoStorage> {
    /// Create a provider without durable storage.
    pub fn in_memory(config: ProviderConfig) -> Self {
        Self::new(config, NoStorage)
    }
}

impl<S: Storage + 'static> Provider<S> {
    /// Create a provider with an empty cache.
    ///
    /// Sessions already present in `storage` are unknown to this provider;
    /// use [`open`](Self::open) to load them.
    pub fn new(config: ProviderConfig, storage: S) -> Self {
        let checker = MaxAge::from_secs(config.max_age_secs);
        Self::with_age_checker(config, storage, checker)
    }

    /// Create a provider with an empty cache and a custom age policy.
    pub fn with_age_checker<C>(config: ProviderConfig, storage: S, checker: C) -> Self
    where
        C: AgeChecker + 'static,
    {
        Self::build(config, Arc::new(storage), Box::new(checker), Cache::new())
    }

    /// Create a provider and rebuild its cache from `storage`.
    ///
    /// Fails if the stored sessions cannot be listed or read: without every
    /// creation time the provider could not expire them correctly.
    pub fn open(config: ProviderConfig, storage: S) -> Result<Self> {
        let checker = MaxAge::from_secs(config.max_age_secs);
        Self::open_with_age_checker(config, storage, checker)
    }

    /// Like [`open`](Self::open), with a custom age policy.
    pub fn open_with_age_checker<C>(config: ProviderConfig, storage: S, checker: C) -> Result<Self>
    where
        C: AgeChecker + 'static,
    {
        let cache = rehydrate(&storage)?;
        info!(sessions = cache.len(), "Session cache rehydrated from storage");
        Ok(Self::build(
            config,
            Arc::new(storage),
            Box::new(checker),
            cache,
        ))
    }

    fn build(
        config: ProviderConfig,
        storage: Arc<S>,
        checker: Box<dyn AgeChecker>,
        cache: Cache,
    ) -> Self {
        let mut factory = SessionFactory::new();
        factory.reserved().reserve([CREATED_AT_KEY]);

        if config.write_through {
            let storage = Arc::clone(&storage);
            factory = factory.with_on_mutation(Arc::new(move |id: &str, values: &Values| {
                storage.save(id, values)
            }));
        }

        Self {
            inner: Arc::new(ProviderInner {
                cache: Mutex::new(cache),
                storage,
                factory,
                checker,
                config,
            }),
        }
    }

    /// Get the provider configuration.
    pub fn config(&self) -> &ProviderConfig {
        &self.inner.config
    }

    /// Get the storage backend.
    pub fn storage(&self) -> &Arc<S> {
        &self.inner.storage
    }

    /// Get the session factory.
    pub fn factory(&self) -> &SessionFactory {
        &self.inner.factory
    }

    /// Create a new session.
    ///
    /// Nothing is written to storage here; the session is persisted when
    /// `done` is cancelled (and every other holder is done too).
    ///
    /// `done` must eventually be cancelled. A token that is dropped without
    /// being cancelled keeps the session resident and unsaved for good; use
    /// [`CancellationToken::drop_guard`] to cancel on scope exit.
    pub async fn session_init(&self, id: &str, done: &CancellationToken) -> Result<Arc<Session>> {
        if id.is_empty() {
            return Err(Error::EmptySessionId);
        }

        let mut cache = self.inner.cache.lock().await;
        if cache.contains(id) {
            return Err(Error::DuplicatedSessionId(id.to_string()));
        }
        self.create_locked(&mut cache, id, done)
    }

    /// Get a session, loading its values from storage if needed.
    ///
    /// An unknown id, or a cached id whose age has run out, is treated as a
    /// fresh [`session_init`](Self::session_init) when
    /// `auto_create_on_read` is enabled, and fails with
    /// `Error::NotFound` otherwise. Concurrent readers of the same id get
    /// the same `Arc<Session>`.
    ///
    /// As with `session_init`, every `done` passed in must be cancelled for
    /// the session to be pushed.
    pub async fn session_read(&self, id: &str, done: &CancellationToken) -> Result<Arc<Session>> {
        if id.is_empty() {
            return Err(Error::EmptySessionId);
        }

        let mut cache = self.inner.cache.lock().await;

        let expired = match cache.get_mut(id) {
            Some(record) => {
                if let Some(session) = record.payload.clone() {
                    trace!(session_id = %id, refs = record.refs, "Session found in cache");
                    self.attach(record, done);
                    return Ok(session);
                }

                if !self.inner.checker.should_reap(record.created_at()) {
                    let session = self.promote(record)?;
                    self.attach(record, done);
                    return Ok(session);
                }
                true
            }
            None => false,
        };

        if expired {
            debug!(session_id = %id, "Cached session expired, evicting");
            cache.remove(id);
            self.delete_from_storage(id);
        }

        if !self.inner.config.auto_create_on_read {
            return Err(Error::NotFound(id.to_string()));
        }
        self.create_locked(&mut cache, id, done)
    }

    /// Remove a session from the cache and from storage.
    ///
    /// Destroying an unknown id is not an error.
    pub async fn session_destroy(&self, id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(Error::EmptySessionId);
        }

        let mut cache = self.inner.cache.lock().await;
        let removed = cache.remove(id);
        self.inner.storage.delete(id)?;

        debug!(session_id = %id, was_cached = removed.is_some(), "Session destroyed");
        Ok(())
    }

    /// Evict every expired session from the cache and storage.
    ///
    /// Storage failures are logged and do not stop the sweep. Returns the
    /// number of sessions evicted.
    pub async fn session_gc(&self) -> usize {
        let mut cache = self.inner.cache.lock().await;
        let expired = cache.expired_sessions(&*self.inner.checker);

        for id in &expired {
            self.delete_from_storage(id);
        }

        if !expired.is_empty() {
            debug!(count = expired.len(), remaining = cache.len(), "Reaped expired sessions");
        }
        expired.len()
    }

    /// Write a resident session to storage without releasing it.
    ///
    /// Does nothing if the session is not resident or has no unsaved
    /// changes.
    pub async fn flush(&self, id: &str) -> Result<()> {
        let seq = {
            let cache = self.inner.cache.lock().await;
            cache
                .get(id)
                .ok_or_else(|| Error::NotFound(id.to_string()))?
                .seq()
        };
        self.push(id, seq, false).await
    }

    /// Merge the stored values of a resident session into it.
    ///
    /// Reserved keys in storage never overwrite the live metadata.
    pub async fn resync(&self, id: &str) -> Result<()> {
        let cache = self.inner.cache.lock().await;
        let record = cache
            .get(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;

        let Some(session) = record.payload() else {
            return Ok(());
        };
        if let Some(stored) = self.inner.storage.read(id)? {
            self.inner.factory.override_values(session, stored);
            debug!(session_id = %id, "Session resynced from storage");
        }
        Ok(())
    }

    /// Check whether a session is cached.
    pub async fn contains(&self, id: &str) -> bool {
        self.inner.cache.lock().await.contains(id)
    }

    /// Get the state of a cached session.
    pub async fn record_state(&self, id: &str) -> Option<RecordState> {
        let cache = self.inner.cache.lock().await;
        cache.get(id).map(|record| {
            if record.is_resident() {
                RecordState::Resident {
                    refs: record.refs(),
                }
            } else {
                RecordState::MetadataOnly
            }
        })
    }

    /// Get the number of cached sessions.
    pub async fn len(&self) -> usize {
        self.inner.cache.lock().await.len()
    }

    /// Check if no session is cached.
    pub async fn is_empty(&self) -> bool {
        self.inner.cache.lock().await.is_empty()
    }

    /// Get provider statistics.
    pub async fn stats(&self) -> ProviderStats {
        let cache = self.inner.cache.lock().await;
        let mut stats = ProviderStats {
            records: cache.len(),
            resident: 0,
            in_flight: 0,
        };
        for record in cache.iter() {
            if record.is_resident() {
                stats.resident += 1;
            }
            stats.in_flight += record.refs();
        }
        stats
    }

    fn create_locked(
        &self,
        cache: &mut Cache,
        id: &str,
        done: &CancellationToken,
    ) -> Result<Arc<Session>> {
        // Keep the cache ordered by creation time even if the clock steps back
        let created_at = cache
            .newest_created_at()
            .map_or_else(now_nanos, |newest| now_nanos().max(newest));

        let session = Arc::new(self.inner.factory.create(id, created_at_meta(created_at)));
        let record = CacheRecord::new(id, created_at).with_payload(Arc::clone(&session));
        cache.add(record)?;

        if let Some(record) = cache.get_mut(id) {
            self.attach(record, done);
        }

        debug!(session_id = %id, created_at, "Session initialized");
        Ok(session)
    }

    /// Load a metadata-only record's values from storage.
    fn promote(&self, record: &mut CacheRecord) -> Result<Arc<Session>> {
        let id = record.id().to_string();
        let stored = self.inner.storage.read(&id).inspect_err(|e| {
            warn!(session_id = %id, error = %e, "Failed to load session from storage");
        })?;

        let in_sync = stored.is_some();
        let stored = stored.unwrap_or_else(|| {
            warn!(session_id = %id, "Cached session missing from storage, restoring metadata only");
            Values::new()
        });

        let meta = created_at_meta(record.created_at());
        let session = Arc::new(self.inner.factory.restore(id.as_str(), meta, stored));
        record.persisted_version = in_sync.then(|| session.version());
        record.payload = Some(Arc::clone(&session));

        debug!(session_id = %id, "Session loaded from storage");
        Ok(session)
    }

    /// Register a caller on a resident record and arm its push.
    fn attach(&self, record: &mut CacheRecord, done: &CancellationToken) {
        record.refs += 1;

        let provider = self.clone();
        let id = record.id().to_string();
        let seq = record.seq();
        let done = done.clone();
        tokio::spawn(async move {
            done.cancelled().await;
            provider.release(&id, seq).await;
        });
    }

    /// Drop one caller reference; the last one pushes and demotes.
    async fn release(&self, id: &str, seq: u64) {
        {
            let mut cache = self.inner.cache.lock().await;

            // The record may have been destroyed or reaped (and maybe re-created)
            let Some(record) = cache.get_mut(id).filter(|record| record.seq() == seq) else {
                trace!(session_id = %id, "Released session is no longer cached");
                return;
            };

            record.refs = record.refs.saturating_sub(1);
            if record.refs > 0 {
                trace!(session_id = %id, refs = record.refs, "Push deferred, session still in use");
                return;
            }
        }

        if let Err(e) = self.push(id, seq, true).await {
            error!(
                session_id = %id,
                error = %e,
                "Failed to push session, keeping it resident"
            );
        }
    }

    /// Save a resident session, retrying on failure.
    ///
    /// Each attempt runs under the provider lock and re-checks the record;
    /// the lock is released while waiting between attempts. With `demote`,
    /// a successful save of an unheld record drops its payload.
    async fn push(&self, id: &str, seq: u64, demote: bool) -> Result<()> {
        let attempts = self.inner.config.push_retries.saturating_add(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            {
                let mut cache = self.inner.cache.lock().await;
                let Some(record) = cache.get_mut(id).filter(|record| record.seq() == seq) else {
                    trace!(session_id = %id, "Pushed session is no longer cached");
                    return Ok(());
                };
                // A caller picked it up again; its own release pushes later
                if demote && record.refs > 0 {
                    return Ok(());
                }
                let Some(session) = record.payload.clone() else {
                    return Ok(());
                };

                match self.save_locked(record, &session) {
                    Ok(()) => {
                        if demote {
                            record.payload = None;
                            debug!(session_id = %id, "Session pushed and demoted to metadata");
                        }
                        return Ok(());
                    }
                    Err(e) if attempt < attempts => {
                        warn!(
                            session_id = %id,
                            attempt,
                            error = %e,
                            "Session save failed, retrying"
                        );
                    }
                    Err(e) => return Err(e),
                }
            }
            tokio::time::sleep(self.inner.config.push_retry_backoff()).await;
        }
    }

    /// One save attempt; skipped when the session has not changed.
    fn save_locked(&self, record: &mut CacheRecord, session: &Session) -> Result<()> {
        // Version first: a write racing with the export only makes us save again later
        let version = session.version();
        if record.persisted_version == Some(version) {
            trace!(session_id = %record.id(), "Session unchanged since last push");
            return Ok(());
        }
        let values = self.inner.factory.export_values(session);
        self.inner.storage.save(record.id(), &values)?;
        record.persisted_version = Some(version);
        trace!(session_id = %record.id(), version, "Session saved to storage");
        Ok(())
    }

    fn delete_from_storage(&self, id: &str) {
        if let Err(e) = self.inner.storage.delete(id) {
            warn!(session_id = %id, error = %e, "Failed to delete session from storage");
        }
    }
}

impl<S: Storage> Clone for Provider<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Build metadata-only records for every stored session.
fn rehydrate<S: Storage>(storage: &S) -> Result<Cache> {
    let ids = storage
        .list()
        .map_err(|e| Error::Rehydrate(format!("cannot list stored sessions: {e}")))?;

    let mut found = Vec::with_capacity(ids.len());
    for id in ids {
        if id.is_empty() {
            warn!("Skipping stored session with an empty id");
            continue;
        }
        let values = match storage.read(&id) {
            Ok(Some(values)) => values,
            Ok(None) => {
                debug!(session_id = %id, "Stored session vanished during rehydration");
                continue;
            }
            Err(e) => {
                return Err(Error::Rehydrate(format!(
                    "cannot read stored session {id}: {e}"
                )));
            }
        };

        let created_at = created_at_of(&values).unwrap_or_else(|| {
            warn!(session_id = %id, "Stored session has no creation time, marking it oldest");
            0
        });
        found.push((created_at, id));
    }

    found.sort();

    let mut cache = Cache::new();
    for (created_at, id) in found {
        if let Err(e) = cache.add(CacheRecord::new(id, created_at)) {
            warn!(error = %e, "Skipping duplicate stored session");
        }
    }
    Ok(cache)
}
