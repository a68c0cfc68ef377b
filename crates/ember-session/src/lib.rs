//! Session state engine with a write-back cache and age-based expiry.
//!
//! This crate provides the core of a session store:
//! - [`Session`]: a thread-safe key-value bag with protected metadata keys
//! - [`SessionFactory`]: builds, restores and exports sessions
//! - [`Cache`]: records ordered by creation time and indexed by id
//! - [`AgeChecker`]: pluggable expiry policy
//! - [`Provider`]: ties them together with a [`Storage`] backend, loading
//!   values lazily and writing them back when callers are done
//!
//! # Example
//!
//! ```rust,ignore
//! use ember_session::{Provider, ProviderConfig};
//! use tokio_util::sync::CancellationToken;
//!
//! let provider = Provider::open(ProviderConfig::default(), storage)?;
//!
//! // One token per unit of work, e.g. an HTTP request
//! let done = CancellationToken::new();
//! let session = provider.session_read(&session_id, &done).await?;
//! session.set("user", "ana")?;
//!
//! // Persist and release the session
//! done.cancel();
//! ```

mod age;
mod cache;
mod config;
mod error;
mod factory;
mod gc;
mod provider;
mod session;
mod storage;

pub use age::{AgeChecker, MaxAge, NeverExpire, now_nanos};
pub use cache::{Cache, CacheRecord};
pub use config::ProviderConfig;
pub use error::{Error, Result};
pub use factory::{CREATED_AT_KEY, SessionFactory, created_at_meta, created_at_of};
pub use gc::spawn_gc_task;
pub use provider::{Provider, ProviderStats, RecordState};
pub use session::{OnMutation, ReservedKeys, Session, Values};
pub use storage::{NoStorage, Storage};

/// Generate a random, URL-safe session id.
pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
