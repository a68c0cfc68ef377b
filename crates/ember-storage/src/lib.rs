//! Storage backends for ember sessions.
//!
//! Both backends implement [`ember_session::Storage`]:
//! - [`MemoryStorage`]: values kept in a process-local map
//! - [`FileStorage`]: one JSON file per session in a directory
//!
//! # Usage
//!
//! ```no_run
//! use ember_session::{Provider, ProviderConfig};
//! use ember_storage::FileStorage;
//!
//! let storage = FileStorage::new("/var/lib/app/sessions", "sess_")?;
//! let provider = Provider::open(ProviderConfig::default(), storage)?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod error;
pub mod filesystem;
pub mod memory;

pub use error::{Result, StorageError};
pub use filesystem::FileStorage;
pub use memory::MemoryStorage;
