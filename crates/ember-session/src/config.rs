//! Configuration for the session provider.
//!
//! ```toml
//! max_age_secs = 3600
//! auto_create_on_read = true
//! write_through = false
//! push_retries = 2
//! push_retry_backoff_ms = 50
//! enable_gc_task = true
//! gc_interval_secs = 60
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default maximum session age (one hour).
pub const DEFAULT_MAX_AGE_SECS: u64 = 3600;

/// Default interval between GC sweeps.
pub const DEFAULT_GC_INTERVAL_SECS: u64 = 60;

/// Configuration for the session provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Sessions older than this many seconds are reaped.
    pub max_age_secs: u64,

    /// Whether reading an unknown id creates a new session.
    /// If false, such reads fail with `Error::NotFound`.
    pub auto_create_on_read: bool,

    /// Persist every mutation immediately instead of waiting for the push.
    pub write_through: bool,

    /// Extra save attempts when a push fails.
    pub push_retries: u32,

    /// Delay between push attempts, in milliseconds.
    pub push_retry_backoff_ms: u64,

    /// Whether to run periodic GC of expired sessions.
    pub enable_gc_task: bool,

    /// Interval for the GC task, in seconds.
    pub gc_interval_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            max_age_secs: DEFAULT_MAX_AGE_SECS,
            auto_create_on_read: true,
            write_through: false,
            push_retries: 2,
            push_retry_backoff_ms: 50,
            enable_gc_task: true,
            gc_interval_secs: DEFAULT_GC_INTERVAL_SECS,
        }
    }
}

impl ProviderConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string. Missing fields take their defaults.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).map_err(|e| Error::Config(e.to_string()))
    }

    /// Set the maximum session age in seconds.
    pub fn with_max_age_secs(mut self, secs: u64) -> Self {
        self.max_age_secs = secs;
        self
    }

    /// Enable or disable auto-creation on read misses.
    pub fn with_auto_create_on_read(mut self, enabled: bool) -> Self {
        self.auto_create_on_read = enabled;
        self
    }

    /// Enable or disable write-through on every mutation.
    pub fn with_write_through(mut self, enabled: bool) -> Self {
        self.write_through = enabled;
        self
    }

    /// Set the number of extra push attempts and the delay between them.
    pub fn with_push_retries(mut self, retries: u32, backoff: Duration) -> Self {
        self.push_retries = retries;
        self.push_retry_backoff_ms = saturating_millis(backoff);
        self
    }

    /// Enable or disable the periodic GC task.
    pub fn with_gc_task(mut self, enabled: bool) -> Self {
        self.enable_gc_task = enabled;
        self
    }

    /// Set the GC interval.
    pub fn with_gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval_secs = interval.as_secs().max(1);
        self
    }

    /// Maximum session age as a `Duration`.
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    /// GC interval as a `Duration`.
    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs.max(1))
    }

    /// Delay between push attempts as a `Duration`.
    pub fn push_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.push_retry_backoff_ms)
    }
}

/// Whole milliseconds of `duration`, capped at `u64::MAX`.
pub(crate) fn saturating_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
