//! Age policies for session expiration.

use std::time::Duration;

/// Decides whether a record created at a given instant has expired.
///
/// Implementations must be monotonic in time: once `should_reap` returns
/// true for a timestamp it keeps returning true. The cache sweep relies on
/// this to stop at the first live record.
pub trait AgeChecker: Send + Sync {
    /// Check a creation timestamp (Unix nanoseconds).
    fn should_reap(&self, created_at: i64) -> bool;
}

impl<F> AgeChecker for F
where
    F: Fn(i64) -> bool + Send + Sync,
{
    fn should_reap(&self, created_at: i64) -> bool {
        self(created_at)
    }
}

/// Expires records once they are at least `max_age` old.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxAge {
    max_age: Duration,
}

impl MaxAge {
    /// Create a checker with the given maximum age.
    pub fn new(max_age: Duration) -> Self {
        Self { max_age }
    }

    /// Create a checker with a maximum age in seconds.
    pub fn from_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Get the configured maximum age.
    pub fn max_age(&self) -> Duration {
        self.max_age
    }
}

impl AgeChecker for MaxAge {
    fn should_reap(&self, created_at: i64) -> bool {
        let age = now_nanos().saturating_sub(created_at);
        age >= 0 && age as u128 >= self.max_age.as_nanos()
    }
}

/// Never expires anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverExpire;

impl AgeChecker for NeverExpire {
    fn should_reap(&self, _created_at: i64) -> bool {
        false
    }
}

/// Current wall-clock time in Unix nanoseconds.
pub fn now_nanos() -> i64 {
    // Out of range only past the year 2262
    chrono::Utc::now()
        .timestamp_nanos_opt()
        .unwrap_or(i64::MAX)
}
