//! Periodic garbage collection of expired sessions.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::saturating_millis;
use crate::provider::Provider;
use crate::storage::Storage;

/// Run [`Provider::session_gc`] every `interval` until `shutdown` is cancelled.
pub fn spawn_gc_task<S: Storage + 'static>(
    provider: Provider<S>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    // A zero period would make `interval` panic
    let interval = interval.max(Duration::from_millis(1));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately
        ticker.tick().await;

        debug!(interval_ms = saturating_millis(interval), "Session GC task started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let reaped = provider.session_gc().await;
                    if reaped > 0 {
                        info!(reaped, "Session GC sweep evicted expired sessions");
                    }
                }
            }
        }
        debug!("Session GC task stopped");
    })
}

impl<S: Storage + 'static> Provider<S> {
    /// Start the GC task described by the provider configuration.
    ///
    /// Returns `None` when `enable_gc_task` is off.
    pub fn start_gc_task(&self, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        if !self.config().enable_gc_task {
            return None;
        }
        Some(spawn_gc_task(
            self.clone(),
            self.config().gc_interval(),
            shutdown,
        ))
    }
}
