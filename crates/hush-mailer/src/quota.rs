//! Fixed-window hourly send quota backed by a store counter. The window
//! resets on a wall-clock ticker rather than per-key timestamps, so a
//! burst can straddle a reset; the cap bounds each window, not any
//! sliding hour.

use std::time::Duration;

use anyhow::Result;
use hush_server::store::Store;
use tracing::{info, warn};

#[derive(Clone)]
pub struct HourlyQuota {
    store: Store,
    key: String,
    cap: u64,
}

impl HourlyQuota {
    pub fn new(store: Store, key: String, cap: u64) -> Self {
        Self { store, key, cap }
    }

    /// Whether another send fits in the current window.
    pub fn check(&self) -> Result<bool> {
        Ok(self.store.counter_get(&self.key)? < self.cap)
    }

    /// Count a completed send against the window.
    pub fn record_send(&self) -> Result<u64> {
        self.store.counter_incr(&self.key)
    }

    /// Start a new window.
    pub fn reset(&self) -> Result<()> {
        self.store.counter_set(&self.key, 0)
    }

    /// Spawn the hourly reset ticker. The first tick fires immediately
    /// and is skipped so a fresh window is not cut short at startup.
    pub fn spawn_reset(&self) {
        let quota = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(3600));
            interval.tick().await;
            loop {
                interval.tick().await;
                match quota.reset() {
                    Ok(()) => info!(key = %quota.key, "email quota window reset"),
                    Err(e) => warn!(key = %quota.key, error = %e, "failed to reset quota"),
                }
            }
        });
    }
}
