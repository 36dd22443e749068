//! RAII wrapper around the store's named lease. Dropping the guard
//! releases the lease; the TTL covers the crash case.

use std::time::Duration;

use anyhow::Result;
use hush_server::store::Store;
use tracing::warn;

pub struct LeaseGuard {
    store: Store,
    key: String,
    released: bool,
}

impl LeaseGuard {
    /// Try to take the named lease. `None` means another holder has it.
    pub fn acquire(store: &Store, key: &str, ttl: Duration) -> Result<Option<Self>> {
        if !store.try_acquire_lease(key, ttl)? {
            return Ok(None);
        }
        Ok(Some(Self {
            store: store.clone(),
            key: key.to_owned(),
            released: false,
        }))
    }

    /// Release eagerly instead of waiting for drop, surfacing any error.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.store.release_lease(&self.key)
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.store.release_lease(&self.key) {
            // The TTL will reclaim it.
            warn!(key = %self.key, error = %e, "failed to release lease");
        }
    }
}
