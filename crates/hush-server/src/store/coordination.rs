//! Coordination primitives shared by producer and consumers: a named
//! time-bounded mutual-exclusion lease and named fixed-window counters.
//! Both are plain store state so any number of worker tasks can contend
//! over them.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use redb::{ReadableTable, TableDefinition};
use tracing::debug;

use super::db::Store;

/// Lease key -> unix-millisecond expiry.
pub(crate) const LEASES: TableDefinition<&str, i64> = TableDefinition::new("leases");
/// Named monotonic counters (queue sequences, send quotas).
pub(crate) const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

impl Store {
    /// Try to take the named lease for `ttl`. Succeeds when the lease is
    /// absent or its previous holder's TTL has lapsed.
    pub fn try_acquire_lease(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = now_ms();

        let write_txn = self.db.begin_write()?;
        let acquired = {
            let mut leases = write_txn.open_table(LEASES)?;
            let held = leases
                .get(key)?
                .map(|g| g.value() > now)
                .unwrap_or(false);

            if held {
                false
            } else {
                leases.insert(key, now + ttl.as_millis() as i64)?;
                true
            }
        };
        write_txn.commit()?;

        if acquired {
            debug!(key, "lease acquired");
        }
        Ok(acquired)
    }

    /// Release the named lease. Releasing an absent lease is a no-op.
    pub fn release_lease(&self, key: &str) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut leases = write_txn.open_table(LEASES)?;
            leases.remove(key)?;
        }
        write_txn.commit()?;

        debug!(key, "lease released");
        Ok(())
    }

    pub fn counter_get(&self, key: &str) -> Result<u64> {
        let read_txn = self.db.begin_read()?;
        let counters = read_txn.open_table(COUNTERS)?;
        Ok(counters.get(key)?.map(|g| g.value()).unwrap_or(0))
    }

    /// Increment the named counter, returning the new value.
    pub fn counter_incr(&self, key: &str) -> Result<u64> {
        let write_txn = self.db.begin_write()?;
        let value = {
            let mut counters = write_txn.open_table(COUNTERS)?;
            let value = counters.get(key)?.map(|g| g.value()).unwrap_or(0) + 1;
            counters.insert(key, value)?;
            value
        };
        write_txn.commit()?;
        Ok(value)
    }

    pub fn counter_set(&self, key: &str, value: u64) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut counters = write_txn.open_table(COUNTERS)?;
            counters.insert(key, value)?;
        }
        write_txn.commit()?;
        Ok(())
    }
}
