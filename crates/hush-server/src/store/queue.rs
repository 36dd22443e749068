//! Durable named work queue on the store.
//!
//! At-least-once delivery: `dequeue` moves the oldest ready item into a
//! pending table with a redelivery deadline; `ack` removes it, `nack`
//! returns it to the ready table under its original id so it is
//! redelivered ahead of younger items. Items whose deadline has passed
//! are restored on the next dequeue.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use redb::{ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::db::Store;

pub(crate) const READY: TableDefinition<(&str, u64), &[u8]> = TableDefinition::new("queue_ready");
pub(crate) const PENDING: TableDefinition<(&str, u64), &[u8]> =
    TableDefinition::new("queue_pending");

const QUEUE_SEQ_PREFIX: &str = "queue_seq:";

/// A message handed to a consumer. Must be acked or nacked by `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub id: u64,
    pub payload: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PendingItem {
    payload: Vec<u8>,
    /// Unix milliseconds after which the item is eligible for redelivery.
    deadline_ms: i64,
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

impl Store {
    /// Append a payload to the named queue. Committed before returning.
    pub fn enqueue(&self, queue: &str, payload: &[u8]) -> Result<u64> {
        let write_txn = self.db.begin_write()?;
        let id = {
            let mut counters = write_txn.open_table(super::coordination::COUNTERS)?;
            let seq_key = format!("{QUEUE_SEQ_PREFIX}{queue}");
            let id = counters.get(seq_key.as_str())?.map(|g| g.value()).unwrap_or(0) + 1;
            counters.insert(seq_key.as_str(), id)?;

            let mut ready = write_txn.open_table(READY)?;
            ready.insert((queue, id), payload)?;
            id
        };
        write_txn.commit()?;

        debug!(queue, id, "enqueued message");
        Ok(id)
    }

    /// Pop the oldest ready item, holding it pending for `visibility`.
    /// Expired pending items are restored to the ready table first.
    pub fn dequeue(&self, queue: &str, visibility: Duration) -> Result<Option<Delivery>> {
        let now = now_ms();

        let write_txn = self.db.begin_write()?;
        let delivery = {
            let mut ready = write_txn.open_table(READY)?;
            let mut pending = write_txn.open_table(PENDING)?;

            // Restore pending items whose deadline has passed.
            let expired: Vec<(u64, Vec<u8>)> = {
                let mut expired = Vec::new();
                for item in pending.range((queue, 0)..=(queue, u64::MAX))? {
                    let (k, v) = item?;
                    let pend: PendingItem = decode(v.value())?;
                    if pend.deadline_ms <= now {
                        expired.push((k.value().1, pend.payload));
                    }
                }
                expired
            };
            for (id, payload) in &expired {
                pending.remove((queue, *id))?;
                ready.insert((queue, *id), payload.as_slice())?;
                warn!(queue, id, "restored expired delivery");
            }

            // Pop the lowest ready id for this queue.
            let head: Option<(u64, Vec<u8>)> = {
                let mut range = ready.range((queue, 0)..=(queue, u64::MAX))?;
                match range.next() {
                    Some(item) => {
                        let (k, v) = item?;
                        Some((k.value().1, v.value().to_vec()))
                    }
                    None => None,
                }
            };

            match head {
                None => None,
                Some((id, payload)) => {
                    ready.remove((queue, id))?;
                    let pend = PendingItem {
                        payload: payload.clone(),
                        deadline_ms: now + visibility.as_millis() as i64,
                    };
                    pending.insert((queue, id), encode(&pend)?.as_slice())?;
                    Some(Delivery { id, payload })
                }
            }
        };
        write_txn.commit()?;
        Ok(delivery)
    }

    /// Acknowledge a delivery: the message is done and removed.
    pub fn ack(&self, queue: &str, id: u64) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut pending = write_txn.open_table(PENDING)?;
            if pending.remove((queue, id))?.is_none() {
                warn!(queue, id, "ack for unknown delivery");
            }
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Negatively acknowledge a delivery: the message returns to the ready
    /// table under its original id and will be redelivered.
    pub fn nack(&self, queue: &str, id: u64) -> Result<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut pending = write_txn.open_table(PENDING)?;
            let item: Option<Vec<u8>> = pending.remove((queue, id))?.map(|g| g.value().to_vec());

            match item {
                None => warn!(queue, id, "nack for unknown delivery"),
                Some(bytes) => {
                    let pend: PendingItem = decode(&bytes)?;
                    let mut ready = write_txn.open_table(READY)?;
                    ready.insert((queue, id), pend.payload.as_slice())?;
                }
            }
        }
        write_txn.commit()?;

        debug!(queue, id, "requeued message");
        Ok(())
    }

    /// Ready + pending message count for the named queue.
    pub fn queue_depth(&self, queue: &str) -> Result<u64> {
        let read_txn = self.db.begin_read()?;
        let ready = read_txn.open_table(READY)?;
        let pending = read_txn.open_table(PENDING)?;

        let mut depth = 0u64;
        for item in ready.range((queue, 0)..=(queue, u64::MAX))? {
            item?;
            depth += 1;
        }
        for item in pending.range((queue, 0)..=(queue, u64::MAX))? {
            item?;
            depth += 1;
        }
        Ok(depth)
    }
}

fn encode(item: &PendingItem) -> Result<Vec<u8>> {
    bincode::serde::encode_to_vec(item, bincode::config::standard())
        .context("bincode encode pending item")
}

fn decode(bytes: &[u8]) -> Result<PendingItem> {
    let (item, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .context("bincode decode pending item")?;
    Ok(item)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const VIS: Duration = Duration::from_secs(30);

    fn make_store() -> (Store, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("test.db")).unwrap();
        (store, dir)
    }

    #[test]
    fn fifo_order() {
        let (s, _dir) = make_store();
        s.enqueue("mail", b"one").unwrap();
        s.enqueue("mail", b"two").unwrap();

        let a = s.dequeue("mail", VIS).unwrap().unwrap();
        let b = s.dequeue("mail", VIS).unwrap().unwrap();
        assert_eq!(a.payload, b"one");
        assert_eq!(b.payload, b"two");
        assert!(s.dequeue("mail", VIS).unwrap().is_none());
    }

    #[test]
    fn ack_removes_message() {
        let (s, _dir) = make_store();
        s.enqueue("mail", b"msg").unwrap();

        let d = s.dequeue("mail", VIS).unwrap().unwrap();
        assert_eq!(s.queue_depth("mail").unwrap(), 1); // pending
        s.ack("mail", d.id).unwrap();
        assert_eq!(s.queue_depth("mail").unwrap(), 0);
        assert!(s.dequeue("mail", VIS).unwrap().is_none());
    }

    #[test]
    fn nack_redelivers_before_younger_items() {
        let (s, _dir) = make_store();
        s.enqueue("mail", b"first").unwrap();
        s.enqueue("mail", b"second").unwrap();

        let d = s.dequeue("mail", VIS).unwrap().unwrap();
        assert_eq!(d.payload, b"first");
        s.nack("mail", d.id).unwrap();

        let redelivered = s.dequeue("mail", VIS).unwrap().unwrap();
        assert_eq!(redelivered.payload, b"first");
        assert_eq!(redelivered.id, d.id);
    }

    #[test]
    fn expired_pending_is_restored() {
        let (s, _dir) = make_store();
        s.enqueue("mail", b"msg").unwrap();

        // Zero visibility: the delivery expires immediately.
        let d = s.dequeue("mail", Duration::ZERO).unwrap().unwrap();
        let again = s.dequeue("mail", VIS).unwrap().unwrap();
        assert_eq!(again.id, d.id);
        assert_eq!(again.payload, b"msg");
    }

    #[test]
    fn queues_are_isolated() {
        let (s, _dir) = make_store();
        s.enqueue("mail", b"mail-msg").unwrap();
        s.enqueue("other", b"other-msg").unwrap();

        assert_eq!(s.queue_depth("mail").unwrap(), 1);
        assert_eq!(s.queue_depth("other").unwrap(), 1);
        let d = s.dequeue("mail", VIS).unwrap().unwrap();
        assert_eq!(d.payload, b"mail-msg");
        assert!(s.dequeue("mail", VIS).unwrap().is_none());
    }
}
