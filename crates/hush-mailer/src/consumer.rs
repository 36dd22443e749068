//! Queue consumer: drains notification messages and pushes them through
//! SMTP under a global send lease and an hourly quota.
//!
//! Per-message flow: acquire the lease, check the quota, send, count the
//! send, ack. Any contention or failure nacks the message so it is
//! redelivered; a quota miss additionally sleeps a cooldown so the
//! consumer does not spin against an exhausted window.

use std::time::Duration;

use anyhow::{Context, Result};
use hush_server::notify::EmailMessage;
use hush_server::store::{Delivery, Store};
use tracing::{debug, info, warn};

use crate::{config::MailerConfig, emailer::Mailer, lease::LeaseGuard, quota::HourlyQuota};

/// How long a dequeued message stays invisible before the queue hands it
/// out again. Generously above one send attempt plus the cooldown.
const VISIBILITY: Duration = Duration::from_secs(120);

#[derive(Debug, PartialEq)]
pub enum Outcome {
    Sent,
    Requeued,
    /// Payload could not be decoded; retrying cannot help, so it is
    /// acked away.
    Dropped,
}

pub struct MailConsumer<M: Mailer> {
    store: Store,
    mailer: M,
    cfg: MailerConfig,
    quota: HourlyQuota,
}

impl<M: Mailer> MailConsumer<M> {
    pub fn new(store: Store, mailer: M, cfg: MailerConfig) -> Self {
        let quota = HourlyQuota::new(
            store.clone(),
            cfg.count_key.clone(),
            cfg.max_emails_per_hour,
        );
        Self {
            store,
            mailer,
            cfg,
            quota,
        }
    }

    pub fn quota(&self) -> &HourlyQuota {
        &self.quota
    }

    /// Drain the queue until the task is dropped. The store must be
    /// reachable at startup; after that, per-message errors are logged
    /// and the loop continues.
    pub async fn run(&self) -> Result<()> {
        let sent_so_far = self
            .store
            .counter_get(&self.cfg.count_key)
            .context("mail consumer startup probe")?;
        info!(
            queue = %self.cfg.queue,
            cap = self.cfg.max_emails_per_hour,
            sent_so_far,
            "mail consumer started"
        );

        loop {
            match self.store.dequeue(&self.cfg.queue, VISIBILITY) {
                Ok(Some(delivery)) => {
                    if let Err(e) = self.handle(delivery).await {
                        warn!(error = %e, "failed to handle delivery");
                    }
                }
                Ok(None) => tokio::time::sleep(self.cfg.poll_interval).await,
                Err(e) => {
                    warn!(error = %e, "dequeue failed");
                    tokio::time::sleep(self.cfg.poll_interval).await;
                }
            }
        }
    }

    pub async fn handle(&self, delivery: Delivery) -> Result<Outcome> {
        let message: EmailMessage = match serde_json::from_slice(&delivery.payload) {
            Ok(m) => m,
            Err(e) => {
                warn!(id = delivery.id, error = %e, "dropping undecodable message");
                self.store.ack(&self.cfg.queue, delivery.id)?;
                return Ok(Outcome::Dropped);
            }
        };

        let guard = match LeaseGuard::acquire(&self.store, &self.cfg.lock_key, self.cfg.lock_ttl)? {
            Some(g) => g,
            None => {
                debug!(id = delivery.id, "send lock held elsewhere, requeueing");
                self.store.nack(&self.cfg.queue, delivery.id)?;
                return Ok(Outcome::Requeued);
            }
        };

        if !self.quota.check()? {
            info!(
                id = delivery.id,
                cap = self.cfg.max_emails_per_hour,
                "hourly email cap reached, cooling down"
            );
            guard.release()?;
            tokio::time::sleep(self.cfg.cooldown).await;
            self.store.nack(&self.cfg.queue, delivery.id)?;
            return Ok(Outcome::Requeued);
        }

        let outcome = match self.mailer.send(&message.to, &message.subject, &message.body).await {
            Ok(()) => {
                let sent = self.quota.record_send()?;
                self.store.ack(&self.cfg.queue, delivery.id)?;
                info!(id = delivery.id, to = %message.to, sent_this_window = sent, "email sent");
                Outcome::Sent
            }
            Err(e) => {
                warn!(id = delivery.id, to = %message.to, error = %e, "send failed, requeueing");
                self.store.nack(&self.cfg.queue, delivery.id)?;
                Outcome::Requeued
            }
        };

        guard.release()?;
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emailer::SmtpError;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::tempdir;

    struct MockMailer {
        sent: Mutex<Vec<String>>,
        fail: bool,
    }

    impl MockMailer {
        fn new() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                sent: Mutex::new(Vec::new()),
                fail: true,
            }
        }
    }

    #[async_trait]
    impl Mailer for MockMailer {
        async fn send(&self, to: &str, _subject: &str, _body: &str) -> Result<(), SmtpError> {
            if self.fail {
                return Err(SmtpError::Send("relay unavailable".into()));
            }
            self.sent.lock().unwrap().push(to.to_owned());
            Ok(())
        }
    }

    fn test_config() -> MailerConfig {
        MailerConfig {
            queue: "email".into(),
            max_emails_per_hour: 2,
            count_key: "emails_sent".into(),
            lock_key: "email_lock".into(),
            lock_ttl: Duration::from_secs(60),
            cooldown: Duration::ZERO,
            poll_interval: Duration::from_millis(10),
        }
    }

    fn make_store() -> (Store, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("test.db")).unwrap();
        (store, dir)
    }

    fn enqueue_message(store: &Store, to: &str) {
        let msg = EmailMessage {
            to: to.into(),
            subject: "Secret Accessed".into(),
            body: "body".into(),
        };
        store
            .enqueue("email", &serde_json::to_vec(&msg).unwrap())
            .unwrap();
    }

    async fn handle_next(consumer: &MailConsumer<MockMailer>) -> Outcome {
        let delivery = consumer
            .store
            .dequeue("email", VISIBILITY)
            .unwrap()
            .unwrap();
        consumer.handle(delivery).await.unwrap()
    }

    #[tokio::test]
    async fn cap_sends_two_and_requeues_third() {
        let (store, _dir) = make_store();
        let consumer = MailConsumer::new(store.clone(), MockMailer::new(), test_config());

        for i in 0..3 {
            enqueue_message(&store, &format!("user{i}@example.com"));
        }

        assert_eq!(handle_next(&consumer).await, Outcome::Sent);
        assert_eq!(handle_next(&consumer).await, Outcome::Sent);
        assert_eq!(handle_next(&consumer).await, Outcome::Requeued);

        assert_eq!(consumer.mailer.sent.lock().unwrap().len(), 2);
        assert_eq!(store.queue_depth("email").unwrap(), 1);
        assert_eq!(store.counter_get("emails_sent").unwrap(), 2);
    }

    #[tokio::test]
    async fn send_failure_requeues_without_counting() {
        let (store, _dir) = make_store();
        let consumer = MailConsumer::new(store.clone(), MockMailer::failing(), test_config());

        enqueue_message(&store, "user@example.com");
        assert_eq!(handle_next(&consumer).await, Outcome::Requeued);

        assert_eq!(store.queue_depth("email").unwrap(), 1);
        assert_eq!(store.counter_get("emails_sent").unwrap(), 0);
    }

    #[tokio::test]
    async fn lock_conflict_requeues_and_leaves_counter_untouched() {
        let (store, _dir) = make_store();
        let consumer = MailConsumer::new(store.clone(), MockMailer::new(), test_config());

        assert!(store
            .try_acquire_lease("email_lock", Duration::from_secs(60))
            .unwrap());

        enqueue_message(&store, "user@example.com");
        assert_eq!(handle_next(&consumer).await, Outcome::Requeued);

        assert!(consumer.mailer.sent.lock().unwrap().is_empty());
        assert_eq!(store.counter_get("emails_sent").unwrap(), 0);
        assert_eq!(store.queue_depth("email").unwrap(), 1);
    }

    #[tokio::test]
    async fn undecodable_payload_is_dropped() {
        let (store, _dir) = make_store();
        let consumer = MailConsumer::new(store.clone(), MockMailer::new(), test_config());

        store.enqueue("email", b"not json").unwrap();
        assert_eq!(handle_next(&consumer).await, Outcome::Dropped);
        assert_eq!(store.queue_depth("email").unwrap(), 0);
    }

    #[tokio::test]
    async fn lease_is_free_after_every_outcome() {
        let (store, _dir) = make_store();
        let consumer = MailConsumer::new(store.clone(), MockMailer::new(), test_config());

        enqueue_message(&store, "user@example.com");
        handle_next(&consumer).await;

        assert!(store
            .try_acquire_lease("email_lock", Duration::from_secs(60))
            .unwrap());
    }

    #[tokio::test]
    async fn quota_reset_reopens_sending() {
        let (store, _dir) = make_store();
        let consumer = MailConsumer::new(store.clone(), MockMailer::new(), test_config());

        for i in 0..3 {
            enqueue_message(&store, &format!("user{i}@example.com"));
        }
        assert_eq!(handle_next(&consumer).await, Outcome::Sent);
        assert_eq!(handle_next(&consumer).await, Outcome::Sent);
        assert_eq!(handle_next(&consumer).await, Outcome::Requeued);

        consumer.quota().reset().unwrap();
        assert_eq!(handle_next(&consumer).await, Outcome::Sent);
        assert_eq!(store.queue_depth("email").unwrap(), 0);
    }
}
