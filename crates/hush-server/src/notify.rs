//! Notification enqueuer: one bounded attempt to put a mail message on the
//! durable queue. A dropped notification is an acceptable degradation; a
//! blocked or failed access response is not, so errors are logged and
//! swallowed here.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::store::Store;

/// Wire format consumed by the mailer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

impl EmailMessage {
    /// The message sent to a secret's creator on every granted access.
    pub fn secret_accessed(to: &str, identifier: &str) -> Self {
        Self {
            to: to.to_owned(),
            subject: "Secret Accessed".to_owned(),
            body: format!("The secret with identifier {identifier} has been accessed."),
        }
    }
}

#[derive(Clone)]
pub struct Notifier {
    store: Store,
    queue: String,
}

impl Notifier {
    pub fn new(store: Store, queue: String) -> Self {
        Self { store, queue }
    }

    /// Enqueue a notification. Never propagates failure to the caller.
    pub fn fire(&self, message: &EmailMessage) {
        let payload = match serde_json::to_vec(message) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "failed to serialize notification");
                return;
            }
        };

        match self.store.enqueue(&self.queue, &payload) {
            Ok(id) => debug!(queue = %self.queue, id, to = %message.to, "notification enqueued"),
            Err(e) => warn!(error = %e, queue = %self.queue, "failed to enqueue notification"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn fire_places_json_message_on_queue() {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("test.db")).unwrap();
        let notifier = Notifier::new(store.clone(), "email".into());

        let msg = EmailMessage::secret_accessed("owner@example.com", "abc123");
        notifier.fire(&msg);

        let delivery = store
            .dequeue("email", Duration::from_secs(30))
            .unwrap()
            .unwrap();
        let decoded: EmailMessage = serde_json::from_slice(&delivery.payload).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(decoded.subject, "Secret Accessed");
        assert!(decoded.body.contains("abc123"));
    }

    #[test]
    fn exactly_one_message_per_fire() {
        let dir = tempdir().unwrap();
        let store = Store::open(&dir.path().join("test.db")).unwrap();
        let notifier = Notifier::new(store.clone(), "email".into());

        notifier.fire(&EmailMessage::secret_accessed("a@example.com", "id1"));
        assert_eq!(store.queue_depth("email").unwrap(), 1);
    }
}
