use std::time::Duration;

use anyhow::{bail, Context, Result};

/// Consumer configuration, read from the environment at startup. The
/// queue name, hourly cap and coordination keys have no safe defaults
/// and must be set explicitly.
#[derive(Debug, Clone)]
pub struct MailerConfig {
    /// Queue the consumer drains, shared with the notification enqueuer.
    pub queue: String,
    /// Emails allowed per fixed one-hour window.
    pub max_emails_per_hour: u64,
    /// Counter key tracking sends in the current window.
    pub count_key: String,
    /// Lease key serializing consumers around the quota check.
    pub lock_key: String,
    /// Lease TTL; a crashed holder frees the lock after this long.
    pub lock_ttl: Duration,
    /// How long a consumer sleeps before requeueing a rate-limited message.
    pub cooldown: Duration,
    /// Poll interval when the queue is empty.
    pub poll_interval: Duration,
}

impl MailerConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            queue: require("HUSH_QUEUE_NAME")?,
            max_emails_per_hour: require("HUSH_MAX_EMAILS_PER_HOUR")?
                .parse()
                .context("HUSH_MAX_EMAILS_PER_HOUR must be an integer")?,
            count_key: require("HUSH_EMAIL_COUNT_KEY")?,
            lock_key: require("HUSH_EMAIL_LOCK_KEY")?,
            lock_ttl: Duration::from_millis(
                require("HUSH_EMAIL_LOCK_TTL_MS")?
                    .parse()
                    .context("HUSH_EMAIL_LOCK_TTL_MS must be an integer")?,
            ),
            cooldown: Duration::from_secs(
                std::env::var("HUSH_MAILER_COOLDOWN_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(60),
            ),
            poll_interval: Duration::from_millis(
                std::env::var("HUSH_MAILER_POLL_MS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(500),
            ),
        })
    }
}

fn require(name: &str) -> Result<String> {
    match std::env::var(name) {
        Ok(v) if !v.is_empty() => Ok(v),
        _ => bail!("missing required environment variable {name}"),
    }
}
