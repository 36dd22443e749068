//! Rate-limited email consumer for hush access notifications.
//!
//! Drains the durable notification queue and delivers each message over
//! SMTP, serialized by a store-backed lease and bounded by a fixed
//! hourly send window.

pub mod config;
pub mod consumer;
pub mod emailer;
pub mod lease;
pub mod quota;

pub use config::MailerConfig;
pub use consumer::{MailConsumer, Outcome};
pub use emailer::{Mailer, SmtpConfig, SmtpError, SmtpMailer};
pub use quota::HourlyQuota;
