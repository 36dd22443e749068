//! SMTP delivery. The consumer talks to a [`Mailer`] trait so tests can
//! substitute a scripted transport for a real SMTP relay.

use async_trait::async_trait;
use lettre::{
    message::{header::ContentType, Mailbox},
    transport::smtp::authentication::Credentials,
    AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
};

#[derive(Debug, thiserror::Error)]
pub enum SmtpError {
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid email address: {0}")]
    Address(String),
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), SmtpError>;
}

#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// STARTTLS on/off. Plaintext is only for local relays.
    pub use_tls: bool,
}

impl SmtpConfig {
    /// Read SMTP settings from `HUSH_SMTP_*`. Host, port, user and
    /// password are required; `HUSH_SMTP_TLS` defaults to true.
    pub fn from_env() -> Result<Self, SmtpError> {
        Ok(Self {
            host: require("HUSH_SMTP_HOST")?,
            port: require("HUSH_SMTP_PORT")?
                .parse()
                .map_err(|_| SmtpError::Config("HUSH_SMTP_PORT must be a valid port".into()))?,
            username: require("HUSH_SMTP_USER")?,
            password: require("HUSH_SMTP_PASS")?,
            use_tls: std::env::var("HUSH_SMTP_TLS")
                .map(|v| v.to_lowercase() != "false" && v != "0")
                .unwrap_or(true),
        })
    }
}

fn require(name: &str) -> Result<String, SmtpError> {
    std::env::var(name).map_err(|_| SmtpError::Config(format!("{name} is required")))
}

/// Sends plain-text mail through a single authenticated relay. The
/// sender address is the SMTP account itself.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from_mailbox: Mailbox,
}

impl SmtpMailer {
    pub fn new(config: SmtpConfig) -> Result<Self, SmtpError> {
        let from_mailbox: Mailbox = config
            .username
            .parse()
            .map_err(|e| SmtpError::Address(format!("{e}")))?;

        let builder = if config.use_tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.host)
                .map_err(|e| SmtpError::Connection(format!("{e}")))?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
        };

        let transport = builder
            .port(config.port)
            .credentials(Credentials::new(config.username, config.password))
            .build();

        tracing::debug!(host = %config.host, port = config.port, "smtp transport initialized");
        Ok(Self {
            transport,
            from_mailbox,
        })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<(), SmtpError> {
        let to_mailbox: Mailbox = to
            .parse()
            .map_err(|e| SmtpError::Address(format!("{e}")))?;

        let message = Message::builder()
            .from(self.from_mailbox.clone())
            .to(to_mailbox)
            .subject(subject)
            .header(ContentType::TEXT_PLAIN)
            .body(body.to_owned())
            .map_err(|e| SmtpError::Send(format!("{e}")))?;

        self.transport
            .send(message)
            .await
            .map_err(|e| SmtpError::Send(format!("{e}")))?;

        tracing::debug!(to, subject, "email sent");
        Ok(())
    }
}
