//! Access decision logic for secret retrieval.
//!
//! The checks run in a strict order — existence, expiration, view count,
//! IP allow-list, secondary password — short-circuiting on the first
//! failure. Every branch produces exactly one access-log entry; the store
//! applies the side effects (log append, view increment) inside a single
//! write transaction so racing requests cannot oversubscribe `max_views`.

use constant_time_eq::constant_time_eq;

use crate::store::model::{AccessLogEntry, SecretRecord};

/// Request context captured for the audit trail, regardless of outcome.
#[derive(Debug, Clone, Default)]
pub struct AccessContext {
    pub ip: String,
    pub referrer: Option<String>,
    pub user_agent: Option<String>,
    /// Header snapshot as `"name: value"` lines.
    pub request_headers: Vec<String>,
    pub request_body: Option<String>,
}

impl AccessContext {
    pub fn log_entry(&self, granted: bool, now: i64) -> AccessLogEntry {
        AccessLogEntry {
            ip_address: self.ip.clone(),
            access_date: now,
            access_granted: granted,
            referrer: self.referrer.clone(),
            user_agent: self.user_agent.clone(),
            request_headers: self.request_headers.clone(),
            request_body: self.request_body.clone(),
        }
    }
}

/// Outcome of the ordered check sequence.
#[derive(Debug, Clone, PartialEq)]
pub enum AccessDecision {
    /// All checks passed. Carries the ciphertext and, when registered,
    /// the address to notify.
    Granted {
        secret: String,
        notify: Option<String>,
    },
    NotFound,
    Expired,
    ViewLimitReached,
    IpNotAllowed,
    InvalidPassword,
}

impl AccessDecision {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted { .. })
    }
}

/// Evaluate the denial checks against a loaded record.
/// Returns `None` when access should be granted.
pub(crate) fn deny_reason(
    record: &SecretRecord,
    supplied_password: Option<&str>,
    ip: &str,
    now: i64,
) -> Option<AccessDecision> {
    if let Some(exp) = record.expiration_date {
        if exp < now {
            return Some(AccessDecision::Expired);
        }
    }

    if record.max_views > 0 && record.current_views >= record.max_views {
        return Some(AccessDecision::ViewLimitReached);
    }

    if !record.ip_restrictions.is_empty() && !record.ip_restrictions.iter().any(|r| r == ip) {
        return Some(AccessDecision::IpNotAllowed);
    }

    if let Some(ref expected) = record.secret_password {
        let matches = supplied_password
            .map(|p| constant_time_eq(p.as_bytes(), expected.as_bytes()))
            .unwrap_or(false);
        if !matches {
            return Some(AccessDecision::InvalidPassword);
        }
    }

    None
}
