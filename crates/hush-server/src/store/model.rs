use serde::{Deserialize, Serialize};

/// Stored in redb as bincode-encoded bytes, keyed by `identifier`.
/// `encrypted_secret` is an opaque ciphertext blob produced client-side;
/// the server stores and returns it without ever decrypting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretRecord {
    /// Recipient capability token. Unique across the store.
    pub identifier: String,
    /// Management capability token (delete, logs, stats). Never equal to
    /// `identifier` and not derivable from it.
    pub creator_identifier: String,
    /// Opaque ciphertext as submitted at creation.
    pub encrypted_secret: String,
    /// Allowed source IPs. Empty means no restriction.
    pub ip_restrictions: Vec<String>,
    /// Maximum granted accesses. 0 means unlimited.
    pub max_views: u32,
    /// Granted accesses so far. Incremented only on a grant.
    pub current_views: u32,
    /// Optional secondary password, compared exactly as given.
    pub secret_password: Option<String>,
    /// Unix timestamp (seconds); the secret is unusable at or after this point.
    pub expiration_date: Option<i64>,
    /// Address notified on every granted access.
    pub email_notification: Option<String>,
    /// Append-only, one entry per access attempt, in evaluation order.
    pub access_logs: Vec<AccessLogEntry>,
    /// Unix timestamp (seconds) when the record was created.
    pub created_at: i64,
}

/// One attempted access, granted or denied, captured at evaluation time.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessLogEntry {
    pub ip_address: String,
    /// Server time of the attempt (unix seconds).
    pub access_date: i64,
    pub access_granted: bool,
    pub referrer: Option<String>,
    pub user_agent: Option<String>,
    /// Header snapshot as `"name: value"` lines.
    pub request_headers: Vec<String>,
    /// Raw request body, when the retrieval request carried one.
    pub request_body: Option<String>,
}

/// Creation-time inputs; identifiers and bookkeeping fields are filled by the store.
#[derive(Debug, Clone)]
pub struct NewSecret {
    pub encrypted_secret: String,
    pub ip_restrictions: Vec<String>,
    pub max_views: u32,
    pub secret_password: Option<String>,
    pub expiration_date: Option<i64>,
    pub email_notification: Option<String>,
}

/// Policy applied when a creation request omits a field.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretDefaults {
    pub max_views: u32,
    /// Seconds added to "now" when no expiration is supplied.
    pub default_expiration_length: i64,
}

impl Default for SecretDefaults {
    fn default() -> Self {
        Self {
            max_views: std::env::var("HUSH_MAX_VIEWS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1),
            default_expiration_length: std::env::var("HUSH_DEFAULT_EXPIRATION_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(604_800), // 1 week
        }
    }
}

/// Summarized view over a secret's access log.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AccessStats {
    pub total_attempts: usize,
    pub granted_attempts: usize,
    pub distinct_ips: usize,
    pub current_views: u32,
}

/// Generate a capability token: 16 random bytes as 32 hex chars.
pub fn generate_token() -> String {
    use rand::Rng;
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}
