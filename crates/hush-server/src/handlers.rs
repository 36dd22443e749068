use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::{
    gatekeeper::{AccessContext, AccessDecision},
    notify::EmailMessage,
    store::NewSecret,
    AppState,
};

// ── Envelope helpers ─────────────────────────────────────────────────────────

fn ok_data(data: serde_json::Value) -> Response {
    Json(json!({"success": true, "data": data})).into_response()
}

fn api_error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"success": false, "error": message}))).into_response()
}

fn internal_error(e: anyhow::Error) -> Response {
    tracing::error!(error = %e, "internal error");
    api_error(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
}

// ── IP extraction ────────────────────────────────────────────────────────────

fn extract_ip(headers: &HeaderMap, addr: &SocketAddr) -> String {
    if let Some(xff) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = xff.split(',').next() {
            let trimmed = first.trim();
            if !trimmed.is_empty() {
                return trimmed.to_owned();
            }
        }
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        let trimmed = real_ip.trim();
        if !trimmed.is_empty() {
            return trimmed.to_owned();
        }
    }
    addr.ip().to_string()
}

fn access_context(headers: &HeaderMap, addr: &SocketAddr, body: String) -> AccessContext {
    AccessContext {
        ip: extract_ip(headers, addr),
        referrer: headers
            .get("referer")
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned()),
        user_agent: headers
            .get("user-agent")
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned()),
        request_headers: headers
            .iter()
            .map(|(name, value)| {
                format!("{}: {}", name, String::from_utf8_lossy(value.as_bytes()))
            })
            .collect(),
        request_body: non_empty(Some(body)),
    }
}

// ── Create ────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSecretRequest {
    pub encrypted_secret: Option<String>,
    pub ip_restrictions: Option<Vec<String>>,
    pub max_views: Option<u32>,
    pub secret_password: Option<String>,
    pub expiration_date: Option<DateTime<Utc>>,
    pub email_notification: Option<String>,
}

/// Treat empty strings as unset, matching the wire behavior of the API's
/// optional fields.
fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

pub async fn create_secret(
    State(state): State<AppState>,
    Json(body): Json<CreateSecretRequest>,
) -> Response {
    let Some(encrypted_secret) = non_empty(body.encrypted_secret) else {
        return api_error(StatusCode::BAD_REQUEST, "encryptedSecret is required");
    };

    let mut ip_restrictions: Vec<String> = Vec::new();
    for ip in body.ip_restrictions.unwrap_or_default() {
        if !ip.is_empty() && !ip_restrictions.contains(&ip) {
            ip_restrictions.push(ip);
        }
    }

    let expiration_date = body
        .expiration_date
        .map(|d| d.timestamp())
        .unwrap_or_else(|| {
            crate::store::Store::unix_now() + state.defaults.default_expiration_length
        });

    let new = NewSecret {
        encrypted_secret,
        ip_restrictions,
        max_views: body.max_views.unwrap_or(state.defaults.max_views),
        secret_password: non_empty(body.secret_password),
        expiration_date: Some(expiration_date),
        email_notification: non_empty(body.email_notification),
    };

    match state.store.create_secret(new) {
        Ok((identifier, creator_identifier)) => {
            info!(identifier = %identifier, "secret created");
            (
                StatusCode::CREATED,
                Json(json!({
                    "success": true,
                    "data": {
                        "identifier": identifier,
                        "creatorIdentifier": creator_identifier,
                    }
                })),
            )
                .into_response()
        }
        Err(e) => internal_error(e),
    }
}

// ── Defaults ──────────────────────────────────────────────────────────────────

pub async fn secret_defaults(State(state): State<AppState>) -> Response {
    ok_data(json!(state.defaults))
}

// ── Retrieve (gatekeeper) ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrieveParams {
    pub secret_password: Option<String>,
}

pub async fn get_secret(
    State(state): State<AppState>,
    headers: HeaderMap,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Path(identifier): Path<String>,
    Query(params): Query<RetrieveParams>,
    body: String,
) -> Response {
    let ctx = access_context(&headers, &addr, body);

    match state
        .store
        .gate_access(&identifier, params.secret_password.as_deref(), &ctx)
    {
        Ok(AccessDecision::Granted { secret, notify }) => {
            info!(identifier = %identifier, ip = %ctx.ip, "access granted");
            if let Some(to) = notify {
                state
                    .notifier
                    .fire(&EmailMessage::secret_accessed(&to, &identifier));
            }
            ok_data(json!({"secret": secret}))
        }
        Ok(denial) => {
            info!(identifier = %identifier, ip = %ctx.ip, reason = ?denial, "access denied");
            let (status, message) = denial_response(&denial);
            api_error(status, message)
        }
        Err(e) => internal_error(e),
    }
}

fn denial_response(denial: &AccessDecision) -> (StatusCode, &'static str) {
    match denial {
        AccessDecision::NotFound => (StatusCode::NOT_FOUND, "Secret not found"),
        AccessDecision::Expired => (StatusCode::FORBIDDEN, "Secret expired"),
        AccessDecision::ViewLimitReached => (StatusCode::FORBIDDEN, "View limit reached"),
        AccessDecision::IpNotAllowed => (StatusCode::FORBIDDEN, "IP not allowed"),
        AccessDecision::InvalidPassword => (StatusCode::FORBIDDEN, "Invalid secret password"),
        AccessDecision::Granted { .. } => unreachable!("grants are not mapped to errors"),
    }
}

// ── Delete ────────────────────────────────────────────────────────────────────

pub async fn delete_secret(
    State(state): State<AppState>,
    Path(creator_identifier): Path<String>,
) -> Response {
    match state.store.delete_by_creator(&creator_identifier) {
        Ok(true) => {
            info!("secret deleted");
            ok_data(json!({"message": "Secret deleted"}))
        }
        Ok(false) => api_error(StatusCode::NOT_FOUND, "Secret not found"),
        Err(e) => internal_error(e),
    }
}

// ── Logs & stats ──────────────────────────────────────────────────────────────

pub async fn secret_logs(
    State(state): State<AppState>,
    Path(creator_identifier): Path<String>,
) -> Response {
    match state.store.find_by_creator(&creator_identifier) {
        Ok(Some(record)) => ok_data(json!({"logs": record.access_logs})),
        Ok(None) => api_error(StatusCode::NOT_FOUND, "Secret not found"),
        Err(e) => internal_error(e),
    }
}

pub async fn secret_stats(
    State(state): State<AppState>,
    Path(creator_identifier): Path<String>,
) -> Response {
    match state.store.stats_by_creator(&creator_identifier) {
        Ok(Some(stats)) => ok_data(json!(stats)),
        Ok(None) => api_error(StatusCode::NOT_FOUND, "Secret not found"),
        Err(e) => internal_error(e),
    }
}

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health(State(state): State<AppState>) -> Response {
    let store_ok = state.store.ping().is_ok();
    let queue_ok = state.store.queue_depth(&state.queue).is_ok();
    let all_ok = store_ok && queue_ok;

    let status = if all_ok {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };

    (
        status,
        Json(json!({
            "status": if all_ok { "ok" } else { "error" },
            "services": {
                "store": if store_ok { "ok" } else { "error" },
                "queue": if queue_ok { "ok" } else { "error" },
            }
        })),
    )
        .into_response()
}
