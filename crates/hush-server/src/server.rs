use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    handlers::{
        create_secret, delete_secret, get_secret, health, secret_defaults, secret_logs,
        secret_stats,
    },
    notify::Notifier,
    store::{SecretDefaults, Store},
    AppState,
};

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: Option<PathBuf>,
    pub cors_origins: Option<String>,
    /// Mail notification queue name, shared with the consumer.
    pub queue: String,
    pub defaults: SecretDefaults,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("HUSH_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: std::env::var("HUSH_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(5000),
            data_dir: std::env::var("HUSH_DATA_DIR").ok().map(PathBuf::from),
            cors_origins: std::env::var("HUSH_CORS_ORIGINS").ok(),
            queue: std::env::var("HUSH_QUEUE_NAME").unwrap_or_else(|_| "email".into()),
            defaults: SecretDefaults::default(),
        }
    }
}

/// Open (or create) the store under the configured data directory.
pub fn open_store(data_dir: Option<&PathBuf>) -> Result<Store> {
    let dir = match data_dir {
        Some(d) => d.clone(),
        None => std::env::var("HUSH_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data")),
    };
    std::fs::create_dir_all(&dir).context("create data dir")?;

    info!(data_dir = %dir.display(), "using data directory");
    Store::open(&dir.join("hush.db")).context("open store")
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    let store = open_store(cfg.data_dir.as_ref())?;
    run_with_store(cfg, store).await
}

/// Serve the HTTP API over an already-opened store. The caller may share
/// the store with in-process mail consumers.
pub async fn run_with_store(cfg: ServerConfig, store: Store) -> Result<()> {
    let state = AppState {
        notifier: Notifier::new(store.clone(), cfg.queue.clone()),
        store,
        defaults: cfg.defaults,
        queue: cfg.queue,
    };

    let app = router(state)
        .layer(build_cors(cfg.cors_origins.as_deref()))
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "hush server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")
}

pub(crate) fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/secrets/", post(create_secret))
        .route("/api/secrets/defaults", get(secret_defaults))
        .route(
            "/api/secrets/{identifier}",
            get(get_secret).delete(delete_secret),
        )
        .route("/api/secrets/logs/{creatorIdentifier}", get(secret_logs))
        .route("/api/secrets/stats/{creatorIdentifier}", get(secret_stats))
        .route("/health", get(health))
        .with_state(state)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
}

fn build_cors(origins: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([
            http::Method::GET,
            http::Method::POST,
            http::Method::DELETE,
            http::Method::OPTIONS,
        ])
        .allow_headers(Any);

    match origins {
        Some(o) => {
            let origins: Vec<_> = o.split(',').filter_map(|s| s.trim().parse().ok()).collect();
            cors.allow_origin(origins)
        }
        None => cors.allow_origin(Any),
    }
}
