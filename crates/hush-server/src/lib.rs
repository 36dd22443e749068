pub mod gatekeeper;
pub mod handlers;
pub mod notify;
pub mod server;
pub mod store;

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub store: store::Store,
    pub notifier: notify::Notifier,
    /// Policy applied when creation requests omit fields.
    pub defaults: store::SecretDefaults,
    /// Name of the mail notification queue (health probe target).
    pub queue: String,
}

pub use server::{open_store, run, run_with_store, ServerConfig};
