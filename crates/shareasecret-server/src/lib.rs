pub mod allowlist;
pub mod application;
pub mod error;
pub mod handlers;
pub mod ids;
pub mod jobs;
pub mod server;
pub mod store;

/// Shared application state threaded through axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub app: application::Application,
    /// Public URL prefix used when building share and view links.
    pub base_url: String,
    pub creation_allowlist: allowlist::CreationAllowlist,
}

pub use application::{Application, CreateSecretForm, CreatedSecret, RedeemedView};
pub use error::{SecretError, SecretResult};
pub use server::{resolve_db_path, run, ServerConfig};
