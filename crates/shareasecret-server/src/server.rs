use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use directories::ProjectDirs;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::{
    allowlist::{require_allowed_creator, CreationAllowlist},
    application::Application,
    handlers::{
        create_secret, delete_secret, health, issue_view, manage_secret, redeem_view,
        request_access,
    },
    jobs::DEFAULT_REAPER_INTERVAL,
    store::Store,
    AppState,
};

const DB_FILE_NAME: &str = "shareasecret.db";
const MIN_REAPER_INTERVAL: Duration = Duration::from_secs(1);

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Database file; defaults to `shareasecret.db` in the data directory.
    pub db_path: Option<PathBuf>,
    /// Public URL prefix for share links; defaults to `http://{host}:{port}`.
    pub base_url: Option<String>,
    pub cors_origins: Option<String>,
    /// Comma-separated IPs allowed to create secrets ($SHAREASECRET_CREATION_IP_ALLOWLIST).
    pub creation_allowlist: Option<String>,
    /// Comma-separated proxy IPs whose forwarding headers are trusted
    /// ($SHAREASECRET_TRUSTED_PROXIES).
    pub trusted_proxies: Option<String>,
    pub reaper_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: std::env::var("SHAREASECRET_HOST").unwrap_or_else(|_| "127.0.0.1".into()),
            port: std::env::var("SHAREASECRET_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8994),
            db_path: std::env::var("SHAREASECRET_DB_PATH").ok().map(PathBuf::from),
            base_url: std::env::var("SHAREASECRET_BASE_URL").ok(),
            cors_origins: std::env::var("SHAREASECRET_CORS_ORIGINS").ok(),
            creation_allowlist: std::env::var("SHAREASECRET_CREATION_IP_ALLOWLIST").ok(),
            trusted_proxies: std::env::var("SHAREASECRET_TRUSTED_PROXIES").ok(),
            reaper_interval: reaper_interval(
                std::env::var("SHAREASECRET_REAPER_INTERVAL_SECS")
                    .ok()
                    .as_deref(),
            ),
        }
    }
}

/// Parse the reaper interval in seconds. Never shorter than
/// [`MIN_REAPER_INTERVAL`], so the reaper cannot hog the single writer.
fn reaper_interval(secs: Option<&str>) -> Duration {
    secs.and_then(|v| v.trim().parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_REAPER_INTERVAL)
        .max(MIN_REAPER_INTERVAL)
}

impl ServerConfig {
    pub fn base_url(&self) -> String {
        match &self.base_url {
            Some(url) => url.trim_end_matches('/').to_owned(),
            None => format!("http://{}:{}", self.host, self.port),
        }
    }
}

/// Resolve the database file, creating its parent directory if needed.
///
/// Without an explicit path the file lives in `$SHAREASECRET_DATA_DIR`, or
/// failing that the platform data dir (`~/.local/share/shareasecret/`, etc.).
pub fn resolve_db_path(db_path: Option<&PathBuf>) -> Result<PathBuf> {
    let path = match db_path {
        Some(path) => path.clone(),
        None => {
            let dir = match std::env::var("SHAREASECRET_DATA_DIR") {
                Ok(dir) => PathBuf::from(dir),
                Err(_) => ProjectDirs::from("", "", "shareasecret")
                    .context("could not determine platform data directory")?
                    .data_dir()
                    .to_owned(),
            };
            dir.join(DB_FILE_NAME)
        }
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create database dir {}", parent.display()))?;
    }
    Ok(path)
}

/// Build the HTTP routes over `state`.
pub fn router(state: AppState, cors_origins: Option<&str>) -> Router {
    // Only creation is subject to the allow-list.
    let create = Router::new()
        .route("/secrets", post(create_secret))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_allowed_creator,
        ));

    let public = Router::new()
        .route("/health", get(health))
        .route("/secrets/{access_id}", get(request_access))
        .route("/secrets/{access_id}/views", post(issue_view))
        .route(
            "/secrets/{access_id}/views/{viewing_key}",
            post(redeem_view),
        )
        .route(
            "/manage-secret/{management_id}",
            get(manage_secret).delete(delete_secret),
        );

    Router::new()
        .merge(create)
        .merge(public)
        .with_state(state)
        .layer(build_cors(cors_origins))
        .layer(TraceLayer::new_for_http())
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    let db_path = resolve_db_path(cfg.db_path.as_ref())?;
    info!(db_path = %db_path.display(), "using database");

    let store = Store::open(&db_path).context("open store")?;
    let app = Application::new(store);

    let creation_allowlist = CreationAllowlist::parse(cfg.creation_allowlist.as_deref())?
        .with_trusted_proxies(cfg.trusted_proxies.as_deref())?;
    if creation_allowlist.is_restricted() {
        info!("secret creation restricted by IP allow-list");
    }

    let reaper_interval = cfg.reaper_interval.max(MIN_REAPER_INTERVAL);
    app.run_expiry_reaper(reaper_interval);
    info!(interval_secs = reaper_interval.as_secs(), "expiry reaper started");

    let state = AppState {
        app,
        base_url: cfg.base_url(),
        creation_allowlist,
    };
    let router = router(state, cfg.cors_origins.as_deref());

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;

    info!(%addr, "shareasecret server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server error")
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
