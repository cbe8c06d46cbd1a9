use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Form, Json,
};
use serde::Serialize;
use serde_json::json;
use tracing::info;

use crate::{application::CreateSecretForm, error::SecretError, AppState};

/// Shown for every not-found flavour so callers learn nothing about which applied.
const NOT_AVAILABLE: &str = "this secret no longer exists or has already been viewed";
const INTERNAL_ERROR: &str = "internal server error, please try again later";

// ── Health ────────────────────────────────────────────────────────────────────

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

// ── Create ────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct CreateResponse {
    pub management_id: String,
    pub manage_url: String,
}

pub async fn create_secret(
    State(state): State<AppState>,
    Form(form): Form<CreateSecretForm>,
) -> Response {
    match state.app.create_secret(&form) {
        Ok(created) => {
            info!("audit: secret.create");
            let location = format!("/manage-secret/{}", created.management_id);
            (
                StatusCode::CREATED,
                [(header::LOCATION, location.clone())],
                Json(CreateResponse {
                    management_id: created.management_id,
                    manage_url: format!("{}{location}", state.base_url),
                }),
            )
                .into_response()
        }
        Err(e) => secret_error(e),
    }
}

// ── Request access (interstitial) ─────────────────────────────────────────────

pub async fn request_access(
    State(state): State<AppState>,
    Path(access_id): Path<String>,
) -> Response {
    match state.app.request_access(&access_id) {
        Ok(()) => Json(json!({
            "status": "available",
            "warning": "viewing this secret will use up one of its views",
        }))
        .into_response(),
        Err(e) => secret_error(e),
    }
}

// ── Issue view ────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct IssueViewResponse {
    pub viewing_key: String,
    pub view_url: String,
}

pub async fn issue_view(
    State(state): State<AppState>,
    Path(access_id): Path<String>,
) -> Response {
    match state.app.issue_view(&access_id) {
        Ok(viewing_key) => {
            let view_url = format!(
                "{}/secrets/{access_id}/views/{viewing_key}",
                state.base_url
            );
            (
                StatusCode::CREATED,
                Json(IssueViewResponse {
                    viewing_key,
                    view_url,
                }),
            )
                .into_response()
        }
        Err(e) => secret_error(e),
    }
}

// ── Redeem view ───────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct RedeemResponse {
    pub cipher_text: String,
    pub maximum_views_reached: bool,
}

pub async fn redeem_view(
    State(state): State<AppState>,
    Path((access_id, viewing_key)): Path<(String, String)>,
) -> Response {
    match state.app.redeem_view(&access_id, &viewing_key) {
        Ok(view) => {
            info!(
                maximum_views_reached = view.maximum_views_reached,
                "audit: secret.view"
            );
            Json(RedeemResponse {
                cipher_text: view.cipher_text,
                maximum_views_reached: view.maximum_views_reached,
            })
            .into_response()
        }
        Err(e) => secret_error(e),
    }
}

// ── Manage ────────────────────────────────────────────────────────────────────

pub async fn manage_secret(
    State(state): State<AppState>,
    Path(management_id): Path<String>,
) -> Response {
    match state.app.resolve_management(&management_id) {
        Ok(access_id) => Json(json!({
            "access_id": access_id,
            "share_url": format!("{}/secrets/{access_id}", state.base_url),
        }))
        .into_response(),
        Err(e) => secret_error(e),
    }
}

// ── Delete ────────────────────────────────────────────────────────────────────

pub async fn delete_secret(
    State(state): State<AppState>,
    Path(management_id): Path<String>,
) -> Response {
    match state.app.delete_secret(&management_id) {
        Ok(()) => {
            info!("audit: secret.delete");
            Json(json!({"deleted": true})).into_response()
        }
        Err(e) => secret_error(e),
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn secret_error(e: SecretError) -> Response {
    if e.is_validation() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": e.to_string()})),
        )
            .into_response();
    }
    if e.is_not_found() {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": NOT_AVAILABLE})),
        )
            .into_response();
    }
    match e {
        SecretError::Internal(e) => internal_error(e),
        other => internal_error(other.into()),
    }
}

fn internal_error(e: anyhow::Error) -> Response {
    tracing::error!(error = %e, "internal error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": INTERNAL_ERROR})),
    )
        .into_response()
}
