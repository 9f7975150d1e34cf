pub mod backup_jobs;
pub mod backups;

use crate::error::AppError;
use crate::state::AppState;
use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub const ADMIN_KEY_HEADER: &str = "x-admin-key";
pub const ADMIN_ACTOR_HEADER: &str = "x-admin-actor";
const DEFAULT_ACTOR: &str = "system";

pub fn create_router(state: Arc<AppState>) -> Router {
    let admin = Router::new()
        .nest("/backups", backups::router())
        .nest("/backup-jobs", backup_jobs::router())
        .route_layer(middleware::from_fn_with_state(state.clone(), require_admin_key));

    Router::new()
        .route("/api/health", get(health))
        .nest("/api", admin)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn require_admin_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let provided = request
        .headers()
        .get(ADMIN_KEY_HEADER)
        .and_then(|v| v.to_str().ok());
    if provided != Some(state.config.admin_api_key.as_str()) {
        return Err(AppError::Unauthorized("Missing or invalid admin key".into()));
    }
    Ok(next.run(request).await)
}

/// Audit actor of a request.
pub(crate) fn actor(headers: &HeaderMap) -> String {
    headers
        .get(ADMIN_ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_ACTOR)
        .to_string()
}
