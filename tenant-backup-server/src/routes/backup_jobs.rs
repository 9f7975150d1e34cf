use crate::error::AppError;
use crate::models::backup_job::BackupJob;
use crate::services::backup::jobs;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_jobs))
        .route("/{id}", get(get_job))
}

async fn list_jobs(State(state): State<Arc<AppState>>) -> Result<Json<Vec<BackupJob>>, AppError> {
    Ok(Json(jobs::list_jobs(&state).await?))
}

async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<BackupJob>, AppError> {
    Ok(Json(jobs::get_job(&state, &id).await?))
}
