use crate::error::AppError;
use crate::models::audit_log::{AuditEntry, AuditFilter};
use crate::models::backup_entry::{BackupScope, BackupView};
use crate::models::backup_job::{BackupJob, JobTrigger};
use crate::routes::actor;
use crate::services::backup::jobs::{self, JobMetricsSnapshot};
use crate::services::backup::{self as backup, BackupFilter};
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(list_backups))
        .route("/history", get(history))
        .route("/metrics", get(metrics))
        .route("/all", post(backup_all))
        .route("/tenants/{tenant_id}", post(backup_tenant))
        .route("/{id}", get(get_backup))
        .route("/{id}/download", get(download))
        .route("/{id}/files/{filename}", get(download_file))
        .route("/{id}/restore", post(restore))
}

#[derive(Deserialize)]
struct ListQuery {
    tenant_id: Option<String>,
    scope: Option<String>,
}

async fn list_backups(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<BackupView>>, AppError> {
    let scope = query
        .scope
        .as_deref()
        .map(str::parse::<BackupScope>)
        .transpose()
        .map_err(AppError::BadRequest)?;
    let filter = BackupFilter {
        tenant_id: query.tenant_id,
        scope,
    };
    Ok(Json(backup::list_backups(&state, filter).await?))
}

async fn history(
    State(state): State<Arc<AppState>>,
    Query(filter): Query<AuditFilter>,
) -> Result<Json<Vec<AuditEntry>>, AppError> {
    Ok(Json(backup::backup_history(&state, filter).await?))
}

async fn metrics(State(state): State<Arc<AppState>>) -> Json<JobMetricsSnapshot> {
    Json(state.metrics.snapshot())
}

async fn get_backup(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<BackupView>, AppError> {
    Ok(Json(backup::get_backup(&state, &id).await?))
}

async fn download(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let bytes = backup::build_zip(&state, &id).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/zip".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"backup-{id}.zip\""),
            ),
        ],
        bytes,
    ))
}

async fn download_file(
    State(state): State<Arc<AppState>>,
    Path((id, filename)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let bytes = backup::read_backup_file(&state, &id, &filename).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        bytes,
    ))
}

async fn backup_tenant(
    State(state): State<Arc<AppState>>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<Value>), AppError> {
    let view = backup::create_tenant_backup(&state, &tenant_id, &actor(&headers)).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "backup": view, "message": "Backup created" })),
    ))
}

async fn backup_all(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<BackupJob>), AppError> {
    let job = jobs::enqueue_all_tenants(&state, JobTrigger::Manual, &actor(&headers)).await?;
    Ok((StatusCode::ACCEPTED, Json(job)))
}

async fn restore(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Value>, AppError> {
    let (view, summary) = backup::restore_backup(&state, &id, &actor(&headers)).await?;
    Ok(Json(json!({
        "backup": view,
        "message": "Backup restored",
        "restored_rows": summary.table_rows,
    })))
}
