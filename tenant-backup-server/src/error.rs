use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

/// Entity kinds that can be missing; used for stable not-found messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Backup,
    BackupFile,
    Job,
    Tenant,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EntityKind::Backup => "Backup",
            EntityKind::BackupFile => "Backup file",
            EntityKind::Job => "Backup job",
            EntityKind::Tenant => "Tenant",
        };
        f.write_str(name)
    }
}

/// Errors raised by the backup core.
#[derive(thiserror::Error, Debug)]
pub enum BackupError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: EntityKind, id: String },

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Conflict(String),

    #[error("backup {0} has no manifest")]
    ManifestMissing(String),

    #[error("checksum mismatch for {file}")]
    ChecksumMismatch { file: String },

    #[error("table {table} row {row}: {reason}")]
    InvalidRow { table: String, row: usize, reason: String },

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Pool(#[from] r2d2::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl BackupError {
    pub fn not_found(kind: EntityKind, id: impl Into<String>) -> Self {
        BackupError::NotFound { kind, id: id.into() }
    }

    pub fn invalid_row(table: &str, row: usize, reason: impl Into<String>) -> Self {
        BackupError::InvalidRow {
            table: table.to_string(),
            row,
            reason: reason.into(),
        }
    }

    /// True for errors that must abort a restore before anything is written.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            BackupError::ManifestMissing(_)
                | BackupError::ChecksumMismatch { .. }
                | BackupError::InvalidRow { .. }
                | BackupError::Validation(_)
        )
    }
}

#[derive(thiserror::Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Unprocessable(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn code(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "not_found",
            AppError::BadRequest(_) => "bad_request",
            AppError::Unauthorized(_) => "unauthorized",
            AppError::Conflict(_) => "conflict",
            AppError::Unprocessable(_) => "validation_failed",
            AppError::Internal(_) => "internal",
        }
    }
}

impl From<BackupError> for AppError {
    fn from(err: BackupError) -> Self {
        match err {
            BackupError::NotFound { .. } => AppError::NotFound(err.to_string()),
            BackupError::BadRequest(m) => AppError::BadRequest(m),
            BackupError::Conflict(m) => AppError::Conflict(m),
            e if e.is_validation() => AppError::Unprocessable(e.to_string()),
            BackupError::Internal(e) => AppError::Internal(e),
            other => AppError::Internal(anyhow::Error::new(other)),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let code = self.code();
        let (status, msg) = match &self {
            AppError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            AppError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            AppError::Unauthorized(m) => (StatusCode::UNAUTHORIZED, m.clone()),
            AppError::Conflict(m) => (StatusCode::CONFLICT, m.clone()),
            AppError::Unprocessable(m) => (StatusCode::UNPROCESSABLE_ENTITY, m.clone()),
            AppError::Internal(e) => {
                tracing::error!("Internal error: {e:#}");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".into())
            }
        };
        (status, Json(json!({ "error": msg, "code": code }))).into_response()
    }
}
