//! Tenant backup and restore.
//!
//! Backups are JSON artifact sets under the storage root, catalogued in
//! `index.json`. Every operation here is async and pushes file and database
//! work onto the blocking pool.

pub mod canonical;
pub mod codec;
pub mod exporter;
pub mod index;
pub mod integrity;
pub mod jobs;
pub mod restore;
pub mod retention;
pub mod schema;
pub mod storage;

use crate::error::{BackupError, EntityKind};
use crate::models::audit_log::{self, AuditEntry, AuditFilter, ACTION_BACKUP_CREATE, ACTION_BACKUP_RESTORE, ENTITY_BACKUP};
use crate::models::backup_entry::{BackupEntry, BackupScope, BackupView};
use crate::models::manifest::SweepTenant;
use crate::models::tenant;
use crate::services::backup::restore::RestoreSummary;
use crate::services::backup::storage::is_safe_name;
use crate::state::AppState;
use chrono::{SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use uuid::Uuid;
use zip::write::SimpleFileOptions;

/// Rows per table as read from a backup.
pub type TableRows = BTreeMap<String, Vec<Map<String, Value>>>;

pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T, BackupError>
where
    F: FnOnce() -> Result<T, BackupError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BackupError::Internal(anyhow::anyhow!(e)))?
}

pub(crate) fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[derive(Debug, Default, Clone)]
pub struct BackupFilter {
    pub tenant_id: Option<String>,
    pub scope: Option<BackupScope>,
}

fn to_view(state: &AppState, entry: BackupEntry) -> Result<BackupView, BackupError> {
    let files = index::collect_files(state.storage.as_ref(), &entry.id)?;
    Ok(BackupView { entry, files })
}

pub async fn list_backups(state: &Arc<AppState>, filter: BackupFilter) -> Result<Vec<BackupView>, BackupError> {
    let _guard = state.index_lock.lock().await;
    let st = state.clone();
    run_blocking(move || {
        let items = index::load_pruned(st.storage.as_ref(), &st.config.backup.retention, Utc::now())?;
        items
            .into_iter()
            .filter(|e| filter.tenant_id.as_ref().map_or(true, |t| e.tenant_id.as_ref() == Some(t)))
            .filter(|e| filter.scope.map_or(true, |s| e.scope == s))
            .map(|e| to_view(&st, e))
            .collect()
    })
    .await
}

pub async fn find_entry(state: &Arc<AppState>, backup_id: &str) -> Result<BackupEntry, BackupError> {
    let _guard = state.index_lock.lock().await;
    let st = state.clone();
    let id = backup_id.to_string();
    run_blocking(move || {
        index::load_pruned(st.storage.as_ref(), &st.config.backup.retention, Utc::now())?
            .into_iter()
            .find(|e| e.id == id)
            .ok_or_else(|| BackupError::not_found(EntityKind::Backup, id))
    })
    .await
}

pub async fn get_backup(state: &Arc<AppState>, backup_id: &str) -> Result<BackupView, BackupError> {
    let entry = find_entry(state, backup_id).await?;
    let st = state.clone();
    run_blocking(move || to_view(&st, entry)).await
}

/// Prepends an entry and persists the index with retention applied.
async fn record_entry(state: &Arc<AppState>, entry: BackupEntry) -> Result<(), BackupError> {
    let _guard = state.index_lock.lock().await;
    let st = state.clone();
    run_blocking(move || {
        let mut items = index::read_index(st.storage.as_ref())?;
        items.insert(0, entry);
        index::save(st.storage.as_ref(), items, &st.config.backup.retention, Utc::now())?;
        Ok(())
    })
    .await
}

async fn audit(
    state: &Arc<AppState>,
    actor: &str,
    action: &'static str,
    backup_id: &str,
    payload: Value,
) -> Result<(), BackupError> {
    let db = state.db.clone();
    let actor = actor.to_string();
    let backup_id = backup_id.to_string();
    run_blocking(move || {
        let conn = db.get()?;
        audit_log::write(&conn, &actor, action, ENTITY_BACKUP, &backup_id, &payload)?;
        Ok(())
    })
    .await
}

/// Exports one tenant synchronously and returns the stored entry.
pub async fn create_tenant_backup(
    state: &Arc<AppState>,
    tenant_id: &str,
    actor: &str,
) -> Result<BackupView, BackupError> {
    let st = state.clone();
    let tid = tenant_id.to_string();
    let (entry, tables, rows) = run_blocking(move || {
        let conn = st.db.get()?;
        let tenant = tenant::find_by_id(&conn, &tid)?
            .ok_or_else(|| BackupError::not_found(EntityKind::Tenant, &tid))?;
        let schemas = st.tables.tenant_tables(&conn)?;
        let snapshot = exporter::export_tenant(&conn, &schemas, &tenant)?;
        drop(conn);

        let backup_id = Uuid::new_v4().to_string();
        let created_at = now_rfc3339();
        let set = exporter::build_artifacts(&backup_id, &created_at, &snapshot)?;
        st.storage.ensure_root()?;
        exporter::write_artifacts(&st.storage.backup_dir(&backup_id), &set)?;

        let entry = BackupEntry::for_tenant(backup_id, &tenant.id, &tenant.slug, created_at);
        Ok((entry, set.manifest.tables.len(), snapshot.row_count()))
    })
    .await?;

    record_entry(state, entry.clone()).await?;
    tracing::info!(backup_id = %entry.id, tenant_id, tables, rows, "Tenant backup created");

    audit(
        state,
        actor,
        ACTION_BACKUP_CREATE,
        &entry.id,
        json!({
            "scope": BackupScope::Tenant.as_str(),
            "tenant_id": entry.tenant_id,
            "tenant_slug": entry.tenant_slug,
            "tables": tables,
            "rows": rows,
        }),
    )
    .await?;

    let st = state.clone();
    run_blocking(move || to_view(&st, entry)).await
}

/// Writes the scope=all summary of a finished sweep.
pub async fn create_sweep_backup(
    state: &Arc<AppState>,
    tenants: Vec<SweepTenant>,
    actor: &str,
) -> Result<BackupEntry, BackupError> {
    let count = tenants.len();
    let st = state.clone();
    let entry = run_blocking(move || {
        let backup_id = Uuid::new_v4().to_string();
        let created_at = now_rfc3339();
        let set = exporter::build_sweep_artifacts(&backup_id, &created_at, &tenants)?;
        st.storage.ensure_root()?;
        exporter::write_artifacts(&st.storage.backup_dir(&backup_id), &set)?;
        Ok(BackupEntry::for_sweep(backup_id, created_at))
    })
    .await?;

    record_entry(state, entry.clone()).await?;
    audit(
        state,
        actor,
        ACTION_BACKUP_CREATE,
        &entry.id,
        json!({ "scope": BackupScope::All.as_str(), "tenants": count }),
    )
    .await?;
    Ok(entry)
}

/// Verifies and restores a tenant backup. Nothing is written unless every check passes.
///
/// `index_lock` is held throughout so retention cannot prune the backup mid-restore.
pub async fn restore_backup(
    state: &Arc<AppState>,
    backup_id: &str,
    actor: &str,
) -> Result<(BackupView, RestoreSummary), BackupError> {
    let (updated, tenant_id, summary) = {
        let _guard = state.index_lock.lock().await;
        let st = state.clone();
        let id = backup_id.to_string();
        run_blocking(move || restore_indexed(&st, &id)).await?
    };
    tracing::info!(backup_id = %updated.id, tenant_id = %tenant_id, rows = summary.rows, "Backup restored");

    audit(
        state,
        actor,
        ACTION_BACKUP_RESTORE,
        &updated.id,
        json!({
            "tenant_id": tenant_id,
            "tables": summary.tables,
            "rows": summary.rows,
        }),
    )
    .await?;

    let st = state.clone();
    let view = run_blocking(move || to_view(&st, updated)).await?;
    Ok((view, summary))
}

/// Restore body; the caller holds `index_lock`.
fn restore_indexed(st: &AppState, backup_id: &str) -> Result<(BackupEntry, String, RestoreSummary), BackupError> {
    let storage = st.storage.as_ref();
    let retention = &st.config.backup.retention;
    let now = Utc::now();

    let mut items = index::load_pruned(storage, retention, now)?;
    let entry = items
        .iter()
        .find(|e| e.id == backup_id)
        .cloned()
        .ok_or_else(|| BackupError::not_found(EntityKind::Backup, backup_id))?;
    if entry.scope == BackupScope::All {
        return Err(BackupError::BadRequest("Only tenant backups can be restored".into()));
    }
    let tenant_id = entry
        .tenant_id
        .clone()
        .ok_or_else(|| BackupError::Validation(format!("backup {backup_id} has no tenant")))?;

    let dir = storage.backup_dir(&entry.id);
    let manifest = integrity::read_manifest(&dir, &entry.id)?;
    if manifest.scope != BackupScope::Tenant {
        return Err(BackupError::BadRequest("Only tenant backups can be restored".into()));
    }
    integrity::verify_artifacts(&dir, &manifest)?;
    integrity::verify_tenant_identity(&dir, &tenant_id)?;
    let data = integrity::load_table_rows(&dir, &manifest)?;

    let mut conn = st.db.get()?;
    if tenant::find_by_id(&conn, &tenant_id)?.is_none() {
        return Err(BackupError::not_found(EntityKind::Tenant, &tenant_id));
    }
    let schemas = st.tables.tenant_tables(&conn)?;
    integrity::validate_rows(&conn, &tenant_id, &schemas, &data)?;
    let summary =
        restore::restore_tenant_tables(&mut conn, &tenant_id, &schemas, &data, Some(&manifest.table_counts))?;
    drop(conn);

    let restored_at = now_rfc3339();
    let mut updated = entry;
    updated.restored_at = Some(restored_at.clone());
    if let Some(stored) = items.iter_mut().find(|e| e.id == updated.id) {
        stored.restored_at = Some(restored_at);
    }
    index::save(storage, items, retention, now)?;
    Ok((updated, tenant_id, summary))
}

/// Zip of every JSON artifact in one backup, built in memory.
pub async fn build_zip(state: &Arc<AppState>, backup_id: &str) -> Result<Vec<u8>, BackupError> {
    let entry = find_entry(state, backup_id).await?;
    let st = state.clone();
    run_blocking(move || {
        let files = index::collect_files(st.storage.as_ref(), &entry.id)?;
        let dir = st.storage.backup_dir(&entry.id);

        let mut zip = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        for file in files {
            let bytes = std::fs::read(dir.join(&file.name))?;
            zip.start_file(file.name.as_str(), options)
                .map_err(|e| BackupError::Internal(e.into()))?;
            zip.write_all(&bytes)?;
        }
        let cursor = zip.finish().map_err(|e| BackupError::Internal(e.into()))?;
        Ok(cursor.into_inner())
    })
    .await
}

/// One artifact. The name must resolve to a direct child of the backup's own directory.
pub async fn read_backup_file(
    state: &Arc<AppState>,
    backup_id: &str,
    filename: &str,
) -> Result<Vec<u8>, BackupError> {
    let entry = find_entry(state, backup_id).await?;
    if !is_safe_name(filename) || !filename.ends_with(".json") {
        return Err(BackupError::not_found(EntityKind::BackupFile, filename));
    }
    let st = state.clone();
    let filename = filename.to_string();
    run_blocking(move || {
        let dir = st.storage.backup_dir(&entry.id);
        let missing = || BackupError::not_found(EntityKind::BackupFile, &filename);
        let path = dir.join(&filename);
        if !path.is_file() {
            return Err(missing());
        }
        let resolved = path.canonicalize()?;
        if resolved.parent() != Some(dir.canonicalize()?.as_path()) {
            tracing::warn!(backup_id = %entry.id, file = %filename, "Artifact resolves outside its backup");
            return Err(missing());
        }
        Ok(std::fs::read(resolved)?)
    })
    .await
}

/// Backup-related audit entries.
pub async fn backup_history(state: &Arc<AppState>, mut filter: AuditFilter) -> Result<Vec<AuditEntry>, BackupError> {
    filter.entity_type = Some(ENTITY_BACKUP.to_string());
    let db = state.db.clone();
    run_blocking(move || {
        let conn = db.get()?;
        Ok(audit_log::find(&conn, &filter)?)
    })
    .await
}
