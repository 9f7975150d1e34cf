//! `index.json`: the backup catalog, newest entry first.
//!
//! Callers serialize access through `AppState::index_lock`.

use crate::config::RetentionPolicy;
use crate::error::BackupError;
use crate::models::backup_entry::{format_size, BackupEntry, BackupFileInfo};
use crate::services::backup::retention::apply_retention;
use crate::services::backup::storage::BackupStorage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Default, Serialize, Deserialize)]
struct IndexFile {
    #[serde(default)]
    items: Vec<BackupEntry>,
}

pub fn read_index(storage: &dyn BackupStorage) -> Result<Vec<BackupEntry>, BackupError> {
    let path = storage.index_path();
    let bytes = match std::fs::read(&path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let index: IndexFile = serde_json::from_slice(&bytes)?;
    Ok(index
        .items
        .into_iter()
        .filter(|entry| {
            let ok = entry.is_consistent();
            if !ok {
                tracing::warn!(
                    backup_id = %entry.id,
                    scope = ?entry.scope,
                    "Skipping index entry with mismatched tenant fields"
                );
            }
            ok
        })
        .collect())
}

fn write_index(storage: &dyn BackupStorage, items: &[BackupEntry]) -> Result<(), BackupError> {
    storage.ensure_root()?;
    let bytes = serde_json::to_vec_pretty(&serde_json::json!({ "items": items }))?;
    write_atomic(&storage.index_path(), &bytes)?;
    Ok(())
}

/// Write to a sibling temp file and rename over the target.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

/// Applies retention. When anything is pruned the index is rewritten first and
/// the artifact directories are deleted afterwards.
fn prune(
    storage: &dyn BackupStorage,
    items: Vec<BackupEntry>,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
    always_write: bool,
) -> Result<Vec<BackupEntry>, BackupError> {
    let outcome = apply_retention(items, now, policy);
    if always_write || !outcome.removed.is_empty() {
        write_index(storage, &outcome.kept)?;
    }
    for entry in &outcome.removed {
        match storage.delete_backup(&entry.id) {
            Ok(true) => tracing::info!(backup_id = %entry.id, "Pruned backup"),
            Ok(false) => tracing::debug!(backup_id = %entry.id, "Pruned backup had no artifacts"),
            Err(e) => tracing::warn!(backup_id = %entry.id, "Failed to delete pruned backup: {e}"),
        }
    }
    Ok(outcome.kept)
}

pub fn load_pruned(
    storage: &dyn BackupStorage,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Result<Vec<BackupEntry>, BackupError> {
    let items = read_index(storage)?;
    prune(storage, items, policy, now, false)
}

pub fn save(
    storage: &dyn BackupStorage,
    items: Vec<BackupEntry>,
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Result<Vec<BackupEntry>, BackupError> {
    prune(storage, items, policy, now, true)
}

/// Artifact files of one backup, sorted by name.
pub fn collect_files(storage: &dyn BackupStorage, backup_id: &str) -> std::io::Result<Vec<BackupFileInfo>> {
    let dir = storage.backup_dir(backup_id);
    let entries = match std::fs::read_dir(&dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut files = Vec::new();
    for entry in entries {
        let entry = entry?;
        let meta = entry.metadata()?;
        let name = entry.file_name().to_string_lossy().to_string();
        if meta.is_file() && name.ends_with(".json") {
            files.push(BackupFileInfo {
                size_label: format_size(meta.len()),
                size_bytes: meta.len(),
                name,
            });
        }
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}
