//! Where backup artifacts live.
//!
//! A storage root holds `index.json`, `jobs.json` and one directory per backup id.

use crate::error::BackupError;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const INDEX_FILE: &str = "index.json";
pub const JOBS_FILE: &str = "jobs.json";

pub trait BackupStorage: Send + Sync + Debug {
    fn root(&self) -> &Path;

    fn index_path(&self) -> PathBuf {
        self.root().join(INDEX_FILE)
    }

    fn jobs_path(&self) -> PathBuf {
        self.root().join(JOBS_FILE)
    }

    fn backup_dir(&self, backup_id: &str) -> PathBuf {
        self.root().join(backup_id)
    }

    fn ensure_root(&self) -> std::io::Result<()>;

    /// Removes one backup directory. Returns `false` when nothing was removed.
    fn delete_backup(&self, backup_id: &str) -> std::io::Result<bool>;
}

#[derive(Debug, Clone)]
pub struct LocalBackupStorage {
    root: PathBuf,
}

impl LocalBackupStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl BackupStorage for LocalBackupStorage {
    fn root(&self) -> &Path {
        &self.root
    }

    fn ensure_root(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)
    }

    fn delete_backup(&self, backup_id: &str) -> std::io::Result<bool> {
        if !is_safe_name(backup_id) {
            tracing::warn!(backup_id, "Refusing to delete backup with unsafe id");
            return Ok(false);
        }
        let folder = self.backup_dir(backup_id);
        if !folder.is_dir() {
            return Ok(false);
        }
        // Only direct children of the root may be removed, even through symlinks.
        let root = self.root.canonicalize()?;
        let resolved = folder.canonicalize()?;
        if resolved.parent() != Some(root.as_path()) {
            tracing::warn!(backup_id, path = %resolved.display(), "Backup directory escapes storage root");
            return Ok(false);
        }
        std::fs::remove_dir_all(&resolved)?;
        Ok(true)
    }
}

/// A single path component: no separators, no `.`/`..`, not empty.
pub fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\', '\0'])
}

/// Resolves the configured driver. Unknown drivers fail at startup.
pub fn from_config(driver: &str, root: &Path) -> Result<Arc<dyn BackupStorage>, BackupError> {
    match driver {
        "local" => Ok(Arc::new(LocalBackupStorage::new(root))),
        other => Err(BackupError::Config(format!(
            "unknown backup storage driver '{other}'"
        ))),
    }
}
