//! Tenant export: rows to per-table artifacts plus `tenant.json` and `meta.json`.

use crate::error::BackupError;
use crate::models::backup_entry::BackupScope;
use crate::models::manifest::{
    table_file_name, BackupManifest, SweepSummary, SweepTenant, TableArtifact, TenantIdentity,
    MANIFEST_FILE, RESERVED_FILES, SWEEP_TENANTS_FILE, TENANT_FILE,
};
use crate::models::tenant::Tenant;
use crate::services::backup::canonical::{digest, to_canonical_bytes};
use crate::services::backup::codec;
use crate::services::backup::schema::{quote_ident, TableSchema, TENANT_COLUMN};
use rusqlite::Connection;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct TenantSnapshot {
    pub identity: TenantIdentity,
    pub tables: Vec<TableArtifact>,
}

impl TenantSnapshot {
    pub fn row_count(&self) -> usize {
        self.tables.iter().map(|t| t.rows.len()).sum()
    }
}

/// Files to write into one backup directory, `meta.json` excluded.
#[derive(Debug)]
pub struct ArtifactSet {
    pub files: Vec<(String, Vec<u8>)>,
    pub manifest: BackupManifest,
}

pub fn export_tenant(
    conn: &Connection,
    tables: &[TableSchema],
    tenant: &Tenant,
) -> anyhow::Result<TenantSnapshot> {
    let mut artifacts = Vec::with_capacity(tables.len());
    for schema in tables {
        let rows = export_table(conn, schema, &tenant.id)?;
        tracing::debug!(table = %schema.name, tenant_id = %tenant.id, rows = rows.len(), "Exported table");
        artifacts.push(TableArtifact {
            table: schema.name.clone(),
            rows,
        });
    }
    Ok(TenantSnapshot {
        identity: TenantIdentity {
            id: tenant.id.clone(),
            slug: tenant.slug.clone(),
            name: tenant.name.clone(),
        },
        tables: artifacts,
    })
}

fn export_table(
    conn: &Connection,
    schema: &TableSchema,
    tenant_id: &str,
) -> anyhow::Result<Vec<Map<String, Value>>> {
    let columns = schema
        .columns
        .iter()
        .map(|c| quote_ident(&c.name))
        .collect::<Vec<_>>()
        .join(", ");
    let order = if schema.primary_key.is_empty() {
        "rowid".to_string()
    } else {
        schema
            .primary_key
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ")
    };
    let sql = format!(
        "SELECT {columns} FROM {} WHERE {} = ? ORDER BY {order}",
        quote_ident(&schema.name),
        quote_ident(TENANT_COLUMN),
    );

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([tenant_id])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let mut record = Map::new();
        for (i, column) in schema.columns.iter().enumerate() {
            record.insert(column.name.clone(), codec::to_json(column, row.get_ref(i)?));
        }
        out.push(record);
    }
    Ok(out)
}

/// Encodes a snapshot canonically and computes its manifest.
pub fn build_artifacts(
    backup_id: &str,
    created_at: &str,
    snapshot: &TenantSnapshot,
) -> Result<ArtifactSet, BackupError> {
    let mut manifest = empty_manifest(backup_id, created_at, BackupScope::Tenant);
    let mut files = Vec::with_capacity(snapshot.tables.len() + 1);

    for artifact in &snapshot.tables {
        let name = table_file_name(&artifact.table);
        if RESERVED_FILES.contains(&name.as_str()) {
            return Err(BackupError::Validation(format!(
                "table {} collides with reserved artifact {name}",
                artifact.table
            )));
        }
        let bytes = to_canonical_bytes(artifact)?;
        manifest.files.insert(name.clone(), digest(&bytes));
        manifest.tables.push(artifact.table.clone());
        manifest
            .table_counts
            .insert(artifact.table.clone(), artifact.rows.len());
        files.push((name, bytes));
    }

    let identity = to_canonical_bytes(&snapshot.identity)?;
    let identity_digest = digest(&identity);
    manifest.checksum = Some(identity_digest.checksum.clone());
    manifest.files.insert(TENANT_FILE.to_string(), identity_digest);
    files.push((TENANT_FILE.to_string(), identity));

    Ok(ArtifactSet { files, manifest })
}

pub fn build_sweep_artifacts(
    backup_id: &str,
    created_at: &str,
    tenants: &[SweepTenant],
) -> Result<ArtifactSet, BackupError> {
    let mut manifest = empty_manifest(backup_id, created_at, BackupScope::All);
    let summary = SweepSummary {
        count: tenants.len(),
        items: tenants.to_vec(),
    };
    let bytes = to_canonical_bytes(&summary)?;
    manifest
        .files
        .insert(SWEEP_TENANTS_FILE.to_string(), digest(&bytes));
    Ok(ArtifactSet {
        files: vec![(SWEEP_TENANTS_FILE.to_string(), bytes)],
        manifest,
    })
}

fn empty_manifest(backup_id: &str, created_at: &str, scope: BackupScope) -> BackupManifest {
    BackupManifest {
        backup_id: backup_id.to_string(),
        created_at: created_at.to_string(),
        scope,
        tables: Vec::new(),
        table_counts: BTreeMap::new(),
        files: BTreeMap::new(),
        checksum: None,
    }
}

/// Writes artifacts then `meta.json`. A partially written directory is removed.
pub fn write_artifacts(dir: &Path, set: &ArtifactSet) -> Result<(), BackupError> {
    let result = (|| -> Result<(), BackupError> {
        std::fs::create_dir_all(dir)?;
        for (name, bytes) in &set.files {
            std::fs::write(dir.join(name), bytes)?;
        }
        let manifest = serde_json::to_vec_pretty(&set.manifest)?;
        std::fs::write(dir.join(MANIFEST_FILE), manifest)?;
        Ok(())
    })();

    if result.is_err() {
        if let Err(e) = std::fs::remove_dir_all(dir) {
            tracing::warn!(path = %dir.display(), "Failed to clean up partial backup: {e}");
        }
    }
    result
}
