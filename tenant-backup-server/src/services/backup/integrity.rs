//! Checks a backup must pass before restore writes anything.
//!
//! Order: artifact digests, then per-row checks and primary-key ownership, then FK
//! closure inside the backup (single-column, then composite), then FKs pointing
//! outside the backup against the live database. The first violation aborts.
//!
//! A closure miss still passes when the parent table keeps shared rows
//! (`tenant_id` NULL) and such a row exists live.

use crate::error::BackupError;
use crate::models::backup_entry::BackupScope;
use crate::models::manifest::{
    table_file_name, BackupManifest, TableArtifact, TenantIdentity, MANIFEST_FILE, TENANT_FILE,
};
use crate::services::backup::canonical::digest;
use crate::services::backup::codec;
use crate::services::backup::schema::{self, quote_ident, ColumnKind, ForeignKey, TableSchema, TENANT_COLUMN};
use crate::services::backup::storage::is_safe_name;
use crate::services::backup::TableRows;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

pub fn read_manifest(dir: &Path, backup_id: &str) -> Result<BackupManifest, BackupError> {
    let bytes = match std::fs::read(dir.join(MANIFEST_FILE)) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(BackupError::ManifestMissing(backup_id.to_string()))
        }
        Err(e) => return Err(e.into()),
    };
    serde_json::from_slice(&bytes)
        .map_err(|e| BackupError::Validation(format!("manifest of backup {backup_id} is unreadable: {e}")))
}

/// Recomputes every recorded digest from the bytes on disk.
pub fn verify_artifacts(dir: &Path, manifest: &BackupManifest) -> Result<(), BackupError> {
    for table in &manifest.tables {
        let name = table_file_name(table);
        if !manifest.files.contains_key(&name) {
            return Err(BackupError::Validation(format!(
                "manifest lists table {table} without a digest for {name}"
            )));
        }
        if !manifest.table_counts.contains_key(table) {
            return Err(BackupError::Validation(format!(
                "manifest lists table {table} without a row count"
            )));
        }
    }
    if manifest.scope == BackupScope::Tenant {
        let identity = manifest.files.get(TENANT_FILE).ok_or_else(|| {
            BackupError::Validation(format!("manifest has no digest for {TENANT_FILE}"))
        })?;
        if manifest.checksum.as_deref() != Some(identity.checksum.as_str()) {
            return Err(BackupError::ChecksumMismatch {
                file: TENANT_FILE.to_string(),
            });
        }
    }

    for (name, recorded) in &manifest.files {
        if !is_safe_name(name) || name == MANIFEST_FILE {
            return Err(BackupError::Validation(format!(
                "manifest references invalid artifact name '{name}'"
            )));
        }
        let bytes = match std::fs::read(dir.join(name)) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BackupError::Validation(format!("artifact {name} is missing")))
            }
            Err(e) => return Err(e.into()),
        };
        if digest(&bytes) != *recorded {
            return Err(BackupError::ChecksumMismatch { file: name.clone() });
        }
    }
    Ok(())
}

/// `tenant.json` must name the tenant the entry claims to belong to.
pub fn verify_tenant_identity(dir: &Path, tenant_id: &str) -> Result<TenantIdentity, BackupError> {
    let bytes = std::fs::read(dir.join(TENANT_FILE))?;
    let identity: TenantIdentity = serde_json::from_slice(&bytes)
        .map_err(|e| BackupError::Validation(format!("{TENANT_FILE} is unreadable: {e}")))?;
    if identity.id != tenant_id {
        return Err(BackupError::Validation(format!(
            "backup belongs to tenant {}, not {tenant_id}",
            identity.id
        )));
    }
    Ok(identity)
}

pub fn load_table_rows(dir: &Path, manifest: &BackupManifest) -> Result<TableRows, BackupError> {
    let mut data = TableRows::new();
    for table in &manifest.tables {
        let name = table_file_name(table);
        let bytes = std::fs::read(dir.join(&name))?;
        let artifact: TableArtifact = serde_json::from_slice(&bytes)
            .map_err(|e| BackupError::Validation(format!("{name} is unreadable: {e}")))?;
        if artifact.table != *table {
            return Err(BackupError::Validation(format!(
                "{name} contains rows of table {}",
                artifact.table
            )));
        }
        data.insert(table.clone(), artifact.rows);
    }
    Ok(data)
}

pub fn validate_rows(
    conn: &Connection,
    tenant_id: &str,
    schemas: &[TableSchema],
    data: &TableRows,
) -> Result<(), BackupError> {
    let by_name: HashMap<&str, &TableSchema> = schemas.iter().map(|s| (s.name.as_str(), s)).collect();

    let mut present = Vec::with_capacity(data.len());
    for (table, rows) in data {
        let schema = by_name.get(table.as_str()).ok_or_else(|| {
            BackupError::Validation(format!("table {table} is not a tenant-scoped table"))
        })?;
        check_rows(schema, rows, tenant_id)?;
        check_ownership(conn, tenant_id, schema, rows)?;
        present.push((*schema, rows));
    }

    let keys = KeyContext { conn, tenant_id, data };
    for (schema, rows) in &present {
        for fk in schema.foreign_keys.iter().filter(|fk| !fk.is_composite()) {
            if data.contains_key(&fk.ref_table) {
                check_closure(&keys, schema, rows, fk, by_name[fk.ref_table.as_str()])?;
            }
        }
    }
    for (schema, rows) in &present {
        for fk in schema.foreign_keys.iter().filter(|fk| fk.is_composite()) {
            if data.contains_key(&fk.ref_table) {
                check_closure(&keys, schema, rows, fk, by_name[fk.ref_table.as_str()])?;
            }
        }
    }
    for (schema, rows) in &present {
        for fk in &schema.foreign_keys {
            if !data.contains_key(&fk.ref_table) {
                check_live(conn, tenant_id, schema, rows, fk)?;
            }
        }
    }
    Ok(())
}

fn check_rows(schema: &TableSchema, rows: &[Map<String, Value>], tenant_id: &str) -> Result<(), BackupError> {
    let tenant_column = schema.column(TENANT_COLUMN);
    let target = codec::match_key(tenant_column, Some(&Value::String(tenant_id.to_string())));

    for (index, row) in rows.iter().enumerate() {
        let row_no = index + 1;
        if let Some(unknown) = row.keys().find(|k| schema.column(k).is_none()) {
            return Err(BackupError::invalid_row(
                &schema.name,
                row_no,
                format!("unknown column {unknown}"),
            ));
        }
        if let Some(value) = row.get(TENANT_COLUMN) {
            if codec::match_key(tenant_column, Some(value)) != target {
                return Err(BackupError::invalid_row(
                    &schema.name,
                    row_no,
                    "tenant_id does not match the restore target",
                ));
            }
        }
        for pk in &schema.primary_key {
            // The tenant column is forced on write.
            if pk == TENANT_COLUMN {
                continue;
            }
            if row.get(pk).map_or(true, Value::is_null) {
                return Err(BackupError::invalid_row(
                    &schema.name,
                    row_no,
                    format!("primary key column {pk} is null"),
                ));
            }
        }
    }
    Ok(())
}

/// A restored row must not land on a live row owned by another tenant or by nobody.
fn check_ownership(
    conn: &Connection,
    tenant_id: &str,
    schema: &TableSchema,
    rows: &[Map<String, Value>],
) -> Result<(), BackupError> {
    let Some(tenant_column) = schema.column(TENANT_COLUMN) else {
        return Ok(());
    };
    if rows.is_empty() || schema.primary_key.is_empty() || schema.primary_key.iter().any(|c| c == TENANT_COLUMN) {
        return Ok(());
    }
    let owner = codec::to_sql(tenant_column, &Value::String(tenant_id.to_string()))
        .map_err(BackupError::Validation)?;

    let mut clauses: Vec<String> = schema.primary_key.iter().map(|c| match_clause(schema, c)).collect();
    clauses.push(format!("{} IS NOT ?", column_expr(schema, TENANT_COLUMN)));
    let sql = format!(
        "SELECT 1 FROM {} WHERE {} LIMIT 1",
        quote_ident(&schema.name),
        clauses.join(" AND ")
    );
    let mut stmt = conn.prepare(&sql)?;

    for (index, row) in rows.iter().enumerate() {
        let Some((_, mut params)) = bind_columns(schema, row, &schema.primary_key, tenant_id, index + 1)? else {
            continue;
        };
        params.push(owner.clone());
        let taken = stmt
            .query_row(params_from_iter(params.iter()), |_| Ok(()))
            .optional()?;
        if taken.is_some() {
            return Err(BackupError::invalid_row(
                &schema.name,
                index + 1,
                "primary key belongs to a row of another tenant",
            ));
        }
    }
    Ok(())
}

/// Column reference for lookups; UUID text is compared case-insensitively.
fn column_expr(schema: &TableSchema, column: &str) -> String {
    match schema.column(column) {
        Some(c) if c.kind == ColumnKind::Uuid => format!("lower({})", quote_ident(column)),
        _ => quote_ident(column),
    }
}

fn match_clause(schema: &TableSchema, column: &str) -> String {
    format!("{} = ?", column_expr(schema, column))
}

/// Comparison tuple and bound values for `columns` of one row; `None` when any part is NULL.
fn bind_columns(
    schema: &TableSchema,
    row: &Map<String, Value>,
    columns: &[String],
    tenant_id: &str,
    row_no: usize,
) -> Result<Option<(Vec<String>, Vec<SqlValue>)>, BackupError> {
    let mut tuple = Vec::with_capacity(columns.len());
    let mut params = Vec::with_capacity(columns.len() + 1);
    for column in columns {
        let value = if column == TENANT_COLUMN {
            Value::String(tenant_id.to_string())
        } else {
            row.get(column).cloned().unwrap_or(Value::Null)
        };
        let Some(key) = codec::match_key(schema.column(column), Some(&value)) else {
            return Ok(None);
        };
        let column_schema = schema.column(column).ok_or_else(|| {
            BackupError::Validation(format!("table {} has no column {column}", schema.name))
        })?;
        let bound = codec::to_sql(column_schema, &value)
            .map_err(|reason| BackupError::invalid_row(&schema.name, row_no, reason))?;
        tuple.push(key);
        params.push(bound);
    }
    Ok(Some((tuple, params)))
}

struct KeyContext<'a> {
    conn: &'a Connection,
    tenant_id: &'a str,
    data: &'a TableRows,
}

impl KeyContext<'_> {
    /// Comparison tuple for `columns` of one row; `None` when any part is NULL.
    fn tuple(&self, schema: &TableSchema, row: &Map<String, Value>, columns: &[String]) -> Option<Vec<String>> {
        columns
            .iter()
            .map(|c| {
                if c == TENANT_COLUMN {
                    codec::match_key(schema.column(c), Some(&Value::String(self.tenant_id.to_string())))
                } else {
                    codec::match_key(schema.column(c), row.get(c))
                }
            })
            .collect()
    }
}

/// Parents with a nullable tenant column may hold shared rows that no tenant export contains.
fn allows_shared_parent(fk: &ForeignKey, parent: &TableSchema) -> bool {
    parent.column(TENANT_COLUMN).is_some_and(|c| !c.not_null)
        && !fk.columns.iter().any(|c| c == TENANT_COLUMN)
        && !fk.ref_columns.iter().any(|c| c == TENANT_COLUMN)
}

fn check_closure(
    keys: &KeyContext<'_>,
    schema: &TableSchema,
    rows: &[Map<String, Value>],
    fk: &ForeignKey,
    parent: &TableSchema,
) -> Result<(), BackupError> {
    let parent_rows = keys.data.get(&fk.ref_table).map(Vec::as_slice).unwrap_or_default();
    let known: HashSet<Vec<String>> = parent_rows
        .iter()
        .filter_map(|row| keys.tuple(parent, row, &fk.ref_columns))
        .collect();

    let shared_sql = allows_shared_parent(fk, parent).then(|| {
        let mut clauses: Vec<String> = fk.ref_columns.iter().map(|c| match_clause(parent, c)).collect();
        clauses.push(format!("{} IS NULL", quote_ident(TENANT_COLUMN)));
        format!(
            "SELECT 1 FROM {} WHERE {} LIMIT 1",
            quote_ident(&fk.ref_table),
            clauses.join(" AND ")
        )
    });

    for (index, row) in rows.iter().enumerate() {
        let Some(tuple) = keys.tuple(schema, row, &fk.columns) else {
            continue;
        };
        if known.contains(&tuple) {
            continue;
        }
        if let Some(sql) = &shared_sql {
            if let Some((_, params)) = bind_columns(schema, row, &fk.columns, keys.tenant_id, index + 1)? {
                let shared = keys
                    .conn
                    .prepare_cached(sql)?
                    .query_row(params_from_iter(params.iter()), |_| Ok(()))
                    .optional()?;
                if shared.is_some() {
                    continue;
                }
            }
        }
        return Err(BackupError::invalid_row(
            &schema.name,
            index + 1,
            format!(
                "({}) references a {} row missing from the backup",
                fk.columns.join(", "),
                fk.ref_table
            ),
        ));
    }
    Ok(())
}

fn check_live(
    conn: &Connection,
    tenant_id: &str,
    schema: &TableSchema,
    rows: &[Map<String, Value>],
    fk: &ForeignKey,
) -> Result<(), BackupError> {
    if !schema::table_exists(conn, &fk.ref_table)? {
        return Err(BackupError::Validation(format!(
            "table {} references missing table {}",
            schema.name, fk.ref_table
        )));
    }
    let parent = schema::describe_table(conn, &fk.ref_table)?;
    let scoped = parent.is_tenant_scoped() && !fk.ref_columns.iter().any(|c| c == TENANT_COLUMN);

    // Distinct tuples, remembering the first row that used each.
    let mut pending: BTreeMap<Vec<String>, (usize, Vec<SqlValue>)> = BTreeMap::new();
    for (index, row) in rows.iter().enumerate() {
        if let Some((tuple, params)) = bind_columns(schema, row, &fk.columns, tenant_id, index + 1)? {
            pending.entry(tuple).or_insert((index + 1, params));
        }
    }
    if pending.is_empty() {
        return Ok(());
    }

    let mut clauses: Vec<String> = fk.ref_columns.iter().map(|c| match_clause(&parent, c)).collect();
    let owner = if scoped {
        clauses.push(match_clause(&parent, TENANT_COLUMN));
        let column = parent.column(TENANT_COLUMN).ok_or_else(|| {
            BackupError::Validation(format!("table {} has no column {TENANT_COLUMN}", parent.name))
        })?;
        Some(codec::to_sql(column, &Value::String(tenant_id.to_string())).map_err(BackupError::Validation)?)
    } else {
        None
    };
    let sql = format!(
        "SELECT 1 FROM {} WHERE {} LIMIT 1",
        quote_ident(&fk.ref_table),
        clauses.join(" AND ")
    );
    let mut stmt = conn.prepare(&sql)?;

    for (row_no, mut params) in pending.into_values() {
        if let Some(owner) = &owner {
            params.push(owner.clone());
        }
        let found = stmt
            .query_row(params_from_iter(params.iter()), |_| Ok(()))
            .optional()?;
        if found.is_none() {
            return Err(BackupError::invalid_row(
                &schema.name,
                row_no,
                format!(
                    "({}) references a {} row that does not exist",
                    fk.columns.join(", "),
                    fk.ref_table
                ),
            ));
        }
    }
    Ok(())
}
