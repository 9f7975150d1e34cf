//! Writes validated table rows back for one tenant.

use crate::error::BackupError;
use crate::services::backup::codec;
use crate::services::backup::schema::{quote_ident, ColumnKind, TableSchema, TENANT_COLUMN};
use crate::services::backup::TableRows;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, ErrorCode};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RestoreSummary {
    pub tables: usize,
    pub rows: usize,
    pub table_rows: BTreeMap<String, usize>,
}

struct TablePlan<'a> {
    schema: &'a TableSchema,
    columns: Vec<String>,
    rows: Vec<Vec<SqlValue>>,
    /// Conflicting rows are only updated when they already belong to the tenant.
    owner_guard: bool,
}

/// Upserts every row in one transaction. All coercion happens before the first write.
pub fn restore_tenant_tables(
    conn: &mut Connection,
    tenant_id: &str,
    schemas: &[TableSchema],
    data: &TableRows,
    expected_counts: Option<&BTreeMap<String, usize>>,
) -> Result<RestoreSummary, BackupError> {
    if let Some(expected) = expected_counts {
        check_counts(expected, data)?;
    }
    if let Some(unknown) = data.keys().find(|t| !schemas.iter().any(|s| &s.name == *t)) {
        return Err(BackupError::Validation(format!(
            "table {unknown} is not a tenant-scoped table"
        )));
    }

    let mut plans = Vec::with_capacity(data.len());
    for schema in schemas {
        let Some(rows) = data.get(&schema.name) else {
            tracing::warn!(table = %schema.name, tenant_id, "Table missing from backup, leaving it untouched");
            continue;
        };
        plans.push(plan_table(schema, rows, tenant_id)?);
    }

    let tx = conn.transaction()?;
    tx.execute_batch("PRAGMA defer_foreign_keys = ON")?;

    let mut summary = RestoreSummary::default();
    for plan in &plans {
        if !plan.rows.is_empty() {
            let mut stmt = tx.prepare(&upsert_sql(plan))?;
            for (index, values) in plan.rows.iter().enumerate() {
                let changed = stmt
                    .execute(params_from_iter(values.iter()))
                    .map_err(|e| constraint_error(&plan.schema.name, e))?;
                if changed == 0 && plan.owner_guard {
                    return Err(BackupError::invalid_row(
                        &plan.schema.name,
                        index + 1,
                        "primary key belongs to a row of another tenant",
                    ));
                }
            }
        }
        summary.tables += 1;
        summary.rows += plan.rows.len();
        summary.table_rows.insert(plan.schema.name.clone(), plan.rows.len());
    }
    tx.commit().map_err(|e| constraint_error("restore", e))?;

    tracing::info!(tenant_id, tables = summary.tables, rows = summary.rows, "Restored tenant tables");
    Ok(summary)
}

fn check_counts(expected: &BTreeMap<String, usize>, data: &TableRows) -> Result<(), BackupError> {
    for (table, count) in expected {
        let actual = data.get(table).map_or(0, Vec::len);
        if actual != *count {
            return Err(BackupError::Validation(format!(
                "table {table} has {actual} rows, manifest records {count}"
            )));
        }
    }
    if let Some(extra) = data.keys().find(|t| !expected.contains_key(*t)) {
        return Err(BackupError::Validation(format!(
            "table {extra} is not recorded in the manifest"
        )));
    }
    Ok(())
}

fn plan_table<'a>(
    schema: &'a TableSchema,
    rows: &[serde_json::Map<String, Value>],
    tenant_id: &str,
) -> Result<TablePlan<'a>, BackupError> {
    if schema.primary_key.is_empty() {
        return Err(BackupError::Validation(format!(
            "table {} has no primary key and cannot be restored idempotently",
            schema.name
        )));
    }

    // Columns the backup carries, in schema order; the tenant column always.
    let columns: Vec<String> = schema
        .columns
        .iter()
        .filter(|c| c.name == TENANT_COLUMN || rows.iter().any(|r| r.contains_key(&c.name)))
        .map(|c| c.name.clone())
        .collect();

    let mut coerced = Vec::with_capacity(rows.len());
    for (index, row) in rows.iter().enumerate() {
        let mut values = Vec::with_capacity(columns.len());
        for name in &columns {
            let column = schema
                .column(name)
                .ok_or_else(|| BackupError::invalid_row(&schema.name, index + 1, format!("unknown column {name}")))?;
            let value = if name == TENANT_COLUMN {
                SqlValue::Text(tenant_id.to_string())
            } else {
                let raw = row.get(name).ok_or_else(|| {
                    BackupError::invalid_row(&schema.name, index + 1, format!("missing column {name}"))
                })?;
                codec::to_sql(column, raw)
                    .map_err(|reason| BackupError::invalid_row(&schema.name, index + 1, reason))?
            };
            values.push(value);
        }
        coerced.push(values);
    }

    let owner_guard =
        schema.column(TENANT_COLUMN).is_some() && !schema.primary_key.iter().any(|c| c == TENANT_COLUMN);
    Ok(TablePlan {
        schema,
        columns,
        rows: coerced,
        owner_guard,
    })
}

fn upsert_sql(plan: &TablePlan<'_>) -> String {
    let columns = plan
        .columns
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let placeholders = vec!["?"; plan.columns.len()].join(", ");
    let key = plan
        .schema
        .primary_key
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    let updates: Vec<String> = plan
        .columns
        .iter()
        .filter(|c| !plan.schema.primary_key.contains(c))
        .map(|c| format!("{0} = excluded.{0}", quote_ident(c)))
        .collect();
    let action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else if plan.owner_guard {
        let tenant = quote_ident(TENANT_COLUMN);
        let (current, incoming) = match plan.schema.column(TENANT_COLUMN).map(|c| c.kind) {
            Some(ColumnKind::Uuid) => (format!("lower({tenant})"), format!("lower(excluded.{tenant})")),
            _ => (tenant.clone(), format!("excluded.{tenant}")),
        };
        format!("DO UPDATE SET {} WHERE {current} = {incoming}", updates.join(", "))
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };
    format!(
        "INSERT INTO {} ({columns}) VALUES ({placeholders}) ON CONFLICT({key}) {action}",
        quote_ident(&plan.schema.name)
    )
}

fn constraint_error(table: &str, err: rusqlite::Error) -> BackupError {
    if err.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) {
        BackupError::Validation(format!("{table}: {err}"))
    } else {
        BackupError::Database(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::backup::exporter::export_tenant;
    use crate::services::backup::schema::discover_tenant_tables;
    use crate::test_support::{seed_warehouse, table_fingerprint, wipe_tenant, TestEnv};
    use serde_json::json;

    fn snapshot_rows(conn: &Connection, schemas: &[TableSchema], tenant: &crate::models::tenant::Tenant) -> TableRows {
        export_tenant(conn, schemas, tenant)
            .unwrap()
            .tables
            .into_iter()
            .map(|t| (t.table, t.rows))
            .collect()
    }

    fn counts(data: &TableRows) -> BTreeMap<String, usize> {
        data.iter().map(|(t, rows)| (t.clone(), rows.len())).collect()
    }

    #[test]
    fn test_round_trip_after_wipe() {
        let env = TestEnv::new();
        let mut conn = env.pool.get().unwrap();
        let tenant = seed_warehouse(&conn, "alpha");
        seed_warehouse(&conn, "beta");
        let schemas = discover_tenant_tables(&conn).unwrap();
        let before = table_fingerprint(&conn, &schemas);
        let data = snapshot_rows(&conn, &schemas, &tenant);

        wipe_tenant(&conn, &schemas, &tenant.id);
        assert_ne!(table_fingerprint(&conn, &schemas), before);

        let summary = restore_tenant_tables(&mut conn, &tenant.id, &schemas, &data, Some(&counts(&data))).unwrap();
        assert_eq!(summary.tables, schemas.len());
        assert_eq!(summary.rows, data.values().map(Vec::len).sum::<usize>());
        assert_eq!(table_fingerprint(&conn, &schemas), before);
    }

    #[test]
    fn test_restore_is_idempotent_and_overwrites_changes() {
        let env = TestEnv::new();
        let mut conn = env.pool.get().unwrap();
        let tenant = seed_warehouse(&conn, "alpha");
        let schemas = discover_tenant_tables(&conn).unwrap();
        let data = snapshot_rows(&conn, &schemas, &tenant);
        let original = table_fingerprint(&conn, &schemas);

        conn.execute("UPDATE items SET quantity = 999 WHERE tenant_id = ?", [&tenant.id]).unwrap();

        restore_tenant_tables(&mut conn, &tenant.id, &schemas, &data, None).unwrap();
        let once = table_fingerprint(&conn, &schemas);
        restore_tenant_tables(&mut conn, &tenant.id, &schemas, &data, None).unwrap();
        let twice = table_fingerprint(&conn, &schemas);

        assert_eq!(once, original);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_count_mismatch_aborts_before_writing() {
        let env = TestEnv::new();
        let mut conn = env.pool.get().unwrap();
        let tenant = seed_warehouse(&conn, "alpha");
        let schemas = discover_tenant_tables(&conn).unwrap();
        let data = snapshot_rows(&conn, &schemas, &tenant);
        let mut expected = counts(&data);
        *expected.get_mut("items").unwrap() += 1;

        wipe_tenant(&conn, &schemas, &tenant.id);
        let wiped = table_fingerprint(&conn, &schemas);

        let err = restore_tenant_tables(&mut conn, &tenant.id, &schemas, &data, Some(&expected)).unwrap_err();
        assert!(err.is_validation());
        assert!(err.to_string().contains("table items"));
        assert_eq!(table_fingerprint(&conn, &schemas), wiped);
    }

    #[test]
    fn test_bad_value_in_late_table_writes_nothing() {
        let env = TestEnv::new();
        let mut conn = env.pool.get().unwrap();
        let tenant = seed_warehouse(&conn, "alpha");
        let schemas = discover_tenant_tables(&conn).unwrap();
        let mut data = snapshot_rows(&conn, &schemas, &tenant);
        data.get_mut("tenant_settings").unwrap()[0]["updated_at"] = json!("not a date");

        wipe_tenant(&conn, &schemas, &tenant.id);
        let wiped = table_fingerprint(&conn, &schemas);

        let err = restore_tenant_tables(&mut conn, &tenant.id, &schemas, &data, None).unwrap_err();
        assert!(matches!(err, BackupError::InvalidRow { ref table, row: 1, .. } if table == "tenant_settings"));
        assert_eq!(table_fingerprint(&conn, &schemas), wiped);
    }

    #[test]
    fn test_tenant_column_is_forced() {
        let env = TestEnv::new();
        let mut conn = env.pool.get().unwrap();
        let tenant = seed_warehouse(&conn, "alpha");
        let schemas = discover_tenant_tables(&conn).unwrap();
        let mut data = snapshot_rows(&conn, &schemas, &tenant);
        for rows in data.values_mut() {
            for row in rows.iter_mut() {
                row.remove("tenant_id");
            }
        }
        wipe_tenant(&conn, &schemas, &tenant.id);

        restore_tenant_tables(&mut conn, &tenant.id, &schemas, &data, None).unwrap();
        let owned: i64 = conn
            .query_row("SELECT COUNT(*) FROM items WHERE tenant_id = ?", [&tenant.id], |r| r.get(0))
            .unwrap();
        assert_eq!(owned as usize, data["items"].len());
    }

    #[test]
    fn test_upsert_sql_shapes() {
        let env = TestEnv::new();
        let conn = env.pool.get().unwrap();
        let schemas = discover_tenant_tables(&conn).unwrap();
        let settings = schemas.iter().find(|s| s.name == "tenant_settings").unwrap();
        let plan = TablePlan {
            schema: settings,
            columns: vec!["tenant_id".into(), "key".into()],
            rows: vec![],
            owner_guard: false,
        };
        assert!(upsert_sql(&plan).ends_with("ON CONFLICT(\"tenant_id\", \"key\") DO NOTHING"));

        let items = schemas.iter().find(|s| s.name == "items").unwrap();
        let plan = plan_table(items, &[], "t1").unwrap();
        assert!(plan.owner_guard);
        assert!(upsert_sql(&plan).ends_with("WHERE lower(\"tenant_id\") = lower(excluded.\"tenant_id\")"));
    }

    #[test]
    fn test_row_of_another_tenant_is_never_taken_over() {
        let env = TestEnv::new();
        let mut conn = env.pool.get().unwrap();
        let alpha = seed_warehouse(&conn, "alpha");
        let beta = seed_warehouse(&conn, "beta");
        let schemas = discover_tenant_tables(&conn).unwrap();
        let mut data = snapshot_rows(&conn, &schemas, &alpha);
        let foreign_item: String = conn
            .query_row("SELECT id FROM items WHERE tenant_id = ? AND sku = 'GLU-1'", [&beta.id], |r| r.get(0))
            .unwrap();
        let mut stolen = data["items"][1].clone();
        stolen["id"] = json!(foreign_item);
        stolen["sku"] = json!("GLU-2");
        data.get_mut("items").unwrap().push(stolen);
        let before = table_fingerprint(&conn, &schemas);

        let err = restore_tenant_tables(&mut conn, &alpha.id, &schemas, &data, None).unwrap_err();
        assert!(matches!(err, BackupError::InvalidRow { ref table, row: 3, .. } if table == "items"), "{err}");
        assert_eq!(table_fingerprint(&conn, &schemas), before);
        let owner: String = conn
            .query_row("SELECT tenant_id FROM items WHERE id = ?", [&foreign_item], |r| r.get(0))
            .unwrap();
        assert_eq!(owner, beta.id);
    }
}
