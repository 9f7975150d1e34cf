//! Runtime discovery of tenant-scoped tables.
//!
//! Any table with a `tenant_id` column takes part in backup and restore. The list
//! is read from the live SQLite schema once per process and ordered so that
//! referenced tables come before the tables pointing at them.

use rusqlite::Connection;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, OnceLock};

pub const TENANT_COLUMN: &str = "tenant_id";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Uuid,
    DateTime,
    Date,
    Blob,
    Other,
}

impl ColumnKind {
    pub fn from_declared(declared: &str) -> Self {
        let upper = declared.trim().to_ascii_uppercase();
        match upper.as_str() {
            "UUID" | "GUID" => ColumnKind::Uuid,
            "DATE" => ColumnKind::Date,
            "BLOB" => ColumnKind::Blob,
            t if t.starts_with("TIMESTAMP") || t.starts_with("DATETIME") => ColumnKind::DateTime,
            _ => ColumnKind::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub declared_type: String,
    pub kind: ColumnKind,
    pub not_null: bool,
    /// 1-based position inside the primary key, 0 when not part of it.
    pub pk_position: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub columns: Vec<String>,
    pub ref_table: String,
    pub ref_columns: Vec<String>,
}

impl ForeignKey {
    pub fn is_composite(&self) -> bool {
        self.columns.len() > 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    pub name: String,
    pub columns: Vec<Column>,
    pub primary_key: Vec<String>,
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn is_tenant_scoped(&self) -> bool {
        self.column(TENANT_COLUMN).is_some()
    }
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn list_tables(conn: &Connection) -> anyhow::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
    )?;
    let names = stmt.query_map([], |row| row.get::<_, String>(0))?;
    Ok(names.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn table_exists(conn: &Connection, name: &str) -> anyhow::Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?",
        [name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Reads columns, primary key and foreign keys of one table.
pub fn describe_table(conn: &Connection, name: &str) -> anyhow::Result<TableSchema> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(name)))?;
    let columns = stmt
        .query_map([], |row| {
            let declared: Option<String> = row.get(2)?;
            let declared = declared.unwrap_or_default();
            Ok(Column {
                name: row.get(1)?,
                kind: ColumnKind::from_declared(&declared),
                declared_type: declared,
                not_null: row.get::<_, i64>(3)? != 0,
                pk_position: row.get::<_, i64>(5)?.max(0) as usize,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    if columns.is_empty() {
        anyhow::bail!("Table {name} does not exist");
    }

    let mut pk: Vec<&Column> = columns.iter().filter(|c| c.pk_position > 0).collect();
    pk.sort_by_key(|c| c.pk_position);
    let primary_key = pk.into_iter().map(|c| c.name.clone()).collect();

    let foreign_keys = read_foreign_keys(conn, name)?;

    Ok(TableSchema {
        name: name.to_string(),
        columns,
        primary_key,
        foreign_keys,
    })
}

fn read_foreign_keys(conn: &Connection, table: &str) -> anyhow::Result<Vec<ForeignKey>> {
    let mut stmt = conn.prepare(&format!("PRAGMA foreign_key_list({})", quote_ident(table)))?;
    // (id, seq, ref_table, from, to)
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut grouped: BTreeMap<i64, Vec<(i64, String, String, Option<String>)>> = BTreeMap::new();
    for (id, seq, ref_table, from, to) in rows {
        grouped.entry(id).or_default().push((seq, ref_table, from, to));
    }

    let mut foreign_keys = Vec::with_capacity(grouped.len());
    for (_, mut parts) in grouped {
        parts.sort_by_key(|p| p.0);
        let ref_table = parts[0].1.clone();
        let columns: Vec<String> = parts.iter().map(|p| p.2.clone()).collect();

        // `REFERENCES parent` without a column list points at the parent's primary key.
        let ref_columns = if parts.iter().all(|p| p.3.is_some()) {
            parts.iter().filter_map(|p| p.3.clone()).collect()
        } else {
            let parent = describe_primary_key(conn, &ref_table)?;
            if parent.len() != columns.len() {
                anyhow::bail!(
                    "Foreign key on {table}({}) does not match primary key of {ref_table}",
                    columns.join(", ")
                );
            }
            parent
        };

        foreign_keys.push(ForeignKey {
            columns,
            ref_table,
            ref_columns,
        });
    }
    Ok(foreign_keys)
}

fn describe_primary_key(conn: &Connection, table: &str) -> anyhow::Result<Vec<String>> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", quote_ident(table)))?;
    let mut pk = stmt
        .query_map([], |row| Ok((row.get::<_, i64>(5)?, row.get::<_, String>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    pk.retain(|(pos, _)| *pos > 0);
    pk.sort_by_key(|(pos, _)| *pos);
    Ok(pk.into_iter().map(|(_, name)| name).collect())
}

/// Every table carrying a tenant column, parents before children, ties by name.
pub fn discover_tenant_tables(conn: &Connection) -> anyhow::Result<Vec<TableSchema>> {
    let mut tables = Vec::new();
    for name in list_tables(conn)? {
        let schema = describe_table(conn, &name)?;
        if schema.is_tenant_scoped() {
            tables.push(schema);
        }
    }
    Ok(order_by_dependencies(tables))
}

fn order_by_dependencies(tables: Vec<TableSchema>) -> Vec<TableSchema> {
    let names: BTreeSet<&str> = tables.iter().map(|t| t.name.as_str()).collect();
    let mut pending: BTreeMap<String, BTreeSet<String>> = tables
        .iter()
        .map(|t| {
            let deps = t
                .foreign_keys
                .iter()
                .map(|fk| fk.ref_table.clone())
                .filter(|r| r != &t.name && names.contains(r.as_str()))
                .collect();
            (t.name.clone(), deps)
        })
        .collect();

    let mut order = Vec::with_capacity(pending.len());
    while !pending.is_empty() {
        // A cycle leaves no table without dependencies; break it at the smallest name.
        let next = pending
            .iter()
            .find(|(_, deps)| deps.is_empty())
            .or_else(|| pending.iter().next())
            .map(|(name, _)| name.clone());
        let Some(next) = next else { break };
        pending.remove(&next);
        for deps in pending.values_mut() {
            deps.remove(&next);
        }
        order.push(next);
    }

    let mut by_name: HashMap<String, TableSchema> =
        tables.into_iter().map(|t| (t.name.clone(), t)).collect();
    order.into_iter().filter_map(|name| by_name.remove(&name)).collect()
}

/// Process-lifetime cache of the discovered tenant tables.
#[derive(Debug, Default)]
pub struct TableRegistry {
    tables: OnceLock<Arc<Vec<TableSchema>>>,
}

impl TableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tenant_tables(&self, conn: &Connection) -> anyhow::Result<Arc<Vec<TableSchema>>> {
        if let Some(tables) = self.tables.get() {
            return Ok(tables.clone());
        }
        let discovered = Arc::new(discover_tenant_tables(conn)?);
        tracing::info!(
            tables = ?discovered.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            "Discovered tenant-scoped tables"
        );
        Ok(self.tables.get_or_init(|| discovered).clone())
    }
}
