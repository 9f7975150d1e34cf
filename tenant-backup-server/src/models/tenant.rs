use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Read model of a tenant. Owned by the main data model; this service only reads it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tenant {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub is_active: bool,
}

fn row_to_tenant(row: &Row) -> rusqlite::Result<Tenant> {
    Ok(Tenant {
        id: row.get("id")?,
        slug: row.get("slug")?,
        name: row.get("name")?,
        is_active: row.get::<_, i64>("is_active")? != 0,
    })
}

pub fn find_all(conn: &Connection) -> anyhow::Result<Vec<Tenant>> {
    let mut stmt = conn.prepare("SELECT id, slug, name, is_active FROM tenants ORDER BY slug ASC")?;
    let rows = stmt.query_map([], row_to_tenant)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn find_by_id(conn: &Connection, id: &str) -> anyhow::Result<Option<Tenant>> {
    let tenant = conn
        .query_row(
            "SELECT id, slug, name, is_active FROM tenants WHERE id = ?",
            params![id],
            row_to_tenant,
        )
        .optional()?;
    Ok(tenant)
}

pub fn create(conn: &Connection, slug: &str, name: &str) -> anyhow::Result<Tenant> {
    let id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO tenants (id, slug, name) VALUES (?1, ?2, ?3)",
        params![id, slug, name],
    )?;
    find_by_id(conn, &id)?.ok_or_else(|| anyhow::anyhow!("Failed to retrieve created tenant"))
}
