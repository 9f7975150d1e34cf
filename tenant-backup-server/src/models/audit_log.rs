use chrono::{DateTime, Utc};
use rusqlite::{params_from_iter, Connection, Row};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const ENTITY_BACKUP: &str = "backup";

pub const ACTION_BACKUP_CREATE: &str = "backup.create";
pub const ACTION_BACKUP_RESTORE: &str = "backup.restore";
pub const ACTION_BACKUP_JOB_ENQUEUE: &str = "backup.job.enqueue";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub actor: String,
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub payload: serde_json::Value,
    pub created_at: String,
}

#[derive(Debug, Default, Clone, Deserialize)]
pub struct AuditFilter {
    pub actor: Option<String>,
    pub action: Option<String>,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

fn row_to_entry(row: &Row) -> rusqlite::Result<AuditEntry> {
    let payload: String = row.get("payload")?;
    Ok(AuditEntry {
        id: row.get("id")?,
        actor: row.get("actor")?,
        action: row.get("action")?,
        entity_type: row.get("entity_type")?,
        entity_id: row.get("entity_id")?,
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        created_at: row.get("created_at")?,
    })
}

/// Inserts one audit row. The payload must not carry tenant data, only identifiers and counts.
pub fn write(
    conn: &Connection,
    actor: &str,
    action: &str,
    entity_type: &str,
    entity_id: &str,
    payload: &serde_json::Value,
) -> anyhow::Result<AuditEntry> {
    let entry = AuditEntry {
        id: Uuid::new_v4().to_string(),
        actor: actor.to_string(),
        action: action.to_string(),
        entity_type: entity_type.to_string(),
        entity_id: entity_id.to_string(),
        payload: payload.clone(),
        created_at: Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
    };
    conn.execute(
        "INSERT INTO admin_audit_log (id, actor, action, entity_type, entity_id, payload, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        rusqlite::params![
            entry.id,
            entry.actor,
            entry.action,
            entry.entity_type,
            entry.entity_id,
            serde_json::to_string(&entry.payload)?,
            entry.created_at,
        ],
    )?;
    Ok(entry)
}

pub fn find(conn: &Connection, filter: &AuditFilter) -> anyhow::Result<Vec<AuditEntry>> {
    let mut clauses: Vec<&str> = Vec::new();
    let mut values: Vec<String> = Vec::new();

    let equals = [
        ("actor = ?", &filter.actor),
        ("action = ?", &filter.action),
        ("entity_type = ?", &filter.entity_type),
        ("entity_id = ?", &filter.entity_id),
    ];
    for (clause, value) in equals {
        if let Some(v) = value {
            clauses.push(clause);
            values.push(v.clone());
        }
    }
    // Timestamps are stored as fixed-width UTC RFC 3339, so text comparison orders correctly.
    if let Some(from) = filter.created_from {
        clauses.push("created_at >= ?");
        values.push(from.to_rfc3339_opts(chrono::SecondsFormat::Micros, true));
    }
    if let Some(to) = filter.created_to {
        clauses.push("created_at <= ?");
        values.push(to.to_rfc3339_opts(chrono::SecondsFormat::Micros, true));
    }

    let limit = filter.limit.unwrap_or(100).clamp(1, 500);
    let offset = filter.offset.unwrap_or(0).max(0);

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    let sql = format!(
        "SELECT * FROM admin_audit_log {where_sql} ORDER BY created_at DESC, rowid DESC LIMIT {limit} OFFSET {offset}"
    );

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map(params_from_iter(values.iter()), row_to_entry)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestEnv;
    use serde_json::json;

    #[test]
    fn test_write_and_filter() {
        let env = TestEnv::new();
        let conn = env.pool.get().unwrap();

        write(&conn, "alice", ACTION_BACKUP_CREATE, ENTITY_BACKUP, "b1", &json!({"scope": "tenant"})).unwrap();
        write(&conn, "bob", ACTION_BACKUP_RESTORE, ENTITY_BACKUP, "b1", &json!({})).unwrap();
        write(&conn, "bob", "tenant.update", "tenant", "t1", &json!({})).unwrap();

        let backups = find(&conn, &AuditFilter {
            entity_type: Some(ENTITY_BACKUP.into()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(backups.len(), 2);
        // Newest first
        assert_eq!(backups[0].action, ACTION_BACKUP_RESTORE);

        let creates = find(&conn, &AuditFilter {
            entity_type: Some(ENTITY_BACKUP.into()),
            action: Some(ACTION_BACKUP_CREATE.into()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(creates.len(), 1);
        assert_eq!(creates[0].payload["scope"], "tenant");

        let future = find(&conn, &AuditFilter {
            created_from: Some(Utc::now() + chrono::Duration::hours(1)),
            ..Default::default()
        })
        .unwrap();
        assert!(future.is_empty());

        let paged = find(&conn, &AuditFilter { limit: Some(1), offset: Some(1), ..Default::default() }).unwrap();
        assert_eq!(paged.len(), 1);
    }
}
