//! Fixtures shared by the unit tests.

use crate::config::{AppConfig, BackupConfig, RetentionPolicy, ScheduleMode, DEFAULT_SCHEDULE_LOCK_KEY};
use crate::db::connection::{create_pool, DbPool};
use crate::db::migrate::migrate;
use crate::models::manifest::{BackupManifest, MANIFEST_FILE, TENANT_FILE};
use crate::models::tenant::{self, Tenant};
use crate::services::backup::canonical::{digest, to_canonical_bytes};
use crate::services::backup::jobs::{SnapshotExporter, TenantExporter};
use crate::services::backup::schema::{quote_ident, TableSchema, TENANT_COLUMN};
use crate::state::AppState;
use rusqlite::{params, Connection};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use uuid::Uuid;

pub const ADMIN_KEY: &str = "test-admin-key";

const CREATED_AT: &str = "2024-05-01T08:00:00Z";

pub struct TestEnv {
    pub pool: DbPool,
    tmp: TempDir,
}

impl TestEnv {
    pub fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let pool = create_pool(&tmp.path().join("warehouse.db")).unwrap();
        migrate(&pool).unwrap();
        Self { pool, tmp }
    }

    pub fn storage_root(&self) -> PathBuf {
        self.tmp.path().join("backups")
    }

    pub fn config(&self) -> AppConfig {
        AppConfig {
            port: 0,
            db_path: self.tmp.path().join("warehouse.db"),
            admin_api_key: ADMIN_KEY.to_string(),
            backup: BackupConfig {
                storage_driver: "local".into(),
                storage_path: self.storage_root(),
                retention: RetentionPolicy::default(),
                max_retries: 2,
                retry_delay: Duration::ZERO,
                schedule_enabled: false,
                schedule_interval: Duration::from_secs(3600),
                schedule_mode: ScheduleMode::App,
                schedule_lock_key: DEFAULT_SCHEDULE_LOCK_KEY,
                advisory_lock: true,
            },
        }
    }

    pub fn state(&self) -> Arc<AppState> {
        self.state_with(|_| {})
    }

    pub fn state_with(&self, adjust: impl FnOnce(&mut AppConfig)) -> Arc<AppState> {
        let mut config = self.config();
        adjust(&mut config);
        Arc::new(AppState::with_exporter(self.pool.clone(), config, Arc::new(SnapshotExporter)).unwrap())
    }

    pub fn state_with_exporter(&self, exporter: Arc<dyn TenantExporter>) -> Arc<AppState> {
        Arc::new(AppState::with_exporter(self.pool.clone(), self.config(), exporter).unwrap())
    }
}

/// Creates a tenant and a small warehouse for it.
pub fn seed_warehouse(conn: &Connection, slug: &str) -> Tenant {
    let tenant = tenant::create(conn, slug, &format!("Tenant {slug}")).unwrap();
    seed_rows(conn, &tenant.id, slug);
    tenant
}

/// Rows in every tenant table: two categories and items, one movement, one order with a line, two settings.
pub fn seed_rows(conn: &Connection, tenant_id: &str, tag: &str) {
    let id = || Uuid::new_v4().to_string();
    let (tools, supplies) = (id(), id());
    for (category, name) in [(&tools, "Tools"), (&supplies, "Supplies")] {
        conn.execute(
            "INSERT INTO categories (id, tenant_id, name) VALUES (?1, ?2, ?3)",
            params![category, tenant_id, name],
        )
        .unwrap();
    }

    let (hammer, glue) = (id(), id());
    let items = [
        (&hammer, "HAM-1", "Hammer", &tools, "pcs", 12),
        (&glue, "GLU-1", "Glue", &supplies, "kg", 3),
    ];
    for (item, sku, name, category, unit, qty) in items {
        conn.execute(
            "INSERT INTO items (id, tenant_id, sku, barcode, name, category_id, quantity, min_stock, unit)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8)",
            params![item, tenant_id, sku, format!("{tag}-{sku}"), name, category, qty, unit],
        )
        .unwrap();
    }

    conn.execute(
        "INSERT INTO inventory_movements (id, tenant_id, item_id, client_tx_id, type, barcode, qty, created_at)
         VALUES (?1, ?2, ?3, 'tx-1', 'IN', ?4, 5, ?5)",
        params![id(), tenant_id, hammer, format!("{tag}-HAM-1"), CREATED_AT],
    )
    .unwrap();

    let order = id();
    conn.execute(
        "INSERT INTO inventory_orders (id, tenant_id, number, expected_on, created_at)
         VALUES (?1, ?2, 'PO-1', '2024-06-01', ?3)",
        params![order, tenant_id, CREATED_AT],
    )
    .unwrap();
    conn.execute(
        "INSERT INTO inventory_order_items (id, tenant_id, order_id, item_id, quantity, created_at)
         VALUES (?1, ?2, ?3, ?4, 3, ?5)",
        params![id(), tenant_id, order, glue, CREATED_AT],
    )
    .unwrap();

    for (key, value) in [("currency", "EUR"), ("locale", "de")] {
        conn.execute(
            "INSERT INTO tenant_settings (tenant_id, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![tenant_id, key, value, CREATED_AT],
        )
        .unwrap();
    }
}

/// Deletes a tenant's rows from every tenant table, children first.
pub fn wipe_tenant(conn: &Connection, schemas: &[TableSchema], tenant_id: &str) {
    for schema in schemas.iter().rev() {
        conn.execute(
            &format!(
                "DELETE FROM {} WHERE {} = ?",
                quote_ident(&schema.name),
                quote_ident(TENANT_COLUMN)
            ),
            [tenant_id],
        )
        .unwrap();
    }
}

/// Every row of every tenant table, order-independent.
pub fn table_fingerprint(conn: &Connection, schemas: &[TableSchema]) -> BTreeMap<String, Vec<String>> {
    let mut out = BTreeMap::new();
    for schema in schemas {
        let mut stmt = conn
            .prepare(&format!("SELECT * FROM {}", quote_ident(&schema.name)))
            .unwrap();
        let width = stmt.column_count();
        let mut rows: Vec<String> = stmt
            .query_map([], |row| {
                let values = (0..width)
                    .map(|i| format!("{:?}", row.get_ref(i).map(|v| v.to_owned())))
                    .collect::<Vec<_>>();
                Ok(values.join("|"))
            })
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();
        rows.sort();
        out.insert(schema.name.clone(), rows);
    }
    out
}

/// Rewrites one artifact and updates its digest in `meta.json`, so only row checks can catch the edit.
pub fn resign_artifact(dir: &Path, name: &str, edit: impl FnOnce(&mut Value)) {
    let path = dir.join(name);
    let mut value: Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    edit(&mut value);
    let bytes = to_canonical_bytes(&value).unwrap();
    std::fs::write(&path, &bytes).unwrap();

    let meta_path = dir.join(MANIFEST_FILE);
    let mut manifest: BackupManifest = serde_json::from_slice(&std::fs::read(&meta_path).unwrap()).unwrap();
    let recorded = digest(&bytes);
    if name == TENANT_FILE {
        manifest.checksum = Some(recorded.checksum.clone());
    }
    manifest.files.insert(name.to_string(), recorded);
    std::fs::write(&meta_path, serde_json::to_vec_pretty(&manifest).unwrap()).unwrap();
}
