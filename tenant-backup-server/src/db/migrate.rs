use crate::db::connection::DbPool;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS tenants (
  id UUID PRIMARY KEY,
  slug TEXT NOT NULL UNIQUE,
  name TEXT NOT NULL,
  is_active INTEGER NOT NULL DEFAULT 1,
  created_at TIMESTAMP NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%SZ', 'now'))
);

CREATE TABLE IF NOT EXISTS item_units (
  code TEXT PRIMARY KEY,
  label TEXT NOT NULL,
  is_active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS categories (
  id UUID PRIMARY KEY,
  tenant_id UUID REFERENCES tenants(id) ON DELETE RESTRICT,
  name TEXT NOT NULL,
  is_system INTEGER NOT NULL DEFAULT 0,
  is_active INTEGER NOT NULL DEFAULT 1,
  UNIQUE (tenant_id, name)
);

CREATE TABLE IF NOT EXISTS items (
  id UUID PRIMARY KEY,
  tenant_id UUID REFERENCES tenants(id) ON DELETE RESTRICT,
  sku TEXT NOT NULL,
  barcode TEXT NOT NULL DEFAULT '',
  name TEXT NOT NULL,
  description TEXT NOT NULL DEFAULT '',
  category_id UUID REFERENCES categories(id) ON DELETE SET NULL,
  quantity INTEGER NOT NULL DEFAULT 0,
  min_stock INTEGER NOT NULL DEFAULT 0,
  max_stock INTEGER NOT NULL DEFAULT 0,
  target_stock INTEGER NOT NULL DEFAULT 0,
  recommended_stock INTEGER NOT NULL DEFAULT 0,
  order_mode INTEGER NOT NULL DEFAULT 0,
  unit TEXT NOT NULL DEFAULT 'pcs' REFERENCES item_units(code),
  is_active INTEGER NOT NULL DEFAULT 1,
  is_admin_created INTEGER NOT NULL DEFAULT 0,
  UNIQUE (tenant_id, sku)
);

CREATE TABLE IF NOT EXISTS inventory_movements (
  id UUID PRIMARY KEY,
  tenant_id UUID NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
  item_id UUID NOT NULL REFERENCES items(id) ON DELETE CASCADE,
  client_tx_id TEXT NOT NULL,
  type TEXT NOT NULL CHECK(type IN ('IN','OUT')),
  barcode TEXT NOT NULL,
  qty INTEGER NOT NULL,
  note TEXT,
  created_at TIMESTAMP NOT NULL,
  UNIQUE (tenant_id, client_tx_id)
);

CREATE TABLE IF NOT EXISTS inventory_orders (
  id UUID PRIMARY KEY,
  tenant_id UUID NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
  number TEXT NOT NULL,
  status TEXT NOT NULL DEFAULT 'OPEN',
  note TEXT,
  expected_on DATE,
  created_at TIMESTAMP NOT NULL,
  completed_at TIMESTAMP,
  canceled_at TIMESTAMP,
  UNIQUE (tenant_id, number),
  UNIQUE (tenant_id, id)
);

CREATE TABLE IF NOT EXISTS inventory_order_items (
  id UUID PRIMARY KEY,
  tenant_id UUID NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
  order_id UUID NOT NULL,
  item_id UUID NOT NULL REFERENCES items(id) ON DELETE CASCADE,
  quantity INTEGER NOT NULL,
  note TEXT,
  created_at TIMESTAMP NOT NULL,
  UNIQUE (tenant_id, order_id, item_id),
  FOREIGN KEY (tenant_id, order_id) REFERENCES inventory_orders(tenant_id, id) ON DELETE CASCADE
);

CREATE TABLE IF NOT EXISTS tenant_settings (
  tenant_id UUID NOT NULL REFERENCES tenants(id) ON DELETE CASCADE,
  key TEXT NOT NULL,
  value TEXT NOT NULL,
  updated_at TIMESTAMP NOT NULL,
  PRIMARY KEY (tenant_id, key)
);

CREATE TABLE IF NOT EXISTS admin_audit_log (
  id UUID PRIMARY KEY,
  actor TEXT NOT NULL,
  action TEXT NOT NULL,
  entity_type TEXT NOT NULL,
  entity_id TEXT NOT NULL,
  payload TEXT NOT NULL DEFAULT '{}',
  created_at TIMESTAMP NOT NULL
);

CREATE TABLE IF NOT EXISTS advisory_locks (
  key INTEGER PRIMARY KEY,
  holder TEXT NOT NULL,
  acquired_at TIMESTAMP NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_categories_tenant ON categories(tenant_id);
CREATE INDEX IF NOT EXISTS idx_items_tenant ON items(tenant_id);
CREATE INDEX IF NOT EXISTS idx_items_category ON items(category_id);
CREATE INDEX IF NOT EXISTS idx_movements_tenant ON inventory_movements(tenant_id);
CREATE INDEX IF NOT EXISTS idx_movements_item ON inventory_movements(item_id);
CREATE INDEX IF NOT EXISTS idx_orders_tenant ON inventory_orders(tenant_id);
CREATE INDEX IF NOT EXISTS idx_order_items_order ON inventory_order_items(tenant_id, order_id);
CREATE INDEX IF NOT EXISTS idx_audit_entity ON admin_audit_log(entity_type, created_at DESC);
"#;

const DEFAULT_UNITS: &[(&str, &str)] = &[("pcs", "Pieces"), ("kg", "Kilogram"), ("l", "Litre")];

pub fn migrate(pool: &DbPool) -> anyhow::Result<()> {
    tracing::info!("[DB] Starting database migration...");

    let conn = pool.get()?;
    conn.execute_batch(SCHEMA)?;

    for (code, label) in DEFAULT_UNITS {
        conn.execute(
            "INSERT OR IGNORE INTO item_units (code, label) VALUES (?1, ?2)",
            rusqlite::params![code, label],
        )?;
    }

    // Idempotent column additions for databases created by older builds
    let has_column = |table: &str, column: &str| -> anyhow::Result<bool> {
        let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
        let columns: Vec<String> = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(columns.iter().any(|c| c == column))
    };

    if !has_column("inventory_orders", "expected_on")? {
        conn.execute_batch("ALTER TABLE inventory_orders ADD COLUMN expected_on DATE")?;
    }

    tracing::info!("[DB] Migration completed successfully");
    Ok(())
}
