//! Manifest and artifact types for one backup directory.
//!
//! `meta.json` records which tables were exported, how many rows each had and a
//! SHA-256 digest of every other artifact in the directory. Restore refuses to
//! touch the database unless all of it still matches.

use crate::models::backup_entry::BackupScope;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const MANIFEST_FILE: &str = "meta.json";
pub const TENANT_FILE: &str = "tenant.json";
pub const SWEEP_TENANTS_FILE: &str = "tenants.json";

/// Artifact names that a table file must never shadow.
pub const RESERVED_FILES: &[&str] = &[MANIFEST_FILE, TENANT_FILE, SWEEP_TENANTS_FILE];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDigest {
    pub checksum: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupManifest {
    pub backup_id: String,
    pub created_at: String,
    pub scope: BackupScope,
    #[serde(default)]
    pub tables: Vec<String>,
    #[serde(default)]
    pub table_counts: BTreeMap<String, usize>,
    #[serde(default)]
    pub files: BTreeMap<String, FileDigest>,
    /// Digest of the tenant identity payload (`tenant.json`).
    #[serde(default)]
    pub checksum: Option<String>,
}

/// Identity artifact written next to the table files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantIdentity {
    pub id: String,
    pub slug: String,
    pub name: String,
}

/// Rows of one tenant-scoped table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableArtifact {
    pub table: String,
    pub rows: Vec<Map<String, Value>>,
}

pub fn table_file_name(table: &str) -> String {
    format!("{table}.json")
}

/// One tenant listed in a sweep summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepTenant {
    pub id: String,
    pub slug: String,
    pub name: String,
    pub backup_id: String,
}

/// `tenants.json` of a scope=all entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepSummary {
    pub count: usize,
    pub items: Vec<SweepTenant>,
}
