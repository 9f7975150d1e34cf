use serde::{Deserialize, Serialize};

pub const STATUS_OK: &str = "ok";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupScope {
    Tenant,
    All,
}

impl BackupScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupScope::Tenant => "tenant",
            BackupScope::All => "all",
        }
    }
}

impl std::str::FromStr for BackupScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "tenant" => Ok(BackupScope::Tenant),
            "all" => Ok(BackupScope::All),
            other => Err(format!("Invalid scope: {other}")),
        }
    }
}

/// One backup artifact set as recorded in `index.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupEntry {
    pub id: String,
    pub scope: BackupScope,
    pub tenant_id: Option<String>,
    pub tenant_slug: Option<String>,
    pub created_at: String,
    pub status: String,
    #[serde(default)]
    pub restored_at: Option<String>,
}

impl BackupEntry {
    pub fn for_tenant(id: String, tenant_id: &str, tenant_slug: &str, created_at: String) -> Self {
        Self {
            id,
            scope: BackupScope::Tenant,
            tenant_id: Some(tenant_id.to_string()),
            tenant_slug: Some(tenant_slug.to_string()),
            created_at,
            status: STATUS_OK.to_string(),
            restored_at: None,
        }
    }

    pub fn for_sweep(id: String, created_at: String) -> Self {
        Self {
            id,
            scope: BackupScope::All,
            tenant_id: None,
            tenant_slug: None,
            created_at,
            status: STATUS_OK.to_string(),
            restored_at: None,
        }
    }

    /// Tenant scope carries tenant identity, sweep scope carries none.
    pub fn is_consistent(&self) -> bool {
        match self.scope {
            BackupScope::Tenant => self.tenant_id.is_some() && self.tenant_slug.is_some(),
            BackupScope::All => self.tenant_id.is_none() && self.tenant_slug.is_none(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupFileInfo {
    pub name: String,
    pub size_bytes: u64,
    pub size_label: String,
}

/// API view of an entry: the stored fields plus files listed from disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupView {
    #[serde(flatten)]
    pub entry: BackupEntry,
    pub files: Vec<BackupFileInfo>,
}

pub fn format_size(size_bytes: u64) -> String {
    const KB: f64 = 1024.0;
    if size_bytes < 1024 {
        format!("{size_bytes} B")
    } else if size_bytes < 1024 * 1024 {
        format!("{:.1} KB", size_bytes as f64 / KB)
    } else {
        format!("{:.1} MB", size_bytes as f64 / (KB * KB))
    }
}
