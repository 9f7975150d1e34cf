use crate::config::AppConfig;
use crate::db::connection::DbPool;
use crate::error::BackupError;
use crate::services::backup::jobs::{JobMetrics, SnapshotExporter, TenantExporter};
use crate::services::backup::schema::TableRegistry;
use crate::services::backup::storage::{self, BackupStorage};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

pub struct AppState {
    pub db: DbPool,
    pub config: AppConfig,
    pub storage: Arc<dyn BackupStorage>,
    pub tables: Arc<TableRegistry>,
    /// Guards read-modify-write of `index.json`.
    pub index_lock: Mutex<()>,
    /// Guards read-modify-write of `jobs.json`.
    pub job_log_lock: Mutex<()>,
    pub exporter: Arc<dyn TenantExporter>,
    pub metrics: Arc<JobMetrics>,
    /// Advisory lock holder name of this process.
    pub instance_id: String,
}

impl AppState {
    pub fn new(db: DbPool, config: AppConfig) -> Result<Self, BackupError> {
        Self::with_exporter(db, config, Arc::new(SnapshotExporter))
    }

    pub fn with_exporter(
        db: DbPool,
        config: AppConfig,
        exporter: Arc<dyn TenantExporter>,
    ) -> Result<Self, BackupError> {
        let storage = storage::from_config(&config.backup.storage_driver, &config.backup.storage_path)?;
        storage.ensure_root()?;
        Ok(Self {
            db,
            config,
            storage,
            tables: Arc::new(TableRegistry::new()),
            index_lock: Mutex::new(()),
            job_log_lock: Mutex::new(()),
            exporter,
            metrics: Arc::new(JobMetrics::default()),
            instance_id: format!("{}-{}", std::process::id(), Uuid::new_v4()),
        })
    }
}
