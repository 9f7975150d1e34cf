//! All-tenants backup jobs.
//!
//! Jobs live in `jobs.json` and are mutated in place under `AppState::job_log_lock`.
//! At most one job is queued or running at a time. Tenants are exported one after
//! another; a tenant whose retries run out is recorded and the job moves on.

use crate::error::{BackupError, EntityKind};
use crate::models::audit_log::{self, ACTION_BACKUP_JOB_ENQUEUE, ENTITY_BACKUP};
use crate::models::backup_entry::BackupEntry;
use crate::models::backup_job::{BackupJob, JobTrigger};
use crate::models::manifest::SweepTenant;
use crate::models::tenant::{self, Tenant};
use crate::services::backup::index::write_atomic;
use crate::services::backup::{create_sweep_backup, create_tenant_backup, now_rfc3339, run_blocking};
use crate::state::AppState;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const SCHEDULER_ACTOR: &str = "scheduler";

/// Produces one tenant backup. The job runner retries around it.
pub trait TenantExporter: Send + Sync {
    fn backup_tenant(
        &self,
        state: Arc<AppState>,
        tenant: Tenant,
        actor: String,
    ) -> BoxFuture<'static, Result<BackupEntry, BackupError>>;
}

/// Writes a regular tenant backup.
pub struct SnapshotExporter;

impl TenantExporter for SnapshotExporter {
    fn backup_tenant(
        &self,
        state: Arc<AppState>,
        tenant: Tenant,
        actor: String,
    ) -> BoxFuture<'static, Result<BackupEntry, BackupError>> {
        Box::pin(async move {
            let view = create_tenant_backup(&state, &tenant.id, &actor).await?;
            Ok(view.entry)
        })
    }
}

#[derive(Debug, Default)]
pub struct JobMetrics {
    failed_attempts: AtomicU64,
    retries_exhausted: AtomicU64,
    jobs_finished: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JobMetricsSnapshot {
    pub failed_attempts: u64,
    pub retries_exhausted: u64,
    pub jobs_finished: u64,
}

impl JobMetrics {
    pub fn snapshot(&self) -> JobMetricsSnapshot {
        JobMetricsSnapshot {
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
            retries_exhausted: self.retries_exhausted.load(Ordering::Relaxed),
            jobs_finished: self.jobs_finished.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct JobLog {
    #[serde(default)]
    items: Vec<BackupJob>,
}

fn read_log(state: &AppState) -> Result<Vec<BackupJob>, BackupError> {
    let bytes = match std::fs::read(state.storage.jobs_path()) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let log: JobLog = serde_json::from_slice(&bytes)?;
    Ok(log.items)
}

fn write_log(state: &AppState, items: Vec<BackupJob>) -> Result<(), BackupError> {
    state.storage.ensure_root()?;
    let bytes = serde_json::to_vec_pretty(&JobLog { items })?;
    write_atomic(&state.storage.jobs_path(), &bytes)?;
    Ok(())
}

/// Jobs, newest first.
pub async fn list_jobs(state: &Arc<AppState>) -> Result<Vec<BackupJob>, BackupError> {
    let _guard = state.job_log_lock.lock().await;
    let st = state.clone();
    let mut items = run_blocking(move || read_log(&st)).await?;
    items.reverse();
    Ok(items)
}

pub async fn get_job(state: &Arc<AppState>, job_id: &str) -> Result<BackupJob, BackupError> {
    list_jobs(state)
        .await?
        .into_iter()
        .find(|j| j.id == job_id)
        .ok_or_else(|| BackupError::not_found(EntityKind::Job, job_id))
}

async fn update_job<F>(state: &Arc<AppState>, job_id: &str, apply: F) -> Result<BackupJob, BackupError>
where
    F: FnOnce(&mut BackupJob) -> anyhow::Result<()> + Send + 'static,
{
    let _guard = state.job_log_lock.lock().await;
    let st = state.clone();
    let id = job_id.to_string();
    run_blocking(move || {
        let mut items = read_log(&st)?;
        let job = items
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| BackupError::not_found(EntityKind::Job, &id))?;
        apply(job)?;
        let updated = job.clone();
        write_log(&st, items)?;
        Ok(updated)
    })
    .await
}

/// Appends a queued job unless one is already active. Returns `None` when skipped.
async fn try_enqueue(
    state: &Arc<AppState>,
    trigger: JobTrigger,
    actor: &str,
) -> Result<Option<BackupJob>, BackupError> {
    let job = {
        let _guard = state.job_log_lock.lock().await;
        let st = state.clone();
        run_blocking(move || {
            let mut items = read_log(&st)?;
            if let Some(active) = items.iter().find(|j| j.status.is_active()) {
                tracing::info!(job_id = %active.id, status = ?active.status, "Backup job already active");
                return Ok(None);
            }
            let job = BackupJob::new(trigger, &now_rfc3339());
            items.push(job.clone());
            write_log(&st, items)?;
            Ok(Some(job))
        })
        .await?
    };
    let Some(job) = job else { return Ok(None) };

    tracing::info!(job_id = %job.id, trigger = ?job.trigger, "Backup job enqueued");
    let db = state.db.clone();
    let (actor_name, job_id, payload) = (
        actor.to_string(),
        job.id.clone(),
        json!({ "trigger": job.trigger }),
    );
    let audited = run_blocking(move || {
        let conn = db.get()?;
        audit_log::write(&conn, &actor_name, ACTION_BACKUP_JOB_ENQUEUE, ENTITY_BACKUP, &job_id, &payload)?;
        Ok(())
    })
    .await;
    // The job is already persisted as queued; it has to run either way.
    if let Err(e) = audited {
        tracing::error!(job_id = %job.id, "Failed to audit backup job enqueue: {e:#}");
    }

    tokio::spawn(execute_job(state.clone(), job.id.clone(), actor.to_string()));
    Ok(Some(job))
}

/// Manual trigger. An already active job is a conflict.
pub async fn enqueue_all_tenants(
    state: &Arc<AppState>,
    trigger: JobTrigger,
    actor: &str,
) -> Result<BackupJob, BackupError> {
    try_enqueue(state, trigger, actor)
        .await?
        .ok_or_else(|| BackupError::Conflict("A backup job is already queued or running".into()))
}

/// Scheduler trigger. An already active job makes this a no-op.
pub async fn enqueue_scheduled_job(state: &Arc<AppState>) -> Result<Option<BackupJob>, BackupError> {
    try_enqueue(state, JobTrigger::Scheduler, SCHEDULER_ACTOR).await
}

async fn execute_job(state: Arc<AppState>, job_id: String, actor: String) {
    if let Err(e) = run_job(&state, &job_id, &actor).await {
        let message = format!("{e:#}");
        tracing::error!(job_id = %job_id, "Backup job failed: {message}");
        let result = update_job(&state, &job_id, move |job| {
            if job.status.is_terminal() {
                return Ok(());
            }
            job.fail(&message, &now_rfc3339())
        })
        .await;
        if let Err(e) = result {
            tracing::error!(job_id = %job_id, "Failed to mark job as failed: {e:#}");
        }
    }
    state.metrics.jobs_finished.fetch_add(1, Ordering::Relaxed);
}

async fn run_job(state: &Arc<AppState>, job_id: &str, actor: &str) -> Result<(), BackupError> {
    update_job(state, job_id, |job| job.start(&now_rfc3339())).await?;

    let db = state.db.clone();
    let tenants = run_blocking(move || {
        let conn = db.get()?;
        Ok(tenant::find_all(&conn)?)
    })
    .await?;
    let total = tenants.len();
    update_job(state, job_id, move |job| {
        job.set_total(total);
        Ok(())
    })
    .await?;
    tracing::info!(job_id, total, "Backup job running");

    let mut failures = 0usize;
    let mut succeeded = Vec::with_capacity(total);
    for tenant in tenants {
        match backup_tenant_with_retry(state, &tenant, actor).await {
            Ok(entry) => {
                let backup_id = entry.id.clone();
                update_job(state, job_id, move |job| {
                    job.record_tenant(Some(backup_id), None);
                    Ok(())
                })
                .await?;
                succeeded.push(SweepTenant {
                    id: tenant.id,
                    slug: tenant.slug,
                    name: tenant.name,
                    backup_id: entry.id,
                });
            }
            Err(message) => {
                failures += 1;
                let failure = format!("{}: {message}", tenant.slug);
                update_job(state, job_id, move |job| {
                    job.record_tenant(None, Some(failure));
                    Ok(())
                })
                .await?;
            }
        }
    }

    let mut had_failures = failures > 0;
    if let Err(e) = create_sweep_backup(state, succeeded, actor).await {
        tracing::warn!(job_id, "Failed to write sweep summary: {e:#}");
        had_failures = true;
        let note = format!("summary: {e}");
        update_job(state, job_id, move |job| {
            job.note_error(note);
            Ok(())
        })
        .await?;
    }

    let job = update_job(state, job_id, move |job| job.finish(had_failures, &now_rfc3339())).await?;
    tracing::info!(job_id, status = ?job.status, processed = job.processed, failures, "Backup job finished");
    Ok(())
}

/// One attempt plus `max_retries` retries, a fixed delay apart.
async fn backup_tenant_with_retry(
    state: &Arc<AppState>,
    tenant: &Tenant,
    actor: &str,
) -> Result<BackupEntry, String> {
    let attempts = state.config.backup.max_retries.saturating_add(1);
    let mut last_error = String::new();
    for attempt in 1..=attempts {
        let result = state
            .exporter
            .backup_tenant(state.clone(), tenant.clone(), actor.to_string())
            .await;
        match result {
            Ok(entry) => return Ok(entry),
            Err(e) => {
                state.metrics.failed_attempts.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(tenant_id = %tenant.id, attempt, attempts, "Tenant backup attempt failed: {e}");
                last_error = e.to_string();
                if attempt < attempts {
                    tokio::time::sleep(state.config.backup.retry_delay).await;
                }
            }
        }
    }
    state.metrics.retries_exhausted.fetch_add(1, Ordering::Relaxed);
    tracing::error!(tenant_id = %tenant.id, attempts, "Tenant backup retries exhausted");
    Err(last_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::backup_entry::BackupScope;
    use crate::models::backup_job::JobStatus;
    use crate::services::backup::list_backups;
    use crate::test_support::{seed_warehouse, TestEnv};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Fails the first `failures[slug]` attempts of a tenant, then delegates.
    struct FlakyExporter {
        failures: HashMap<String, usize>,
        attempts: Mutex<HashMap<String, usize>>,
    }

    impl FlakyExporter {
        fn new(failures: &[(&str, usize)]) -> Self {
            Self {
                failures: failures.iter().map(|(s, n)| (s.to_string(), *n)).collect(),
                attempts: Mutex::new(HashMap::new()),
            }
        }
    }

    impl TenantExporter for FlakyExporter {
        fn backup_tenant(
            &self,
            state: Arc<AppState>,
            tenant: Tenant,
            actor: String,
        ) -> BoxFuture<'static, Result<BackupEntry, BackupError>> {
            let attempt = {
                let mut attempts = self.attempts.lock().unwrap();
                let count = attempts.entry(tenant.slug.clone()).or_default();
                *count += 1;
                *count
            };
            let fail = attempt <= self.failures.get(&tenant.slug).copied().unwrap_or(0);
            Box::pin(async move {
                if fail {
                    return Err(BackupError::Internal(anyhow::anyhow!("disk hiccup #{attempt}")));
                }
                SnapshotExporter.backup_tenant(state, tenant, actor).await
            })
        }
    }

    async fn wait_for_terminal(state: &Arc<AppState>, job_id: &str) -> BackupJob {
        for _ in 0..200 {
            let job = get_job(state, job_id).await.unwrap();
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("job {job_id} never finished");
    }

    #[tokio::test]
    async fn test_job_backs_up_every_tenant() {
        let env = TestEnv::new();
        let state = env.state();
        {
            let conn = env.pool.get().unwrap();
            seed_warehouse(&conn, "alpha");
            seed_warehouse(&conn, "beta");
        }

        let job = enqueue_all_tenants(&state, JobTrigger::Manual, "alice").await.unwrap();
        assert_eq!(job.status, JobStatus::Queued);
        let done = wait_for_terminal(&state, &job.id).await;

        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!((done.total, done.processed), (2, 2));
        assert_eq!(done.backup_ids.len(), 2);
        assert!(done.error.is_none());

        let backups = list_backups(&state, Default::default()).await.unwrap();
        assert_eq!(backups.len(), 3);
        let sweeps: Vec<_> = backups.iter().filter(|b| b.entry.scope == BackupScope::All).collect();
        assert_eq!(sweeps.len(), 1);
        assert!(!done.backup_ids.contains(&sweeps[0].entry.id));
        assert_eq!(state.metrics.snapshot().jobs_finished, 1);
    }

    #[tokio::test]
    async fn test_success_on_last_retry_counts_as_success() {
        let env = TestEnv::new();
        let state = env.state_with_exporter(Arc::new(FlakyExporter::new(&[("alpha", 2)])));
        seed_warehouse(&env.pool.get().unwrap(), "alpha");
        assert_eq!(state.config.backup.max_retries, 2);

        let job = enqueue_all_tenants(&state, JobTrigger::Manual, "alice").await.unwrap();
        let done = wait_for_terminal(&state, &job.id).await;

        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.backup_ids.len(), 1);
        assert!(done.error.is_none());
        let metrics = state.metrics.snapshot();
        assert_eq!(metrics.failed_attempts, 2);
        assert_eq!(metrics.retries_exhausted, 0);
    }

    #[tokio::test]
    async fn test_exhausted_tenant_does_not_abort_job() {
        let env = TestEnv::new();
        let state = env.state_with_exporter(Arc::new(FlakyExporter::new(&[("alpha", 3)])));
        {
            let conn = env.pool.get().unwrap();
            seed_warehouse(&conn, "alpha");
            seed_warehouse(&conn, "beta");
        }

        let job = enqueue_all_tenants(&state, JobTrigger::Manual, "alice").await.unwrap();
        let done = wait_for_terminal(&state, &job.id).await;

        assert_eq!(done.status, JobStatus::CompletedWithErrors);
        assert_eq!(done.processed, done.total);
        assert_eq!(done.backup_ids.len(), 1);
        let error = done.error.unwrap();
        assert!(error.starts_with("alpha:"), "{error}");
        assert!(!error.contains("beta"));
        assert_eq!(state.metrics.snapshot().retries_exhausted, 1);
    }

    #[tokio::test]
    async fn test_single_flight() {
        let env = TestEnv::new();
        let state = env.state();

        let mut running = BackupJob::new(JobTrigger::Manual, &now_rfc3339());
        running.start(&now_rfc3339()).unwrap();
        write_log(&state, vec![running.clone()]).unwrap();

        assert!(enqueue_scheduled_job(&state).await.unwrap().is_none());
        assert_eq!(list_jobs(&state).await.unwrap().len(), 1);

        let err = enqueue_all_tenants(&state, JobTrigger::Manual, "alice").await.unwrap_err();
        assert!(matches!(err, BackupError::Conflict(_)));
        assert_eq!(list_jobs(&state).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_scheduled_job_audits_scheduler_actor() {
        let env = TestEnv::new();
        let state = env.state();

        let job = enqueue_scheduled_job(&state).await.unwrap().unwrap();
        assert_eq!(job.trigger, JobTrigger::Scheduler);
        let done = wait_for_terminal(&state, &job.id).await;
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.total, 0);

        let conn = env.pool.get().unwrap();
        let actor: String = conn
            .query_row(
                "SELECT actor FROM admin_audit_log WHERE action = ?",
                [ACTION_BACKUP_JOB_ENQUEUE],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(actor, SCHEDULER_ACTOR);
    }

    #[tokio::test]
    async fn test_failed_enqueue_audit_still_runs_job() {
        let env = TestEnv::new();
        let state = env.state();
        let conn = env.pool.get().unwrap();
        conn.execute_batch("ALTER TABLE admin_audit_log RENAME TO admin_audit_log_parked")
            .unwrap();

        let job = enqueue_all_tenants(&state, JobTrigger::Manual, "alice").await.unwrap();
        conn.execute_batch("ALTER TABLE admin_audit_log_parked RENAME TO admin_audit_log")
            .unwrap();
        drop(conn);

        let done = wait_for_terminal(&state, &job.id).await;
        assert!(done.status.is_terminal());
        let next = enqueue_scheduled_job(&state).await.unwrap();
        assert!(next.is_some());
    }

    #[tokio::test]
    async fn test_jobs_listed_newest_first() {
        let env = TestEnv::new();
        let state = env.state();
        let mut older = BackupJob::new(JobTrigger::Manual, "2024-01-01T00:00:00Z");
        older.start("2024-01-01T00:00:00Z").unwrap();
        older.finish(false, "2024-01-01T00:01:00Z").unwrap();
        let mut newer = BackupJob::new(JobTrigger::Scheduler, "2024-01-02T00:00:00Z");
        newer.start("2024-01-02T00:00:00Z").unwrap();
        newer.finish(false, "2024-01-02T00:01:00Z").unwrap();
        write_log(&state, vec![older.clone(), newer.clone()]).unwrap();

        let jobs = list_jobs(&state).await.unwrap();
        assert_eq!(jobs[0].id, newer.id);
        assert_eq!(get_job(&state, &older.id).await.unwrap(), older);
        assert!(matches!(
            get_job(&state, "nope").await,
            Err(BackupError::NotFound { kind: EntityKind::Job, .. })
        ));
    }
}
