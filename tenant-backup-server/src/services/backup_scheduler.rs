use crate::db::advisory_lock;
use crate::error::BackupError;
use crate::models::backup_job::BackupJob;
use crate::services::backup::jobs::enqueue_scheduled_job;
use crate::services::backup::run_blocking;
use crate::state::AppState;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;

/// One scheduling cycle: take the cross-process lock, enqueue, always release.
pub async fn run_scheduler_cycle(state: &Arc<AppState>) -> Result<Option<BackupJob>, BackupError> {
    let backup = &state.config.backup;
    if !backup.advisory_lock {
        return enqueue_scheduled_job(state).await;
    }

    let key = backup.schedule_lock_key;
    let stale_after = backup.schedule_interval;
    let db = state.db.clone();
    let holder = state.instance_id.clone();
    let acquired = run_blocking(move || {
        let mut conn = db.get()?;
        Ok(advisory_lock::try_acquire(&mut conn, key, &holder, stale_after)?)
    })
    .await?;
    if !acquired {
        tracing::info!(key, "Another scheduler holds the backup lock, skipping cycle");
        return Ok(None);
    }

    let result = enqueue_scheduled_job(state).await;

    let db = state.db.clone();
    let holder = state.instance_id.clone();
    let released = run_blocking(move || {
        let conn = db.get()?;
        Ok(advisory_lock::release(&conn, key, &holder)?)
    })
    .await;
    match released {
        Ok(true) => {}
        Ok(false) => tracing::warn!(key, "Backup lock was not held at release"),
        Err(e) => tracing::error!(key, "Failed to release backup lock: {e:#}"),
    }

    result
}

/// Worker-mode driver: sleep, run a cycle if enabled, repeat until cancelled.
pub async fn run_scheduler_loop(state: Arc<AppState>, cancel: CancellationToken) {
    let interval = state.config.backup.schedule_interval;
    tracing::info!(interval_secs = interval.as_secs(), "Backup scheduler loop started");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        if !state.config.backup.schedule_enabled {
            continue;
        }
        match run_scheduler_cycle(&state).await {
            Ok(Some(job)) => tracing::info!(job_id = %job.id, "Scheduled backup job enqueued"),
            Ok(None) => tracing::debug!("Scheduled backup skipped"),
            Err(e) => tracing::error!("Scheduled backup cycle failed: {e:#}"),
        }
    }
    tracing::info!("Backup scheduler loop stopped");
}

/// App-mode driver on top of `tokio_cron_scheduler`.
pub struct BackupScheduler {
    scheduler: Mutex<JobScheduler>,
    state: Arc<AppState>,
}

impl BackupScheduler {
    pub async fn new(state: Arc<AppState>) -> anyhow::Result<Self> {
        let scheduler = JobScheduler::new().await?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            state,
        })
    }

    pub async fn init_schedule(&self) -> anyhow::Result<()> {
        let backup = &self.state.config.backup;
        if !backup.schedule_enabled {
            tracing::info!("Scheduled backups disabled");
            return Ok(());
        }

        let state = self.state.clone();
        let job = Job::new_repeated_async(backup.schedule_interval, move |_uuid, _lock| {
            let state = state.clone();
            Box::pin(async move {
                match run_scheduler_cycle(&state).await {
                    Ok(Some(job)) => tracing::info!(job_id = %job.id, "Scheduled backup job enqueued"),
                    Ok(None) => tracing::debug!("Scheduled backup skipped"),
                    Err(e) => tracing::error!("Scheduled backup cycle failed: {e:#}"),
                }
            })
        })?;

        self.scheduler.lock().await.add(job).await?;
        tracing::info!(interval_secs = backup.schedule_interval.as_secs(), "Backup schedule registered");
        Ok(())
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.start().await?;
        Ok(())
    }

    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.scheduler.lock().await.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::backup::jobs::list_jobs;
    use crate::test_support::TestEnv;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cycle_enqueues_and_releases_lock() {
        let env = TestEnv::new();
        let state = env.state();

        let job = run_scheduler_cycle(&state).await.unwrap();
        assert!(job.is_some());

        let conn = env.pool.get().unwrap();
        let held: i64 = conn
            .query_row("SELECT COUNT(*) FROM advisory_locks", [], |r| r.get(0))
            .unwrap();
        assert_eq!(held, 0);
    }

    #[tokio::test]
    async fn test_cycle_skips_when_another_replica_holds_lock() {
        let env = TestEnv::new();
        let state = env.state();
        {
            let mut conn = env.pool.get().unwrap();
            let key = state.config.backup.schedule_lock_key;
            assert!(advisory_lock::try_acquire(&mut conn, key, "other-replica", Duration::from_secs(3600)).unwrap());
        }

        assert!(run_scheduler_cycle(&state).await.unwrap().is_none());
        assert!(list_jobs(&state).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cycle_without_advisory_lock() {
        let env = TestEnv::new();
        let state = env.state_with(|config| config.backup.advisory_lock = false);
        {
            let mut conn = env.pool.get().unwrap();
            let key = state.config.backup.schedule_lock_key;
            advisory_lock::try_acquire(&mut conn, key, "other-replica", Duration::from_secs(3600)).unwrap();
        }
        assert!(run_scheduler_cycle(&state).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_loop_runs_cycles_until_cancelled() {
        let env = TestEnv::new();
        let state = env.state_with(|config| {
            config.backup.schedule_enabled = true;
            config.backup.schedule_interval = Duration::from_millis(20);
        });
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_scheduler_loop(state.clone(), cancel.clone()));

        let mut seen = false;
        for _ in 0..100 {
            if !list_jobs(&state).await.unwrap().is_empty() {
                seen = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        cancel.cancel();
        handle.await.unwrap();
        assert!(seen);
    }
}
