use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    CompletedWithErrors,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::CompletedWithErrors | JobStatus::Failed
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// queued -> running -> terminal. A queued job may also fail before it starts.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match self {
            JobStatus::Queued => matches!(next, JobStatus::Running | JobStatus::Failed),
            JobStatus::Running => next.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobTrigger {
    Manual,
    Scheduler,
}

/// One "back up every tenant" execution, persisted in `jobs.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupJob {
    pub id: String,
    pub status: JobStatus,
    pub created_at: String,
    pub trigger: JobTrigger,
    pub scheduled_at: Option<String>,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub total: usize,
    pub processed: usize,
    #[serde(default)]
    pub backup_ids: Vec<String>,
    pub error: Option<String>,
}

impl BackupJob {
    pub fn new(trigger: JobTrigger, now: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            status: JobStatus::Queued,
            created_at: now.to_string(),
            trigger,
            scheduled_at: Some(now.to_string()),
            started_at: None,
            finished_at: None,
            total: 0,
            processed: 0,
            backup_ids: Vec::new(),
            error: None,
        }
    }

    fn transition(&mut self, next: JobStatus) -> anyhow::Result<()> {
        if !self.status.can_transition_to(next) {
            anyhow::bail!(
                "Invalid job transition {:?} -> {:?} for job {}",
                self.status,
                next,
                self.id
            );
        }
        self.status = next;
        Ok(())
    }

    pub fn start(&mut self, now: &str) -> anyhow::Result<()> {
        self.transition(JobStatus::Running)?;
        self.started_at = Some(now.to_string());
        Ok(())
    }

    pub fn set_total(&mut self, total: usize) {
        self.total = total;
        self.processed = self.processed.min(total);
    }

    /// Counts one attempted tenant; `backup_id` is `None` when its retries were exhausted.
    pub fn record_tenant(&mut self, backup_id: Option<String>, failure: Option<String>) {
        if self.processed < self.total {
            self.processed += 1;
        }
        if let Some(id) = backup_id {
            self.backup_ids.push(id);
        }
        if let Some(message) = failure {
            self.note_error(message);
        }
    }

    /// Appends to `error`; messages are joined with "; ".
    pub fn note_error(&mut self, message: String) {
        self.error = Some(match self.error.take() {
            Some(previous) => format!("{previous}; {message}"),
            None => message,
        });
    }

    pub fn finish(&mut self, had_failures: bool, now: &str) -> anyhow::Result<()> {
        let next = if had_failures {
            JobStatus::CompletedWithErrors
        } else {
            JobStatus::Completed
        };
        self.transition(next)?;
        self.finished_at = Some(now.to_string());
        Ok(())
    }

    pub fn fail(&mut self, message: &str, now: &str) -> anyhow::Result<()> {
        self.transition(JobStatus::Failed)?;
        self.error = Some(message.to_string());
        self.finished_at = Some(now.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: &str = "2024-05-01T10:00:00+00:00";

    #[test]
    fn test_lifecycle() {
        let mut job = BackupJob::new(JobTrigger::Manual, NOW);
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.status.is_active());

        job.start(NOW).unwrap();
        job.set_total(2);
        job.record_tenant(Some("b1".into()), None);
        job.record_tenant(None, Some("beta: disk full".into()));
        job.finish(true, NOW).unwrap();

        assert_eq!(job.status, JobStatus::CompletedWithErrors);
        assert_eq!(job.processed, 2);
        assert_eq!(job.backup_ids, vec!["b1".to_string()]);
        assert_eq!(job.error.as_deref(), Some("beta: disk full"));
    }

    #[test]
    fn test_terminal_states_do_not_transition() {
        let mut job = BackupJob::new(JobTrigger::Scheduler, NOW);
        job.start(NOW).unwrap();
        job.finish(false, NOW).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.fail("late", NOW).is_err());
        assert!(job.start(NOW).is_err());
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[test]
    fn test_processed_never_exceeds_total() {
        let mut job = BackupJob::new(JobTrigger::Manual, NOW);
        job.start(NOW).unwrap();
        job.set_total(1);
        job.record_tenant(Some("b1".into()), None);
        job.record_tenant(Some("b2".into()), None);
        assert_eq!(job.processed, 1);
    }

    #[test]
    fn test_errors_accumulate() {
        let mut job = BackupJob::new(JobTrigger::Manual, NOW);
        job.start(NOW).unwrap();
        job.set_total(2);
        job.record_tenant(None, Some("a: x".into()));
        job.record_tenant(None, Some("b: y".into()));
        assert_eq!(job.error.as_deref(), Some("a: x; b: y"));
    }

    #[test]
    fn test_serialized_status_names() {
        let value = serde_json::to_value(JobStatus::CompletedWithErrors).unwrap();
        assert_eq!(value, "completed_with_errors");
        let value = serde_json::to_value(JobTrigger::Scheduler).unwrap();
        assert_eq!(value, "scheduler");
    }
}
