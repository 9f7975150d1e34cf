use anyhow::Context;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_SCHEDULE_LOCK_KEY: i64 = 0x5EED_BAC0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleMode {
    /// Scheduler runs inside the HTTP server process.
    App,
    /// Process runs only the scheduler loop.
    Worker,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_age_days: Option<u32>,
    pub max_count: Option<usize>,
}

impl RetentionPolicy {
    pub fn is_disabled(&self) -> bool {
        self.max_age_days.is_none() && self.max_count.is_none()
    }
}

#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub storage_driver: String,
    pub storage_path: PathBuf,
    pub retention: RetentionPolicy,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub schedule_enabled: bool,
    pub schedule_interval: Duration,
    pub schedule_mode: ScheduleMode,
    pub schedule_lock_key: i64,
    pub advisory_lock: bool,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub db_path: PathBuf,
    pub admin_api_key: String,
    pub backup: BackupConfig,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup so tests don't touch the process env.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let admin_api_key = var("ADMIN_API_KEY").context("ADMIN_API_KEY must be set")?;

        let interval_minutes: u64 = parse_or(&var, "BACKUP_SCHEDULE_INTERVAL_MINUTES", 1440)?;
        if interval_minutes == 0 {
            anyhow::bail!("BACKUP_SCHEDULE_INTERVAL_MINUTES must be greater than 0");
        }

        let schedule_mode = match var("BACKUP_SCHEDULE_MODE").as_deref() {
            None | Some("app") => ScheduleMode::App,
            Some("worker") => ScheduleMode::Worker,
            Some(other) => anyhow::bail!("BACKUP_SCHEDULE_MODE must be 'app' or 'worker', got '{other}'"),
        };

        let max_age_days: u32 = parse_or(&var, "BACKUP_RETENTION_MAX_DAYS", 0)?;
        let max_count: usize = parse_or(&var, "BACKUP_RETENTION_MAX_COUNT", 0)?;

        Ok(Self {
            port: parse_or(&var, "PORT", 3000)?,
            db_path: PathBuf::from(var("DATABASE_PATH").unwrap_or_else(|| "./data/warehouse.db".into())),
            admin_api_key,
            backup: BackupConfig {
                storage_driver: var("BACKUP_STORAGE_DRIVER").unwrap_or_else(|| "local".into()),
                storage_path: PathBuf::from(
                    var("BACKUP_STORAGE_PATH").unwrap_or_else(|| "./data/backups".into()),
                ),
                retention: RetentionPolicy {
                    max_age_days: (max_age_days > 0).then_some(max_age_days),
                    max_count: (max_count > 0).then_some(max_count),
                },
                max_retries: parse_or(&var, "BACKUP_JOB_MAX_RETRIES", 2)?,
                retry_delay: Duration::from_secs(parse_or(&var, "BACKUP_JOB_RETRY_DELAY_SECONDS", 5)?),
                schedule_enabled: parse_bool_or(&var, "BACKUP_SCHEDULE_ENABLED", false)?,
                schedule_interval: Duration::from_secs(interval_minutes * 60),
                schedule_mode,
                schedule_lock_key: parse_or(&var, "BACKUP_SCHEDULE_LOCK_KEY", DEFAULT_SCHEDULE_LOCK_KEY)?,
                advisory_lock: parse_bool_or(&var, "BACKUP_SCHEDULE_ADVISORY_LOCK", true)?,
            },
        })
    }
}

fn parse_or<T, F>(var: &F, key: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{key} has invalid value '{raw}': {e}")),
        None => Ok(default),
    }
}

fn parse_bool_or<F>(var: &F, key: &str, default: bool) -> anyhow::Result<bool>
where
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => match raw.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => anyhow::bail!("{key} has invalid boolean value '{raw}'"),
        },
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> anyhow::Result<AppConfig> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[("ADMIN_API_KEY", "secret")]).unwrap();
        assert_eq!(config.port, 3000);
        assert_eq!(config.backup.storage_driver, "local");
        assert!(config.backup.retention.is_disabled());
        assert_eq!(config.backup.max_retries, 2);
        assert_eq!(config.backup.retry_delay, Duration::from_secs(5));
        assert!(!config.backup.schedule_enabled);
        assert_eq!(config.backup.schedule_interval, Duration::from_secs(1440 * 60));
        assert_eq!(config.backup.schedule_mode, ScheduleMode::App);
        assert_eq!(config.backup.schedule_lock_key, DEFAULT_SCHEDULE_LOCK_KEY);
        assert!(config.backup.advisory_lock);
    }

    #[test]
    fn test_missing_admin_key_is_an_error() {
        let err = config_from(&[]).unwrap_err();
        assert!(err.to_string().contains("ADMIN_API_KEY"));
    }

    #[test]
    fn test_zero_retention_disables_rule() {
        let config = config_from(&[
            ("ADMIN_API_KEY", "secret"),
            ("BACKUP_RETENTION_MAX_DAYS", "0"),
            ("BACKUP_RETENTION_MAX_COUNT", "5"),
        ])
        .unwrap();
        assert_eq!(config.backup.retention.max_age_days, None);
        assert_eq!(config.backup.retention.max_count, Some(5));
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        assert!(config_from(&[("ADMIN_API_KEY", "k"), ("BACKUP_SCHEDULE_ENABLED", "maybe")]).is_err());
        assert!(config_from(&[("ADMIN_API_KEY", "k"), ("BACKUP_SCHEDULE_MODE", "cron")]).is_err());
        assert!(config_from(&[("ADMIN_API_KEY", "k"), ("BACKUP_SCHEDULE_INTERVAL_MINUTES", "0")]).is_err());
        assert!(config_from(&[("ADMIN_API_KEY", "k"), ("PORT", "http")]).is_err());
    }
}
