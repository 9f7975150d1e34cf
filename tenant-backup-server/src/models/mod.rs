pub mod audit_log;
pub mod backup_entry;
pub mod backup_job;
pub mod manifest;
pub mod tenant;
