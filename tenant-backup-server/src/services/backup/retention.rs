//! Retention: which index entries survive a policy at a given instant.

use crate::config::RetentionPolicy;
use crate::models::backup_entry::BackupEntry;
use crate::services::backup::codec::parse_datetime;
use chrono::{DateTime, Duration, Utc};
use std::cmp::Reverse;

#[derive(Debug, Default, Clone, PartialEq)]
pub struct RetentionOutcome {
    pub kept: Vec<BackupEntry>,
    pub removed: Vec<BackupEntry>,
}

pub fn parse_created_at(entry: &BackupEntry) -> Option<DateTime<Utc>> {
    parse_datetime(&entry.created_at)
}

/// Applies the age rule, then the count rule. Kept entries keep their input order.
pub fn apply_retention(
    items: Vec<BackupEntry>,
    now: DateTime<Utc>,
    policy: &RetentionPolicy,
) -> RetentionOutcome {
    if policy.is_disabled() {
        return RetentionOutcome {
            kept: items,
            removed: Vec::new(),
        };
    }

    let created: Vec<Option<DateTime<Utc>>> = items.iter().map(parse_created_at).collect();
    let mut keep = vec![true; items.len()];

    if let Some(days) = policy.max_age_days {
        let cutoff = now - Duration::days(i64::from(days));
        for (i, ts) in created.iter().enumerate() {
            // An unparseable timestamp can't be judged by age.
            if matches!(ts, Some(ts) if *ts < cutoff) {
                keep[i] = false;
            }
        }
    }

    if let Some(max) = policy.max_count {
        let mut survivors: Vec<usize> = (0..items.len()).filter(|i| keep[*i]).collect();
        if survivors.len() > max {
            // Newest first; None sorts as oldest. Stable, so ties keep index order.
            survivors.sort_by_key(|i| Reverse(created[*i]));
            for i in survivors.into_iter().skip(max) {
                keep[i] = false;
            }
        }
    }

    let mut outcome = RetentionOutcome::default();
    for (entry, keep) in items.into_iter().zip(keep) {
        if keep {
            outcome.kept.push(entry);
        } else {
            outcome.removed.push(entry);
        }
    }
    outcome
}
