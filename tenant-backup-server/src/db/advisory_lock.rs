//! Cross-process advisory lock.
//!
//! SQLite has no `pg_try_advisory_lock`, so a lock is a row in `advisory_locks`
//! keyed by an integer. The database write lock serializes competing acquirers
//! across processes. A lease older than `stale_after` belongs to a holder that
//! died without releasing and may be taken over.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::time::Duration;

pub fn try_acquire(
    conn: &mut Connection,
    key: i64,
    holder: &str,
    stale_after: Duration,
) -> anyhow::Result<bool> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let current: Option<(String, String)> = tx
        .query_row(
            "SELECT holder, acquired_at FROM advisory_locks WHERE key = ?",
            params![key],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    let now = Utc::now();
    let acquired = match current {
        None => true,
        Some((owner, _)) if owner == holder => true,
        Some((owner, acquired_at)) => {
            let stale = DateTime::parse_from_rfc3339(&acquired_at)
                .map(|t| now.signed_duration_since(t.with_timezone(&Utc)))
                .map(|age| age.to_std().map(|age| age >= stale_after).unwrap_or(false))
                .unwrap_or(true);
            if stale {
                tracing::warn!(key, previous_holder = %owner, "Taking over stale advisory lock");
            }
            stale
        }
    };

    if acquired {
        tx.execute(
            "INSERT INTO advisory_locks (key, holder, acquired_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET holder = excluded.holder, acquired_at = excluded.acquired_at",
            params![key, holder, now.to_rfc3339()],
        )?;
    }
    tx.commit()?;
    Ok(acquired)
}

pub fn release(conn: &Connection, key: i64, holder: &str) -> anyhow::Result<bool> {
    let changes = conn.execute(
        "DELETE FROM advisory_locks WHERE key = ? AND holder = ?",
        params![key, holder],
    )?;
    Ok(changes > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestEnv;

    #[test]
    fn test_second_holder_is_refused_until_release() {
        let env = TestEnv::new();
        let mut conn = env.pool.get().unwrap();
        let hour = Duration::from_secs(3600);

        assert!(try_acquire(&mut conn, 7, "replica-a", hour).unwrap());
        assert!(!try_acquire(&mut conn, 7, "replica-b", hour).unwrap());
        // Other keys are independent
        assert!(try_acquire(&mut conn, 8, "replica-b", hour).unwrap());

        assert!(!release(&conn, 7, "replica-b").unwrap());
        assert!(release(&conn, 7, "replica-a").unwrap());
        assert!(try_acquire(&mut conn, 7, "replica-b", hour).unwrap());
    }

    #[test]
    fn test_reacquire_by_same_holder() {
        let env = TestEnv::new();
        let mut conn = env.pool.get().unwrap();
        let hour = Duration::from_secs(3600);
        assert!(try_acquire(&mut conn, 1, "replica-a", hour).unwrap());
        assert!(try_acquire(&mut conn, 1, "replica-a", hour).unwrap());
    }

    #[test]
    fn test_stale_lease_is_taken_over() {
        let env = TestEnv::new();
        let mut conn = env.pool.get().unwrap();
        let old = (Utc::now() - chrono::Duration::hours(3)).to_rfc3339();
        conn.execute(
            "INSERT INTO advisory_locks (key, holder, acquired_at) VALUES (5, 'crashed', ?)",
            params![old],
        )
        .unwrap();

        assert!(try_acquire(&mut conn, 5, "replica-a", Duration::from_secs(3600)).unwrap());
        let holder: String = conn
            .query_row("SELECT holder FROM advisory_locks WHERE key = 5", [], |r| r.get(0))
            .unwrap();
        assert_eq!(holder, "replica-a");
    }
}
