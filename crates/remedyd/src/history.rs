//! Attempt History Store - append-only SQLite record of every attempt.
//!
//! Source of truth for success-rate statistics and escalation history. No
//! attempt row is ever mutated; only retention pruning (an administrative
//! operation, restricted to faults already in a terminal state) removes
//! rows. Tolerates interleaved appends from fault cycles running in
//! parallel through a single serialized connection.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use remedy_common::{AttemptOutcome, FaultCategory, FaultKey, HealingAttempt, HealingStats};
use rusqlite::{params, Connection};
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

/// Default history database path
pub const HISTORY_DB_PATH: &str = "/var/lib/remedy/history.db";

/// Append-only attempt store.
pub struct AttemptHistory {
    conn: Mutex<Connection>,
}

impl AttemptHistory {
    /// Open (and migrate) the on-disk store.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open history db at {}", path.display()))?;
        Self::init_schema(&conn)?;
        info!("Attempt history store ready: {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS attempts (
                id          TEXT PRIMARY KEY,
                category    TEXT NOT NULL,
                resource    TEXT NOT NULL,
                action      TEXT NOT NULL,
                sequence    INTEGER NOT NULL,
                started_at  INTEGER NOT NULL,
                ended_at    INTEGER NOT NULL,
                outcome     TEXT NOT NULL,
                diagnostic  TEXT NOT NULL DEFAULT ''
            );
            CREATE INDEX IF NOT EXISTS idx_attempts_fault
                ON attempts(category, resource, started_at);
            CREATE TABLE IF NOT EXISTS escalations (
                category     TEXT NOT NULL,
                resource     TEXT NOT NULL,
                attempts     INTEGER NOT NULL,
                escalated_at INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_escalations_time
                ON escalations(escalated_at);",
        )
        .context("Failed to initialize history schema")?;
        Ok(())
    }

    /// Record one finalized attempt. Attempts are immutable once written.
    pub async fn append(&self, attempt: &HealingAttempt) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO attempts
                (id, category, resource, action, sequence, started_at, ended_at, outcome, diagnostic)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                attempt.id.to_string(),
                attempt.key.category.as_str(),
                attempt.key.resource,
                attempt.action,
                attempt.sequence,
                attempt.started_at.timestamp(),
                attempt.ended_at.timestamp(),
                attempt.outcome.as_str(),
                attempt.diagnostic,
            ],
        )
        .context("Failed to append healing attempt")?;
        Ok(())
    }

    /// All attempts for one fault, oldest first.
    pub async fn list_by_fault(&self, key: &FaultKey) -> Result<Vec<HealingAttempt>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, category, resource, action, sequence, started_at, ended_at, outcome, diagnostic
             FROM attempts
             WHERE category = ?1 AND resource = ?2
             ORDER BY started_at ASC, sequence ASC",
        )?;
        let rows = stmt.query_map(params![key.category.as_str(), key.resource], row_to_attempt)?;

        let mut attempts = Vec::new();
        for row in rows {
            attempts.push(row?);
        }
        Ok(attempts)
    }

    /// Record an escalation for `recently_escalated` and stats queries.
    pub async fn record_escalation(&self, key: &FaultKey, attempts: u32) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO escalations (category, resource, attempts, escalated_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                key.category.as_str(),
                key.resource,
                attempts,
                Utc::now().timestamp()
            ],
        )
        .context("Failed to record escalation")?;
        Ok(())
    }

    /// Most recent escalations, newest first.
    pub async fn recently_escalated(&self, limit: usize) -> Result<Vec<(FaultKey, DateTime<Utc>)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT category, resource, escalated_at
             FROM escalations
             ORDER BY escalated_at DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            let category: String = row.get(0)?;
            let resource: String = row.get(1)?;
            let at: i64 = row.get(2)?;
            Ok((category, resource, at))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (category, resource, at) = row?;
            let Some(category) = FaultCategory::parse(&category) else {
                continue;
            };
            out.push((
                FaultKey::new(category, resource),
                Utc.timestamp_opt(at, 0).single().unwrap_or_else(Utc::now),
            ));
        }
        Ok(out)
    }

    /// Windowed success-rate statistics.
    pub async fn stats(&self, window: chrono::Duration) -> Result<HealingStats> {
        let cutoff = (Utc::now() - window).timestamp();
        let conn = self.conn.lock().await;

        let (total, success): (u64, u64) = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN outcome = 'success' THEN 1 ELSE 0 END), 0)
             FROM attempts WHERE started_at >= ?1",
            params![cutoff],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        let escalated: u64 = conn.query_row(
            "SELECT COUNT(*) FROM escalations WHERE escalated_at >= ?1",
            params![cutoff],
            |row| row.get(0),
        )?;

        let rate = if total > 0 {
            success as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        Ok(HealingStats {
            window_secs: window.num_seconds().max(0) as u64,
            total_attempts: total,
            success_count: success,
            failure_count: total - success,
            escalated_count: escalated,
            success_rate_percent: (rate * 10.0).round() / 10.0,
        })
    }

    /// Retention pruning: remove attempt rows older than `max_age`, but only
    /// for the given terminal faults. Returns the number of rows removed.
    pub async fn prune(&self, max_age: chrono::Duration, terminal: &[FaultKey]) -> Result<usize> {
        if terminal.is_empty() {
            return Ok(0);
        }
        let cutoff = (Utc::now() - max_age).timestamp();
        let conn = self.conn.lock().await;

        let mut removed = 0;
        for key in terminal {
            removed += conn.execute(
                "DELETE FROM attempts
                 WHERE category = ?1 AND resource = ?2 AND ended_at < ?3",
                params![key.category.as_str(), key.resource, cutoff],
            )?;
        }
        if removed > 0 {
            info!("Retention pruning removed {} attempt rows", removed);
        }
        Ok(removed)
    }
}

fn row_to_attempt(row: &rusqlite::Row<'_>) -> rusqlite::Result<HealingAttempt> {
    let id: String = row.get(0)?;
    let category: String = row.get(1)?;
    let resource: String = row.get(2)?;
    let action: String = row.get(3)?;
    let sequence: u32 = row.get(4)?;
    let started_at: i64 = row.get(5)?;
    let ended_at: i64 = row.get(6)?;
    let outcome: String = row.get(7)?;
    let diagnostic: String = row.get(8)?;

    Ok(HealingAttempt {
        id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::new_v4()),
        key: FaultKey::new(
            FaultCategory::parse(&category).unwrap_or(FaultCategory::Custom),
            resource,
        ),
        action,
        sequence,
        started_at: Utc
            .timestamp_opt(started_at, 0)
            .single()
            .unwrap_or_else(Utc::now),
        ended_at: Utc
            .timestamp_opt(ended_at, 0)
            .single()
            .unwrap_or_else(Utc::now),
        outcome: AttemptOutcome::parse(&outcome).unwrap_or(AttemptOutcome::Failed),
        diagnostic,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attempt(key: &FaultKey, sequence: u32, outcome: AttemptOutcome) -> HealingAttempt {
        HealingAttempt::new(
            key.clone(),
            "restart-service",
            sequence,
            Utc::now(),
            outcome,
            "test".to_string(),
        )
    }

    #[tokio::test]
    async fn test_append_and_list() {
        let store = AttemptHistory::open_in_memory().unwrap();
        let key = FaultKey::new(FaultCategory::ServiceDown, "nginx");

        store
            .append(&attempt(&key, 1, AttemptOutcome::Failed))
            .await
            .unwrap();
        store
            .append(&attempt(&key, 2, AttemptOutcome::Success))
            .await
            .unwrap();

        let attempts = store.list_by_fault(&key).await.unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].sequence, 1);
        assert_eq!(attempts[1].outcome, AttemptOutcome::Success);

        let other = FaultKey::new(FaultCategory::ServiceDown, "postgres");
        assert!(store.list_by_fault(&other).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stats_window() {
        let store = AttemptHistory::open_in_memory().unwrap();
        let key = FaultKey::new(FaultCategory::ContainerCrash, "cache-node-3");

        store
            .append(&attempt(&key, 1, AttemptOutcome::Failed))
            .await
            .unwrap();
        store
            .append(&attempt(&key, 2, AttemptOutcome::TimedOut))
            .await
            .unwrap();
        store
            .append(&attempt(&key, 3, AttemptOutcome::Success))
            .await
            .unwrap();
        store.record_escalation(&key, 3).await.unwrap();

        let stats = store.stats(chrono::Duration::hours(1)).await.unwrap();
        assert_eq!(stats.total_attempts, 3);
        assert_eq!(stats.success_count, 1);
        assert_eq!(stats.failure_count, 2);
        assert_eq!(stats.escalated_count, 1);
        assert!((stats.success_rate_percent - 33.3).abs() < 0.1);
    }

    #[tokio::test]
    async fn test_stats_empty_window() {
        let store = AttemptHistory::open_in_memory().unwrap();
        let stats = store.stats(chrono::Duration::hours(1)).await.unwrap();
        assert_eq!(stats.total_attempts, 0);
        assert_eq!(stats.success_rate_percent, 0.0);
    }

    #[tokio::test]
    async fn test_recently_escalated_ordering() {
        let store = AttemptHistory::open_in_memory().unwrap();
        let a = FaultKey::new(FaultCategory::ServiceDown, "a");
        let b = FaultKey::new(FaultCategory::ServiceDown, "b");
        store.record_escalation(&a, 3).await.unwrap();
        store.record_escalation(&b, 3).await.unwrap();

        let recent = store.recently_escalated(10).await.unwrap();
        assert_eq!(recent.len(), 2);
        let limited = store.recently_escalated(1).await.unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn test_prune_only_touches_given_faults() {
        let store = AttemptHistory::open_in_memory().unwrap();
        let healed = FaultKey::new(FaultCategory::ServiceDown, "nginx");
        let open = FaultKey::new(FaultCategory::ServiceDown, "postgres");

        let mut old = attempt(&healed, 1, AttemptOutcome::Success);
        old.ended_at = Utc::now() - chrono::Duration::days(60);
        store.append(&old).await.unwrap();

        let mut old_open = attempt(&open, 1, AttemptOutcome::Failed);
        old_open.ended_at = Utc::now() - chrono::Duration::days(60);
        store.append(&old_open).await.unwrap();

        // Only the healed fault is offered for pruning
        let removed = store
            .prune(chrono::Duration::days(30), &[healed.clone()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert!(store.list_by_fault(&healed).await.unwrap().is_empty());
        assert_eq!(store.list_by_fault(&open).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_on_disk_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.db");
        let key = FaultKey::new(FaultCategory::NetworkBroken, "gateway");

        {
            let store = AttemptHistory::open(&path).unwrap();
            store
                .append(&attempt(&key, 1, AttemptOutcome::Success))
                .await
                .unwrap();
        }

        let store = AttemptHistory::open(&path).unwrap();
        let attempts = store.list_by_fault(&key).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].action, "restart-service");
    }
}
