use std::fs::{create_dir_all, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags};
use serde::Serialize;
use thiserror::Error;

use crate::classifier::ErrorCategory;
use crate::sqlite::{configure_connection, millis};
use crate::tier::TierKind;

use super::FinalState;

/// What the orchestrator did after a tier failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TierAction {
    Retry { delay_ms: u64 },
    Escalate,
    FailFast,
    AwaitResolution,
    Exhausted,
}

impl TierAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TierAction::Retry { .. } => "retry",
            TierAction::Escalate => "escalate",
            TierAction::FailFast => "fail_fast",
            TierAction::AwaitResolution => "await_resolution",
            TierAction::Exhausted => "exhausted",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailureRecord {
    pub timestamp: DateTime<Utc>,
    pub url: String,
    pub tier: TierKind,
    pub category: ErrorCategory,
    pub status: Option<u16>,
    pub attempt: usize,
    pub action: TierAction,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub timestamp: DateTime<Utc>,
    pub url: String,
    pub state: FinalState,
    pub tier: Option<TierKind>,
    pub category: Option<ErrorCategory>,
    pub duration_ms: i64,
    pub escalations: usize,
}

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Tier failures go to a JSON-lines log and SQLite; finished attempts go to
/// SQLite only.
#[derive(Debug)]
pub struct AttemptTelemetry {
    log: Mutex<File>,
    db_path: PathBuf,
    flags: OpenFlags,
}

impl AttemptTelemetry {
    pub fn new(
        log_path: impl AsRef<Path>,
        db_path: impl AsRef<Path>,
    ) -> Result<Self, TelemetryError> {
        let log_path = log_path.as_ref().to_path_buf();
        if let Some(parent) = log_path.parent() {
            create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            create_dir_all(parent)?;
        }
        let telemetry = Self {
            log: Mutex::new(file),
            db_path,
            flags: OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        };
        telemetry.initialize_db()?;
        Ok(telemetry)
    }

    fn initialize_db(&self) -> Result<(), TelemetryError> {
        let conn = self.open_db()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tier_failures (
                ts INTEGER NOT NULL,
                url TEXT NOT NULL,
                tier TEXT NOT NULL,
                category TEXT NOT NULL,
                status INTEGER,
                attempt INTEGER NOT NULL,
                action TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tier_failures_ts ON tier_failures(ts DESC);
            CREATE TABLE IF NOT EXISTS attempt_runs (
                ts INTEGER NOT NULL,
                url TEXT NOT NULL,
                state TEXT NOT NULL,
                tier TEXT,
                category TEXT,
                duration_ms INTEGER NOT NULL,
                escalations INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_attempt_runs_ts ON attempt_runs(ts DESC);",
        )?;
        Ok(())
    }

    fn open_db(&self) -> Result<Connection, TelemetryError> {
        let conn = Connection::open_with_flags(&self.db_path, self.flags)?;
        configure_connection(&conn)?;
        Ok(conn)
    }

    pub fn record_failure(&self, failure: &FailureRecord) -> Result<(), TelemetryError> {
        let json = serde_json::to_string(failure)?;
        if let Ok(mut guard) = self.log.lock() {
            writeln!(guard, "{json}")?;
            guard.flush()?;
        }
        let conn = self.open_db()?;
        conn.execute(
            "INSERT INTO tier_failures (ts, url, tier, category, status, attempt, action)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                millis(failure.timestamp),
                failure.url,
                failure.tier.as_str(),
                failure.category.as_str(),
                failure.status,
                failure.attempt as i64,
                failure.action.as_str(),
            ],
        )?;
        Ok(())
    }

    pub fn record_run(&self, run: &RunRecord) -> Result<(), TelemetryError> {
        let conn = self.open_db()?;
        conn.execute(
            "INSERT INTO attempt_runs (ts, url, state, tier, category, duration_ms, escalations)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                millis(run.timestamp),
                run.url,
                run.state.as_str(),
                run.tier.map(|tier| tier.as_str()),
                run.category.map(|category| category.as_str()),
                run.duration_ms,
                run.escalations as i64,
            ],
        )?;
        Ok(())
    }

    /// Failure counts per category, most frequent first.
    pub fn failure_summary(&self) -> Result<Vec<(String, i64)>, TelemetryError> {
        let conn = self.open_db()?;
        let mut stmt = conn.prepare(
            "SELECT category, COUNT(*) FROM tier_failures GROUP BY category ORDER BY COUNT(*) DESC, category",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn database_path(&self) -> &Path {
        &self.db_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn telemetry_persists_failures_and_runs() {
        let dir = tempdir().unwrap();
        let log_path = dir.path().join("logs/tier_failures.jsonl");
        let db_path = dir.path().join("data/metrics.sqlite");
        let telemetry = AttemptTelemetry::new(&log_path, &db_path).unwrap();

        for (tier, action) in [
            (TierKind::Lightweight, TierAction::Escalate),
            (TierKind::BrowserHybrid, TierAction::Escalate),
        ] {
            telemetry
                .record_failure(&FailureRecord {
                    timestamp: Utc::now(),
                    url: "https://example.com/".into(),
                    tier,
                    category: ErrorCategory::Blocked,
                    status: Some(403),
                    attempt: 1,
                    action,
                })
                .unwrap();
        }
        telemetry
            .record_run(&RunRecord {
                timestamp: Utc::now(),
                url: "https://example.com/".into(),
                state: FinalState::Success,
                tier: Some(TierKind::FullBrowser),
                category: None,
                duration_ms: 4200,
                escalations: 2,
            })
            .unwrap();

        let log = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(log.lines().count(), 2);
        assert!(log.contains(r#""action":"escalate""#));
        assert_eq!(
            telemetry.failure_summary().unwrap(),
            vec![("blocked".to_string(), 2)]
        );

        let conn = Connection::open(&db_path).unwrap();
        let runs: i64 = conn
            .query_row("SELECT COUNT(*) FROM attempt_runs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(runs, 1);
    }
}
