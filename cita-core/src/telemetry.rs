use std::fs::{create_dir_all, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OpenFlags};
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use crate::config::JournalSection;
use crate::retry::{AttemptRecord, RunReport};
use crate::workflow::Outcome;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Serialize)]
struct JournalLine<'a> {
    timestamp: DateTime<Utc>,
    attempt: u32,
    outcome: &'a Outcome,
    failure_kind: Option<crate::workflow::FailureKind>,
    delay_seconds: Option<f64>,
}

/// Durable record of every attempt: one JSON line each, plus SQLite rows for
/// attempts and finished runs.
#[derive(Debug)]
pub struct AttemptJournal {
    log: Mutex<File>,
    db_path: PathBuf,
    flags: OpenFlags,
}

impl AttemptJournal {
    pub fn new(log_path: impl AsRef<Path>, db_path: impl AsRef<Path>) -> Result<Self, TelemetryError> {
        let log_path = log_path.as_ref();
        if let Some(parent) = log_path.parent() {
            create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(log_path)?;
        let db_path = db_path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            create_dir_all(parent)?;
        }
        let journal = Self {
            log: Mutex::new(file),
            db_path,
            flags: OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        };
        journal.initialize_db()?;
        Ok(journal)
    }

    /// `None` when the journal is disabled.
    pub fn from_config(section: &JournalSection) -> Result<Option<Self>, TelemetryError> {
        if !section.enabled {
            return Ok(None);
        }
        Self::new(&section.attempt_log, &section.database).map(Some)
    }

    fn initialize_db(&self) -> Result<(), TelemetryError> {
        let conn = self.open_db()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS attempts (
                ts DATETIME DEFAULT CURRENT_TIMESTAMP,
                started_at TEXT,
                attempt INTEGER,
                outcome TEXT,
                failure_kind TEXT,
                detail TEXT,
                delay_ms INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_attempts_ts ON attempts(ts DESC);
            CREATE TABLE IF NOT EXISTS runs (
                ts DATETIME DEFAULT CURRENT_TIMESTAMP,
                started_at TEXT,
                finished_at TEXT,
                status TEXT,
                attempts INTEGER,
                max_retries INTEGER,
                waited_ms INTEGER
            );
            CREATE INDEX IF NOT EXISTS idx_runs_ts ON runs(ts DESC);",
        )?;
        Ok(())
    }

    fn open_db(&self) -> Result<Connection, TelemetryError> {
        Ok(Connection::open_with_flags(&self.db_path, self.flags)?)
    }

    pub fn record_attempt(&self, record: &AttemptRecord) -> Result<(), TelemetryError> {
        let line = JournalLine {
            timestamp: Utc::now(),
            attempt: record.ordinal,
            outcome: &record.outcome,
            failure_kind: record.outcome.failure_kind(),
            delay_seconds: record.delay_after.map(|delay| delay.as_secs_f64()),
        };
        let json = serde_json::to_string(&line)?;
        let mut log = self.log.lock().unwrap_or_else(|poisoned| {
            warn!("attempt log lock poisoned; writing anyway");
            poisoned.into_inner()
        });
        writeln!(log, "{json}")?;
        log.flush()?;
        drop(log);
        let conn = self.open_db()?;
        conn.execute(
            "INSERT INTO attempts (started_at, attempt, outcome, failure_kind, detail, delay_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.started_at.to_rfc3339(),
                i64::from(record.ordinal),
                record.outcome.label(),
                record
                    .outcome
                    .failure_kind()
                    .map(|kind| format!("{kind:?}"))
                    .unwrap_or_default(),
                record.outcome.to_string(),
                record
                    .delay_after
                    .map(|delay| delay.as_millis() as i64)
                    .unwrap_or_default(),
            ],
        )?;
        Ok(())
    }

    pub fn record_run(&self, report: &RunReport) -> Result<(), TelemetryError> {
        let status = if report.succeeded() { "success" } else { "exhausted" };
        let conn = self.open_db()?;
        conn.execute(
            "INSERT INTO runs (started_at, finished_at, status, attempts, max_retries, waited_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                report.started_at.to_rfc3339(),
                report.finished_at.to_rfc3339(),
                status,
                report.attempts.len() as i64,
                i64::from(report.max_retries),
                report.metrics.total_wait().as_millis() as i64,
            ],
        )?;
        Ok(())
    }

    pub fn database_path(&self) -> &Path {
        &self.db_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    use crate::retry::{RunMetrics, RunStatus};
    use crate::workflow::FailureReason;

    fn record(ordinal: u32, outcome: Outcome) -> AttemptRecord {
        AttemptRecord {
            ordinal,
            started_at: Utc::now(),
            outcome,
            delay_after: Some(Duration::from_millis(1_500)),
        }
    }

    #[test]
    fn attempts_are_written_to_both_sinks() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("logs/attempts.jsonl");
        let journal = AttemptJournal::new(&log, dir.path().join("logs/attempts.sqlite")).unwrap();

        journal.record_attempt(&record(1, Outcome::RateLimited)).unwrap();
        journal
            .record_attempt(&record(
                2,
                Outcome::step_failed("select_office", FailureReason::NoOfficesOffered),
            ))
            .unwrap();

        let lines: Vec<serde_json::Value> = std::fs::read_to_string(&log)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["outcome"]["kind"], "rate_limited");
        assert_eq!(lines[0]["failure_kind"], "rate_limited");
        assert_eq!(lines[1]["outcome"]["detail"]["step"], "select_office");

        let conn = Connection::open(journal.database_path()).unwrap();
        let rows: Vec<(i64, String, i64)> = conn
            .prepare("SELECT attempt, outcome, delay_ms FROM attempts ORDER BY attempt")
            .unwrap()
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(
            rows,
            vec![
                (1, "rate_limited".to_string(), 1_500),
                (2, "step_failed".to_string(), 1_500)
            ]
        );
    }

    #[test]
    fn finished_runs_are_recorded() {
        let dir = tempdir().unwrap();
        let journal =
            AttemptJournal::new(dir.path().join("a.jsonl"), dir.path().join("a.sqlite")).unwrap();
        let now = Utc::now();
        let report = RunReport {
            status: RunStatus::Exhausted,
            max_retries: 3,
            started_at: now,
            finished_at: now,
            attempts: vec![record(1, Outcome::NoTransition)],
            metrics: RunMetrics::default(),
        };
        journal.record_run(&report).unwrap();

        let conn = Connection::open(journal.database_path()).unwrap();
        let (status, max): (String, i64) = conn
            .query_row("SELECT status, max_retries FROM runs", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .unwrap();
        assert_eq!(status, "exhausted");
        assert_eq!(max, 3);
    }

    #[test]
    fn poisoned_log_lock_still_writes() {
        let dir = tempdir().unwrap();
        let log = dir.path().join("attempts.jsonl");
        let journal = AttemptJournal::new(&log, dir.path().join("attempts.sqlite")).unwrap();
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _held = journal.log.lock().unwrap();
            panic!("writer crashed while holding the log");
        }));
        assert!(journal.log.is_poisoned());

        journal.record_attempt(&record(1, Outcome::RateLimited)).unwrap();
        assert_eq!(std::fs::read_to_string(&log).unwrap().lines().count(), 1);
    }

    #[test]
    fn disabled_journal_is_absent() {
        let section = JournalSection::default();
        assert!(AttemptJournal::from_config(&section).unwrap().is_none());
    }
}
