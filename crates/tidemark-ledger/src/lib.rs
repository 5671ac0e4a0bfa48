//! Durable run ledger: the last completion status, attempt count and
//! timestamp per named task, used by the scheduler to skip work that is
//! fresh enough. Survives process restarts.
//!
//! Backed by `SQLite` in WAL mode. Records are whole-row overwrites keyed
//! by task id; there are no partial updates, so filesystem-level atomicity
//! is all the locking this needs.
//!
//! Failure posture is asymmetric: a corrupt or missing *record* reads as
//! NotRun (fail open toward redoing work), while an unreachable *backend*
//! is an error the caller must surface, because freshness cannot be
//! decided safely without the ledger.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger unavailable: {0}")]
    Unavailable(#[from] rusqlite::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    NotRun,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::NotRun => "not_run",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl FromStr for RunStatus {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_run" => Ok(RunStatus::NotRun),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            _ => Err(()),
        }
    }
}

/// One task's last-run record. `attempts` counts passes in the most recent
/// run; `note` is free-text diagnostics (failing unit ids, error summary).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRecord {
    pub status: RunStatus,
    pub attempts: u32,
    pub last_run_at: Option<NaiveDateTime>,
    pub note: String,
}

impl Default for LedgerRecord {
    fn default() -> Self {
        Self {
            status: RunStatus::NotRun,
            attempts: 0,
            last_run_at: None,
            note: String::new(),
        }
    }
}

impl LedgerRecord {
    pub fn completed(attempts: u32, now: NaiveDateTime) -> Self {
        Self {
            status: RunStatus::Completed,
            attempts,
            last_run_at: Some(now),
            note: String::new(),
        }
    }

    pub fn failed(attempts: u32, now: NaiveDateTime, note: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Failed,
            attempts,
            last_run_at: Some(now),
            note: note.into(),
        }
    }

    /// A Completed record is trusted as "skip this cycle" only while it is
    /// younger than `threshold`; after that the task re-enters the pool.
    pub fn is_fresh(&self, now: NaiveDateTime, threshold: Duration) -> bool {
        if self.status != RunStatus::Completed {
            return false;
        }
        match self.last_run_at {
            None => false,
            // A record from the future (clock skew) proves nothing.
            Some(at) => match (now - at).to_std() {
                Ok(age) => age < threshold,
                Err(_) => false,
            },
        }
    }
}

#[derive(Clone)]
pub struct RunLedger {
    db_path: PathBuf,
}

impl RunLedger {
    /// Open (and initialize if needed) a ledger at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let db_path = path.as_ref().to_path_buf();
        let conn = Connection::open(&db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        conn.busy_timeout(std::time::Duration::from_millis(5000))?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS runs (
              task TEXT PRIMARY KEY,
              status TEXT NOT NULL,
              attempts INTEGER NOT NULL,
              last_run_at TEXT,
              note TEXT NOT NULL DEFAULT ''
            );
            "#,
        )?;
        Ok(Self { db_path })
    }

    fn conn(&self) -> Result<Connection, LedgerError> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(std::time::Duration::from_millis(5000))?;
        Ok(conn)
    }

    /// Load a task's record; absent or unparsable rows read as NotRun.
    pub fn load(&self, task: &str) -> Result<LedgerRecord, LedgerError> {
        let conn = self.conn()?;
        let row: Option<(String, u32, Option<String>, String)> = conn
            .query_row(
                "SELECT status, attempts, last_run_at, note FROM runs WHERE task = ?1",
                params![task],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .optional()?;
        Ok(match row {
            None => LedgerRecord::default(),
            Some((status, attempts, last_run_at, note)) => decode_record(task, &status, attempts, last_run_at, note),
        })
    }

    /// Whole-record overwrite.
    pub fn save(&self, task: &str, record: &LedgerRecord) -> Result<(), LedgerError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO runs (task, status, attempts, last_run_at, note)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                task,
                record.status.as_str(),
                record.attempts,
                record.last_run_at.map(encode_time),
                record.note,
            ],
        )?;
        Ok(())
    }

    /// Remove a task's record entirely (operator reset).
    pub fn reset(&self, task: &str) -> Result<bool, LedgerError> {
        let conn = self.conn()?;
        let n = conn.execute("DELETE FROM runs WHERE task = ?1", params![task])?;
        Ok(n > 0)
    }

    /// All records, task-ordered, for operator listings.
    pub fn all(&self) -> Result<Vec<(String, LedgerRecord)>, LedgerError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT task, status, attempts, last_run_at, note FROM runs ORDER BY task",
        )?;
        let rows = stmt.query_map([], |r| {
            let task: String = r.get(0)?;
            let status: String = r.get(1)?;
            let attempts: u32 = r.get(2)?;
            let last_run_at: Option<String> = r.get(3)?;
            let note: String = r.get(4)?;
            Ok((task, status, attempts, last_run_at, note))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (task, status, attempts, last_run_at, note) = row?;
            let record = decode_record(&task, &status, attempts, last_run_at, note);
            out.push((task, record));
        }
        Ok(out)
    }
}

fn encode_time(t: NaiveDateTime) -> String {
    DateTime::<Utc>::from_naive_utc_and_offset(t, Utc).to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn decode_record(
    task: &str,
    status: &str,
    attempts: u32,
    last_run_at: Option<String>,
    note: String,
) -> LedgerRecord {
    let parsed_status = status.parse::<RunStatus>().unwrap_or_else(|_| {
        warn!(task, status, "unknown ledger status; treating as not_run");
        RunStatus::NotRun
    });
    let parsed_time = last_run_at.as_deref().and_then(|raw| {
        match DateTime::parse_from_rfc3339(raw) {
            Ok(t) => Some(t.naive_utc()),
            Err(err) => {
                warn!(task, raw, error = %err, "unparsable ledger timestamp; treating as not_run");
                None
            }
        }
    });
    if parsed_status != RunStatus::NotRun && parsed_time.is_none() && last_run_at.is_some() {
        // A Completed record without a readable timestamp cannot prove
        // freshness; fail open.
        return LedgerRecord {
            status: RunStatus::NotRun,
            attempts,
            last_run_at: None,
            note,
        };
    }
    LedgerRecord {
        status: parsed_status,
        attempts,
        last_run_at: parsed_time,
        note,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ledger() -> (TempDir, RunLedger) {
        let dir = TempDir::new().unwrap();
        let ledger = RunLedger::open(dir.path().join("ledger.sqlite")).unwrap();
        (dir, ledger)
    }

    fn now() -> NaiveDateTime {
        chrono::NaiveDate::from_ymd_opt(2023, 8, 15)
            .unwrap()
            .and_hms_opt(12, 0, 0)
            .unwrap()
    }

    #[test]
    fn absent_task_reads_as_not_run() {
        let (_dir, ledger) = ledger();
        let record = ledger.load("cninfo:quotes").unwrap();
        assert_eq!(record, LedgerRecord::default());
    }

    #[test]
    fn save_and_load_round_trips() {
        let (_dir, ledger) = ledger();
        let record = LedgerRecord::failed(3, now(), "units: quotes:000001:20230815");
        ledger.save("cninfo:quotes", &record).unwrap();
        let loaded = ledger.load("cninfo:quotes").unwrap();
        assert_eq!(loaded, record);
    }

    #[test]
    fn overwrite_replaces_whole_record() {
        let (_dir, ledger) = ledger();
        ledger
            .save("t", &LedgerRecord::failed(2, now(), "boom"))
            .unwrap();
        ledger.save("t", &LedgerRecord::completed(3, now())).unwrap();
        let loaded = ledger.load("t").unwrap();
        assert_eq!(loaded.status, RunStatus::Completed);
        assert_eq!(loaded.attempts, 3);
        assert!(loaded.note.is_empty());
    }

    #[test]
    fn freshness_threshold() {
        let threshold = Duration::from_secs(12 * 3600);
        let one_hour_old = LedgerRecord::completed(1, now() - chrono::Duration::hours(1));
        assert!(one_hour_old.is_fresh(now(), threshold));
        let thirteen_hours_old = LedgerRecord::completed(1, now() - chrono::Duration::hours(13));
        assert!(!thirteen_hours_old.is_fresh(now(), threshold));
        let failed = LedgerRecord::failed(1, now(), "");
        assert!(!failed.is_fresh(now(), threshold));
        assert!(!LedgerRecord::default().is_fresh(now(), threshold));
    }

    #[test]
    fn unknown_status_fails_open() {
        let (dir, ledger) = ledger();
        let conn = Connection::open(dir.path().join("ledger.sqlite")).unwrap();
        conn.execute(
            "INSERT INTO runs (task, status, attempts, last_run_at, note)
             VALUES ('t', 'garbled', 4, NULL, '')",
            [],
        )
        .unwrap();
        let record = ledger.load("t").unwrap();
        assert_eq!(record.status, RunStatus::NotRun);
    }

    #[test]
    fn corrupt_timestamp_fails_open() {
        let (dir, ledger) = ledger();
        let conn = Connection::open(dir.path().join("ledger.sqlite")).unwrap();
        conn.execute(
            "INSERT INTO runs (task, status, attempts, last_run_at, note)
             VALUES ('t', 'completed', 4, 'yesterday-ish', '')",
            [],
        )
        .unwrap();
        let record = ledger.load("t").unwrap();
        assert_eq!(record.status, RunStatus::NotRun);
        assert!(!record.is_fresh(now(), Duration::from_secs(12 * 3600)));
    }

    #[test]
    fn records_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.sqlite");
        {
            let ledger = RunLedger::open(&path).unwrap();
            ledger.save("t", &LedgerRecord::completed(1, now())).unwrap();
        }
        let ledger = RunLedger::open(&path).unwrap();
        assert_eq!(ledger.load("t").unwrap().status, RunStatus::Completed);
    }

    #[test]
    fn all_lists_in_task_order() {
        let (_dir, ledger) = ledger();
        ledger.save("b", &LedgerRecord::completed(1, now())).unwrap();
        ledger.save("a", &LedgerRecord::failed(2, now(), "x")).unwrap();
        let all = ledger.all().unwrap();
        assert_eq!(
            all.iter().map(|(t, _)| t.as_str()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
    }

    #[test]
    fn reset_removes_record() {
        let (_dir, ledger) = ledger();
        ledger.save("t", &LedgerRecord::completed(1, now())).unwrap();
        assert!(ledger.reset("t").unwrap());
        assert!(!ledger.reset("t").unwrap());
        assert_eq!(ledger.load("t").unwrap(), LedgerRecord::default());
    }
}
