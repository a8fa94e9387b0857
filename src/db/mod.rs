use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Arc, Mutex, MutexGuard};

pub mod models;
use models::*;

use crate::model::correction::CorrectionRecord;
use crate::model::{BaselineSelection, CorrectionTable, ResultRecord, ResultSet, RunDiagnostics};

/// Thread-safe SQLite connection (single connection with mutex)
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the SQLite database at the given path
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection mutex poisoned"))
    }

    /// Run schema migrations (idempotent)
    fn run_migrations(&self) -> Result<()> {
        self.conn()?.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    // ── Results ──────────────────────────────────────────────────────────────

    /// Insert cleaned results in one transaction, optionally replacing all
    /// existing rows. Returns the number of rows inserted.
    pub fn insert_results(&self, records: &[ResultRecord], replace: bool) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        if replace {
            tx.execute("DELETE FROM race_results", [])?;
        }
        {
            let mut stmt = tx.prepare(
                "INSERT INTO race_results (venue, gender, athlete_key, finish_seconds, event_date)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for r in records {
                stmt.execute(params![r.venue, r.gender, r.athlete_key, r.finish_seconds, r.event_date])?;
            }
        }
        tx.commit()?;
        Ok(records.len())
    }

    /// All stored results as one analysis input.
    pub fn load_results(&self) -> Result<ResultSet> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT venue, gender, athlete_key, finish_seconds, event_date
             FROM race_results ORDER BY id",
        )?;
        let rows = stmt
            .query_map([], map_result)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(ResultSet::new(rows))
    }

    /// One athlete's results, ordered by event date.
    pub fn athlete_results(&self, athlete_key: &str) -> Result<Vec<ResultRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT venue, gender, athlete_key, finish_seconds, event_date
             FROM race_results WHERE athlete_key = ?1
             ORDER BY event_date, venue",
        )?;
        let rows = stmt
            .query_map(params![athlete_key], map_result)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── Corrections ──────────────────────────────────────────────────────────

    /// Publish a new correction table. Corrections, baselines and the run
    /// record are replaced in one transaction so readers never see a
    /// partial table. Returns the run id.
    pub fn replace_corrections(
        &self,
        table: &CorrectionTable,
        diagnostics: &RunDiagnostics,
    ) -> Result<i64> {
        let diagnostics_json = serde_json::to_string(diagnostics)?;
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM corrections", [])?;
        tx.execute("DELETE FROM correction_baselines", [])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO corrections (venue, gender, correction_seconds, ci_low, ci_high,
                                          p_value, sample_size, strategy)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8)",
            )?;
            for r in table.records() {
                stmt.execute(params![
                    r.venue,
                    r.gender,
                    r.correction_seconds,
                    r.ci_low,
                    r.ci_high,
                    r.p_value,
                    r.sample_size as i64,
                    r.strategy,
                ])?;
            }
            let mut stmt = tx.prepare(
                "INSERT INTO correction_baselines (gender, venue, median_seconds, position, candidates, warning)
                 VALUES (?1,?2,?3,?4,?5,?6)",
            )?;
            for b in table.baselines() {
                stmt.execute(params![
                    b.gender,
                    b.venue,
                    b.median_seconds,
                    b.position as i64,
                    b.candidates as i64,
                    b.warning,
                ])?;
            }
        }
        tx.execute(
            "INSERT INTO model_runs (created_at, baseline_venue, diagnostics_json) VALUES (?1,?2,?3)",
            params![Utc::now(), table.baseline_venue(), diagnostics_json],
        )?;
        let run_id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(run_id)
    }

    /// The currently published table (empty before the first build).
    ///
    /// Both tables are read inside one transaction so a concurrent
    /// `replace_corrections` from another connection is seen whole or not at all.
    pub fn load_corrections(&self) -> Result<CorrectionTable> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let records = tx
            .prepare(
                "SELECT venue, gender, correction_seconds, ci_low, ci_high, p_value, sample_size, strategy
                 FROM corrections",
            )?
            .query_map([], map_correction)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        let baselines = tx
            .prepare(
                "SELECT gender, venue, median_seconds, position, candidates, warning
                 FROM correction_baselines",
            )?
            .query_map([], map_baseline)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        tx.commit()?;
        Ok(CorrectionTable::new(records, baselines))
    }

    // ── Runs ─────────────────────────────────────────────────────────────────

    pub fn latest_run(&self) -> Result<Option<StoredRun>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT id, created_at, baseline_venue, diagnostics_json
                 FROM model_runs ORDER BY id DESC LIMIT 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, DateTime<Utc>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;
        row.map(|(id, created_at, baseline_venue, json)| -> Result<StoredRun> {
            Ok(StoredRun {
                id,
                created_at,
                baseline_venue,
                diagnostics: serde_json::from_str(&json)?,
            })
        })
        .transpose()
    }

    pub fn summary(&self) -> Result<DbSummary> {
        let conn = self.conn()?;
        let count = |sql: &str| -> rusqlite::Result<i64> { conn.query_row(sql, [], |r| r.get(0)) };
        Ok(DbSummary {
            results: count("SELECT COUNT(*) FROM race_results")?,
            venues: count("SELECT COUNT(DISTINCT venue) FROM race_results")?,
            corrections: count("SELECT COUNT(*) FROM corrections")?,
            runs: count("SELECT COUNT(*) FROM model_runs")?,
        })
    }
}

// ── SQL helpers ────────────────────────────────────────────────────────────────

fn map_result(row: &rusqlite::Row) -> rusqlite::Result<ResultRecord> {
    Ok(ResultRecord {
        venue: row.get(0)?,
        gender: row.get(1)?,
        athlete_key: row.get(2)?,
        finish_seconds: row.get(3)?,
        event_date: row.get(4)?,
    })
}

fn map_correction(row: &rusqlite::Row) -> rusqlite::Result<CorrectionRecord> {
    Ok(CorrectionRecord {
        venue: row.get(0)?,
        gender: row.get(1)?,
        correction_seconds: row.get(2)?,
        ci_low: row.get(3)?,
        ci_high: row.get(4)?,
        p_value: row.get(5)?,
        sample_size: row.get::<_, i64>(6)? as usize,
        strategy: row.get(7)?,
    })
}

fn map_baseline(row: &rusqlite::Row) -> rusqlite::Result<BaselineSelection> {
    Ok(BaselineSelection {
        gender: row.get(0)?,
        venue: row.get(1)?,
        median_seconds: row.get(2)?,
        position: row.get::<_, i64>(3)? as usize,
        candidates: row.get::<_, i64>(4)? as usize,
        warning: row.get(5)?,
    })
}

/// SQLite schema (idempotent CREATE IF NOT EXISTS)
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS race_results (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    venue          TEXT    NOT NULL,
    gender         TEXT    NOT NULL CHECK (gender IN ('M', 'W')),
    athlete_key    TEXT    NOT NULL,
    finish_seconds REAL    NOT NULL,
    event_date     TEXT
);

CREATE TABLE IF NOT EXISTS corrections (
    venue              TEXT    NOT NULL,
    gender             TEXT    NOT NULL,
    correction_seconds REAL    NOT NULL,
    ci_low             REAL,
    ci_high            REAL,
    p_value            REAL,
    sample_size        INTEGER NOT NULL,
    strategy           TEXT    NOT NULL,
    PRIMARY KEY (venue, gender)
);

CREATE TABLE IF NOT EXISTS correction_baselines (
    gender         TEXT    PRIMARY KEY,
    venue          TEXT    NOT NULL,
    median_seconds REAL    NOT NULL,
    position       INTEGER NOT NULL,
    candidates     INTEGER NOT NULL,
    warning        TEXT
);

CREATE TABLE IF NOT EXISTS model_runs (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    created_at       TEXT    NOT NULL,
    baseline_venue   TEXT,
    diagnostics_json TEXT    NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_results_venue_gender ON race_results(venue, gender);
CREATE INDEX IF NOT EXISTS idx_results_athlete ON race_results(athlete_key);
"#;
