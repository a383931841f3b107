use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::de::DeserializeOwned;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{CoreError, Result};

pub mod lock;
pub mod models;
use models::*;

/// How long a connection waits on another process's write lock before the
/// statement fails with `SQLITE_BUSY`. Lease contention is then retried by
/// `RowLock::acquire` with its own backoff.
pub const BUSY_TIMEOUT: std::time::Duration = std::time::Duration::from_millis(100);

/// Thread-safe SQLite store (single connection with mutex).
///
/// This is the only persistence the core talks to. Every component receives a
/// clone at construction; tests open an isolated in-memory instance each.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open (or create) the SQLite database at the given path
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Self::from_connection(conn)
    }

    /// Private in-memory database; nothing is shared between instances
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Run schema migrations (idempotent)
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn()?;
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| CoreError::LockPoisoned)
    }

    // ── Predictions ──────────────────────────────────────────────────────────

    /// Insert a new prediction record, returning its id
    pub fn insert_prediction(&self, rec: &PredictionRecord) -> Result<i64> {
        let method_scores = serde_json::to_string(&rec.method_scores)?;
        let odds = serde_json::to_string(&rec.odds)?;
        let temporal = serde_json::to_string(&rec.temporal_events)?;
        let decay = serde_json::to_string(&rec.decay)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO predictions (
                event_id, sport, league, home_team, away_team, scheduled_at,
                raw_probability, probability, side, side_probability, confidence,
                edge, break_even, american_odds, decimal_odds,
                method_scores, odds_snapshot, temporal_events, decay,
                status, created_at, resolved_at
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22)",
            params![
                rec.event_id,
                rec.sport,
                rec.league,
                rec.home_team,
                rec.away_team,
                rec.scheduled_at,
                rec.raw_probability,
                rec.probability,
                rec.side.as_str(),
                rec.side_probability,
                rec.confidence,
                rec.edge,
                rec.break_even,
                rec.american_odds,
                rec.decimal_odds,
                method_scores,
                odds,
                temporal,
                decay,
                rec.status.as_str(),
                rec.created_at,
                rec.resolved_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_prediction(&self, id: i64) -> Result<Option<PredictionRecord>> {
        let conn = self.conn()?;
        let rec = conn
            .query_row(
                &format!("SELECT {} FROM predictions WHERE id=?1", PREDICTION_COLUMNS),
                params![id],
                map_prediction,
            )
            .optional()?;
        Ok(rec)
    }

    /// Pending predictions, oldest first, optionally for a single sport
    pub fn list_pending_predictions(&self, sport: Option<&str>) -> Result<Vec<PredictionRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM predictions
             WHERE status='pending' AND (?1 IS NULL OR sport=?1)
             ORDER BY created_at ASC, id ASC",
            PREDICTION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![sport], map_prediction)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// List predictions (paginated, newest first), optionally for one sport
    pub fn list_predictions(
        &self,
        sport: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<PredictionRecord>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM predictions WHERE (?1 IS NULL OR sport=?1)
             ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3",
            PREDICTION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![sport, limit, offset], map_prediction)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Move a pending prediction to a terminal status.
    ///
    /// Returns `false` when the record was already terminal (no re-opening,
    /// no second transition).
    pub fn resolve_prediction(&self, id: i64, status: PredictionStatus) -> Result<bool> {
        if !status.is_terminal() {
            return Err(CoreError::DataIntegrity(format!(
                "prediction {} cannot transition back to pending",
                id
            )));
        }
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE predictions SET status=?1, resolved_at=?2 WHERE id=?3 AND status='pending'",
            params![status.as_str(), Utc::now(), id],
        )?;
        Ok(changed == 1)
    }

    pub fn prediction_stats(&self, sport: Option<&str>) -> Result<PredictionStats> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM predictions
             WHERE (?1 IS NULL OR sport=?1) GROUP BY status",
        )?;
        let mut stats = PredictionStats::default();
        let rows = stmt.query_map(params![sport], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        for row in rows {
            let (status, count) = row?;
            stats.total += count;
            match status.as_str() {
                "pending" => stats.pending += count,
                "correct" => stats.correct += count,
                "incorrect" => stats.incorrect += count,
                "partial" => stats.partial += count,
                _ => {}
            }
        }
        Ok(stats)
    }

    // ── Method weights ────────────────────────────────────────────────────────

    pub fn load_method_weights(&self, sport: &str) -> Result<Vec<MethodWeight>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT sport, method, weight, correct, total, avg_accuracy, updated_at
             FROM method_weights WHERE sport=?1 ORDER BY method",
        )?;
        let rows = stmt
            .query_map(params![sport], map_method_weight)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn has_applied_outcome(&self, prediction_id: i64) -> Result<bool> {
        let conn = self.conn()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT prediction_id FROM applied_outcomes WHERE prediction_id=?1",
                params![prediction_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Write a sport's full weight table and mark the outcome as applied, in
    /// one transaction. Returns `false` (and writes nothing) if the outcome
    /// for this prediction was applied before.
    pub fn commit_weight_update(&self, prediction_id: i64, rows: &[MethodWeight]) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO applied_outcomes (prediction_id, applied_at) VALUES (?1, ?2)",
            params![prediction_id, Utc::now()],
        )?;
        if inserted == 0 {
            return Ok(false);
        }
        for w in rows {
            tx.execute(
                "INSERT INTO method_weights (sport, method, weight, correct, total, avg_accuracy, updated_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7)
                 ON CONFLICT(sport, method) DO UPDATE SET
                    weight=excluded.weight,
                    correct=excluded.correct,
                    total=excluded.total,
                    avg_accuracy=excluded.avg_accuracy,
                    updated_at=excluded.updated_at",
                params![
                    w.sport,
                    w.method,
                    w.weight,
                    w.correct,
                    w.total,
                    w.avg_accuracy,
                    w.updated_at
                ],
            )?;
        }
        tx.commit()?;
        Ok(true)
    }

    // ── Odds ─────────────────────────────────────────────────────────────────

    /// Append a quote. Quotes are never updated in place.
    pub fn insert_quote(&self, quote: &OddsQuote) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO odds_quotes (
                event_id, source, home_moneyline, away_moneyline, spread, total, fetched_at
             ) VALUES (?1,?2,?3,?4,?5,?6,?7)",
            params![
                quote.event_id,
                quote.source,
                quote.home_moneyline,
                quote.away_moneyline,
                quote.spread,
                quote.total,
                quote.fetched_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Most recent quote per source for an event
    pub fn latest_quotes(&self, event_id: &str) -> Result<Vec<OddsQuote>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT q.event_id, q.source, q.home_moneyline, q.away_moneyline, q.spread, q.total, q.fetched_at
             FROM odds_quotes q
             WHERE q.event_id=?1
               AND q.id = (
                   SELECT q2.id FROM odds_quotes q2
                   WHERE q2.event_id=q.event_id AND q2.source=q.source
                   ORDER BY q2.fetched_at DESC, q2.id DESC LIMIT 1
               )
             ORDER BY q.source",
        )?;
        let rows = stmt
            .query_map(params![event_id], map_quote)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn append_movement(&self, event_id: &str, line: &ConsensusLine) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO odds_movement (
                event_id, home_moneyline, away_moneyline, spread, total, source_count, computed_at
             ) VALUES (?1,?2,?3,?4,?5,?6,?7)",
            params![
                event_id,
                line.home_moneyline,
                line.away_moneyline,
                line.spread,
                line.total,
                line.source_count as i64,
                line.computed_at,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Consensus history for an event, oldest first
    pub fn movement_history(&self, event_id: &str) -> Result<Vec<ConsensusLine>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT home_moneyline, away_moneyline, spread, total, source_count, computed_at
             FROM odds_movement WHERE event_id=?1 ORDER BY id ASC",
        )?;
        let rows = stmt
            .query_map(params![event_id], map_consensus)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── Event results ─────────────────────────────────────────────────────────

    pub fn upsert_event_result(&self, result: &EventResult) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO event_results (event_id, home_score, away_score, resolved_at)
             VALUES (?1,?2,?3,?4)
             ON CONFLICT(event_id) DO UPDATE SET
                home_score=excluded.home_score,
                away_score=excluded.away_score,
                resolved_at=excluded.resolved_at",
            params![
                result.event_id,
                result.home_score,
                result.away_score,
                result.resolved_at
            ],
        )?;
        Ok(())
    }

    pub fn get_event_result(&self, event_id: &str) -> Result<Option<EventResult>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT event_id, home_score, away_score, resolved_at
                 FROM event_results WHERE event_id=?1",
                params![event_id],
                |row| {
                    Ok(EventResult {
                        event_id: row.get(0)?,
                        home_score: row.get(1)?,
                        away_score: row.get(2)?,
                        resolved_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    // ── Calibration ───────────────────────────────────────────────────────────

    pub fn upsert_model_calibration(&self, model: &ModelCalibration) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO model_calibrations (
                sport, a, b, samples, logloss_before, logloss_after,
                brier_before, brier_after, fitted_at
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)
             ON CONFLICT(sport) DO UPDATE SET
                a=excluded.a,
                b=excluded.b,
                samples=excluded.samples,
                logloss_before=excluded.logloss_before,
                logloss_after=excluded.logloss_after,
                brier_before=excluded.brier_before,
                brier_after=excluded.brier_after,
                fitted_at=excluded.fitted_at",
            params![
                model.sport,
                model.a,
                model.b,
                model.samples,
                model.logloss_before,
                model.logloss_after,
                model.brier_before,
                model.brier_after,
                model.fitted_at,
            ],
        )?;
        Ok(())
    }

    pub fn get_model_calibration(&self, sport: &str) -> Result<Option<ModelCalibration>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT sport, a, b, samples, logloss_before, logloss_after,
                        brier_before, brier_after, fitted_at
                 FROM model_calibrations WHERE sport=?1",
                params![sport],
                map_calibration,
            )
            .optional()?;
        Ok(row)
    }

    /// `(raw home probability, 1.0 if home won else 0.0)` for every resolved,
    /// non-drawn prediction of a sport.
    pub fn list_calibration_samples(&self, sport: &str) -> Result<Vec<(f64, f64)>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT p.raw_probability,
                    CASE WHEN r.home_score > r.away_score THEN 1.0 ELSE 0.0 END
             FROM predictions p
             JOIN event_results r ON r.event_id = p.event_id
             WHERE p.sport=?1 AND p.status != 'pending' AND r.home_score != r.away_score
             ORDER BY p.id",
        )?;
        let rows = stmt
            .query_map(params![sport], |row| {
                Ok((row.get::<_, f64>(0)?, row.get::<_, f64>(1)?))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    // ── Row locks ─────────────────────────────────────────────────────────────

    /// Atomically take the lease on `key` if it is free or expired.
    ///
    /// A store held by another writer counts as a busy key.
    pub fn try_acquire_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        let now = Utc::now();
        let conn = self.conn()?;
        let changed = match conn.execute(
            "INSERT INTO row_locks (lock_key, owner, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(lock_key) DO UPDATE SET
                owner=excluded.owner,
                expires_at=excluded.expires_at
             WHERE row_locks.expires_at < ?4",
            params![key, owner, now + ttl, now],
        ) {
            Ok(changed) => changed,
            Err(e) if is_busy(&e) => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        Ok(changed == 1)
    }

    pub fn release_lock(&self, key: &str, owner: &str) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "DELETE FROM row_locks WHERE lock_key=?1 AND owner=?2",
            params![key, owner],
        )?;
        Ok(changed == 1)
    }

    pub fn lock_expiry(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        let conn = self.conn()?;
        let expiry = conn
            .query_row(
                "SELECT expires_at FROM row_locks WHERE lock_key=?1",
                params![key],
                |r| r.get(0),
            )
            .optional()?;
        Ok(expiry)
    }
}

// ── SQL helpers ────────────────────────────────────────────────────────────────

fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::DatabaseBusy || e.code == ErrorCode::DatabaseLocked
    )
}

const PREDICTION_COLUMNS: &str = "id, event_id, sport, league, home_team, away_team, scheduled_at,
    raw_probability, probability, side, side_probability, confidence,
    edge, break_even, american_odds, decimal_odds,
    method_scores, odds_snapshot, temporal_events, decay,
    status, created_at, resolved_at";

fn json_column<T: DeserializeOwned>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parsed_column<T>(row: &rusqlite::Row, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let raw: String = row.get(idx)?;
    raw.parse::<T>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
    })
}

fn map_prediction(row: &rusqlite::Row) -> rusqlite::Result<PredictionRecord> {
    Ok(PredictionRecord {
        id: row.get(0)?,
        event_id: row.get(1)?,
        sport: row.get(2)?,
        league: row.get(3)?,
        home_team: row.get(4)?,
        away_team: row.get(5)?,
        scheduled_at: row.get(6)?,
        raw_probability: row.get(7)?,
        probability: row.get(8)?,
        side: parsed_column(row, 9)?,
        side_probability: row.get(10)?,
        confidence: row.get(11)?,
        edge: row.get(12)?,
        break_even: row.get(13)?,
        american_odds: row.get(14)?,
        decimal_odds: row.get(15)?,
        method_scores: json_column(row, 16)?,
        odds: json_column(row, 17)?,
        temporal_events: json_column(row, 18)?,
        decay: json_column(row, 19)?,
        status: parsed_column(row, 20)?,
        created_at: row.get(21)?,
        resolved_at: row.get(22)?,
    })
}

fn map_method_weight(row: &rusqlite::Row) -> rusqlite::Result<MethodWeight> {
    Ok(MethodWeight {
        sport: row.get(0)?,
        method: row.get(1)?,
        weight: row.get(2)?,
        correct: row.get(3)?,
        total: row.get(4)?,
        avg_accuracy: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn map_quote(row: &rusqlite::Row) -> rusqlite::Result<OddsQuote> {
    Ok(OddsQuote {
        event_id: row.get(0)?,
        source: row.get(1)?,
        home_moneyline: row.get(2)?,
        away_moneyline: row.get(3)?,
        spread: row.get(4)?,
        total: row.get(5)?,
        fetched_at: row.get(6)?,
    })
}

fn map_consensus(row: &rusqlite::Row) -> rusqlite::Result<ConsensusLine> {
    let source_count: i64 = row.get(4)?;
    Ok(ConsensusLine {
        home_moneyline: row.get(0)?,
        away_moneyline: row.get(1)?,
        spread: row.get(2)?,
        total: row.get(3)?,
        source_count: source_count.max(0) as usize,
        computed_at: row.get(5)?,
    })
}

fn map_calibration(row: &rusqlite::Row) -> rusqlite::Result<ModelCalibration> {
    Ok(ModelCalibration {
        sport: row.get(0)?,
        a: row.get(1)?,
        b: row.get(2)?,
        samples: row.get(3)?,
        logloss_before: row.get(4)?,
        logloss_after: row.get(5)?,
        brier_before: row.get(6)?,
        brier_after: row.get(7)?,
        fitted_at: row.get(8)?,
    })
}

/// SQLite schema (idempotent CREATE IF NOT EXISTS)
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS predictions (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id         TEXT    NOT NULL,
    sport            TEXT    NOT NULL,
    league           TEXT,
    home_team        TEXT    NOT NULL,
    away_team        TEXT    NOT NULL,
    scheduled_at     TEXT    NOT NULL,
    raw_probability  REAL    NOT NULL,
    probability      REAL    NOT NULL,
    side             TEXT    NOT NULL,
    side_probability REAL    NOT NULL,
    confidence       REAL    NOT NULL,
    edge             REAL    NOT NULL,
    break_even       REAL    NOT NULL,
    american_odds    REAL    NOT NULL,
    decimal_odds     REAL    NOT NULL,
    method_scores    TEXT    NOT NULL,
    odds_snapshot    TEXT    NOT NULL,
    temporal_events  TEXT    NOT NULL,
    decay            TEXT    NOT NULL,
    status           TEXT    NOT NULL DEFAULT 'pending',
    created_at       TEXT    NOT NULL,
    resolved_at      TEXT
);

CREATE TABLE IF NOT EXISTS method_weights (
    sport        TEXT    NOT NULL,
    method       TEXT    NOT NULL,
    weight       REAL    NOT NULL,
    correct      INTEGER NOT NULL DEFAULT 0,
    total        INTEGER NOT NULL DEFAULT 0,
    avg_accuracy REAL    NOT NULL DEFAULT 0,
    updated_at   TEXT    NOT NULL,
    PRIMARY KEY (sport, method)
);

CREATE TABLE IF NOT EXISTS applied_outcomes (
    prediction_id INTEGER PRIMARY KEY,
    applied_at    TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS odds_quotes (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id       TEXT    NOT NULL,
    source         TEXT    NOT NULL,
    home_moneyline REAL,
    away_moneyline REAL,
    spread         REAL,
    total          REAL,
    fetched_at     TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS odds_movement (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    event_id       TEXT    NOT NULL,
    home_moneyline REAL,
    away_moneyline REAL,
    spread         REAL,
    total          REAL,
    source_count   INTEGER NOT NULL,
    computed_at    TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS event_results (
    event_id    TEXT    PRIMARY KEY,
    home_score  INTEGER NOT NULL,
    away_score  INTEGER NOT NULL,
    resolved_at TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS model_calibrations (
    sport          TEXT    PRIMARY KEY,
    a              REAL    NOT NULL,
    b              REAL    NOT NULL,
    samples        INTEGER NOT NULL,
    logloss_before REAL    NOT NULL,
    logloss_after  REAL    NOT NULL,
    brier_before   REAL    NOT NULL,
    brier_after    REAL    NOT NULL,
    fitted_at      TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS row_locks (
    lock_key   TEXT    PRIMARY KEY,
    owner      TEXT    NOT NULL,
    expires_at TEXT    NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_predictions_status ON predictions(status, sport);
CREATE INDEX IF NOT EXISTS idx_predictions_event ON predictions(event_id);
CREATE INDEX IF NOT EXISTS idx_odds_quotes_event ON odds_quotes(event_id, source, fetched_at);
CREATE INDEX IF NOT EXISTS idx_odds_movement_event ON odds_movement(event_id);
"#;
