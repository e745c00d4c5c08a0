//! audit/sqlite.rs
//! Embedded audit backend: one WAL-journaled SQLite file.
//!
//! A single long-lived connection serializes all statements; no further
//! application-level locking is needed for statement correctness. Writes use
//! `INSERT OR IGNORE` against the unique `scan_id` index, so replayed
//! fire-and-forget tasks cannot duplicate rows.
//!
//! Schema changes are guarded by `PRAGMA user_version`: 0 means fresh (apply
//! schema, stamp 1), 1 means compatible, anything else refuses startup.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, SecondsFormat, TimeZone, Utc};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use rusqlite::types::ToSql;
use rusqlite::Connection;
use thiserror::Error;

use crate::audit::models::{Action, AuditRecord, Direction, EventFilters};
use crate::audit::store::AuditStore;
use crate::scanner::definitions::RiskLevel;

const SCHEMA_VERSION: i32 = 1;

const CREATE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS audit_events (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    scan_id            TEXT NOT NULL UNIQUE,
    timestamp          TEXT NOT NULL,
    user_id            TEXT NOT NULL,
    action             TEXT NOT NULL CHECK(action IN ('ALLOW', 'BLOCK', 'ALLOW_SUPPRESSED')),
    direction          TEXT NOT NULL CHECK(direction IN ('REQUEST', 'RESPONSE')),
    rule_id            TEXT,
    risk_level         TEXT CHECK(risk_level IN ('CRITICAL', 'HIGH', 'MEDIUM', 'LOW') OR risk_level IS NULL),
    redacted_excerpt   TEXT,
    test               INTEGER NOT NULL DEFAULT 0,
    tokens_delivered   INTEGER,
    truncated          INTEGER NOT NULL DEFAULT 0,
    original_length    INTEGER,
    advisory_entities  TEXT,
    allowlist_rule_id  TEXT,
    schema_version     INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS idx_audit_timestamp
    ON audit_events(timestamp DESC);

CREATE INDEX IF NOT EXISTS idx_audit_action
    ON audit_events(action);

CREATE INDEX IF NOT EXISTS idx_audit_user_id
    ON audit_events(user_id);

CREATE INDEX IF NOT EXISTS idx_audit_action_timestamp
    ON audit_events(action, timestamp DESC);
"#;

#[derive(Debug, Error)]
pub enum AuditOpenError {
    /// Marker is neither 0 (fresh) nor the expected version: refuse startup.
    #[error("unsupported audit database schema version {found}; delete the audit database or run a migration")]
    SchemaMismatch { found: i32 },

    #[error(transparent)]
    Db(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ─── SqliteAuditStore ───────────────────────────────────────────────────────

pub struct SqliteAuditStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl SqliteAuditStore {
    /// Open the audit database, enable WAL, and create or verify the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditOpenError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&path)?;
        conn.busy_timeout(StdDuration::from_secs(5))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;

        let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        match version {
            0 => {
                conn.execute_batch(CREATE_SCHEMA_SQL)?;
                conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
                tracing::info!(path = %path.display(), schema_version = SCHEMA_VERSION, "audit schema created");
            }
            SCHEMA_VERSION => {
                tracing::info!(path = %path.display(), schema_version = version, "audit schema ok");
            }
            other => {
                drop(conn);
                return Err(AuditOpenError::SchemaMismatch { found: other });
            }
        }

        Ok(Self { conn: Mutex::new(conn), path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl AuditStore for SqliteAuditStore {
    /// Persist one record. Never propagates: audit failure must not affect
    /// the request path.
    fn log(&self, record: &AuditRecord) {
        let advisory_json = record
            .advisory_entities
            .as_ref()
            .and_then(|entities| serde_json::to_string(entities).ok());

        let conn = self.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO audit_events \
             (scan_id, timestamp, user_id, action, direction, \
              rule_id, risk_level, redacted_excerpt, test, \
              tokens_delivered, truncated, original_length, \
              advisory_entities, allowlist_rule_id, schema_version) \
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
            rusqlite::params![
                record.scan_id,
                record.timestamp_iso(),
                record.user_id,
                record.action.as_str(),
                record.direction.as_str(),
                record.rule_id,
                record.risk_level.map(|r| r.as_str()),
                record.redacted_excerpt,
                record.is_test as i64,
                record.tokens_delivered.map(|t| t as i64),
                record.truncated as i64,
                record.original_length.map(|l| l as i64),
                advisory_json,
                record.allowlist_rule_id,
                record.schema_version,
            ],
        );
        if let Err(err) = inserted {
            tracing::error!(scan_id = %record.scan_id, error = %err, "audit write failed");
        }
    }

    fn query(&self, filters: &EventFilters) -> Vec<AuditRecord> {
        let (sql, params) = build_select_sql(filters, false);
        let conn = self.lock();
        let run = || -> rusqlite::Result<Vec<AuditRecord>> {
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(
                rusqlite::params_from_iter(params.iter()),
                row_to_record,
            )?;
            rows.collect()
        };
        match run() {
            Ok(records) => records,
            Err(err) => {
                tracing::error!(error = %err, "audit query failed");
                Vec::new()
            }
        }
    }

    fn count(&self, filters: &EventFilters) -> u64 {
        let (sql, params) = build_select_sql(filters, true);
        let conn = self.lock();
        match conn.query_row(&sql, rusqlite::params_from_iter(params.iter()), |row| {
            row.get::<_, i64>(0)
        }) {
            Ok(count) => count.max(0) as u64,
            Err(err) => {
                tracing::error!(error = %err, "audit count failed");
                0
            }
        }
    }

    fn health_check(&self) -> bool {
        let conn = self.lock();
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)).is_ok()
    }

    /// Delete events strictly older than the cutoff. A record stamped
    /// exactly at `now − retention_days` survives.
    fn prune_older_than(&self, retention_days: i64) -> u64 {
        let cutoff = Utc::now() - Duration::days(retention_days);
        let cutoff_iso = cutoff.to_rfc3339_opts(SecondsFormat::Micros, true);
        let conn = self.lock();
        match conn.execute("DELETE FROM audit_events WHERE timestamp < ?1", [&cutoff_iso]) {
            Ok(deleted) => {
                if deleted > 0 {
                    tracing::info!(
                        deleted_count = deleted,
                        retention_days,
                        cutoff = %cutoff_iso,
                        "retention prune complete"
                    );
                }
                deleted as u64
            }
            Err(err) => {
                tracing::error!(error = %err, "retention prune failed");
                0
            }
        }
    }

    fn close(&self) {
        let conn = self.lock();
        let checkpoint =
            conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_row| Ok(()));
        if let Err(err) = checkpoint {
            tracing::debug!(error = %err, "wal checkpoint on close failed");
        }
        tracing::debug!(path = %self.path.display(), "audit db closed");
    }
}

// ─── Row deserialization ────────────────────────────────────────────────────

fn parse_error(err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(err),
    )
}

#[derive(Debug, Error)]
#[error("{0}")]
struct FieldError(String);

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<AuditRecord> {
    let timestamp_raw: String = row.get("timestamp")?;
    let timestamp: DateTime<Utc> = DateTime::parse_from_rfc3339(&timestamp_raw)
        .map_err(parse_error)?
        .with_timezone(&Utc);

    let action: Action = row
        .get::<_, String>("action")?
        .parse()
        .map_err(|e| parse_error(FieldError(e)))?;
    let direction: Direction = row
        .get::<_, String>("direction")?
        .parse()
        .map_err(|e| parse_error(FieldError(e)))?;
    let risk_level: Option<RiskLevel> = row
        .get::<_, Option<String>>("risk_level")?
        .map(|s| s.parse().map_err(|e| parse_error(FieldError(e))))
        .transpose()?;

    let advisory_entities: Option<Vec<String>> = row
        .get::<_, Option<String>>("advisory_entities")?
        .and_then(|raw| serde_json::from_str(&raw).ok());

    Ok(AuditRecord {
        scan_id: row.get("scan_id")?,
        timestamp,
        user_id: row.get("user_id")?,
        action,
        direction,
        schema_version: row.get("schema_version")?,
        rule_id: row.get("rule_id")?,
        risk_level,
        redacted_excerpt: row.get("redacted_excerpt")?,
        is_test: row.get::<_, i64>("test")? != 0,
        tokens_delivered: row.get::<_, Option<i64>>("tokens_delivered")?.map(|t| t as u64),
        truncated: row.get::<_, i64>("truncated")? != 0,
        original_length: row.get::<_, Option<i64>>("original_length")?.map(|l| l as u64),
        advisory_entities,
        allowlist_rule_id: row.get("allowlist_rule_id")?,
    })
}

// ─── SQL builder ────────────────────────────────────────────────────────────

/// Compose a parameterized SELECT from the filter set. Where-clause
/// fragments come from this fixed whitelist only; every value is bound.
fn build_select_sql(filters: &EventFilters, count_only: bool) -> (String, Vec<Box<dyn ToSql>>) {
    let mut sql = if count_only {
        String::from("SELECT COUNT(*) FROM audit_events")
    } else {
        String::from("SELECT * FROM audit_events")
    };

    let mut conditions: Vec<String> = Vec::new();
    let mut params: Vec<Box<dyn ToSql>> = Vec::new();

    // action_in supersedes action.
    if let Some(actions) = &filters.action_in {
        let placeholders = vec!["?"; actions.len()].join(",");
        conditions.push(format!("action IN ({placeholders})"));
        for action in actions {
            params.push(Box::new(action.as_str()));
        }
    } else if let Some(action) = filters.action {
        conditions.push("action = ?".into());
        params.push(Box::new(action.as_str()));
    }

    if let Some(direction) = filters.direction {
        conditions.push("direction = ?".into());
        params.push(Box::new(direction.as_str()));
    }
    if let Some(user_id) = &filters.user_id {
        conditions.push("user_id = ?".into());
        params.push(Box::new(user_id.clone()));
    }
    if let Some(since) = filters.since {
        conditions.push("timestamp >= ?".into());
        params.push(Box::new(since.to_rfc3339_opts(SecondsFormat::Micros, true)));
    }
    if let Some(until) = filters.until {
        conditions.push("timestamp <= ?".into());
        params.push(Box::new(until.to_rfc3339_opts(SecondsFormat::Micros, true)));
    }
    if let Some(is_test) = filters.is_test {
        conditions.push("test = ?".into());
        params.push(Box::new(is_test as i64));
    }
    if let Some(risk) = filters.risk_level {
        conditions.push("risk_level = ?".into());
        params.push(Box::new(risk.as_str()));
    }

    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }

    if !count_only {
        sql.push_str(" ORDER BY timestamp DESC");
        sql.push_str(&format!(" LIMIT {} OFFSET {}", filters.limit(), filters.offset()));
    }

    (sql, params)
}

// ─── Background retention task ──────────────────────────────────────────────

/// Daily retention hour, UTC.
const RETENTION_HOUR_UTC: u32 = 3;
/// Back-off after an unexpected pruning failure.
const RETENTION_RETRY: StdDuration = StdDuration::from_secs(3600);

/// Spawn the retention pruner: sleep until the next 03:00 UTC, prune, repeat.
///
/// Any message (or disconnect) on `shutdown` stops the task, including while
/// it sleeps between runs or during the post-error back-off.
pub fn spawn_retention_task(
    store: Arc<dyn AuditStore>,
    retention_days: i64,
    shutdown: Receiver<()>,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name("audit_retention".into())
        .spawn(move || retention_loop(store, retention_days, shutdown))
        .unwrap_or_else(|err| {
            tracing::error!(error = %err, "failed to spawn retention task");
            // Degenerate handle so callers can still join.
            std::thread::spawn(|| {})
        })
}

fn retention_loop(store: Arc<dyn AuditStore>, retention_days: i64, shutdown: Receiver<()>) {
    loop {
        let wait = duration_until_next_run(Utc::now());
        tracing::info!(sleep_seconds = wait.as_secs(), "retention pruner scheduled");
        match shutdown.recv_timeout(wait) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                tracing::info!("retention pruner cancelled");
                return;
            }
            Err(RecvTimeoutError::Timeout) => {}
        }

        let pruned =
            catch_unwind(AssertUnwindSafe(|| store.prune_older_than(retention_days)));
        match pruned {
            Ok(count) => {
                tracing::info!(deleted_count = count, retention_days, "retention prune complete");
            }
            Err(_) => {
                tracing::error!(
                    retry_in_seconds = RETENTION_RETRY.as_secs(),
                    "retention prune panicked"
                );
                match shutdown.recv_timeout(RETENTION_RETRY) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        tracing::info!("retention pruner cancelled during retry sleep");
                        return;
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                }
            }
        }
    }
}

fn duration_until_next_run(now: DateTime<Utc>) -> StdDuration {
    let today_run = now
        .date_naive()
        .and_hms_opt(RETENTION_HOUR_UTC, 0, 0)
        .map(|naive| Utc.from_utc_datetime(&naive));
    let next_run = match today_run {
        Some(run) if run > now => run,
        Some(run) => run + Duration::days(1),
        // Unreachable for a valid hour constant; fall back to a day from now.
        None => now + Duration::days(1),
    };
    (next_run - now).to_std().unwrap_or(StdDuration::from_secs(60))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_run_is_today_before_3am() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 2, 59, 0).single().unwrap();
        let wait = duration_until_next_run(now);
        assert_eq!(wait.as_secs(), 60);
    }

    #[test]
    fn next_run_is_tomorrow_after_3am() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 3, 1, 0).single().unwrap();
        let wait = duration_until_next_run(now);
        assert_eq!(wait.as_secs(), 24 * 3600 - 60);
    }
}
