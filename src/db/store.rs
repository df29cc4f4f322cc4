//! SQLite database store implementation.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rusqlite::{params, Connection, Result as SqlResult, Row};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

use super::models::*;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
}

pub(crate) const DB_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";
pub(crate) const DB_DATE_FORMAT: &str = "%Y-%m-%d";

const TARGET_COLUMNS: &str = "id, name, url, kind, check_interval_secs, timeout_secs, enabled, \
     method, headers, body, expected_status, last_check_at, last_status, \
     last_response_time_ms, last_error";

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Apply the embedded schema.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn();
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    /// Lock the connection. A panic while holding the lock leaves SQLite itself
    /// consistent, so a poisoned mutex is still usable.
    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- Target CRUD ---

    /// Add a new target and return its ID.
    pub fn add_target(&self, target: &mut Target) -> Result<i64, DbError> {
        normalize_target(target);
        let headers = serde_json::to_string(&target.headers).unwrap_or_else(|_| "{}".to_string());

        let conn = self.conn();
        conn.execute(
            "INSERT INTO targets (name, url, kind, check_interval_secs, timeout_secs, enabled,
                 method, headers, body, expected_status, last_status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                target.name,
                target.url,
                target.kind,
                target.check_interval_secs,
                target.timeout_secs,
                target.enabled,
                target.method,
                headers,
                target.body,
                target.expected_status,
                CheckStatus::Checking,
            ],
        )?;
        let id = conn.last_insert_rowid();
        target.id = id;
        target.last_status = Some(CheckStatus::Checking);
        Ok(id)
    }

    /// Update a target's configuration. Write-back fields are left to the scheduler.
    #[cfg(test)]
    pub fn update_target(&self, target: &Target) -> Result<(), DbError> {
        let mut target = target.clone();
        normalize_target(&mut target);
        let headers = serde_json::to_string(&target.headers).unwrap_or_else(|_| "{}".to_string());

        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE targets SET name=?1, url=?2, kind=?3, check_interval_secs=?4, timeout_secs=?5,
             enabled=?6,
             method=?7, headers=?8, body=?9, expected_status=?10 WHERE id=?11",
            params![
                target.name,
                target.url,
                target.kind,
                target.check_interval_secs,
                target.timeout_secs,
                target.enabled,
                target.method,
                headers,
                target.body,
                target.expected_status,
                target.id,
            ],
        )?;
        if changed == 0 {
            return Err(DbError::NotFound);
        }
        Ok(())
    }

    /// Get all targets.
    pub fn get_targets(&self) -> Result<Vec<Target>, DbError> {
        let conn = self.conn();
        let mut stmt =
            conn.prepare(&format!("SELECT {} FROM targets ORDER BY id", TARGET_COLUMNS))?;
        let targets = stmt
            .query_map([], target_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(targets)
    }

    /// Get a target by ID.
    pub fn get_target(&self, id: i64) -> Result<Target, DbError> {
        let conn = self.conn();
        conn.query_row(
            &format!("SELECT {} FROM targets WHERE id = ?1", TARGET_COLUMNS),
            params![id],
            target_from_row,
        )
        .map_err(not_found)
    }

    pub fn target_exists(&self, id: i64) -> Result<bool, DbError> {
        let conn = self.conn();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM targets WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Targets whose interval has elapsed, never-checked first, then the most
    /// overdue, capped at `limit`.
    pub fn get_due_targets(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Target>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM targets WHERE enabled = 1
             ORDER BY last_check_at IS NOT NULL, last_check_at ASC, id ASC",
            TARGET_COLUMNS
        ))?;
        let mut due = Vec::new();
        let rows = stmt.query_map([], target_from_row)?;
        for row in rows {
            let target = row?;
            if target.is_due(now) {
                due.push(target);
                if due.len() >= limit {
                    break;
                }
            }
        }
        Ok(due)
    }

    /// Delete a target and everything recorded for it.
    #[cfg(test)]
    pub fn delete_target(&self, id: i64) -> Result<(), DbError> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        tx.execute("DELETE FROM raw_checks WHERE target_id = ?1", params![id])?;
        tx.execute("DELETE FROM incidents WHERE target_id = ?1", params![id])?;
        tx.execute("DELETE FROM history_buckets WHERE target_id = ?1", params![id])?;
        tx.execute("DELETE FROM targets WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(())
    }
}

fn normalize_target(target: &mut Target) {
    if target.check_interval_secs <= 0 {
        target.check_interval_secs = 300;
    }
    if target.timeout_secs <= 0.0 {
        target.timeout_secs = 10.0;
    }
    if target.name.is_empty() {
        target.name = target.url.clone();
    }
}

fn target_from_row(row: &Row<'_>) -> SqlResult<Target> {
    let headers: String = row.get(8)?;
    let last_check_at: Option<String> = row.get(11)?;
    Ok(Target {
        id: row.get(0)?,
        name: row.get(1)?,
        url: row.get(2)?,
        kind: row.get(3)?,
        check_interval_secs: row.get(4)?,
        timeout_secs: row.get(5)?,
        enabled: row.get(6)?,
        method: row.get(7)?,
        headers: serde_json::from_str::<BTreeMap<String, String>>(&headers).unwrap_or_default(),
        body: row.get(9)?,
        expected_status: row.get(10)?,
        last_check_at: last_check_at.as_deref().and_then(parse_db_time),
        last_status: row.get(12)?,
        last_response_time_ms: row.get(13)?,
        last_error: row.get(14)?,
    })
}

pub(crate) fn not_found(e: rusqlite::Error) -> DbError {
    match e {
        rusqlite::Error::QueryReturnedNoRows => DbError::NotFound,
        other => DbError::Sqlite(other),
    }
}

/// Format a timestamp for storage. The format sorts lexicographically.
pub(crate) fn db_time(dt: DateTime<Utc>) -> String {
    dt.format(DB_TIME_FORMAT).to_string()
}

pub(crate) fn db_date(date: NaiveDate) -> String {
    date.format(DB_DATE_FORMAT).to_string()
}

/// Parse a datetime string from the database.
pub(crate) fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.fZ",
        "%Y-%m-%dT%H:%M:%SZ",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Read a stored timestamp column, surfacing garbage as a conversion error.
pub(crate) fn time_column(row: &Row<'_>, idx: usize) -> SqlResult<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_db_time(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("invalid timestamp {:?}", raw).into(),
        )
    })
}

pub(crate) fn optional_time_column(row: &Row<'_>, idx: usize) -> SqlResult<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    match raw {
        None => Ok(None),
        Some(_) => time_column(row, idx).map(Some),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use tempfile::NamedTempFile;

    /// Open a store on a fresh temp file; keep the file alive for the test.
    pub(crate) fn temp_store() -> (Store, NamedTempFile) {
        let tmp = NamedTempFile::new().unwrap();
        let store = Store::new(tmp.path()).unwrap();
        (store, tmp)
    }

    pub(crate) fn add_site(store: &Store, url: &str) -> i64 {
        let mut target = Target {
            url: url.to_string(),
            ..Default::default()
        };
        store.add_target(&mut target).unwrap()
    }

    #[test]
    fn test_target_crud() {
        let (store, _tmp) = temp_store();

        let mut target = Target {
            name: "Test".to_string(),
            url: "example.com".to_string(),
            ..Default::default()
        };
        let id = store.add_target(&mut target).unwrap();
        assert!(id > 0);

        let fetched = store.get_target(id).unwrap();
        assert_eq!(fetched.name, "Test");
        assert_eq!(fetched.kind, TargetKind::Site);
        assert_eq!(fetched.last_status, Some(CheckStatus::Checking));
        assert!(fetched.last_check_at.is_none());

        let mut updated = fetched;
        updated.name = "Updated".to_string();
        updated.kind = TargetKind::Endpoint;
        updated.method = Some("POST".to_string());
        updated.headers.insert("X-Token".to_string(), "abc".to_string());
        updated.expected_status = Some(201);
        store.update_target(&updated).unwrap();

        let fetched2 = store.get_target(id).unwrap();
        assert_eq!(fetched2.name, "Updated");
        assert_eq!(fetched2.kind, TargetKind::Endpoint);
        assert_eq!(fetched2.headers.get("X-Token").map(String::as_str), Some("abc"));
        assert_eq!(fetched2.expected_status, Some(201));

        store.delete_target(id).unwrap();
        assert!(matches!(store.get_target(id), Err(DbError::NotFound)));
        assert!(!store.target_exists(id).unwrap());
    }

    #[test]
    fn test_add_target_applies_defaults() {
        let (store, _tmp) = temp_store();
        let mut target = Target {
            url: "example.org".to_string(),
            check_interval_secs: 0,
            timeout_secs: -1.0,
            ..Default::default()
        };
        store.add_target(&mut target).unwrap();
        let fetched = store.get_target(target.id).unwrap();
        assert_eq!(fetched.check_interval_secs, 300);
        assert_eq!(fetched.timeout_secs, 10.0);
        assert_eq!(fetched.name, "example.org");
    }

    #[test]
    fn test_due_targets_ordering_and_limit() {
        let (store, _tmp) = temp_store();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

        let fresh = add_site(&store, "fresh.example");
        let stale = add_site(&store, "stale.example");
        let recent = add_site(&store, "recent.example");
        let never = add_site(&store, "never.example");

        {
            let conn = store.conn();
            for (id, ago) in [(fresh, 1), (stale, 30), (recent, 10)] {
                conn.execute(
                    "UPDATE targets SET last_check_at = ?1 WHERE id = ?2",
                    params![db_time(now - ChronoDuration::minutes(ago)), id],
                )
                .unwrap();
            }
        }

        let due = store.get_due_targets(now, 10).unwrap();
        let ids: Vec<i64> = due.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![never, stale, recent]);

        let limited = store.get_due_targets(now, 2).unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].id, never);
    }

    #[test]
    fn test_parse_db_time_formats() {
        let expected = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(parse_db_time(&db_time(expected)), Some(expected));
        assert_eq!(parse_db_time("2024-01-02 03:04:05"), Some(expected));
        assert_eq!(parse_db_time("2024-01-02T03:04:05Z"), Some(expected));
        assert_eq!(parse_db_time("yesterday"), None);
    }
}
