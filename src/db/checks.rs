//! Raw check persistence.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Result as SqlResult, Row};

use super::models::*;
use super::store::{db_time, time_column, DbError, Store};

const CHECK_COLUMNS: &str =
    "target_id, status, response_time_ms, status_code, error_message, metadata, checked_at";

/// What `record_check` saw and wrote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordedCheck {
    pub id: i64,
    /// Status of the latest earlier check for the target, if any.
    pub previous_status: Option<CheckStatus>,
}

impl Store {
    /// Persist a raw check and write the target's last-known fields back, in one
    /// transaction. The previous status is read in the same transaction so that it
    /// reflects exactly the rows that precede this one.
    pub fn record_check(&self, check: &RawCheck) -> Result<RecordedCheck, DbError> {
        let metadata = match &check.metadata {
            Some(meta) => serde_json::to_string(meta).ok(),
            None => None,
        };
        let checked_at = db_time(check.checked_at);
        let response_time_ms = check.response_time_ms.max(0);

        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;

        let previous_status: Option<CheckStatus> = tx
            .query_row(
                "SELECT status FROM raw_checks WHERE target_id = ?1 AND checked_at <= ?2
                 ORDER BY checked_at DESC, id DESC LIMIT 1",
                params![check.target_id, checked_at],
                |row| row.get(0),
            )
            .optional()?;

        tx.execute(
            "INSERT INTO raw_checks (target_id, status, response_time_ms, status_code,
                 error_message, metadata, checked_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                check.target_id,
                check.status,
                response_time_ms,
                check.status_code,
                check.error_message,
                metadata,
                checked_at,
            ],
        )?;
        let id = tx.last_insert_rowid();

        tx.execute(
            "UPDATE targets SET last_check_at = ?1, last_status = ?2,
                 last_response_time_ms = ?3, last_error = ?4
             WHERE id = ?5",
            params![
                checked_at,
                check.status,
                response_time_ms,
                check.error_message,
                check.target_id,
            ],
        )?;

        tx.commit()?;
        Ok(RecordedCheck { id, previous_status })
    }

    /// Get checks for a target within `[start, end)`, oldest first. When the window
    /// holds more than `limit` rows the most recent `limit` are kept.
    pub fn get_checks(
        &self,
        target_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RawCheck>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {cols} FROM (
                 SELECT id, {cols} FROM raw_checks
                 WHERE target_id = ?1 AND checked_at >= ?2 AND checked_at < ?3
                 ORDER BY checked_at DESC, id DESC LIMIT ?4
             ) ORDER BY checked_at ASC, id ASC",
            cols = CHECK_COLUMNS
        ))?;

        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let checks = stmt
            .query_map(
                params![target_id, db_time(start), db_time(end), limit],
                check_from_row,
            )?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(checks)
    }

    /// Distinct targets with at least one check within `[start, end)`.
    pub fn get_checked_target_ids(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<i64>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT target_id FROM raw_checks
             WHERE checked_at >= ?1 AND checked_at < ?2 ORDER BY target_id",
        )?;
        let ids = stmt
            .query_map(params![db_time(start), db_time(end)], |row| row.get(0))?
            .collect::<SqlResult<Vec<i64>>>()?;
        Ok(ids)
    }

    pub fn count_checks(
        &self,
        target_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<CheckCounts, DbError> {
        let conn = self.conn();
        let counts = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN status = 'up' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'down' THEN 1 ELSE 0 END), 0)
             FROM raw_checks WHERE target_id = ?1 AND checked_at >= ?2 AND checked_at < ?3",
            params![target_id, db_time(start), db_time(end)],
            |row| {
                Ok(CheckCounts {
                    total: row.get(0)?,
                    up: row.get(1)?,
                    down: row.get(2)?,
                })
            },
        )?;
        Ok(counts)
    }

    pub fn summarize_response_times(
        &self,
        target_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<ResponseTimeSummary, DbError> {
        let conn = self.conn();
        let summary = conn.query_row(
            "SELECT AVG(response_time_ms), MIN(response_time_ms), MAX(response_time_ms)
             FROM raw_checks WHERE target_id = ?1 AND checked_at >= ?2 AND checked_at < ?3",
            params![target_id, db_time(start), db_time(end)],
            |row| {
                Ok(ResponseTimeSummary {
                    avg: row.get(0)?,
                    min: row.get(1)?,
                    max: row.get(2)?,
                })
            },
        )?;
        Ok(summary)
    }

    /// Delete up to `batch_size` checks older than `cutoff`. Returns the number removed.
    pub fn delete_checks_before(
        &self,
        cutoff: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<usize, DbError> {
        let conn = self.conn();
        let batch_size = i64::try_from(batch_size).unwrap_or(i64::MAX);
        let deleted = conn.execute(
            "DELETE FROM raw_checks WHERE id IN
             (SELECT id FROM raw_checks WHERE checked_at < ?1 LIMIT ?2)",
            params![db_time(cutoff), batch_size],
        )?;
        Ok(deleted)
    }
}

fn check_from_row(row: &Row<'_>) -> SqlResult<RawCheck> {
    let metadata: Option<String> = row.get(5)?;
    Ok(RawCheck {
        target_id: row.get(0)?,
        status: row.get(1)?,
        response_time_ms: row.get(2)?,
        status_code: row.get(3)?,
        error_message: row.get(4)?,
        metadata: metadata.and_then(|m| serde_json::from_str(&m).ok()),
        checked_at: time_column(row, 6)?,
    })
}
