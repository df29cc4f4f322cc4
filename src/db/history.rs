//! History bucket persistence.

use chrono::NaiveDate;
use rusqlite::{params, Result as SqlResult, Row};

use super::models::HistoryBucket;
use super::store::{db_date, DbError, Store, DB_DATE_FORMAT};

/// Stored in place of a NULL hour so the unique key covers the daily rollup.
const DAY_ROLLUP_HOUR: i64 = -1;

impl Store {
    /// Upsert buckets keyed by `(target_id, date, hour)` in one transaction.
    pub fn upsert_history_buckets(&self, buckets: &[HistoryBucket]) -> Result<usize, DbError> {
        if buckets.is_empty() {
            return Ok(0);
        }

        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO history_buckets
                 (target_id, date, hour, p50, p95, p99, avg, min, max, check_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(target_id, date, hour) DO UPDATE SET
                 p50=excluded.p50, p95=excluded.p95, p99=excluded.p99, avg=excluded.avg,
                 min=excluded.min, max=excluded.max, check_count=excluded.check_count",
            )?;

            for b in buckets {
                stmt.execute(params![
                    b.target_id,
                    db_date(b.date),
                    b.hour.map_or(DAY_ROLLUP_HOUR, i64::from),
                    b.p50,
                    b.p95,
                    b.p99,
                    b.avg,
                    b.min,
                    b.max,
                    b.check_count,
                ])?;
            }
        }

        tx.commit()?;
        Ok(buckets.len())
    }

    /// Buckets for a target with `start <= date <= end`, ordered by date then hour,
    /// the daily rollup first within each date.
    pub fn get_history_buckets(
        &self,
        target_id: i64,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<HistoryBucket>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT target_id, date, hour, p50, p95, p99, avg, min, max, check_count
             FROM history_buckets
             WHERE target_id = ?1 AND date >= ?2 AND date <= ?3
             ORDER BY date ASC, hour ASC",
        )?;
        let buckets = stmt
            .query_map(params![target_id, db_date(start), db_date(end)], bucket_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(buckets)
    }
}

fn bucket_from_row(row: &Row<'_>) -> SqlResult<HistoryBucket> {
    let date: String = row.get(1)?;
    let date = NaiveDate::parse_from_str(&date, DB_DATE_FORMAT).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
    })?;
    let hour: i64 = row.get(2)?;
    Ok(HistoryBucket {
        target_id: row.get(0)?,
        date,
        hour: u8::try_from(hour).ok(),
        p50: row.get(3)?,
        p95: row.get(4)?,
        p99: row.get(5)?,
        avg: row.get(6)?,
        min: row.get(7)?,
        max: row.get(8)?,
        check_count: row.get(9)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::store::tests::{add_site, temp_store};

    fn bucket(target_id: i64, date: NaiveDate, hour: Option<u8>, p50: i64) -> HistoryBucket {
        HistoryBucket {
            target_id,
            date,
            hour,
            p50,
            p95: p50,
            p99: None,
            avg: p50 as f64,
            min: p50,
            max: p50,
            check_count: 1,
        }
    }

    #[test]
    fn test_upsert_overwrites_including_day_rollup() {
        let (store, _tmp) = temp_store();
        let id = add_site(&store, "example.com");
        let date = NaiveDate::from_ymd_opt(2024, 4, 2).unwrap();

        store
            .upsert_history_buckets(&[bucket(id, date, None, 10), bucket(id, date, Some(3), 10)])
            .unwrap();
        store
            .upsert_history_buckets(&[bucket(id, date, None, 20), bucket(id, date, Some(3), 30)])
            .unwrap();

        let stored = store.get_history_buckets(id, date, date).unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].hour, None);
        assert_eq!(stored[0].p50, 20);
        assert_eq!(stored[1].hour, Some(3));
        assert_eq!(stored[1].p50, 30);
    }

    #[test]
    fn test_range_is_inclusive() {
        let (store, _tmp) = temp_store();
        let id = add_site(&store, "example.com");
        let d1 = NaiveDate::from_ymd_opt(2024, 4, 1).unwrap();
        let d2 = NaiveDate::from_ymd_opt(2024, 4, 2).unwrap();
        let d3 = NaiveDate::from_ymd_opt(2024, 4, 3).unwrap();

        store
            .upsert_history_buckets(&[
                bucket(id, d1, None, 1),
                bucket(id, d2, None, 2),
                bucket(id, d3, None, 3),
            ])
            .unwrap();

        let stored = store.get_history_buckets(id, d1, d2).unwrap();
        let dates: Vec<NaiveDate> = stored.iter().map(|b| b.date).collect();
        assert_eq!(dates, vec![d1, d2]);
        assert_eq!(store.upsert_history_buckets(&[]).unwrap(), 0);
    }
}
