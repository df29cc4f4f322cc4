//! History aggregator: rolls a closed date's raw checks into hourly and daily
//! percentile buckets.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveTime, Timelike, Utc};

use crate::db::{DbError, HistoryBucket, RawCheck, Store};

/// Raw checks per target are read in one query; this caps a pathological day.
const MAX_CHECKS_PER_TARGET_DAY: usize = 1_000_000;

/// Statistics for one bucket of samples.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketStats {
    pub count: i64,
    pub avg: f64,
    pub min: i64,
    pub max: i64,
    pub p50: i64,
    pub p95: i64,
    /// `None` with fewer than two samples.
    pub p99: Option<i64>,
}

/// Sort `samples` and compute the bucket statistics. Percentiles index the sorted
/// values at `floor(count * pct / 100)`, clamped to the last element.
pub fn summarize(samples: &mut [i64]) -> Option<BucketStats> {
    if samples.is_empty() {
        return None;
    }
    samples.sort_unstable();

    let count = samples.len();
    let sum: i128 = samples.iter().map(|&v| i128::from(v)).sum();
    let at = |pct: usize| samples[(count * pct / 100).min(count - 1)];

    Some(BucketStats {
        count: count as i64,
        avg: sum as f64 / count as f64,
        min: samples[0],
        max: samples[count - 1],
        p50: at(50),
        p95: at(95),
        p99: (count >= 2).then(|| at(99)),
    })
}

/// Build the hourly buckets plus the whole-day bucket for one target's checks.
pub fn build_buckets(target_id: i64, date: NaiveDate, checks: &[RawCheck]) -> Vec<HistoryBucket> {
    let mut by_hour: BTreeMap<u8, Vec<i64>> = BTreeMap::new();
    let mut all = Vec::with_capacity(checks.len());

    for check in checks {
        let value = check.response_time_ms.max(0);
        by_hour
            .entry(check.checked_at.hour() as u8)
            .or_default()
            .push(value);
        all.push(value);
    }

    let mut buckets = Vec::with_capacity(by_hour.len() + 1);
    for (hour, mut samples) in by_hour {
        if let Some(stats) = summarize(&mut samples) {
            buckets.push(to_bucket(target_id, date, Some(hour), stats));
        }
    }
    if let Some(stats) = summarize(&mut all) {
        buckets.push(to_bucket(target_id, date, None, stats));
    }
    buckets
}

fn to_bucket(
    target_id: i64,
    date: NaiveDate,
    hour: Option<u8>,
    stats: BucketStats,
) -> HistoryBucket {
    HistoryBucket {
        target_id,
        date,
        hour,
        p50: stats.p50,
        p95: stats.p95,
        p99: stats.p99,
        avg: stats.avg,
        min: stats.min,
        max: stats.max,
        check_count: stats.count,
    }
}

/// UTC bounds `[start, end)` of a calendar date.
pub fn day_bounds(date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = date.and_time(NaiveTime::MIN).and_utc();
    (start, start + ChronoDuration::days(1))
}

/// Rolls raw checks into history buckets.
pub struct HistoryAggregator {
    store: Arc<Store>,
}

impl HistoryAggregator {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Aggregate every target's checks for `date`. Re-running overwrites the same
    /// buckets. A failing target is logged and skipped; only failing to list the
    /// targets is an error.
    pub fn aggregate(&self, date: NaiveDate) -> Result<usize, DbError> {
        let (start, end) = day_bounds(date);
        let target_ids = self.store.get_checked_target_ids(start, end)?;

        let mut written = 0;
        for target_id in target_ids {
            match self.aggregate_target(target_id, date, start, end) {
                Ok(n) => written += n,
                Err(e) => tracing::error!(
                    "RollupManager: Failed to aggregate target {} for {}: {}",
                    target_id,
                    date,
                    e
                ),
            }
        }

        tracing::info!("RollupManager: Wrote {} buckets for {}", written, date);
        Ok(written)
    }

    fn aggregate_target(
        &self,
        target_id: i64,
        date: NaiveDate,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<usize, DbError> {
        let checks = self
            .store
            .get_checks(target_id, start, end, MAX_CHECKS_PER_TARGET_DAY)?;
        let buckets = build_buckets(target_id, date, &checks);
        let written = self.store.upsert_history_buckets(&buckets)?;

        tracing::debug!(
            "RollupManager: Aggregated target {} for {}: {} checks, {} buckets",
            target_id,
            date,
            checks.len(),
            written
        );
        Ok(written)
    }

    /// Aggregate the UTC date before `now`, the most recent closed date.
    pub fn aggregate_previous_day(&self, now: DateTime<Utc>) -> Result<usize, DbError> {
        let yesterday = now.date_naive() - ChronoDuration::days(1);
        self.aggregate(yesterday)
    }
}
