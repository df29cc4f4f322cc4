//! Read-only queries over checks, incidents and history buckets.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::db::{DbError, HistoryBucket, Incident, IncidentStatus, RawCheck, Store, Target};

pub const DEFAULT_HISTORY_LIMIT: usize = 1_000;
pub const MAX_HISTORY_LIMIT: usize = 10_000;
pub const DEFAULT_INCIDENT_LIMIT: usize = 50;
pub const MAX_DAYS: u32 = 365;
const STATS_WINDOW_DAYS: i64 = 30;

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("target {0} not found")]
    NotFound(i64),
    #[error("invalid query: {0}")]
    Invalid(String),
    #[error("storage error: {0}")]
    Storage(#[from] DbError),
}

/// Time window for a history query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryWindow {
    /// The last N days up to now.
    Days(u32),
    Range {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

impl HistoryWindow {
    fn bounds(&self, now: DateTime<Utc>) -> Result<(DateTime<Utc>, DateTime<Utc>), QueryError> {
        match *self {
            HistoryWindow::Days(days) => {
                if days == 0 || days > MAX_DAYS {
                    return Err(QueryError::Invalid(format!(
                        "days must be between 1 and {}",
                        MAX_DAYS
                    )));
                }
                // End is exclusive; include checks recorded at `now`
                Ok((
                    now - ChronoDuration::days(i64::from(days)),
                    now + ChronoDuration::seconds(1),
                ))
            }
            HistoryWindow::Range { start, end } => {
                if start >= end {
                    return Err(QueryError::Invalid("start must be before end".to_string()));
                }
                Ok((start, end))
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UptimePeriod {
    Hours24,
    Days7,
    Days30,
}

impl UptimePeriod {
    pub fn duration(&self) -> ChronoDuration {
        match self {
            UptimePeriod::Hours24 => ChronoDuration::hours(24),
            UptimePeriod::Days7 => ChronoDuration::days(7),
            UptimePeriod::Days30 => ChronoDuration::days(30),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            UptimePeriod::Hours24 => "24h",
            UptimePeriod::Days7 => "7d",
            UptimePeriod::Days30 => "30d",
        }
    }
}

impl FromStr for UptimePeriod {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "24h" | "1d" => Ok(UptimePeriod::Hours24),
            "7d" => Ok(UptimePeriod::Days7),
            "30d" => Ok(UptimePeriod::Days30),
            other => Err(QueryError::Invalid(format!(
                "unknown period '{}', expected 24h, 7d or 30d",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IncidentFilter {
    Ongoing,
    Resolved,
    #[default]
    All,
}

impl IncidentFilter {
    fn status(&self) -> Option<IncidentStatus> {
        match self {
            IncidentFilter::Ongoing => Some(IncidentStatus::Ongoing),
            IncidentFilter::Resolved => Some(IncidentStatus::Resolved),
            IncidentFilter::All => None,
        }
    }
}

impl FromStr for IncidentFilter {
    type Err = QueryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ongoing" => Ok(IncidentFilter::Ongoing),
            "resolved" => Ok(IncidentFilter::Resolved),
            "all" | "" => Ok(IncidentFilter::All),
            other => Err(QueryError::Invalid(format!(
                "unknown incident status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UptimeSummary {
    pub period: &'static str,
    pub total_checks: i64,
    pub successful_checks: i64,
    pub failed_checks: i64,
    pub uptime_percentage: f64,
    pub incident_count: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TargetStats {
    pub avg_response_time_ms: f64,
    pub min_response_time_ms: i64,
    pub max_response_time_ms: i64,
    pub total_checks: i64,
    pub uptime_percentage: f64,
    pub incident_count: i64,
}

/// A target's last-known state and its ongoing incident, if any.
#[derive(Debug, Clone, Serialize)]
pub struct TargetStatus {
    #[serde(flatten)]
    pub target: Target,
    pub ongoing_incident: Option<Incident>,
}

/// `up / total` as a percentage rounded to two decimals; an empty window is fully up.
pub fn uptime_percentage(up: i64, total: i64) -> f64 {
    if total <= 0 {
        return 100.0;
    }
    let pct = up as f64 * 100.0 / total as f64;
    (pct * 100.0).round() / 100.0
}

/// Query service shared by the HTTP handlers.
#[derive(Clone)]
pub struct Queries {
    store: Arc<Store>,
}

impl Queries {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    fn ensure_target(&self, target_id: i64) -> Result<(), QueryError> {
        if self.store.target_exists(target_id)? {
            Ok(())
        } else {
            Err(QueryError::NotFound(target_id))
        }
    }

    pub fn target(&self, target_id: i64) -> Result<TargetStatus, QueryError> {
        let target = match self.store.get_target(target_id) {
            Ok(t) => t,
            Err(DbError::NotFound) => return Err(QueryError::NotFound(target_id)),
            Err(e) => return Err(e.into()),
        };
        let ongoing_incident = self.store.get_ongoing_incident(target_id)?;
        Ok(TargetStatus {
            target,
            ongoing_incident,
        })
    }

    /// Raw checks in the window, most recent `limit`, oldest first.
    pub fn history(
        &self,
        target_id: i64,
        window: HistoryWindow,
        limit: Option<usize>,
        now: DateTime<Utc>,
    ) -> Result<Vec<RawCheck>, QueryError> {
        self.ensure_target(target_id)?;
        let (start, end) = window.bounds(now)?;
        let limit = limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT);
        Ok(self.store.get_checks(target_id, start, end, limit)?)
    }

    pub fn uptime(
        &self,
        target_id: i64,
        period: UptimePeriod,
        now: DateTime<Utc>,
    ) -> Result<UptimeSummary, QueryError> {
        self.ensure_target(target_id)?;
        let start = now - period.duration();
        let end = now + ChronoDuration::seconds(1);

        let counts = self.store.count_checks(target_id, start, end)?;
        let incident_count = self.store.count_incidents_started(target_id, start, end)?;

        Ok(UptimeSummary {
            period: period.as_str(),
            total_checks: counts.total,
            successful_checks: counts.up,
            failed_checks: counts.down,
            uptime_percentage: uptime_percentage(counts.up, counts.total),
            incident_count,
        })
    }

    /// Incidents newest first.
    pub fn incidents(
        &self,
        target_id: i64,
        filter: IncidentFilter,
        limit: Option<usize>,
    ) -> Result<Vec<Incident>, QueryError> {
        self.ensure_target(target_id)?;
        let limit = limit
            .unwrap_or(DEFAULT_INCIDENT_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT);
        Ok(self.store.get_incidents(target_id, filter.status(), limit)?)
    }

    /// Aggregates over the last 30 days. Empty windows report zeros and 100% uptime.
    pub fn stats(&self, target_id: i64, now: DateTime<Utc>) -> Result<TargetStats, QueryError> {
        self.ensure_target(target_id)?;
        let start = now - ChronoDuration::days(STATS_WINDOW_DAYS);
        let end = now + ChronoDuration::seconds(1);

        let counts = self.store.count_checks(target_id, start, end)?;
        let times = self.store.summarize_response_times(target_id, start, end)?;
        let incident_count = self.store.count_incidents_started(target_id, start, end)?;

        Ok(TargetStats {
            avg_response_time_ms: times.avg.map(|a| (a * 100.0).round() / 100.0).unwrap_or(0.0),
            min_response_time_ms: times.min.unwrap_or(0),
            max_response_time_ms: times.max.unwrap_or(0),
            total_checks: counts.total,
            uptime_percentage: uptime_percentage(counts.up, counts.total),
            incident_count,
        })
    }

    /// History buckets for an inclusive date range.
    pub fn buckets(
        &self,
        target_id: i64,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<HistoryBucket>, QueryError> {
        self.ensure_target(target_id)?;
        if start > end {
            return Err(QueryError::Invalid("start must not be after end".to_string()));
        }
        if (end - start).num_days() > i64::from(MAX_DAYS) {
            return Err(QueryError::Invalid(format!(
                "range must not exceed {} days",
                MAX_DAYS
            )));
        }
        Ok(self.store.get_history_buckets(target_id, start, end)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::store::tests::{add_site, temp_store};
    use crate::db::{CheckStatus, IncidentImpact, NewIncident};
    use crate::scheduler::HistoryAggregator;
    use chrono::TimeZone;

    fn check(target_id: i64, status: CheckStatus, ms: i64, at: DateTime<Utc>) -> RawCheck {
        RawCheck {
            target_id,
            status,
            response_time_ms: ms,
            status_code: (status == CheckStatus::Up).then_some(200),
            error_message: (status == CheckStatus::Down).then(|| "HTTP 503".to_string()),
            metadata: None,
            checked_at: at,
        }
    }

    fn setup() -> (Queries, Arc<Store>, i64, DateTime<Utc>, tempfile::NamedTempFile) {
        let (store, tmp) = temp_store();
        let store = Arc::new(store);
        let id = add_site(&store, "example.com");
        let now = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
        (Queries::new(store.clone()), store, id, now, tmp)
    }

    #[test]
    fn test_unknown_target_is_not_found() {
        let (queries, _store, id, now, _tmp) = setup();
        let missing = id + 100;
        assert!(matches!(
            queries.uptime(missing, UptimePeriod::Hours24, now),
            Err(QueryError::NotFound(m)) if m == missing
        ));
        assert!(matches!(
            queries.history(missing, HistoryWindow::Days(1), None, now),
            Err(QueryError::NotFound(_))
        ));
        assert!(matches!(
            queries.stats(missing, now),
            Err(QueryError::NotFound(_))
        ));
    }

    #[test]
    fn test_target_status_carries_ongoing_incident() {
        let (queries, store, id, now, _tmp) = setup();
        let status = queries.target(id).unwrap();
        assert_eq!(status.target.id, id);
        assert_eq!(status.target.last_status, Some(CheckStatus::Checking));
        assert!(status.ongoing_incident.is_none());

        store.record_check(&check(id, CheckStatus::Down, 0, now)).unwrap();
        store
            .open_incident(&NewIncident {
                target_id: id,
                impact: IncidentImpact::FullOutage,
                started_at: now,
                root_cause: "HTTP 503".to_string(),
            })
            .unwrap();

        let status = queries.target(id).unwrap();
        assert_eq!(status.target.last_status, Some(CheckStatus::Down));
        assert_eq!(status.target.last_error.as_deref(), Some("HTTP 503"));
        assert_eq!(status.ongoing_incident.unwrap().started_at, now);

        assert!(matches!(
            queries.target(id + 1),
            Err(QueryError::NotFound(m)) if m == id + 1
        ));
    }

    #[test]
    fn test_empty_window_is_fully_up() {
        let (queries, _store, id, now, _tmp) = setup();
        let uptime = queries.uptime(id, UptimePeriod::Days7, now).unwrap();
        assert_eq!(uptime.total_checks, 0);
        assert_eq!(uptime.uptime_percentage, 100.0);

        let stats = queries.stats(id, now).unwrap();
        assert_eq!(stats.total_checks, 0);
        assert_eq!(stats.avg_response_time_ms, 0.0);
        assert_eq!(stats.uptime_percentage, 100.0);
    }

    #[test]
    fn test_uptime_counts_window_only() {
        let (queries, store, id, now, _tmp) = setup();
        for (status, hours_ago) in [
            (CheckStatus::Up, 1),
            (CheckStatus::Up, 2),
            (CheckStatus::Down, 3),
            (CheckStatus::Up, 30),
        ] {
            store
                .record_check(&check(id, status, 100, now - ChronoDuration::hours(hours_ago)))
                .unwrap();
        }
        store
            .open_incident(&NewIncident {
                target_id: id,
                impact: IncidentImpact::FullOutage,
                started_at: now - ChronoDuration::hours(3),
                root_cause: "HTTP 503".to_string(),
            })
            .unwrap();

        let day = queries.uptime(id, UptimePeriod::Hours24, now).unwrap();
        assert_eq!(day.total_checks, 3);
        assert_eq!(day.successful_checks, 2);
        assert_eq!(day.failed_checks, 1);
        assert_eq!(day.uptime_percentage, 66.67);
        assert_eq!(day.incident_count, 1);

        let week = queries.uptime(id, UptimePeriod::Days7, now).unwrap();
        assert_eq!(week.total_checks, 4);
        assert_eq!(week.uptime_percentage, 75.0);
    }

    #[test]
    fn test_history_windows_and_validation() {
        let (queries, store, id, now, _tmp) = setup();
        for days_ago in [0, 1, 3] {
            store
                .record_check(&check(
                    id,
                    CheckStatus::Up,
                    50,
                    now - ChronoDuration::days(days_ago) - ChronoDuration::minutes(1),
                ))
                .unwrap();
        }
        store.record_check(&check(id, CheckStatus::Up, 50, now)).unwrap();

        let recent = queries
            .history(id, HistoryWindow::Days(2), None, now)
            .unwrap();
        assert_eq!(recent.len(), 3);
        assert!(recent.windows(2).all(|w| w[0].checked_at <= w[1].checked_at));
        assert_eq!(recent.last().unwrap().checked_at, now);

        let limited = queries
            .history(id, HistoryWindow::Days(7), Some(2), now)
            .unwrap();
        assert_eq!(limited.len(), 2);

        let range = HistoryWindow::Range {
            start: now - ChronoDuration::days(4),
            end: now - ChronoDuration::days(2),
        };
        assert_eq!(queries.history(id, range, None, now).unwrap().len(), 1);

        assert!(matches!(
            queries.history(id, HistoryWindow::Days(0), None, now),
            Err(QueryError::Invalid(_))
        ));
        let backwards = HistoryWindow::Range {
            start: now,
            end: now - ChronoDuration::days(1),
        };
        assert!(matches!(
            queries.history(id, backwards, None, now),
            Err(QueryError::Invalid(_))
        ));
    }

    #[test]
    fn test_history_limit_keeps_most_recent() {
        let (queries, store, id, now, _tmp) = setup();
        for minutes_ago in 0..10 {
            store
                .record_check(&check(
                    id,
                    CheckStatus::Up,
                    minutes_ago,
                    now - ChronoDuration::minutes(minutes_ago),
                ))
                .unwrap();
        }

        let latest = queries
            .history(id, HistoryWindow::Days(1), Some(3), now)
            .unwrap();
        let ages: Vec<i64> = latest.iter().map(|c| c.response_time_ms).collect();
        assert_eq!(ages, vec![2, 1, 0]);
        assert_eq!(latest.last().unwrap().checked_at, now);
    }

    #[test]
    fn test_stats_and_incident_filter() {
        let (queries, store, id, now, _tmp) = setup();
        let samples = [
            (100, CheckStatus::Up),
            (300, CheckStatus::Up),
            (0, CheckStatus::Down),
        ];
        for (ms, status) in samples {
            store
                .record_check(&check(id, status, ms, now - ChronoDuration::days(1)))
                .unwrap();
        }
        let opened = store
            .open_incident(&NewIncident {
                target_id: id,
                impact: IncidentImpact::FullOutage,
                started_at: now - ChronoDuration::days(2),
                root_cause: "timeout after 10s".to_string(),
            })
            .unwrap()
            .unwrap();
        store
            .resolve_ongoing_incident(
                id,
                now - ChronoDuration::days(1),
                "Site recovered automatically",
            )
            .unwrap();
        store
            .open_incident(&NewIncident {
                target_id: id,
                impact: IncidentImpact::FullOutage,
                started_at: now - ChronoDuration::hours(1),
                root_cause: "HTTP 500".to_string(),
            })
            .unwrap();

        let stats = queries.stats(id, now).unwrap();
        assert_eq!(stats.total_checks, 3);
        assert_eq!(stats.min_response_time_ms, 0);
        assert_eq!(stats.max_response_time_ms, 300);
        assert!((stats.avg_response_time_ms - 133.33).abs() < 0.01);
        assert_eq!(stats.uptime_percentage, 66.67);
        assert_eq!(stats.incident_count, 2);

        let all = queries.incidents(id, IncidentFilter::All, None).unwrap();
        assert_eq!(all.len(), 2);
        assert!(all[0].started_at > all[1].started_at);

        let resolved = queries
            .incidents(id, "resolved".parse().unwrap(), None)
            .unwrap();
        assert_eq!(resolved.len(), 1);
        assert_eq!(resolved[0].id, opened.id);

        let ongoing = queries.incidents(id, IncidentFilter::Ongoing, Some(10)).unwrap();
        assert_eq!(ongoing.len(), 1);
        assert_eq!(ongoing[0].root_cause, "HTTP 500");
    }

    #[test]
    fn test_buckets_after_rollup() {
        let (queries, store, id, _now, _tmp) = setup();
        let date = NaiveDate::from_ymd_opt(2024, 6, 14).unwrap();
        let at = Utc.with_ymd_and_hms(2024, 6, 14, 8, 0, 0).unwrap();
        store.record_check(&check(id, CheckStatus::Up, 120, at)).unwrap();
        HistoryAggregator::new(store.clone()).aggregate(date).unwrap();

        let buckets = queries.buckets(id, date, date).unwrap();
        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[0].hour, None);
        assert_eq!(buckets[1].hour, Some(8));

        assert!(matches!(
            queries.buckets(id, date, date - ChronoDuration::days(1)),
            Err(QueryError::Invalid(_))
        ));
    }

    #[test]
    fn test_parse_filters() {
        assert_eq!("24h".parse::<UptimePeriod>().unwrap(), UptimePeriod::Hours24);
        assert_eq!("7D".parse::<UptimePeriod>().unwrap(), UptimePeriod::Days7);
        assert!("90d".parse::<UptimePeriod>().is_err());
        assert_eq!("".parse::<IncidentFilter>().unwrap(), IncidentFilter::All);
        assert!("closed".parse::<IncidentFilter>().is_err());
        assert_eq!(uptime_percentage(0, 0), 100.0);
        assert_eq!(uptime_percentage(1, 3), 33.33);
    }
}
