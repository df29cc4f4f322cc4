//! Database model types.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Returned when an inbound status string maps to none of the known values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("unrecognized {kind} value: {value:?}")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Implements string conversion and SQLite (de)serialization for a closed enum.
macro_rules! text_enum {
    (
        $ty:ident,
        $kind:literal,
        { $($variant:ident => $text:literal $(| $alias:literal)*),+ $(,)? }
    ) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text $(| $alias)* => Ok($ty::$variant),)+
                    _ => Err(ParseEnumError::new($kind, s)),
                }
            }
        }

        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: ParseEnumError| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

/// Outcome of a single check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Up,
    Down,
    Checking,
}

text_enum!(CheckStatus, "check status", {
    Up => "up" | "online" | "ok" | "healthy",
    Down => "down" | "offline" | "error" | "failed",
    Checking => "checking" | "pending",
});

/// What kind of thing a target is. Endpoints carry a request shape and an exact
/// expected status; sites and pages are probed with a bare HEAD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    #[default]
    Site,
    Page,
    Endpoint,
}

text_enum!(TargetKind, "target kind", {
    Site => "site",
    Page => "page",
    Endpoint => "endpoint" | "api_endpoint",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Ongoing,
    Resolved,
}

text_enum!(IncidentStatus, "incident status", {
    Ongoing => "ongoing",
    Resolved => "resolved",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentImpact {
    FullOutage,
    PartialOutage,
    Degraded,
}

text_enum!(IncidentImpact, "incident impact", {
    FullOutage => "full_outage",
    PartialOutage => "partial_outage",
    Degraded => "degraded",
});

/// A monitored URL plus the write-back fields the scheduler maintains.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub kind: TargetKind,
    pub check_interval_secs: i64,
    pub timeout_secs: f64,
    pub enabled: bool,
    /// Endpoint request method; `None` means HEAD with GET fallback.
    pub method: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub expected_status: Option<u16>,
    pub last_check_at: Option<DateTime<Utc>>,
    pub last_status: Option<CheckStatus>,
    pub last_response_time_ms: Option<i64>,
    pub last_error: Option<String>,
}

impl Default for Target {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            url: String::new(),
            kind: TargetKind::Site,
            check_interval_secs: 300,
            timeout_secs: 10.0,
            enabled: true,
            method: None,
            headers: BTreeMap::new(),
            body: None,
            expected_status: None,
            last_check_at: None,
            last_status: None,
            last_response_time_ms: None,
            last_error: None,
        }
    }
}

impl Target {
    /// A target is due when it was never checked or its interval has elapsed.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        match self.last_check_at {
            None => true,
            Some(last) => now >= last + ChronoDuration::seconds(self.check_interval_secs.max(0)),
        }
    }
}

/// Opportunistic response details captured alongside a check.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CheckMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub is_https: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssl_valid: Option<bool>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional: BTreeMap<String, String>,
}

/// The persisted result of one probe.
#[derive(Debug, Clone, Serialize)]
pub struct RawCheck {
    pub target_id: i64,
    pub status: CheckStatus,
    pub response_time_ms: i64,
    pub status_code: Option<u16>,
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<CheckMetadata>,
    pub checked_at: DateTime<Utc>,
}

/// A contiguous span during which a target was observed down.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Incident {
    pub id: i64,
    pub target_id: i64,
    pub status: IncidentStatus,
    pub impact: IncidentImpact,
    pub started_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub duration_minutes: Option<i64>,
    pub root_cause: String,
    pub resolution_steps: Option<String>,
}

impl Incident {
    /// Close the incident at `at`, computing whole elapsed minutes.
    pub fn resolve(&mut self, at: DateTime<Utc>, steps: &str) {
        self.status = IncidentStatus::Resolved;
        self.resolved_at = Some(at);
        self.duration_minutes = Some(duration_minutes(self.started_at, at));
        self.resolution_steps = Some(steps.to_string());
    }
}

/// `floor((end - start) / 60s)`, never negative.
pub fn duration_minutes(start: DateTime<Utc>, end: DateTime<Utc>) -> i64 {
    (end - start).num_seconds().max(0).div_euclid(60)
}

/// Fields needed to open an incident; the store assigns the id.
#[derive(Debug, Clone)]
pub struct NewIncident {
    pub target_id: i64,
    pub impact: IncidentImpact,
    pub started_at: DateTime<Utc>,
    pub root_cause: String,
}

/// Percentile summary of one target's checks over a date or an hour of it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryBucket {
    pub target_id: i64,
    pub date: NaiveDate,
    /// `None` is the whole-day rollup.
    pub hour: Option<u8>,
    pub p50: i64,
    pub p95: i64,
    pub p99: Option<i64>,
    pub avg: f64,
    pub min: i64,
    pub max: i64,
    pub check_count: i64,
}

/// Counts of checks within a window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckCounts {
    pub total: i64,
    pub up: i64,
    pub down: i64,
}

/// Response time aggregates within a window; all `None` when there were no checks.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResponseTimeSummary {
    pub avg: Option<f64>,
    pub min: Option<i64>,
    pub max: Option<i64>,
}
