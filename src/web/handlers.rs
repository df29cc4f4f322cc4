//! HTTP request handlers.

use super::AppState;
use crate::query::{HistoryWindow, IncidentFilter, QueryError, UptimePeriod};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use serde::Deserialize;
use serde_json::json;

/// Days of buckets returned when no range is given.
const DEFAULT_BUCKET_DAYS: i64 = 30;

impl IntoResponse for QueryError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            QueryError::NotFound(_) => (StatusCode::NOT_FOUND, self.to_string()),
            QueryError::Invalid(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            QueryError::Storage(e) => {
                tracing::error!("API: Storage error: {}", e);
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    "Service temporarily unavailable".to_string(),
                )
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

fn parse_time(field: &str, value: &str) -> Result<DateTime<Utc>, QueryError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| QueryError::Invalid(format!("{} must be an RFC 3339 timestamp", field)))
}

fn parse_date(field: &str, value: &str) -> Result<NaiveDate, QueryError> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .map_err(|_| QueryError::Invalid(format!("{} must be a YYYY-MM-DD date", field)))
}

// ============================================================================
// API: Target
// ============================================================================

pub async fn handle_target(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, QueryError> {
    let status = state.queries.target(id)?;
    Ok(Json(status))
}

// ============================================================================
// API: History
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct HistoryParams {
    pub days: Option<u32>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub limit: Option<usize>,
}

impl HistoryParams {
    fn window(&self, now: DateTime<Utc>) -> Result<HistoryWindow, QueryError> {
        match (&self.start, &self.end, self.days) {
            (Some(start), end, _) => {
                let start = parse_time("start", start)?;
                let end = match end {
                    Some(end) => parse_time("end", end)?,
                    None => now + ChronoDuration::seconds(1),
                };
                Ok(HistoryWindow::Range { start, end })
            }
            (None, Some(_), _) => Err(QueryError::Invalid("end requires start".to_string())),
            (None, None, days) => Ok(HistoryWindow::Days(days.unwrap_or(1))),
        }
    }
}

pub async fn handle_history(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<HistoryParams>,
) -> Result<impl IntoResponse, QueryError> {
    let now = Utc::now();
    let window = params.window(now)?;
    let checks = state.queries.history(id, window, params.limit, now)?;
    Ok(Json(checks))
}

// ============================================================================
// API: Uptime and stats
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct UptimeParams {
    pub period: Option<String>,
}

pub async fn handle_uptime(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<UptimeParams>,
) -> Result<impl IntoResponse, QueryError> {
    let period = match params.period.as_deref() {
        Some(p) => p.parse::<UptimePeriod>()?,
        None => UptimePeriod::Hours24,
    };
    let summary = state.queries.uptime(id, period, Utc::now())?;
    Ok(Json(summary))
}

pub async fn handle_stats(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<impl IntoResponse, QueryError> {
    let stats = state.queries.stats(id, Utc::now())?;
    Ok(Json(stats))
}

// ============================================================================
// API: Incidents
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct IncidentParams {
    pub status: Option<String>,
    pub limit: Option<usize>,
}

pub async fn handle_incidents(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<IncidentParams>,
) -> Result<impl IntoResponse, QueryError> {
    let filter = match params.status.as_deref() {
        Some(s) => s.parse::<IncidentFilter>()?,
        None => IncidentFilter::All,
    };
    let incidents = state.queries.incidents(id, filter, params.limit)?;
    Ok(Json(incidents))
}

// ============================================================================
// API: Buckets
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct BucketParams {
    pub start: Option<String>,
    pub end: Option<String>,
}

pub async fn handle_buckets(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<BucketParams>,
) -> Result<impl IntoResponse, QueryError> {
    let end = match params.end.as_deref() {
        Some(end) => parse_date("end", end)?,
        None => Utc::now().date_naive(),
    };
    let start = match params.start.as_deref() {
        Some(start) => parse_date("start", start)?,
        None => end - ChronoDuration::days(DEFAULT_BUCKET_DAYS - 1),
    };
    let buckets = state.queries.buckets(id, start, end)?;
    Ok(Json(buckets))
}

// ============================================================================
// API: Jobs
// ============================================================================

pub async fn handle_jobs(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.jobs.snapshot())
}

#[cfg(test)]
mod tests {
    use super::super::Server;
    use crate::config::ServerConfig;
    use crate::db::store::tests::{add_site, temp_store};
    use crate::db::{CheckStatus, RawCheck, Store};
    use crate::query::Queries;
    use crate::scheduler::JobRegistry;
    use chrono::Utc;
    use serde_json::Value;
    use std::sync::Arc;
    use std::time::Duration;

    async fn spawn_api(store: Arc<Store>, jobs: Arc<JobRegistry>) -> String {
        let server = Server::new(&ServerConfig::default(), Queries::new(store), jobs);
        let router = server.routes();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn client() -> reqwest::Client {
        reqwest::Client::builder().no_proxy().build().unwrap()
    }

    #[tokio::test]
    async fn test_uptime_and_history_endpoints() {
        let (store, _tmp) = temp_store();
        let store = Arc::new(store);
        let id = add_site(&store, "example.com");
        store
            .record_check(&RawCheck {
                target_id: id,
                status: CheckStatus::Up,
                response_time_ms: 42,
                status_code: Some(200),
                error_message: None,
                metadata: None,
                checked_at: Utc::now() - chrono::Duration::minutes(5),
            })
            .unwrap();
        let base = spawn_api(store, Arc::new(JobRegistry::new())).await;

        let resp = client()
            .get(format!("{}/api/targets/{}/uptime?period=7d", base, id))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let body: Value = resp.json().await.unwrap();
        assert_eq!(body["total_checks"], 1);
        assert_eq!(body["uptime_percentage"], 100.0);
        assert_eq!(body["period"], "7d");

        let history: Value = client()
            .get(format!("{}/api/targets/{}/history?days=1", base, id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(history.as_array().unwrap().len(), 1);
        assert_eq!(history[0]["status"], "up");
        assert_eq!(history[0]["response_time_ms"], 42);
    }

    #[tokio::test]
    async fn test_error_statuses() {
        let (store, _tmp) = temp_store();
        let store = Arc::new(store);
        let id = add_site(&store, "example.com");
        let base = spawn_api(store, Arc::new(JobRegistry::new())).await;

        let missing = client()
            .get(format!("{}/api/targets/{}/stats", base, id + 1))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), 404);

        let missing_target = client()
            .get(format!("{}/api/targets/{}", base, id + 1))
            .send()
            .await
            .unwrap();
        assert_eq!(missing_target.status(), 404);

        let target: Value = client()
            .get(format!("{}/api/targets/{}", base, id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(target["id"], id);
        assert_eq!(target["url"], "example.com");
        assert_eq!(target["ongoing_incident"], Value::Null);

        let bad_period = client()
            .get(format!("{}/api/targets/{}/uptime?period=1y", base, id))
            .send()
            .await
            .unwrap();
        assert_eq!(bad_period.status(), 400);

        let bad_status = client()
            .get(format!("{}/api/targets/{}/incidents?status=closed", base, id))
            .send()
            .await
            .unwrap();
        assert_eq!(bad_status.status(), 400);

        let bad_date = client()
            .get(format!("{}/api/targets/{}/buckets?start=yesterday", base, id))
            .send()
            .await
            .unwrap();
        assert_eq!(bad_date.status(), 400);

        let empty: Value = client()
            .get(format!("{}/api/targets/{}/incidents", base, id))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(empty, Value::Array(vec![]));
    }

    #[tokio::test]
    async fn test_jobs_endpoint() {
        let (store, _tmp) = temp_store();
        let jobs = Arc::new(JobRegistry::new());
        jobs.register("checks", Some(Duration::from_secs(60)));
        jobs.register("retention", None);
        let base = spawn_api(Arc::new(store), jobs).await;

        let body: Value = client()
            .get(format!("{}/api/jobs", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let jobs = body.as_array().unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0]["name"], "checks");
        assert_eq!(jobs[0]["state"], "idle");
        assert_eq!(jobs[1]["state"], "disabled");
    }
}
