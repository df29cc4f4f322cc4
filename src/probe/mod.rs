//! Probe module for HTTP health checks.
//!
//! A probe never fails from the caller's point of view: every error is folded into
//! a `down` result carrying one of the `ProbeError` kinds.

mod http;

pub use http::*;

use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use regex::Regex;
use thiserror::Error;

use crate::db::{CheckMetadata, CheckStatus, RawCheck, Target, TargetKind};

/// Probe error types, in classification priority order.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("DNS resolution failed: {0}")]
    Dns(String),
    #[error("connection refused: {0}")]
    ConnectionRefused(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl ProbeError {
    /// Stable taxonomy label.
    pub fn kind(&self) -> &'static str {
        match self {
            ProbeError::Timeout(_) => "timeout",
            ProbeError::Dns(_) => "dns_failure",
            ProbeError::ConnectionRefused(_) => "connection_refused",
            ProbeError::Network(_) | ProbeError::Config(_) => "network_error",
            ProbeError::Unexpected(_) => "unexpected_error",
        }
    }
}

/// How a response status is judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusExpectation {
    /// Any status in `[200, 400)`.
    Success,
    /// Exactly this status.
    Exact(u16),
}

impl StatusExpectation {
    pub fn matches(&self, status: u16) -> bool {
        match self {
            StatusExpectation::Success => (200..400).contains(&status),
            StatusExpectation::Exact(expected) => status == *expected,
        }
    }
}

/// Everything needed to run one probe.
#[derive(Debug, Clone)]
pub struct ProbeRequest {
    pub url: String,
    pub timeout: Duration,
    /// `None` probes with HEAD and falls back to GET.
    pub method: Option<String>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub expect: StatusExpectation,
}

impl ProbeRequest {
    pub fn new(url: &str, timeout: Duration) -> Self {
        Self {
            url: url.to_string(),
            timeout,
            method: None,
            headers: BTreeMap::new(),
            body: None,
            expect: StatusExpectation::Success,
        }
    }

    /// Build the request for a stored target. Endpoints default to GET and 200.
    pub fn for_target(target: &Target, default_timeout: Duration) -> Self {
        let timeout = if target.timeout_secs > 0.0 && target.timeout_secs.is_finite() {
            Duration::from_secs_f64(target.timeout_secs)
        } else {
            default_timeout
        };

        let mut request = Self::new(&target.url, timeout);
        if target.kind == TargetKind::Endpoint {
            request.method = Some(target.method.clone().unwrap_or_else(|| "GET".to_string()));
            request.headers = target.headers.clone();
            request.body = target.body.clone();
            request.expect = StatusExpectation::Exact(target.expected_status.unwrap_or(200));
        }
        request
    }
}

/// Normalized outcome of one probe.
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub status: CheckStatus,
    pub response_time_ms: i64,
    pub status_code: Option<u16>,
    pub error: Option<ProbeError>,
    pub error_message: Option<String>,
    pub metadata: CheckMetadata,
}

impl ProbeResult {
    fn failed(error: ProbeError, response_time_ms: i64, metadata: CheckMetadata) -> Self {
        Self {
            status: CheckStatus::Down,
            response_time_ms,
            status_code: None,
            error_message: Some(error.to_string()),
            error: Some(error),
            metadata,
        }
    }

    /// Convert into the persisted record for `target_id`.
    pub fn into_raw_check(self, target_id: i64, checked_at: DateTime<Utc>) -> RawCheck {
        RawCheck {
            target_id,
            status: self.status,
            response_time_ms: self.response_time_ms.max(0),
            status_code: self.status_code,
            error_message: self.error_message,
            metadata: Some(self.metadata),
            checked_at,
        }
    }
}

/// Issues probes over a shared HTTP client.
#[derive(Clone)]
pub struct ProbeExecutor {
    client: reqwest::Client,
    jitter: bool,
}

impl ProbeExecutor {
    pub fn new() -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .user_agent(concat!("sitewatch/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ProbeError::Config(e.to_string()))?;
        Ok(Self::with_client(client))
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client,
            jitter: true,
        }
    }

    #[cfg(test)]
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Run one probe. Never returns an error and never panics outward: a panic in
    /// the probe task becomes an `unexpected_error` result.
    pub async fn probe(&self, request: &ProbeRequest) -> ProbeResult {
        if self.jitter {
            // Spread outbound bursts; not part of the measured time
            let jitter = rand::random::<u64>() % 100;
            tokio::time::sleep(Duration::from_millis(jitter)).await;
        }

        let client = self.client.clone();
        let owned = request.clone();
        let started = Instant::now();
        let handle = tokio::spawn(async move { run_http_probe(&client, &owned).await });

        match handle.await {
            Ok(result) => result,
            Err(e) => {
                let elapsed = started.elapsed().as_millis() as i64;
                tracing::error!("Probe task for {} aborted: {}", request.url, e);
                let error = if e.is_panic() {
                    ProbeError::Unexpected("probe task panicked".to_string())
                } else {
                    ProbeError::Unexpected(e.to_string())
                };
                ProbeResult::failed(error, elapsed, CheckMetadata::default())
            }
        }
    }
}

fn scheme_regex() -> &'static Regex {
    static SCHEME: OnceLock<Regex> = OnceLock::new();
    SCHEME.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9+.\-]*://").expect("valid scheme regex"))
}

/// Prefix a scheme when missing: `http://` for loopback hosts, `https://` otherwise.
pub fn normalize_url(address: &str) -> String {
    let address = address.trim();
    if scheme_regex().is_match(address) {
        return address.to_string();
    }

    let host = address
        .split(['/', '?', '#'])
        .next()
        .unwrap_or_default()
        .rsplit('@')
        .next()
        .unwrap_or_default();
    let host = match host.rsplit_once(':') {
        Some((h, port)) if port.chars().all(|c| c.is_ascii_digit()) => h,
        _ => host,
    };

    if host.eq_ignore_ascii_case("localhost") || host == "127.0.0.1" {
        format!("http://{}", address)
    } else {
        format!("https://{}", address)
    }
}
