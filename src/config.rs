//! Configuration module for sitewatch.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the query API (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "sitewatch.db")
    pub db_path: String,
    /// Cadence of the due-check pass in seconds; 0 disables it (default: 60)
    pub check_tick_secs: u64,
    /// Maximum targets probed per pass (default: 50)
    pub max_batch: usize,
    /// Concurrent probes per pass (default: 8)
    pub probe_workers: usize,
    /// Probe timeout for targets without their own (default: 10)
    pub probe_timeout_secs: u64,
    /// Cadence of the history rollup in seconds; 0 disables it (default: 86400)
    pub aggregate_tick_secs: u64,
    /// Cadence of the retention pass in seconds; 0 disables it (default: 86400)
    pub cleanup_tick_secs: u64,
    /// Raw checks older than this are deleted (default: 30)
    pub raw_retention_days: i64,
    /// Ongoing incidents older than this are force-resolved (default: 7)
    pub stale_incident_days: i64,
    /// URLs added as sites when the store has no targets.
    pub seed_targets: Vec<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "sitewatch.db".to_string(),
            check_tick_secs: 60,
            max_batch: 50,
            probe_workers: 8,
            probe_timeout_secs: 10,
            aggregate_tick_secs: 86_400,
            cleanup_tick_secs: 86_400,
            raw_retention_days: 30,
            stale_incident_days: 7,
            seed_targets: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `SITEWATCH_HTTP_PORT`
    /// - `SITEWATCH_DB_PATH`
    /// - `SITEWATCH_CHECK_TICK_SECS`
    /// - `SITEWATCH_MAX_BATCH`
    /// - `SITEWATCH_PROBE_WORKERS`
    /// - `SITEWATCH_PROBE_TIMEOUT_SECS`
    /// - `SITEWATCH_AGGREGATE_TICK_SECS`
    /// - `SITEWATCH_CLEANUP_TICK_SECS`
    /// - `SITEWATCH_RAW_RETENTION_DAYS`
    /// - `SITEWATCH_STALE_INCIDENT_DAYS`
    /// - `SITEWATCH_SEED_TARGETS`: comma-separated URLs
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        set_parsed(&lookup, "SITEWATCH_HTTP_PORT", &mut cfg.http_port);
        if let Some(db_path) = lookup("SITEWATCH_DB_PATH") {
            cfg.db_path = db_path;
        }
        set_parsed(&lookup, "SITEWATCH_CHECK_TICK_SECS", &mut cfg.check_tick_secs);
        set_parsed(&lookup, "SITEWATCH_MAX_BATCH", &mut cfg.max_batch);
        set_parsed(&lookup, "SITEWATCH_PROBE_WORKERS", &mut cfg.probe_workers);
        set_parsed(&lookup, "SITEWATCH_PROBE_TIMEOUT_SECS", &mut cfg.probe_timeout_secs);
        set_parsed(&lookup, "SITEWATCH_AGGREGATE_TICK_SECS", &mut cfg.aggregate_tick_secs);
        set_parsed(&lookup, "SITEWATCH_CLEANUP_TICK_SECS", &mut cfg.cleanup_tick_secs);
        set_parsed(&lookup, "SITEWATCH_RAW_RETENTION_DAYS", &mut cfg.raw_retention_days);
        set_parsed(&lookup, "SITEWATCH_STALE_INCIDENT_DAYS", &mut cfg.stale_incident_days);

        if let Some(seeds) = lookup("SITEWATCH_SEED_TARGETS") {
            cfg.seed_targets = seeds
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }

        cfg.max_batch = cfg.max_batch.max(1);
        cfg.probe_workers = cfg.probe_workers.max(1);
        if cfg.probe_timeout_secs == 0 {
            cfg.probe_timeout_secs = 10;
        }

        cfg
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// `None` when the job is disabled.
    pub fn check_tick(&self) -> Option<Duration> {
        tick(self.check_tick_secs)
    }

    pub fn aggregate_tick(&self) -> Option<Duration> {
        tick(self.aggregate_tick_secs)
    }

    pub fn cleanup_tick(&self) -> Option<Duration> {
        tick(self.cleanup_tick_secs)
    }
}

fn tick(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

fn set_parsed<T, F>(lookup: &F, key: &str, field: &mut T)
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    if let Some(raw) = lookup(key) {
        match raw.trim().parse() {
            Ok(value) => *field = value,
            Err(_) => tracing::warn!("Config: ignoring invalid {}={:?}", key, raw),
        }
    }
}
