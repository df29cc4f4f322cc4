//! sitewatch - HTTP uptime monitoring
//!
//! Probes registered targets on their intervals, opens and resolves incidents on
//! status transitions, rolls raw checks into percentile history and retires old data.

mod config;
mod db;
mod probe;
mod query;
mod scheduler;
mod web;

use config::ServerConfig;
use db::Store;
use probe::ProbeExecutor;
use query::Queries;
use scheduler::{
    log_incident_events, CheckScheduler, HistoryAggregator, IncidentDetector, JobRegistry,
    PeriodicRunner, RetentionManager,
};
use web::Server;

use chrono::Utc;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env()
            .add_directive("sitewatch=info".parse()?))
        .init();

    // Load configuration
    let cfg = ServerConfig::load();
    tracing::info!("Starting sitewatch on port {}...", cfg.http_port);
    tracing::info!("Using database at {}", cfg.db_path);

    // Initialize database
    let store = Arc::new(Store::new(&cfg.db_path)?);
    tracing::info!("Database initialized successfully");

    seed_targets(&store, &cfg)?;

    let executor = ProbeExecutor::new()?;
    let detector = Arc::new(IncidentDetector::new(store.clone()));
    tokio::spawn(log_incident_events(detector.subscribe()));
    let checks = Arc::new(CheckScheduler::new(
        store.clone(),
        executor,
        detector,
        cfg.probe_workers,
        cfg.probe_timeout(),
    ));
    let aggregator = Arc::new(HistoryAggregator::new(store.clone()));
    let retention = Arc::new(RetentionManager::new(
        store.clone(),
        cfg.raw_retention_days,
        cfg.stale_incident_days,
    ));

    // Start periodic jobs
    let jobs = Arc::new(JobRegistry::new());
    let runner = PeriodicRunner::new(jobs.clone());

    let max_batch = cfg.max_batch;
    runner.run_periodic("checks", cfg.check_tick(), move || {
        let checks = checks.clone();
        async move {
            checks
                .run_due_checks(Utc::now(), max_batch)
                .await
                .map(|s| {
                    format!(
                        "checked={} up={} down={} errors={}",
                        s.checked, s.up, s.down, s.errors
                    )
                })
                .map_err(|e| e.to_string())
        }
    });

    runner.run_periodic("rollup", cfg.aggregate_tick(), move || {
        let aggregator = aggregator.clone();
        async move {
            tokio::task::spawn_blocking(move || aggregator.aggregate_previous_day(Utc::now()))
                .await
                .map_err(|e| e.to_string())?
                .map(|n| format!("buckets={}", n))
                .map_err(|e| e.to_string())
        }
    });

    runner.run_periodic("retention", cfg.cleanup_tick(), move || {
        let retention = retention.clone();
        async move {
            let report = tokio::task::spawn_blocking(move || retention.cleanup(Utc::now()))
                .await
                .map_err(|e| e.to_string())?;
            Ok(format!(
                "deleted_raw_checks={} force_resolved_incidents={}",
                report.deleted_raw_checks, report.force_resolved_incidents
            ))
        }
    });

    // Start web server
    let server = Server::new(&cfg, Queries::new(store), runner.registry());
    tokio::select! {
        result = server.start() => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("Shutting down"),
    }

    runner.stop();
    Ok(())
}

/// Add the configured seed URLs as sites when the store has no targets.
fn seed_targets(store: &Store, cfg: &ServerConfig) -> Result<(), db::DbError> {
    if cfg.seed_targets.is_empty() || !store.get_targets()?.is_empty() {
        return Ok(());
    }

    for url in &cfg.seed_targets {
        let mut target = db::Target {
            url: url.clone(),
            ..Default::default()
        };
        let id = store.add_target(&mut target)?;
        tracing::info!("Added seed target {} ({})", target.url, id);
    }
    Ok(())
}
