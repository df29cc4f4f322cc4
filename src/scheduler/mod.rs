//! Scheduler module: due-check passes, incident detection, rollups and retention.

mod incident;
mod jobs;
mod retention;
mod rollup;

pub use incident::*;
pub use jobs::*;
pub use retention::*;
pub use rollup::*;

use crate::db::{CheckStatus, DbError, Store, Target};
use crate::probe::{ProbeExecutor, ProbeRequest};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Counters for one due-check pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub checked: usize,
    pub up: usize,
    pub down: usize,
    /// Targets whose result could not be persisted.
    pub errors: usize,
}

/// Outcome of checking a single target.
#[derive(Debug)]
struct TargetOutcome {
    status: CheckStatus,
    persisted: bool,
}

/// Selects due targets and probes them with bounded parallelism.
pub struct CheckScheduler {
    store: Arc<Store>,
    executor: ProbeExecutor,
    detector: Arc<IncidentDetector>,
    workers: usize,
    default_timeout: Duration,
    in_flight: Arc<Mutex<HashSet<i64>>>,
}

impl CheckScheduler {
    pub fn new(
        store: Arc<Store>,
        executor: ProbeExecutor,
        detector: Arc<IncidentDetector>,
        workers: usize,
        default_timeout: Duration,
    ) -> Self {
        Self {
            store,
            executor,
            detector,
            workers: workers.max(1),
            default_timeout,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Probe up to `max_batch` targets that are due at `now`.
    ///
    /// `now` only selects which targets are due. Each check is stamped with the wall
    /// clock at the moment its probe starts, so a slow batch still records when every
    /// probe actually ran.
    ///
    /// Only failing to select targets is an error. Per-target storage failures are
    /// logged and counted; they never abort the batch.
    pub async fn run_due_checks(
        &self,
        now: DateTime<Utc>,
        max_batch: usize,
    ) -> Result<BatchSummary, DbError> {
        let targets = self.store.get_due_targets(now, max_batch)?;
        if targets.is_empty() {
            return Ok(BatchSummary::default());
        }

        tracing::debug!("Scheduler: {} targets due", targets.len());

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();

        for target in targets {
            let Some(guard) = InFlightGuard::claim(&self.in_flight, target.id) else {
                tracing::debug!("Scheduler: Skipping {}, check already in flight", target.name);
                continue;
            };

            let permit = match semaphore.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };

            let store = self.store.clone();
            let executor = self.executor.clone();
            let detector = self.detector.clone();
            let timeout = self.default_timeout;

            tasks.spawn(async move {
                let _permit = permit;
                let _guard = guard;
                check_target(&store, &executor, &detector, &target, timeout).await
            });
        }

        let mut summary = BatchSummary::default();
        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(o) => o,
                Err(e) => {
                    tracing::error!("Scheduler: Check task failed: {}", e);
                    summary.errors += 1;
                    continue;
                }
            };

            summary.checked += 1;
            match outcome.status {
                CheckStatus::Up => summary.up += 1,
                CheckStatus::Down => summary.down += 1,
                CheckStatus::Checking => {}
            }
            if !outcome.persisted {
                summary.errors += 1;
            }
        }

        tracing::info!(
            "Scheduler: Checked {} targets ({} up, {} down, {} errors)",
            summary.checked,
            summary.up,
            summary.down,
            summary.errors
        );
        Ok(summary)
    }
}

/// Probe one target, persist the result, then run incident detection against the
/// previous status read in the same transaction as the insert.
async fn check_target(
    store: &Store,
    executor: &ProbeExecutor,
    detector: &IncidentDetector,
    target: &Target,
    default_timeout: Duration,
) -> TargetOutcome {
    let request = ProbeRequest::for_target(target, default_timeout);
    // Probe start time, not the pass's selection time
    let checked_at = Utc::now();
    let result = executor.probe(&request).await;
    let status = result.status;

    if let Some(error) = &result.error {
        tracing::debug!(
            "Scheduler: {} is down ({}): {}",
            target.name,
            error.kind(),
            error
        );
    }

    let check = result.into_raw_check(target.id, checked_at);
    let recorded = match store.record_check(&check) {
        Ok(r) => r,
        Err(e) => {
            tracing::error!("Scheduler: Failed to record check for {}: {}", target.name, e);
            return TargetOutcome {
                status,
                persisted: false,
            };
        }
    };
    tracing::debug!(
        "Scheduler: Recorded check {} for {} ({})",
        recorded.id,
        target.name,
        check.status
    );

    if let Err(e) = detector.observe(recorded.previous_status, &check) {
        tracing::error!(
            "Scheduler: Incident detection failed for {}: {}",
            target.name,
            e
        );
    }

    TargetOutcome {
        status,
        persisted: true,
    }
}

/// Marks a target as being checked until dropped.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<i64>>>,
    target_id: i64,
}

impl InFlightGuard {
    fn claim(set: &Arc<Mutex<HashSet<i64>>>, target_id: i64) -> Option<Self> {
        let inserted = set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(target_id);
        inserted.then(|| Self {
            set: set.clone(),
            target_id,
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.target_id);
    }
}
