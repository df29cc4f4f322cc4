//! Retention manager for cleaning up old data.

use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;

use crate::db::Store;

pub const STALE_RESOLUTION_STEPS: &str = "Auto-resolved: stale incident";

/// Rows removed per delete statement.
const DELETE_BATCH_SIZE: usize = 5_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub deleted_raw_checks: usize,
    pub force_resolved_incidents: usize,
}

/// Deletes raw checks past the retention horizon and closes incidents that have
/// been open past the staleness horizon. Only rows older than a horizon are
/// touched, so it can run alongside the check scheduler.
pub struct RetentionManager {
    store: Arc<Store>,
    raw_retention: ChronoDuration,
    stale_incident_age: ChronoDuration,
}

impl RetentionManager {
    pub fn new(store: Arc<Store>, raw_retention_days: i64, stale_incident_days: i64) -> Self {
        Self {
            store,
            raw_retention: ChronoDuration::days(raw_retention_days.max(1)),
            stale_incident_age: ChronoDuration::days(stale_incident_days.max(1)),
        }
    }

    /// Run both halves. A failure in one is logged and does not stop the other.
    pub fn cleanup(&self, now: DateTime<Utc>) -> CleanupReport {
        let report = CleanupReport {
            deleted_raw_checks: self.delete_old_checks(now),
            force_resolved_incidents: self.resolve_stale_incidents(now),
        };

        tracing::info!(
            "RetentionManager: deleted {} raw checks, force-resolved {} incidents",
            report.deleted_raw_checks,
            report.force_resolved_incidents
        );
        report
    }

    fn delete_old_checks(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.raw_retention;
        let mut deleted = 0;

        loop {
            match self.store.delete_checks_before(cutoff, DELETE_BATCH_SIZE) {
                Ok(0) => break,
                Ok(n) => {
                    deleted += n;
                    if n < DELETE_BATCH_SIZE {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(
                        "RetentionManager: Failed to delete raw checks before {}: {}",
                        cutoff,
                        e
                    );
                    break;
                }
            }
        }

        deleted
    }

    fn resolve_stale_incidents(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.stale_incident_age;
        match self
            .store
            .resolve_incidents_started_before(cutoff, now, STALE_RESOLUTION_STEPS)
        {
            Ok(resolved) => {
                for incident in &resolved {
                    tracing::warn!(
                        "RetentionManager: Force-resolved incident {} for target {} (since {})",
                        incident.id,
                        incident.target_id,
                        incident.started_at
                    );
                }
                resolved.len()
            }
            Err(e) => {
                tracing::error!("RetentionManager: Failed to resolve stale incidents: {}", e);
                0
            }
        }
    }
}
