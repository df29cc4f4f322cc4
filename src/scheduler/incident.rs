//! Incident detection.
//!
//! Each target is either without an incident or has exactly one ongoing incident.
//! Transitions are driven by the status of a check relative to the check that
//! immediately preceded it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast::{self, error::RecvError};

use crate::db::{CheckStatus, DbError, Incident, IncidentImpact, NewIncident, RawCheck, Store};

pub const DEFAULT_ROOT_CAUSE: &str = "Site is down";
pub const RECOVERY_STEPS: &str = "Site recovered automatically";

/// What a check implies for the target's incident state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    None,
    Open {
        started_at: DateTime<Utc>,
        root_cause: String,
    },
    Close {
        resolved_at: DateTime<Utc>,
    },
}

/// Evaluate the transition table. A first-ever check, or `checking` on either side,
/// never transitions.
pub fn evaluate(previous: Option<CheckStatus>, current: &RawCheck) -> Transition {
    match (previous, current.status) {
        (Some(CheckStatus::Up), CheckStatus::Down) => Transition::Open {
            started_at: current.checked_at,
            root_cause: current
                .error_message
                .clone()
                .filter(|m| !m.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_ROOT_CAUSE.to_string()),
        },
        (Some(CheckStatus::Down), CheckStatus::Up) => Transition::Close {
            resolved_at: current.checked_at,
        },
        _ => Transition::None,
    }
}

/// Published whenever an incident opens or closes.
#[derive(Debug, Clone, PartialEq)]
pub enum IncidentEvent {
    Opened(Incident),
    Resolved(Incident),
}

impl IncidentEvent {
    pub fn incident(&self) -> &Incident {
        match self {
            IncidentEvent::Opened(i) | IncidentEvent::Resolved(i) => i,
        }
    }
}

/// Applies transitions to the store and publishes the resulting events.
pub struct IncidentDetector {
    store: Arc<Store>,
    events: broadcast::Sender<IncidentEvent>,
}

impl IncidentDetector {
    pub fn new(store: Arc<Store>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self { store, events }
    }

    /// Subscribe to incident events. Slow receivers may observe `Lagged`.
    pub fn subscribe(&self) -> broadcast::Receiver<IncidentEvent> {
        self.events.subscribe()
    }

    /// Apply the transition implied by `check`, given the status of the check
    /// that preceded it. Opening is a no-op when an incident is already ongoing;
    /// closing is a no-op when none is.
    pub fn observe(
        &self,
        previous: Option<CheckStatus>,
        check: &RawCheck,
    ) -> Result<Option<IncidentEvent>, DbError> {
        let event = match evaluate(previous, check) {
            Transition::None => None,
            Transition::Open {
                started_at,
                root_cause,
            } => {
                let new = NewIncident {
                    target_id: check.target_id,
                    impact: IncidentImpact::FullOutage,
                    started_at,
                    root_cause,
                };
                match self.store.open_incident(&new)? {
                    Some(incident) => {
                        tracing::warn!(
                            "IncidentDetector: target {} is down since {}: {}",
                            incident.target_id,
                            incident.started_at,
                            incident.root_cause
                        );
                        Some(IncidentEvent::Opened(incident))
                    }
                    None => {
                        tracing::debug!(
                            "IncidentDetector: target {} already has an ongoing incident",
                            check.target_id
                        );
                        None
                    }
                }
            }
            Transition::Close { resolved_at } => self
                .store
                .resolve_ongoing_incident(check.target_id, resolved_at, RECOVERY_STEPS)?
                .map(|incident| {
                    tracing::info!(
                        "IncidentDetector: target {} recovered after {} min",
                        incident.target_id,
                        incident.duration_minutes.unwrap_or(0)
                    );
                    IncidentEvent::Resolved(incident)
                }),
        };

        if let Some(event) = &event {
            // No subscribers is fine
            let _ = self.events.send(event.clone());
        }
        Ok(event)
    }
}

/// Drain incident events into the log until every sender is dropped. Returns the
/// number of events received.
pub async fn log_incident_events(mut events: broadcast::Receiver<IncidentEvent>) -> u64 {
    let mut received = 0;
    loop {
        match events.recv().await {
            Ok(event) => {
                received += 1;
                let incident = event.incident();
                match &event {
                    IncidentEvent::Opened(_) => tracing::info!(
                        "Alerts: incident {} opened for target {}: {}",
                        incident.id,
                        incident.target_id,
                        incident.root_cause
                    ),
                    IncidentEvent::Resolved(_) => tracing::info!(
                        "Alerts: incident {} resolved for target {} after {} min",
                        incident.id,
                        incident.target_id,
                        incident.duration_minutes.unwrap_or(0)
                    ),
                }
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!("Alerts: dropped {} incident events", skipped);
            }
            Err(RecvError::Closed) => break,
        }
    }
    received
}
