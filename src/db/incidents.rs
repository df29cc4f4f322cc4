//! Incident persistence. Every write that depends on the "one ongoing incident per
//! target" invariant happens inside a single statement or transaction.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Result as SqlResult, Row};

use super::models::*;
use super::store::{db_time, optional_time_column, time_column, DbError, Store};

const INCIDENT_COLUMNS: &str = "id, target_id, status, impact, started_at, resolved_at, \
     duration_minutes, root_cause, resolution_steps";

impl Store {
    /// Open an incident unless the target already has an ongoing one.
    ///
    /// Returns `None` when an ongoing incident already exists.
    pub fn open_incident(&self, new: &NewIncident) -> Result<Option<Incident>, DbError> {
        let conn = self.conn();
        let inserted = conn.execute(
            "INSERT INTO incidents (target_id, status, impact, started_at, root_cause)
             SELECT ?1, ?2, ?3, ?4, ?5
             WHERE NOT EXISTS (SELECT 1 FROM incidents WHERE target_id = ?1 AND status = ?2)",
            params![
                new.target_id,
                IncidentStatus::Ongoing,
                new.impact,
                db_time(new.started_at),
                new.root_cause,
            ],
        );

        match inserted {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(Incident {
                id: conn.last_insert_rowid(),
                target_id: new.target_id,
                status: IncidentStatus::Ongoing,
                impact: new.impact,
                started_at: new.started_at,
                resolved_at: None,
                duration_minutes: None,
                root_cause: new.root_cause.clone(),
                resolution_steps: None,
            })),
            // Partial unique index backstop
            Err(e) if is_constraint_violation(&e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve the target's ongoing incident, if any, at `resolved_at`.
    pub fn resolve_ongoing_incident(
        &self,
        target_id: i64,
        resolved_at: DateTime<Utc>,
        steps: &str,
    ) -> Result<Option<Incident>, DbError> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;

        let ongoing = tx
            .query_row(
                &format!(
                    "SELECT {} FROM incidents WHERE target_id = ?1 AND status = ?2",
                    INCIDENT_COLUMNS
                ),
                params![target_id, IncidentStatus::Ongoing],
                incident_from_row,
            )
            .optional()?;

        let Some(mut incident) = ongoing else {
            return Ok(None);
        };

        incident.resolve(resolved_at, steps);
        write_resolution(&tx, &incident)?;
        tx.commit()?;
        Ok(Some(incident))
    }

    /// Resolve every ongoing incident that started before `cutoff`.
    pub fn resolve_incidents_started_before(
        &self,
        cutoff: DateTime<Utc>,
        resolved_at: DateTime<Utc>,
        steps: &str,
    ) -> Result<Vec<Incident>, DbError> {
        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;

        let mut stale = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {} FROM incidents WHERE status = ?1 AND started_at < ?2
                 ORDER BY started_at",
                INCIDENT_COLUMNS
            ))?;
            let rows = stmt
                .query_map(params![IncidentStatus::Ongoing, db_time(cutoff)], incident_from_row)?
                .collect::<SqlResult<Vec<_>>>()?;
            rows
        };

        for incident in &mut stale {
            incident.resolve(resolved_at, steps);
            write_resolution(&tx, incident)?;
        }

        tx.commit()?;
        Ok(stale)
    }

    pub fn get_ongoing_incident(&self, target_id: i64) -> Result<Option<Incident>, DbError> {
        let conn = self.conn();
        let incident = conn
            .query_row(
                &format!(
                    "SELECT {} FROM incidents WHERE target_id = ?1 AND status = ?2",
                    INCIDENT_COLUMNS
                ),
                params![target_id, IncidentStatus::Ongoing],
                incident_from_row,
            )
            .optional()?;
        Ok(incident)
    }

    /// Incidents for a target, newest first. `status = None` returns all.
    pub fn get_incidents(
        &self,
        target_id: i64,
        status: Option<IncidentStatus>,
        limit: usize,
    ) -> Result<Vec<Incident>, DbError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM incidents
             WHERE target_id = ?1 AND (?2 IS NULL OR status = ?2)
             ORDER BY started_at DESC, id DESC LIMIT ?3",
            INCIDENT_COLUMNS
        ))?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let incidents = stmt
            .query_map(params![target_id, status, limit], incident_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(incidents)
    }

    /// Number of incidents for a target that started within `[start, end)`.
    pub fn count_incidents_started(
        &self,
        target_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<i64, DbError> {
        let conn = self.conn();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM incidents
             WHERE target_id = ?1 AND started_at >= ?2 AND started_at < ?3",
            params![target_id, db_time(start), db_time(end)],
            |row| row.get(0),
        )?;
        Ok(count)
    }
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn write_resolution(conn: &rusqlite::Connection, incident: &Incident) -> Result<(), DbError> {
    conn.execute(
        "UPDATE incidents SET status = ?1, resolved_at = ?2, duration_minutes = ?3,
         resolution_steps = ?4
         WHERE id = ?5",
        params![
            incident.status,
            incident.resolved_at.map(db_time),
            incident.duration_minutes,
            incident.resolution_steps,
            incident.id,
        ],
    )?;
    Ok(())
}

fn incident_from_row(row: &Row<'_>) -> SqlResult<Incident> {
    Ok(Incident {
        id: row.get(0)?,
        target_id: row.get(1)?,
        status: row.get(2)?,
        impact: row.get(3)?,
        started_at: time_column(row, 4)?,
        resolved_at: optional_time_column(row, 5)?,
        duration_minutes: row.get(6)?,
        root_cause: row.get(7)?,
        resolution_steps: row.get(8)?,
    })
}
