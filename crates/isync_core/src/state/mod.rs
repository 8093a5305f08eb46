//! Incident state machine: the single owner of canonical incident status.
//! Transitions are validated against the lifecycle graph and committed to
//! SQLite before any external synchronization is attempted, so internal
//! truth is never blocked by tracker availability.

use rusqlite::Connection;

use crate::domain::{
    Incident, IncidentStatus, NewIncident, RemediationAction, Severity, TransitionRequest,
};
use crate::error::{codes, AppError};
use crate::repo;

/// Create an incident in `investigating`. Severity arrives as free text and
/// is rejected with `SEVERITY_INVALID` before anything is persisted.
pub fn create_incident(conn: &Connection, input: &NewIncident) -> Result<Incident, AppError> {
    let severity: Severity = input.severity.parse()?;
    let incident = repo::insert_incident(
        conn,
        &input.title,
        &input.description,
        severity,
        &input.affected_systems,
    )?;
    tracing::info!(
        incident_id = incident.id,
        severity = %incident.severity,
        "incident created"
    );
    Ok(incident)
}

/// Validate and commit a status change, returning the request to hand to the
/// synchronization engine. The status update and note append are one SQLite
/// transaction; the caller holds the per-incident lock.
pub fn accept_transition(
    conn: &mut Connection,
    incident_id: i64,
    target: IncidentStatus,
    note: &str,
    actions: Vec<RemediationAction>,
) -> Result<TransitionRequest, AppError> {
    let incident = repo::get_incident(conn, incident_id)?.ok_or_else(|| {
        AppError::new(codes::INCIDENT_UNKNOWN, "No incident with that id")
            .with_details(format!("incident_id={incident_id}"))
    })?;

    if incident.status.is_terminal() {
        return Err(AppError::new(
            codes::INCIDENT_CLOSED,
            "Incident is closed and accepts no further transitions",
        )
        .with_details(format!("incident_id={incident_id}")));
    }

    // A re-request of the current status is accepted as an idempotent
    // replay: the note is appended and synchronization runs again (where the
    // already-confirmed external state makes the transition a no-op).
    let is_replay = incident.status == target;

    if !is_replay && !incident.status.can_transition_to(target) {
        return Err(AppError::new(
            codes::TRANSITION_ILLEGAL,
            format!(
                "Cannot transition from {} to {}",
                incident.status, target
            ),
        )
        .with_details(format!("incident_id={incident_id}")));
    }

    repo::commit_transition(conn, incident_id, target, note)?;
    tracing::info!(
        incident_id,
        from = %incident.status,
        to = %target,
        "incident transition committed"
    );

    Ok(TransitionRequest {
        incident_id,
        target,
        note: note.to_string(),
        actions,
    })
}
