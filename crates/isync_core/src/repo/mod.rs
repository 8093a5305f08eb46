use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::domain::{
    Incident, IncidentNote, IncidentStatus, RemediationAction, Severity, ShadowTicket,
    SyncOutcome,
};
use crate::error::{codes, AppError};

fn db_err(code: &'static str, message: &'static str) -> impl Fn(rusqlite::Error) -> AppError {
    move |e| AppError::new(code, message).with_details(e.to_string())
}

fn decode_systems(raw: &str) -> Result<Vec<String>, AppError> {
    serde_json::from_str(raw).map_err(|e| {
        AppError::new(codes::DB_DECODE_FAILED, "Failed to decode affected systems")
            .with_details(e.to_string())
    })
}

fn encode_systems(systems: &[String]) -> Result<String, AppError> {
    serde_json::to_string(systems).map_err(|e| {
        AppError::new(codes::DB_ENCODE_FAILED, "Failed to encode affected systems")
            .with_details(e.to_string())
    })
}

// Raw row shape; enum and JSON columns are decoded in a second step so
// decode failures surface as AppError instead of a bare rusqlite error.
struct RawIncident {
    id: i64,
    title: String,
    description: String,
    severity: String,
    affected_systems: String,
    status: String,
    created_at: String,
}

fn incident_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawIncident> {
    Ok(RawIncident {
        id: row.get(0)?,
        title: row.get(1)?,
        description: row.get(2)?,
        severity: row.get(3)?,
        affected_systems: row.get(4)?,
        status: row.get(5)?,
        created_at: row.get(6)?,
    })
}

fn finish_incident(raw: RawIncident) -> Result<Incident, AppError> {
    Ok(Incident {
        id: raw.id,
        title: raw.title,
        description: raw.description,
        severity: raw.severity.parse()?,
        affected_systems: decode_systems(&raw.affected_systems)?,
        status: raw.status.parse()?,
        created_at: raw.created_at,
    })
}

const INCIDENT_COLUMNS: &str =
    "id, title, description, severity, affected_systems, status, created_at";

pub fn insert_incident(
    conn: &Connection,
    title: &str,
    description: &str,
    severity: Severity,
    affected_systems: &[String],
) -> Result<Incident, AppError> {
    let systems = encode_systems(affected_systems)?;
    conn.execute(
        "INSERT INTO incidents(title, description, severity, affected_systems, status, created_at) \
         VALUES (?1, ?2, ?3, ?4, 'investigating', strftime('%Y-%m-%dT%H:%M:%fZ','now'))",
        rusqlite::params![title, description, severity.as_str(), systems],
    )
    .map_err(db_err(codes::DB_WRITE_FAILED, "Failed to insert incident"))?;

    let id = conn.last_insert_rowid();
    get_incident(conn, id)?.ok_or_else(|| {
        AppError::new(codes::DB_NOT_FOUND, "Inserted incident not found on read-back")
    })
}

pub fn get_incident(conn: &Connection, id: i64) -> Result<Option<Incident>, AppError> {
    let parts = conn
        .query_row(
            &format!("SELECT {INCIDENT_COLUMNS} FROM incidents WHERE id = ?1"),
            [id],
            incident_from_row,
        )
        .optional()
        .map_err(db_err(codes::DB_QUERY_FAILED, "Failed to query incident"))?;

    parts.map(finish_incident).transpose()
}

pub fn list_incidents(conn: &Connection) -> Result<Vec<Incident>, AppError> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {INCIDENT_COLUMNS} FROM incidents ORDER BY id ASC"
        ))
        .map_err(db_err(
            codes::DB_QUERY_FAILED,
            "Failed to prepare incidents query",
        ))?;

    let rows = stmt
        .query_map([], incident_from_row)
        .map_err(db_err(codes::DB_QUERY_FAILED, "Failed to query incidents"))?;

    let mut out = Vec::new();
    for r in rows {
        let parts = r.map_err(db_err(
            codes::DB_QUERY_FAILED,
            "Failed to decode incident row",
        ))?;
        out.push(finish_incident(parts)?);
    }
    Ok(out)
}

/// Commit a validated status change and its note in one transaction. The
/// state machine has already checked the transition; this atomic internal
/// write must land before any external synchronization is attempted.
pub fn commit_transition(
    conn: &mut Connection,
    incident_id: i64,
    target: IncidentStatus,
    note: &str,
) -> Result<(), AppError> {
    let tx = conn.transaction().map_err(db_err(
        codes::DB_TX_FAILED,
        "Failed to start transition transaction",
    ))?;

    tx.execute(
        "UPDATE incidents SET status = ?1 WHERE id = ?2",
        rusqlite::params![target.as_str(), incident_id],
    )
    .map_err(db_err(
        codes::DB_WRITE_FAILED,
        "Failed to update incident status",
    ))?;

    if !note.is_empty() {
        tx.execute(
            "INSERT INTO incident_notes(incident_id, note, created_at) \
             VALUES (?1, ?2, strftime('%Y-%m-%dT%H:%M:%fZ','now'))",
            rusqlite::params![incident_id, note],
        )
        .map_err(db_err(
            codes::DB_WRITE_FAILED,
            "Failed to append incident note",
        ))?;
    }

    tx.commit().map_err(db_err(
        codes::DB_TX_FAILED,
        "Failed to commit transition transaction",
    ))
}

pub fn list_notes(conn: &Connection, incident_id: i64) -> Result<Vec<IncidentNote>, AppError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, incident_id, note, created_at FROM incident_notes \
             WHERE incident_id = ?1 ORDER BY id ASC",
        )
        .map_err(db_err(
            codes::DB_QUERY_FAILED,
            "Failed to prepare notes query",
        ))?;

    let rows = stmt
        .query_map([incident_id], |row| {
            Ok(IncidentNote {
                id: row.get(0)?,
                incident_id: row.get(1)?,
                note: row.get(2)?,
                created_at: row.get(3)?,
            })
        })
        .map_err(db_err(codes::DB_QUERY_FAILED, "Failed to query notes"))?;

    let mut out = Vec::new();
    for r in rows {
        out.push(r.map_err(db_err(codes::DB_QUERY_FAILED, "Failed to decode note row"))?);
    }
    Ok(out)
}

struct RawShadow {
    incident_id: i64,
    ticket_key: String,
    ticket_url: Option<String>,
    simulated: i64,
    last_confirmed_state: Option<String>,
    last_sync_outcome: String,
    retry_count: i64,
    last_sync_at: Option<String>,
}

fn shadow_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawShadow> {
    Ok(RawShadow {
        incident_id: row.get(0)?,
        ticket_key: row.get(1)?,
        ticket_url: row.get(2)?,
        simulated: row.get(3)?,
        last_confirmed_state: row.get(4)?,
        last_sync_outcome: row.get(5)?,
        retry_count: row.get(6)?,
        last_sync_at: row.get(7)?,
    })
}

fn finish_shadow(raw: RawShadow) -> Result<ShadowTicket, AppError> {
    Ok(ShadowTicket {
        incident_id: raw.incident_id,
        ticket_key: raw.ticket_key,
        ticket_url: raw.ticket_url,
        simulated: raw.simulated != 0,
        last_confirmed_state: raw.last_confirmed_state,
        last_sync_outcome: raw.last_sync_outcome.parse()?,
        retry_count: raw.retry_count,
        last_sync_at: raw.last_sync_at,
    })
}

pub fn get_shadow(conn: &Connection, incident_id: i64) -> Result<Option<ShadowTicket>, AppError> {
    let parts = conn
        .query_row(
            "SELECT incident_id, ticket_key, ticket_url, simulated, last_confirmed_state, \
                    last_sync_outcome, retry_count, last_sync_at \
             FROM shadow_tickets WHERE incident_id = ?1",
            [incident_id],
            shadow_from_row,
        )
        .optional()
        .map_err(db_err(
            codes::DB_QUERY_FAILED,
            "Failed to query shadow ticket",
        ))?;

    parts.map(finish_shadow).transpose()
}

/// First and only insert for an incident's shadow ticket. The unique primary
/// key on `incident_id` guarantees the mapping is never silently reassigned.
pub fn insert_shadow(
    conn: &Connection,
    incident_id: i64,
    ticket_key: &str,
    ticket_url: Option<&str>,
    simulated: bool,
) -> Result<(), AppError> {
    conn.execute(
        "INSERT INTO shadow_tickets(incident_id, ticket_key, ticket_url, simulated, last_sync_outcome) \
         VALUES (?1, ?2, ?3, ?4, 'pending')",
        rusqlite::params![incident_id, ticket_key, ticket_url, simulated as i64],
    )
    .map_err(db_err(
        codes::DB_WRITE_FAILED,
        "Failed to insert shadow ticket",
    ))?;
    Ok(())
}

/// Record the outcome of one synchronization attempt. `confirmed_state` is
/// only overwritten when the external transition actually applied.
pub fn update_shadow_sync(
    conn: &Connection,
    incident_id: i64,
    outcome: SyncOutcome,
    confirmed_state: Option<&str>,
    retries_used: i64,
) -> Result<(), AppError> {
    let changed = conn
        .execute(
            "UPDATE shadow_tickets SET \
               last_sync_outcome = ?1, \
               last_confirmed_state = COALESCE(?2, last_confirmed_state), \
               retry_count = retry_count + ?3, \
               last_sync_at = strftime('%Y-%m-%dT%H:%M:%fZ','now') \
             WHERE incident_id = ?4",
            rusqlite::params![outcome.as_str(), confirmed_state, retries_used, incident_id],
        )
        .map_err(db_err(
            codes::DB_WRITE_FAILED,
            "Failed to update shadow ticket sync state",
        ))?;

    if changed == 0 {
        return Err(AppError::new(
            codes::SHADOW_NOT_FOUND,
            "No shadow ticket recorded for incident",
        )
        .with_details(format!("incident_id={incident_id}")));
    }
    Ok(())
}

/// Admin re-point of a simulated shadow ticket at a real tracker ticket.
/// Confirmed state resets so the next sync starts from an unknown external
/// position instead of trusting state confirmed against the simulated key.
pub fn repoint_shadow(
    conn: &Connection,
    incident_id: i64,
    ticket_key: &str,
    ticket_url: Option<&str>,
) -> Result<(), AppError> {
    if get_shadow(conn, incident_id)?.is_none() {
        return Err(AppError::new(
            codes::SHADOW_NOT_FOUND,
            "No shadow ticket recorded for incident",
        )
        .with_details(format!("incident_id={incident_id}")));
    }

    let changed = conn
        .execute(
            "UPDATE shadow_tickets SET \
               ticket_key = ?1, ticket_url = ?2, simulated = 0, \
               last_confirmed_state = NULL, last_sync_outcome = 'pending' \
             WHERE incident_id = ?3 AND simulated = 1",
            rusqlite::params![ticket_key, ticket_url, incident_id],
        )
        .map_err(db_err(
            codes::DB_WRITE_FAILED,
            "Failed to re-point shadow ticket",
        ))?;

    if changed == 0 {
        return Err(AppError::new(
            codes::TICKET_NOT_SIMULATED,
            "Only simulated shadow tickets can be re-pointed",
        )
        .with_details(format!("incident_id={incident_id}")));
    }
    Ok(())
}

pub fn insert_actions(
    conn: &mut Connection,
    incident_id: i64,
    actions: &[RemediationAction],
) -> Result<(), AppError> {
    let tx = conn.transaction().map_err(db_err(
        codes::DB_TX_FAILED,
        "Failed to start action insert transaction",
    ))?;

    for action in actions {
        tx.execute(
            "INSERT INTO pending_actions(incident_id, summary, detail, executed_at, flushed) \
             VALUES (?1, ?2, ?3, ?4, 0)",
            rusqlite::params![incident_id, action.summary, action.detail, action.executed_at],
        )
        .map_err(db_err(
            codes::DB_WRITE_FAILED,
            "Failed to insert remediation action",
        ))?;
    }

    tx.commit().map_err(db_err(
        codes::DB_TX_FAILED,
        "Failed to commit action insert transaction",
    ))
}

/// Unflushed actions in recording order, with their row ids so a successful
/// flush can mark exactly the rows it rendered.
pub fn unflushed_actions(
    conn: &Connection,
    incident_id: i64,
) -> Result<Vec<(i64, RemediationAction)>, AppError> {
    let mut stmt = conn
        .prepare(
            "SELECT id, summary, detail, executed_at FROM pending_actions \
             WHERE incident_id = ?1 AND flushed = 0 ORDER BY id ASC",
        )
        .map_err(db_err(
            codes::DB_QUERY_FAILED,
            "Failed to prepare pending actions query",
        ))?;

    let rows = stmt
        .query_map([incident_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                RemediationAction {
                    summary: row.get(1)?,
                    detail: row.get(2)?,
                    executed_at: row.get(3)?,
                },
            ))
        })
        .map_err(db_err(
            codes::DB_QUERY_FAILED,
            "Failed to query pending actions",
        ))?;

    let mut out = Vec::new();
    for r in rows {
        out.push(r.map_err(db_err(
            codes::DB_QUERY_FAILED,
            "Failed to decode pending action row",
        ))?);
    }
    Ok(out)
}

pub fn mark_actions_flushed(conn: &mut Connection, ids: &[i64]) -> Result<(), AppError> {
    let tx = conn.transaction().map_err(db_err(
        codes::DB_TX_FAILED,
        "Failed to start flush transaction",
    ))?;

    for id in ids {
        tx.execute("UPDATE pending_actions SET flushed = 1 WHERE id = ?1", [id])
            .map_err(db_err(
                codes::DB_WRITE_FAILED,
                "Failed to mark action flushed",
            ))?;
    }

    tx.commit().map_err(db_err(
        codes::DB_TX_FAILED,
        "Failed to commit flush transaction",
    ))
}

pub fn active_incident_for_fingerprint(
    conn: &Connection,
    fingerprint: &str,
) -> Result<Option<i64>, AppError> {
    conn.query_row(
        "SELECT incident_id FROM alert_fingerprints WHERE fingerprint = ?1 AND active = 1",
        [fingerprint],
        |row| row.get(0),
    )
    .optional()
    .map_err(db_err(
        codes::DB_QUERY_FAILED,
        "Failed to query fingerprint mapping",
    ))
}

pub fn insert_fingerprint(
    conn: &Connection,
    fingerprint: &str,
    incident_id: i64,
) -> Result<(), AppError> {
    conn.execute(
        "INSERT INTO alert_fingerprints(fingerprint, incident_id, active, created_at) \
         VALUES (?1, ?2, 1, strftime('%Y-%m-%dT%H:%M:%fZ','now'))",
        rusqlite::params![fingerprint, incident_id],
    )
    .map_err(db_err(
        codes::DB_WRITE_FAILED,
        "Failed to insert fingerprint mapping",
    ))?;
    Ok(())
}

/// Deactivate the active mapping for a fingerprint, returning the incident
/// it pointed at. `None` when no active mapping exists.
pub fn deactivate_fingerprint(
    conn: &Connection,
    fingerprint: &str,
) -> Result<Option<i64>, AppError> {
    let incident_id = active_incident_for_fingerprint(conn, fingerprint)?;
    if let Some(id) = incident_id {
        conn.execute(
            "UPDATE alert_fingerprints SET active = 0 WHERE fingerprint = ?1 AND active = 1",
            [fingerprint],
        )
        .map_err(db_err(
            codes::DB_WRITE_FAILED,
            "Failed to deactivate fingerprint mapping",
        ))?;
        return Ok(Some(id));
    }
    Ok(None)
}

/// Operator-facing view: per incident, where the internal lifecycle stands
/// and whether the external ticket has drifted from it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HealthRow {
    pub incident_id: i64,
    pub title: String,
    pub status: IncidentStatus,
    pub ticket_key: Option<String>,
    pub simulated: bool,
    pub last_sync_outcome: Option<SyncOutcome>,
    pub retry_count: i64,
}

pub fn health_rows(conn: &Connection) -> Result<Vec<HealthRow>, AppError> {
    let mut stmt = conn
        .prepare(
            "SELECT i.id, i.title, i.status, s.ticket_key, \
                    COALESCE(s.simulated, 0), s.last_sync_outcome, COALESCE(s.retry_count, 0) \
             FROM incidents i \
             LEFT JOIN shadow_tickets s ON s.incident_id = i.id \
             ORDER BY i.id ASC",
        )
        .map_err(db_err(
            codes::DB_QUERY_FAILED,
            "Failed to prepare health query",
        ))?;

    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, i64>(4)? != 0,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, i64>(6)?,
            ))
        })
        .map_err(db_err(codes::DB_QUERY_FAILED, "Failed to query health rows"))?;

    let mut out = Vec::new();
    for r in rows {
        let (incident_id, title, status, ticket_key, simulated, outcome, retry_count) = r
            .map_err(db_err(
                codes::DB_QUERY_FAILED,
                "Failed to decode health row",
            ))?;
        out.push(HealthRow {
            incident_id,
            title,
            status: status.parse()?,
            ticket_key,
            simulated,
            last_sync_outcome: outcome.as_deref().map(str::parse).transpose()?,
            retry_count,
        });
    }
    Ok(out)
}
