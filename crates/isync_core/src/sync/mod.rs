//! Synchronization engine: translates a committed internal transition into
//! zero-or-one external tracker transition plus a best-effort comment, and
//! reconciles the result into the shadow ticket. Tracker failures degrade
//! observability only; they are never returned to the transition caller.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::domain::{
    now_rfc3339, Incident, IncidentStatus, ShadowTicket, SyncOutcome, TransitionRequest,
};
use crate::error::{codes, AppError};
use crate::graph::TransitionGraphCache;
use crate::repo;
use crate::tracker::{with_backoff, RetryPolicy, Tracker, TrackerError};

/// Raw status-map configuration: canonical status name -> tracker transition
/// label, exactly as loaded from external configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct StatusMapConfig(pub BTreeMap<String, String>);

/// Validated, total mapping from canonical status to transition label.
/// Unmapped statuses are a configuration error at construction time, never
/// at request time. `closed` may be omitted and then shares the `resolved`
/// label, matching the tracker workflows this engine was written against.
#[derive(Debug, Clone)]
pub struct StatusMap {
    labels: HashMap<IncidentStatus, String>,
}

impl StatusMap {
    pub fn from_config(config: &StatusMapConfig) -> Result<Self, AppError> {
        let mut labels = HashMap::new();
        for (status, label) in &config.0 {
            let status: IncidentStatus = status.parse().map_err(|_| {
                AppError::new(codes::CONFIG_INVALID, "Status map contains unknown status")
                    .with_details(format!("status={status}"))
            })?;
            if label.trim().is_empty() {
                return Err(AppError::new(
                    codes::CONFIG_INVALID,
                    "Status map label must not be blank",
                )
                .with_details(format!("status={status}")));
            }
            labels.insert(status, label.clone());
        }

        for status in [
            IncidentStatus::Investigating,
            IncidentStatus::Identified,
            IncidentStatus::Resolving,
            IncidentStatus::Resolved,
        ] {
            if !labels.contains_key(&status) {
                return Err(AppError::new(
                    codes::CONFIG_INVALID,
                    "Status map must cover every lifecycle status",
                )
                .with_details(format!("missing={status}")));
            }
        }

        if !labels.contains_key(&IncidentStatus::Closed) {
            let resolved = labels[&IncidentStatus::Resolved].clone();
            labels.insert(IncidentStatus::Closed, resolved);
        }

        Ok(Self { labels })
    }

    pub fn label_for(&self, status: IncidentStatus) -> &str {
        &self.labels[&status]
    }
}

/// Locally generated ticket key used when the tracker cannot be reached at
/// incident-creation time. Visually distinct from real tracker keys.
pub fn simulated_key(incident_id: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(incident_id.to_be_bytes());
    hasher.update(now_rfc3339().as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("SIM-{}", digest[..8].to_uppercase())
}

pub fn is_simulated_key(key: &str) -> bool {
    key.starts_with("SIM-")
}

/// What one synchronization attempt did, as persisted to the shadow ticket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub incident_id: i64,
    pub ticket_key: String,
    pub simulated: bool,
    pub outcome: SyncOutcome,
    pub applied_transition: Option<String>,
    pub skipped_as_noop: bool,
    pub comment_posted: bool,
    pub failure: Option<String>,
}

/// Get or create the shadow ticket for an incident. External ticket creation
/// is attempted with backoff; any failure falls back to a simulated key so
/// the engine keeps operating in degraded mode.
pub fn ensure_shadow(
    conn: &Mutex<Connection>,
    tracker: &dyn Tracker,
    retry: &RetryPolicy,
    incident: &Incident,
) -> Result<ShadowTicket, AppError> {
    if let Some(existing) = {
        let guard = conn.lock().unwrap();
        repo::get_shadow(&guard, incident.id)?
    } {
        return Ok(existing);
    }

    let created = with_backoff(retry, "create_ticket", || {
        tracker.create_ticket(&incident.title, &incident.description)
    });

    let (key, url, simulated) = match created.result {
        Ok(ticket) => {
            tracing::info!(incident_id = incident.id, key = %ticket.key, "tracker ticket created");
            (ticket.key, ticket.url, false)
        }
        Err(e) => {
            let key = simulated_key(incident.id);
            tracing::warn!(
                incident_id = incident.id,
                key = %key,
                error = %e,
                "tracker ticket creation failed, continuing with simulated ticket"
            );
            (key, None, true)
        }
    };

    let guard = conn.lock().unwrap();
    repo::insert_shadow(&guard, incident.id, &key, url.as_deref(), simulated)?;
    repo::get_shadow(&guard, incident.id)?.ok_or_else(|| {
        AppError::new(codes::SHADOW_NOT_FOUND, "Shadow ticket missing after insert")
    })
}

fn graph_contains(transitions: &[String], label: &str) -> bool {
    transitions.iter().any(|t| t.eq_ignore_ascii_case(label))
}

/// Resolve the transition graph for a ticket, consulting the cache first and
/// fetching through the tracker on a miss.
fn load_graph(
    tracker: &dyn Tracker,
    cache: &TransitionGraphCache,
    retry: &RetryPolicy,
    ticket_key: &str,
) -> Result<Vec<String>, TrackerError> {
    if let Some(cached) = cache.get(ticket_key) {
        tracing::debug!(key = ticket_key, "transition graph cache hit");
        return Ok(cached);
    }
    let fetched = with_backoff(retry, "get_transitions", || {
        tracker.get_transitions(ticket_key)
    });
    let transitions = fetched.result?;
    cache.put(ticket_key, transitions.clone());
    Ok(transitions)
}

/// Translate one committed transition into at most one external transition
/// plus a best-effort comment: ensure a shadow ticket exists, resolve the
/// target label, skip the external transition when it is already confirmed,
/// otherwise check the transition graph and apply with bounded retries. The
/// comment is attempted regardless of transition outcome, and the result is
/// persisted to the shadow ticket.
pub fn synchronize(
    conn: &Mutex<Connection>,
    tracker: &dyn Tracker,
    status_map: &StatusMap,
    cache: &TransitionGraphCache,
    retry: &RetryPolicy,
    request: &TransitionRequest,
) -> Result<SyncReport, AppError> {
    let incident = {
        let guard = conn.lock().unwrap();
        repo::get_incident(&guard, request.incident_id)?
    }
    .ok_or_else(|| {
        AppError::new(codes::INCIDENT_UNKNOWN, "No incident with that id")
            .with_details(format!("incident_id={}", request.incident_id))
    })?;

    let shadow = ensure_shadow(conn, tracker, retry, &incident)?;
    let label = status_map.label_for(request.target);

    let mut retries_total: i64 = 0;
    let mut applied: Option<String> = None;
    let mut failure: Option<String> = None;
    let mut skipped_as_noop = false;

    if shadow.last_confirmed_state.as_deref() == Some(label) {
        // Already confirmed externally; replaying the transition would be a
        // duplicate. The comment below is still attempted.
        skipped_as_noop = true;
        tracing::debug!(
            incident_id = request.incident_id,
            key = %shadow.ticket_key,
            label,
            "external state already matches, skipping transition"
        );
    } else {
        match load_graph(tracker, cache, retry, &shadow.ticket_key) {
            Ok(mut transitions) => {
                if !graph_contains(&transitions, label) {
                    // The graph may be stale; refresh once before failing.
                    cache.invalidate(&shadow.ticket_key);
                    match load_graph(tracker, cache, retry, &shadow.ticket_key) {
                        Ok(fresh) => transitions = fresh,
                        Err(e) => {
                            tracing::warn!(
                                incident_id = request.incident_id,
                                key = %shadow.ticket_key,
                                error = %e,
                                "transition graph refresh failed"
                            );
                        }
                    }
                }

                if graph_contains(&transitions, label) {
                    let attempt = with_backoff(retry, "apply_transition", || {
                        tracker.apply_transition(&shadow.ticket_key, label)
                    });
                    retries_total += attempt.retries_used as i64;
                    match attempt.result {
                        Ok(()) => {
                            applied = Some(label.to_string());
                            tracing::info!(
                                incident_id = request.incident_id,
                                key = %shadow.ticket_key,
                                label,
                                "tracker transition applied"
                            );
                        }
                        Err(e) => {
                            failure = Some(format!("{}: {e}", tracker_code(&e)));
                            tracing::warn!(
                                incident_id = request.incident_id,
                                key = %shadow.ticket_key,
                                label,
                                error = %e,
                                "tracker transition failed"
                            );
                        }
                    }
                } else {
                    failure = Some(format!(
                        "{}: transition '{label}' not available; tracker offers: {}",
                        codes::TRACKER_TRANSITION_NOT_AVAILABLE,
                        transitions.join(", ")
                    ));
                    tracing::warn!(
                        incident_id = request.incident_id,
                        key = %shadow.ticket_key,
                        label,
                        available = %transitions.join(", "),
                        "resolved transition not present in workflow graph"
                    );
                }
            }
            Err(e) => {
                failure = Some(format!("{}: {e}", tracker_code(&e)));
                tracing::warn!(
                    incident_id = request.incident_id,
                    key = %shadow.ticket_key,
                    error = %e,
                    "could not fetch transition graph"
                );
            }
        }
    }

    // Comment is independently best-effort: a failed transition does not
    // suppress it and a failed comment does not roll anything back.
    let mut body = format!("Incident status changed to: {}", request.target);
    if !request.note.is_empty() {
        body.push_str("\n\n");
        body.push_str(&request.note);
    }
    let comment = with_backoff(retry, "add_comment", || {
        tracker.add_comment(&shadow.ticket_key, &body)
    });
    retries_total += comment.retries_used as i64;
    let comment_posted = match comment.result {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(
                incident_id = request.incident_id,
                key = %shadow.ticket_key,
                error = %e,
                "tracker comment failed"
            );
            false
        }
    };

    let outcome = if skipped_as_noop || applied.is_some() {
        SyncOutcome::Success
    } else {
        SyncOutcome::Failure
    };

    {
        let guard = conn.lock().unwrap();
        repo::update_shadow_sync(
            &guard,
            request.incident_id,
            outcome,
            applied.as_deref(),
            retries_total,
        )?;
    }

    Ok(SyncReport {
        incident_id: request.incident_id,
        ticket_key: shadow.ticket_key,
        simulated: shadow.simulated,
        outcome,
        applied_transition: applied,
        skipped_as_noop,
        comment_posted,
        failure,
    })
}

fn tracker_code(e: &TrackerError) -> &'static str {
    if e.is_transient() {
        codes::TRACKER_UNREACHABLE
    } else {
        codes::TRACKER_REJECTED
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_map() -> StatusMapConfig {
        StatusMapConfig(BTreeMap::from([
            ("investigating".to_string(), "A".to_string()),
            ("identified".to_string(), "B".to_string()),
            ("resolving".to_string(), "B".to_string()),
            ("resolved".to_string(), "C".to_string()),
        ]))
    }

    #[test]
    fn status_map_accepts_fixture_and_defaults_closed() {
        let map = StatusMap::from_config(&fixture_map()).expect("valid");
        assert_eq!(map.label_for(IncidentStatus::Identified), "B");
        assert_eq!(map.label_for(IncidentStatus::Closed), "C");
    }

    #[test]
    fn status_map_rejects_missing_lifecycle_status() {
        let mut cfg = fixture_map();
        cfg.0.remove("resolving");
        let err = StatusMap::from_config(&cfg).unwrap_err();
        assert_eq!(err.code, codes::CONFIG_INVALID);
    }

    #[test]
    fn status_map_rejects_unknown_status_and_blank_label() {
        let mut cfg = fixture_map();
        cfg.0.insert("paused".to_string(), "X".to_string());
        assert_eq!(
            StatusMap::from_config(&cfg).unwrap_err().code,
            codes::CONFIG_INVALID
        );

        let mut cfg = fixture_map();
        cfg.0.insert("resolved".to_string(), "  ".to_string());
        assert_eq!(
            StatusMap::from_config(&cfg).unwrap_err().code,
            codes::CONFIG_INVALID
        );
    }

    #[test]
    fn simulated_keys_are_visually_distinct() {
        let key = simulated_key(42);
        assert!(is_simulated_key(&key));
        assert_eq!(key.len(), "SIM-".len() + 8);
        assert!(!is_simulated_key("PROJ-42"));
    }
}
