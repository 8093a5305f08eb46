//! Engine facade: wires the state machine, synchronization engine, audit
//! aggregator and alert deduplicator together behind per-incident locking.
//! Callers are independent (alert webhooks, diagnostic and remediation
//! completion callbacks), so every mutation of one incident is serialized by
//! an incident-keyed mutex while unrelated incidents proceed in parallel.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::audit::{self, FlushResult};
use crate::dedup::{AlertEntry, AlertRoutesConfig, AlertStatus, Deduplicator, FiringDisposition};
use crate::domain::{
    Incident, IncidentNote, IncidentStatus, NewIncident, RemediationAction, ShadowTicket,
    TransitionRequest,
};
use crate::error::{codes, AppError};
use crate::graph::TransitionGraphCache;
use crate::repo::{self, HealthRow};
use crate::state;
use crate::sync::{self, StatusMap, StatusMapConfig, SyncReport};
use crate::tracker::{with_backoff, RetryPolicy, Tracker};

/// Injected engine configuration; validated eagerly so unmapped statuses or
/// alert names fail at startup, never at request time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    pub status_map: StatusMapConfig,
    pub alert_routes: AlertRoutesConfig,
    #[serde(default = "default_graph_ttl")]
    pub graph_ttl_seconds: u64,
}

fn default_graph_ttl() -> u64 {
    60
}

fn is_lifecycle_refusal(error: &AppError) -> bool {
    [
        codes::TRANSITION_ILLEGAL,
        codes::INCIDENT_CLOSED,
        codes::INCIDENT_UNKNOWN,
    ]
    .contains(&error.code.as_str())
}

/// Diagnostic result from the root-cause analysis collaborator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiagnosisReport {
    pub root_cause: String,
    pub confidence: f64,
    #[serde(default)]
    pub recommended_actions: Vec<String>,
}

/// Result of one accepted transition: the committed incident state plus what
/// the external synchronization and audit flush did about it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub incident: Incident,
    pub sync: SyncReport,
    pub audit: Option<FlushResult>,
}

/// Per-entry outcome of inbound alert batch processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlertOutcome {
    IncidentCreated { fingerprint: String, incident_id: i64 },
    DuplicateFiring { fingerprint: String, incident_id: i64 },
    IncidentResolved { fingerprint: String, incident_id: i64 },
    NoActiveIncident { fingerprint: String },
    ResolutionRejected { fingerprint: String, incident_id: i64, error: AppError },
}

pub struct SyncEngine {
    conn: Mutex<Connection>,
    tracker: Box<dyn Tracker>,
    status_map: StatusMap,
    dedup: Deduplicator,
    graph: TransitionGraphCache,
    retry: RetryPolicy,
    locks: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl SyncEngine {
    pub fn new(
        conn: Connection,
        tracker: Box<dyn Tracker>,
        config: &EngineConfig,
        retry: RetryPolicy,
    ) -> Result<Self, AppError> {
        let status_map = StatusMap::from_config(&config.status_map)?;
        let dedup = Deduplicator::from_config(&config.alert_routes)?;
        Ok(Self {
            conn: Mutex::new(conn),
            tracker,
            status_map,
            dedup,
            graph: TransitionGraphCache::with_ttl(config.graph_ttl_seconds),
            retry,
            locks: Mutex::new(HashMap::new()),
        })
    }

    fn incident_lock(&self, incident_id: i64) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(incident_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Create an incident and report it to the tracker. The external ticket
    /// is best-effort: on failure a simulated shadow ticket is recorded and
    /// the incident proceeds in degraded mode.
    pub fn create_incident(
        &self,
        input: &NewIncident,
    ) -> Result<(Incident, ShadowTicket), AppError> {
        let incident = {
            let guard = self.conn.lock().unwrap();
            state::create_incident(&guard, input)?
        };

        let lock = self.incident_lock(incident.id);
        let _guard = lock.lock().unwrap();
        let shadow =
            sync::ensure_shadow(&self.conn, self.tracker.as_ref(), &self.retry, &incident)?;
        Ok((incident, shadow))
    }

    /// Validate, commit and synchronize one status change. The internal
    /// commit always wins: tracker problems are reflected in the returned
    /// sync report and the shadow ticket, never as an error here.
    pub fn request_transition(
        &self,
        incident_id: i64,
        target: IncidentStatus,
        note: &str,
        actions: Vec<RemediationAction>,
    ) -> Result<TransitionOutcome, AppError> {
        let lock = self.incident_lock(incident_id);
        let _guard = lock.lock().unwrap();
        self.transition_locked(incident_id, target, note, actions)
    }

    fn transition_locked(
        &self,
        incident_id: i64,
        target: IncidentStatus,
        note: &str,
        actions: Vec<RemediationAction>,
    ) -> Result<TransitionOutcome, AppError> {
        let request = {
            let mut guard = self.conn.lock().unwrap();
            state::accept_transition(&mut guard, incident_id, target, note, actions)?
        };

        audit::record_actions(&self.conn, incident_id, &request.actions)?;

        let sync = sync::synchronize(
            &self.conn,
            self.tracker.as_ref(),
            &self.status_map,
            &self.graph,
            &self.retry,
            &request,
        )?;

        // Flush accumulated actions on resolution, and retry any actions a
        // previously failed flush left pending once the incident closes.
        let audit = if matches!(target, IncidentStatus::Resolved | IncidentStatus::Closed) {
            Some(audit::flush(
                &self.conn,
                self.tracker.as_ref(),
                &self.retry,
                incident_id,
                &sync.ticket_key,
            )?)
        } else {
            None
        };

        let incident = self.incident(incident_id)?;
        Ok(TransitionOutcome {
            incident,
            sync,
            audit,
        })
    }

    /// Replay synchronization for the incident's current status. Safe to
    /// call repeatedly: an already-confirmed external state short-circuits
    /// to a no-op transition (the informational comment is still posted).
    pub fn resync(&self, incident_id: i64) -> Result<SyncReport, AppError> {
        let lock = self.incident_lock(incident_id);
        let _guard = lock.lock().unwrap();

        let incident = self.incident(incident_id)?;
        let request = TransitionRequest {
            incident_id,
            target: incident.status,
            note: String::new(),
            actions: Vec::new(),
        };
        sync::synchronize(
            &self.conn,
            self.tracker.as_ref(),
            &self.status_map,
            &self.graph,
            &self.retry,
            &request,
        )
    }

    /// Process one inbound alert batch (at-least-once delivery). Firing
    /// entries map to exactly one incident via the deduplicator; resolved
    /// entries issue a resolved transition for the mapped incident.
    pub fn handle_alerts(&self, batch: &[AlertEntry]) -> Result<Vec<AlertOutcome>, AppError> {
        let mut outcomes = Vec::with_capacity(batch.len());
        for entry in batch {
            match entry.status {
                AlertStatus::Firing => {
                    let disposition = {
                        let guard = self.conn.lock().unwrap();
                        self.dedup.on_firing(&guard, entry)?
                    };
                    match disposition {
                        FiringDisposition::Existing(incident_id) => {
                            outcomes.push(AlertOutcome::DuplicateFiring {
                                fingerprint: entry.fingerprint.clone(),
                                incident_id,
                            });
                        }
                        FiringDisposition::Created(incident) => {
                            let lock = self.incident_lock(incident.id);
                            let _guard = lock.lock().unwrap();
                            sync::ensure_shadow(
                                &self.conn,
                                self.tracker.as_ref(),
                                &self.retry,
                                &incident,
                            )?;
                            outcomes.push(AlertOutcome::IncidentCreated {
                                fingerprint: entry.fingerprint.clone(),
                                incident_id: incident.id,
                            });
                        }
                    }
                }
                AlertStatus::Resolved => {
                    let resolved = {
                        let guard = self.conn.lock().unwrap();
                        self.dedup.on_resolved(&guard, &entry.fingerprint)?
                    };
                    let Some(incident_id) = resolved else {
                        outcomes.push(AlertOutcome::NoActiveIncident {
                            fingerprint: entry.fingerprint.clone(),
                        });
                        continue;
                    };

                    let note = format!("Alert source reported resolution ({})", entry.fingerprint);
                    match self.request_transition(
                        incident_id,
                        IncidentStatus::Resolved,
                        &note,
                        Vec::new(),
                    ) {
                        Ok(_) => outcomes.push(AlertOutcome::IncidentResolved {
                            fingerprint: entry.fingerprint.clone(),
                            incident_id,
                        }),
                        // Only state-machine refusals become per-entry
                        // outcomes; infrastructure errors fail the batch.
                        Err(error) if is_lifecycle_refusal(&error) => {
                            tracing::warn!(
                                incident_id,
                                fingerprint = %entry.fingerprint,
                                error = %error,
                                "resolved alert could not transition incident"
                            );
                            outcomes.push(AlertOutcome::ResolutionRejected {
                                fingerprint: entry.fingerprint.clone(),
                                incident_id,
                                error,
                            });
                        }
                        Err(error) => return Err(error),
                    }
                }
            }
        }
        Ok(outcomes)
    }

    /// Diagnostic completion: transition to `identified` with the causal
    /// hypothesis as the note.
    pub fn complete_diagnosis(
        &self,
        incident_id: i64,
        report: &DiagnosisReport,
    ) -> Result<TransitionOutcome, AppError> {
        let mut note = format!(
            "Root cause identified: {} (confidence {:.0}%)",
            report.root_cause,
            report.confidence * 100.0
        );
        if !report.recommended_actions.is_empty() {
            note.push_str("\nRecommended actions: ");
            note.push_str(&report.recommended_actions.join("; "));
        }
        self.request_transition(incident_id, IncidentStatus::Identified, &note, Vec::new())
    }

    /// Remediation completion: record the applied actions and transition to
    /// `resolved`, which triggers the audit trail flush.
    pub fn complete_remediation(
        &self,
        incident_id: i64,
        note: &str,
        actions: Vec<RemediationAction>,
    ) -> Result<TransitionOutcome, AppError> {
        self.request_transition(incident_id, IncidentStatus::Resolved, note, actions)
    }

    /// Operator surface: per-incident canonical status, shadow ticket key
    /// and last synchronization outcome, for detecting drift.
    pub fn health(&self) -> Result<Vec<HealthRow>, AppError> {
        let guard = self.conn.lock().unwrap();
        repo::health_rows(&guard)
    }

    /// Admin operation: point a simulated shadow ticket at a real tracker
    /// ticket. Refuses to touch a shadow ticket that is already real.
    pub fn repoint_ticket(
        &self,
        incident_id: i64,
        ticket_key: &str,
        ticket_url: Option<&str>,
    ) -> Result<ShadowTicket, AppError> {
        let lock = self.incident_lock(incident_id);
        let _guard = lock.lock().unwrap();

        let guard = self.conn.lock().unwrap();
        repo::repoint_shadow(&guard, incident_id, ticket_key, ticket_url)?;
        self.graph.invalidate(ticket_key);
        repo::get_shadow(&guard, incident_id)?.ok_or_else(|| {
            AppError::new(codes::SHADOW_NOT_FOUND, "Shadow ticket missing after re-point")
        })
    }

    /// Attach a supporting artifact (log extract, timeline export) to the
    /// incident's ticket. Best-effort like comments: tracker failures are
    /// logged and reported as `false`, never returned as errors.
    pub fn attach_artifact(&self, incident_id: i64, file_ref: &str) -> Result<bool, AppError> {
        let shadow = self.shadow(incident_id)?.ok_or_else(|| {
            AppError::new(codes::SHADOW_NOT_FOUND, "No shadow ticket recorded for incident")
                .with_details(format!("incident_id={incident_id}"))
        })?;

        let attempt = with_backoff(&self.retry, "attach", || {
            self.tracker.attach(&shadow.ticket_key, file_ref)
        });
        match attempt.result {
            Ok(()) => Ok(true),
            Err(e) => {
                tracing::warn!(
                    incident_id,
                    key = %shadow.ticket_key,
                    file_ref,
                    error = %e,
                    "artifact attachment failed"
                );
                Ok(false)
            }
        }
    }

    pub fn incident(&self, incident_id: i64) -> Result<Incident, AppError> {
        let guard = self.conn.lock().unwrap();
        repo::get_incident(&guard, incident_id)?.ok_or_else(|| {
            AppError::new(codes::INCIDENT_UNKNOWN, "No incident with that id")
                .with_details(format!("incident_id={incident_id}"))
        })
    }

    pub fn notes(&self, incident_id: i64) -> Result<Vec<IncidentNote>, AppError> {
        let guard = self.conn.lock().unwrap();
        repo::list_notes(&guard, incident_id)
    }

    pub fn shadow(&self, incident_id: i64) -> Result<Option<ShadowTicket>, AppError> {
        let guard = self.conn.lock().unwrap();
        repo::get_shadow(&guard, incident_id)
    }
}
