mod common;

use common::{engine_with, MockTracker};
use pretty_assertions::assert_eq;

use isync_core::domain::{IncidentStatus, NewIncident, SyncOutcome};
use isync_core::error::codes;
use isync_core::tracker::TrackerError;

fn incident_input(title: &str) -> NewIncident {
    NewIncident {
        title: title.to_string(),
        description: "seen in production".to_string(),
        severity: "high".to_string(),
        affected_systems: vec!["api".to_string()],
    }
}

#[test]
fn health_reports_drift_between_incident_and_shadow_ticket() {
    let tracker = MockTracker::new(&["A", "B", "C"]);
    let engine = engine_with(tracker.clone());

    // Healthy incident: the transition eventually lands after two transient
    // apply failures, so the retry count is visible in the health view.
    let (healthy, _) = engine.create_incident(&incident_input("Healthy")).expect("create");
    tracker.state().fail_apply_times = 2;
    engine
        .request_transition(healthy.id, IncidentStatus::Identified, "cause", Vec::new())
        .expect("identified");

    // Degraded incident: ticket creation and graph fetches both fail, so the
    // engine runs on a simulated ticket and records the sync failure.
    {
        let mut state = tracker.state();
        state.fail_create = Some(TrackerError::transient("tracker down"));
        state.fail_get_transitions = Some(TrackerError::transient("tracker down"));
    }
    let (degraded, shadow) = engine.create_incident(&incident_input("Degraded")).expect("create");
    assert!(shadow.simulated);
    engine
        .request_transition(degraded.id, IncidentStatus::Identified, "cause", Vec::new())
        .expect("internal commit still succeeds");

    let rows = engine.health().expect("health");
    assert_eq!(rows.len(), 2);

    let healthy_row = &rows[0];
    assert_eq!(healthy_row.incident_id, healthy.id);
    assert_eq!(healthy_row.status, IncidentStatus::Identified);
    assert!(!healthy_row.simulated);
    assert_eq!(healthy_row.last_sync_outcome, Some(SyncOutcome::Success));
    assert_eq!(healthy_row.retry_count, 2);

    let degraded_row = &rows[1];
    assert_eq!(degraded_row.incident_id, degraded.id);
    assert_eq!(degraded_row.status, IncidentStatus::Identified);
    assert!(degraded_row.simulated);
    assert_eq!(degraded_row.last_sync_outcome, Some(SyncOutcome::Failure));
    assert!(degraded_row
        .ticket_key
        .as_deref()
        .is_some_and(|k| k.starts_with("SIM-")));
}

#[test]
fn repoint_moves_a_simulated_shadow_onto_a_real_ticket() {
    let tracker = MockTracker::new(&["A", "B", "C"]);
    let engine = engine_with(tracker.clone());

    {
        let mut state = tracker.state();
        state.fail_create = Some(TrackerError::transient("tracker down"));
        state.fail_get_transitions = Some(TrackerError::transient("tracker down"));
    }
    let (incident, shadow) = engine.create_incident(&incident_input("Degraded")).expect("create");
    assert!(shadow.simulated);

    // Tracker comes back; an operator files OPS-99 by hand and re-points.
    {
        let mut state = tracker.state();
        state.fail_create = None;
        state.fail_get_transitions = None;
    }
    let repointed = engine
        .repoint_ticket(
            incident.id,
            "OPS-99",
            Some("https://jira.example.com/browse/OPS-99"),
        )
        .expect("repoint");
    assert!(!repointed.simulated);
    assert_eq!(repointed.ticket_key, "OPS-99");
    assert_eq!(repointed.last_confirmed_state, None);
    assert_eq!(repointed.last_sync_outcome, SyncOutcome::Pending);

    // Re-sync catches the real ticket up with the canonical status.
    let report = engine.resync(incident.id).expect("resync");
    assert_eq!(report.ticket_key, "OPS-99");
    assert_eq!(report.applied_transition.as_deref(), Some("A"));

    let state = tracker.state();
    assert_eq!(state.applied, vec![("OPS-99".to_string(), "A".to_string())]);
}

#[test]
fn repoint_refuses_a_real_shadow_ticket() {
    let tracker = MockTracker::new(&["A", "B", "C"]);
    let engine = engine_with(tracker);

    let (incident, shadow) = engine.create_incident(&incident_input("Real")).expect("create");
    assert!(!shadow.simulated);

    let err = engine
        .repoint_ticket(incident.id, "OPS-99", None)
        .expect_err("must refuse");
    assert_eq!(err.code, codes::TICKET_NOT_SIMULATED);

    // The original link is untouched.
    let shadow_after = engine.shadow(incident.id).expect("shadow").expect("exists");
    assert_eq!(shadow_after.ticket_key, shadow.ticket_key);
}

#[test]
fn artifacts_attach_to_the_shadow_ticket() {
    let tracker = MockTracker::new(&["A", "B", "C"]);
    let engine = engine_with(tracker.clone());

    let (incident, shadow) = engine.create_incident(&incident_input("Real")).expect("create");
    let posted = engine
        .attach_artifact(incident.id, "/var/log/incident-42.log")
        .expect("attach");
    assert!(posted);

    let state = tracker.state();
    assert_eq!(
        state.attachments,
        vec![(shadow.ticket_key, "/var/log/incident-42.log".to_string())]
    );
}

#[test]
fn repoint_without_a_shadow_ticket_is_an_error() {
    let tracker = MockTracker::new(&["A", "B", "C"]);
    let engine = engine_with(tracker);

    let err = engine
        .repoint_ticket(4242, "OPS-99", None)
        .expect_err("no shadow recorded");
    assert_eq!(err.code, codes::SHADOW_NOT_FOUND);
}
