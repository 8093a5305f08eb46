mod common;

use common::{engine_with, MockTracker};
use pretty_assertions::assert_eq;

use isync_core::domain::{IncidentStatus, NewIncident, RemediationAction};

fn incident_input() -> NewIncident {
    NewIncident {
        title: "Message queue backlog growing".to_string(),
        description: "Consumers lag 40 minutes behind".to_string(),
        severity: "high".to_string(),
        affected_systems: vec!["queue".to_string()],
    }
}

fn actions() -> Vec<RemediationAction> {
    vec![
        RemediationAction::new("Scaled consumer group from 4 to 12", None),
        RemediationAction::new(
            "Purged poison messages",
            Some("12 malformed events moved to DLQ".to_string()),
        ),
        RemediationAction::new("Re-enabled autoscaling", None),
    ]
}

fn audit_comments(tracker: &MockTracker) -> Vec<String> {
    tracker
        .state()
        .comments
        .iter()
        .filter(|(_, body)| body.starts_with("Remediation actions executed:"))
        .map(|(_, body)| body.clone())
        .collect()
}

#[test]
fn all_actions_land_in_exactly_one_ordered_audit_comment() {
    let tracker = MockTracker::new(&["A", "B", "C"]);
    let engine = engine_with(tracker.clone());

    let (incident, _) = engine.create_incident(&incident_input()).expect("create");
    engine
        .request_transition(incident.id, IncidentStatus::Identified, "cause", Vec::new())
        .expect("identified");
    engine
        .request_transition(incident.id, IncidentStatus::Resolving, "fixing", Vec::new())
        .expect("resolving");

    let outcome = engine
        .complete_remediation(incident.id, "all steps applied", actions())
        .expect("resolved");
    let flush = outcome.audit.expect("flush ran on resolved");
    assert!(flush.posted);
    assert_eq!(flush.action_count, 3);

    let audits = audit_comments(&tracker);
    assert_eq!(audits.len(), 1, "one audit comment, never N fragments");
    let body = &audits[0];

    let first = body.find("1. Scaled consumer group from 4 to 12").expect("first");
    let second = body.find("2. Purged poison messages").expect("second");
    let third = body.find("3. Re-enabled autoscaling").expect("third");
    assert!(first < second && second < third, "recording order preserved");
    assert!(body.contains("Details: 12 malformed events moved to DLQ"));
    assert!(body.ends_with("All remediation actions completed successfully."));

    // Each action is mirrored as a best-effort sub-record after the flush.
    assert_eq!(tracker.state().sub_records.len(), 3);
}

#[test]
fn failed_flush_retains_actions_and_retries_on_next_event_without_duplication() {
    let tracker = MockTracker::new(&["A", "B", "C"]);
    let engine = engine_with(tracker.clone());

    let (incident, _) = engine.create_incident(&incident_input()).expect("create");
    engine
        .request_transition(incident.id, IncidentStatus::Identified, "cause", Vec::new())
        .expect("identified");
    engine
        .request_transition(incident.id, IncidentStatus::Resolving, "fixing", Vec::new())
        .expect("resolving");

    // Both the status comment and the audit flush fail while resolving the
    // incident; the retry budget is 3 attempts per comment.
    tracker.state().fail_comment_times = 6;
    let outcome = engine
        .complete_remediation(incident.id, "all steps applied", actions())
        .expect("internal resolution still commits");
    let flush = outcome.audit.expect("flush attempted");
    assert!(!flush.posted);
    assert_eq!(flush.action_count, 3);
    assert!(audit_comments(&tracker).is_empty());

    // Next status-changing event for the incident retries the flush.
    let closed = engine
        .request_transition(incident.id, IncidentStatus::Closed, "closing out", Vec::new())
        .expect("closed");
    let flush = closed.audit.expect("flush retried");
    assert!(flush.posted);
    assert_eq!(flush.action_count, 3);

    let audits = audit_comments(&tracker);
    assert_eq!(audits.len(), 1, "retry produced the one and only audit comment");
    let body = &audits[0];
    assert_eq!(body.matches("Scaled consumer group from 4 to 12").count(), 1);
    assert_eq!(body.matches("Purged poison messages").count(), 1);
    assert_eq!(body.matches("Re-enabled autoscaling").count(), 1);
}

#[test]
fn sub_record_failures_do_not_affect_the_audit_comment() {
    let tracker = MockTracker::new(&["A", "B", "C"]);
    tracker.state().fail_sub_records = true;
    let engine = engine_with(tracker.clone());

    let (incident, _) = engine.create_incident(&incident_input()).expect("create");
    engine
        .request_transition(incident.id, IncidentStatus::Identified, "cause", Vec::new())
        .expect("identified");
    engine
        .request_transition(incident.id, IncidentStatus::Resolving, "fixing", Vec::new())
        .expect("resolving");

    let outcome = engine
        .complete_remediation(incident.id, "done", actions())
        .expect("resolved");
    assert!(outcome.audit.expect("flush ran").posted);
    assert_eq!(audit_comments(&tracker).len(), 1);
    assert!(tracker.state().sub_records.is_empty());
}
