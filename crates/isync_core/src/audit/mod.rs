//! Audit trail aggregator. Remediation actions accumulate per incident in
//! the database and are flushed as ONE numbered comment on the external
//! ticket. Rows are only marked flushed after the comment succeeds, so a
//! failed flush is retried on the next status-changing event instead of
//! dropping actions.

use std::sync::Mutex;

use rusqlite::Connection;

use crate::domain::RemediationAction;
use crate::error::AppError;
use crate::repo;
use crate::tracker::{with_backoff, RetryPolicy, Tracker};

pub fn record_actions(
    conn: &Mutex<Connection>,
    incident_id: i64,
    actions: &[RemediationAction],
) -> Result<(), AppError> {
    if actions.is_empty() {
        return Ok(());
    }
    let mut guard = conn.lock().unwrap();
    repo::insert_actions(&mut guard, incident_id, actions)
}

/// Render accumulated actions as a single ordered audit record.
pub fn render_audit_comment(actions: &[RemediationAction]) -> String {
    let mut out = String::from("Remediation actions executed:\n\n");
    for (idx, action) in actions.iter().enumerate() {
        out.push_str(&format!("{}. {}\n", idx + 1, action.summary));
        if let Some(detail) = action.detail.as_deref() {
            if detail != action.summary {
                out.push_str(&format!("   Details: {detail}\n"));
            }
        }
    }
    out.push_str("\nAll remediation actions completed successfully.");
    out
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushResult {
    /// Actions included in this flush attempt.
    pub action_count: usize,
    /// Whether the audit comment reached the tracker.
    pub posted: bool,
}

/// Flush every unflushed action for the incident as one comment. On success
/// the rows are marked flushed and each action is additionally mirrored as a
/// best-effort sub-record; sub-record failures stop silently after the first
/// since the comment already carries the full audit trail.
pub fn flush(
    conn: &Mutex<Connection>,
    tracker: &dyn Tracker,
    retry: &RetryPolicy,
    incident_id: i64,
    ticket_key: &str,
) -> Result<FlushResult, AppError> {
    let pending = {
        let guard = conn.lock().unwrap();
        repo::unflushed_actions(&guard, incident_id)?
    };
    if pending.is_empty() {
        return Ok(FlushResult {
            action_count: 0,
            posted: false,
        });
    }

    let actions: Vec<RemediationAction> = pending.iter().map(|(_, a)| a.clone()).collect();
    let body = render_audit_comment(&actions);

    let attempt = with_backoff(retry, "audit_flush_comment", || {
        tracker.add_comment(ticket_key, &body)
    });

    if let Err(e) = attempt.result {
        tracing::warn!(
            incident_id,
            key = ticket_key,
            pending = pending.len(),
            error = %e,
            "audit flush failed, actions retained for retry"
        );
        return Ok(FlushResult {
            action_count: pending.len(),
            posted: false,
        });
    }

    let ids: Vec<i64> = pending.iter().map(|(id, _)| *id).collect();
    {
        let mut guard = conn.lock().unwrap();
        repo::mark_actions_flushed(&mut guard, &ids)?;
    }
    tracing::info!(
        incident_id,
        key = ticket_key,
        actions = ids.len(),
        "audit trail flushed"
    );

    for action in &actions {
        let detail = action.detail.as_deref().unwrap_or(&action.summary);
        if let Err(e) = tracker.create_sub_record(ticket_key, &action.summary, detail) {
            tracing::debug!(
                incident_id,
                key = ticket_key,
                error = %e,
                "sub-record creation unavailable, audit comment already posted"
            );
            break;
        }
    }

    Ok(FlushResult {
        action_count: ids.len(),
        posted: true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn audit_comment_is_one_ordered_numbered_list() {
        let actions = vec![
            RemediationAction {
                summary: "Restarted api deployment".to_string(),
                detail: Some("kubectl rollout restart deploy/api".to_string()),
                executed_at: "2026-02-01T10:00:00Z".to_string(),
            },
            RemediationAction {
                summary: "Raised connection pool size".to_string(),
                detail: None,
                executed_at: "2026-02-01T10:05:00Z".to_string(),
            },
        ];

        let body = render_audit_comment(&actions);
        assert_eq!(
            body,
            "Remediation actions executed:\n\n\
             1. Restarted api deployment\n   Details: kubectl rollout restart deploy/api\n\
             2. Raised connection pool size\n\n\
             All remediation actions completed successfully."
        );
    }

    #[test]
    fn duplicate_detail_is_not_repeated() {
        let actions = vec![RemediationAction {
            summary: "Cleared cache".to_string(),
            detail: Some("Cleared cache".to_string()),
            executed_at: "2026-02-01T10:00:00Z".to_string(),
        }];
        let body = render_audit_comment(&actions);
        assert!(!body.contains("Details:"));
    }
}
