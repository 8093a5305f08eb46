use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::error::{codes, AppError};

/// Current UTC time as an RFC3339 string. All durable timestamps are stored
/// in this form; callers never see naive or local times.
pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl FromStr for Severity {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(AppError::new(
                codes::SEVERITY_INVALID,
                "Severity must be one of: low, medium, high, critical",
            )
            .with_details(format!("value={other}"))),
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical incident lifecycle status. The transition graph is encoded in
/// [`IncidentStatus::can_transition_to`]; the state machine rejects anything
/// outside it.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum IncidentStatus {
    Investigating,
    Identified,
    Resolving,
    Resolved,
    Closed,
}

impl IncidentStatus {
    pub const ALL: [IncidentStatus; 5] = [
        IncidentStatus::Investigating,
        IncidentStatus::Identified,
        IncidentStatus::Resolving,
        IncidentStatus::Resolved,
        IncidentStatus::Closed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            IncidentStatus::Investigating => "investigating",
            IncidentStatus::Identified => "identified",
            IncidentStatus::Resolving => "resolving",
            IncidentStatus::Resolved => "resolved",
            IncidentStatus::Closed => "closed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, IncidentStatus::Closed)
    }

    /// Lifecycle graph: investigating -> identified -> resolving, then
    /// resolving may reach resolved or closed directly, and resolved may
    /// close. Closed accepts nothing.
    pub fn can_transition_to(self, target: IncidentStatus) -> bool {
        use IncidentStatus::*;
        matches!(
            (self, target),
            (Investigating, Identified)
                | (Identified, Resolving)
                | (Resolving, Resolved)
                | (Resolving, Closed)
                | (Resolved, Closed)
        )
    }
}

impl FromStr for IncidentStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "investigating" => Ok(IncidentStatus::Investigating),
            "identified" => Ok(IncidentStatus::Identified),
            "resolving" => Ok(IncidentStatus::Resolving),
            "resolved" => Ok(IncidentStatus::Resolved),
            "closed" => Ok(IncidentStatus::Closed),
            other => Err(AppError::new(
                codes::DB_DECODE_FAILED,
                "Unrecognized incident status",
            )
            .with_details(format!("value={other}"))),
        }
    }
}

impl fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Internally tracked incident. Owned by the state machine; mutated only
/// through validated transitions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Incident {
    pub id: i64,
    pub title: String,
    pub description: String,
    pub severity: Severity,
    pub affected_systems: Vec<String>,
    pub status: IncidentStatus,
    pub created_at: String,
}

/// Input for incident creation. Severity arrives as free text from
/// collaborators and is validated before anything is persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewIncident {
    pub title: String,
    pub description: String,
    pub severity: String,
    pub affected_systems: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IncidentNote {
    pub id: i64,
    pub incident_id: i64,
    pub note: String,
    pub created_at: String,
}

/// One remediation step reported by the remediation collaborator. Immutable
/// once recorded; accumulated until flushed into a single audit comment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemediationAction {
    pub summary: String,
    pub detail: Option<String>,
    pub executed_at: String,
}

impl RemediationAction {
    pub fn new(summary: impl Into<String>, detail: Option<String>) -> Self {
        Self {
            summary: summary.into(),
            detail,
            executed_at: now_rfc3339(),
        }
    }
}

/// Ephemeral request handed from the state machine to the synchronization
/// engine after the internal status change has committed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionRequest {
    pub incident_id: i64,
    pub target: IncidentStatus,
    pub note: String,
    pub actions: Vec<RemediationAction>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncOutcome {
    Pending,
    Success,
    Failure,
}

impl SyncOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncOutcome::Pending => "pending",
            SyncOutcome::Success => "success",
            SyncOutcome::Failure => "failure",
        }
    }
}

impl FromStr for SyncOutcome {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncOutcome::Pending),
            "success" => Ok(SyncOutcome::Success),
            "failure" => Ok(SyncOutcome::Failure),
            other => Err(AppError::new(
                codes::DB_DECODE_FAILED,
                "Unrecognized sync outcome",
            )
            .with_details(format!("value={other}"))),
        }
    }
}

/// Durable link between an incident and its external tracker ticket.
/// `simulated` tickets carry a locally generated key and exist so the engine
/// can keep operating while the tracker is unreachable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ShadowTicket {
    pub incident_id: i64,
    pub ticket_key: String,
    pub ticket_url: Option<String>,
    pub simulated: bool,
    pub last_confirmed_state: Option<String>,
    pub last_sync_outcome: SyncOutcome,
    pub retry_count: i64,
    pub last_sync_at: Option<String>,
}
