use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes shared across the engine. Incident-side codes are returned
/// synchronously to callers; tracker-side codes are persisted on the shadow
/// ticket and logged, never surfaced as failures of the incident update.
pub mod codes {
    pub const INCIDENT_UNKNOWN: &str = "INCIDENT_UNKNOWN";
    pub const INCIDENT_CLOSED: &str = "INCIDENT_CLOSED";
    pub const TRANSITION_ILLEGAL: &str = "TRANSITION_ILLEGAL";
    pub const SEVERITY_INVALID: &str = "SEVERITY_INVALID";
    pub const ALERT_UNMAPPED: &str = "ALERT_UNMAPPED";
    pub const CONFIG_INVALID: &str = "CONFIG_INVALID";
    pub const TICKET_NOT_SIMULATED: &str = "TICKET_NOT_SIMULATED";
    pub const SHADOW_NOT_FOUND: &str = "SHADOW_NOT_FOUND";

    pub const TRACKER_UNREACHABLE: &str = "TRACKER_UNREACHABLE";
    pub const TRACKER_REJECTED: &str = "TRACKER_REJECTED";
    pub const TRACKER_TRANSITION_NOT_AVAILABLE: &str = "TRACKER_TRANSITION_NOT_AVAILABLE";

    pub const DB_OPEN_FAILED: &str = "DB_OPEN_FAILED";
    pub const DB_QUERY_FAILED: &str = "DB_QUERY_FAILED";
    pub const DB_WRITE_FAILED: &str = "DB_WRITE_FAILED";
    pub const DB_TX_FAILED: &str = "DB_TX_FAILED";
    pub const DB_NOT_FOUND: &str = "DB_NOT_FOUND";
    pub const DB_DECODE_FAILED: &str = "DB_DECODE_FAILED";
    pub const DB_ENCODE_FAILED: &str = "DB_ENCODE_FAILED";
    pub const DB_MIGRATION_FAILED: &str = "DB_MIGRATION_FAILED";
}

/// Single structured error shape used across all engine layers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppError {
    pub code: String,
    pub message: String,
    pub details: Option<String>,
    pub retryable: bool,
}

impl AppError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            details: None,
            retryable: false,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// Tracker-side errors degrade observability but must never block or
    /// roll back an already-committed incident update.
    pub fn is_tracker_side(&self) -> bool {
        self.code.starts_with("TRACKER_")
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for AppError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_side_classification_follows_code_prefix() {
        let err = AppError::new(codes::TRACKER_UNREACHABLE, "timed out").with_retryable(true);
        assert!(err.is_tracker_side());
        assert!(err.retryable);

        let err = AppError::new(codes::TRANSITION_ILLEGAL, "resolved -> investigating");
        assert!(!err.is_tracker_side());
    }
}
