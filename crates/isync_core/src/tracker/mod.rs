use std::fmt;
use std::time::Duration;

/// How a tracker failure should be handled by the synchronization engine.
/// Transient failures (timeouts, 5xx, rate limits) are retried with backoff;
/// permanent ones (auth, validation, not-found) are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerErrorKind {
    Transient,
    Permanent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerError {
    pub kind: TrackerErrorKind,
    pub message: String,
}

impl TrackerError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: TrackerErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: TrackerErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == TrackerErrorKind::Transient
    }
}

impl fmt::Display for TrackerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.kind {
            TrackerErrorKind::Transient => "transient",
            TrackerErrorKind::Permanent => "permanent",
        };
        write!(f, "{kind} tracker failure: {}", self.message)
    }
}

impl std::error::Error for TrackerError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedTicket {
    pub key: String,
    pub url: Option<String>,
}

/// Thin protocol client against the external tracker. Implementations must
/// classify every failure as transient or permanent and must not panic; the
/// synchronization engine makes forward progress on any error.
pub trait Tracker: Send + Sync {
    fn create_ticket(&self, title: &str, description: &str)
        -> Result<CreatedTicket, TrackerError>;

    /// Workflow transitions currently available on the ticket, by name.
    fn get_transitions(&self, ticket_key: &str) -> Result<Vec<String>, TrackerError>;

    fn apply_transition(&self, ticket_key: &str, transition: &str) -> Result<(), TrackerError>;

    fn add_comment(&self, ticket_key: &str, body: &str) -> Result<(), TrackerError>;

    /// Create a sub-record (e.g. a sub-task) under the ticket, returning its key.
    fn create_sub_record(
        &self,
        ticket_key: &str,
        summary: &str,
        description: &str,
    ) -> Result<String, TrackerError>;

    fn attach(&self, ticket_key: &str, file_ref: &str) -> Result<(), TrackerError>;
}

/// Bounded exponential backoff for tracker calls. Only the retrying call
/// sleeps; per-incident locks for unrelated incidents are unaffected.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// A policy that never sleeps, for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
        }
    }
}

/// Outcome of a retried operation, carrying how many retries were spent so
/// the shadow ticket can record them.
pub struct Retried<T> {
    pub result: Result<T, TrackerError>,
    pub retries_used: u32,
}

pub fn with_backoff<T>(
    policy: &RetryPolicy,
    what: &str,
    mut op: impl FnMut() -> Result<T, TrackerError>,
) -> Retried<T> {
    let mut attempt: u32 = 0;
    loop {
        match op() {
            Ok(v) => {
                return Retried {
                    result: Ok(v),
                    retries_used: attempt,
                }
            }
            Err(e) if e.is_transient() && attempt + 1 < policy.max_attempts => {
                let delay = policy.base_delay.saturating_mul(1 << attempt.min(16));
                tracing::warn!(
                    operation = what,
                    attempt = attempt + 1,
                    error = %e,
                    "transient tracker failure, retrying"
                );
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
                attempt += 1;
            }
            Err(e) => {
                return Retried {
                    result: Err(e),
                    retries_used: attempt,
                }
            }
        }
    }
}
