use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use isync_core::db;
use isync_core::dedup::{AlertRoute, AlertRoutesConfig};
use isync_core::engine::{EngineConfig, SyncEngine};
use isync_core::sync::StatusMapConfig;
use isync_core::tracker::{CreatedTicket, RetryPolicy, Tracker, TrackerError};

/// Scripted in-memory tracker. Records every call so tests can assert on
/// exact external call counts, and fails on demand to exercise the engine's
/// degraded paths.
#[derive(Default)]
pub struct TrackerState {
    pub created: Vec<(String, String)>,
    pub applied: Vec<(String, String)>,
    pub comments: Vec<(String, String)>,
    pub sub_records: Vec<(String, String)>,
    pub attachments: Vec<(String, String)>,
    pub available_transitions: Vec<String>,
    pub get_transitions_calls: u32,
    pub next_ticket: u64,

    pub fail_create: Option<TrackerError>,
    pub fail_get_transitions: Option<TrackerError>,
    /// Next N apply_transition calls fail with a transient error.
    pub fail_apply_times: u32,
    /// Next N add_comment calls fail with a transient error.
    pub fail_comment_times: u32,
    pub fail_sub_records: bool,
}

#[derive(Clone)]
pub struct MockTracker(Arc<Mutex<TrackerState>>);

impl MockTracker {
    pub fn new(available: &[&str]) -> Self {
        let state = TrackerState {
            available_transitions: available.iter().map(|s| s.to_string()).collect(),
            ..TrackerState::default()
        };
        Self(Arc::new(Mutex::new(state)))
    }

    pub fn state(&self) -> MutexGuard<'_, TrackerState> {
        self.0.lock().unwrap()
    }
}

impl Tracker for MockTracker {
    fn create_ticket(
        &self,
        title: &str,
        description: &str,
    ) -> Result<CreatedTicket, TrackerError> {
        let mut state = self.state();
        if let Some(err) = state.fail_create.clone() {
            return Err(err);
        }
        state.next_ticket += 1;
        let key = format!("OPS-{}", state.next_ticket);
        state.created.push((title.to_string(), description.to_string()));
        Ok(CreatedTicket {
            url: Some(format!("https://jira.example.com/browse/{key}")),
            key,
        })
    }

    fn get_transitions(&self, _ticket_key: &str) -> Result<Vec<String>, TrackerError> {
        let mut state = self.state();
        state.get_transitions_calls += 1;
        if let Some(err) = state.fail_get_transitions.clone() {
            return Err(err);
        }
        Ok(state.available_transitions.clone())
    }

    fn apply_transition(&self, ticket_key: &str, transition: &str) -> Result<(), TrackerError> {
        let mut state = self.state();
        if state.fail_apply_times > 0 {
            state.fail_apply_times -= 1;
            return Err(TrackerError::transient("injected apply failure"));
        }
        state
            .applied
            .push((ticket_key.to_string(), transition.to_string()));
        Ok(())
    }

    fn add_comment(&self, ticket_key: &str, body: &str) -> Result<(), TrackerError> {
        let mut state = self.state();
        if state.fail_comment_times > 0 {
            state.fail_comment_times -= 1;
            return Err(TrackerError::transient("injected comment failure"));
        }
        state.comments.push((ticket_key.to_string(), body.to_string()));
        Ok(())
    }

    fn create_sub_record(
        &self,
        ticket_key: &str,
        summary: &str,
        _description: &str,
    ) -> Result<String, TrackerError> {
        let mut state = self.state();
        if state.fail_sub_records {
            return Err(TrackerError::permanent("sub-tasks disabled on project"));
        }
        state
            .sub_records
            .push((ticket_key.to_string(), summary.to_string()));
        Ok(format!("OPS-SUB-{}", state.sub_records.len()))
    }

    fn attach(&self, ticket_key: &str, file_ref: &str) -> Result<(), TrackerError> {
        let mut state = self.state();
        state
            .attachments
            .push((ticket_key.to_string(), file_ref.to_string()));
        Ok(())
    }
}

/// The status-map fixture from the engine's contract: a fully connected
/// {A, B, C} workflow where identified and resolving share one label.
pub fn fixture_config() -> EngineConfig {
    EngineConfig {
        status_map: StatusMapConfig(BTreeMap::from([
            ("investigating".to_string(), "A".to_string()),
            ("identified".to_string(), "B".to_string()),
            ("resolving".to_string(), "B".to_string()),
            ("resolved".to_string(), "C".to_string()),
        ])),
        alert_routes: AlertRoutesConfig(BTreeMap::from([
            (
                "HighErrorRate".to_string(),
                AlertRoute {
                    title: "High error rate".to_string(),
                    severity: "high".to_string(),
                },
            ),
            (
                "DiskFull".to_string(),
                AlertRoute {
                    title: "Disk almost full".to_string(),
                    severity: "medium".to_string(),
                },
            ),
        ])),
        graph_ttl_seconds: 60,
    }
}

pub fn engine_with(tracker: MockTracker) -> SyncEngine {
    let mut conn = db::open_in_memory().expect("open");
    db::migrate(&mut conn).expect("migrate");
    SyncEngine::new(
        conn,
        Box::new(tracker),
        &fixture_config(),
        RetryPolicy::immediate(3),
    )
    .expect("engine config is valid")
}
