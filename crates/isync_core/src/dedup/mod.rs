//! Alert deduplication: maps stable alert fingerprints to incidents so that
//! repeated firing notifications for one underlying condition produce exactly
//! one incident. Alert names resolve through a closed route table validated
//! at startup; an unmapped name is a configuration problem, not a silent
//! fallback.

use std::collections::BTreeMap;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::domain::{Incident, NewIncident, Severity};
use crate::error::{codes, AppError};
use crate::repo;
use crate::state;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Firing,
    Resolved,
}

/// One entry from the upstream alert source. Labels carry the alert name and
/// affected-instance identifier; annotations carry free text.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AlertEntry {
    pub fingerprint: String,
    pub status: AlertStatus,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

impl AlertEntry {
    pub fn alert_name(&self) -> Option<&str> {
        self.labels.get("alertname").map(String::as_str)
    }

    pub fn instance(&self) -> Option<&str> {
        self.labels.get("instance").map(String::as_str)
    }
}

/// Route for one known alert name, as loaded from configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AlertRoute {
    pub title: String,
    pub severity: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(transparent)]
pub struct AlertRoutesConfig(pub BTreeMap<String, AlertRoute>);

#[derive(Debug)]
struct ValidatedRoute {
    title: String,
    severity: Severity,
}

/// Deduplicator with its validated route table. Construction fails on an
/// empty table, a blank title, or an unknown severity, so misconfiguration
/// surfaces at startup instead of on the first inbound alert.
#[derive(Debug)]
pub struct Deduplicator {
    routes: BTreeMap<String, ValidatedRoute>,
}

/// What `on_firing` did for an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FiringDisposition {
    /// An active mapping already existed; no incident was created.
    Existing(i64),
    /// A new incident was created and mapped to the fingerprint.
    Created(Incident),
}

impl FiringDisposition {
    pub fn incident_id(&self) -> i64 {
        match self {
            FiringDisposition::Existing(id) => *id,
            FiringDisposition::Created(incident) => incident.id,
        }
    }
}

impl Deduplicator {
    pub fn from_config(config: &AlertRoutesConfig) -> Result<Self, AppError> {
        if config.0.is_empty() {
            return Err(AppError::new(
                codes::CONFIG_INVALID,
                "Alert route table must not be empty",
            ));
        }

        let mut routes = BTreeMap::new();
        for (name, route) in &config.0 {
            if name.trim().is_empty() || route.title.trim().is_empty() {
                return Err(AppError::new(
                    codes::CONFIG_INVALID,
                    "Alert route name and title must not be blank",
                )
                .with_details(format!("alert={name}")));
            }
            let severity: Severity = route.severity.parse().map_err(|e: AppError| {
                AppError::new(codes::CONFIG_INVALID, "Alert route has invalid severity")
                    .with_details(format!("alert={name}; {}", e.message))
            })?;
            routes.insert(
                name.clone(),
                ValidatedRoute {
                    title: route.title.clone(),
                    severity,
                },
            );
        }
        Ok(Self { routes })
    }

    fn route_for(&self, entry: &AlertEntry) -> Result<&ValidatedRoute, AppError> {
        let name = entry.alert_name().ok_or_else(|| {
            AppError::new(codes::ALERT_UNMAPPED, "Alert entry carries no alertname label")
                .with_details(format!("fingerprint={}", entry.fingerprint))
        })?;
        self.routes.get(name).ok_or_else(|| {
            AppError::new(codes::ALERT_UNMAPPED, "No route configured for alert name")
                .with_details(format!("alertname={name}"))
        })
    }

    /// Handle a firing notification. An existing active mapping wins;
    /// otherwise a new incident is created and the mapping recorded.
    pub fn on_firing(
        &self,
        conn: &Connection,
        entry: &AlertEntry,
    ) -> Result<FiringDisposition, AppError> {
        let route = self.route_for(entry)?;

        if let Some(existing) = repo::active_incident_for_fingerprint(conn, &entry.fingerprint)? {
            tracing::debug!(
                fingerprint = %entry.fingerprint,
                incident_id = existing,
                "duplicate firing notification mapped to existing incident"
            );
            return Ok(FiringDisposition::Existing(existing));
        }

        let title = match entry.instance() {
            Some(instance) => format!("{} on {instance}", route.title),
            None => route.title.clone(),
        };
        let description = entry
            .annotations
            .get("description")
            .or_else(|| entry.annotations.get("summary"))
            .cloned()
            .unwrap_or_default();
        let affected_systems = entry
            .instance()
            .map(|i| vec![i.to_string()])
            .unwrap_or_default();

        let incident = state::create_incident(
            conn,
            &NewIncident {
                title,
                description,
                severity: route.severity.as_str().to_string(),
                affected_systems,
            },
        )?;
        repo::insert_fingerprint(conn, &entry.fingerprint, incident.id)?;
        tracing::info!(
            fingerprint = %entry.fingerprint,
            incident_id = incident.id,
            "firing alert mapped to new incident"
        );
        Ok(FiringDisposition::Created(incident))
    }

    /// Handle a resolved notification: deactivate the mapping and return the
    /// incident it pointed at. No active mapping is logged, not an error.
    pub fn on_resolved(
        &self,
        conn: &Connection,
        fingerprint: &str,
    ) -> Result<Option<i64>, AppError> {
        let incident_id = repo::deactivate_fingerprint(conn, fingerprint)?;
        match incident_id {
            Some(id) => {
                tracing::info!(
                    fingerprint,
                    incident_id = id,
                    "alert resolved, mapping deactivated"
                );
            }
            None => {
                tracing::info!(fingerprint, "resolved alert has no active incident, ignoring");
            }
        }
        Ok(incident_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routes() -> AlertRoutesConfig {
        AlertRoutesConfig(BTreeMap::from([(
            "HighErrorRate".to_string(),
            AlertRoute {
                title: "High error rate".to_string(),
                severity: "high".to_string(),
            },
        )]))
    }

    #[test]
    fn empty_route_table_is_a_startup_error() {
        let err = Deduplicator::from_config(&AlertRoutesConfig(BTreeMap::new())).unwrap_err();
        assert_eq!(err.code, codes::CONFIG_INVALID);
    }

    #[test]
    fn invalid_route_severity_is_a_startup_error() {
        let mut cfg = routes();
        cfg.0.get_mut("HighErrorRate").unwrap().severity = "sev1".to_string();
        let err = Deduplicator::from_config(&cfg).unwrap_err();
        assert_eq!(err.code, codes::CONFIG_INVALID);
    }

    #[test]
    fn valid_route_table_is_accepted() {
        assert!(Deduplicator::from_config(&routes()).is_ok());
    }
}
