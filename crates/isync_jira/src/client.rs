use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};

use isync_core::error::{codes, AppError};
use isync_core::tracker::{CreatedTicket, Tracker, TrackerError};

/// Connection settings for one Jira project, supplied by external
/// configuration and validated before the client is constructed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JiraSettings {
    pub base_url: String,
    pub username: String,
    pub token: String,
    pub project_key: String,
    #[serde(default = "default_issue_type")]
    pub issue_type: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_issue_type() -> String {
    "Task".to_string()
}

fn default_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone)]
pub struct JiraClient {
    settings: JiraSettings,
    auth_header: String,
}

impl JiraClient {
    pub fn new(settings: JiraSettings) -> Result<Self, AppError> {
        let mut settings = settings;
        settings.base_url = settings.base_url.trim_end_matches('/').to_string();

        if !settings.base_url.starts_with("http://") && !settings.base_url.starts_with("https://")
        {
            return Err(AppError::new(
                codes::CONFIG_INVALID,
                "Jira base URL must be an http(s) URL",
            )
            .with_details(format!("base_url={}", settings.base_url)));
        }
        for (field, value) in [
            ("username", &settings.username),
            ("token", &settings.token),
            ("project_key", &settings.project_key),
        ] {
            if value.trim().is_empty() {
                return Err(AppError::new(
                    codes::CONFIG_INVALID,
                    "Jira settings field must not be blank",
                )
                .with_details(format!("field={field}")));
            }
        }

        let auth_header = format!(
            "Basic {}",
            BASE64.encode(format!("{}:{}", settings.username, settings.token))
        );
        Ok(Self {
            settings,
            auth_header,
        })
    }

    pub fn browse_url(&self, key: &str) -> String {
        format!("{}/browse/{key}", self.settings.base_url)
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.settings.timeout_ms)
    }

    fn api(&self, path: &str) -> String {
        format!("{}/rest/api/2/{path}", self.settings.base_url)
    }

    fn post_json(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<ureq::Response, TrackerError> {
        ureq::post(&self.api(path))
            .set("Authorization", &self.auth_header)
            .timeout(self.timeout())
            .send_json(body)
            .map_err(classify)
    }

    fn get(&self, path: &str) -> Result<ureq::Response, TrackerError> {
        ureq::get(&self.api(path))
            .set("Authorization", &self.auth_header)
            .timeout(self.timeout())
            .call()
            .map_err(classify)
    }

    fn transition_targets(&self, ticket_key: &str) -> Result<Vec<JiraTransition>, TrackerError> {
        let resp = self.get(&format!("issue/{ticket_key}/transitions"))?;
        let body: TransitionsResponse = resp.into_json().map_err(|e| {
            TrackerError::permanent(format!("failed to decode transitions response: {e}"))
        })?;
        Ok(body.transitions)
    }
}

/// Map a ureq failure onto the engine's transient/permanent split: transport
/// problems and 5xx/429 responses are retryable, everything else is not.
fn classify(err: ureq::Error) -> TrackerError {
    match err {
        ureq::Error::Status(status, resp) => {
            let detail = resp
                .into_string()
                .unwrap_or_else(|_| String::from("<unreadable body>"));
            classify_status(status, &detail)
        }
        ureq::Error::Transport(t) => TrackerError::transient(t.to_string()),
    }
}

fn classify_status(status: u16, detail: &str) -> TrackerError {
    if status == 429 || status >= 500 {
        TrackerError::transient(format!("status={status}; {detail}"))
    } else {
        TrackerError::permanent(format!("status={status}; {detail}"))
    }
}

/// Find a workflow transition by name or id, case-insensitively, mirroring
/// how operators quote transitions from the Jira UI.
fn match_transition<'a>(
    transitions: &'a [JiraTransition],
    wanted: &str,
) -> Option<&'a JiraTransition> {
    transitions
        .iter()
        .find(|t| t.name.eq_ignore_ascii_case(wanted) || t.id == wanted)
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
struct JiraTransition {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct TransitionsResponse {
    #[serde(default)]
    transitions: Vec<JiraTransition>,
}

#[derive(Debug, Deserialize)]
struct CreatedIssueResponse {
    key: String,
}

impl Tracker for JiraClient {
    fn create_ticket(
        &self,
        title: &str,
        description: &str,
    ) -> Result<CreatedTicket, TrackerError> {
        let body = serde_json::json!({
            "fields": {
                "project": { "key": self.settings.project_key },
                "summary": title,
                "description": description,
                "issuetype": { "name": self.settings.issue_type },
            }
        });
        let resp = self.post_json("issue", body)?;
        let created: CreatedIssueResponse = resp.into_json().map_err(|e| {
            TrackerError::permanent(format!("failed to decode issue creation response: {e}"))
        })?;
        let url = self.browse_url(&created.key);
        Ok(CreatedTicket {
            key: created.key,
            url: Some(url),
        })
    }

    fn get_transitions(&self, ticket_key: &str) -> Result<Vec<String>, TrackerError> {
        Ok(self
            .transition_targets(ticket_key)?
            .into_iter()
            .map(|t| t.name)
            .collect())
    }

    fn apply_transition(&self, ticket_key: &str, transition: &str) -> Result<(), TrackerError> {
        let targets = self.transition_targets(ticket_key)?;
        let Some(target) = match_transition(&targets, transition) else {
            let available: Vec<&str> = targets.iter().map(|t| t.name.as_str()).collect();
            return Err(TrackerError::permanent(format!(
                "transition '{transition}' not found for {ticket_key}; available: {}",
                available.join(", ")
            )));
        };

        let body = serde_json::json!({ "transition": { "id": target.id } });
        self.post_json(&format!("issue/{ticket_key}/transitions"), body)?;
        tracing::debug!(key = ticket_key, transition = %target.name, "jira transition applied");
        Ok(())
    }

    fn add_comment(&self, ticket_key: &str, body: &str) -> Result<(), TrackerError> {
        self.post_json(
            &format!("issue/{ticket_key}/comment"),
            serde_json::json!({ "body": body }),
        )?;
        Ok(())
    }

    fn create_sub_record(
        &self,
        ticket_key: &str,
        summary: &str,
        description: &str,
    ) -> Result<String, TrackerError> {
        let body = serde_json::json!({
            "fields": {
                "project": { "key": self.settings.project_key },
                "parent": { "key": ticket_key },
                "summary": summary,
                "description": description,
                "issuetype": { "name": "Sub-task" },
            }
        });
        let resp = self.post_json("issue", body)?;
        let created: CreatedIssueResponse = resp.into_json().map_err(|e| {
            TrackerError::permanent(format!("failed to decode sub-task response: {e}"))
        })?;
        Ok(created.key)
    }

    fn attach(&self, ticket_key: &str, file_ref: &str) -> Result<(), TrackerError> {
        let content = std::fs::read(file_ref).map_err(|e| {
            TrackerError::permanent(format!("cannot read attachment {file_ref}: {e}"))
        })?;
        let filename = std::path::Path::new(file_ref)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("attachment");

        // ureq has no multipart support; the body is assembled by hand.
        let boundary = "isyncboundary7MA4YWxkTrZu0gW";
        let mut payload = Vec::new();
        payload.extend_from_slice(format!("--{boundary}\r\n").as_bytes());
        payload.extend_from_slice(
            format!(
                "Content-Disposition: form-data; name=\"file\"; filename=\"{filename}\"\r\n\
                 Content-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        payload.extend_from_slice(&content);
        payload.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

        ureq::post(&self.api(&format!("issue/{ticket_key}/attachments")))
            .set("Authorization", &self.auth_header)
            .set("X-Atlassian-Token", "no-check")
            .set(
                "Content-Type",
                &format!("multipart/form-data; boundary={boundary}"),
            )
            .timeout(self.timeout())
            .send_bytes(&payload)
            .map_err(classify)?;
        Ok(())
    }
}
