//! Jira executor — runs Jira operations with locally-stored credentials.
//!
//! Handles `jira_import`, `jira_push`, and `jira_sync`. Credentials never
//! leave the worker machine: the server only sees the resulting cards and
//! summaries. Imports create cards back through the server API under the
//! same user's token.

use std::sync::Arc;

use serde_json::json;
use tracing::{info, warn};

use crate::error::ExecutorError;
use crate::store::model::{Task, TaskType};
use crate::worker::client::ServerClient;
use crate::worker::config::WorkerConfig;

/// Map Jira priority names onto card priority levels.
fn map_priority(jira_priority: &str) -> &'static str {
    match jira_priority {
        "Highest" => "critical",
        "High" => "high",
        "Low" | "Lowest" => "low",
        _ => "medium",
    }
}

/// Jira connection details, loaded from the worker environment.
struct JiraCredentials {
    base_url: String,
    email: String,
    token: String,
}

impl JiraCredentials {
    fn from_env() -> Result<Self, ExecutorError> {
        let base_url = std::env::var("JIRA_URL").map_err(|_| {
            ExecutorError::Integration("JIRA_URL not set on this machine".to_string())
        })?;
        let email = std::env::var("JIRA_EMAIL").unwrap_or_default();
        let token = std::env::var("JIRA_TOKEN").map_err(|_| {
            ExecutorError::Integration("JIRA_TOKEN not set on this machine".to_string())
        })?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            email,
            token,
        })
    }
}

/// Executes Jira tasks.
pub struct JiraExecutor {
    #[allow(dead_code)]
    config: WorkerConfig,
    server: Arc<ServerClient>,
    worker_id: String,
    http: reqwest::Client,
}

impl JiraExecutor {
    pub fn new(config: WorkerConfig, server: Arc<ServerClient>, worker_id: String) -> Self {
        Self {
            config,
            server,
            worker_id,
            http: reqwest::Client::new(),
        }
    }

    /// Route to the Jira operation for this task type and report the
    /// outcome.
    pub async fn execute(&self, task: &Task) {
        let result = match task.task_type {
            TaskType::JiraImport => self.import(task).await,
            TaskType::JiraPush => self.push(task).await,
            TaskType::JiraSync => self.sync(task).await,
            other => Err(ExecutorError::Payload(format!(
                "not a jira task: {}",
                other.as_str()
            ))),
        };

        match result {
            Ok(summary) => {
                info!(task_id = %task.id, "Jira task done");
                if let Err(e) = self
                    .server
                    .complete_task(&task.id, &self.worker_id, &summary)
                    .await
                {
                    warn!(task_id = %task.id, error = %e, "Failed to report completion");
                }
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "Jira task failed");
                if let Err(report_err) = self
                    .server
                    .fail_task(&task.id, &self.worker_id, &e.to_string(), "")
                    .await
                {
                    warn!(task_id = %task.id, error = %report_err, "Failed to report failure");
                }
            }
        }
    }

    /// `jira_import`: search issues by JQL, create a card per issue.
    async fn import(&self, task: &Task) -> Result<String, ExecutorError> {
        let creds = JiraCredentials::from_env()?;
        let column_id = payload_str(task, "column_id")?;
        let jql = task
            .payload
            .get("jql")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| {
                task.payload
                    .get("project_key")
                    .and_then(|v| v.as_str())
                    .map(|key| format!("project = {key} ORDER BY created DESC"))
            })
            .ok_or_else(|| {
                ExecutorError::Payload("jira_import needs jql or project_key".to_string())
            })?;

        let body: serde_json::Value = self
            .jira_request(
                &creds,
                reqwest::Method::POST,
                "/rest/api/2/search",
                Some(json!({
                    "jql": jql,
                    "maxResults": 50,
                    "fields": ["summary", "description", "priority", "labels"],
                })),
            )
            .await?;

        let issues = body
            .get("issues")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();

        let mut imported = 0usize;
        for issue in &issues {
            let key = issue.get("key").and_then(|v| v.as_str()).unwrap_or("");
            let fields = issue.get("fields").cloned().unwrap_or(json!({}));
            let summary = fields.get("summary").and_then(|v| v.as_str()).unwrap_or(key);
            let description = fields
                .get("description")
                .and_then(|v| v.as_str())
                .unwrap_or("");
            let priority = fields
                .get("priority")
                .and_then(|p| p.get("name"))
                .and_then(|v| v.as_str())
                .unwrap_or("Medium");
            let labels: Vec<String> = fields
                .get("labels")
                .and_then(|v| v.as_array())
                .map(|arr| {
                    arr.iter()
                        .filter_map(|l| l.as_str().map(str::to_string))
                        .collect()
                })
                .unwrap_or_default();

            let title = format!("[{key}] {summary}");
            self.server
                .create_card(&column_id, &title, description, map_priority(priority), &labels)
                .await
                .map_err(|e| ExecutorError::Integration(format!("create card: {e}")))?;
            imported += 1;
        }

        Ok(format!("Imported {imported} Jira issues ({jql})"))
    }

    /// `jira_push`: create one issue from the task payload.
    async fn push(&self, task: &Task) -> Result<String, ExecutorError> {
        let creds = JiraCredentials::from_env()?;
        let project_key = payload_str(task, "project_key")?;
        let title = payload_str(task, "title")?;
        let description = task
            .payload
            .get("description")
            .and_then(|v| v.as_str())
            .unwrap_or("");

        let body: serde_json::Value = self
            .jira_request(
                &creds,
                reqwest::Method::POST,
                "/rest/api/2/issue",
                Some(json!({
                    "fields": {
                        "project": { "key": project_key },
                        "summary": title,
                        "description": description,
                        "issuetype": { "name": "Task" },
                    },
                })),
            )
            .await?;

        let key = body
            .get("key")
            .and_then(|v| v.as_str())
            .unwrap_or("(unknown)");
        Ok(format!("Created Jira issue {key}"))
    }

    /// `jira_sync`: read back the current status of one issue.
    async fn sync(&self, task: &Task) -> Result<String, ExecutorError> {
        let creds = JiraCredentials::from_env()?;
        let issue_key = payload_str(task, "issue_key")?;

        let body: serde_json::Value = self
            .jira_request(
                &creds,
                reqwest::Method::GET,
                &format!("/rest/api/2/issue/{issue_key}?fields=status,summary"),
                None,
            )
            .await?;

        let status = body
            .get("fields")
            .and_then(|f| f.get("status"))
            .and_then(|s| s.get("name"))
            .and_then(|v| v.as_str())
            .unwrap_or("(unknown)");
        Ok(format!("{issue_key} is {status}"))
    }

    async fn jira_request(
        &self,
        creds: &JiraCredentials,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, ExecutorError> {
        let url = format!("{}{path}", creds.base_url);
        let mut builder = self
            .http
            .request(method, &url)
            .basic_auth(&creds.email, Some(&creds.token));
        if let Some(body) = body {
            builder = builder.json(&body);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| ExecutorError::Integration(format!("Jira request: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ExecutorError::Integration(format!(
                "Jira returned {status} for {path}"
            )));
        }
        response
            .json()
            .await
            .map_err(|e| ExecutorError::Integration(format!("Jira response: {e}")))
    }
}

fn payload_str(task: &Task, key: &str) -> Result<String, ExecutorError> {
    task.payload
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .ok_or_else(|| {
            ExecutorError::Payload(format!("{} payload missing {key}", task.task_type.as_str()))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_mapping() {
        assert_eq!(map_priority("Highest"), "critical");
        assert_eq!(map_priority("High"), "high");
        assert_eq!(map_priority("Medium"), "medium");
        assert_eq!(map_priority("Low"), "low");
        assert_eq!(map_priority("Lowest"), "low");
        assert_eq!(map_priority("Whatever"), "medium");
    }

    #[test]
    fn payload_str_rejects_missing_and_empty() {
        let mut task_payload = serde_json::json!({ "column_id": "col1", "empty": "" });
        let task = Task {
            id: "t1".into(),
            task_type: TaskType::JiraImport,
            board_id: "b1".into(),
            card_id: None,
            created_by: "alice".into(),
            assigned_to: None,
            claimed_by_worker: None,
            agent_type: String::new(),
            agent_model: "smart".into(),
            prompt_text: String::new(),
            payload: task_payload.take(),
            status: crate::store::model::TaskStatus::Claimed,
            priority: 0,
            source_column_id: String::new(),
            target_column_id: String::new(),
            failure_column_id: String::new(),
            loop_count: 0,
            max_loop_count: 3,
            error_summary: String::new(),
            output_comment_id: String::new(),
            created_at: chrono::Utc::now(),
            claimed_at: None,
            started_at: None,
            completed_at: None,
        };

        assert_eq!(payload_str(&task, "column_id").unwrap(), "col1");
        assert!(payload_str(&task, "missing").is_err());
        assert!(payload_str(&task, "empty").is_err());
    }
}
