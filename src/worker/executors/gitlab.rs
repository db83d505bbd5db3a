//! GitLab executor — project linkage, creation, and push with local
//! credentials and a local git checkout.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::json;
use tokio::process::Command;
use tracing::{info, warn};

use crate::error::ExecutorError;
use crate::store::model::{Task, TaskType};
use crate::worker::client::ServerClient;
use crate::worker::config::WorkerConfig;

static NON_SLUG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^a-z0-9]+").unwrap());

/// Convert text to a URL-safe slug suitable for branch names.
fn slugify(text: &str) -> String {
    let lower = text.to_lowercase();
    let slug = NON_SLUG.replace_all(&lower, "-");
    slug.trim_matches('-').chars().take(50).collect()
}

struct GitLabCredentials {
    base_url: String,
    token: String,
}

impl GitLabCredentials {
    fn from_env() -> Result<Self, ExecutorError> {
        let base_url = std::env::var("GITLAB_URL")
            .unwrap_or_else(|_| "https://gitlab.com".to_string());
        let token = std::env::var("GITLAB_TOKEN").map_err(|_| {
            ExecutorError::Integration("GITLAB_TOKEN not set on this machine".to_string())
        })?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }
}

/// Executes `gitlab_link`, `gitlab_create_project`, and `gitlab_push`.
pub struct GitLabExecutor {
    #[allow(dead_code)]
    config: WorkerConfig,
    server: Arc<ServerClient>,
    worker_id: String,
    http: reqwest::Client,
}

impl GitLabExecutor {
    pub fn new(config: WorkerConfig, server: Arc<ServerClient>, worker_id: String) -> Self {
        Self {
            config,
            server,
            worker_id,
            http: reqwest::Client::new(),
        }
    }

    pub async fn execute(&self, task: &Task) {
        let result = match task.task_type {
            TaskType::GitlabLink => self.link(task).await,
            TaskType::GitlabCreateProject => self.create_project(task).await,
            TaskType::GitlabPush => self.push(task).await,
            other => Err(ExecutorError::Payload(format!(
                "not a gitlab task: {}",
                other.as_str()
            ))),
        };

        match result {
            Ok(summary) => {
                info!(task_id = %task.id, "GitLab task done");
                if let Err(e) = self
                    .server
                    .complete_task(&task.id, &self.worker_id, &summary)
                    .await
                {
                    warn!(task_id = %task.id, error = %e, "Failed to report completion");
                }
            }
            Err(e) => {
                warn!(task_id = %task.id, error = %e, "GitLab task failed");
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

    /// `gitlab_link`: verify the project exists and is reachable.
    async fn link(&self, task: &Task) -> Result<String, ExecutorError> {
        let creds = GitLabCredentials::from_env()?;
        let project_id = payload_str(task, "project_id")?;

        let project = self
            .gitlab_get(&creds, &format!("/api/v4/projects/{project_id}"))
            .await?;
        let path = project
            .get("path_with_namespace")
            .and_then(|v| v.as_str())
            .unwrap_or(&project_id);
        Ok(format!("Linked GitLab project {path}"))
    }

    /// `gitlab_create_project`: create a blank project.
    async fn create_project(&self, task: &Task) -> Result<String, ExecutorError> {
        let creds = GitLabCredentials::from_env()?;
        let name = payload_str(task, "name")?;

        let response = self
            .http
            .post(format!("{}/api/v4/projects", creds.base_url))
            .header("PRIVATE-TOKEN", &creds.token)
            .json(&json!({ "name": name, "initialize_with_readme": true }))
            .send()
            .await
            .map_err(|e| ExecutorError::Integration(format!("GitLab request: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExecutorError::Integration(format!(
                "GitLab returned {status} creating project"
            )));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ExecutorError::Integration(format!("GitLab response: {e}")))?;
        let url = body.get("web_url").and_then(|v| v.as_str()).unwrap_or("");
        Ok(format!("Created GitLab project {name} ({url})"))
    }

    /// `gitlab_push`: push the local branch and open a merge request.
    async fn push(&self, task: &Task) -> Result<String, ExecutorError> {
        let creds = GitLabCredentials::from_env()?;
        let project_id = payload_str(task, "project_id")?;
        let repo_path = task
            .payload
            .get("repo_path")
            .and_then(|v| v.as_str())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."));
        let default_branch = task
            .payload
            .get("default_branch")
            .and_then(|v| v.as_str())
            .unwrap_or("main");
        let title = task
            .payload
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or("agentboard changes");
        let branch = format!("agentboard/{}", slugify(title));

        git(&repo_path, &["checkout", "-B", &branch]).await?;
        git(&repo_path, &["push", "-u", "origin", &branch]).await?;

        let response = self
            .http
            .post(format!(
                "{}/api/v4/projects/{project_id}/merge_requests",
                creds.base_url
            ))
            .header("PRIVATE-TOKEN", &creds.token)
            .json(&json!({
                "source_branch": branch,
                "target_branch": default_branch,
                "title": title,
            }))
            .send()
            .await
            .map_err(|e| ExecutorError::Integration(format!("GitLab request: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ExecutorError::Integration(format!(
                "GitLab returned {status} creating merge request"
            )));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ExecutorError::Integration(format!("GitLab response: {e}")))?;
        let url = body.get("web_url").and_then(|v| v.as_str()).unwrap_or("");
        Ok(format!("Pushed {branch} and opened merge request {url}"))
    }

    async fn gitlab_get(
        &self,
        creds: &GitLabCredentials,
        path: &str,
    ) -> Result<serde_json::Value, ExecutorError> {
        let response = self
            .http
            .get(format!("{}{path}", creds.base_url))
            .header("PRIVATE-TOKEN", &creds.token)
            .send()
            .await
            .map_err(|e| ExecutorError::Integration(format!("GitLab request: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ExecutorError::Integration(format!(
                "GitLab returned {status} for {path}"
            )));
        }
        response
            .json()
            .await
            .map_err(|e| ExecutorError::Integration(format!("GitLab response: {e}")))
    }
}

/// Run a git command, failing on nonzero exit.
async fn git(repo: &PathBuf, args: &[&str]) -> Result<(), ExecutorError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(repo)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| ExecutorError::Spawn(format!("git: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(ExecutorError::Integration(format!(
            "git {} failed: {}",
            args.first().unwrap_or(&""),
            stderr.lines().last().unwrap_or("")
        )));
    }
    Ok(())
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
    fn slugify_branch_names() {
        assert_eq!(slugify("Fix Login Flow!"), "fix-login-flow");
        assert_eq!(slugify("  spaces  everywhere  "), "spaces-everywhere");
        assert_eq!(slugify("já_unicode"), "j-unicode");
        assert!(slugify(&"x".repeat(200)).len() <= 50);
    }
}
