//! HTTP client for the worker-to-server protocol.
//!
//! Wraps every call the daemon makes: auth, registration, heartbeat,
//! task polling and reporting, plus the card/column creation used by the
//! import and planner executors.

use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::error::ApiError;
use crate::store::model::{Card, Column, Task};

/// Directives returned from registration.
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterResponse {
    pub worker_id: String,
    pub max_concurrent_tasks: u32,
    pub poll_interval_seconds: u64,
    pub heartbeat_interval_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct HeartbeatDirectives {
    #[serde(default)]
    pub cancel_task_ids: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct HeartbeatResponse {
    #[serde(default)]
    directives: HeartbeatDirectives,
}

#[derive(Debug, Clone, Deserialize)]
struct LoginResponse {
    token: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ClaimResponse {
    task: Task,
}

/// Async client for the server API. All methods return `ApiError` with
/// the HTTP status preserved, so callers can branch on 409/429.
pub struct ServerClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl ServerClient {
    pub fn new(base_url: &str) -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: String::new(),
        }
    }

    /// Update the bearer token after login.
    pub fn set_token(&mut self, token: &str) {
        self.token = token.to_string();
    }

    // ── Auth ────────────────────────────────────────────────────────

    /// Authenticate and return the bearer token.
    pub async fn login(&self, username: &str, password: &str) -> Result<String, ApiError> {
        let body: LoginResponse = self
            .request(
                "POST",
                "/api/auth/login",
                Some(json!({ "username": username, "password": password })),
            )
            .await?;
        Ok(body.token)
    }

    // ── Worker lifecycle ────────────────────────────────────────────

    pub async fn register(
        &self,
        hostname: &str,
        version: &str,
        capabilities: &[&str],
    ) -> Result<RegisterResponse, ApiError> {
        self.request(
            "POST",
            "/api/workers/register",
            Some(json!({
                "hostname": hostname,
                "worker_version": version,
                "capabilities": capabilities,
            })),
        )
        .await
    }

    pub async fn heartbeat(
        &self,
        worker_id: &str,
        running_task_ids: &[String],
        system_load: f64,
    ) -> Result<HeartbeatDirectives, ApiError> {
        let body: HeartbeatResponse = self
            .request(
                "POST",
                "/api/workers/heartbeat",
                Some(json!({
                    "worker_id": worker_id,
                    "running_task_ids": running_task_ids,
                    "system_load": system_load,
                })),
            )
            .await?;
        Ok(body.directives)
    }

    // ── Task operations ─────────────────────────────────────────────

    pub async fn poll_tasks(&self, worker_id: &str, limit: u32) -> Result<Vec<Task>, ApiError> {
        self.request(
            "GET",
            &format!("/api/workers/tasks/poll?worker_id={worker_id}&limit={limit}"),
            None,
        )
        .await
    }

    /// Claim a task before executing it. A 409 means another worker won.
    pub async fn claim_task(&self, task_id: &str, worker_id: &str) -> Result<Task, ApiError> {
        let body: ClaimResponse = self
            .request(
                "POST",
                &format!("/api/workers/tasks/{task_id}/claim"),
                Some(json!({ "worker_id": worker_id })),
            )
            .await?;
        Ok(body.task)
    }

    pub async fn report_progress(
        &self,
        task_id: &str,
        worker_id: &str,
        progress_text: &str,
    ) -> Result<(), ApiError> {
        let _: serde_json::Value = self
            .request(
                "POST",
                &format!("/api/workers/tasks/{task_id}/progress"),
                Some(json!({
                    "worker_id": worker_id,
                    "progress_text": progress_text,
                })),
            )
            .await?;
        Ok(())
    }

    pub async fn complete_task(
        &self,
        task_id: &str,
        worker_id: &str,
        output_text: &str,
    ) -> Result<(), ApiError> {
        let _: serde_json::Value = self
            .request(
                "POST",
                &format!("/api/workers/tasks/{task_id}/complete"),
                Some(json!({
                    "worker_id": worker_id,
                    "output_text": output_text,
                })),
            )
            .await?;
        Ok(())
    }

    pub async fn fail_task(
        &self,
        task_id: &str,
        worker_id: &str,
        error_summary: &str,
        output_text: &str,
    ) -> Result<(), ApiError> {
        let _: serde_json::Value = self
            .request(
                "POST",
                &format!("/api/workers/tasks/{task_id}/fail"),
                Some(json!({
                    "worker_id": worker_id,
                    "error_summary": error_summary,
                    "output_text": output_text,
                })),
            )
            .await?;
        Ok(())
    }

    // ── Board surface (import + planner executors) ──────────────────

    pub async fn create_card(
        &self,
        column_id: &str,
        title: &str,
        description: &str,
        priority: &str,
        labels: &[String],
    ) -> Result<Card, ApiError> {
        self.request(
            "POST",
            "/api/cards",
            Some(json!({
                "column_id": column_id,
                "title": title,
                "description": description,
                "priority": priority,
                "labels": labels,
            })),
        )
        .await
    }

    pub async fn list_columns(&self, board_id: &str) -> Result<Vec<Column>, ApiError> {
        self.request("GET", &format!("/api/boards/{board_id}/columns"), None)
            .await
    }

    pub async fn create_column(
        &self,
        board_id: &str,
        body: serde_json::Value,
    ) -> Result<Column, ApiError> {
        self.request(
            "POST",
            &format!("/api/boards/{board_id}/columns"),
            Some(body),
        )
        .await
    }

    pub async fn update_column_routing(
        &self,
        column_id: &str,
        on_success_column_id: Option<&str>,
        on_failure_column_id: Option<&str>,
    ) -> Result<Column, ApiError> {
        self.request(
            "PATCH",
            &format!("/api/columns/{column_id}"),
            Some(json!({
                "on_success_column_id": on_success_column_id,
                "on_failure_column_id": on_failure_column_id,
            })),
        )
        .await
    }

    // ── Internal ────────────────────────────────────────────────────

    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: &'static str,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        let mut builder = match method {
            "POST" => self.http.post(&url),
            "PATCH" => self.http.patch(&url),
            _ => self.http.get(&url),
        };
        if !self.token.is_empty() {
            builder = builder.bearer_auth(&self.token);
        }
        if let Some(body) = body {
            builder = builder.json(&body);
        }

        debug!(method, path, "API request");
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                ApiError::Timeout {
                    method,
                    path: path.to_string(),
                }
            } else {
                ApiError::Connect(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let detail = match response.json::<serde_json::Value>().await {
                Ok(body) => body
                    .get("detail")
                    .and_then(|d| d.as_str())
                    .unwrap_or_default()
                    .to_string(),
                Err(_) => String::new(),
            };
            return Err(ApiError::Status {
                method,
                path: path.to_string(),
                status: status.as_u16(),
                detail,
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }
}
