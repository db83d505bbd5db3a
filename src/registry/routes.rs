//! Worker protocol handlers — the request/response surface consumed by
//! worker daemons.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tracing::debug;

use crate::server::{AppState, Failure};

pub fn worker_routes() -> Router<AppState> {
    Router::new()
        .route("/workers/register", post(register))
        .route("/workers/heartbeat", post(heartbeat))
        .route("/workers", get(list_workers))
        .route("/workers/tasks/poll", get(poll_tasks))
        .route("/workers/tasks/{id}/claim", post(claim_task))
        .route("/workers/tasks/{id}/progress", post(report_progress))
        .route("/workers/tasks/{id}/complete", post(complete_task))
        .route("/workers/tasks/{id}/fail", post(fail_task))
}

#[derive(Deserialize)]
struct RegisterBody {
    #[serde(default)]
    hostname: String,
    #[serde(default)]
    worker_version: String,
    #[serde(default)]
    capabilities: Vec<String>,
}

async fn register(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RegisterBody>,
) -> Result<impl IntoResponse, Failure> {
    let user_id = state.require_user(&headers).await?;
    let capabilities = if body.capabilities.is_empty() {
        vec!["agent".to_string()]
    } else {
        body.capabilities
    };

    let worker = state
        .registry
        .register(&user_id, &body.hostname, &body.worker_version, &capabilities)
        .await?;
    let directives = state.registry.directives();

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({
            "worker_id": worker.id,
            "max_concurrent_tasks": directives.max_concurrent_tasks,
            "poll_interval_seconds": directives.poll_interval_seconds,
            "heartbeat_interval_seconds": directives.heartbeat_interval_seconds,
        })),
    ))
}

#[derive(Deserialize)]
struct HeartbeatBody {
    worker_id: String,
    #[serde(default)]
    running_task_ids: Vec<String>,
    #[serde(default)]
    system_load: f64,
}

async fn heartbeat(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<HeartbeatBody>,
) -> Result<impl IntoResponse, Failure> {
    let user_id = state.require_user(&headers).await?;
    debug!(
        worker_id = %body.worker_id,
        running = body.running_task_ids.len(),
        load = body.system_load,
        "Heartbeat"
    );

    let directives = state
        .registry
        .heartbeat(&body.worker_id, &user_id, &body.running_task_ids)
        .await?;

    Ok(Json(serde_json::json!({
        "status": "ok",
        "directives": {
            "cancel_task_ids": directives.cancel_task_ids,
        },
    })))
}

async fn list_workers(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, Failure> {
    state.require_user(&headers).await?;
    let workers = state.registry.list().await?;
    Ok(Json(workers))
}

#[derive(Deserialize)]
struct PollQuery {
    worker_id: String,
    #[serde(default = "default_poll_limit")]
    limit: u32,
}

fn default_poll_limit() -> u32 {
    1
}

async fn poll_tasks(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PollQuery>,
) -> Result<impl IntoResponse, Failure> {
    let user_id = state.require_user(&headers).await?;
    state.registry.owned_worker(&query.worker_id, &user_id).await?;
    state.registry.check_poll_rate(&query.worker_id)?;

    let tasks = state
        .store
        .poll_pending_tasks(&user_id, query.limit.max(1))
        .await?;
    Ok(Json(tasks))
}

#[derive(Deserialize)]
struct ClaimBody {
    worker_id: String,
}

async fn claim_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
    Json(body): Json<ClaimBody>,
) -> Result<impl IntoResponse, Failure> {
    let user_id = state.require_user(&headers).await?;
    state.registry.owned_worker(&body.worker_id, &user_id).await?;

    let task = state.tasks.claim(&task_id, &body.worker_id).await?;
    Ok(Json(serde_json::json!({
        "status": "claimed",
        "task": task,
    })))
}

#[derive(Deserialize)]
struct ProgressBody {
    worker_id: String,
    #[serde(default)]
    progress_text: String,
    #[serde(default)]
    step: Option<u32>,
    #[serde(default)]
    total_steps: Option<u32>,
    #[serde(default)]
    phase: Option<String>,
}

async fn report_progress(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
    Json(body): Json<ProgressBody>,
) -> Result<impl IntoResponse, Failure> {
    let user_id = state.require_user(&headers).await?;
    state.registry.owned_worker(&body.worker_id, &user_id).await?;

    state
        .tasks
        .progress(
            &task_id,
            &body.worker_id,
            &body.progress_text,
            body.step,
            body.total_steps,
            body.phase,
        )
        .await?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

#[derive(Deserialize)]
struct CompleteBody {
    worker_id: String,
    #[serde(default)]
    output_text: String,
}

async fn complete_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
    Json(body): Json<CompleteBody>,
) -> Result<impl IntoResponse, Failure> {
    let user_id = state.require_user(&headers).await?;
    state.registry.owned_worker(&body.worker_id, &user_id).await?;

    let task = state
        .tasks
        .complete(&task_id, &body.worker_id, &body.output_text)
        .await?;
    Ok(Json(serde_json::json!({ "status": task.status })))
}

#[derive(Deserialize)]
struct FailBody {
    worker_id: String,
    #[serde(default)]
    error_summary: String,
    #[serde(default)]
    output_text: String,
}

async fn fail_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
    Json(body): Json<FailBody>,
) -> Result<impl IntoResponse, Failure> {
    let user_id = state.require_user(&headers).await?;
    state.registry.owned_worker(&body.worker_id, &user_id).await?;

    let task = state
        .tasks
        .fail(&task_id, &body.worker_id, &body.error_summary, &body.output_text)
        .await?;
    Ok(Json(serde_json::json!({ "status": task.status })))
}
