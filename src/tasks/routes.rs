//! Task listing, creation, and cancellation — the browser-facing surface.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::error::ProtocolError;
use crate::server::{AppState, Failure};
use crate::store::model::{NewTask, TaskStatus, TaskType};
use crate::store::TaskFilter;

pub fn task_routes() -> Router<AppState> {
    Router::new()
        .route("/tasks", get(list_tasks).post(create_task))
        .route("/tasks/{id}/cancel", post(cancel_task))
}

#[derive(Deserialize)]
struct ListQuery {
    board_id: Option<String>,
    card_id: Option<String>,
    status: Option<String>,
}

async fn list_tasks(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Result<impl IntoResponse, Failure> {
    let user_id = state.require_user(&headers).await?;

    if let Some(board_id) = &query.board_id {
        if !state.store.user_is_board_member(board_id, &user_id).await? {
            return Err(Failure::new(
                StatusCode::FORBIDDEN,
                "Not a member of this board",
            ));
        }
    }

    let status = match query.status.as_deref() {
        Some(s) => Some(
            TaskStatus::parse(s)
                .ok_or_else(|| ProtocolError(format!("unknown status filter: {s}")))?,
        ),
        None => None,
    };

    let tasks = state
        .tasks
        .list(&TaskFilter {
            board_id: query.board_id,
            card_id: query.card_id,
            status,
        })
        .await?;
    Ok(Json(tasks))
}

#[derive(Deserialize)]
struct CreateTaskBody {
    task_type: String,
    board_id: String,
    #[serde(default)]
    card_id: Option<String>,
    #[serde(default)]
    assigned_to: Option<String>,
    #[serde(default)]
    agent_type: String,
    #[serde(default)]
    agent_model: Option<String>,
    #[serde(default)]
    prompt_text: String,
    #[serde(default)]
    payload: Option<serde_json::Value>,
    #[serde(default)]
    priority: i64,
}

async fn create_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateTaskBody>,
) -> Result<impl IntoResponse, Failure> {
    let user_id = state.require_user(&headers).await?;
    if !state
        .store
        .user_is_board_member(&body.board_id, &user_id)
        .await?
    {
        return Err(Failure::new(
            StatusCode::FORBIDDEN,
            "Not a member of this board",
        ));
    }

    let task_type = TaskType::parse(&body.task_type)
        .ok_or_else(|| ProtocolError(format!("unknown task_type: {}", body.task_type)))?;

    let mut new = NewTask::new(task_type, body.board_id, user_id);
    new.card_id = body.card_id;
    new.assigned_to = body.assigned_to;
    new.agent_type = body.agent_type;
    if let Some(model) = body.agent_model {
        new.agent_model = model;
    }
    new.prompt_text = body.prompt_text;
    if let Some(payload) = body.payload {
        new.payload = payload;
    }
    new.priority = body.priority;

    let task = state.tasks.create(&new).await?;
    Ok((StatusCode::CREATED, Json(task)))
}

async fn cancel_task(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(task_id): Path<String>,
) -> Result<impl IntoResponse, Failure> {
    state.require_user(&headers).await?;
    state.tasks.cancel(&task_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
