//! Minimal consumed-surface handlers: the card moves that feed the
//! automation engine, plus the card/column creation the worker-side
//! import and planner executors call back into.

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::events::Event;
use crate::server::{AppState, Failure};
use crate::store::model::{new_id, AgentStatus, Card, Column};

pub fn board_routes() -> Router<AppState> {
    Router::new()
        .route("/cards", post(create_card))
        .route("/cards/{id}/move", post(move_card))
        .route("/cards/{id}/comments", get(list_comments))
        .route(
            "/boards/{id}/columns",
            get(list_columns).post(create_column),
        )
        .route("/columns/{id}", patch(update_column))
}

#[derive(Deserialize)]
struct CreateCardBody {
    column_id: String,
    title: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    labels: Vec<String>,
    #[serde(default = "default_priority")]
    priority: String,
    #[serde(default)]
    assignee_id: Option<String>,
}

fn default_priority() -> String {
    "medium".to_string()
}

async fn create_card(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateCardBody>,
) -> Result<impl IntoResponse, Failure> {
    let user_id = state.require_user(&headers).await?;
    let column = state.store.get_column(&body.column_id).await?;
    if !state
        .store
        .user_is_board_member(&column.board_id, &user_id)
        .await?
    {
        return Err(Failure::new(
            StatusCode::FORBIDDEN,
            "Not a member of this board",
        ));
    }

    let card = Card {
        id: new_id(),
        column_id: body.column_id,
        board_id: column.board_id,
        title: body.title,
        description: body.description,
        labels: body.labels,
        priority: body.priority,
        assignee_id: body.assignee_id,
        agent_status: AgentStatus::None,
        position: 0,
        version: 0,
    };
    state.store.insert_card(&card).await?;
    // Re-read for the store-assigned position.
    let card = state.store.get_card(&card.id).await?;

    state
        .bus
        .publish_to_board(&card.board_id, Event::CardUpdated { card: card.clone() });
    Ok((StatusCode::CREATED, Json(card)))
}

#[derive(Deserialize)]
struct MoveCardBody {
    to_column_id: String,
}

/// The automation entry point: a user drag lands here, the move is
/// version-conditional, and entering an auto-run column creates a task.
async fn move_card(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(card_id): Path<String>,
    Json(body): Json<MoveCardBody>,
) -> Result<impl IntoResponse, Failure> {
    let user_id = state.require_user(&headers).await?;
    let card = state.store.get_card(&card_id).await?;
    if !state
        .store
        .user_is_board_member(&card.board_id, &user_id)
        .await?
    {
        return Err(Failure::new(
            StatusCode::FORBIDDEN,
            "Not a member of this board",
        ));
    }

    let moved = state
        .automation
        .user_move_card(&card_id, &body.to_column_id, &user_id)
        .await?;
    Ok(Json(moved))
}

async fn list_comments(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(card_id): Path<String>,
) -> Result<impl IntoResponse, Failure> {
    state.require_user(&headers).await?;
    let comments = state.store.list_comments(&card_id).await?;
    Ok(Json(comments))
}

async fn list_columns(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(board_id): Path<String>,
) -> Result<impl IntoResponse, Failure> {
    state.require_user(&headers).await?;
    let columns = state.store.list_columns(&board_id).await?;
    Ok(Json(columns))
}

#[derive(Deserialize)]
struct CreateColumnBody {
    name: String,
    #[serde(default)]
    auto_run: bool,
    #[serde(default)]
    agent_type: String,
    #[serde(default = "default_model")]
    agent_model: String,
    #[serde(default)]
    prompt_template: String,
    #[serde(default)]
    on_success_column_id: String,
    #[serde(default)]
    on_failure_column_id: String,
    #[serde(default = "default_max_loops")]
    max_loop_count: i64,
    #[serde(default)]
    position: i64,
}

fn default_model() -> String {
    "smart".to_string()
}

fn default_max_loops() -> i64 {
    3
}

async fn create_column(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(board_id): Path<String>,
    Json(body): Json<CreateColumnBody>,
) -> Result<impl IntoResponse, Failure> {
    let user_id = state.require_user(&headers).await?;
    if !state
        .store
        .user_is_board_member(&board_id, &user_id)
        .await?
    {
        return Err(Failure::new(
            StatusCode::FORBIDDEN,
            "Not a member of this board",
        ));
    }

    let column = Column {
        id: new_id(),
        board_id,
        name: body.name,
        position: body.position,
        auto_run: body.auto_run,
        agent_type: body.agent_type,
        agent_model: body.agent_model,
        prompt_template: body.prompt_template,
        on_success_column_id: body.on_success_column_id,
        on_failure_column_id: body.on_failure_column_id,
        max_loop_count: body.max_loop_count,
    };
    state.store.insert_column(&column).await?;
    Ok((StatusCode::CREATED, Json(column)))
}

#[derive(Deserialize)]
struct UpdateColumnBody {
    #[serde(default)]
    on_success_column_id: Option<String>,
    #[serde(default)]
    on_failure_column_id: Option<String>,
}

async fn update_column(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(column_id): Path<String>,
    Json(body): Json<UpdateColumnBody>,
) -> Result<impl IntoResponse, Failure> {
    let user_id = state.require_user(&headers).await?;
    let column = state.store.get_column(&column_id).await?;
    if !state
        .store
        .user_is_board_member(&column.board_id, &user_id)
        .await?
    {
        return Err(Failure::new(
            StatusCode::FORBIDDEN,
            "Not a member of this board",
        ));
    }

    let updated = state
        .store
        .update_column_routing(
            &column_id,
            body.on_success_column_id.as_deref(),
            body.on_failure_column_id.as_deref(),
        )
        .await?;
    Ok(Json(updated))
}
