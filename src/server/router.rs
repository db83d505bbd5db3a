//! Top-level router assembly.

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::registry::routes::worker_routes;
use crate::server::boards::board_routes;
use crate::server::{AppState, Failure};
use crate::stream::sse::event_stream;
use crate::tasks::routes::task_routes;

pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/health", get(health))
        .route("/auth/login", post(login))
        .route("/events/stream", get(event_stream))
        .merge(worker_routes())
        .merge(task_routes())
        .merge(board_routes());

    Router::new().nest("/api", api).with_state(state)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "agentboard",
    }))
}

#[derive(Deserialize)]
struct LoginBody {
    username: String,
    #[serde(default)]
    password: String,
}

async fn login(
    State(state): State<AppState>,
    Json(body): Json<LoginBody>,
) -> Result<impl IntoResponse, Failure> {
    let token = state.auth.login(&body.username, &body.password).await?;
    Ok(Json(serde_json::json!({
        "token": token,
        "user": { "username": body.username },
    })))
}
