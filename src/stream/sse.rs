//! SSE stream endpoint — fans bus events out to browser clients.
//!
//! Each connection owns bounded subscriber cursors; a client that stops
//! reading loses its oldest events, never the connection, and never slows
//! a publisher. Dropping the connection drops the receivers, which is all
//! the unsubscribe there is. No replay: reconnecting clients refetch
//! snapshot state through the REST surface.

use std::convert::Infallible;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event as SseEvent, Sse};
use chrono::Utc;
use futures::stream::{BoxStream, SelectAll, Stream, StreamExt};
use serde::Deserialize;
use tokio_stream::wrappers::{BroadcastStream, IntervalStream};
use tracing::debug;

use crate::config::STREAM_HEARTBEAT;
use crate::error::AuthError;
use crate::events::{topic, Event};
use crate::server::auth::bearer_token;
use crate::server::{AppState, Failure};

#[derive(Deserialize)]
pub struct StreamQuery {
    board_id: Option<String>,
    /// EventSource cannot set headers, so the token may arrive as a
    /// query parameter instead.
    token: Option<String>,
}

pub async fn event_stream(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, Failure> {
    let token = match bearer_token(&headers) {
        Ok(t) => t.to_string(),
        Err(_) => query.token.clone().ok_or(AuthError::MissingToken)?,
    };
    let user_id = state.auth.authenticate(&token).await?;

    if let Some(board_id) = &query.board_id {
        if !state.store.user_is_board_member(board_id, &user_id).await? {
            return Err(Failure::new(
                StatusCode::FORBIDDEN,
                "Not a member of this board",
            ));
        }
    }

    debug!(user_id, board_id = ?query.board_id, "Stream client connected");

    let mut merged: SelectAll<BoxStream<'static, Event>> = SelectAll::new();

    merged.push(
        BroadcastStream::new(state.bus.subscribe(&topic::user(&user_id)))
            // A lagged cursor means dropped events, not a dropped client.
            .filter_map(|r| async move { r.ok() })
            .boxed(),
    );
    if let Some(board_id) = &query.board_id {
        merged.push(
            BroadcastStream::new(state.bus.subscribe(&topic::board(board_id)))
                .filter_map(|r| async move { r.ok() })
                .boxed(),
        );
    }
    merged.push(
        IntervalStream::new(tokio::time::interval(STREAM_HEARTBEAT))
            .map(|_| Event::Heartbeat {
                timestamp: Utc::now(),
            })
            .boxed(),
    );

    let sse_stream = merged.map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_else(|_| "{}".to_string());
        Ok(SseEvent::default().data(data))
    });

    Ok(Sse::new(sse_stream))
}
