//! Live connections: snapshot, streaming snapshots, close.

use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get},
    Json, Router,
};
use futures_util::StreamExt;
use serde::Deserialize;
use tokio_stream::wrappers::IntervalStream;
use uuid::Uuid;

use crate::api::error::ApiError;
use crate::api::state::AppState;
use crate::api::stream::{respond, MaybeUpgrade};

const DEFAULT_INTERVAL_MS: u64 = 1_000;
const MIN_INTERVAL_MS: u64 = 100;

#[derive(Debug, Deserialize)]
pub struct ConnectionsQuery {
    pub interval: Option<u64>,
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/connections", get(get_connections).delete(close_all))
        .route("/connections/{id}", delete(close_connection))
}

/// A JSON snapshot, or one snapshot per `interval` ms over a WebSocket.
async fn get_connections(
    State(state): State<AppState>,
    Query(query): Query<ConnectionsQuery>,
    upgrade: MaybeUpgrade,
) -> Response {
    let stats = state.hub().stats().clone();
    if upgrade.is_err() {
        return Json(stats.snapshot()).into_response();
    }

    let interval = Duration::from_millis(
        query
            .interval
            .unwrap_or(DEFAULT_INTERVAL_MS)
            .max(MIN_INTERVAL_MS),
    );
    let snapshots = IntervalStream::new(tokio::time::interval(interval)).map(move |_| stats.snapshot());
    respond(upgrade, snapshots)
}

async fn close_all(State(state): State<AppState>) -> StatusCode {
    let closed = state.hub().stats().close_all();
    tracing::info!(connections = closed, "Closing all connections");
    StatusCode::NO_CONTENT
}

async fn close_connection(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let not_found = || ApiError::not_found("connection_not_found", format!("No connection {id}"));
    let id: Uuid = id.parse().map_err(|_| not_found())?;
    if state.hub().stats().close(id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found())
    }
}
