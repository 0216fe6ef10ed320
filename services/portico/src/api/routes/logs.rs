use std::future::ready;

use axum::{
    extract::{Query, State},
    response::Response,
    routing::get,
    Router,
};
use futures_util::StreamExt;
use portico_events::LogLevel;
use serde::Deserialize;

use crate::api::error::ApiError;
use crate::api::state::AppState;
use crate::api::stream::{respond, MaybeUpgrade};

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub level: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/logs", get(stream_logs))
}

/// Stream log events at or above `level` (default `info`).
async fn stream_logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
    upgrade: MaybeUpgrade,
) -> Result<Response, ApiError> {
    let level = match query.level.as_deref() {
        Some(level) => level
            .parse::<LogLevel>()
            .map_err(|e| ApiError::bad_request("invalid_level", e.to_string()))?,
        None => LogLevel::Info,
    };

    let events = state
        .hub()
        .log()
        .bus()
        .subscribe()
        .filter(move |event| ready(level.allows(event.level)));

    Ok(respond(upgrade, events))
}
