use axum::{extract::State, response::Response, routing::get, Router};

use crate::api::state::AppState;
use crate::api::stream::{respond, MaybeUpgrade};

pub fn routes() -> Router<AppState> {
    Router::new().route("/traffic", get(stream_traffic))
}

/// One `{up, down}` sample per second.
async fn stream_traffic(State(state): State<AppState>, upgrade: MaybeUpgrade) -> Response {
    let samples = state.hub().stats().traffic().subscribe();
    respond(upgrade, samples)
}
