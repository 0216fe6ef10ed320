use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::api::state::AppState;

#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub version: &'static str,
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/version", get(version))
}

async fn version() -> Json<VersionResponse> {
    Json(VersionResponse {
        version: env!("CARGO_PKG_VERSION"),
    })
}
