use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::api::state::AppState;
use crate::rules::Rule;

#[derive(Debug, Serialize)]
pub struct RulesResponse {
    pub rules: Vec<Rule>,
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/rules", get(list_rules))
}

async fn list_rules(State(state): State<AppState>) -> Json<RulesResponse> {
    Json(RulesResponse {
        rules: state.hub().rules().list().to_vec(),
    })
}
