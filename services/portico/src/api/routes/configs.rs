//! General settings: read, patch, reload from file.

use axum::{extract::State, http::StatusCode, routing::get, Json, Router};

use crate::api::error::ApiError;
use crate::api::state::AppState;
use crate::config::{ConfigError, General};
use crate::hub::GeneralPatch;

pub fn routes() -> Router<AppState> {
    Router::new().route(
        "/configs",
        get(get_configs).patch(patch_configs).put(reload_configs),
    )
}

async fn get_configs(State(state): State<AppState>) -> Json<General> {
    Json(General::clone(&state.hub().general()))
}

async fn patch_configs(
    State(state): State<AppState>,
    Json(patch): Json<GeneralPatch>,
) -> Json<General> {
    let general = state.hub().patch_general(patch).await;
    Json(General::clone(&general))
}

/// Re-read the config file, the same path SIGHUP takes.
async fn reload_configs(State(state): State<AppState>) -> Result<StatusCode, ApiError> {
    match state.hub().reload().await {
        Ok(()) => Ok(StatusCode::NO_CONTENT),
        Err(e @ ConfigError::Read { .. }) => {
            tracing::error!(error = %e, "Reload failed");
            Err(ApiError::internal("reload_failed", e.to_string()))
        }
        Err(e) => Err(ApiError::bad_request("invalid_config", e.to_string())),
    }
}
