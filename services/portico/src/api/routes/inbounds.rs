//! Explicit inbound listing and batch replace.
//!
//! Legacy port listeners never show up here and are never touched by a
//! replace.

use axum::{extract::State, routing::get, Json, Router};
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::api::state::AppState;
use crate::inbound::{InboundSpec, InboundType};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct InboundBody {
    #[serde(rename = "type")]
    pub inbound_type: String,
    pub bind_address: String,
}

impl From<&InboundSpec> for InboundBody {
    fn from(spec: &InboundSpec) -> Self {
        Self {
            inbound_type: spec.inbound_type.to_string(),
            bind_address: spec.bind_address.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FailedInbound {
    pub inbound: String,
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct ReplaceInboundsResponse {
    pub created: Vec<String>,
    pub closed: Vec<String>,
    pub failed: Vec<FailedInbound>,
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/inbounds", get(list_inbounds).put(replace_inbounds))
}

async fn list_inbounds(State(state): State<AppState>) -> Json<Vec<InboundBody>> {
    let inbounds = state.hub().manager().inbounds().await;
    Json(inbounds.iter().map(InboundBody::from).collect())
}

async fn replace_inbounds(
    State(state): State<AppState>,
    Json(body): Json<Vec<InboundBody>>,
) -> Result<Json<ReplaceInboundsResponse>, ApiError> {
    let specs = body
        .iter()
        .map(|b| {
            let inbound_type = b
                .inbound_type
                .parse::<InboundType>()
                .map_err(|e| ApiError::bad_request("invalid_inbound", e.to_string()))?;
            Ok(InboundSpec::new(inbound_type, b.bind_address.clone()))
        })
        .collect::<Result<Vec<_>, ApiError>>()?;

    let report = state.hub().update_inbounds(&specs).await;

    Ok(Json(ReplaceInboundsResponse {
        created: report.created.iter().map(InboundSpec::alias).collect(),
        closed: report.closed.iter().map(InboundSpec::alias).collect(),
        failed: report
            .failed
            .into_iter()
            .map(|(spec, error)| FailedInbound {
                inbound: spec.alias(),
                error,
            })
            .collect(),
    }))
}
