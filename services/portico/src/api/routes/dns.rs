use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use crate::api::error::ApiError;
use crate::api::state::AppState;
use crate::dns::{self, DnsResponse};

#[derive(Debug, Deserialize)]
pub struct DnsQuery {
    pub name: String,
    #[serde(rename = "type")]
    pub record_type: Option<String>,
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/dns/query", get(query_dns))
}

async fn query_dns(
    State(state): State<AppState>,
    Query(query): Query<DnsQuery>,
) -> Result<Json<DnsResponse>, ApiError> {
    let Some(resolver) = state.hub().resolver().get() else {
        return Err(ApiError::service_unavailable(
            "resolver_unavailable",
            "DNS resolver is not configured",
        ));
    };

    let record_type = query.record_type.as_deref().unwrap_or("A");
    let response = dns::probe(&**resolver, &query.name, record_type).await?;
    Ok(Json(response))
}
