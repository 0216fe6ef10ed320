use std::net::SocketAddr;

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::api::state::AppState;
use crate::listener::Network;

#[derive(Debug, Serialize)]
pub struct TunnelResponse {
    pub network: Network,
    pub address: String,
    pub target: String,
    pub proxy: String,
    pub bound: SocketAddr,
}

#[derive(Debug, Serialize)]
pub struct TunnelsResponse {
    pub tunnels: Vec<TunnelResponse>,
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/tunnels", get(list_tunnels))
}

async fn list_tunnels(State(state): State<AppState>) -> Json<TunnelsResponse> {
    let tunnels = state
        .hub()
        .manager()
        .tunnels()
        .list()
        .await
        .into_iter()
        .map(|t| TunnelResponse {
            network: t.network,
            address: t.key.address,
            target: t.key.target,
            proxy: t.key.proxy,
            bound: t.bound,
        })
        .collect();
    Json(TunnelsResponse { tunnels })
}
