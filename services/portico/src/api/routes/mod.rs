//! Control API routes.

mod configs;
mod connections;
mod dns;
mod inbounds;
mod logs;
mod rules;
mod traffic;
mod tunnels;
mod version;

use axum::Router;

use crate::api::state::AppState;

pub fn routes() -> Router<AppState> {
    Router::new()
        .merge(version::routes())
        .merge(configs::routes())
        .merge(inbounds::routes())
        .merge(rules::routes())
        .merge(tunnels::routes())
        .merge(logs::routes())
        .merge(traffic::routes())
        .merge(connections::routes())
        .merge(dns::routes())
}
