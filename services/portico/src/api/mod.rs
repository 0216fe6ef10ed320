//! Control API handlers and routing.

pub mod auth;
pub mod error;
mod routes;
pub mod state;
mod stream;

use axum::{
    http::{header, Method},
    middleware, Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

pub use state::AppState;

/// Create the control API router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::PUT, Method::PATCH, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
        .allow_origin(Any);

    Router::new()
        .merge(routes::routes())
        .layer(middleware::from_fn_with_state(state.clone(), auth::require_secret))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
