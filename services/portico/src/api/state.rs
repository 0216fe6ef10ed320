//! Application state shared across request handlers.

use std::sync::Arc;

use crate::hub::Hub;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
#[derive(Clone)]
pub struct AppState {
    hub: Arc<Hub>,
}

impl AppState {
    pub fn new(hub: Arc<Hub>) -> Self {
        Self { hub }
    }

    pub fn hub(&self) -> &Hub {
        &self.hub
    }
}
