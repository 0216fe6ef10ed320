//! Error types for event handling.

use thiserror::Error;

/// Errors that can occur when handling events.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The log level name is unknown.
    #[error("unknown log level: {0}")]
    UnknownLevel(String),
}
