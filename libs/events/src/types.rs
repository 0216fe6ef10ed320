//! Event payloads carried over the bus.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EventError;

/// Log severity, ordered from most to least verbose.
///
/// `Silent` sits above every real level so a `Silent` threshold filters
/// everything out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Silent,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Silent => "silent",
        }
    }

    /// Returns true if an event at `level` passes this threshold.
    pub fn allows(&self, level: LogLevel) -> bool {
        *self != LogLevel::Silent && level >= *self
    }

    /// Directive understood by `tracing_subscriber::EnvFilter`.
    pub fn as_filter_directive(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warn",
            Self::Error => "error",
            Self::Silent => "off",
        }
    }
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" | "trace" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warning" | "warn" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "silent" | "off" => Ok(Self::Silent),
            other => Err(EventError::UnknownLevel(other.to_string())),
        }
    }
}

/// A rendered log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    #[serde(rename = "type")]
    pub level: LogLevel,
    pub payload: String,
    pub time: DateTime<Utc>,
}

impl LogEvent {
    pub fn new(level: LogLevel, payload: impl Into<String>) -> Self {
        Self {
            level,
            payload: payload.into(),
            time: Utc::now(),
        }
    }
}

/// Per-second traffic sample in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Traffic {
    pub up: i64,
    pub down: i64,
}
