//! Tracing setup.
//!
//! The subscriber stack is a reloadable `EnvFilter`, a console `fmt` layer
//! and a [`BusLayer`] that renders every enabled event into a [`LogEvent`]
//! on the log bus, which feeds the `/logs` stream. `RUST_LOG`, when set,
//! wins over the configured level and pins the filter.

use std::fmt::Write as _;

use anyhow::Context as _;
use portico_events::{LogEvent, LogLevel, Observable, DEFAULT_SUBSCRIBER_BUFFER};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Layer, Registry};

use crate::config::LogFormat;

/// Control over the installed subscriber.
#[derive(Clone)]
pub struct LogHandle {
    filter: Option<reload::Handle<EnvFilter, Registry>>,
    bus: Observable<LogEvent>,
}

impl LogHandle {
    /// Handle without an installed subscriber. Level changes are ignored.
    pub fn detached(bus: Observable<LogEvent>) -> Self {
        Self { filter: None, bus }
    }

    /// Log bus fed by the subscriber.
    pub fn bus(&self) -> &Observable<LogEvent> {
        &self.bus
    }

    /// Swap the active level. A no-op when `RUST_LOG` pinned the filter.
    pub fn set_level(&self, level: LogLevel) -> anyhow::Result<()> {
        let Some(filter) = &self.filter else {
            return Ok(());
        };
        filter
            .reload(EnvFilter::new(level.as_filter_directive()))
            .context("Failed to reload log filter")
    }
}

/// Install the global subscriber.
pub fn install(format: LogFormat, level: LogLevel) -> anyhow::Result<LogHandle> {
    let bus = Observable::new(DEFAULT_SUBSCRIBER_BUFFER);

    let (filter, pinned) = match EnvFilter::try_from_default_env() {
        Ok(filter) => (filter, true),
        Err(_) => (EnvFilter::new(level.as_filter_directive()), false),
    };
    let (filter_layer, filter_handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with((format == LogFormat::Json).then(|| fmt::layer().json()))
        .with((format == LogFormat::Text).then(fmt::layer))
        .with(BusLayer::new(bus.clone()))
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(LogHandle {
        filter: (!pinned).then_some(filter_handle),
        bus,
    })
}

/// Publishes every event it sees onto the log bus.
pub struct BusLayer {
    bus: Observable<LogEvent>,
}

impl BusLayer {
    pub fn new(bus: Observable<LogEvent>) -> Self {
        Self { bus }
    }
}

impl<S: Subscriber> Layer<S> for BusLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if self.bus.subscriber_count() == 0 {
            return;
        }
        let mut visitor = PayloadVisitor::default();
        event.record(&mut visitor);
        self.bus
            .publish(LogEvent::new(level_of(event.metadata().level()), visitor.finish()));
    }
}

fn level_of(level: &Level) -> LogLevel {
    match *level {
        Level::ERROR => LogLevel::Error,
        Level::WARN => LogLevel::Warning,
        Level::INFO => LogLevel::Info,
        _ => LogLevel::Debug,
    }
}

/// Renders `message key=value ...`.
#[derive(Default)]
struct PayloadVisitor {
    message: String,
    fields: String,
}

impl PayloadVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields.trim_start().to_string()
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl Visit for PayloadVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}
