//! # portico-events
//!
//! Event bus and event payloads for the portico control plane.
//!
//! ## Design Principles
//!
//! - One producer, any number of independently paced subscribers
//! - Publishing never blocks: a full subscriber buffer drops the event for
//!   that subscriber only
//! - No persistence: a subscriber sees only events published after it
//!   subscribed
//! - Dropping a [`Subscription`] unsubscribes it
//!
//! ## Event Types
//!
//! - Log records ([`LogEvent`], filtered by [`LogLevel`])
//! - Traffic samples ([`Traffic`])

mod error;
mod observable;
mod types;

pub use error::EventError;
pub use observable::{Observable, Subscription, DEFAULT_SUBSCRIBER_BUFFER};
pub use types::*;
