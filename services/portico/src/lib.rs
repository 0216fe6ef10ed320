//! portico: inbound listener orchestration and control plane for a
//! rule-based local proxy.
//!
//! The crate ships a `portico` binary; the library surface exists for
//! integration testing and reuse.

pub mod api;
pub mod bootstrap;
pub mod config;
pub mod dispatch;
pub mod dns;
pub mod hub;
pub mod inbound;
pub mod listener;
pub mod log;
pub mod manager;
pub mod rules;
pub mod server;
pub mod statistic;
