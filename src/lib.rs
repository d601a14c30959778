//! ccbroker: a multi-tenant dispatch broker between chat platforms (Slack,
//! Discord) and a fleet of long-lived worker agents connected over
//! persistent WebSocket sessions.
//!
//! `main.rs` wires these modules into a running process; `tests/` and this
//! crate's inline `#[cfg(test)]` modules exercise them directly against
//! [`testutil::FakeDatastore`] without a real database or socket.

pub mod auth;
pub mod commands;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod ids;
pub mod jobstore;
pub mod lifecycle;
pub mod models;
pub mod platform;
pub mod prompts;
pub mod registry;
pub mod tasks;
pub mod telemetry;
pub mod util;

#[cfg(any(test, feature = "test-util"))]
pub mod testutil;
