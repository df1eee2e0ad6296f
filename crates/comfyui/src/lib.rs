//! ComfyUI WebSocket and REST client library.
//!
//! Provides the HTTP API wrapper, typed push-message parsing, the
//! WebSocket client, history/output extraction, the startup readiness
//! gate, and the bounded completion wait used to run one workflow.

pub mod api;
pub mod client;
pub mod history;
pub mod messages;
pub mod readiness;
pub mod wait;
