//! Adaptive SQM daemon
//!
//! The binary in `main.rs` wires these modules together; they live in a
//! library so the HTTP API and configuration can be tested directly.

pub mod api;
pub mod config;
