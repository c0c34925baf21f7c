//! Adaptive SQM core library
//!
//! This crate provides the control pipeline that keeps a gateway's shaping
//! rates just under what each WAN link can actually deliver:
//! - WAN link registry and connection-profile presets
//! - Hour-of-week throughput baselines (online statistics)
//! - Speed-test sampling and latency monitoring
//! - Baseline/measurement blending and shaping-rate decisions
//! - Idempotent deployment of shaping fragments to the gateway
//! - Alerting, status reporting, persistence, health and metrics

pub mod actuator;
pub mod alerts;
pub mod baseline;
pub mod blending;
pub mod clock;
pub mod decision;
pub mod drift;
pub mod engine;
pub mod error;
pub mod health;
pub mod history;
pub mod latency;
pub mod measurement;
pub mod models;
pub mod observability;
pub mod persistence;
pub mod registry;
pub mod sampler;
pub mod scheduler;
pub mod status;

#[cfg(test)]
mod testing;

pub use engine::{EngineConfig, SqmEngine, SqmEngineBuilder};
pub use error::{RemoteError, Result, SqmError};
pub use health::{ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse};
pub use models::*;
pub use observability::{SqmMetrics, StructuredLogger};
pub use scheduler::PipelineScheduler;
