//! Observability for the shaping pipeline
//!
//! Provides:
//! - Prometheus metrics (applied/effective rates, deployments, failures, cycle latency)
//! - Structured logging of significant pipeline events

use prometheus::{
    register_gauge_vec, register_histogram_vec, register_int_counter_vec, GaugeVec, HistogramVec,
    IntCounterVec,
};
use std::sync::OnceLock;
use tracing::{info, warn};

use crate::models::{AdjustmentReason, Direction, RatePair, WanLinkId};

/// Histogram buckets for cycle latency (seconds); speed tests dominate
const CYCLE_BUCKETS: &[f64] = &[0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0];

static GLOBAL_METRICS: OnceLock<SqmMetricsInner> = OnceLock::new();

struct SqmMetricsInner {
    applied_rate_mbps: GaugeVec,
    effective_rate_mbps: GaugeVec,
    learning_progress: GaugeVec,
    deployments: IntCounterVec,
    measurement_failures: IntCounterVec,
    congestion_events: IntCounterVec,
    cycle_latency_seconds: HistogramVec,
}

impl SqmMetricsInner {
    fn new() -> Self {
        Self {
            applied_rate_mbps: register_gauge_vec!(
                "adaptive_sqm_applied_rate_mbps",
                "Shaping rate currently in force on the gateway",
                &["link", "direction"]
            )
            .expect("Failed to register applied_rate_mbps"),

            effective_rate_mbps: register_gauge_vec!(
                "adaptive_sqm_effective_rate_mbps",
                "Blended effective rate before the safety margin",
                &["link", "direction"]
            )
            .expect("Failed to register effective_rate_mbps"),

            learning_progress: register_gauge_vec!(
                "adaptive_sqm_learning_progress_ratio",
                "Fraction of hour-of-week buckets holding at least one sample",
                &["link"]
            )
            .expect("Failed to register learning_progress"),

            deployments: register_int_counter_vec!(
                "adaptive_sqm_deployments_total",
                "Shaping deployments by outcome",
                &["link", "outcome"]
            )
            .expect("Failed to register deployments"),

            measurement_failures: register_int_counter_vec!(
                "adaptive_sqm_measurement_failures_total",
                "Failed measurements by kind",
                &["link", "kind"]
            )
            .expect("Failed to register measurement_failures"),

            congestion_events: register_int_counter_vec!(
                "adaptive_sqm_congestion_events_total",
                "Emergency backoffs triggered by sustained latency",
                &["link"]
            )
            .expect("Failed to register congestion_events"),

            cycle_latency_seconds: register_histogram_vec!(
                "adaptive_sqm_cycle_latency_seconds",
                "Duration of pipeline cycles",
                &["cycle"],
                CYCLE_BUCKETS.to_vec()
            )
            .expect("Failed to register cycle_latency_seconds"),
        }
    }
}

/// Handle to the process-wide metrics; clones share the same metrics
#[derive(Clone)]
pub struct SqmMetrics {
    _private: (),
}

impl Default for SqmMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SqmMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(SqmMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &SqmMetricsInner {
        GLOBAL_METRICS.get_or_init(SqmMetricsInner::new)
    }

    pub fn set_applied_rate(&self, link_id: &WanLinkId, rates: RatePair) {
        for direction in Direction::ALL {
            self.inner()
                .applied_rate_mbps
                .with_label_values(&[link_id.as_str(), &direction.to_string()])
                .set(rates.get(direction));
        }
    }

    pub fn set_effective_rate(&self, link_id: &WanLinkId, rates: RatePair) {
        for direction in Direction::ALL {
            self.inner()
                .effective_rate_mbps
                .with_label_values(&[link_id.as_str(), &direction.to_string()])
                .set(rates.get(direction));
        }
    }

    pub fn set_learning_progress(&self, link_id: &WanLinkId, progress: f64) {
        self.inner()
            .learning_progress
            .with_label_values(&[link_id.as_str()])
            .set(progress);
    }

    /// `outcome` is one of `applied`, `unchanged`, `failed`
    pub fn inc_deployment(&self, link_id: &WanLinkId, outcome: &str) {
        self.inner()
            .deployments
            .with_label_values(&[link_id.as_str(), outcome])
            .inc();
    }

    /// `kind` is `speedtest` or `ping`
    pub fn inc_measurement_failure(&self, link_id: &WanLinkId, kind: &str) {
        self.inner()
            .measurement_failures
            .with_label_values(&[link_id.as_str(), kind])
            .inc();
    }

    pub fn inc_congestion_event(&self, link_id: &WanLinkId) {
        self.inner()
            .congestion_events
            .with_label_values(&[link_id.as_str()])
            .inc();
    }

    pub fn observe_cycle(&self, cycle: &str, duration_secs: f64) {
        self.inner()
            .cycle_latency_seconds
            .with_label_values(&[cycle])
            .observe(duration_secs);
    }

    /// Drop all series of a removed link
    pub fn remove_link(&self, link_id: &WanLinkId) {
        let inner = self.inner();
        for direction in Direction::ALL {
            let labels = [link_id.as_str(), &direction.to_string()];
            let _ = inner.applied_rate_mbps.remove_label_values(&labels);
            let _ = inner.effective_rate_mbps.remove_label_values(&labels);
        }
        let _ = inner.learning_progress.remove_label_values(&[link_id.as_str()]);
        let _ = inner.congestion_events.remove_label_values(&[link_id.as_str()]);
    }
}

/// Named pipeline events with consistent fields, filterable on `event`
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn log_rate_applied(
        &self,
        link_id: &WanLinkId,
        rates: RatePair,
        reason: AdjustmentReason,
        attempts: u32,
    ) {
        info!(
            event = "rate_applied",
            node = %self.node_name,
            link_id = %link_id,
            down_mbps = rates.down_mbps,
            up_mbps = rates.up_mbps,
            reason = %reason,
            attempts = attempts,
            "Shaping rate applied"
        );
    }

    pub fn log_emergency_backoff(
        &self,
        link_id: &WanLinkId,
        latency_ms: f64,
        baseline_ms: f64,
        rates: RatePair,
    ) {
        warn!(
            event = "emergency_backoff",
            node = %self.node_name,
            link_id = %link_id,
            latency_ms = latency_ms,
            baseline_latency_ms = baseline_ms,
            down_mbps = rates.down_mbps,
            up_mbps = rates.up_mbps,
            "Sustained congestion, backing off"
        );
    }

    pub fn log_cooldown_complete(&self, link_id: &WanLinkId) {
        info!(
            event = "cooldown_complete",
            node = %self.node_name,
            link_id = %link_id,
            "Latency back to normal, leaving backoff"
        );
    }

    pub fn log_baseline_drift(&self, link_id: &WanLinkId, direction: Direction, z_score: f64, cycles: u32) {
        info!(
            event = "baseline_drift",
            node = %self.node_name,
            link_id = %link_id,
            direction = %direction,
            z_score = z_score,
            cycles = cycles,
            "Measurements deviate from baseline, possible ISP change"
        );
    }

    pub fn log_deployment_failed(&self, link_id: &WanLinkId, error_kind: &str, error: &str) {
        warn!(
            event = "deployment_failed",
            node = %self.node_name,
            link_id = %link_id,
            error_kind = %error_kind,
            error = %error,
            "Deployment failed, previous shaping state kept"
        );
    }

    pub fn log_startup(&self, version: &str, links: usize) {
        info!(
            event = "daemon_started",
            node = %self.node_name,
            version = %version,
            links = links,
            "Adaptive SQM daemon started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "daemon_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Adaptive SQM daemon shutting down"
        );
    }
}
