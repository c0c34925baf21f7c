//! Live status view consumed by dashboards

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::alerts::Alert;
use crate::models::{AdjustmentReason, LinkMode, RatePair, WanLinkId};

/// Most recent speed test: raw result and the shaping rate it led to
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpeedTestObservation {
    pub measured: RatePair,
    /// Safety-margined, clamped candidate derived from this test
    pub adjusted: RatePair,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PingObservation {
    /// Shaping rate in force when the probe ran
    pub rate: Option<RatePair>,
    pub latency: f64,
    pub jitter: f64,
    pub congested: bool,
    pub at: DateTime<Utc>,
}

/// Per-link observations kept for status reporting and recovery
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Observations {
    pub last_speedtest: Option<SpeedTestObservation>,
    pub last_ping: Option<PingObservation>,
    pub last_effective: Option<RatePair>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkStatus {
    pub link_id: WanLinkId,
    pub enabled: bool,
    pub current_rate: Option<RatePair>,
    pub baseline_rate: Option<RatePair>,
    pub last_speedtest: Option<SpeedTestObservation>,
    pub last_ping: Option<PingObservation>,
    pub mode: LinkMode,
    pub learning_progress: f64,
    pub backoff_active: bool,
    pub last_adjustment_reason: Option<AdjustmentReason>,
    pub last_applied_at: Option<DateTime<Utc>>,
    pub alerts: Vec<Alert>,
}

/// Status keyed by interface name
pub type StatusReport = BTreeMap<String, LinkStatus>;
