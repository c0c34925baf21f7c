//! Core data models shared across the pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a managed WAN link (the network-group key)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WanLinkId(String);

impl WanLinkId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WanLinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WanLinkId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for WanLinkId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Traffic direction as seen from the LAN
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Download,
    Upload,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Download, Direction::Upload];
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Download => write!(f, "download"),
            Direction::Upload => write!(f, "upload"),
        }
    }
}

impl std::str::FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "download" | "down" => Ok(Direction::Download),
            "upload" | "up" => Ok(Direction::Upload),
            other => Err(format!("unknown direction '{}'", other)),
        }
    }
}

/// A download/upload pair of rates in Mbps
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RatePair {
    pub down_mbps: f64,
    pub up_mbps: f64,
}

impl RatePair {
    pub fn new(down_mbps: f64, up_mbps: f64) -> Self {
        Self { down_mbps, up_mbps }
    }

    pub fn get(&self, direction: Direction) -> f64 {
        match direction {
            Direction::Download => self.down_mbps,
            Direction::Upload => self.up_mbps,
        }
    }

    pub fn set(&mut self, direction: Direction, value: f64) {
        match direction {
            Direction::Download => self.down_mbps = value,
            Direction::Upload => self.up_mbps = value,
        }
    }

    /// Build a pair by evaluating `f` for each direction
    pub fn from_fn(mut f: impl FnMut(Direction) -> f64) -> Self {
        Self {
            down_mbps: f(Direction::Download),
            up_mbps: f(Direction::Upload),
        }
    }
}

impl fmt::Display for RatePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.1}/{:.1} Mbps", self.down_mbps, self.up_mbps)
    }
}

/// Whether a link's hour-of-week baseline is complete
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkMode {
    /// At least one of the 168 buckets has no sample yet
    Learning,
    /// Every bucket has at least one sample
    Active,
}

/// What started a measurement
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleSource {
    Scheduled,
    Manual,
}

/// Result of a speed test as returned by a measurement provider
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpeedMeasurement {
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub latency_ms: Option<f64>,
}

impl SpeedMeasurement {
    pub fn rates(&self) -> RatePair {
        RatePair::new(self.download_mbps, self.upload_mbps)
    }
}

/// Result of a ping probe as returned by a measurement provider
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PingMeasurement {
    pub latency_ms: f64,
    pub jitter_ms: f64,
}

/// Raw speed-test record kept for diagnostics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedSample {
    pub timestamp: DateTime<Utc>,
    pub link_id: WanLinkId,
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub latency_ms: Option<f64>,
    pub source: SampleSource,
}

/// Raw ping record kept for diagnostics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingSample {
    pub timestamp: DateTime<Utc>,
    pub link_id: WanLinkId,
    pub latency_ms: f64,
    pub jitter_ms: f64,
}

/// Why the shaping rate last changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentReason {
    InitialMeasurement,
    Blended,
    EmergencyBackoff,
    CooldownRecovery,
    Reconfigured,
    ManualRedeploy,
}

impl fmt::Display for AdjustmentReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            AdjustmentReason::InitialMeasurement => "initial_measurement",
            AdjustmentReason::Blended => "blended",
            AdjustmentReason::EmergencyBackoff => "emergency_backoff",
            AdjustmentReason::CooldownRecovery => "cooldown_recovery",
            AdjustmentReason::Reconfigured => "reconfigured",
            AdjustmentReason::ManualRedeploy => "manual_redeploy",
        };
        f.write_str(label)
    }
}

/// Shaping rates currently in force on the gateway for one link
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShapingState {
    pub applied: RatePair,
    pub last_applied_at: DateTime<Utc>,
    pub last_adjustment_reason: AdjustmentReason,
    pub last_deployed_content_hash: String,
}
