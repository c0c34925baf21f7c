//! Loaded-latency congestion detection
//!
//! A lightweight ping runs on its own cadence, independent of speed tests.
//! The unloaded reference is the minimum latency in a rolling window and a
//! sample is congested when it exceeds that reference by more than the
//! profile threshold.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;

use crate::error::{Result, SqmError};
use crate::measurement::PingProvider;
use crate::models::PingMeasurement;
use crate::registry::WanLink;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LatencyConfig {
    pub interval_secs: u64,
    pub window_size: usize,
    /// Consecutive congested samples that trigger an emergency backoff
    pub consecutive_samples: u32,
    pub probe_timeout_secs: u64,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            window_size: 12,
            consecutive_samples: 3,
            probe_timeout_secs: 30,
        }
    }
}

impl LatencyConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval_secs == 0 {
            return Err(SqmError::invalid("latency interval", "must be non-zero"));
        }
        if self.window_size == 0 || self.consecutive_samples == 0 {
            return Err(SqmError::invalid(
                "latency window",
                "window size and consecutive samples must be non-zero",
            ));
        }
        Ok(())
    }
}

/// Rolling ping history of one link
#[derive(Debug, Clone, Default)]
pub struct LatencyWindow {
    samples: VecDeque<f64>,
    streak: u32,
}

impl LatencyWindow {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Unloaded-latency reference
    pub fn baseline_ms(&self) -> Option<f64> {
        self.samples.iter().copied().reduce(f64::min)
    }

    pub fn streak(&self) -> u32 {
        self.streak
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LatencyVerdict {
    pub latency_ms: f64,
    pub baseline_ms: f64,
    pub excess_ms: f64,
    pub congested: bool,
    pub streak: u32,
    /// Streak reached the trigger; the streak has been reset
    pub sustained: bool,
}

#[derive(Debug, Clone, Default)]
pub struct LatencyMonitor {
    config: LatencyConfig,
}

impl LatencyMonitor {
    pub fn new(config: LatencyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &LatencyConfig {
        &self.config
    }

    /// Run one probe, bounded by the probe timeout
    pub async fn probe(&self, pinger: &dyn PingProvider, link: &WanLink) -> Result<PingMeasurement> {
        let timeout = self.config.probe_timeout();
        let measurement = tokio::time::timeout(timeout, pinger.ping(link))
            .await
            .map_err(|_| SqmError::MeasurementUnavailable {
                link_id: link.id.clone(),
                reason: format!("ping timed out after {:?}", timeout),
            })??;

        if !measurement.latency_ms.is_finite() || measurement.latency_ms < 0.0 {
            return Err(SqmError::MeasurementUnavailable {
                link_id: link.id.clone(),
                reason: format!("invalid latency {}", measurement.latency_ms),
            });
        }
        Ok(measurement)
    }

    /// Fold a successful ping into the window and classify it
    pub fn observe(
        &self,
        window: &mut LatencyWindow,
        latency_ms: f64,
        threshold_ms: f64,
    ) -> LatencyVerdict {
        window.samples.push_back(latency_ms);
        while window.samples.len() > self.config.window_size {
            window.samples.pop_front();
        }

        let baseline_ms = window.baseline_ms().unwrap_or(latency_ms);
        let excess_ms = latency_ms - baseline_ms;
        let congested = excess_ms > threshold_ms;

        window.streak = if congested { window.streak + 1 } else { 0 };
        let streak = window.streak;
        let sustained = streak >= self.config.consecutive_samples;
        if sustained {
            window.streak = 0;
        }

        if congested {
            debug!(
                latency_ms,
                baseline_ms,
                excess_ms,
                streak,
                "Congested latency sample"
            );
        }

        LatencyVerdict {
            latency_ms,
            baseline_ms,
            excess_ms,
            congested,
            streak,
            sustained,
        }
    }
}
