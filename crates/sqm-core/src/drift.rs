//! Baseline drift detection
//!
//! Flags links whose measurements keep landing far outside their learned
//! hour-of-week baseline, which usually means the ISP changed something.
//! Drift is only reported; baselines are never reset automatically.

use serde::{Deserialize, Serialize};

use crate::baseline::{BaselineEstimate, BaselineSource, MIN_BUCKET_SAMPLES};
use crate::blending::BaselinePair;
use crate::error::SqmError;
use crate::models::{Direction, RatePair, WanLinkId};

/// Spread floor relative to the mean, keeps z finite for flat buckets
const MIN_RELATIVE_STD_DEV: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftConfig {
    pub sigma_threshold: f64,
    pub consecutive_cycles: u32,
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            sigma_threshold: 3.0,
            consecutive_cycles: 3,
        }
    }
}

/// Consecutive out-of-band cycles per direction
#[derive(Debug, Clone, Copy, Default)]
pub struct DriftTracker {
    download: u32,
    upload: u32,
}

impl DriftTracker {
    fn count_mut(&mut self, direction: Direction) -> &mut u32 {
        match direction {
            Direction::Download => &mut self.download,
            Direction::Upload => &mut self.upload,
        }
    }

    pub fn count(&self, direction: Direction) -> u32 {
        match direction {
            Direction::Download => self.download,
            Direction::Upload => self.upload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftAnomaly {
    pub link_id: WanLinkId,
    pub direction: Direction,
    pub z_score: f64,
    pub cycles: u32,
    pub baseline_mean: f64,
    pub measured: f64,
}

impl DriftAnomaly {
    pub fn to_error(&self) -> SqmError {
        SqmError::BaselineDrift {
            link_id: self.link_id.clone(),
            direction: self.direction,
            z_score: self.z_score,
            cycles: self.cycles,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DriftDetector {
    config: DriftConfig,
}

impl DriftDetector {
    pub fn new(config: DriftConfig) -> Self {
        Self { config }
    }

    fn z_score(estimate: &BaselineEstimate, measured: f64) -> Option<f64> {
        if estimate.source != BaselineSource::Bucket
            || estimate.sample_count < MIN_BUCKET_SAMPLES
            || estimate.mean <= 0.0
        {
            return None;
        }
        let std_dev = estimate.std_dev.max(estimate.mean * MIN_RELATIVE_STD_DEV);
        Some((measured - estimate.mean) / std_dev)
    }

    /// Compare a successful measurement with the baseline it was blended
    /// against and return the directions that have drifted long enough
    pub fn observe(
        &self,
        tracker: &mut DriftTracker,
        link_id: &WanLinkId,
        baselines: BaselinePair,
        measured: RatePair,
    ) -> Vec<DriftAnomaly> {
        let mut anomalies = Vec::new();
        for direction in Direction::ALL {
            let estimate = match direction {
                Direction::Download => baselines.0,
                Direction::Upload => baselines.1,
            };
            let Some(estimate) = estimate else {
                continue;
            };
            let value = measured.get(direction);
            let Some(z) = Self::z_score(&estimate, value) else {
                continue;
            };

            let count = tracker.count_mut(direction);
            if z.abs() > self.config.sigma_threshold {
                *count += 1;
            } else {
                *count = 0;
            }

            if *count >= self.config.consecutive_cycles {
                anomalies.push(DriftAnomaly {
                    link_id: link_id.clone(),
                    direction,
                    z_score: z,
                    cycles: *count,
                    baseline_mean: estimate.mean,
                    measured: value,
                });
            }
        }
        anomalies
    }
}
