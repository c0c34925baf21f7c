//! Blending of hour-of-week baselines with fresh measurements
//!
//! A stable baseline (low coefficient of variation) is trusted more than a
//! single measurement; a volatile one less. Weights and the CV threshold
//! are configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::baseline::{BaselineEstimate, BaselineStore};
use crate::error::{Result, SqmError};
use crate::models::{Direction, LinkMode, RatePair, WanLinkId};

/// Baseline weights; the measurement gets the remainder
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlendConfig {
    /// Used when the baseline CV is below the profile's variance threshold
    pub stable_baseline_weight: f64,
    pub volatile_baseline_weight: f64,
}

impl Default for BlendConfig {
    fn default() -> Self {
        Self {
            stable_baseline_weight: 0.8,
            volatile_baseline_weight: 0.6,
        }
    }
}

impl BlendConfig {
    pub fn validate(&self) -> Result<()> {
        for w in [self.stable_baseline_weight, self.volatile_baseline_weight] {
            if !(0.0..=1.0).contains(&w) {
                return Err(SqmError::invalid(
                    "blend weight",
                    format!("{} must be within [0, 1]", w),
                ));
            }
        }
        Ok(())
    }

    pub fn baseline_weight(&self, cv: f64, cv_threshold: f64) -> f64 {
        if cv < cv_threshold {
            self.stable_baseline_weight
        } else {
            self.volatile_baseline_weight
        }
    }
}

/// Weighted mix of a baseline mean and a measurement
pub fn blend(baseline_mean: f64, measurement: f64, baseline_weight: f64) -> f64 {
    baseline_weight * baseline_mean + (1.0 - baseline_weight) * measurement
}

/// What the effective rate was derived from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateBasis {
    /// Raw measurement (learning mode)
    Measurement,
    Blended,
    /// Measurement failed; baseline alone
    BaselineOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EffectiveRates {
    pub rates: RatePair,
    pub basis: RateBasis,
    /// Baseline means used, when any
    pub baseline: Option<RatePair>,
    pub mode: LinkMode,
}

/// Per-direction baselines for one instant
pub type BaselinePair = (Option<BaselineEstimate>, Option<BaselineEstimate>);

#[derive(Debug, Clone, Default)]
pub struct BlendingEngine {
    config: BlendConfig,
}

impl BlendingEngine {
    pub fn new(config: BlendConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BlendConfig {
        &self.config
    }

    /// Effective rate for `link_id` at `now`.
    ///
    /// `latest` is the measurement of this cycle, `None` when it failed.
    /// Must be called before that measurement is recorded into the store.
    pub fn compute_effective_rate(
        &self,
        store: &BaselineStore,
        link_id: &WanLinkId,
        now: DateTime<Utc>,
        latest: Option<RatePair>,
        cv_threshold: f64,
    ) -> Result<EffectiveRates> {
        let baselines = (
            store.get_baseline(link_id, now, Direction::Download),
            store.get_baseline(link_id, now, Direction::Upload),
        );
        self.combine(link_id, store.mode(link_id), baselines, latest, cv_threshold)
    }

    pub fn combine(
        &self,
        link_id: &WanLinkId,
        mode: LinkMode,
        baselines: BaselinePair,
        latest: Option<RatePair>,
        cv_threshold: f64,
    ) -> Result<EffectiveRates> {
        let baseline_means = match baselines {
            (Some(down), Some(up)) => Some(RatePair::new(down.mean, up.mean)),
            _ => None,
        };
        let estimate_for = |d: Direction| match d {
            Direction::Download => baselines.0,
            Direction::Upload => baselines.1,
        };

        match latest {
            Some(measured) if mode == LinkMode::Learning || baseline_means.is_none() => {
                Ok(EffectiveRates {
                    rates: measured,
                    basis: RateBasis::Measurement,
                    baseline: baseline_means,
                    mode,
                })
            }
            Some(measured) => {
                let rates = RatePair::from_fn(|d| match estimate_for(d) {
                    Some(estimate) => {
                        let weight = self.config.baseline_weight(estimate.cv(), cv_threshold);
                        blend(estimate.mean, measured.get(d), weight)
                    }
                    None => measured.get(d),
                });
                Ok(EffectiveRates {
                    rates,
                    basis: RateBasis::Blended,
                    baseline: baseline_means,
                    mode,
                })
            }
            None => match baseline_means {
                Some(means) => Ok(EffectiveRates {
                    rates: means,
                    basis: RateBasis::BaselineOnly,
                    baseline: Some(means),
                    mode,
                }),
                None => Err(SqmError::NoRateEvidence(link_id.clone())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::baseline::BaselineSource;
    use crate::testing::{monday_at, t0};
    use chrono::Duration;

    fn estimate(mean: f64, std_dev: f64) -> Option<BaselineEstimate> {
        Some(BaselineEstimate {
            mean,
            std_dev,
            sample_count: 12,
            source: BaselineSource::Bucket,
        })
    }

    fn active_store(monday_18_down: &[f64]) -> BaselineStore {
        let store = BaselineStore::default();
        let id: WanLinkId = "wan1".into();
        for hour in 0..168 {
            store
                .record_sample(&id, t0() + Duration::hours(hour), 250.0, 20.0)
                .unwrap();
        }
        for down in monday_18_down {
            store.record_sample(&id, monday_at(18), *down, 20.0).unwrap();
        }
        store
    }

    #[test]
    fn test_stable_baseline_weights() {
        let store = active_store(&[240.0, 260.0]);
        let engine = BlendingEngine::default();
        let result = engine
            .compute_effective_rate(
                &store,
                &"wan1".into(),
                monday_at(18),
                Some(RatePair::new(200.0, 20.0)),
                0.10,
            )
            .unwrap();

        assert_eq!(result.basis, RateBasis::Blended);
        assert_eq!(result.mode, LinkMode::Active);
        assert!((result.rates.down_mbps - 240.0).abs() < 1e-9);
        assert!((result.rates.up_mbps - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_volatile_baseline_weights() {
        let store = active_store(&[210.0, 290.0]);
        let engine = BlendingEngine::default();
        let result = engine
            .compute_effective_rate(
                &store,
                &"wan1".into(),
                monday_at(18),
                Some(RatePair::new(200.0, 20.0)),
                0.10,
            )
            .unwrap();

        assert!((result.rates.down_mbps - 230.0).abs() < 1e-9);
    }

    #[test]
    fn test_threshold_boundary_counts_as_volatile() {
        let engine = BlendingEngine::default();
        let result = engine
            .combine(
                &"wan1".into(),
                LinkMode::Active,
                (estimate(100.0, 10.0), estimate(10.0, 0.5)),
                Some(RatePair::new(50.0, 10.0)),
                0.10,
            )
            .unwrap();
        assert!((result.rates.down_mbps - 80.0).abs() < 1e-9);
        assert!((result.rates.up_mbps - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_learning_mode_uses_raw_measurement() {
        let engine = BlendingEngine::default();
        let result = engine
            .combine(
                &"wan1".into(),
                LinkMode::Learning,
                (estimate(250.0, 10.0), estimate(20.0, 1.0)),
                Some(RatePair::new(300.0, 20.0)),
                0.10,
            )
            .unwrap();
        assert_eq!(result.basis, RateBasis::Measurement);
        assert_eq!(result.rates, RatePair::new(300.0, 20.0));
    }

    #[test]
    fn test_failed_measurement_uses_baseline_alone() {
        let engine = BlendingEngine::default();
        let result = engine
            .combine(
                &"wan1".into(),
                LinkMode::Active,
                (estimate(250.0, 40.0), estimate(20.0, 1.0)),
                None,
                0.10,
            )
            .unwrap();
        assert_eq!(result.basis, RateBasis::BaselineOnly);
        assert_eq!(result.rates, RatePair::new(250.0, 20.0));
    }

    #[test]
    fn test_no_evidence_is_an_error() {
        let engine = BlendingEngine::default();
        let err = engine
            .compute_effective_rate(&BaselineStore::default(), &"wan1".into(), t0(), None, 0.10)
            .unwrap_err();
        assert!(matches!(err, SqmError::NoRateEvidence(_)));
    }

    #[test]
    fn test_custom_weights() {
        let engine = BlendingEngine::new(BlendConfig {
            stable_baseline_weight: 0.5,
            volatile_baseline_weight: 0.0,
        });
        let result = engine
            .combine(
                &"wan1".into(),
                LinkMode::Active,
                (estimate(100.0, 1.0), estimate(10.0, 5.0)),
                Some(RatePair::new(50.0, 4.0)),
                0.10,
            )
            .unwrap();
        assert!((result.rates.down_mbps - 75.0).abs() < 1e-9);
        assert!((result.rates.up_mbps - 4.0).abs() < 1e-9);
    }
}
