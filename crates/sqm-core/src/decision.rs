//! Conversion of effective rates into safe shaping rates
//!
//! Applies the profile safety margin, clamps into `[floor, nominal]`,
//! suppresses noise-level changes with a relative hysteresis band and
//! issues emergency backoffs when the latency monitor reports sustained
//! congestion.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, SqmError};
use crate::models::{AdjustmentReason, Direction, RatePair, ShapingState};
use crate::registry::{ProfileParams, WanLink};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    /// Minimum relative change before a new rate is pushed
    pub min_relative_delta: f64,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            min_relative_delta: 0.03,
        }
    }
}

impl DecisionConfig {
    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.min_relative_delta) {
            return Err(SqmError::invalid(
                "min_relative_delta",
                format!("{} must be within [0, 1)", self.min_relative_delta),
            ));
        }
        Ok(())
    }
}

/// Rates the actuator should put in force
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShapingTarget {
    pub rates: RatePair,
    pub reason: AdjustmentReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldReason {
    WithinHysteresis,
    /// An increase was suppressed while an emergency backoff is active
    BackoffActive,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    Apply(ShapingTarget),
    Hold { candidate: RatePair, reason: HoldReason },
}

/// Emergency backoff lifecycle of one link
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BackoffState {
    #[default]
    Normal,
    Active {
        since: DateTime<Utc>,
        /// Start of the current run of uncongested pings
        clear_since: Option<DateTime<Utc>>,
    },
}

impl BackoffState {
    pub fn is_active(&self) -> bool {
        matches!(self, BackoffState::Active { .. })
    }

    pub fn engage(&mut self, now: DateTime<Utc>) {
        *self = BackoffState::Active {
            since: now,
            clear_since: None,
        };
    }

    /// Track a ping verdict while backed off. Returns true when the link
    /// has stayed uncongested for the whole cooldown and backoff ends.
    pub fn observe(&mut self, now: DateTime<Utc>, congested: bool, cooldown: Duration) -> bool {
        let BackoffState::Active { clear_since, .. } = self else {
            return false;
        };
        if congested {
            *clear_since = None;
            return false;
        }
        let started = *clear_since.get_or_insert(now);
        if now - started >= cooldown {
            *self = BackoffState::Normal;
            return true;
        }
        false
    }
}

#[derive(Debug, Clone, Default)]
pub struct DecisionEngine {
    config: DecisionConfig,
}

impl DecisionEngine {
    pub fn new(config: DecisionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DecisionConfig {
        &self.config
    }

    /// Effective rate scaled by the safety margin, clamped to the link limits
    pub fn candidate(&self, effective: RatePair, link: &WanLink, params: &ProfileParams) -> RatePair {
        let scaled = RatePair::from_fn(|d| effective.get(d) * params.safety_margin_factor);
        link.clamp(scaled)
    }

    fn exceeds_delta(&self, candidate: f64, previous: f64) -> bool {
        if previous <= 0.0 {
            return candidate != previous;
        }
        ((candidate - previous) / previous).abs() > self.config.min_relative_delta
    }

    /// Decide whether the blended cycle should push a new rate.
    ///
    /// Directions within the hysteresis band keep their previous value.
    /// While a backoff is active only decreases pass.
    pub fn compute_shaping_rate(
        &self,
        effective: RatePair,
        link: &WanLink,
        params: &ProfileParams,
        previous: Option<&ShapingState>,
        backoff_active: bool,
        reason: AdjustmentReason,
    ) -> Decision {
        let candidate = self.candidate(effective, link, params);

        let Some(previous) = previous else {
            return Decision::Apply(ShapingTarget {
                rates: candidate,
                reason,
            });
        };

        // A reconfigured link may leave the previous rate outside its new limits
        let base = link.clamp(previous.applied);
        let reconfigured = base != previous.applied;

        let mut blocked_by_backoff = false;
        let mut changed = false;
        let target = RatePair::from_fn(|d: Direction| {
            let next = candidate.get(d);
            let prev = base.get(d);
            if !self.exceeds_delta(next, prev) {
                return prev;
            }
            if backoff_active && next > prev {
                blocked_by_backoff = true;
                return prev;
            }
            changed = true;
            next
        });

        if changed || reconfigured {
            let reason = if !changed {
                AdjustmentReason::Reconfigured
            } else {
                reason
            };
            return Decision::Apply(ShapingTarget {
                rates: target,
                reason,
            });
        }

        debug!(
            link_id = %link.id,
            candidate = %candidate,
            applied = %previous.applied,
            "Shaping change within hysteresis band"
        );
        Decision::Hold {
            candidate,
            reason: if blocked_by_backoff {
                HoldReason::BackoffActive
            } else {
                HoldReason::WithinHysteresis
            },
        }
    }

    /// `previous × (1 − backoff_percent)`, bypassing hysteresis.
    ///
    /// `None` when nothing has been applied yet or the link already sits
    /// at its floor.
    pub fn emergency_backoff(
        &self,
        link: &WanLink,
        params: &ProfileParams,
        previous: Option<&ShapingState>,
    ) -> Option<ShapingTarget> {
        let previous = previous?;
        let reduced = RatePair::from_fn(|d| previous.applied.get(d) * (1.0 - params.backoff_percent));
        let rates = link.clamp(reduced);
        if rates == previous.applied {
            return None;
        }
        Some(ShapingTarget {
            rates,
            reason: AdjustmentReason::EmergencyBackoff,
        })
    }
}
