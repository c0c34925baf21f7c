//! WAN link definitions

use serde::{Deserialize, Serialize};

use super::ConnectionProfile;
use crate::actuator::{validate_host, validate_interface_name, validate_link_id};
use crate::error::{Result, SqmError};
use crate::models::{Direction, RatePair, WanLinkId};

fn default_enabled() -> bool {
    true
}

/// One upstream connection managed by the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WanLink {
    pub id: WanLinkId,
    /// Interface the shaper is attached to on the gateway
    pub interface: String,
    /// Host reachable over the remote command channel
    pub gateway_host: String,
    pub profile: ConnectionProfile,
    /// Provisioned (plan) rates; the shaper never exceeds these
    pub nominal_down_mbps: f64,
    pub nominal_up_mbps: f64,
    /// Lowest rates the shaper may ever apply
    pub floor_down_mbps: f64,
    pub floor_up_mbps: f64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

impl WanLink {
    pub fn nominal(&self) -> RatePair {
        RatePair::new(self.nominal_down_mbps, self.nominal_up_mbps)
    }

    pub fn floor(&self) -> RatePair {
        RatePair::new(self.floor_down_mbps, self.floor_up_mbps)
    }

    pub fn nominal_for(&self, direction: Direction) -> f64 {
        self.nominal().get(direction)
    }

    pub fn floor_for(&self, direction: Direction) -> f64 {
        self.floor().get(direction)
    }

    /// Clamp a rate pair into `[floor, nominal]`; non-finite or non-positive input maps to the floor
    pub fn clamp(&self, rates: RatePair) -> RatePair {
        RatePair::from_fn(|d| {
            let value = rates.get(d);
            let floor = self.floor_for(d);
            if !value.is_finite() || value <= 0.0 {
                floor
            } else {
                value.clamp(floor, self.nominal_for(d))
            }
        })
    }

    pub fn validate(&self) -> Result<()> {
        validate_link_id(self.id.as_str())?;
        validate_interface_name(&self.interface)?;
        validate_host(&self.gateway_host).map_err(|e| e.into_sqm(&self.gateway_host))?;

        for direction in Direction::ALL {
            let nominal = self.nominal_for(direction);
            let floor = self.floor_for(direction);
            if !(nominal.is_finite() && nominal > 0.0) {
                return Err(SqmError::invalid(
                    "nominal rate",
                    format!("{} {} Mbps must be positive", direction, nominal),
                ));
            }
            if !(floor.is_finite() && floor > 0.0 && floor <= nominal) {
                return Err(SqmError::invalid(
                    "floor rate",
                    format!(
                        "{} floor {} Mbps must be positive and not above nominal {} Mbps",
                        direction, floor, nominal
                    ),
                ));
            }
        }
        Ok(())
    }
}
