//! Connection-profile presets
//!
//! Profiles differ only in tuning data, so they are a closed enum plus a
//! parameter record rather than a behaviour hierarchy.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::error::{Result, SqmError};

/// Access technology of a WAN link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionProfile {
    Docsis,
    Fiber,
    Wireless,
    Starlink,
    Cellular,
}

impl ConnectionProfile {
    pub const ALL: [ConnectionProfile; 5] = [
        ConnectionProfile::Docsis,
        ConnectionProfile::Fiber,
        ConnectionProfile::Wireless,
        ConnectionProfile::Starlink,
        ConnectionProfile::Cellular,
    ];

    /// Built-in tuning for this profile
    pub fn defaults(self) -> ProfileParams {
        match self {
            // Upstream contention on cable needs the widest margin of the wired profiles
            ConnectionProfile::Docsis => ProfileParams {
                safety_margin_factor: 0.92,
                variance_threshold: 0.10,
                backoff_percent: 0.15,
                cooldown_minutes: 10,
                congestion_threshold_ms: 30.0,
            },
            ConnectionProfile::Fiber => ProfileParams {
                safety_margin_factor: 0.95,
                variance_threshold: 0.10,
                backoff_percent: 0.10,
                cooldown_minutes: 5,
                congestion_threshold_ms: 15.0,
            },
            ConnectionProfile::Wireless => ProfileParams {
                safety_margin_factor: 0.90,
                variance_threshold: 0.15,
                backoff_percent: 0.20,
                cooldown_minutes: 10,
                congestion_threshold_ms: 40.0,
            },
            ConnectionProfile::Starlink => ProfileParams {
                safety_margin_factor: 0.90,
                variance_threshold: 0.25,
                backoff_percent: 0.25,
                cooldown_minutes: 15,
                congestion_threshold_ms: 60.0,
            },
            ConnectionProfile::Cellular => ProfileParams {
                safety_margin_factor: 0.90,
                variance_threshold: 0.25,
                backoff_percent: 0.25,
                cooldown_minutes: 15,
                congestion_threshold_ms: 80.0,
            },
        }
    }
}

impl fmt::Display for ConnectionProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionProfile::Docsis => "docsis",
            ConnectionProfile::Fiber => "fiber",
            ConnectionProfile::Wireless => "wireless",
            ConnectionProfile::Starlink => "starlink",
            ConnectionProfile::Cellular => "cellular",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for ConnectionProfile {
    type Err = SqmError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "docsis" | "cable" => Ok(ConnectionProfile::Docsis),
            "fiber" | "fibre" | "ftth" => Ok(ConnectionProfile::Fiber),
            "wireless" | "fixed-wireless" => Ok(ConnectionProfile::Wireless),
            "starlink" => Ok(ConnectionProfile::Starlink),
            "cellular" | "lte" | "5g" => Ok(ConnectionProfile::Cellular),
            other => Err(SqmError::invalid(
                "connection profile",
                format!("unknown profile '{}'", other),
            )),
        }
    }
}

/// Tuning parameters attached to a connection profile
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProfileParams {
    /// Fraction of the effective rate actually provisioned (0.0-1.0]
    pub safety_margin_factor: f64,
    /// Coefficient of variation below which the baseline counts as stable
    pub variance_threshold: f64,
    /// Fraction removed from the applied rate on emergency backoff
    pub backoff_percent: f64,
    /// Minutes of normal latency required before leaving backoff
    pub cooldown_minutes: u32,
    /// Latency above the unloaded baseline that counts as congestion
    pub congestion_threshold_ms: f64,
}

impl ProfileParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.safety_margin_factor > 0.0 && self.safety_margin_factor <= 1.0) {
            return Err(SqmError::invalid(
                "safety_margin_factor",
                format!("{} is outside (0, 1]", self.safety_margin_factor),
            ));
        }
        if !(self.variance_threshold > 0.0 && self.variance_threshold.is_finite()) {
            return Err(SqmError::invalid(
                "variance_threshold",
                format!("{} must be positive", self.variance_threshold),
            ));
        }
        if !(self.backoff_percent > 0.0 && self.backoff_percent < 1.0) {
            return Err(SqmError::invalid(
                "backoff_percent",
                format!("{} is outside (0, 1)", self.backoff_percent),
            ));
        }
        if !(self.congestion_threshold_ms > 0.0 && self.congestion_threshold_ms.is_finite()) {
            return Err(SqmError::invalid(
                "congestion_threshold_ms",
                format!("{} must be positive", self.congestion_threshold_ms),
            ));
        }
        Ok(())
    }

    pub fn cooldown(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.cooldown_minutes as i64)
    }
}

/// Profile preset table, seeded from the built-in defaults
#[derive(Debug, Clone)]
pub struct ProfileTable {
    params: HashMap<ConnectionProfile, ProfileParams>,
}

impl Default for ProfileTable {
    fn default() -> Self {
        Self {
            params: ConnectionProfile::ALL
                .iter()
                .map(|p| (*p, p.defaults()))
                .collect(),
        }
    }
}

impl ProfileTable {
    pub fn get(&self, profile: ConnectionProfile) -> ProfileParams {
        self.params
            .get(&profile)
            .copied()
            .unwrap_or_else(|| profile.defaults())
    }

    /// Override the preset for one profile
    pub fn set(&mut self, profile: ConnectionProfile, params: ProfileParams) -> Result<()> {
        params.validate()?;
        self.params.insert(profile, params);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_are_valid() {
        for profile in ConnectionProfile::ALL {
            profile.defaults().validate().unwrap();
        }
    }

    #[test]
    fn test_docsis_margin_wider_than_fiber() {
        let docsis = ConnectionProfile::Docsis.defaults();
        let fiber = ConnectionProfile::Fiber.defaults();
        assert!(docsis.safety_margin_factor < fiber.safety_margin_factor);
        assert!((docsis.safety_margin_factor - 0.92).abs() < f64::EPSILON);
    }

    #[test]
    fn test_parse_aliases() {
        assert_eq!("Cable".parse::<ConnectionProfile>().unwrap(), ConnectionProfile::Docsis);
        assert_eq!("fibre".parse::<ConnectionProfile>().unwrap(), ConnectionProfile::Fiber);
        assert!("dialup".parse::<ConnectionProfile>().is_err());
    }

    #[test]
    fn test_override_rejects_bad_margin() {
        let mut table = ProfileTable::default();
        let mut params = ConnectionProfile::Starlink.defaults();
        params.safety_margin_factor = 1.2;
        assert!(table.set(ConnectionProfile::Starlink, params).is_err());

        params.safety_margin_factor = 0.8;
        table.set(ConnectionProfile::Starlink, params).unwrap();
        assert_eq!(table.get(ConnectionProfile::Starlink).safety_margin_factor, 0.8);
    }
}
