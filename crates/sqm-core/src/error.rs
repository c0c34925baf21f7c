//! Error taxonomy for the shaping pipeline

use std::time::Duration;
use thiserror::Error;

use crate::models::{Direction, WanLinkId};

/// Errors produced by the adaptive SQM pipeline
#[derive(Debug, Error)]
pub enum SqmError {
    /// A speed test or ping timed out or returned unusable data
    #[error("measurement unavailable for {link_id}: {reason}")]
    MeasurementUnavailable { link_id: WanLinkId, reason: String },

    /// The remote command channel could not reach the gateway
    #[error("gateway {host} unreachable: {reason}")]
    RemoteUnreachable { host: String, reason: String },

    /// The gateway ran the command but reported a failure
    #[error("gateway {host} rejected deployment (exit code {exit_code}): {stderr}")]
    DeploymentRejected {
        host: String,
        exit_code: i32,
        stderr: String,
    },

    /// Measurements keep deviating from the learned baseline
    #[error("possible ISP change on {link_id} ({direction}): z-score {z_score:.1} for {cycles} cycles")]
    BaselineDrift {
        link_id: WanLinkId,
        direction: Direction,
        z_score: f64,
        cycles: u32,
    },

    /// Neither a baseline nor a successful measurement exists yet
    #[error("no baseline or measurement available for {0}; refusing to deploy")]
    NoRateEvidence(WanLinkId),

    #[error("invalid {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("unknown WAN link {0}")]
    UnknownLink(WanLinkId),

    #[error("WAN link {0} already exists")]
    DuplicateLink(WanLinkId),

    /// The link is configured but disabled, so it is neither measured nor shaped
    #[error("WAN link {0} is disabled")]
    LinkDisabled(WanLinkId),

    #[error("persistence error: {0}")]
    Persistence(String),
}

impl SqmError {
    pub(crate) fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        SqmError::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }

    /// Transient failures are retried on the next cycle instead of alerting immediately
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SqmError::MeasurementUnavailable { .. } | SqmError::RemoteUnreachable { .. }
        )
    }

    /// Short machine-readable label, used for metrics and log fields
    pub fn kind(&self) -> &'static str {
        match self {
            SqmError::MeasurementUnavailable { .. } => "measurement_unavailable",
            SqmError::RemoteUnreachable { .. } => "remote_unreachable",
            SqmError::DeploymentRejected { .. } => "deployment_rejected",
            SqmError::BaselineDrift { .. } => "baseline_drift",
            SqmError::NoRateEvidence(_) => "no_rate_evidence",
            SqmError::InvalidParameter { .. } => "invalid_parameter",
            SqmError::UnknownLink(_) => "unknown_link",
            SqmError::DuplicateLink(_) => "duplicate_link",
            SqmError::LinkDisabled(_) => "link_disabled",
            SqmError::Persistence(_) => "persistence",
        }
    }
}

pub type Result<T> = std::result::Result<T, SqmError>;

/// Transport-level failures of the remote command channel
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("host unreachable: {0}")]
    Unreachable(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("failed to run transport: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid remote target: {0}")]
    InvalidTarget(String),
}

impl RemoteError {
    /// Map a transport failure onto the pipeline taxonomy
    pub fn into_sqm(self, host: &str) -> SqmError {
        match self {
            RemoteError::InvalidTarget(reason) => SqmError::InvalidParameter {
                name: "remote target",
                reason,
            },
            other => SqmError::RemoteUnreachable {
                host: host.to_string(),
                reason: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let unreachable = SqmError::RemoteUnreachable {
            host: "gw".to_string(),
            reason: "connection refused".to_string(),
        };
        assert!(unreachable.is_transient());

        let rejected = SqmError::DeploymentRejected {
            host: "gw".to_string(),
            exit_code: 2,
            stderr: "RTNETLINK answers: Invalid argument".to_string(),
        };
        assert!(!rejected.is_transient());
        assert_eq!(rejected.kind(), "deployment_rejected");
    }

    #[test]
    fn test_remote_error_mapping() {
        let err = RemoteError::Timeout(Duration::from_secs(20)).into_sqm("10.0.0.1");
        assert!(matches!(err, SqmError::RemoteUnreachable { ref host, .. } if host == "10.0.0.1"));

        let err = RemoteError::InvalidTarget("-oProxyCommand".to_string()).into_sqm("x");
        assert!(matches!(err, SqmError::InvalidParameter { .. }));
    }
}
