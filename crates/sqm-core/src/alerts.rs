//! User-visible alerts
//!
//! Handles:
//! - Deduplication of alerts per link and kind within a window
//! - A bounded in-memory alert log for the status API
//! - Counting consecutive failed cycles so that only persistent
//!   failures become alerts

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::warn;

use crate::clock::{Clock, SystemClock};
use crate::models::WanLinkId;

/// Default deduplication window (15 minutes)
const DEFAULT_DEDUP_WINDOW_SECS: i64 = 15 * 60;

const DEFAULT_MAX_ALERTS: usize = 500;

/// Failed cycles in a row before a failure is surfaced
pub const PERSISTENT_FAILURE_CYCLES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertSeverity::Info => write!(f, "info"),
            AlertSeverity::Warning => write!(f, "warning"),
            AlertSeverity::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// Deployment retries exhausted without reaching the gateway
    RemoteUnreachable,
    DeploymentRejected,
    /// Measurement or deployment failed for several cycles in a row
    PersistentFailure,
    /// Possible ISP change
    BaselineDrift,
    MeasurementUnavailable,
}

impl AlertKind {
    pub fn default_severity(self) -> AlertSeverity {
        match self {
            AlertKind::BaselineDrift => AlertSeverity::Info,
            AlertKind::RemoteUnreachable | AlertKind::MeasurementUnavailable => AlertSeverity::Warning,
            AlertKind::DeploymentRejected | AlertKind::PersistentFailure => AlertSeverity::Critical,
        }
    }
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AlertKind::RemoteUnreachable => write!(f, "RemoteUnreachable"),
            AlertKind::DeploymentRejected => write!(f, "DeploymentRejected"),
            AlertKind::PersistentFailure => write!(f, "PersistentFailure"),
            AlertKind::BaselineDrift => write!(f, "BaselineDrift"),
            AlertKind::MeasurementUnavailable => write!(f, "MeasurementUnavailable"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: u64,
    pub link_id: WanLinkId,
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

/// Which part of a cycle failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Measurement,
    Ping,
    Deployment,
}

/// Consecutive failed cycles per failure kind for one link
#[derive(Debug, Clone, Default)]
pub struct FailureStreaks {
    measurement: u32,
    ping: u32,
    deployment: u32,
}

impl FailureStreaks {
    fn slot(&mut self, kind: FailureKind) -> &mut u32 {
        match kind {
            FailureKind::Measurement => &mut self.measurement,
            FailureKind::Ping => &mut self.ping,
            FailureKind::Deployment => &mut self.deployment,
        }
    }

    /// Count one more failed cycle and return the streak length
    pub fn record_failure(&mut self, kind: FailureKind) -> u32 {
        let slot = self.slot(kind);
        *slot += 1;
        *slot
    }

    pub fn record_success(&mut self, kind: FailureKind) {
        *self.slot(kind) = 0;
    }

    pub fn get(&self, kind: FailureKind) -> u32 {
        match kind {
            FailureKind::Measurement => self.measurement,
            FailureKind::Ping => self.ping,
            FailureKind::Deployment => self.deployment,
        }
    }
}

/// Key for deduplication
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DedupKey {
    link_id: WanLinkId,
    kind: AlertKind,
}

/// Alert log with deduplication
pub struct Alerter {
    dedup_window: Duration,
    max_alerts: usize,
    /// Key -> last emission time
    recent: RwLock<HashMap<DedupKey, DateTime<Utc>>>,
    log: RwLock<VecDeque<Alert>>,
    next_id: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl Default for Alerter {
    fn default() -> Self {
        Self::new(Arc::new(SystemClock))
    }
}

impl Alerter {
    /// Create a new alerter with the default 15-minute deduplication window
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            dedup_window: Duration::seconds(DEFAULT_DEDUP_WINDOW_SECS),
            max_alerts: DEFAULT_MAX_ALERTS,
            recent: RwLock::new(HashMap::new()),
            log: RwLock::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
            clock,
        }
    }

    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }

    pub fn with_max_alerts(mut self, max_alerts: usize) -> Self {
        self.max_alerts = max_alerts.max(1);
        self
    }

    /// Raise an alert unless the same link/kind fired within the window.
    /// Returns the alert when it was recorded.
    pub fn raise(&self, link_id: &WanLinkId, kind: AlertKind, message: impl Into<String>) -> Option<Alert> {
        let now = self.clock.now();
        let key = DedupKey {
            link_id: link_id.clone(),
            kind,
        };

        {
            let mut recent = self.recent.write().unwrap_or_else(|e| e.into_inner());
            if let Some(last) = recent.get(&key) {
                if now - *last < self.dedup_window {
                    return None;
                }
            }
            recent.insert(key, now);
        }

        let alert = Alert {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            link_id: link_id.clone(),
            kind,
            severity: kind.default_severity(),
            message: message.into(),
            raised_at: now,
        };
        warn!(
            link_id = %alert.link_id,
            kind = %alert.kind,
            severity = %alert.severity,
            message = %alert.message,
            "Alert raised"
        );

        let mut log = self.log.write().unwrap_or_else(|e| e.into_inner());
        log.push_back(alert.clone());
        while log.len() > self.max_alerts {
            log.pop_front();
        }
        Some(alert)
    }

    /// Most recent first
    pub fn recent(&self, limit: usize) -> Vec<Alert> {
        self.log
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn for_link(&self, link_id: &WanLinkId) -> Vec<Alert> {
        self.log
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .rev()
            .filter(|a| &a.link_id == link_id)
            .cloned()
            .collect()
    }

    /// Forget everything about a removed link
    pub fn remove_link(&self, link_id: &WanLinkId) {
        self.recent
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|k, _| &k.link_id != link_id);
        self.log
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|a| &a.link_id != link_id);
    }

    pub fn len(&self) -> usize {
        self.log.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
