//! Raw measurement history with retention and hourly rollups
//!
//! Diagnostic only; baselines never read from here.

use chrono::{DateTime, Duration, DurationRound, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Mutex;
use tracing::debug;

use crate::baseline::OnlineStats;
use crate::models::{PingSample, SpeedSample, WanLinkId};
use crate::registry::lock;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    pub raw_retention_days: u32,
    pub rollup_retention_days: u32,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            raw_retention_days: 7,
            rollup_retention_days: 90,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollupMetric {
    DownloadMbps,
    UploadMbps,
    LatencyMs,
    JitterMs,
}

/// Aggregate of one metric over one clock hour
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyRollup {
    pub link_id: WanLinkId,
    pub hour_start: DateTime<Utc>,
    pub metric: RollupMetric,
    pub stats: OnlineStats,
}

type RollupKey = (WanLinkId, i64, RollupMetric);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HistorySnapshot {
    pub speed: Vec<SpeedSample>,
    pub ping: Vec<PingSample>,
    pub rollups: Vec<HourlyRollup>,
}

#[derive(Default)]
struct HistoryInner {
    speed: VecDeque<SpeedSample>,
    ping: VecDeque<PingSample>,
    rollups: BTreeMap<RollupKey, OnlineStats>,
}

impl HistoryInner {
    fn fold(&mut self, link_id: &WanLinkId, at: DateTime<Utc>, metric: RollupMetric, value: f64) {
        let hour = at
            .duration_trunc(Duration::hours(1))
            .unwrap_or(at)
            .timestamp();
        self.rollups
            .entry((link_id.clone(), hour, metric))
            .or_default()
            .push(value);
    }
}

#[derive(Default)]
pub struct SampleHistory {
    config: HistoryConfig,
    inner: Mutex<HistoryInner>,
}

impl SampleHistory {
    pub fn new(config: HistoryConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(HistoryInner::default()),
        }
    }

    pub fn record_speed(&self, sample: SpeedSample) {
        lock(&self.inner).speed.push_back(sample);
    }

    pub fn record_ping(&self, sample: PingSample) {
        lock(&self.inner).ping.push_back(sample);
    }

    /// Fold raw samples past raw retention into rollups and drop expired rollups
    pub fn prune(&self, now: DateTime<Utc>) {
        let raw_cutoff = now - Duration::days(self.config.raw_retention_days as i64);
        let rollup_cutoff = (now - Duration::days(self.config.rollup_retention_days as i64)).timestamp();

        let mut inner = lock(&self.inner);
        let mut folded = 0usize;

        while inner.speed.front().is_some_and(|s| s.timestamp < raw_cutoff) {
            let Some(sample) = inner.speed.pop_front() else {
                break;
            };
            inner.fold(&sample.link_id, sample.timestamp, RollupMetric::DownloadMbps, sample.download_mbps);
            inner.fold(&sample.link_id, sample.timestamp, RollupMetric::UploadMbps, sample.upload_mbps);
            folded += 1;
        }
        while inner.ping.front().is_some_and(|s| s.timestamp < raw_cutoff) {
            let Some(sample) = inner.ping.pop_front() else {
                break;
            };
            inner.fold(&sample.link_id, sample.timestamp, RollupMetric::LatencyMs, sample.latency_ms);
            inner.fold(&sample.link_id, sample.timestamp, RollupMetric::JitterMs, sample.jitter_ms);
            folded += 1;
        }

        let before = inner.rollups.len();
        inner.rollups.retain(|(_, hour, _), _| *hour >= rollup_cutoff);
        let expired = before - inner.rollups.len();

        if folded > 0 || expired > 0 {
            debug!(folded, expired, "Pruned sample history");
        }
    }

    /// Newest first
    pub fn speed_samples(&self, link_id: &WanLinkId, limit: usize) -> Vec<SpeedSample> {
        lock(&self.inner)
            .speed
            .iter()
            .rev()
            .filter(|s| &s.link_id == link_id)
            .take(limit)
            .cloned()
            .collect()
    }

    /// Newest first
    pub fn ping_samples(&self, link_id: &WanLinkId, limit: usize) -> Vec<PingSample> {
        lock(&self.inner)
            .ping
            .iter()
            .rev()
            .filter(|s| &s.link_id == link_id)
            .take(limit)
            .cloned()
            .collect()
    }

    pub fn rollups(&self, link_id: &WanLinkId) -> Vec<HourlyRollup> {
        lock(&self.inner)
            .rollups
            .iter()
            .filter(|((id, _, _), _)| id == link_id)
            .map(|((id, hour, metric), stats)| HourlyRollup {
                link_id: id.clone(),
                hour_start: Utc.timestamp_opt(*hour, 0).single().unwrap_or_default(),
                metric: *metric,
                stats: *stats,
            })
            .collect()
    }

    pub fn remove_link(&self, link_id: &WanLinkId) {
        let mut inner = lock(&self.inner);
        inner.speed.retain(|s| &s.link_id != link_id);
        inner.ping.retain(|s| &s.link_id != link_id);
        inner.rollups.retain(|(id, _, _), _| id != link_id);
    }

    pub fn snapshot(&self) -> HistorySnapshot {
        let inner = lock(&self.inner);
        HistorySnapshot {
            speed: inner.speed.iter().cloned().collect(),
            ping: inner.ping.iter().cloned().collect(),
            rollups: inner
                .rollups
                .iter()
                .map(|((id, hour, metric), stats)| HourlyRollup {
                    link_id: id.clone(),
                    hour_start: Utc.timestamp_opt(*hour, 0).single().unwrap_or_default(),
                    metric: *metric,
                    stats: *stats,
                })
                .collect(),
        }
    }

    /// Replace history with a persisted snapshot
    pub fn restore(&self, snapshot: HistorySnapshot) {
        let mut inner = lock(&self.inner);
        let mut speed: Vec<SpeedSample> = snapshot.speed;
        speed.sort_by_key(|s| s.timestamp);
        let mut ping: Vec<PingSample> = snapshot.ping;
        ping.sort_by_key(|s| s.timestamp);

        inner.speed = speed.into();
        inner.ping = ping.into();
        inner.rollups = snapshot
            .rollups
            .into_iter()
            .map(|r| ((r.link_id, r.hour_start.timestamp(), r.metric), r.stats))
            .collect();
    }
}
