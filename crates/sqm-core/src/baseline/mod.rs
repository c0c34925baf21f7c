//! Hour-of-week throughput baselines
//!
//! Every link owns 168 buckets (7 days x 24 hours) per direction. Buckets
//! are online aggregates updated one sample at a time and are never
//! recomputed from raw history.

mod stats;

pub use stats::OnlineStats;

use chrono::{DateTime, Datelike, FixedOffset, Offset, Timelike, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, SqmError};
use crate::models::{Direction, LinkMode, WanLinkId};

pub const HOURS_PER_WEEK: usize = 168;

/// Below this many samples a bucket falls back to coarser aggregates
pub const MIN_BUCKET_SAMPLES: u64 = 3;

/// Coefficient of variation assumed for a single-sample aggregate
pub const SINGLE_SAMPLE_CV: f64 = 0.15;

/// Position within the week, day 0 = Monday
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HourSlot {
    pub day_of_week: u8,
    pub hour_of_day: u8,
}

impl HourSlot {
    pub fn new(day_of_week: u8, hour_of_day: u8) -> Result<Self> {
        if day_of_week > 6 || hour_of_day > 23 {
            return Err(SqmError::invalid(
                "hour slot",
                format!("day {} hour {} out of range", day_of_week, hour_of_day),
            ));
        }
        Ok(Self {
            day_of_week,
            hour_of_day,
        })
    }

    pub fn from_index(index: usize) -> Self {
        let index = index % HOURS_PER_WEEK;
        Self {
            day_of_week: (index / 24) as u8,
            hour_of_day: (index % 24) as u8,
        }
    }

    pub fn index(&self) -> usize {
        self.day_of_week as usize * 24 + self.hour_of_day as usize
    }
}

/// One hour-of-week aggregate
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BaselineBucket {
    pub stats: OnlineStats,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Read-only view of a bucket for status reporting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyBaseline {
    pub link_id: WanLinkId,
    pub day_of_week: u8,
    pub hour_of_day: u8,
    pub direction: Direction,
    pub mean: f64,
    pub std_dev: Option<f64>,
    pub min: f64,
    pub max: f64,
    pub sample_count: u64,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Which aggregate a baseline estimate came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaselineSource {
    /// The exact hour-of-week bucket
    Bucket,
    /// Same hour of day across all seven days
    HourOfDay,
    /// Every bucket of the link
    Global,
}

/// Baseline used for blending, with its confidence signal
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BaselineEstimate {
    pub mean: f64,
    pub std_dev: f64,
    pub sample_count: u64,
    pub source: BaselineSource,
}

impl BaselineEstimate {
    fn from_stats(stats: &OnlineStats, source: BaselineSource) -> Self {
        let std_dev = stats
            .std_dev()
            .unwrap_or(stats.mean.abs() * SINGLE_SAMPLE_CV);
        Self {
            mean: stats.mean,
            std_dev,
            sample_count: stats.count,
            source,
        }
    }

    /// Coefficient of variation; infinite when the mean is not positive
    pub fn cv(&self) -> f64 {
        if self.mean > 0.0 {
            self.std_dev / self.mean
        } else {
            f64::INFINITY
        }
    }
}

#[derive(Debug, Clone)]
struct LinkBaselines {
    first_sample_at: Option<DateTime<Utc>>,
    download: Vec<BaselineBucket>,
    upload: Vec<BaselineBucket>,
}

impl LinkBaselines {
    fn new() -> Self {
        Self {
            first_sample_at: None,
            download: vec![BaselineBucket::default(); HOURS_PER_WEEK],
            upload: vec![BaselineBucket::default(); HOURS_PER_WEEK],
        }
    }

    fn buckets(&self, direction: Direction) -> &[BaselineBucket] {
        match direction {
            Direction::Download => &self.download,
            Direction::Upload => &self.upload,
        }
    }

    fn filled(&self, index: usize) -> bool {
        self.download[index].stats.count > 0 && self.upload[index].stats.count > 0
    }

    fn filled_count(&self) -> usize {
        (0..HOURS_PER_WEEK).filter(|i| self.filled(*i)).count()
    }
}

/// Persistable copy of one link's buckets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkBaselineSnapshot {
    pub link_id: WanLinkId,
    pub first_sample_at: Option<DateTime<Utc>>,
    pub download: Vec<BaselineBucket>,
    pub upload: Vec<BaselineBucket>,
}

/// Per-link, per-direction hour-of-week statistics
pub struct BaselineStore {
    links: DashMap<WanLinkId, LinkBaselines>,
    utc_offset: FixedOffset,
}

impl Default for BaselineStore {
    fn default() -> Self {
        Self::new(Utc.fix())
    }
}

impl BaselineStore {
    /// Buckets are keyed by the gateway's local time at `utc_offset`
    pub fn new(utc_offset: FixedOffset) -> Self {
        Self {
            links: DashMap::new(),
            utc_offset,
        }
    }

    pub fn utc_offset(&self) -> FixedOffset {
        self.utc_offset
    }

    /// Map a timestamp onto its hour-of-week slot
    pub fn slot(&self, timestamp: DateTime<Utc>) -> HourSlot {
        let local = timestamp.with_timezone(&self.utc_offset);
        HourSlot {
            day_of_week: local.weekday().num_days_from_monday() as u8,
            hour_of_day: local.hour() as u8,
        }
    }

    /// Fold one speed-test result into the bucket for `timestamp`
    pub fn record_sample(
        &self,
        link_id: &WanLinkId,
        timestamp: DateTime<Utc>,
        down_mbps: f64,
        up_mbps: f64,
    ) -> Result<()> {
        for (name, value) in [("download", down_mbps), ("upload", up_mbps)] {
            if !value.is_finite() || value <= 0.0 {
                return Err(SqmError::invalid(
                    "sample",
                    format!("{} rate {} is not a positive number", name, value),
                ));
            }
        }

        let slot = self.slot(timestamp);
        let index = slot.index();
        let mut entry = self
            .links
            .entry(link_id.clone())
            .or_insert_with(LinkBaselines::new);
        let baselines = &mut *entry;

        let was_filled = baselines.filled(index);
        baselines.first_sample_at.get_or_insert(timestamp);
        for (bucket, value) in [
            (&mut baselines.download[index], down_mbps),
            (&mut baselines.upload[index], up_mbps),
        ] {
            bucket.stats.push(value);
            bucket.last_updated = Some(timestamp);
        }

        debug!(
            link_id = %link_id,
            day = slot.day_of_week,
            hour = slot.hour_of_day,
            count = baselines.download[index].stats.count,
            "Recorded baseline sample"
        );

        if !was_filled && baselines.filled_count() == HOURS_PER_WEEK {
            info!(link_id = %link_id, "Baseline complete, link leaving learning mode");
        }
        Ok(())
    }

    /// Baseline for `timestamp`, falling back from the bucket to the hour
    /// of day and then to the link-wide aggregate when samples are sparse
    pub fn get_baseline(
        &self,
        link_id: &WanLinkId,
        timestamp: DateTime<Utc>,
        direction: Direction,
    ) -> Option<BaselineEstimate> {
        let entry = self.links.get(link_id)?;
        let buckets = entry.buckets(direction);
        let slot = self.slot(timestamp);

        let exact = &buckets[slot.index()].stats;
        if exact.count >= MIN_BUCKET_SAMPLES {
            return Some(BaselineEstimate::from_stats(exact, BaselineSource::Bucket));
        }

        let mut same_hour = OnlineStats::new();
        for day in 0..7 {
            same_hour.merge(&buckets[day * 24 + slot.hour_of_day as usize].stats);
        }
        if same_hour.count >= MIN_BUCKET_SAMPLES {
            return Some(BaselineEstimate::from_stats(
                &same_hour,
                BaselineSource::HourOfDay,
            ));
        }

        let mut global = OnlineStats::new();
        for bucket in buckets {
            global.merge(&bucket.stats);
        }
        if global.is_empty() {
            return None;
        }
        Some(BaselineEstimate::from_stats(&global, BaselineSource::Global))
    }

    pub fn bucket(
        &self,
        link_id: &WanLinkId,
        slot: HourSlot,
        direction: Direction,
    ) -> Option<HourlyBaseline> {
        let entry = self.links.get(link_id)?;
        let bucket = entry.buckets(direction)[slot.index()];
        Some(Self::view(link_id, slot, direction, &bucket))
    }

    /// All buckets holding at least one sample, in hour-of-week order
    pub fn buckets(&self, link_id: &WanLinkId, direction: Direction) -> Vec<HourlyBaseline> {
        let Some(entry) = self.links.get(link_id) else {
            return Vec::new();
        };
        entry
            .buckets(direction)
            .iter()
            .enumerate()
            .filter(|(_, b)| b.stats.count > 0)
            .map(|(i, b)| Self::view(link_id, HourSlot::from_index(i), direction, b))
            .collect()
    }

    fn view(
        link_id: &WanLinkId,
        slot: HourSlot,
        direction: Direction,
        bucket: &BaselineBucket,
    ) -> HourlyBaseline {
        HourlyBaseline {
            link_id: link_id.clone(),
            day_of_week: slot.day_of_week,
            hour_of_day: slot.hour_of_day,
            direction,
            mean: bucket.stats.mean,
            std_dev: bucket.stats.std_dev(),
            min: bucket.stats.min,
            max: bucket.stats.max,
            sample_count: bucket.stats.count,
            last_updated: bucket.last_updated,
        }
    }

    /// Fraction of the 168 slots holding at least one sample
    pub fn learning_progress(&self, link_id: &WanLinkId) -> f64 {
        self.links
            .get(link_id)
            .map(|e| e.filled_count() as f64 / HOURS_PER_WEEK as f64)
            .unwrap_or(0.0)
    }

    pub fn mode(&self, link_id: &WanLinkId) -> LinkMode {
        let complete = self
            .links
            .get(link_id)
            .map(|e| e.filled_count() == HOURS_PER_WEEK)
            .unwrap_or(false);
        if complete {
            LinkMode::Active
        } else {
            LinkMode::Learning
        }
    }

    pub fn is_slot_filled(&self, link_id: &WanLinkId, slot: HourSlot) -> bool {
        self.links
            .get(link_id)
            .map(|e| e.filled(slot.index()))
            .unwrap_or(false)
    }

    pub fn first_sample_at(&self, link_id: &WanLinkId) -> Option<DateTime<Utc>> {
        self.links.get(link_id).and_then(|e| e.first_sample_at)
    }

    pub fn remove_link(&self, link_id: &WanLinkId) -> bool {
        self.links.remove(link_id).is_some()
    }

    pub fn snapshot(&self) -> Vec<LinkBaselineSnapshot> {
        let mut snapshots: Vec<LinkBaselineSnapshot> = self
            .links
            .iter()
            .map(|entry| LinkBaselineSnapshot {
                link_id: entry.key().clone(),
                first_sample_at: entry.first_sample_at,
                download: entry.download.clone(),
                upload: entry.upload.clone(),
            })
            .collect();
        snapshots.sort_by(|a, b| a.link_id.cmp(&b.link_id));
        snapshots
    }

    /// Load persisted buckets; a bucket already holding more samples in
    /// memory is kept so counts never go backwards
    pub fn restore(&self, snapshots: Vec<LinkBaselineSnapshot>) -> Result<()> {
        for snapshot in snapshots {
            if snapshot.download.len() != HOURS_PER_WEEK || snapshot.upload.len() != HOURS_PER_WEEK {
                return Err(SqmError::Persistence(format!(
                    "baseline for {} has {}/{} buckets, expected {}",
                    snapshot.link_id,
                    snapshot.download.len(),
                    snapshot.upload.len(),
                    HOURS_PER_WEEK
                )));
            }

            let mut entry = self
                .links
                .entry(snapshot.link_id.clone())
                .or_insert_with(LinkBaselines::new);
            let entry = &mut *entry;

            entry.first_sample_at = match (entry.first_sample_at, snapshot.first_sample_at) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            for (current, restored) in entry.download.iter_mut().zip(&snapshot.download) {
                if restored.stats.count > current.stats.count {
                    *current = *restored;
                }
            }
            for (current, restored) in entry.upload.iter_mut().zip(&snapshot.upload) {
                if restored.stats.count > current.stats.count {
                    *current = *restored;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{at, monday_at, t0};
    use chrono::Duration;

    fn store_with(samples: &[(DateTime<Utc>, f64, f64)]) -> BaselineStore {
        let store = BaselineStore::default();
        for (ts, down, up) in samples {
            store.record_sample(&"wan1".into(), *ts, *down, *up).unwrap();
        }
        store
    }

    #[test]
    fn test_slot_mapping_monday_is_zero() {
        let store = BaselineStore::default();
        let slot = store.slot(monday_at(18));
        assert_eq!(slot, HourSlot::new(0, 18).unwrap());
        assert_eq!(slot.index(), 18);

        let sunday_late = at(6, 23);
        assert_eq!(store.slot(sunday_late).index(), 167);
    }

    #[test]
    fn test_utc_offset_shifts_bucket() {
        let store = BaselineStore::new(FixedOffset::east_opt(2 * 3600).unwrap());
        // 23:00 UTC Monday is 01:00 Tuesday at UTC+2
        let slot = store.slot(monday_at(23));
        assert_eq!(slot, HourSlot::new(1, 1).unwrap());
    }

    #[test]
    fn test_bucket_stats_track_samples() {
        let ts = monday_at(18);
        let store = store_with(&[(ts, 240.0, 20.0), (ts, 250.0, 21.0), (ts, 260.0, 22.0)]);

        let estimate = store
            .get_baseline(&"wan1".into(), ts, Direction::Download)
            .unwrap();
        assert_eq!(estimate.source, BaselineSource::Bucket);
        assert!((estimate.mean - 250.0).abs() < 1e-9);
        assert!((estimate.std_dev - 10.0).abs() < 1e-9);
        assert_eq!(estimate.sample_count, 3);

        let view = store
            .bucket(&"wan1".into(), HourSlot::new(0, 18).unwrap(), Direction::Upload)
            .unwrap();
        assert_eq!(view.min, 20.0);
        assert_eq!(view.max, 22.0);
        assert_eq!(view.last_updated, Some(ts));
    }

    #[test]
    fn test_sparse_bucket_falls_back_to_hour_of_day() {
        // one sample on Monday 18:00 and two on Tuesday 18:00
        let store = store_with(&[
            (monday_at(18), 100.0, 10.0),
            (at(1, 18), 110.0, 10.0),
            (at(1, 18), 120.0, 10.0),
        ]);

        let estimate = store
            .get_baseline(&"wan1".into(), monday_at(18), Direction::Download)
            .unwrap();
        assert_eq!(estimate.source, BaselineSource::HourOfDay);
        assert!((estimate.mean - 110.0).abs() < 1e-9);
        assert_eq!(estimate.sample_count, 3);
    }

    #[test]
    fn test_falls_back_to_global_then_none() {
        let store = store_with(&[(at(2, 3), 80.0, 8.0)]);

        let estimate = store
            .get_baseline(&"wan1".into(), monday_at(18), Direction::Download)
            .unwrap();
        assert_eq!(estimate.source, BaselineSource::Global);
        assert_eq!(estimate.mean, 80.0);
        // single sample uses the moderate default spread rather than zero
        assert!((estimate.std_dev - 12.0).abs() < 1e-9);
        assert!((estimate.cv() - SINGLE_SAMPLE_CV).abs() < 1e-12);

        assert!(store
            .get_baseline(&"other".into(), monday_at(18), Direction::Download)
            .is_none());
    }

    #[test]
    fn test_rejects_invalid_samples() {
        let store = BaselineStore::default();
        let id: WanLinkId = "wan1".into();
        assert!(store.record_sample(&id, t0(), f64::NAN, 10.0).is_err());
        assert!(store.record_sample(&id, t0(), 100.0, 0.0).is_err());
        assert!(store.get_baseline(&id, t0(), Direction::Download).is_none());
    }

    #[test]
    fn test_learning_progress_and_mode() {
        let store = BaselineStore::default();
        let id: WanLinkId = "wan1".into();
        assert_eq!(store.mode(&id), LinkMode::Learning);

        for hour in 0..HOURS_PER_WEEK as i64 {
            store
                .record_sample(&id, t0() + Duration::hours(hour), 100.0, 10.0)
                .unwrap();
            if hour == 83 {
                assert!((store.learning_progress(&id) - 0.5).abs() < 1e-12);
                assert_eq!(store.mode(&id), LinkMode::Learning);
            }
        }
        assert_eq!(store.learning_progress(&id), 1.0);
        assert_eq!(store.mode(&id), LinkMode::Active);
    }

    #[test]
    fn test_sample_counts_never_decrease_on_restore() {
        let ts = monday_at(18);
        let store = store_with(&[(ts, 100.0, 10.0)]);
        let old = store.snapshot();

        store.record_sample(&"wan1".into(), ts, 110.0, 11.0).unwrap();
        store.restore(old).unwrap();

        let view = store
            .bucket(&"wan1".into(), store.slot(ts), Direction::Download)
            .unwrap();
        assert_eq!(view.sample_count, 2);
    }

    #[test]
    fn test_restore_into_empty_store() {
        let ts = monday_at(18);
        let source = store_with(&[(ts, 100.0, 10.0), (ts, 104.0, 12.0)]);
        let target = BaselineStore::default();
        target.restore(source.snapshot()).unwrap();

        assert_eq!(target.first_sample_at(&"wan1".into()), Some(ts));
        assert_eq!(target.buckets(&"wan1".into(), Direction::Upload).len(), 1);
    }

    #[test]
    fn test_restore_rejects_truncated_snapshot() {
        let store = BaselineStore::default();
        let snapshot = LinkBaselineSnapshot {
            link_id: "wan1".into(),
            first_sample_at: None,
            download: vec![BaselineBucket::default(); 3],
            upload: vec![BaselineBucket::default(); HOURS_PER_WEEK],
        };
        assert!(matches!(
            store.restore(vec![snapshot]),
            Err(SqmError::Persistence(_))
        ));
    }
}
