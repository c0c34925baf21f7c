//! Speed-test scheduling and admission
//!
//! Sampling is dense while a link is learning its hour-of-week baseline
//! and sparse afterwards. Manual and scheduled tests share a per-link gate
//! so a "test now" request merges with a recent or running sample instead
//! of duplicating it.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::baseline::BaselineStore;
use crate::error::{Result, SqmError};
use crate::measurement::SpeedTestProvider;
use crate::models::{LinkMode, SpeedMeasurement, WanLinkId};
use crate::registry::{lock, LinkRuntime, WanLink};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    pub dense_interval_secs: u64,
    pub sparse_interval_secs: u64,
    pub learning_phase_days: u32,
    /// Window in which a new request merges with the previous sample
    pub debounce_secs: u64,
    pub measurement_timeout_secs: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            dense_interval_secs: 2 * 3600,
            sparse_interval_secs: 12 * 3600,
            learning_phase_days: 7,
            debounce_secs: 600,
            measurement_timeout_secs: 120,
        }
    }
}

impl SamplerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.dense_interval_secs == 0 || self.sparse_interval_secs == 0 {
            return Err(SqmError::invalid("sampler interval", "must be non-zero"));
        }
        if self.measurement_timeout_secs == 0 {
            return Err(SqmError::invalid("measurement timeout", "must be non-zero"));
        }
        Ok(())
    }

    fn dense_interval(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.dense_interval_secs as i64)
    }

    fn sparse_interval(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.sparse_interval_secs as i64)
    }

    fn debounce(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.debounce_secs as i64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Admission {
    /// Caller owns the sample and must release the gate when done
    Started,
    /// A sample is running or just ran; no new test is started
    Merged,
}

/// Per-link record of the in-flight and most recent speed test
#[derive(Debug, Clone, Default)]
pub struct SampleGate {
    in_flight: bool,
    last_started: Option<DateTime<Utc>>,
}

impl SampleGate {
    pub fn admit(&mut self, now: DateTime<Utc>, debounce: ChronoDuration) -> Admission {
        if self.in_flight {
            return Admission::Merged;
        }
        if let Some(last) = self.last_started {
            if now >= last && now - last < debounce {
                return Admission::Merged;
            }
        }
        self.in_flight = true;
        self.last_started = Some(now);
        Admission::Started
    }

    pub fn finish(&mut self) {
        self.in_flight = false;
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn last_started(&self) -> Option<DateTime<Utc>> {
        self.last_started
    }
}

/// Releases the link's sample gate when dropped
pub struct SamplePermit {
    runtime: Arc<LinkRuntime>,
}

impl Drop for SamplePermit {
    fn drop(&mut self) {
        lock(&self.runtime.gate).finish();
    }
}

#[derive(Debug, Clone, Default)]
pub struct Sampler {
    config: SamplerConfig,
}

impl Sampler {
    pub fn new(config: SamplerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    /// Claim the link's sample slot, or learn that the request merged
    pub fn admit(&self, runtime: &Arc<LinkRuntime>, now: DateTime<Utc>) -> Option<SamplePermit> {
        let admission = lock(&runtime.gate).admit(now, self.config.debounce());
        match admission {
            Admission::Started => Some(SamplePermit {
                runtime: runtime.clone(),
            }),
            Admission::Merged => {
                debug!(link_id = %runtime.id(), "Speed test merged with recent sample");
                None
            }
        }
    }

    /// Run a speed test bounded by the measurement timeout.
    ///
    /// Results with a zero, negative or non-finite rate count as
    /// unavailable; they never reach the baseline.
    pub async fn measure(&self, provider: &dyn SpeedTestProvider, link: &WanLink) -> Result<SpeedMeasurement> {
        let timeout = Duration::from_secs(self.config.measurement_timeout_secs);
        let measurement = tokio::time::timeout(timeout, provider.run_speed_test(link))
            .await
            .map_err(|_| SqmError::MeasurementUnavailable {
                link_id: link.id.clone(),
                reason: format!("speed test timed out after {:?}", timeout),
            })??;

        for (direction, rate) in [
            ("download", measurement.download_mbps),
            ("upload", measurement.upload_mbps),
        ] {
            if !rate.is_finite() || rate <= 0.0 {
                return Err(SqmError::MeasurementUnavailable {
                    link_id: link.id.clone(),
                    reason: format!("speed test reported unusable {} rate {}", direction, rate),
                });
            }
        }
        Ok(measurement)
    }

    /// Feed a successful measurement into the baseline
    pub fn record(
        &self,
        store: &BaselineStore,
        link_id: &WanLinkId,
        timestamp: DateTime<Utc>,
        measurement: &SpeedMeasurement,
    ) -> Result<()> {
        store.record_sample(link_id, timestamp, measurement.download_mbps, measurement.upload_mbps)
    }

    /// Whether `at` still falls in the dense learning cadence
    pub fn is_dense(
        &self,
        store: &BaselineStore,
        link_id: &WanLinkId,
        registered_at: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> bool {
        if store.mode(link_id) == LinkMode::Learning {
            return true;
        }
        let phase_start = store.first_sample_at(link_id).unwrap_or(registered_at);
        at - phase_start < ChronoDuration::days(self.config.learning_phase_days as i64)
    }

    /// Next scheduled sample after one taken at `last`.
    ///
    /// In the dense cadence a slot landing on an already-filled bucket is
    /// pushed one hour forward when that hour is still empty, so an even
    /// interval eventually covers every hour of the week.
    pub fn next_sample_at(
        &self,
        store: &BaselineStore,
        link_id: &WanLinkId,
        registered_at: DateTime<Utc>,
        last: DateTime<Utc>,
    ) -> DateTime<Utc> {
        if !self.is_dense(store, link_id, registered_at, last) {
            return last + self.config.sparse_interval();
        }

        let next = last + self.config.dense_interval();
        let nudged = next + ChronoDuration::hours(1);
        if store.is_slot_filled(link_id, store.slot(next))
            && !store.is_slot_filled(link_id, store.slot(nudged))
        {
            return nudged;
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::WanLinkRegistry;
    use crate::testing::{docsis_link, t0, MockSpeedTest};

    fn minutes(m: i64) -> ChronoDuration {
        ChronoDuration::minutes(m)
    }

    #[test]
    fn test_gate_merges_within_debounce() {
        let mut gate = SampleGate::default();
        assert_eq!(gate.admit(t0(), minutes(10)), Admission::Started);
        assert_eq!(gate.admit(t0() + minutes(1), minutes(10)), Admission::Merged);

        gate.finish();
        assert_eq!(gate.admit(t0() + minutes(5), minutes(10)), Admission::Merged);
        assert_eq!(gate.admit(t0() + minutes(10), minutes(10)), Admission::Started);
        assert!(gate.in_flight());
    }

    #[test]
    fn test_permit_releases_gate_on_drop() {
        let registry = WanLinkRegistry::new();
        let runtime = registry.add(docsis_link("wan1"), t0()).unwrap();
        let sampler = Sampler::new(SamplerConfig {
            debounce_secs: 0,
            ..Default::default()
        });

        let permit = sampler.admit(&runtime, t0()).unwrap();
        assert!(sampler.admit(&runtime, t0()).is_none());
        drop(permit);
        assert!(sampler.admit(&runtime, t0() + minutes(1)).is_some());
    }

    #[test]
    fn test_dense_cadence_nudges_to_empty_hour() {
        let store = BaselineStore::default();
        let sampler = Sampler::default();
        let id: WanLinkId = "wan1".into();

        // first sample at 00:00, slot 02:00 empty: plain 2h cadence
        store.record_sample(&id, t0(), 100.0, 10.0).unwrap();
        assert_eq!(sampler.next_sample_at(&store, &id, t0(), t0()), t0() + ChronoDuration::hours(2));

        // once 02:00 is filled and 03:00 is not, the slot moves to 03:00
        store
            .record_sample(&id, t0() + ChronoDuration::hours(2), 100.0, 10.0)
            .unwrap();
        assert_eq!(
            sampler.next_sample_at(&store, &id, t0(), t0()),
            t0() + ChronoDuration::hours(3)
        );
    }

    #[test]
    fn test_sparse_after_learning() {
        let store = BaselineStore::default();
        let sampler = Sampler::default();
        let id: WanLinkId = "wan1".into();
        for hour in 0..168 {
            store
                .record_sample(&id, t0() + ChronoDuration::hours(hour), 100.0, 10.0)
                .unwrap();
        }

        let inside_phase = t0() + ChronoDuration::days(6);
        assert_eq!(
            sampler.next_sample_at(&store, &id, t0(), inside_phase),
            inside_phase + ChronoDuration::hours(2)
        );

        let after_phase = t0() + ChronoDuration::days(8);
        assert_eq!(
            sampler.next_sample_at(&store, &id, t0(), after_phase),
            after_phase + ChronoDuration::hours(12)
        );
    }

    #[test]
    fn test_stays_dense_while_buckets_missing() {
        let store = BaselineStore::default();
        let sampler = Sampler::default();
        let id: WanLinkId = "wan1".into();
        store.record_sample(&id, t0(), 100.0, 10.0).unwrap();

        assert!(sampler.is_dense(&store, &id, t0(), t0() + ChronoDuration::days(30)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_measure_times_out() {
        let sampler = Sampler::default();
        let provider = MockSpeedTest::hanging();
        let err = sampler
            .measure(&provider, &docsis_link("wan1"))
            .await
            .unwrap_err();
        assert!(matches!(err, SqmError::MeasurementUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_measure_rejects_unusable_rates() {
        let sampler = Sampler::default();
        let provider = MockSpeedTest::new();
        provider.push("wan1", Some((0.0, 20.0)));
        provider.push("wan1", Some((300.0, f64::NAN)));
        provider.push("wan1", Some((300.0, 20.0)));
        let link = docsis_link("wan1");

        for _ in 0..2 {
            let err = sampler.measure(&provider, &link).await.unwrap_err();
            assert!(matches!(err, SqmError::MeasurementUnavailable { .. }));
        }
        let ok = sampler.measure(&provider, &link).await.unwrap();
        assert_eq!(ok.download_mbps, 300.0);
    }
}
