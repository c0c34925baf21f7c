//! Per-link shaping pipeline
//!
//! [`SqmEngine`] wires the registry, baseline store, sampler, latency
//! monitor, blending and decision engines and the gateway actuator into
//! the two cycles every link runs:
//!
//! - the speed cycle: measure, blend with the baseline, decide, deploy
//! - the ping cycle: probe latency, back off on sustained congestion and
//!   recover once the cooldown has passed
//!
//! Links share nothing but the engine's read-mostly tables, so a slow or
//! failing link never holds up another.

use chrono::{DateTime, FixedOffset, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::actuator::{ActuatorConfig, DeployOutcome, GatewayActuator, RemoteExecutor, ShapingTemplate};
use crate::alerts::{Alert, AlertKind, Alerter, FailureKind, PERSISTENT_FAILURE_CYCLES};
use crate::baseline::{BaselineStore, HourlyBaseline};
use crate::blending::{BlendConfig, BlendingEngine, EffectiveRates};
use crate::clock::{Clock, SystemClock};
use crate::decision::{Decision, DecisionConfig, DecisionEngine, ShapingTarget};
use crate::drift::{DriftAnomaly, DriftConfig, DriftDetector};
use crate::error::{Result, SqmError};
use crate::history::{HistoryConfig, SampleHistory};
use crate::latency::{LatencyConfig, LatencyMonitor, LatencyVerdict};
use crate::measurement::{PingProvider, SpeedTestProvider};
use crate::models::{
    AdjustmentReason, Direction, PingMeasurement, PingSample, RatePair, SampleSource, ShapingState,
    SpeedMeasurement, SpeedSample, WanLinkId,
};
use crate::observability::{SqmMetrics, StructuredLogger};
use crate::persistence::{PersistedState, STATE_VERSION};
use crate::registry::{lock, LinkRuntime, ProfileParams, ProfileTable, WanLink, WanLinkRegistry};
use crate::sampler::{Admission, SamplePermit, Sampler, SamplerConfig};
use crate::status::{LinkStatus, PingObservation, SpeedTestObservation, StatusReport};

const ALERTS_PER_LINK_STATUS: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub node_name: String,
    /// Gateway local time offset used for hour-of-week buckets
    pub utc_offset_minutes: i32,
    pub sampler: SamplerConfig,
    pub latency: LatencyConfig,
    pub blending: BlendConfig,
    pub decision: DecisionConfig,
    pub drift: DriftConfig,
    pub history: HistoryConfig,
    pub actuator: ActuatorConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            node_name: "gateway".to_string(),
            utc_offset_minutes: 0,
            sampler: SamplerConfig::default(),
            latency: LatencyConfig::default(),
            blending: BlendConfig::default(),
            decision: DecisionConfig::default(),
            drift: DriftConfig::default(),
            history: HistoryConfig::default(),
            actuator: ActuatorConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        self.sampler.validate()?;
        self.latency.validate()?;
        self.blending.validate()?;
        self.decision.validate()?;
        self.actuator.validate()?;
        self.utc_offset()?;
        Ok(())
    }

    pub fn utc_offset(&self) -> Result<FixedOffset> {
        FixedOffset::east_opt(self.utc_offset_minutes * 60).ok_or_else(|| {
            SqmError::invalid(
                "utc_offset_minutes",
                format!("{} is out of range", self.utc_offset_minutes),
            )
        })
    }
}

/// What happened to a deployment attempted by a cycle
#[derive(Debug, Clone, PartialEq)]
pub enum DeploymentResult {
    Applied(ShapingState),
    Unchanged,
    Failed { kind: &'static str, message: String },
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub link_id: WanLinkId,
    pub admission: Admission,
    pub measurement: Option<SpeedMeasurement>,
    pub effective: Option<EffectiveRates>,
    pub decision: Option<Decision>,
    pub deployment: Option<DeploymentResult>,
    pub drift: Vec<DriftAnomaly>,
}

impl CycleReport {
    fn merged(link_id: &WanLinkId) -> Self {
        Self {
            link_id: link_id.clone(),
            admission: Admission::Merged,
            measurement: None,
            effective: None,
            decision: None,
            deployment: None,
            drift: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PingAction {
    None,
    Backoff(DeploymentResult),
    /// Congested, but already at the floor or nothing deployed yet
    BackoffSkipped,
    /// Cooldown finished; the recovery decision may have held
    Recovered(Option<DeploymentResult>),
}

#[derive(Debug, Clone)]
pub struct PingReport {
    pub link_id: WanLinkId,
    pub measurement: PingMeasurement,
    pub verdict: LatencyVerdict,
    pub action: PingAction,
}

pub struct SqmEngine {
    config: EngineConfig,
    registry: WanLinkRegistry,
    baselines: BaselineStore,
    history: SampleHistory,
    alerter: Alerter,
    sampler: Sampler,
    latency: LatencyMonitor,
    blending: BlendingEngine,
    decision: DecisionEngine,
    drift: DriftDetector,
    actuator: GatewayActuator,
    speedtest: Arc<dyn SpeedTestProvider>,
    pinger: Arc<dyn PingProvider>,
    clock: Arc<dyn Clock>,
    metrics: SqmMetrics,
    logger: StructuredLogger,
}

/// Builder for [`SqmEngine`]; measurement providers and a remote executor
/// are required
#[derive(Default)]
pub struct SqmEngineBuilder {
    config: Option<EngineConfig>,
    clock: Option<Arc<dyn Clock>>,
    speedtest: Option<Arc<dyn SpeedTestProvider>>,
    pinger: Option<Arc<dyn PingProvider>>,
    executor: Option<Arc<dyn RemoteExecutor>>,
    template: Option<ShapingTemplate>,
    profiles: Option<ProfileTable>,
}

impl SqmEngineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn speed_test(mut self, provider: Arc<dyn SpeedTestProvider>) -> Self {
        self.speedtest = Some(provider);
        self
    }

    pub fn pinger(mut self, provider: Arc<dyn PingProvider>) -> Self {
        self.pinger = Some(provider);
        self
    }

    pub fn executor(mut self, executor: Arc<dyn RemoteExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn template(mut self, template: ShapingTemplate) -> Self {
        self.template = Some(template);
        self
    }

    pub fn profiles(mut self, profiles: ProfileTable) -> Self {
        self.profiles = Some(profiles);
        self
    }

    pub fn build(self) -> Result<SqmEngine> {
        let config = self.config.unwrap_or_default();
        config.validate()?;

        let speedtest = self
            .speedtest
            .ok_or_else(|| SqmError::invalid("engine", "a speed test provider is required"))?;
        let pinger = self
            .pinger
            .ok_or_else(|| SqmError::invalid("engine", "a ping provider is required"))?;
        let executor = self
            .executor
            .ok_or_else(|| SqmError::invalid("engine", "a remote executor is required"))?;
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        let actuator = GatewayActuator::new(
            executor,
            self.template.unwrap_or_default(),
            config.actuator.clone(),
        )
        .with_clock(clock.clone());

        Ok(SqmEngine {
            registry: WanLinkRegistry::with_profiles(self.profiles.unwrap_or_default()),
            baselines: BaselineStore::new(config.utc_offset()?),
            history: SampleHistory::new(config.history),
            alerter: Alerter::new(clock.clone()),
            sampler: Sampler::new(config.sampler),
            latency: LatencyMonitor::new(config.latency),
            blending: BlendingEngine::new(config.blending),
            decision: DecisionEngine::new(config.decision),
            drift: DriftDetector::new(config.drift),
            actuator,
            speedtest,
            pinger,
            clock,
            metrics: SqmMetrics::new(),
            logger: StructuredLogger::new(config.node_name.clone()),
            config,
        })
    }
}

impl SqmEngine {
    pub fn builder() -> SqmEngineBuilder {
        SqmEngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        self.clock.clone()
    }

    pub fn registry(&self) -> &WanLinkRegistry {
        &self.registry
    }

    pub fn baselines(&self) -> &BaselineStore {
        &self.baselines
    }

    pub fn history(&self) -> &SampleHistory {
        &self.history
    }

    pub fn alerter(&self) -> &Alerter {
        &self.alerter
    }

    pub fn logger(&self) -> &StructuredLogger {
        &self.logger
    }

    // Link lifecycle

    pub fn add_link(&self, link: WanLink) -> Result<()> {
        let runtime = self.registry.add(link, self.clock.now())?;
        let id = runtime.id();
        self.metrics
            .set_learning_progress(&id, self.baselines.learning_progress(&id));
        Ok(())
    }

    /// Replace a link's configuration. When the applied rate falls outside
    /// the new limits the clamped rate is deployed right away.
    pub async fn update_link(&self, link: WanLink) -> Result<Option<DeploymentResult>> {
        let runtime = self.registry.update(link)?;
        let link = runtime.link();
        if !link.enabled {
            return Ok(None);
        }
        let Some(current) = runtime.shaping() else {
            return Ok(None);
        };
        let clamped = link.clamp(current.applied);
        if clamped == current.applied {
            return Ok(None);
        }
        let target = ShapingTarget {
            rates: clamped,
            reason: AdjustmentReason::Reconfigured,
        };
        Ok(Some(self.deploy(&runtime, &link, target).await))
    }

    /// Remove a link together with its baselines, history and alerts
    pub fn remove_link(&self, id: &WanLinkId) -> Result<()> {
        self.registry
            .remove(id)
            .ok_or_else(|| SqmError::UnknownLink(id.clone()))?;
        self.baselines.remove_link(id);
        self.history.remove_link(id);
        self.alerter.remove_link(id);
        self.metrics.remove_link(id);
        Ok(())
    }

    pub fn links(&self) -> Vec<WanLink> {
        self.registry.list()
    }

    pub fn profile_params(&self, link: &WanLink) -> ProfileParams {
        self.registry.profile_params(link.profile)
    }

    // Speed cycle

    /// Run one measurement/blend/decide/deploy cycle unless a sample for
    /// the link is already running or just ran
    pub async fn run_speed_cycle(&self, id: &WanLinkId, source: SampleSource) -> Result<CycleReport> {
        let runtime = self.enabled_runtime(id)?;
        match self.sampler.admit(&runtime, self.clock.now()) {
            Some(permit) => self.speed_cycle(runtime, permit, source).await,
            None => Ok(CycleReport::merged(id)),
        }
    }

    /// Manual "test now": starts a cycle in the background or reports that
    /// the request merged with a running or recent one
    pub fn request_test(self: &Arc<Self>, id: &WanLinkId) -> Result<Admission> {
        let runtime = self.enabled_runtime(id)?;
        let Some(permit) = self.sampler.admit(&runtime, self.clock.now()) else {
            return Ok(Admission::Merged);
        };

        let engine = self.clone();
        tokio::spawn(async move {
            let id = runtime.id();
            if let Err(e) = engine.speed_cycle(runtime, permit, SampleSource::Manual).await {
                debug!(link_id = %id, error = %e, "Manual speed test cycle failed");
            }
        });
        Ok(Admission::Started)
    }

    /// Runtime of a link that may run cycles; disabled links keep their
    /// state but are never measured or shaped
    fn enabled_runtime(&self, id: &WanLinkId) -> Result<Arc<LinkRuntime>> {
        let runtime = self.registry.get(id)?;
        if !runtime.link().enabled {
            return Err(SqmError::LinkDisabled(id.clone()));
        }
        Ok(runtime)
    }

    async fn speed_cycle(
        &self,
        runtime: Arc<LinkRuntime>,
        _permit: SamplePermit,
        source: SampleSource,
    ) -> Result<CycleReport> {
        let started = Instant::now();
        let link = runtime.link();
        let id = link.id.clone();
        let params = self.profile_params(&link);

        let measured = self.sampler.measure(self.speedtest.as_ref(), &link).await;
        let now = self.clock.now();

        // Baseline as it stood before this sample
        let baselines = (
            self.baselines.get_baseline(&id, now, Direction::Download),
            self.baselines.get_baseline(&id, now, Direction::Upload),
        );
        let mode = self.baselines.mode(&id);

        let mut drift = Vec::new();
        let measurement = match measured {
            Ok(m) => {
                lock(&runtime.failures).record_success(FailureKind::Measurement);
                drift = self
                    .drift
                    .observe(&mut lock(&runtime.drift), &id, baselines, m.rates());
                self.sampler.record(&self.baselines, &id, now, &m)?;
                self.history.record_speed(SpeedSample {
                    timestamp: now,
                    link_id: id.clone(),
                    download_mbps: m.download_mbps,
                    upload_mbps: m.upload_mbps,
                    latency_ms: m.latency_ms,
                    source,
                });
                Some(m)
            }
            Err(e) => {
                self.on_measurement_failure(&runtime, &id, FailureKind::Measurement, &e);
                None
            }
        };

        for anomaly in &drift {
            self.logger
                .log_baseline_drift(&id, anomaly.direction, anomaly.z_score, anomaly.cycles);
            self.alerter.raise(&id, AlertKind::BaselineDrift, anomaly.to_error().to_string());
        }
        self.metrics
            .set_learning_progress(&id, self.baselines.learning_progress(&id));

        let effective = self.blending.combine(
            &id,
            mode,
            baselines,
            measurement.map(|m| m.rates()),
            params.variance_threshold,
        )?;
        self.metrics.set_effective_rate(&id, effective.rates);

        let previous = runtime.shaping();
        let reason = if previous.is_none() {
            AdjustmentReason::InitialMeasurement
        } else {
            AdjustmentReason::Blended
        };
        let decision = self.decision.compute_shaping_rate(
            effective.rates,
            &link,
            &params,
            previous.as_ref(),
            runtime.backoff_active(),
            reason,
        );

        let adjusted = self.decision.candidate(effective.rates, &link, &params);
        runtime.update_observations(|obs| {
            obs.last_effective = Some(effective.rates);
            if let Some(m) = measurement {
                obs.last_speedtest = Some(SpeedTestObservation {
                    measured: m.rates(),
                    adjusted,
                    at: now,
                });
            }
        });

        let deployment = match decision {
            Decision::Apply(target) => Some(self.deploy(&runtime, &link, target).await),
            Decision::Hold { candidate, reason } => {
                debug!(link_id = %id, candidate = %candidate, reason = ?reason, "Holding shaping rate");
                None
            }
        };

        self.metrics
            .observe_cycle("speed", started.elapsed().as_secs_f64());
        Ok(CycleReport {
            link_id: id,
            admission: Admission::Started,
            measurement,
            effective: Some(effective),
            decision: Some(decision),
            deployment,
            drift,
        })
    }

    fn on_measurement_failure(&self, runtime: &LinkRuntime, id: &WanLinkId, failure: FailureKind, error: &SqmError) {
        let kind = match failure {
            FailureKind::Ping => "ping",
            _ => "speedtest",
        };
        self.metrics.inc_measurement_failure(id, kind);
        let streak = lock(&runtime.failures).record_failure(failure);
        if streak >= PERSISTENT_FAILURE_CYCLES {
            warn!(link_id = %id, kind, streak, error = %error, "Measurements failing persistently");
            self.alerter.raise(
                id,
                AlertKind::MeasurementUnavailable,
                format!("{} failed for {} consecutive cycles: {}", kind, streak, error),
            );
        } else {
            debug!(link_id = %id, kind, streak, error = %error, "Measurement failed");
        }
    }

    async fn deploy(&self, runtime: &LinkRuntime, link: &WanLink, target: ShapingTarget) -> DeploymentResult {
        match self.actuator.deploy(runtime, target).await {
            Ok(outcome) => self.on_deploy_success(runtime, &link.id, outcome),
            Err(e) => self.on_deploy_failure(runtime, link, &e),
        }
    }

    fn on_deploy_success(&self, runtime: &LinkRuntime, id: &WanLinkId, outcome: DeployOutcome) -> DeploymentResult {
        lock(&runtime.failures).record_success(FailureKind::Deployment);
        match outcome {
            DeployOutcome::Applied { state, attempts } => {
                self.metrics.inc_deployment(id, "applied");
                self.metrics.set_applied_rate(id, state.applied);
                self.logger
                    .log_rate_applied(id, state.applied, state.last_adjustment_reason, attempts);
                DeploymentResult::Applied(state)
            }
            DeployOutcome::Unchanged => {
                self.metrics.inc_deployment(id, "unchanged");
                DeploymentResult::Unchanged
            }
        }
    }

    fn on_deploy_failure(&self, runtime: &LinkRuntime, link: &WanLink, error: &SqmError) -> DeploymentResult {
        let id = &link.id;
        self.metrics.inc_deployment(id, "failed");
        self.logger.log_deployment_failed(id, error.kind(), &error.to_string());

        let streak = lock(&runtime.failures).record_failure(FailureKind::Deployment);
        match error {
            SqmError::RemoteUnreachable { host, .. } => {
                self.alerter.raise(
                    id,
                    AlertKind::RemoteUnreachable,
                    format!("gateway {} unreachable after retries; keeping previous shaping", host),
                );
            }
            SqmError::DeploymentRejected { .. } => {
                self.alerter.raise(id, AlertKind::DeploymentRejected, error.to_string());
            }
            _ => {}
        }
        if streak >= PERSISTENT_FAILURE_CYCLES {
            self.alerter.raise(
                id,
                AlertKind::PersistentFailure,
                format!("deployment failed for {} consecutive cycles: {}", streak, error),
            );
        }

        DeploymentResult::Failed {
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    // Ping cycle

    /// Probe latency and react to sustained congestion or its end.
    ///
    /// A failed probe is reported as an error and leaves the congestion
    /// streak untouched.
    pub async fn run_ping_cycle(&self, id: &WanLinkId) -> Result<PingReport> {
        let started = Instant::now();
        let runtime = self.enabled_runtime(id)?;
        let link = runtime.link();
        let params = self.profile_params(&link);

        let measurement = match self.latency.probe(self.pinger.as_ref(), &link).await {
            Ok(m) => {
                lock(&runtime.failures).record_success(FailureKind::Ping);
                m
            }
            Err(e) => {
                self.on_measurement_failure(&runtime, id, FailureKind::Ping, &e);
                return Err(e);
            }
        };
        let now = self.clock.now();

        let verdict = self.latency.observe(
            &mut lock(&runtime.latency),
            measurement.latency_ms,
            params.congestion_threshold_ms,
        );
        self.history.record_ping(PingSample {
            timestamp: now,
            link_id: id.clone(),
            latency_ms: measurement.latency_ms,
            jitter_ms: measurement.jitter_ms,
        });

        let shaping = runtime.shaping();
        runtime.update_observations(|obs| {
            obs.last_ping = Some(PingObservation {
                rate: shaping.as_ref().map(|s| s.applied),
                latency: measurement.latency_ms,
                jitter: measurement.jitter_ms,
                congested: verdict.congested,
                at: now,
            });
        });

        let action = if verdict.sustained {
            self.metrics.inc_congestion_event(id);
            match self.decision.emergency_backoff(&link, &params, shaping.as_ref()) {
                Some(target) => {
                    lock(&runtime.backoff).engage(now);
                    self.logger
                        .log_emergency_backoff(id, verdict.latency_ms, verdict.baseline_ms, target.rates);
                    PingAction::Backoff(self.deploy(&runtime, &link, target).await)
                }
                None => {
                    if shaping.is_some() {
                        lock(&runtime.backoff).engage(now);
                    }
                    PingAction::BackoffSkipped
                }
            }
        } else {
            let recovered = lock(&runtime.backoff).observe(now, verdict.congested, params.cooldown());
            if recovered {
                self.logger.log_cooldown_complete(id);
                PingAction::Recovered(self.recover(&runtime, &link, &params, now).await)
            } else {
                PingAction::None
            }
        };

        self.metrics
            .observe_cycle("ping", started.elapsed().as_secs_f64());
        Ok(PingReport {
            link_id: id.clone(),
            measurement,
            verdict,
            action,
        })
    }

    /// Post-cooldown decision from the baseline-led blend of the last test
    async fn recover(
        &self,
        runtime: &LinkRuntime,
        link: &WanLink,
        params: &ProfileParams,
        now: DateTime<Utc>,
    ) -> Option<DeploymentResult> {
        let id = &link.id;
        let last_measured = runtime.observations().last_speedtest.map(|s| s.measured);
        let baselines = (
            self.baselines.get_baseline(id, now, Direction::Download),
            self.baselines.get_baseline(id, now, Direction::Upload),
        );
        let effective = match self.blending.combine(
            id,
            self.baselines.mode(id),
            baselines,
            last_measured,
            params.variance_threshold,
        ) {
            Ok(effective) => effective,
            Err(e) => {
                debug!(link_id = %id, error = %e, "No rate evidence for recovery");
                return None;
            }
        };

        let previous = runtime.shaping();
        match self.decision.compute_shaping_rate(
            effective.rates,
            link,
            params,
            previous.as_ref(),
            false,
            AdjustmentReason::CooldownRecovery,
        ) {
            Decision::Apply(target) => Some(self.deploy(runtime, link, target).await),
            Decision::Hold { .. } => None,
        }
    }

    // Manual operations

    /// Re-send the current shaping state to the gateway
    pub async fn redeploy(&self, id: &WanLinkId) -> Result<DeploymentResult> {
        let runtime = self.enabled_runtime(id)?;
        match self.actuator.redeploy(&runtime).await {
            Ok(outcome) => Ok(self.on_deploy_success(&runtime, id, outcome)),
            // nothing to re-send is not a gateway failure
            Err(e @ SqmError::NoRateEvidence(_)) => Err(e),
            Err(e) => {
                self.on_deploy_failure(&runtime, &runtime.link(), &e);
                Err(e)
            }
        }
    }

    // Scheduling support

    /// When the sampler should next run for a link whose last sample
    /// started at `last`
    pub fn next_sample_at(&self, id: &WanLinkId, last: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let runtime = self.registry.get(id)?;
        Ok(self
            .sampler
            .next_sample_at(&self.baselines, id, runtime.registered_at(), last))
    }

    /// Periodic housekeeping: history retention
    pub fn maintenance(&self) {
        self.history.prune(self.clock.now());
    }

    // Status

    pub fn link_status(&self, id: &WanLinkId) -> Result<LinkStatus> {
        let runtime = self.registry.get(id)?;
        Ok(self.build_status(&runtime))
    }

    fn build_status(&self, runtime: &LinkRuntime) -> LinkStatus {
        let link = runtime.link();
        let id = &link.id;
        let now = self.clock.now();
        let shaping = runtime.shaping();
        let observations = runtime.observations();

        let baseline_rate = match (
            self.baselines.get_baseline(id, now, Direction::Download),
            self.baselines.get_baseline(id, now, Direction::Upload),
        ) {
            (Some(down), Some(up)) => Some(RatePair::new(down.mean, up.mean)),
            _ => None,
        };

        let mut alerts = self.alerter.for_link(id);
        alerts.truncate(ALERTS_PER_LINK_STATUS);

        LinkStatus {
            link_id: id.clone(),
            enabled: link.enabled,
            current_rate: shaping.as_ref().map(|s| s.applied),
            baseline_rate,
            last_speedtest: observations.last_speedtest,
            last_ping: observations.last_ping,
            mode: self.baselines.mode(id),
            learning_progress: self.baselines.learning_progress(id),
            backoff_active: runtime.backoff_active(),
            last_adjustment_reason: shaping.as_ref().map(|s| s.last_adjustment_reason),
            last_applied_at: shaping.as_ref().map(|s| s.last_applied_at),
            alerts,
        }
    }

    /// Live status of every link keyed by interface
    pub fn status(&self) -> StatusReport {
        self.registry
            .ids()
            .iter()
            .filter_map(|id| self.registry.get(id).ok())
            .map(|runtime| {
                let status = self.build_status(&runtime);
                (runtime.link().interface, status)
            })
            .collect()
    }

    pub fn baseline(&self, id: &WanLinkId, direction: Direction) -> Result<Vec<HourlyBaseline>> {
        self.registry.get(id)?;
        Ok(self.baselines.buckets(id, direction))
    }

    /// Links whose last cycle of `kind` failed, with the current streak
    pub fn failing_links(&self, kind: FailureKind) -> Vec<(WanLinkId, u32)> {
        let mut failing: Vec<_> = self
            .registry
            .ids()
            .into_iter()
            .filter_map(|id| {
                let runtime = self.registry.get(&id).ok()?;
                let streak = lock(&runtime.failures).get(kind);
                (streak > 0).then_some((id, streak))
            })
            .collect();
        failing.sort();
        failing
    }

    pub fn alerts(&self, limit: usize) -> Vec<Alert> {
        self.alerter.recent(limit)
    }

    // Persistence

    pub fn snapshot(&self) -> PersistedState {
        let links = self.registry.list();
        let shaping: BTreeMap<WanLinkId, ShapingState> = links
            .iter()
            .filter_map(|l| {
                let runtime = self.registry.get(&l.id).ok()?;
                runtime.shaping().map(|s| (l.id.clone(), s))
            })
            .collect();

        PersistedState {
            version: STATE_VERSION,
            saved_at: self.clock.now(),
            links,
            baselines: self.baselines.snapshot(),
            shaping,
            history: self.history.snapshot(),
        }
    }

    /// Load persisted state. Links already registered keep their current
    /// configuration; shaping state is only restored where none exists.
    pub fn restore(&self, state: PersistedState) -> Result<()> {
        if state.version != STATE_VERSION {
            return Err(SqmError::Persistence(format!(
                "unsupported state version {}",
                state.version
            )));
        }

        for link in state.links {
            if !self.registry.contains(&link.id) {
                self.add_link(link)?;
            }
        }

        let known: Vec<_> = state
            .baselines
            .into_iter()
            .filter(|b| self.registry.contains(&b.link_id))
            .collect();
        self.baselines.restore(known)?;

        for (id, shaping) in state.shaping {
            if let Ok(runtime) = self.registry.get(&id) {
                if runtime.shaping().is_none() {
                    self.metrics.set_applied_rate(&id, shaping.applied);
                    runtime.set_shaping(Some(shaping));
                }
            }
        }

        self.history.restore(state.history);
        info!(links = self.registry.len(), "Restored pipeline state");
        Ok(())
    }

    /// Offset used for bucket mapping, for display purposes
    pub fn utc_offset(&self) -> FixedOffset {
        self.baselines.utc_offset()
    }
}

impl std::fmt::Debug for SqmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqmEngine")
            .field("links", &self.registry.len())
            .field("utc_offset", &self.baselines.utc_offset())
            .finish()
    }
}
