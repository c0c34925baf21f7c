//! Gateway actuator
//!
//! Renders shaping fragments and pushes them to the gateway. Deployments
//! are idempotent on the fragment's content hash, serialized per link, and
//! retried with bounded exponential backoff when the gateway is
//! unreachable. A failed deployment never touches the recorded shaping
//! state.

mod remote;
mod template;

pub use remote::{
    validate_host, validate_remote_path, CommandOutput, RemoteExecutor, RemoteResult, SshConfig,
    SshExecutor,
};
pub use template::{
    content_hash, ifb_name_for, mbps_to_kbit, validate_interface_name, validate_link_id,
    validate_qdisc_options, FragmentParams, RenderedFragment, ShapingTemplate, DEFAULT_TEMPLATE,
};

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::decision::ShapingTarget;
use crate::error::{Result, SqmError};
use crate::models::{AdjustmentReason, RatePair, ShapingState, WanLinkId};
use crate::registry::{ConnectionProfile, LinkRuntime, WanLink};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActuatorConfig {
    /// Directory the gateway's boot process sources fragments from
    pub remote_dir: String,
    pub command_timeout_secs: u64,
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Overrides the per-profile CAKE keywords
    pub qdisc_options: Option<String>,
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            remote_dir: "/etc/adaptive-sqm.d".to_string(),
            command_timeout_secs: 20,
            max_attempts: 3,
            initial_backoff_ms: 2_000,
            max_backoff_ms: 30_000,
            qdisc_options: None,
        }
    }
}

impl ActuatorConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        validate_remote_path(&format!("{}/x.sh", self.remote_dir.trim_end_matches('/')))
            .map_err(|e| e.into_sqm("remote_dir"))?;
        if self.max_attempts == 0 {
            return Err(SqmError::invalid("max_attempts", "must be at least 1"));
        }
        if let Some(options) = &self.qdisc_options {
            validate_qdisc_options(options)?;
        }
        Ok(())
    }
}

/// CAKE keywords matching the link's access technology
pub fn default_qdisc_options(profile: ConnectionProfile) -> &'static str {
    match profile {
        ConnectionProfile::Docsis => "docsis nat ack-filter",
        ConnectionProfile::Fiber => "ethernet nat",
        ConnectionProfile::Wireless => "nat",
        ConnectionProfile::Starlink => "nat rtt 100ms",
        ConnectionProfile::Cellular => "nat rtt 100ms",
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeployOutcome {
    Applied { state: ShapingState, attempts: u32 },
    /// Content hash matched the last deployment; nothing was sent
    Unchanged,
}

pub struct GatewayActuator {
    executor: Arc<dyn RemoteExecutor>,
    template: ShapingTemplate,
    config: ActuatorConfig,
    clock: Arc<dyn Clock>,
}

impl GatewayActuator {
    pub fn new(executor: Arc<dyn RemoteExecutor>, template: ShapingTemplate, config: ActuatorConfig) -> Self {
        Self {
            executor,
            template,
            config,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &ActuatorConfig {
        &self.config
    }

    pub fn executor(&self) -> Arc<dyn RemoteExecutor> {
        self.executor.clone()
    }

    /// Well-known fragment location re-applied by the gateway at boot
    pub fn remote_path(&self, link_id: &WanLinkId) -> String {
        format!("{}/{}.sh", self.config.remote_dir.trim_end_matches('/'), link_id)
    }

    pub fn render(&self, link: &WanLink, rates: RatePair) -> Result<RenderedFragment> {
        let qdisc_options = self
            .config
            .qdisc_options
            .as_deref()
            .unwrap_or_else(|| default_qdisc_options(link.profile));
        self.template.render(&FragmentParams {
            link_id: link.id.as_str(),
            interface: &link.interface,
            rates,
            qdisc_options,
        })
    }

    /// Put `target` in force, skipping the push when the gateway already
    /// holds identical content
    pub async fn deploy(&self, runtime: &LinkRuntime, target: ShapingTarget) -> Result<DeployOutcome> {
        let _guard = runtime.deploy_lock.lock().await;
        self.deploy_locked(runtime, target, false).await
    }

    /// Re-send the current shaping state even if its hash is unchanged
    pub async fn redeploy(&self, runtime: &LinkRuntime) -> Result<DeployOutcome> {
        let _guard = runtime.deploy_lock.lock().await;
        let current = runtime
            .shaping()
            .ok_or_else(|| SqmError::NoRateEvidence(runtime.id()))?;
        let target = ShapingTarget {
            rates: current.applied,
            reason: AdjustmentReason::ManualRedeploy,
        };
        self.deploy_locked(runtime, target, true).await
    }

    async fn deploy_locked(
        &self,
        runtime: &LinkRuntime,
        target: ShapingTarget,
        force: bool,
    ) -> Result<DeployOutcome> {
        let link = runtime.link();
        let rates = link.clamp(target.rates);
        let fragment = self.render(&link, rates)?;

        if !force {
            if let Some(previous) = runtime.shaping() {
                if previous.last_deployed_content_hash == fragment.content_hash {
                    debug!(link_id = %link.id, hash = %fragment.content_hash, "Fragment unchanged, skipping deploy");
                    return Ok(DeployOutcome::Unchanged);
                }
            }
        }

        let path = self.remote_path(&link.id);
        let attempts = self.push_with_retry(&link, &fragment, &path).await?;

        let state = ShapingState {
            applied: rates,
            last_applied_at: self.clock.now(),
            last_adjustment_reason: target.reason,
            last_deployed_content_hash: fragment.content_hash,
        };
        runtime.set_shaping(Some(state.clone()));

        info!(
            link_id = %link.id,
            host = %link.gateway_host,
            rates = %rates,
            reason = %target.reason,
            attempts,
            "Shaping fragment deployed"
        );
        Ok(DeployOutcome::Applied { state, attempts })
    }

    async fn push_with_retry(&self, link: &WanLink, fragment: &RenderedFragment, path: &str) -> Result<u32> {
        let max_attempts = self.config.max_attempts.max(1);
        let max_backoff = Duration::from_millis(self.config.max_backoff_ms);
        let mut backoff = Duration::from_millis(self.config.initial_backoff_ms);
        let mut attempt = 1;

        loop {
            match self.push(link, fragment, path).await {
                Ok(()) => return Ok(attempt),
                Err(e @ SqmError::RemoteUnreachable { .. }) if attempt < max_attempts => {
                    debug!(
                        link_id = %link.id,
                        attempt,
                        error = %e,
                        retry_in_ms = backoff.as_millis() as u64,
                        "Gateway unreachable, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(max_backoff);
                    attempt += 1;
                }
                Err(e) => {
                    warn!(link_id = %link.id, attempts = attempt, error = %e, "Deployment failed");
                    return Err(e);
                }
            }
        }
    }

    async fn push(&self, link: &WanLink, fragment: &RenderedFragment, path: &str) -> Result<()> {
        let host = link.gateway_host.as_str();
        let timeout = self.config.command_timeout();

        let upload = self
            .executor
            .upload_content(host, &fragment.content, path, timeout)
            .await
            .map_err(|e| e.into_sqm(host))?;
        Self::check(host, upload)?;

        let applied = self
            .executor
            .execute(host, &format!("sh '{}'", path), timeout)
            .await
            .map_err(|e| e.into_sqm(host))?;
        Self::check(host, applied)
    }

    fn check(host: &str, output: CommandOutput) -> Result<()> {
        if output.success() {
            return Ok(());
        }
        Err(SqmError::DeploymentRejected {
            host: host.to_string(),
            exit_code: output.exit_code,
            stderr: output.stderr.trim().to_string(),
        })
    }
}
