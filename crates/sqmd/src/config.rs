//! Daemon configuration

use anyhow::{Context, Result};
use serde::Deserialize;
use sqm_core::actuator::{ActuatorConfig, SshConfig};
use sqm_core::blending::BlendConfig;
use sqm_core::decision::DecisionConfig;
use sqm_core::drift::DriftConfig;
use sqm_core::engine::EngineConfig;
use sqm_core::history::HistoryConfig;
use sqm_core::latency::LatencyConfig;
use sqm_core::registry::{ConnectionProfile, ProfileParams, ProfileTable, WanLink};
use sqm_core::sampler::SamplerConfig;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/adaptive-sqm/sqmd.toml";

/// Daemon configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SqmdConfig {
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// API server port for status, health and metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    /// Snapshot of baselines, shaping state and history
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,

    /// Gateway local time offset used for hour-of-week buckets
    #[serde(default)]
    pub utc_offset_minutes: i32,

    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,

    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub sampler: SamplerConfig,
    #[serde(default)]
    pub latency: LatencyConfig,
    #[serde(default)]
    pub blending: BlendConfig,
    #[serde(default)]
    pub decision: DecisionConfig,
    #[serde(default)]
    pub drift: DriftConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub actuator: ActuatorConfig,

    /// Per-profile overrides keyed by profile name
    #[serde(default)]
    pub profiles: HashMap<String, ProfileParams>,

    #[serde(default)]
    pub links: Vec<WanLink>,
}

/// How the daemon reaches the gateway and what it runs there
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub ssh_user: Option<String>,
    pub ssh_port: u16,
    pub identity_file: Option<PathBuf>,
    pub connect_timeout_secs: u64,
    /// Directory the gateway sources at boot
    pub remote_dir: String,
    /// Shaping template override
    pub template_path: Option<PathBuf>,
    /// Must print `{download_mbps, upload_mbps, latency_ms}` JSON;
    /// `{{interface}}` is replaced with the link's interface
    pub speedtest_command: String,
    pub ping_target: String,
    pub ping_count: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            ssh_user: None,
            ssh_port: 22,
            identity_file: None,
            connect_timeout_secs: 10,
            remote_dir: ActuatorConfig::default().remote_dir,
            template_path: None,
            speedtest_command: "speedtest-json --interface {{interface}}".to_string(),
            ping_target: "1.1.1.1".to_string(),
            ping_count: 5,
        }
    }
}

impl GatewayConfig {
    pub fn ssh(&self) -> SshConfig {
        SshConfig {
            user: self.ssh_user.clone(),
            port: self.ssh_port,
            identity_file: self.identity_file.clone(),
            connect_timeout_secs: self.connect_timeout_secs,
        }
    }
}

fn default_node_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "gateway".to_string())
}

fn default_api_port() -> u16 {
    8080
}

fn default_state_path() -> PathBuf {
    PathBuf::from("/var/lib/adaptive-sqm/state.json")
}

fn default_flush_interval() -> u64 {
    60
}

impl SqmdConfig {
    /// Load from the file named by `SQMD_CONFIG` (or the default path, if
    /// present) with `SQMD_*` environment overrides on top
    pub fn load() -> Result<Self> {
        let path = std::env::var("SQMD_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let config = config::Config::builder()
            .add_source(config::File::new(&path, config::FileFormat::Toml).required(false))
            .add_source(
                config::Environment::with_prefix("SQMD")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("failed to read configuration from {}", path))?;

        let parsed: Self = config
            .try_deserialize()
            .context("invalid daemon configuration")?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Load a single TOML file without environment overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from(path).format(config::FileFormat::Toml))
            .build()
            .with_context(|| format!("failed to read configuration from {}", path.display()))?;

        let parsed: Self = config
            .try_deserialize()
            .context("invalid daemon configuration")?;
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn validate(&self) -> Result<()> {
        self.engine_config().validate()?;
        self.profile_table()?;
        for link in &self.links {
            link.validate()?;
        }
        let mut ids: Vec<_> = self.links.iter().map(|l| &l.id).collect();
        ids.sort();
        if let Some(pair) = ids.windows(2).find(|w| w[0] == w[1]) {
            anyhow::bail!("link '{}' is defined more than once", pair[0]);
        }
        let mut interfaces: Vec<_> = self.links.iter().map(|l| l.interface.as_str()).collect();
        interfaces.sort_unstable();
        if let Some(pair) = interfaces.windows(2).find(|w| w[0] == w[1]) {
            anyhow::bail!("interface '{}' is shared by more than one link", pair[0]);
        }
        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        let mut actuator = self.actuator.clone();
        actuator.remote_dir = self.gateway.remote_dir.clone();
        EngineConfig {
            node_name: self.node_name.clone(),
            utc_offset_minutes: self.utc_offset_minutes,
            sampler: self.sampler,
            latency: self.latency,
            blending: self.blending,
            decision: self.decision,
            drift: self.drift,
            history: self.history,
            actuator,
        }
    }

    pub fn profile_table(&self) -> Result<ProfileTable> {
        let mut table = ProfileTable::default();
        for (name, params) in &self.profiles {
            let profile: ConnectionProfile = name.parse()?;
            table.set(profile, *params)?;
        }
        Ok(table)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs.max(1))
    }

    pub fn speedtest_timeout(&self) -> Duration {
        Duration::from_secs(self.sampler.measurement_timeout_secs)
    }
}
