//! Test doubles and fixtures shared by unit tests

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use crate::actuator::{CommandOutput, RemoteExecutor, RemoteResult};
use crate::error::{RemoteError, Result, SqmError};
use crate::measurement::{PingProvider, SpeedTestProvider};
use crate::models::{PingMeasurement, SpeedMeasurement, WanLinkId};
use crate::registry::{ConnectionProfile, WanLink};

/// Monday 2024-01-01 00:00 UTC
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// `day` 0 = Monday
pub fn at(day: i64, hour: i64) -> DateTime<Utc> {
    t0() + ChronoDuration::days(day) + ChronoDuration::hours(hour)
}

pub fn monday_at(hour: i64) -> DateTime<Utc> {
    at(0, hour)
}

pub fn docsis_link(id: &str) -> WanLink {
    WanLink {
        id: id.into(),
        interface: format!("eth-{}", id),
        gateway_host: format!("gw-{}", id),
        profile: ConnectionProfile::Docsis,
        nominal_down_mbps: 500.0,
        nominal_up_mbps: 30.0,
        floor_down_mbps: 10.0,
        floor_up_mbps: 2.0,
        enabled: true,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Upload {
    pub host: String,
    pub path: String,
    pub content: String,
}

#[derive(Default)]
struct ExecutorState {
    uploads: Vec<Upload>,
    commands: Vec<(String, String)>,
    unreachable: HashSet<String>,
    transient_failures: HashMap<String, u32>,
    rejections: HashMap<String, (i32, String)>,
    responses: Vec<(String, String)>,
    in_flight: usize,
    max_in_flight: usize,
}

/// Records every call; hosts can be made unreachable or rejecting
#[derive(Default)]
pub struct MockExecutor {
    state: Mutex<ExecutorState>,
    delay: Option<Duration>,
}

impl MockExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_unreachable(&self, host: &str, unreachable: bool) {
        let mut state = self.state.lock().unwrap();
        if unreachable {
            state.unreachable.insert(host.to_string());
        } else {
            state.unreachable.remove(host);
        }
    }

    /// Fail the next `times` uploads to `host` as unreachable
    pub fn fail_times(&self, host: &str, times: u32) {
        self.state
            .lock()
            .unwrap()
            .transient_failures
            .insert(host.to_string(), times);
    }

    pub fn reject(&self, host: &str, exit_code: i32, stderr: &str) {
        self.state
            .lock()
            .unwrap()
            .rejections
            .insert(host.to_string(), (exit_code, stderr.to_string()));
    }

    /// Answer commands starting with `prefix` with `stdout`
    pub fn respond(&self, prefix: &str, stdout: &str) {
        self.state
            .lock()
            .unwrap()
            .responses
            .push((prefix.to_string(), stdout.to_string()));
    }

    pub fn uploads(&self) -> Vec<Upload> {
        self.state.lock().unwrap().uploads.clone()
    }

    pub fn upload_count(&self, host: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .uploads
            .iter()
            .filter(|u| u.host == host)
            .count()
    }

    pub fn commands(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().commands.clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.state.lock().unwrap().max_in_flight
    }

    async fn enter(&self, host: &str) -> RemoteResult<()> {
        {
            let mut state = self.state.lock().unwrap();
            state.in_flight += 1;
            state.max_in_flight = state.max_in_flight.max(state.in_flight);
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock().unwrap();
        state.in_flight -= 1;
        if state.unreachable.contains(host) {
            return Err(RemoteError::Unreachable(format!("ssh: connect to host {}: No route to host", host)));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteExecutor for MockExecutor {
    async fn execute(&self, host: &str, command: &str, _timeout: Duration) -> RemoteResult<CommandOutput> {
        self.enter(host).await?;
        let mut state = self.state.lock().unwrap();
        state.commands.push((host.to_string(), command.to_string()));
        let stdout = state
            .responses
            .iter()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map(|(_, out)| out.clone())
            .unwrap_or_default();
        Ok(CommandOutput {
            exit_code: 0,
            stdout,
            stderr: String::new(),
        })
    }

    async fn upload_content(
        &self,
        host: &str,
        content: &str,
        remote_path: &str,
        _timeout: Duration,
    ) -> RemoteResult<CommandOutput> {
        self.enter(host).await?;
        let mut state = self.state.lock().unwrap();
        if let Some(remaining) = state.transient_failures.get_mut(host) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(RemoteError::Timeout(Duration::from_secs(20)));
            }
        }
        state.uploads.push(Upload {
            host: host.to_string(),
            path: remote_path.to_string(),
            content: content.to_string(),
        });
        if let Some((exit_code, stderr)) = state.rejections.get(host) {
            return Ok(CommandOutput {
                exit_code: *exit_code,
                stdout: String::new(),
                stderr: stderr.clone(),
            });
        }
        Ok(CommandOutput::default())
    }
}

fn unavailable(link: &WanLink, reason: &str) -> SqmError {
    SqmError::MeasurementUnavailable {
        link_id: link.id.clone(),
        reason: reason.to_string(),
    }
}

/// Scripted speed tests; `None` entries fail
#[derive(Default)]
pub struct MockSpeedTest {
    scripted: Mutex<HashMap<WanLinkId, VecDeque<Option<SpeedMeasurement>>>>,
    fallback: Mutex<Option<SpeedMeasurement>>,
    calls: Mutex<Vec<WanLinkId>>,
    hang: bool,
}

impl MockSpeedTest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every link measures `down`/`up` unless scripted otherwise
    pub fn constant(down: f64, up: f64) -> Self {
        let mock = Self::default();
        mock.set_fallback(Some((down, up)));
        mock
    }

    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::default()
        }
    }

    pub fn set_fallback(&self, rates: Option<(f64, f64)>) {
        *self.fallback.lock().unwrap() = rates.map(|(down, up)| SpeedMeasurement {
            download_mbps: down,
            upload_mbps: up,
            latency_ms: Some(12.0),
        });
    }

    pub fn push(&self, link_id: &str, rates: Option<(f64, f64)>) {
        self.scripted
            .lock()
            .unwrap()
            .entry(link_id.into())
            .or_default()
            .push_back(rates.map(|(down, up)| SpeedMeasurement {
                download_mbps: down,
                upload_mbps: up,
                latency_ms: Some(12.0),
            }));
    }

    pub fn calls(&self, link_id: &str) -> usize {
        let id = WanLinkId::from(link_id);
        self.calls.lock().unwrap().iter().filter(|c| **c == id).count()
    }
}

#[async_trait]
impl SpeedTestProvider for MockSpeedTest {
    async fn run_speed_test(&self, link: &WanLink) -> Result<SpeedMeasurement> {
        self.calls.lock().unwrap().push(link.id.clone());
        if self.hang {
            std::future::pending::<()>().await;
        }
        let scripted = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(&link.id)
            .and_then(|q| q.pop_front());
        match scripted {
            Some(Some(m)) => Ok(m),
            Some(None) => Err(unavailable(link, "scripted failure")),
            None => (*self.fallback.lock().unwrap()).ok_or_else(|| unavailable(link, "no result")),
        }
    }
}

/// Scripted pings in call order; `None` entries fail
#[derive(Default)]
pub struct MockPing {
    scripted: Mutex<VecDeque<Option<PingMeasurement>>>,
    fallback: Mutex<Option<PingMeasurement>>,
    calls: Mutex<usize>,
    hang: bool,
}

impl MockPing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn constant(latency_ms: f64) -> Self {
        let mock = Self::default();
        *mock.fallback.lock().unwrap() = Some(PingMeasurement {
            latency_ms,
            jitter_ms: 1.0,
        });
        mock
    }

    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::default()
        }
    }

    pub fn push_ok(&self, latency_ms: f64, jitter_ms: f64) {
        self.scripted.lock().unwrap().push_back(Some(PingMeasurement {
            latency_ms,
            jitter_ms,
        }));
    }

    pub fn push_err(&self) {
        self.scripted.lock().unwrap().push_back(None);
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl PingProvider for MockPing {
    async fn ping(&self, link: &WanLink) -> Result<PingMeasurement> {
        *self.calls.lock().unwrap() += 1;
        if self.hang {
            std::future::pending::<()>().await;
        }
        let scripted = self.scripted.lock().unwrap().pop_front();
        match scripted {
            Some(Some(m)) => Ok(m),
            Some(None) => Err(unavailable(link, "scripted failure")),
            None => (*self.fallback.lock().unwrap()).ok_or_else(|| unavailable(link, "no result")),
        }
    }
}
