//! Measurement providers
//!
//! Speed tests and pings are collaborators behind async traits. The
//! default implementations run on the gateway over the remote command
//! channel, so measurements leave through the link being shaped.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

use crate::actuator::{validate_host, RemoteExecutor};
use crate::error::{Result, SqmError};
use crate::models::{PingMeasurement, SpeedMeasurement};
use crate::registry::WanLink;

#[async_trait]
pub trait SpeedTestProvider: Send + Sync {
    async fn run_speed_test(&self, link: &WanLink) -> Result<SpeedMeasurement>;
}

#[async_trait]
pub trait PingProvider: Send + Sync {
    async fn ping(&self, link: &WanLink) -> Result<PingMeasurement>;
}

fn unavailable(link: &WanLink, reason: impl Into<String>) -> SqmError {
    SqmError::MeasurementUnavailable {
        link_id: link.id.clone(),
        reason: reason.into(),
    }
}

#[derive(Debug, Deserialize)]
struct SpeedTestReport {
    download_mbps: f64,
    upload_mbps: f64,
    #[serde(default)]
    latency_ms: Option<f64>,
}

/// Parse the last JSON object line of a speed-test command's output
pub fn parse_speedtest_json(output: &str) -> std::result::Result<SpeedMeasurement, String> {
    let line = output
        .lines()
        .map(str::trim)
        .filter(|l| l.starts_with('{'))
        .last()
        .ok_or_else(|| "no JSON object in speed test output".to_string())?;

    let report: SpeedTestReport =
        serde_json::from_str(line).map_err(|e| format!("malformed speed test result: {}", e))?;

    for (name, value) in [("download", report.download_mbps), ("upload", report.upload_mbps)] {
        if !value.is_finite() || value <= 0.0 {
            return Err(format!("{} rate {} is not a positive number", name, value));
        }
    }

    Ok(SpeedMeasurement {
        download_mbps: report.download_mbps,
        upload_mbps: report.upload_mbps,
        latency_ms: report.latency_ms.filter(|l| l.is_finite() && *l >= 0.0),
    })
}

/// Parse the iputils (`rtt min/avg/max/mdev`) or busybox
/// (`round-trip min/avg/max`) summary line
pub fn parse_ping_summary(output: &str) -> Option<PingMeasurement> {
    let line = output.lines().find(|l| l.contains("min/avg/max"))?;
    let (_, values) = line.split_once('=')?;
    let values = values.trim().trim_end_matches("ms").trim();

    let numbers: Vec<f64> = values
        .split('/')
        .map(|v| v.trim().parse::<f64>())
        .collect::<std::result::Result<_, _>>()
        .ok()?;

    let (min, avg, max) = match numbers.as_slice() {
        [min, avg, max, ..] => (*min, *avg, *max),
        _ => return None,
    };
    let jitter_ms = numbers.get(3).copied().unwrap_or(max - min);

    Some(PingMeasurement {
        latency_ms: avg,
        jitter_ms,
    })
}

/// Runs a configured speed-test command on the gateway. `{{interface}}`
/// in the command is replaced with the link's validated interface.
pub struct RemoteSpeedTest {
    executor: Arc<dyn RemoteExecutor>,
    command: String,
    timeout: Duration,
}

impl RemoteSpeedTest {
    pub fn new(executor: Arc<dyn RemoteExecutor>, command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            executor,
            command: command.into(),
            timeout,
        }
    }
}

#[async_trait]
impl SpeedTestProvider for RemoteSpeedTest {
    async fn run_speed_test(&self, link: &WanLink) -> Result<SpeedMeasurement> {
        crate::actuator::validate_interface_name(&link.interface)?;
        let command = self.command.replace("{{interface}}", &link.interface);

        let output = self
            .executor
            .execute(&link.gateway_host, &command, self.timeout)
            .await
            .map_err(|e| unavailable(link, e.to_string()))?;
        if !output.success() {
            return Err(unavailable(
                link,
                format!("speed test exited with {}: {}", output.exit_code, output.stderr.trim()),
            ));
        }
        parse_speedtest_json(&output.stdout).map_err(|reason| unavailable(link, reason))
    }
}

pub struct RemotePing {
    executor: Arc<dyn RemoteExecutor>,
    target: String,
    count: u32,
    timeout: Duration,
}

impl RemotePing {
    pub fn new(
        executor: Arc<dyn RemoteExecutor>,
        target: impl Into<String>,
        count: u32,
        timeout: Duration,
    ) -> Result<Self> {
        let target = target.into();
        validate_host(&target).map_err(|e| e.into_sqm(&target))?;
        Ok(Self {
            executor,
            target,
            count: count.max(1),
            timeout,
        })
    }

    fn command(&self, interface: &str) -> String {
        format!("ping -c {} -I {} {}", self.count, interface, self.target)
    }
}

#[async_trait]
impl PingProvider for RemotePing {
    async fn ping(&self, link: &WanLink) -> Result<PingMeasurement> {
        crate::actuator::validate_interface_name(&link.interface)?;
        let output = self
            .executor
            .execute(&link.gateway_host, &self.command(&link.interface), self.timeout)
            .await
            .map_err(|e| unavailable(link, e.to_string()))?;

        // ping exits non-zero on partial loss but still prints a summary
        parse_ping_summary(&output.stdout).ok_or_else(|| {
            unavailable(
                link,
                format!("no ping summary (exit {}): {}", output.exit_code, output.stderr.trim()),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{docsis_link, MockExecutor};

    const IPUTILS: &str = "PING 1.1.1.1 (1.1.1.1) from 10.0.0.2 eth0: 56(84) bytes of data.\n\
64 bytes from 1.1.1.1: icmp_seq=1 ttl=58 time=14.2 ms\n\
\n\
--- 1.1.1.1 ping statistics ---\n\
5 packets transmitted, 5 received, 0% packet loss, time 4006ms\n\
rtt min/avg/max/mdev = 13.912/15.204/17.880/1.402 ms\n";

    const BUSYBOX: &str = "--- 1.1.1.1 ping statistics ---\n\
5 packets transmitted, 5 packets received, 0% packet loss\n\
round-trip min/avg/max = 12.5/14.0/18.5 ms\n";

    #[test]
    fn test_parse_iputils_summary() {
        let ping = parse_ping_summary(IPUTILS).unwrap();
        assert_eq!(ping.latency_ms, 15.204);
        assert_eq!(ping.jitter_ms, 1.402);
    }

    #[test]
    fn test_parse_busybox_summary() {
        let ping = parse_ping_summary(BUSYBOX).unwrap();
        assert_eq!(ping.latency_ms, 14.0);
        assert_eq!(ping.jitter_ms, 6.0);
    }

    #[test]
    fn test_parse_ping_without_summary() {
        assert!(parse_ping_summary("100% packet loss").is_none());
        assert!(parse_ping_summary("rtt min/avg/max/mdev = a/b/c/d ms").is_none());
    }

    #[test]
    fn test_parse_speedtest_json() {
        let output = "progress 50%\n{\"download_mbps\": 300.5, \"upload_mbps\": 20.1, \"latency_ms\": 12.0}\n";
        let m = parse_speedtest_json(output).unwrap();
        assert_eq!(m.download_mbps, 300.5);
        assert_eq!(m.upload_mbps, 20.1);
        assert_eq!(m.latency_ms, Some(12.0));

        assert!(parse_speedtest_json("{\"download_mbps\": 0, \"upload_mbps\": 20}").is_err());
        assert!(parse_speedtest_json("no json here").is_err());
    }

    #[tokio::test]
    async fn test_remote_ping_uses_interface() {
        let executor = Arc::new(MockExecutor::new());
        executor.respond("ping ", IPUTILS);
        let pinger = RemotePing::new(executor.clone(), "1.1.1.1", 5, Duration::from_secs(10)).unwrap();

        let result = pinger.ping(&docsis_link("wan1")).await.unwrap();
        assert_eq!(result.latency_ms, 15.204);
        assert_eq!(
            executor.commands(),
            vec![("gw-wan1".to_string(), "ping -c 5 -I eth-wan1 1.1.1.1".to_string())]
        );
    }

    #[tokio::test]
    async fn test_remote_speed_test_unreachable_is_unavailable() {
        let executor = Arc::new(MockExecutor::new());
        executor.set_unreachable("gw-wan1", true);
        let provider = RemoteSpeedTest::new(executor, "speedtest --json", Duration::from_secs(60));

        let err = provider.run_speed_test(&docsis_link("wan1")).await.unwrap_err();
        assert!(matches!(err, SqmError::MeasurementUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_remote_speed_test_substitutes_interface() {
        let executor = Arc::new(MockExecutor::new());
        executor.respond(
            "sqm-speedtest",
            "{\"download_mbps\": 280.0, \"upload_mbps\": 19.0}",
        );
        let provider = RemoteSpeedTest::new(
            executor.clone(),
            "sqm-speedtest --bind {{interface}}",
            Duration::from_secs(60),
        );

        let m = provider.run_speed_test(&docsis_link("wan1")).await.unwrap();
        assert_eq!(m.rates().down_mbps, 280.0);
        assert_eq!(executor.commands()[0].1, "sqm-speedtest --bind eth-wan1");
    }

    #[test]
    fn test_ping_target_validated() {
        let executor = Arc::new(MockExecutor::new());
        assert!(RemotePing::new(executor, "1.1.1.1; reboot", 3, Duration::from_secs(5)).is_err());
    }
}
