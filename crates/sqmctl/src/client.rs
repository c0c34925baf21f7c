//! API client for communicating with sqmd

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reqwest::{Client, Response};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

/// API client for the sqmd HTTP API
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid API URL")?;

        Ok(Self { client, base_url })
    }

    /// Make a GET request
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to send request")?;

        Self::decode(response).await
    }

    /// Make a POST request without a body
    pub async fn post<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.base_url.join(path).context("Invalid path")?;

        let response = self
            .client
            .post(url)
            .send()
            .await
            .context("Failed to send request")?;

        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            match serde_json::from_str::<ErrorResponse>(&body) {
                Ok(err) => anyhow::bail!("API error ({}): {}", status, err.error),
                Err(_) => anyhow::bail!("API error ({}): {}", status, body),
            }
        }

        response.json().await.context("Failed to parse response")
    }

    pub async fn status(&self) -> Result<StatusReport> {
        self.get("api/v1/status").await
    }

    pub async fn links(&self) -> Result<Vec<WanLink>> {
        self.get("api/v1/links").await
    }

    pub async fn baseline(&self, link_id: &str, direction: &str) -> Result<BaselineResponse> {
        self.get(&format!("api/v1/links/{}/baseline?direction={}", link_id, direction))
            .await
    }

    pub async fn alerts(&self, limit: usize) -> Result<Vec<Alert>> {
        self.get(&format!("api/v1/alerts?limit={}", limit)).await
    }

    pub async fn request_test(&self, link_id: &str) -> Result<TestResponse> {
        self.post(&format!("api/v1/links/{}/test", link_id)).await
    }

    pub async fn redeploy(&self, link_id: &str) -> Result<RedeployResponse> {
        self.post(&format!("api/v1/links/{}/redeploy", link_id)).await
    }
}

// API response types

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RatePair {
    pub down_mbps: f64,
    pub up_mbps: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeedTestObservation {
    pub measured: RatePair,
    pub adjusted: RatePair,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PingObservation {
    pub rate: Option<RatePair>,
    pub latency: f64,
    pub jitter: f64,
    pub congested: bool,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkStatus {
    pub link_id: String,
    pub enabled: bool,
    pub current_rate: Option<RatePair>,
    pub baseline_rate: Option<RatePair>,
    pub last_speedtest: Option<SpeedTestObservation>,
    pub last_ping: Option<PingObservation>,
    pub mode: String,
    pub learning_progress: f64,
    pub backoff_active: bool,
    pub last_adjustment_reason: Option<String>,
    pub last_applied_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub alerts: Vec<Alert>,
}

/// Live status keyed by interface
pub type StatusReport = BTreeMap<String, LinkStatus>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WanLink {
    pub id: String,
    pub interface: String,
    pub gateway_host: String,
    pub profile: String,
    pub nominal_down_mbps: f64,
    pub nominal_up_mbps: f64,
    pub floor_down_mbps: f64,
    pub floor_up_mbps: f64,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HourlyBaseline {
    pub day_of_week: u8,
    pub hour_of_day: u8,
    pub mean: f64,
    pub std_dev: Option<f64>,
    pub min: f64,
    pub max: f64,
    pub sample_count: u64,
    pub last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BaselineResponse {
    pub link_id: String,
    pub direction: String,
    pub mode: String,
    pub learning_progress: f64,
    pub buckets: Vec<HourlyBaseline>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: u64,
    pub link_id: String,
    pub kind: String,
    pub severity: String,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResponse {
    pub link_id: String,
    pub admission: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShapingState {
    pub applied: RatePair,
    pub last_applied_at: DateTime<Utc>,
    pub last_adjustment_reason: String,
    pub last_deployed_content_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedeployResponse {
    pub link_id: String,
    pub outcome: String,
    pub state: Option<ShapingState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_status_decodes_live_map() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/status")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"eth1": {
                    "link_id": "wan1", "enabled": true,
                    "current_rate": {"down_mbps": 276.0, "up_mbps": 18.4},
                    "baseline_rate": null,
                    "last_speedtest": {
                        "measured": {"down_mbps": 300.0, "up_mbps": 20.0},
                        "adjusted": {"down_mbps": 276.0, "up_mbps": 18.4},
                        "at": "2024-01-01T00:00:00Z"
                    },
                    "last_ping": null,
                    "mode": "learning", "learning_progress": 0.006,
                    "backoff_active": false,
                    "last_adjustment_reason": "initial_measurement",
                    "last_applied_at": "2024-01-01T00:00:05Z",
                    "alerts": []
                }}"#,
            )
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let status = client.status().await.unwrap();

        mock.assert_async().await;
        let link = &status["eth1"];
        assert_eq!(link.link_id, "wan1");
        assert_eq!(link.current_rate.unwrap().down_mbps, 276.0);
        assert_eq!(link.last_speedtest.as_ref().unwrap().measured.up_mbps, 20.0);
    }

    #[tokio::test]
    async fn test_api_error_message_surfaced() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/api/v1/links/wan9/redeploy")
            .with_status(404)
            .with_body(r#"{"kind": "unknown_link", "error": "unknown WAN link wan9"}"#)
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let err = client.redeploy("wan9").await.unwrap_err();

        let message = err.to_string();
        assert!(message.contains("404"));
        assert!(message.contains("unknown WAN link wan9"));
    }

    #[tokio::test]
    async fn test_request_test_posts() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/links/wan1/test")
            .with_status(202)
            .with_body(r#"{"link_id": "wan1", "admission": "started"}"#)
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let response = client.request_test("wan1").await.unwrap();

        mock.assert_async().await;
        assert_eq!(response.admission, "started");
    }

    #[tokio::test]
    async fn test_baseline_query_carries_direction() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/links/wan1/baseline")
            .match_query(mockito::Matcher::UrlEncoded("direction".into(), "upload".into()))
            .with_status(200)
            .with_body(
                r#"{"link_id": "wan1", "direction": "upload", "mode": "learning",
                    "learning_progress": 0.5, "buckets": []}"#,
            )
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let baseline = client.baseline("wan1", "upload").await.unwrap();

        mock.assert_async().await;
        assert_eq!(baseline.direction, "upload");
        assert!(baseline.buckets.is_empty());
    }

    #[test]
    fn test_invalid_url_rejected() {
        assert!(ApiClient::new("not a url").is_err());
    }
}
