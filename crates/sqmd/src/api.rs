//! HTTP API: live status, link operations, health checks and Prometheus
//! metrics

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::{Deserialize, Serialize};
use sqm_core::{
    alerts::Alert,
    baseline::HourlyBaseline,
    engine::DeploymentResult,
    health::{ComponentStatus, HealthRegistry},
    models::{Direction, LinkMode, ShapingState, WanLinkId},
    observability::SqmMetrics,
    registry::WanLink,
    sampler::Admission,
    status::StatusReport,
    SqmEngine, SqmError,
};
use std::sync::Arc;
use tracing::{info, warn};

const DEFAULT_ALERT_LIMIT: usize = 100;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SqmEngine>,
    pub health_registry: HealthRegistry,
    pub metrics: SqmMetrics,
}

impl AppState {
    pub fn new(engine: Arc<SqmEngine>, health_registry: HealthRegistry, metrics: SqmMetrics) -> Self {
        Self {
            engine,
            health_registry,
            metrics,
        }
    }
}

/// Error body returned by every `/api/v1` route
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub error: String,
}

pub struct ApiError(SqmError);

impl From<SqmError> for ApiError {
    fn from(e: SqmError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            SqmError::UnknownLink(_) => StatusCode::NOT_FOUND,
            SqmError::DuplicateLink(_) | SqmError::NoRateEvidence(_) | SqmError::LinkDisabled(_) => {
                StatusCode::CONFLICT
            }
            SqmError::InvalidParameter { .. } => StatusCode::BAD_REQUEST,
            SqmError::RemoteUnreachable { .. } | SqmError::DeploymentRejected { .. } => {
                StatusCode::BAD_GATEWAY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            kind: self.0.kind().to_string(),
            error: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Serialize, Deserialize)]
pub struct BaselineResponse {
    pub link_id: WanLinkId,
    pub direction: Direction,
    pub mode: LinkMode,
    pub learning_progress: f64,
    pub buckets: Vec<HourlyBaseline>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TestResponse {
    pub link_id: WanLinkId,
    pub admission: Admission,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RedeployResponse {
    pub link_id: WanLinkId,
    pub outcome: String,
    pub state: Option<ShapingState>,
}

#[derive(Debug, Deserialize)]
struct BaselineQuery {
    direction: Option<Direction>,
}

#[derive(Debug, Deserialize)]
struct AlertQuery {
    limit: Option<usize>,
}

/// Health check response - returns 200 if healthy, 503 if degraded/unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still shaping
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            Vec::new(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

async fn status(State(state): State<Arc<AppState>>) -> Json<StatusReport> {
    Json(state.engine.status())
}

async fn links(State(state): State<Arc<AppState>>) -> Json<Vec<WanLink>> {
    Json(state.engine.links())
}

async fn baseline(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(query): Query<BaselineQuery>,
) -> ApiResult<Json<BaselineResponse>> {
    let id = WanLinkId::new(id);
    let direction = query.direction.unwrap_or(Direction::Download);
    let buckets = state.engine.baseline(&id, direction)?;
    let baselines = state.engine.baselines();
    Ok(Json(BaselineResponse {
        mode: baselines.mode(&id),
        learning_progress: baselines.learning_progress(&id),
        link_id: id,
        direction,
        buckets,
    }))
}

async fn request_test(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<TestResponse>)> {
    let id = WanLinkId::new(id);
    let admission = state.engine.request_test(&id)?;
    info!(link_id = %id, admission = ?admission, "Manual speed test requested");

    let status = match admission {
        Admission::Started => StatusCode::ACCEPTED,
        Admission::Merged => StatusCode::OK,
    };
    Ok((status, Json(TestResponse { link_id: id, admission })))
}

async fn redeploy(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<RedeployResponse>> {
    let id = WanLinkId::new(id);
    let result = state.engine.redeploy(&id).await?;
    let (outcome, shaping) = match result {
        DeploymentResult::Applied(s) => ("applied", Some(s)),
        DeploymentResult::Unchanged => ("unchanged", None),
        DeploymentResult::Failed { kind, .. } => (kind, None),
    };
    Ok(Json(RedeployResponse {
        link_id: id,
        outcome: outcome.to_string(),
        state: shaping,
    }))
}

async fn alerts(State(state): State<Arc<AppState>>, Query(query): Query<AlertQuery>) -> Json<Vec<Alert>> {
    Json(state.engine.alerts(query.limit.unwrap_or(DEFAULT_ALERT_LIMIT)))
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/api/v1/status", get(status))
        .route("/api/v1/links", get(links))
        .route("/api/v1/links/:id/baseline", get(baseline))
        .route("/api/v1/links/:id/test", post(request_test))
        .route("/api/v1/links/:id/redeploy", post(redeploy))
        .route("/api/v1/alerts", get(alerts))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
