//! REST API request handlers.

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{CaliperError, QueryServiceError, SessionError};
use crate::messages::{ChartSpec, SessionId};
use crate::metrics::{get_metrics, HealthCheck, HealthState, HealthStatus};
use crate::orchestrator::Orchestrator;
use crate::services::QueryService;

/// Application state shared across handlers.
pub struct ApiState {
    /// Turn pipeline entry point.
    pub orchestrator: Arc<Orchestrator>,
    /// Query service handle, used only for the health probe.
    pub query: Arc<dyn QueryService>,
}

impl ApiState {
    /// Create new API state.
    pub fn new(orchestrator: Arc<Orchestrator>, query: Arc<dyn QueryService>) -> Self {
        Self {
            orchestrator,
            query,
        }
    }
}

// ============================================================================
// Request/Response Types
// ============================================================================

/// Chat turn request.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatRequest {
    /// User message text.
    pub message: String,
    /// Session to continue; omitted on the first turn.
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Chat turn response.
#[derive(Debug, Clone, Serialize)]
pub struct ChatResponse {
    pub session_id: String,
    pub request_id: String,
    pub narrative: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chart: Option<ChartSpec>,
    pub follow_ups: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub degraded_branches: Vec<String>,
    pub clarification: bool,
}

/// Session removal response.
#[derive(Debug, Clone, Serialize)]
pub struct RemoveSessionResponse {
    pub success: bool,
    pub message: String,
}

/// Error response.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

// ============================================================================
// Handler Functions
// ============================================================================

/// POST /api/v1/chat - Run one conversation turn.
pub async fn chat_handler(
    State(state): State<Arc<ApiState>>,
    Json(request): Json<ChatRequest>,
) -> impl IntoResponse {
    let session_id = match request.session_id.as_deref() {
        Some(raw) => match SessionId::parse(raw) {
            Some(id) => Some(id),
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(ErrorResponse {
                        error: format!("Invalid session id: {raw}"),
                        code: "invalid_session_id".to_string(),
                    }),
                )
                    .into_response();
            }
        },
        None => None,
    };

    match state
        .orchestrator
        .handle_turn(session_id, &request.message)
        .await
    {
        Ok(output) => (
            StatusCode::OK,
            Json(ChatResponse {
                session_id: output.session_id.to_string(),
                request_id: output.request_id.to_string(),
                narrative: output.response.narrative,
                chart: output.response.chart,
                follow_ups: output.response.follow_ups,
                degraded_branches: output.response.degraded_branches,
                clarification: output.response.clarification,
            }),
        )
            .into_response(),
        Err(err) => error_response(err).into_response(),
    }
}

/// GET /api/v1/sessions/:id - Inspect a session.
pub async fn get_session_handler(
    State(state): State<Arc<ApiState>>,
    Path(raw_id): Path<String>,
) -> impl IntoResponse {
    let Some(session_id) = SessionId::parse(&raw_id) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: format!("Invalid session id: {raw_id}"),
                code: "invalid_session_id".to_string(),
            }),
        )
            .into_response();
    };

    match state.orchestrator.store().info(session_id) {
        Some(info) => (StatusCode::OK, Json(info)).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("Session not found: {raw_id}"),
                code: "not_found".to_string(),
            }),
        )
            .into_response(),
    }
}

/// DELETE /api/v1/sessions/:id - End a session.
pub async fn delete_session_handler(
    State(state): State<Arc<ApiState>>,
    Path(raw_id): Path<String>,
) -> impl IntoResponse {
    let Some(session_id) = SessionId::parse(&raw_id) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: format!("Invalid session id: {raw_id}"),
                code: "invalid_session_id".to_string(),
            }),
        )
            .into_response();
    };

    if state.orchestrator.store().remove(session_id) {
        (
            StatusCode::OK,
            Json(RemoveSessionResponse {
                success: true,
                message: format!("Session {raw_id} removed"),
            }),
        )
            .into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: format!("Session not found: {raw_id}"),
                code: "not_found".to_string(),
            }),
        )
            .into_response()
    }
}

/// GET /api/v1/health - Health report.
///
/// A failing data source degrades the report rather than failing it;
/// the engine keeps answering with degraded branches while the source
/// is down.
pub async fn health_handler(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let metrics = get_metrics();
    metrics.update_uptime();

    let mut checks = Vec::new();

    let probe_start = std::time::Instant::now();
    if state.query.healthy().await {
        checks.push(HealthCheck::healthy_with_duration(
            "query_service",
            probe_start.elapsed().as_millis() as u64,
        ));
    } else {
        checks.push(HealthCheck::degraded(
            "query_service",
            "metadata probe failed",
        ));
    }

    let sessions = state.orchestrator.store().len();
    let in_flight = state.orchestrator.in_flight();
    checks.push(HealthCheck::healthy(format!("sessions ({sessions} live)")));
    checks.push(HealthCheck::healthy(format!(
        "pipeline ({in_flight} turns in flight)"
    )));

    let status = checks
        .iter()
        .map(|c| c.status)
        .max_by_key(|s| match s {
            HealthState::Healthy => 0,
            HealthState::Degraded => 1,
            HealthState::Unhealthy => 2,
        })
        .unwrap_or(HealthState::Healthy);

    let health = HealthStatus {
        status,
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: metrics.uptime_seconds.get() as u64,
        checks,
    };

    let code =
        StatusCode::from_u16(health.status.to_status_code()).unwrap_or(StatusCode::OK);
    (code, Json(health)).into_response()
}

/// GET /metrics - Prometheus text exposition.
pub async fn metrics_handler() -> impl IntoResponse {
    let body = get_metrics().export_prometheus();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body)
}

fn error_response(err: CaliperError) -> (StatusCode, Json<ErrorResponse>) {
    let (status, code) = match &err {
        CaliperError::Session(SessionError::EmptyMessage)
        | CaliperError::Session(SessionError::MessageTooLong { .. }) => {
            (StatusCode::BAD_REQUEST, "invalid_message")
        }
        CaliperError::Session(SessionError::NotFound(_)) => {
            (StatusCode::NOT_FOUND, "session_not_found")
        }
        CaliperError::PipelineDeadline(_) => (StatusCode::SERVICE_UNAVAILABLE, "pipeline_timeout"),
        CaliperError::QueryService(QueryServiceError::SourceUnavailable(_)) => {
            (StatusCode::SERVICE_UNAVAILABLE, "query_service_unavailable")
        }
        _ => {
            // Internal detail stays in the logs.
            tracing::error!(error = %err, "turn failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "internal error".to_string(),
                    code: "internal".to_string(),
                }),
            );
        }
    };

    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
            code: code.to_string(),
        }),
    )
}
