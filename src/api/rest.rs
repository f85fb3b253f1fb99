//! REST API router and configuration.

use std::sync::Arc;

use axum::{
    http::{header, Method},
    routing::get,
    routing::post,
    Router,
};
use tower_http::cors::{Any, CorsLayer};

use crate::api::handlers::{
    chat_handler, delete_session_handler, get_session_handler, health_handler, metrics_handler,
    ApiState,
};
use crate::orchestrator::Orchestrator;
use crate::services::QueryService;

/// REST API configuration.
#[derive(Debug, Clone)]
pub struct RestApiConfig {
    /// Enable CORS.
    pub enable_cors: bool,
    /// Allowed origins for CORS.
    pub cors_origins: Vec<String>,
    /// API prefix (e.g., "/api/v1").
    pub prefix: String,
}

impl Default for RestApiConfig {
    fn default() -> Self {
        Self {
            enable_cors: true,
            cors_origins: vec!["*".to_string()],
            prefix: "/api/v1".to_string(),
        }
    }
}

/// Create the REST API router.
///
/// Endpoints:
/// - POST   /api/v1/chat          - Run one conversation turn
/// - GET    /api/v1/health        - Health report
/// - GET    /api/v1/sessions/:id  - Inspect a session
/// - DELETE /api/v1/sessions/:id  - End a session
/// - GET    /metrics              - Prometheus text exposition
pub fn create_rest_router(
    orchestrator: Arc<Orchestrator>,
    query: Arc<dyn QueryService>,
    config: &RestApiConfig,
) -> Router {
    let state = Arc::new(ApiState::new(orchestrator, query));

    let api_routes = Router::new()
        .route("/chat", post(chat_handler))
        .route("/health", get(health_handler))
        .route(
            "/sessions/:id",
            get(get_session_handler).delete(delete_session_handler),
        )
        .with_state(state);

    // Build the full router with prefix; metrics stays unprefixed for
    // scrape configs.
    let router = Router::new()
        .nest(&config.prefix, api_routes)
        .route("/metrics", get(metrics_handler));

    // Add CORS if enabled
    if config.enable_cors {
        let cors = CorsLayer::new()
            .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
            .allow_origin(Any);

        router.layer(cors)
    } else {
        router
    }
}

/// Create a combined router with both REST API and additional routes.
pub fn create_combined_router(
    orchestrator: Arc<Orchestrator>,
    query: Arc<dyn QueryService>,
    config: &RestApiConfig,
) -> Router {
    let rest_router = create_rest_router(orchestrator, query, config);

    // Add API info route
    let info_route = Router::new().route("/api", get(api_info_handler));

    rest_router.merge(info_route)
}

/// API info handler.
async fn api_info_handler() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "name": "Caliper REST API",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Conversational analytics over press-shop production data",
        "endpoints": {
            "chat": {
                "method": "POST",
                "path": "/api/v1/chat",
                "description": "Run one conversation turn",
                "body": {
                    "message": "User message (required)",
                    "session_id": "Session to continue (optional)"
                }
            },
            "health": {
                "method": "GET",
                "path": "/api/v1/health",
                "description": "Health report with dependency checks"
            },
            "get_session": {
                "method": "GET",
                "path": "/api/v1/sessions/:id",
                "description": "Inspect a session"
            },
            "delete_session": {
                "method": "DELETE",
                "path": "/api/v1/sessions/:id",
                "description": "End a session"
            },
            "metrics": {
                "method": "GET",
                "path": "/metrics",
                "description": "Prometheus metrics"
            }
        }
    }))
}
