use axum::{extract::State, http::StatusCode, Json};
use tracing::{debug, warn};

use crate::models::{ErrorResponse, HealthResponse};
use crate::server::AppState;

/// Health check endpoint
pub async fn health_check() -> Json<HealthResponse> {
    debug!("Health check requested");
    Json(HealthResponse {
        status: "ok".to_string(),
        message: "Server is running".to_string(),
        node_id: None,
        connections: None,
    })
}

/// Readiness check endpoint
///
/// Ready once the hub answers. The broker subscription is established before
/// the listener is bound, so a running hub implies a working relay.
pub async fn ready_check(
    State(app_state): State<AppState>,
) -> Result<Json<HealthResponse>, (StatusCode, Json<ErrorResponse>)> {
    debug!("Readiness check requested");
    match app_state.hub.stats().await {
        Ok(stats) => Ok(Json(HealthResponse {
            status: "ok".to_string(),
            message: "Service is ready".to_string(),
            node_id: Some(app_state.node_id),
            connections: Some(stats.connections),
        })),
        Err(e) => {
            warn!("Readiness check failed: {}", e);
            let status = StatusCode::SERVICE_UNAVAILABLE;
            Err((status, Json(ErrorResponse::new(status, e.to_string()))))
        }
    }
}
