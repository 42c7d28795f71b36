use utoipa::OpenApi;
use crate::models::*;
use crate::store::{Point, Stroke};

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 200, description = "Service is healthy", body = HealthResponse)
    )
)]
#[allow(dead_code)]
pub async fn health_check_doc() {}

/// Readiness check endpoint
#[utoipa::path(
    get,
    path = "/api/ready",
    responses(
        (status = 200, description = "Service is ready", body = HealthResponse),
        (status = 503, description = "Hub is not running", body = ErrorResponse)
    )
)]
#[allow(dead_code)]
pub async fn ready_check_doc() {}

/// Board snapshot as seen by this node
#[utoipa::path(
    get,
    path = "/api/v1/board",
    responses(
        (status = 200, description = "Visible strokes", body = BoardSnapshotResponse),
        (status = 503, description = "Hub is not running", body = ErrorResponse)
    )
)]
#[allow(dead_code)]
pub async fn board_snapshot_doc() {}

/// Node diagnostics
#[utoipa::path(
    get,
    path = "/api/v1/diagnostics",
    responses(
        (status = 200, description = "Connection, document and relay counters", body = DiagnosticsResponse),
        (status = 503, description = "Hub is not running", body = ErrorResponse)
    )
)]
#[allow(dead_code)]
pub async fn diagnostics_doc() {}

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check_doc,
        ready_check_doc,
        board_snapshot_doc,
        diagnostics_doc,
    ),
    components(
        schemas(HealthResponse, ErrorResponse, BoardSnapshotResponse, DiagnosticsResponse, Stroke, Point)
    ),
    tags(
        (name = "api", description = "API endpoints")
    )
)]
pub struct ApiDoc;
