use axum::{routing::get, Router};

use crate::handlers::{board_snapshot, diagnostics, health_check, ready_check};
use crate::server::AppState;

/// Create API routes
pub fn create_api_routes() -> Router<AppState> {
    Router::<AppState>::new()
        .route("/health", get(health_check))
        .route("/ready", get(ready_check))
        .route("/v1/board", get(board_snapshot))
        .route("/v1/diagnostics", get(diagnostics))
}
