use axum::{extract::State, http::StatusCode, Json};
use tracing::error;

use crate::models::{BoardSnapshotResponse, ErrorResponse};
use crate::server::AppState;

/// Snapshot of the board as this node currently sees it
pub async fn board_snapshot(
    State(app_state): State<AppState>,
) -> Result<(StatusCode, Json<BoardSnapshotResponse>), (StatusCode, Json<ErrorResponse>)> {
    let snapshot = match app_state.hub.snapshot().await {
        Ok(snapshot) => snapshot,
        Err(e) => {
            error!("Failed to read board snapshot: {}", e);
            let status = StatusCode::SERVICE_UNAVAILABLE;
            return Err((status, Json(ErrorResponse::new(status, e.to_string()))));
        }
    };

    Ok((
        StatusCode::OK,
        Json(BoardSnapshotResponse {
            board: snapshot.board,
            version: snapshot.version,
            strokes: snapshot.strokes,
        }),
    ))
}
