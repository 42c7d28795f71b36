use axum::{extract::State, http::StatusCode, Json};
use std::sync::{Mutex, OnceLock};
use sysinfo::System;
use tracing::{error, info};

use crate::models::{DiagnosticsResponse, ErrorResponse};
use crate::server::AppState;

static SYSTEM_MONITOR: OnceLock<Mutex<System>> = OnceLock::new();

/// Node diagnostics
pub async fn diagnostics(
    State(app_state): State<AppState>,
) -> Result<(StatusCode, Json<DiagnosticsResponse>), (StatusCode, Json<ErrorResponse>)> {
    let stats = match app_state.hub.stats().await {
        Ok(stats) => stats,
        Err(e) => {
            error!("Failed to collect hub stats: {}", e);
            let status = StatusCode::SERVICE_UNAVAILABLE;
            return Err((status, Json(ErrorResponse::new(status, e.to_string()))));
        }
    };
    let relay = app_state.relay_stats.snapshot();

    // System stats
    let (cpu_usage, memory_alloc, memory_free, memory_total) = {
        let sys_lock = SYSTEM_MONITOR.get_or_init(|| Mutex::new(System::new_all()));
        match sys_lock.lock() {
            Ok(mut sys) => {
                sys.refresh_cpu();
                sys.refresh_memory();
                (
                    sys.global_cpu_info().cpu_usage(),
                    sys.used_memory(),
                    sys.free_memory(),
                    sys.total_memory(),
                )
            }
            Err(_) => (0.0, 0, 0, 0),
        }
    };

    info!(
        "Diagnostics: CPU: {:.2}%, Mem: {}/{} MB (Free: {} MB), Conn: {}, Strokes: {}",
        cpu_usage,
        memory_alloc / 1024 / 1024,
        memory_total / 1024 / 1024,
        memory_free / 1024 / 1024,
        stats.connections,
        stats.document.visible
    );

    Ok((
        StatusCode::OK,
        Json(DiagnosticsResponse {
            node_id: app_state.node_id,
            board: app_state.config.board_name.clone(),
            broker: app_state.broker_name.to_string(),
            n_conn: stats.connections as u32,
            n_registered: stats.registered as u32,
            doc_version: stats.version,
            n_strokes: stats.document.visible as u32,
            n_tombstones: stats.document.tombstones as u32,
            n_pending: stats.document.pending as u32,
            relay_published: relay.published,
            relay_publish_failures: relay.publish_failures,
            relay_dropped: relay.dropped,
            relay_received: relay.received,
            relay_echoes: relay.echoes,
            relay_malformed: relay.malformed,
            relay_foreign: relay.foreign,
            cpu_usage,
            memory_alloc,
            memory_total,
            memory_free,
        }),
    ))
}
