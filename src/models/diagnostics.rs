use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Response for diagnostics information
#[derive(Serialize, Deserialize, ToSchema)]
pub struct DiagnosticsResponse {
    pub node_id: Uuid,
    pub board: String,
    pub broker: String,
    pub n_conn: u32,
    pub n_registered: u32,
    pub doc_version: u64,
    pub n_strokes: u32,
    pub n_tombstones: u32,
    pub n_pending: u32,
    pub relay_published: u64,
    pub relay_publish_failures: u64,
    pub relay_dropped: u64,
    pub relay_received: u64,
    pub relay_echoes: u64,
    pub relay_malformed: u64,
    pub relay_foreign: u64,
    pub cpu_usage: f32,
    pub memory_alloc: u64,
    pub memory_total: u64,
    pub memory_free: u64,
}
