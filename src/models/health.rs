use serde::{Deserialize, Serialize};
use serde_with::skip_serializing_none;
use utoipa::ToSchema;
use uuid::Uuid;

/// API response for health and readiness checks
#[skip_serializing_none]
#[derive(Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub message: String,
    /// Set by the readiness check
    pub node_id: Option<Uuid>,
    pub connections: Option<usize>,
}
