use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::store::Stroke;

/// Visible strokes of the board held by this node
#[derive(Serialize, Deserialize, ToSchema)]
pub struct BoardSnapshotResponse {
    pub board: String,
    /// Local change counter; not comparable across nodes
    pub version: u64,
    pub strokes: Vec<Stroke>,
}
