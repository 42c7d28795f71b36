use tracing::{error, info};

use crate::db::dbcanvas::PersistJob;
use crate::models::messages::ServerMessage;
use crate::relay::{ClearAllData, ClearUserData, RelayEvent};
use crate::ws::bootstrap::BoardFrameKind;
use crate::ws::{ConnectionId, Hub};

/// Handle clear-all: tombstone every visible stroke on this node.
///
/// Only the concrete id list leaves the node.
pub fn handle_clear_all_message(hub: &mut Hub, connection_id: ConnectionId) {
    let Some(user_id) = hub.require_user(connection_id) else {
        return;
    };

    let stroke_ids = hub.document.clear_all();
    info!("{} cleared the board ({} strokes)", user_id, stroke_ids.len());

    match ServerMessage::ClearAll.to_frame() {
        Ok(frame) => hub.broadcast(frame, None),
        Err(e) => error!("Failed to encode clear-all: {}", e),
    }

    if stroke_ids.is_empty() {
        return;
    }
    hub.persist(PersistJob::DeleteStrokes(stroke_ids.clone()));
    hub.relay.publish(RelayEvent::ClearAll(ClearAllData { stroke_ids }));
}

/// Handle clear-mine: tombstone the strokes this user owns in the local view.
pub fn handle_clear_mine_message(hub: &mut Hub, connection_id: ConnectionId) {
    let Some(user_id) = hub.require_user(connection_id) else {
        return;
    };

    let stroke_ids = hub.document.delete_by_user(&user_id);
    info!("{} cleared their strokes ({} strokes)", user_id, stroke_ids.len());

    match hub.snapshots.board_frame(&hub.document, BoardFrameKind::ResetBoard) {
        Ok(frame) => hub.broadcast(frame, None),
        Err(e) => error!("Failed to encode reset-board: {}", e),
    }

    if stroke_ids.is_empty() {
        return;
    }
    hub.persist(PersistJob::DeleteStrokes(stroke_ids.clone()));
    hub.relay.publish(RelayEvent::ClearUser(ClearUserData { user_id, stroke_ids }));
}
